//! Core library for the flow-cache collector.
//!
//! Pulls the flow-monitor cache off a router over SSH, turns the CLI table
//! into typed [`flow::FlowRecord`]s with reconciled timestamps and derived
//! throughput, and appends them to a time-series store with a durable local
//! fallback.

pub mod config;
pub mod device;
pub mod errors;
pub mod flow;
pub mod poll;
pub mod sink;
