//! The collection-and-normalization pipeline for flow monitor caches.
//!
//! Stages run leaves first: [`parser`] splits the CLI table into rows,
//! [`normalize`] renames and coerces cells, [`temporal`] resolves the
//! date-less times, [`metrics`] derives duration and throughput, and
//! [`pipeline`] chains them for one monitor's output.

pub mod metrics;
pub mod normalize;
pub mod parser;
pub mod pipeline;
pub mod temporal;
pub mod types;

pub use parser::{parse_cache, split_columns, CacheRows, RawTableRow};
pub use pipeline::{process_cache_output, FlowBatch, PipelineStats};
pub use temporal::{ReconcileClock, Timezones, Zone};
pub use types::{FlowRecord, FlowRow, Timing, FLOW_ROW_COLUMNS};
