//! Ingestion of normalized flow batches.
//!
//! Batches go to the time-series store with an append-only insert. When the
//! store cannot take a batch (unreachable, timed out, failed statement) the
//! whole batch goes to the durable [`FallbackLog`] instead. When the store
//! rejects only some rows, the rejected indices are reported and nothing is
//! retried; a batch with every row rejected is treated as a failed write.

pub mod fallback;
pub mod memory;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::config::MonitorSource;
use crate::errors::{CoreError, FallbackError, StoreError};
use crate::flow::{FlowRecord, FlowRow};

pub use fallback::{FallbackLog, LogContents};
pub use memory::MemoryStore;

/// Rows per store write when re-delivering a fallback log.
const REDELIVERY_CHUNK: usize = 1000;

/// Append-only writer for the time-series store.
#[async_trait::async_trait]
pub trait FlowStore: Send + Sync {
    /// Insert `rows` as new rows and return how many were written.
    ///
    /// Implementations never update or delete. If the store refuses some
    /// rows, every other row is still written and the error is
    /// [`StoreError::PartialBatchRejection`] with indices into `rows`.
    async fn append(&self, rows: &[FlowRow]) -> Result<usize, StoreError>;

    /// Label for logs.
    fn describe(&self) -> String;
}

/// What happened to one ingested batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Empty,
    Stored {
        rows: usize,
    },
    PartiallyRejected {
        accepted: usize,
        rejected: Vec<usize>,
    },
    /// The store write failed; the batch is in the fallback log.
    FellBack {
        rows: usize,
    },
}

/// Result of [`IngestionSink::redeliver`].
#[derive(Debug, Default)]
pub struct RedeliveryReport {
    pub delivered: usize,
    /// Indices (into the claimed log's decodable rows) the store refused.
    pub rejected: Vec<usize>,
    pub corrupt_lines: Vec<usize>,
    /// Where the delivered log was archived, if there was one.
    pub archived: Option<PathBuf>,
}

pub struct IngestionSink {
    store: Arc<dyn FlowStore>,
    fallback: FallbackLog,
    write_timeout: Duration,
}

impl IngestionSink {
    pub fn new(store: Arc<dyn FlowStore>, fallback: FallbackLog, write_timeout: Duration) -> Self {
        Self {
            store,
            fallback,
            write_timeout,
        }
    }

    pub fn fallback(&self) -> &FallbackLog {
        &self.fallback
    }

    /// Write one monitor's batch.
    ///
    /// A batch the store refuses outright (failed write, timeout, or every
    /// row rejected) goes to the fallback log. Only a failure to write the
    /// fallback log is an error; that is the one path where rows are lost.
    ///
    /// Delivery is at-least-once: when the write timeout fires after the
    /// store has already committed, the batch is in both the store and the
    /// fallback log, and a later [`redeliver`](Self::redeliver) inserts it
    /// again.
    pub async fn ingest(
        &self,
        monitor: &MonitorSource,
        records: Vec<FlowRecord>,
    ) -> Result<IngestOutcome, FallbackError> {
        if records.is_empty() {
            return Ok(IngestOutcome::Empty);
        }
        let rows: Vec<FlowRow> = records.into_iter().map(FlowRow::from).collect();

        match self.write(&rows).await {
            Ok(written) => Ok(IngestOutcome::Stored { rows: written }),
            Err(StoreError::PartialBatchRejection { accepted, rejected }) if accepted > 0 => {
                warn!(
                    monitor = %monitor,
                    accepted,
                    rejected = ?rejected,
                    "Store rejected part of the batch"
                );
                Ok(IngestOutcome::PartiallyRejected { accepted, rejected })
            }
            Err(e) => {
                warn!(
                    monitor = %monitor,
                    rows = rows.len(),
                    "{e}; writing batch to fallback log {}",
                    self.fallback.path().display()
                );
                if let Err(fe) = self.fallback.append(&rows).await {
                    error!(
                        monitor = %monitor,
                        rows = rows.len(),
                        "Fallback log write failed, batch lost: {fe}"
                    );
                    return Err(fe);
                }
                Ok(IngestOutcome::FellBack { rows: rows.len() })
            }
        }
    }

    /// Re-deliver the fallback log to the store.
    ///
    /// The live log is first moved aside so concurrent collectors keep
    /// appending to a fresh file. On success the claimed file is archived as
    /// `<log>.delivered-<timestamp>`. If a store write fails part-way, the
    /// undelivered rows are appended back to the live log and the claimed
    /// file is removed, so no row is delivered twice or lost.
    pub async fn redeliver(&self) -> Result<RedeliveryReport, CoreError> {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S").to_string();
        let Some(claimed) = self.fallback.claim(&format!("redeliver-{stamp}")).await? else {
            info!(
                "No fallback log at {}, nothing to re-deliver",
                self.fallback.path().display()
            );
            return Ok(RedeliveryReport::default());
        };

        let contents = FallbackLog::read_rows(&claimed).await?;
        let mut report = RedeliveryReport {
            corrupt_lines: contents.corrupt_lines,
            ..Default::default()
        };

        for (chunk_idx, chunk) in contents.rows.chunks(REDELIVERY_CHUNK).enumerate() {
            let offset = chunk_idx * REDELIVERY_CHUNK;
            match self.write(chunk).await {
                Ok(written) => report.delivered += written,
                Err(StoreError::PartialBatchRejection { accepted, rejected }) => {
                    report.delivered += accepted;
                    report.rejected.extend(rejected.into_iter().map(|i| i + offset));
                }
                Err(e) => {
                    let remaining = &contents.rows[offset..];
                    warn!(
                        delivered = report.delivered,
                        requeued = remaining.len(),
                        "Re-delivery interrupted: {e}"
                    );
                    self.fallback.append(remaining).await?;
                    tokio::fs::remove_file(&claimed).await?;
                    return Err(e.into());
                }
            }
        }

        let archived = fallback::sibling_path(self.fallback.path(), &format!("delivered-{stamp}"));
        tokio::fs::rename(&claimed, &archived).await?;
        info!(
            delivered = report.delivered,
            rejected = report.rejected.len(),
            corrupt = report.corrupt_lines.len(),
            "Re-delivered fallback log to {}; archived as {}",
            self.store.describe(),
            archived.display()
        );
        report.archived = Some(archived);
        Ok(report)
    }

    async fn write(&self, rows: &[FlowRow]) -> Result<usize, StoreError> {
        match tokio::time::timeout(self.write_timeout, self.store.append(rows)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.write_timeout.as_millis() as u64)),
        }
    }
}
