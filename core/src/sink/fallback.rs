//! Durable local fallback log.
//!
//! An append-only JSON Lines file with one [`FlowRow`] per line, written
//! only when the store cannot take a batch. Nothing drains it automatically;
//! re-delivery is the explicit [`IngestionSink::redeliver`] operation.
//!
//! [`IngestionSink::redeliver`]: super::IngestionSink::redeliver

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::errors::FallbackError;
use crate::flow::FlowRow;

/// Rows read back from a fallback log.
#[derive(Debug, Default)]
pub struct LogContents {
    pub rows: Vec<FlowRow>,
    /// 1-based line numbers that could not be decoded (e.g. a torn write).
    pub corrupt_lines: Vec<usize>,
}

pub struct FallbackLog {
    path: PathBuf,
    // Serializes appends from concurrent worker slots so lines never interleave.
    write_lock: Mutex<()>,
}

impl FallbackLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `rows` and flush them to disk before returning.
    pub async fn append(&self, rows: &[FlowRow]) -> Result<(), FallbackError> {
        if rows.is_empty() {
            return Ok(());
        }

        let mut buf = Vec::with_capacity(rows.len() * 256);
        for row in rows {
            serde_json::to_writer(&mut buf, row)?;
            buf.push(b'\n');
        }

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&buf).await?;
        file.sync_data().await?;

        debug!(
            "Appended {} rows to fallback log {}",
            rows.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Atomically move the live log aside so new appends start a fresh file.
    ///
    /// Returns the claimed path, or `None` if there is no log.
    pub async fn claim(&self, suffix: &str) -> Result<Option<PathBuf>, FallbackError> {
        let _guard = self.write_lock.lock().await;
        if fs::metadata(&self.path).await.is_err() {
            return Ok(None);
        }
        let claimed = sibling_path(&self.path, suffix);
        fs::rename(&self.path, &claimed).await?;
        Ok(Some(claimed))
    }

    /// Read every row of the log at `path`, skipping blank lines.
    pub async fn read_rows(path: &Path) -> Result<LogContents, FallbackError> {
        let text = fs::read_to_string(path).await?;
        let mut contents = LogContents::default();
        for (idx, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<FlowRow>(line) {
                Ok(row) => contents.rows.push(row),
                Err(e) => {
                    warn!(
                        "Skipping corrupt line {} of {}: {}",
                        idx + 1,
                        path.display(),
                        e
                    );
                    contents.corrupt_lines.push(idx + 1);
                }
            }
        }
        Ok(contents)
    }
}

/// `flows_log.jsonl` + `delivered-20250427T101500` → `flows_log.jsonl.delivered-20250427T101500`.
pub fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};

    fn row(src: &str, bytes: Option<u64>) -> FlowRow {
        let tz = FixedOffset::east_opt(4 * 3600).unwrap();
        FlowRow {
            ipv4_src_addr: src.into(),
            ipv4_dst_addr: "10.0.0.2".into(),
            l4_src_port: Some(1234),
            l4_dst_port: Some(80),
            protocol: Some(6),
            tcp_flags: Some(24),
            in_bytes: bytes,
            in_pkts: Some(10),
            flow_duration_ms: 4000,
            bytes_per_second: bytes.map(|b| b as f64 / 4.0),
            avg_throughput_bps: bytes.map(|b| b as f64 * 2.0),
            flow_monitor: "FLOW-MONITOR".into(),
            time: tz.with_ymd_and_hms(2025, 4, 28, 0, 0, 2).unwrap(),
        }
    }

    #[tokio::test]
    async fn append_then_read_preserves_rows_and_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = FallbackLog::new(dir.path().join("nested").join("flows.jsonl"));
        let first = vec![row("10.0.0.1", Some(1500)), row("10.0.0.3", None)];
        let second = vec![row("10.0.0.5", Some(60))];
        log.append(&first).await.unwrap();
        log.append(&second).await.unwrap();

        let contents = FallbackLog::read_rows(log.path()).await.unwrap();
        assert!(contents.corrupt_lines.is_empty());
        let expected: Vec<FlowRow> = first.into_iter().chain(second).collect();
        assert_eq!(contents.rows, expected);
    }

    #[tokio::test]
    async fn one_json_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let log = FallbackLog::new(dir.path().join("flows.jsonl"));
        log.append(&[row("10.0.0.1", Some(1)), row("10.0.0.2", Some(2))])
            .await
            .unwrap();
        let text = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let value: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(value["ipv4_src_addr"], "10.0.0.1");
        assert_eq!(value["time"], "2025-04-28T00:00:02+04:00");
    }

    #[tokio::test]
    async fn empty_append_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let log = FallbackLog::new(dir.path().join("flows.jsonl"));
        log.append(&[]).await.unwrap();
        assert!(!log.path().exists());
    }

    #[tokio::test]
    async fn corrupt_lines_are_skipped_and_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flows.jsonl");
        let good = serde_json::to_string(&row("10.0.0.1", Some(5))).unwrap();
        std::fs::write(&path, format!("{good}\n\n{{\"ipv4_src_addr\": \"10.\n{good}\n")).unwrap();

        let contents = FallbackLog::read_rows(&path).await.unwrap();
        assert_eq!(contents.rows.len(), 2);
        assert_eq!(contents.corrupt_lines, vec![3]);
    }

    #[tokio::test]
    async fn claim_moves_log_aside() {
        let dir = tempfile::tempdir().unwrap();
        let log = FallbackLog::new(dir.path().join("flows.jsonl"));
        assert!(log.claim("redeliver-1").await.unwrap().is_none());

        log.append(&[row("10.0.0.1", Some(1))]).await.unwrap();
        let claimed = log.claim("redeliver-1").await.unwrap().unwrap();
        assert!(!log.path().exists());
        assert_eq!(
            claimed.file_name().unwrap().to_str().unwrap(),
            "flows.jsonl.redeliver-1"
        );
        assert_eq!(FallbackLog::read_rows(&claimed).await.unwrap().rows.len(), 1);
    }
}
