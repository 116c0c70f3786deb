//! PostgreSQL / TimescaleDB implementation of [`FlowStore`].

use std::time::Duration;

use async_trait::async_trait;
use flowtap_core::config::StoreConfig;
use flowtap_core::errors::{CoreError, StoreError};
use flowtap_core::flow::{FlowRow, FLOW_ROW_COLUMNS};
use flowtap_core::sink::FlowStore;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Connection, PgConnection, Postgres, QueryBuilder};
use tracing::{debug, info};

/// Rows per multi-row `INSERT`. 13 binds per row keeps this well under the
/// 65535 bind-parameter limit.
const INSERT_CHUNK: usize = 1000;

pub struct PgStore {
    pool: PgPool,
    table: String,
}

impl PgStore {
    /// Build a lazily-connecting pool. The database does not have to be up
    /// at startup; batches written while it is down go to the fallback log.
    pub fn connect_lazy(config: &StoreConfig) -> Result<Self, CoreError> {
        validate_table_name(&config.table)?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_millis(config.write_timeout_ms))
            .connect_lazy(&config.url)
            .map_err(|e| CoreError::Config(format!("Invalid store URL: {e}")))?;
        Ok(Self {
            pool,
            table: config.table.clone(),
        })
    }

    /// Create the flow table if it is missing, and make it a hypertable when
    /// the TimescaleDB extension is installed.
    pub async fn ensure_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::query(&schema_sql(&self.table))
            .execute(&self.pool)
            .await?;

        let (timescale,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM pg_extension WHERE extname = 'timescaledb')",
        )
        .fetch_one(&self.pool)
        .await?;

        if timescale {
            sqlx::query("SELECT create_hypertable($1::regclass, 'time', if_not_exists => TRUE)")
                .bind(&self.table)
                .execute(&self.pool)
                .await?;
            info!("Table {} is a TimescaleDB hypertable", self.table);
        } else {
            info!(
                "Table {} ready (timescaledb extension not installed)",
                self.table
            );
        }
        Ok(())
    }

    /// Insert `rows` inside the transaction `conn` is currently in.
    ///
    /// When the multi-row insert fails on a row's data, retry one savepoint
    /// per row and return the offending indices. Any other error fails the
    /// whole chunk.
    async fn insert_chunk(
        &self,
        conn: &mut PgConnection,
        rows: &[FlowRow],
    ) -> Result<Vec<usize>, sqlx::Error> {
        let mut batch = Connection::begin(&mut *conn).await?;
        match insert_query(&self.table, rows).build().execute(&mut *batch).await {
            Ok(_) => {
                batch.commit().await?;
                return Ok(Vec::new());
            }
            Err(e) if is_row_rejection(&e) => {
                debug!("Batch insert rejected ({e}), retrying row by row");
                batch.rollback().await?;
            }
            Err(e) => return Err(e),
        }

        let mut rejected = Vec::new();
        for (idx, row) in rows.iter().enumerate() {
            let mut single = Connection::begin(&mut *conn).await?;
            match insert_query(&self.table, std::slice::from_ref(row))
                .build()
                .execute(&mut *single)
                .await
            {
                Ok(_) => single.commit().await?,
                Err(e) if is_row_rejection(&e) => {
                    debug!("Row {idx} rejected: {e}");
                    single.rollback().await?;
                    rejected.push(idx);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(rejected)
    }
}

#[async_trait]
impl FlowStore for PgStore {
    async fn append(&self, rows: &[FlowRow]) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await.map_err(write_failure)?;
        let mut rejected = Vec::new();
        for (chunk_idx, chunk) in rows.chunks(INSERT_CHUNK).enumerate() {
            let offset = chunk_idx * INSERT_CHUNK;
            let chunk_rejected = self
                .insert_chunk(&mut *tx, chunk)
                .await
                .map_err(write_failure)?;
            rejected.extend(chunk_rejected.into_iter().map(|i| i + offset));
        }
        tx.commit().await.map_err(write_failure)?;

        let accepted = rows.len() - rejected.len();
        if rejected.is_empty() {
            Ok(accepted)
        } else {
            Err(StoreError::PartialBatchRejection { accepted, rejected })
        }
    }

    fn describe(&self) -> String {
        format!("postgres table {}", self.table)
    }
}

/// True when the database refused the statement because of a row's values:
/// SQLSTATE class 22 (data exception) or 23 (integrity constraint
/// violation). Missing tables, permissions, read-only or full disks and the
/// like fail the whole write instead.
fn is_row_rejection(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => is_row_sqlstate(db.code().as_deref()),
        _ => false,
    }
}

fn is_row_sqlstate(code: Option<&str>) -> bool {
    code.is_some_and(|c| c.starts_with("22") || c.starts_with("23"))
}

fn write_failure(e: sqlx::Error) -> StoreError {
    StoreError::WriteFailure(e.to_string())
}

fn insert_query<'a>(table: &str, rows: &'a [FlowRow]) -> QueryBuilder<'a, Postgres> {
    let mut query = QueryBuilder::new(format!(
        "INSERT INTO {table} ({}) ",
        FLOW_ROW_COLUMNS.join(", ")
    ));
    query.push_values(rows, |mut b, row| {
        b.push_bind(&row.ipv4_src_addr)
            .push_bind(&row.ipv4_dst_addr)
            .push_bind(row.l4_src_port.map(i32::from))
            .push_bind(row.l4_dst_port.map(i32::from))
            .push_bind(row.protocol.map(i16::from))
            .push_bind(row.tcp_flags.map(i64::from))
            .push_bind(row.in_bytes.map(saturating_i64))
            .push_bind(row.in_pkts.map(saturating_i64))
            .push_bind(row.flow_duration_ms)
            .push_bind(row.bytes_per_second)
            .push_bind(row.avg_throughput_bps)
            .push_bind(&row.flow_monitor)
            .push_bind(row.time);
    });
    query
}

/// Postgres has no unsigned 64-bit type; counters beyond `i64::MAX` clamp.
fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn schema_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
    ipv4_src_addr      TEXT NOT NULL,
    ipv4_dst_addr      TEXT NOT NULL,
    l4_src_port        INTEGER,
    l4_dst_port        INTEGER,
    protocol           SMALLINT,
    tcp_flags          BIGINT,
    in_bytes           BIGINT,
    in_pkts            BIGINT,
    flow_duration_ms   BIGINT NOT NULL,
    bytes_per_second   DOUBLE PRECISION,
    avg_throughput_bps DOUBLE PRECISION,
    flow_monitor       TEXT NOT NULL,
    time               TIMESTAMPTZ NOT NULL
)"
    )
}

/// Table names are interpolated into SQL, so only plain (optionally
/// schema-qualified) identifiers are allowed.
fn validate_table_name(table: &str) -> Result<(), CoreError> {
    let valid_part = |part: &str| {
        let mut chars = part.chars();
        chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    };
    let parts: Vec<&str> = table.split('.').collect();
    if parts.len() <= 2 && parts.iter().all(|p| valid_part(p)) {
        Ok(())
    } else {
        Err(CoreError::Config(format!("Invalid store table name: {table:?}")))
    }
}
