//! PostgreSQL / TimescaleDB store backed by a deadpool connection pool.
//!
//! Every statement checks out its own pooled connection, so concurrent callers
//! never share a connection handle. Parameters are cast explicitly in SQL so the
//! same binary parameter types work whether the external schema uses `integer`,
//! `bigint` or `text` for a column.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use deadpool_postgres::{
    Config as PoolSettings, ManagerConfig, Pool, PoolConfig, PoolError, RecyclingMethod, Runtime,
};
use log::debug;
use std::time::Duration;
use tokio_postgres::types::ToSql;
use tokio_postgres::NoTls;

use super::{Applied, NodeUpsert, PacketMetricRecord, Statement, Store, StoreError, UNKNOWN_LABEL};
use crate::config::DatabaseConfig;

const UPSERT_NODE_SQL: &str = "\
INSERT INTO node_details (node_id, short_name, long_name, hardware_model, created_at, updated_at)
VALUES ($1::bigint, $2::text, $3::text, $4::text, $5::timestamptz, $5::timestamptz)
ON CONFLICT (node_id) DO UPDATE SET
    short_name = COALESCE(NULLIF(EXCLUDED.short_name, $6::text), node_details.short_name, EXCLUDED.short_name),
    long_name = COALESCE(NULLIF(EXCLUDED.long_name, $6::text), node_details.long_name, EXCLUDED.long_name),
    hardware_model = COALESCE(NULLIF(EXCLUDED.hardware_model, $6::text), node_details.hardware_model, EXCLUDED.hardware_model),
    updated_at = GREATEST(node_details.updated_at, EXCLUDED.updated_at)
RETURNING (xmax = 0) AS inserted";

const INSERT_METRIC_SQL: &str = "\
INSERT INTO mesh_packet_metrics (
    time, source_id, destination_id, portnum, packet_id, channel,
    rx_time, rx_snr, rx_rssi, hop_limit, hop_start, want_ack, via_mqtt, message_size_bytes
) VALUES (
    $1::timestamptz, $2::bigint, $3::bigint, $4::text, $5::bigint, $6::integer,
    $7::bigint, $8::real, $9::integer, $10::integer, $11::integer, $12::boolean, $13::boolean, $14::integer
)";

const HEALTH_SQL: &str = "SELECT 1";

#[derive(Clone)]
pub struct PostgresStore {
    pool: Pool,
}

impl PostgresStore {
    /// Build the pool. No connection is opened until first use.
    pub fn new(cfg: &DatabaseConfig) -> Result<Self> {
        let connect_timeout = Duration::from_secs(cfg.connect_timeout_secs);

        let mut settings = PoolSettings::new();
        settings.host = Some(cfg.host.clone());
        settings.port = Some(cfg.port);
        settings.dbname = Some(cfg.name.clone());
        settings.user = Some(cfg.user.clone());
        settings.password = Some(cfg.password.clone());
        settings.application_name = Some(env!("CARGO_PKG_NAME").to_string());
        settings.connect_timeout = Some(connect_timeout);
        settings.keepalives = Some(true);
        settings.keepalives_idle = Some(Duration::from_secs(cfg.keepalives_idle_secs));
        settings.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Verified,
        });

        let mut pool_cfg = PoolConfig::new(cfg.max_pool_size.max(1));
        pool_cfg.timeouts.wait = Some(connect_timeout);
        pool_cfg.timeouts.create = Some(connect_timeout);
        settings.pool = Some(pool_cfg);

        let pool = settings
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| {
                anyhow!(
                    "Failed to create connection pool for {}:{}: {}",
                    cfg.host,
                    cfg.port,
                    e
                )
            })?;
        debug!(
            "Created PostgreSQL pool for {}@{}:{}/{} (max {} connections)",
            cfg.user, cfg.host, cfg.port, cfg.name, cfg.max_pool_size
        );
        Ok(Self { pool })
    }

    async fn client(&self) -> Result<deadpool_postgres::Client, StoreError> {
        self.pool.get().await.map_err(classify_pool_error)
    }

    async fn upsert_node(&self, input: &NodeUpsert) -> Result<Applied, StoreError> {
        let client = self.client().await?;
        let stmt = client
            .prepare_cached(UPSERT_NODE_SQL)
            .await
            .map_err(|e| classify_pg_error(&e))?;

        let node_id = i64::from(input.node_id);
        let params: [&(dyn ToSql + Sync); 6] = [
            &node_id,
            &input.short_name,
            &input.long_name,
            &input.hardware_model,
            &input.seen_at,
            &UNKNOWN_LABEL,
        ];
        let row = client
            .query_one(&stmt, &params)
            .await
            .map_err(|e| classify_pg_error(&e))?;
        let inserted: bool = row
            .try_get("inserted")
            .map_err(|e| StoreError::Permanent(format!("unexpected upsert result: {}", e)))?;
        Ok(if inserted {
            Applied::NodeCreated
        } else {
            Applied::NodeUpdated
        })
    }

    async fn insert_metric(&self, row: &PacketMetricRecord) -> Result<Applied, StoreError> {
        let client = self.client().await?;
        let stmt = client
            .prepare_cached(INSERT_METRIC_SQL)
            .await
            .map_err(|e| classify_pg_error(&e))?;

        let source_id = i64::from(row.source_id);
        let destination_id = row.destination_id.map(i64::from);
        let packet_id = row.packet_id.map(i64::from);
        let channel = row.channel.map(to_i32);
        let rx_time = row.rx_time.map(i64::from);
        let hop_limit = row.hop_limit.map(to_i32);
        let hop_start = row.hop_start.map(to_i32);
        let size = row.message_size_bytes.map(to_i32);
        let params: [&(dyn ToSql + Sync); 14] = [
            &row.time,
            &source_id,
            &destination_id,
            &row.portnum,
            &packet_id,
            &channel,
            &rx_time,
            &row.rx_snr,
            &row.rx_rssi,
            &hop_limit,
            &hop_start,
            &row.want_ack,
            &row.via_mqtt,
            &size,
        ];
        client
            .execute(&stmt, &params)
            .await
            .map_err(|e| classify_pg_error(&e))?;
        Ok(Applied::MetricAppended)
    }
}

fn to_i32(v: u32) -> i32 {
    i32::try_from(v).unwrap_or(i32::MAX)
}

#[async_trait]
impl Store for PostgresStore {
    async fn execute(&self, statement: &Statement) -> Result<Applied, StoreError> {
        match statement {
            Statement::UpsertNode(input) => self.upsert_node(input).await,
            Statement::InsertMetric(row) => self.insert_metric(row).await,
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let client = self.client().await?;
        client
            .execute(HEALTH_SQL, &[])
            .await
            .map_err(|e| classify_pg_error(&e))?;
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), StoreError> {
        let _ = self.pool.retain(|client, _| !client.is_closed());
        self.ping().await
    }

    async fn close(&self) {
        self.pool.close();
    }
}

/// Classify a SQLSTATE code. Connection exceptions (08), operator intervention
/// shutdowns (57P01-57P03), insufficient resources (53), system I/O errors (58)
/// and serialization/deadlock aborts are transient; everything else means the
/// statement can never succeed as written.
pub fn is_transient_sqlstate(code: &str) -> bool {
    code.starts_with("08")
        || code.starts_with("53")
        || code.starts_with("58")
        || matches!(code, "57P01" | "57P02" | "57P03" | "40001" | "40P01")
}

fn classify_pg_error(e: &tokio_postgres::Error) -> StoreError {
    if let Some(db) = e.as_db_error() {
        let detail = format!("{} (SQLSTATE {})", db.message(), db.code().code());
        return if is_transient_sqlstate(db.code().code()) {
            StoreError::Transient(detail)
        } else {
            StoreError::Permanent(detail)
        };
    }
    if e.is_closed() || has_io_source(e) {
        StoreError::Transient(e.to_string())
    } else {
        StoreError::Permanent(e.to_string())
    }
}

fn has_io_source(e: &tokio_postgres::Error) -> bool {
    let mut source = std::error::Error::source(e);
    while let Some(err) = source {
        if err.downcast_ref::<std::io::Error>().is_some() {
            return true;
        }
        source = err.source();
    }
    false
}

fn classify_pool_error(e: PoolError) -> StoreError {
    match e {
        PoolError::Timeout(kind) => {
            StoreError::Transient(format!("connection pool timeout ({:?})", kind))
        }
        PoolError::Backend(err) => match classify_pg_error(&err) {
            // A connection that could not be created is always worth retrying.
            StoreError::Permanent(msg) if err.as_db_error().is_none() => {
                StoreError::Transient(msg)
            }
            other => other,
        },
        PoolError::Closed => StoreError::Permanent("connection pool closed".into()),
        other => StoreError::Transient(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_class_is_transient() {
        for code in [
            "08000", "08003", "08006", "08001", "57P01", "57P03", "53300", "40001", "40P01",
            "58030",
        ] {
            assert!(is_transient_sqlstate(code), "{} should be transient", code);
        }
    }

    #[test]
    fn constraint_and_syntax_errors_are_permanent() {
        for code in ["23505", "23502", "42601", "42P01", "22P02", "42804"] {
            assert!(!is_transient_sqlstate(code), "{} should be permanent", code);
        }
    }

    #[test]
    fn upsert_preserves_created_at_and_known_values() {
        assert!(!UPSERT_NODE_SQL.contains("created_at = "));
        assert!(UPSERT_NODE_SQL.contains("GREATEST(node_details.updated_at, EXCLUDED.updated_at)"));
        assert_eq!(UPSERT_NODE_SQL.matches("NULLIF(EXCLUDED.").count(), 3);
    }

    #[test]
    fn metric_insert_binds_every_column() {
        assert_eq!(INSERT_METRIC_SQL.matches('$').count(), 14);
    }

    #[test]
    fn pool_builds_without_connecting() {
        let cfg = crate::config::Config::default().database;
        assert!(PostgresStore::new(&cfg).is_ok());
    }
}
