//! # Storage Module - Durable Store Access
//!
//! Everything the collector writes goes through this module:
//!
//! - [`Store`] - the seam to the durable store; implemented by
//!   [`postgres::PostgresStore`] (PostgreSQL/TimescaleDB through a deadpool
//!   connection pool) and [`memory::MemoryStore`] (in-process tables used by
//!   `replay --dry-run` and the test suite).
//! - [`gateway::Gateway`] - sole owner of the store handle; retries transient
//!   failures with bounded exponential backoff and reports health.
//! - [`nodes::NodeReconciler`] - upserts node identity into `node_details`.
//! - [`packets::MetricsWriter`] - appends one row per packet to
//!   `mesh_packet_metrics`.
//!
//! ## Tables
//!
//! The schema is owned outside this crate. The collector relies on:
//!
//! ```text
//! node_details(node_id PK, short_name, long_name, hardware_model, created_at, updated_at)
//! mesh_packet_metrics(time, source_id, destination_id, portnum, packet_id, channel,
//!                     rx_time, rx_snr, rx_rssi, hop_limit, hop_start, want_ack,
//!                     via_mqtt, message_size_bytes)
//! ```
//!
//! ## Error Handling
//!
//! Store failures are classified once, where they happen, into
//! [`StoreError::Transient`] (worth retrying after reconnecting) and
//! [`StoreError::Permanent`] (retrying can never succeed).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod gateway;
pub mod memory;
pub mod nodes;
pub mod packets;
pub mod postgres;
pub mod retry;

/// Marker stored for names and hardware labels that have not been announced yet.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Errors returned by a [`Store`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Connectivity problem: reset, timeout, pool exhaustion, server restart.
    #[error("transient store failure: {0}")]
    Transient(String),

    /// The statement itself is invalid for the store (constraint, type, syntax).
    #[error("store rejected statement: {0}")]
    Permanent(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Identity facts for one node, ready to upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeUpsert {
    pub node_id: u32,
    pub short_name: String,
    pub long_name: String,
    pub hardware_model: String,
    pub seen_at: DateTime<Utc>,
}

/// One `mesh_packet_metrics` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketMetricRecord {
    pub time: DateTime<Utc>,
    pub source_id: u32,
    pub destination_id: Option<u32>,
    pub portnum: String,
    pub packet_id: Option<u32>,
    pub channel: Option<u32>,
    pub rx_time: Option<u32>,
    pub rx_snr: Option<f32>,
    pub rx_rssi: Option<i32>,
    pub hop_limit: Option<u32>,
    pub hop_start: Option<u32>,
    pub want_ack: Option<bool>,
    pub via_mqtt: Option<bool>,
    pub message_size_bytes: Option<u32>,
}

/// One `node_details` row as held by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: u32,
    pub short_name: Option<String>,
    pub long_name: Option<String>,
    pub hardware_model: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The statements the collector issues. Parameters travel with the statement
/// so a failed attempt can be replayed verbatim.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    UpsertNode(NodeUpsert),
    InsertMetric(PacketMetricRecord),
}

impl Statement {
    pub fn kind(&self) -> &'static str {
        match self {
            Statement::UpsertNode(_) => "upsert node_details",
            Statement::InsertMetric(_) => "insert mesh_packet_metrics",
        }
    }
}

/// What a successfully executed statement did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    NodeCreated,
    NodeUpdated,
    MetricAppended,
}

/// Seam between the gateway and a concrete durable store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Execute one statement on one connection.
    async fn execute(&self, statement: &Statement) -> Result<Applied, StoreError>;

    /// Trivial round-trip used for health checks.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Drop broken connections and prove a fresh one works.
    async fn reconnect(&self) -> Result<(), StoreError>;

    /// Close every connection; later calls fail.
    async fn close(&self);
}

/// Merge rule shared by every store: an incoming [`UNKNOWN_LABEL`] never
/// replaces a value that is already known.
pub fn merge_label(existing: Option<&str>, incoming: &str) -> String {
    match existing {
        Some(current) if incoming == UNKNOWN_LABEL => current.to_string(),
        _ => incoming.to_string(),
    }
}
