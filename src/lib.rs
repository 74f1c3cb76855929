//! # Meshtastic Collector - Mesh Radio to PostgreSQL/TimescaleDB Bridge
//!
//! Listens to a locally attached Meshtastic radio, normalizes every packet it
//! hears, keeps a registry of node identities and appends per-packet signal and
//! routing metrics to a time-series store.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meshtastic_collector::collector::Collector;
//! use meshtastic_collector::config::Config;
//! use meshtastic_collector::meshtastic::replay::ReplaySource;
//! use meshtastic_collector::storage::postgres::PostgresStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_with_env("config.toml").await?;
//!     let store = Arc::new(PostgresStore::new(&config.database)?);
//!     let collector = Collector::new(&config, store);
//!     let outcome = collector.run(Box::new(ReplaySource::new("capture.jsonl"))).await?;
//!     std::process::exit(outcome.exit_code());
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`collector`] - Run-loop, packet normalization, hardware model labels
//! - [`meshtastic`] - Device adapters (serial radio, JSON-lines replay) and framing
//! - [`storage`] - Store seam, PostgreSQL store, retrying gateway, node and metric writers
//! - [`config`] - Configuration loading, environment overrides and validation
//! - [`metrics`] - Collector statistics
//! - [`protobuf`] - Generated Meshtastic protobuf types
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  Device Source  │ ← serial radio or replay file
//! └─────────────────┘
//!          │ bounded channel
//! ┌─────────────────┐
//! │    Run-Loop     │ ← one task per event, semaphore-bounded
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │ Normalize →     │
//! │ Reconcile/Record│
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │    Gateway      │ ← retry with backoff, health checks
//! └─────────────────┘
//! ```

pub mod collector;
pub mod config;
pub mod logutil;
pub mod meshtastic;
pub mod metrics;
pub mod protobuf;
pub mod storage;
