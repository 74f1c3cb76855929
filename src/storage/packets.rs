//! Per-packet metric rows.

use log::{debug, error};
use std::sync::Arc;

use super::gateway::Gateway;
use super::{PacketMetricRecord, Statement, StoreError};
use crate::collector::normalize::NormalizedPacket;
use crate::logutil::node_label;
use crate::metrics::CollectorStats;

impl From<&NormalizedPacket> for PacketMetricRecord {
    fn from(p: &NormalizedPacket) -> Self {
        PacketMetricRecord {
            time: p.timestamp,
            source_id: p.source_id,
            destination_id: p.destination_id,
            portnum: p.port_type.clone(),
            packet_id: p.packet_id,
            channel: p.channel,
            rx_time: p.rx_time,
            rx_snr: p.rx_snr,
            rx_rssi: p.rx_rssi,
            hop_limit: p.hop_limit,
            hop_start: p.hop_start,
            want_ack: p.want_ack,
            via_mqtt: p.via_mqtt,
            message_size_bytes: p.payload_size,
        }
    }
}

pub struct MetricsWriter {
    gateway: Arc<Gateway>,
    stats: Arc<CollectorStats>,
}

impl MetricsWriter {
    pub fn new(gateway: Arc<Gateway>, stats: Arc<CollectorStats>) -> Self {
        Self { gateway, stats }
    }

    /// Append one row. Duplicate packet ids are stored as distinct rows.
    pub async fn record(&self, packet: &NormalizedPacket) -> Result<(), StoreError> {
        let row = PacketMetricRecord::from(packet);
        match self
            .gateway
            .execute_with_retry(&Statement::InsertMetric(row))
            .await
        {
            Ok(_) => {
                self.stats.inc_stored();
                debug!(
                    "Stored {} from {} (SNR: {:?}, RSSI: {:?})",
                    packet.port_type,
                    node_label(packet.source_id),
                    packet.rx_snr,
                    packet.rx_rssi
                );
                Ok(())
            }
            Err(e) => {
                self.stats.inc_errors();
                error!(
                    "Error storing packet metrics for {}: {}",
                    node_label(packet.source_id),
                    e
                );
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;
    use crate::storage::retry::{RecordingSleeper, RetryPolicy};
    use chrono::Utc;
    use std::time::Duration;

    fn packet(id: Option<u32>) -> NormalizedPacket {
        NormalizedPacket {
            timestamp: Utc::now(),
            source_id: 0xabcd,
            destination_id: None,
            port_type: "TELEMETRY_APP".into(),
            packet_id: id,
            channel: Some(0),
            rx_time: None,
            rx_snr: Some(6.0),
            rx_rssi: Some(-90),
            hop_limit: Some(3),
            hop_start: Some(3),
            want_ack: Some(false),
            via_mqtt: Some(false),
            payload_size: Some(24),
            embedded_identity: None,
        }
    }

    fn writer(store: Arc<MemoryStore>, stats: Arc<CollectorStats>) -> MetricsWriter {
        let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2));
        let gateway = Gateway::new(store, policy, stats.clone())
            .with_sleeper(Arc::new(RecordingSleeper::new()));
        MetricsWriter::new(Arc::new(gateway), stats)
    }

    #[tokio::test]
    async fn duplicate_packet_ids_are_distinct_rows() {
        let store = Arc::new(MemoryStore::new());
        let stats = Arc::new(CollectorStats::new());
        let w = writer(store.clone(), stats.clone());
        w.record(&packet(Some(9))).await.unwrap();
        w.record(&packet(Some(9))).await.unwrap();
        assert_eq!(store.metrics().len(), 2);
        assert_eq!(stats.snapshot().stored, 2);
        assert!(store.nodes().is_empty());
    }

    #[tokio::test]
    async fn retried_insert_is_applied_once() {
        let store = Arc::new(MemoryStore::new());
        let stats = Arc::new(CollectorStats::new());
        store.fail_next(StoreError::Transient("connection reset".into()));
        store.fail_next(StoreError::Transient("connection reset".into()));
        let w = writer(store.clone(), stats.clone());
        w.record(&packet(Some(1))).await.unwrap();
        assert_eq!(store.metrics().len(), 1);
        assert_eq!(store.attempts(), 3);
        let snap = stats.snapshot();
        assert_eq!((snap.stored, snap.errors, snap.retries), (1, 0, 2));
    }

    #[tokio::test]
    async fn outage_past_ceiling_counts_error() {
        let store = Arc::new(MemoryStore::new());
        let stats = Arc::new(CollectorStats::new());
        store.set_reachable(false);
        let w = writer(store.clone(), stats.clone());
        assert!(w.record(&packet(None)).await.is_err());
        assert_eq!(store.attempts(), 3);
        assert_eq!(stats.snapshot().errors, 1);
    }

    #[test]
    fn row_mirrors_packet() {
        let row = PacketMetricRecord::from(&packet(Some(3)));
        assert_eq!(row.portnum, "TELEMETRY_APP");
        assert_eq!(row.message_size_bytes, Some(24));
        assert_eq!(row.destination_id, None);
    }
}
