//! Per-event processing: normalize, reconcile identity, record metrics.

use chrono::{DateTime, Utc};
use log::debug;
use std::sync::Arc;

use super::hardware::HardwareResolver;
use super::normalize::{Normalizer, Rejection};
use crate::logutil::node_label;
use crate::meshtastic::packet::RawPacket;
use crate::metrics::CollectorStats;
use crate::storage::gateway::Gateway;
use crate::storage::nodes::NodeReconciler;
use crate::storage::packets::MetricsWriter;
use crate::storage::{Applied, StoreError};

/// What happened to one event.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Rejected(Rejection),
    Processed {
        node: Option<Result<Applied, StoreError>>,
        metric: Result<(), StoreError>,
    },
}

impl Outcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, Outcome::Processed { metric: Ok(()), .. })
    }
}

pub struct Pipeline {
    normalizer: Normalizer,
    reconciler: NodeReconciler,
    writer: MetricsWriter,
}

impl Pipeline {
    pub fn new(
        gateway: Arc<Gateway>,
        hardware: Arc<HardwareResolver>,
        stats: Arc<CollectorStats>,
    ) -> Self {
        Self {
            normalizer: Normalizer::new(stats.clone()),
            reconciler: NodeReconciler::new(gateway.clone(), hardware, stats.clone()),
            writer: MetricsWriter::new(gateway, stats),
        }
    }

    /// Identity (when present) is reconciled before the metric row is written;
    /// a failed reconcile does not prevent the metric row.
    pub async fn process(&self, raw: &RawPacket, received_at: DateTime<Utc>) -> Outcome {
        let packet = match self.normalizer.normalize(raw, received_at) {
            Ok(p) => p,
            Err(rejection) => return Outcome::Rejected(rejection),
        };
        debug!(
            "Received {} from {} to {}",
            packet.port_type,
            node_label(packet.source_id),
            packet
                .destination_id
                .map(node_label)
                .unwrap_or_else(|| "broadcast".to_string())
        );

        let node = match &packet.embedded_identity {
            Some(identity) => Some(
                self.reconciler
                    .reconcile(packet.source_id, identity, packet.timestamp)
                    .await,
            ),
            None => None,
        };
        let metric = self.writer.record(&packet).await;
        Outcome::Processed { node, metric }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::hardware::HardwareCode;
    use crate::meshtastic::packet::{Decoded, Payload, PortTag, UserFields};
    use crate::storage::memory::MemoryStore;
    use crate::storage::retry::{RecordingSleeper, RetryPolicy};
    use std::time::Duration;

    fn pipeline(store: Arc<MemoryStore>) -> (Pipeline, Arc<CollectorStats>) {
        let stats = Arc::new(CollectorStats::new());
        let gateway = Gateway::new(
            store,
            RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(1)),
            stats.clone(),
        )
        .with_sleeper(Arc::new(RecordingSleeper::new()));
        let p = Pipeline::new(
            Arc::new(gateway),
            Arc::new(HardwareResolver::new()),
            stats.clone(),
        );
        (p, stats)
    }

    fn nodeinfo(from: &str) -> RawPacket {
        RawPacket {
            from_id: Some(from.into()),
            to_id: Some("^all".into()),
            decoded: Some(Decoded {
                portnum: Some(PortTag::Name("NODEINFO_APP".into())),
                payload: Some(Payload::User(UserFields {
                    long_name: Some("Bridge-7".into()),
                    short_name: Some("B7".into()),
                    hw_model: Some(HardwareCode::Code(9)),
                    ..UserFields::default()
                })),
                ..Decoded::default()
            }),
            ..RawPacket::default()
        }
    }

    #[tokio::test]
    async fn reconcile_failure_still_records_metric() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next(StoreError::Permanent("check constraint".into()));
        let (p, stats) = pipeline(store.clone());
        let outcome = p.process(&nodeinfo("!1234abcd"), Utc::now()).await;
        match &outcome {
            Outcome::Processed { node: Some(Err(_)), metric: Ok(()) } => {}
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(outcome.is_stored());
        assert!(store.nodes().is_empty());
        assert_eq!(store.metrics().len(), 1);
        assert_eq!(stats.snapshot().errors, 1);
    }

    #[tokio::test]
    async fn rejected_packet_never_reaches_store() {
        let store = Arc::new(MemoryStore::new());
        let (p, _) = pipeline(store.clone());
        let outcome = p.process(&nodeinfo("1234abcd"), Utc::now()).await;
        assert!(matches!(outcome, Outcome::Rejected(Rejection::MalformedSource(_))));
        assert_eq!(store.attempts(), 0);
    }
}
