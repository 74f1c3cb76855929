//! Node registry reconciliation.
//!
//! Turns an identity announcement into a `node_details` upsert. The upsert is a
//! single statement so concurrent announcements for the same node cannot
//! create duplicate rows; merge rules live in the store.

use chrono::{DateTime, Utc};
use log::{error, info};
use std::sync::Arc;

use super::gateway::Gateway;
use super::{Applied, NodeUpsert, Statement, StoreError, UNKNOWN_LABEL};
use crate::collector::hardware::HardwareResolver;
use crate::collector::normalize::EmbeddedIdentity;
use crate::logutil::{escape_log, node_label};
use crate::metrics::CollectorStats;

pub struct NodeReconciler {
    gateway: Arc<Gateway>,
    hardware: Arc<HardwareResolver>,
    stats: Arc<CollectorStats>,
}

impl NodeReconciler {
    pub fn new(
        gateway: Arc<Gateway>,
        hardware: Arc<HardwareResolver>,
        stats: Arc<CollectorStats>,
    ) -> Self {
        Self {
            gateway,
            hardware,
            stats,
        }
    }

    pub fn upsert_for(
        &self,
        node_id: u32,
        identity: &EmbeddedIdentity,
        seen_at: DateTime<Utc>,
    ) -> NodeUpsert {
        let hardware_model = identity
            .hardware
            .as_ref()
            .map(|code| self.hardware.resolve(code))
            .unwrap_or_else(|| UNKNOWN_LABEL.to_string());
        NodeUpsert {
            node_id,
            short_name: identity.short_name.clone(),
            long_name: identity.long_name.clone(),
            hardware_model,
            seen_at,
        }
    }

    /// Create or update the node row. Failures are counted and returned; the
    /// gateway has already retried transient ones.
    pub async fn reconcile(
        &self,
        node_id: u32,
        identity: &EmbeddedIdentity,
        seen_at: DateTime<Utc>,
    ) -> Result<Applied, StoreError> {
        let upsert = self.upsert_for(node_id, identity, seen_at);
        let role = identity
            .role
            .as_ref()
            .map(|r| self.hardware.resolve_role(r))
            .unwrap_or_else(|| UNKNOWN_LABEL.to_string());
        info!(
            "Processing NODEINFO for {}: {} ({}) - {} [{}]",
            node_label(node_id),
            escape_log(&upsert.long_name),
            escape_log(&upsert.short_name),
            upsert.hardware_model,
            role
        );

        match self.gateway.execute_with_retry(&Statement::UpsertNode(upsert)).await {
            Ok(applied) => {
                match applied {
                    Applied::NodeCreated => {
                        self.stats.inc_nodes_created();
                        info!("Created node {}", node_label(node_id));
                    }
                    _ => self.stats.inc_nodes_updated(),
                }
                Ok(applied)
            }
            Err(e) => {
                self.stats.inc_errors();
                error!("Failed to update node {}: {}", node_label(node_id), e);
                Err(e)
            }
        }
    }
}
