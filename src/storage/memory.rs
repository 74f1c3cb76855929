//! In-process store with the same upsert/append semantics as the SQL store.
//!
//! Used by `replay --dry-run` and by tests, which can also script failures:
//! [`MemoryStore::fail_next`] queues errors returned by upcoming `execute`
//! calls, [`MemoryStore::set_reachable`] simulates an outage.

use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use super::{
    merge_label, Applied, NodeRecord, NodeUpsert, PacketMetricRecord, Statement, Store,
    StoreError,
};

#[derive(Debug, Default)]
struct Tables {
    nodes: BTreeMap<u32, NodeRecord>,
    metrics: Vec<PacketMetricRecord>,
}

#[derive(Debug)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    planned_failures: Mutex<VecDeque<StoreError>>,
    attempts: AtomicU64,
    reconnects: AtomicU64,
    reachable: AtomicBool,
    fail_reconnects: AtomicBool,
    closed: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            planned_failures: Mutex::new(VecDeque::new()),
            attempts: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            reachable: AtomicBool::new(true),
            fail_reconnects: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Queue an error for the next `execute` call that reaches the store.
    pub fn fail_next(&self, error: StoreError) {
        if let Ok(mut queue) = self.planned_failures.lock() {
            queue.push_back(error);
        }
    }

    /// While unreachable every call fails with a transient error.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn fail_reconnects(&self, fail: bool) {
        self.fail_reconnects.store(fail, Ordering::SeqCst);
    }

    /// Number of `execute` calls, successful or not.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn nodes(&self) -> Vec<NodeRecord> {
        self.tables
            .lock()
            .map(|t| t.nodes.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn node(&self, node_id: u32) -> Option<NodeRecord> {
        self.tables
            .lock()
            .ok()
            .and_then(|t| t.nodes.get(&node_id).cloned())
    }

    pub fn metrics(&self) -> Vec<PacketMetricRecord> {
        self.tables
            .lock()
            .map(|t| t.metrics.clone())
            .unwrap_or_default()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Permanent("store has been closed".into()));
        }
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(StoreError::Transient("store unreachable".into()));
        }
        Ok(())
    }

    fn upsert(tables: &mut Tables, input: &NodeUpsert) -> Applied {
        match tables.nodes.get_mut(&input.node_id) {
            Some(existing) => {
                existing.short_name = Some(merge_label(
                    existing.short_name.as_deref(),
                    &input.short_name,
                ));
                existing.long_name = Some(merge_label(
                    existing.long_name.as_deref(),
                    &input.long_name,
                ));
                existing.hardware_model = Some(merge_label(
                    existing.hardware_model.as_deref(),
                    &input.hardware_model,
                ));
                existing.updated_at = existing.updated_at.max(input.seen_at);
                Applied::NodeUpdated
            }
            None => {
                tables.nodes.insert(
                    input.node_id,
                    NodeRecord {
                        node_id: input.node_id,
                        short_name: Some(input.short_name.clone()),
                        long_name: Some(input.long_name.clone()),
                        hardware_model: Some(input.hardware_model.clone()),
                        created_at: input.seen_at,
                        updated_at: input.seen_at,
                    },
                );
                Applied::NodeCreated
            }
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn execute(&self, statement: &Statement) -> Result<Applied, StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let planned = self
            .planned_failures
            .lock()
            .ok()
            .and_then(|mut queue| queue.pop_front());
        if let Some(err) = planned {
            return Err(err);
        }

        let mut tables = self
            .tables
            .lock()
            .map_err(|_| StoreError::Permanent("memory store lock poisoned".into()))?;
        let applied = match statement {
            Statement::UpsertNode(input) => Self::upsert(&mut tables, input),
            Statement::InsertMetric(row) => {
                tables.metrics.push(row.clone());
                Applied::MetricAppended
            }
        };
        Ok(applied)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check_available()
    }

    async fn reconnect(&self) -> Result<(), StoreError> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        if self.fail_reconnects.load(Ordering::SeqCst) {
            return Err(StoreError::Transient("reconnect refused".into()));
        }
        self.check_available()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
