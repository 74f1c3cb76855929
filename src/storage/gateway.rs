//! Resilient persistence gateway.
//!
//! The gateway is the only component that talks to a [`Store`]. It tracks the
//! connection state machine
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Degraded (transient error)
//!                                  ^              |
//!                                  +-- Connecting +   (backoff, reconnect, retry)
//! ```
//!
//! and retries statements that fail with a transient error, waiting the
//! [`Backoff`](super::retry::Backoff) delay and re-establishing the connection
//! before every retry. Permanent errors are returned after the first attempt.

use log::{debug, error, info, warn};
use std::fmt;
use std::sync::{Arc, Mutex};

use super::retry::{RetryPolicy, Sleeper, TokioSleeper};
use super::{Applied, Statement, Store, StoreError};
use crate::metrics::CollectorStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Degraded => "degraded",
        };
        f.write_str(s)
    }
}

pub struct Gateway {
    store: Arc<dyn Store>,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    stats: Arc<CollectorStats>,
    state: Mutex<ConnectionState>,
}

impl Gateway {
    pub fn new(store: Arc<dyn Store>, policy: RetryPolicy, stats: Arc<CollectorStats>) -> Self {
        Self {
            store,
            policy,
            sleeper: Arc::new(TokioSleeper),
            stats,
            state: Mutex::new(ConnectionState::Disconnected),
        }
    }

    /// Replace the sleeper used between retries (tests inject a fake clock).
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|guard| *guard)
            .unwrap_or(ConnectionState::Degraded)
    }

    fn set_state(&self, next: ConnectionState) {
        if let Ok(mut guard) = self.state.lock() {
            if *guard != next {
                debug!("store connection {} -> {}", *guard, next);
                *guard = next;
            }
        }
    }

    /// Initial connection. Failures are returned as-is; startup does not retry.
    pub async fn connect(&self) -> Result<(), StoreError> {
        self.set_state(ConnectionState::Connecting);
        match self.store.ping().await {
            Ok(()) => {
                self.set_state(ConnectionState::Connected);
                info!("Store connection established");
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Execute a statement, retrying transient failures with bounded backoff.
    pub async fn execute_with_retry(&self, statement: &Statement) -> Result<Applied, StoreError> {
        let mut backoff = self.policy.backoff();
        loop {
            let attempt = backoff.start_attempt();
            match self.store.execute(statement).await {
                Ok(applied) => {
                    self.set_state(ConnectionState::Connected);
                    if attempt > 1 {
                        info!(
                            "{} succeeded on attempt {}/{}",
                            statement.kind(),
                            attempt,
                            self.policy.max_attempts
                        );
                    }
                    return Ok(applied);
                }
                Err(err) if err.is_transient() => {
                    self.set_state(ConnectionState::Degraded);
                    let Some(delay) = backoff.next_delay() else {
                        error!(
                            "{} failed after {} attempts: {}",
                            statement.kind(),
                            attempt,
                            err
                        );
                        return Err(err);
                    };
                    warn!(
                        "{} failed (attempt {}/{}): {} - retrying in {:?}",
                        statement.kind(),
                        attempt,
                        self.policy.max_attempts,
                        err,
                        delay
                    );
                    self.stats.inc_retries();
                    self.sleeper.sleep(delay).await;
                    self.reconnect().await;
                }
                Err(err) => {
                    error!("{} rejected by store: {}", statement.kind(), err);
                    return Err(err);
                }
            }
        }
    }

    async fn reconnect(&self) {
        self.set_state(ConnectionState::Connecting);
        match self.store.reconnect().await {
            Ok(()) => self.set_state(ConnectionState::Connected),
            Err(e) => {
                warn!("Store reconnect failed: {}", e);
                self.set_state(ConnectionState::Degraded);
            }
        }
    }

    /// Cheap round-trip. Does not touch retry bookkeeping or connection state.
    pub async fn check_health(&self) -> bool {
        match self.store.ping().await {
            Ok(()) => {
                debug!("Store connection healthy");
                true
            }
            Err(e) => {
                warn!("Store connection unhealthy: {}", e);
                false
            }
        }
    }

    pub async fn close(&self) {
        self.store.close().await;
        self.set_state(ConnectionState::Disconnected);
        info!("All store connections closed");
    }
}
