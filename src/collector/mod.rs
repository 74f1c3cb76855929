//! # Collector Run-Loop
//!
//! Lifecycle: `Init -> Connecting -> Running -> Draining -> Stopped`.
//!
//! - **Connecting**: verify the store with a health round-trip, then open the
//!   device. Either failure stops the collector with a startup error; there is
//!   no automatic retry.
//! - **Running**: device events arrive on a bounded channel; each packet is
//!   processed on its own task, at most `max_in_flight` at a time. A separate
//!   task logs the statistics line every `stats_interval`.
//! - **Draining**: entered on SIGINT/SIGTERM, an explicit [`ShutdownHandle`]
//!   request, or end of device input. No new events are dispatched; in-flight
//!   tasks get `drain_grace` to finish before they are aborted.
//! - **Stopped**: device and pool closed.

use log::{debug, error, info, warn};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{timeout, MissedTickBehavior};

pub mod hardware;
pub mod normalize;
pub mod pipeline;

use crate::config::{CollectorConfig, Config};
use crate::meshtastic::{DeviceEvent, DeviceSource, LinkState};
use crate::metrics::CollectorStats;
use crate::storage::gateway::Gateway;
use crate::storage::retry::{RetryPolicy, Sleeper, TokioSleeper};
use crate::storage::{Store, StoreError};
use hardware::HardwareResolver;
use pipeline::Pipeline;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorState {
    Init,
    Connecting,
    Running,
    Draining,
    Stopped,
}

impl fmt::Display for CollectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CollectorState::Init => "init",
            CollectorState::Connecting => "connecting",
            CollectorState::Running => "running",
            CollectorState::Draining => "draining",
            CollectorState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("store unavailable at startup: {0}")]
    Store(#[from] StoreError),
    #[error("device unavailable at startup: {0}")]
    Device(anyhow::Error),
}

/// How the run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every in-flight event finished inside the grace period.
    Graceful,
    /// The grace period ran out and remaining tasks were aborted.
    Forced { aborted: usize },
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Graceful => 0,
            RunOutcome::Forced { .. } => 2,
        }
    }
}

/// Requests a graceful stop from outside the run-loop.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.send_replace(true);
    }
}

/// Resolve once the flag is set. A closed channel never resolves.
async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn termination_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    res = tokio::signal::ctrl_c() => {
                        if res.is_err() {
                            let _ = term.recv().await;
                            return "SIGTERM";
                        }
                        "SIGINT"
                    }
                    _ = term.recv() => "SIGTERM",
                }
            }
            Err(e) => {
                warn!("Cannot listen for SIGTERM: {}", e);
                if tokio::signal::ctrl_c().await.is_err() {
                    std::future::pending::<()>().await;
                }
                "SIGINT"
            }
        }
    }
    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
        "SIGINT"
    }
}

pub struct Collector {
    settings: CollectorConfig,
    queue_capacity: usize,
    stats: Arc<CollectorStats>,
    gateway: Arc<Gateway>,
    pipeline: Arc<Pipeline>,
    state: Mutex<CollectorState>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Collector {
    pub fn new(config: &Config, store: Arc<dyn Store>) -> Self {
        Self::with_sleeper(config, store, Arc::new(TokioSleeper))
    }

    pub fn with_sleeper(config: &Config, store: Arc<dyn Store>, sleeper: Arc<dyn Sleeper>) -> Self {
        let stats = Arc::new(CollectorStats::new());
        let gateway = Arc::new(
            Gateway::new(store, RetryPolicy::from(&config.retry), stats.clone())
                .with_sleeper(sleeper),
        );
        let hardware = Arc::new(HardwareResolver::with_overrides(&config.hardware_models));
        let pipeline = Arc::new(Pipeline::new(gateway.clone(), hardware, stats.clone()));
        let (shutdown, _) = watch::channel(false);
        Self {
            settings: config.collector.clone(),
            queue_capacity: config.meshtastic.event_queue_capacity.max(1),
            stats,
            gateway,
            pipeline,
            state: Mutex::new(CollectorState::Init),
            shutdown: Arc::new(shutdown),
        }
    }

    pub fn stats(&self) -> Arc<CollectorStats> {
        self.stats.clone()
    }

    pub fn gateway(&self) -> Arc<Gateway> {
        self.gateway.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown.clone())
    }

    pub fn state(&self) -> CollectorState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(CollectorState::Stopped)
    }

    fn set_state(&self, next: CollectorState) {
        if let Ok(mut s) = self.state.lock() {
            debug!("collector {} -> {}", *s, next);
            *s = next;
        }
    }

    /// Run until a shutdown request, a termination signal or end of input.
    pub async fn run(
        &self,
        mut source: Box<dyn DeviceSource>,
    ) -> Result<RunOutcome, CollectorError> {
        self.set_state(CollectorState::Connecting);
        if let Err(e) = self.gateway.connect().await {
            error!("Failed to connect to store: {}", e);
            self.set_state(CollectorState::Stopped);
            return Err(CollectorError::Store(e));
        }
        let device_info = match source.open().await {
            Ok(info) => info,
            Err(e) => {
                error!("Failed to open {}: {:#}", source.describe(), e);
                self.gateway.close().await;
                self.set_state(CollectorState::Stopped);
                return Err(CollectorError::Device(e));
            }
        };
        info!("Meshtastic connected via {}: {}", source.describe(), device_info);

        let (tx, mut rx) = mpsc::channel::<DeviceEvent>(self.queue_capacity);
        let mut device_task = tokio::spawn(source.run(tx, self.shutdown.subscribe()));
        let reporter = tokio::spawn(report_stats(
            self.gateway.clone(),
            self.stats.clone(),
            self.settings.stats_interval(),
            self.shutdown.subscribe(),
        ));

        self.set_state(CollectorState::Running);
        let permits = Arc::new(Semaphore::new(self.settings.max_in_flight.max(1)));
        let mut in_flight: JoinSet<()> = JoinSet::new();
        let mut shutdown_rx = self.shutdown.subscribe();
        let signal = termination_signal();
        tokio::pin!(signal);
        let mut pending_dropped = 0usize;

        loop {
            tokio::select! {
                biased;
                name = &mut signal => {
                    info!("Received {}", name);
                    break;
                }
                _ = wait_for_shutdown(&mut shutdown_rx) => {
                    info!("Shutdown requested");
                    break;
                }
                Some(res) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = res {
                        error!("Event task failed: {}", e);
                    }
                }
                event = rx.recv() => match event {
                    Some(DeviceEvent::Packet { packet, received_at }) => {
                        // Waiting for a free slot must not hide a stop request.
                        let permit = tokio::select! {
                            biased;
                            name = &mut signal => {
                                info!("Received {}", name);
                                pending_dropped += 1;
                                break;
                            }
                            _ = wait_for_shutdown(&mut shutdown_rx) => {
                                info!("Shutdown requested");
                                pending_dropped += 1;
                                break;
                            }
                            permit = permits.clone().acquire_owned() => match permit {
                                Ok(p) => p,
                                Err(_) => break,
                            },
                        };
                        let pipeline = self.pipeline.clone();
                        in_flight.spawn(async move {
                            let _permit = permit;
                            pipeline.process(&packet, received_at).await;
                        });
                    }
                    Some(DeviceEvent::Link(LinkState::Up(info))) => {
                        info!("Connection event: device up ({})", info);
                    }
                    Some(DeviceEvent::Link(LinkState::Down(reason))) => {
                        info!("Connection event: device down ({})", reason);
                    }
                    None => {
                        info!("Device event stream ended");
                        break;
                    }
                },
            }
        }

        self.set_state(CollectorState::Draining);
        self.shutdown.send_replace(true);
        rx.close();
        let mut dropped = pending_dropped;
        while rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            warn!("Discarded {} queued events that were not yet dispatched", dropped);
        }

        let grace = self.settings.drain_grace();
        info!("Draining {} in-flight events (grace {:?})", in_flight.len(), grace);
        let drained = timeout(grace, async {
            while let Some(res) = in_flight.join_next().await {
                if let Err(e) = res {
                    error!("Event task failed: {}", e);
                }
            }
        })
        .await;
        let outcome = match drained {
            Ok(()) => RunOutcome::Graceful,
            Err(_) => {
                let aborted = in_flight.len();
                warn!("Drain grace exceeded; aborting {} in-flight events", aborted);
                in_flight.shutdown().await;
                RunOutcome::Forced { aborted }
            }
        };

        match timeout(grace, &mut device_task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!("Device task ended with error: {:#}", e),
            Ok(Err(e)) => error!("Device task failed: {}", e),
            Err(_) => {
                warn!("Device did not stop within {:?}; aborting", grace);
                device_task.abort();
            }
        }
        let _ = reporter.await;

        let healthy = self.gateway.check_health().await;
        info!("{}", self.stats.snapshot().report(healthy));
        self.gateway.close().await;
        self.set_state(CollectorState::Stopped);
        info!("Cleanup completed");
        Ok(outcome)
    }
}

async fn report_stats(
    gateway: Arc<Gateway>,
    stats: Arc<CollectorStats>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            _ = ticker.tick() => {
                let healthy = gateway.check_health().await;
                info!("{}", stats.snapshot().report(healthy));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes() {
        assert_eq!(RunOutcome::Graceful.exit_code(), 0);
        assert_ne!(RunOutcome::Forced { aborted: 1 }.exit_code(), 0);
    }

    #[tokio::test]
    async fn shutdown_flag_set_before_waiting_is_seen() {
        let (tx, mut rx) = watch::channel(false);
        tx.send_replace(true);
        timeout(Duration::from_secs(1), wait_for_shutdown(&mut rx))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn closed_shutdown_channel_never_fires() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        assert!(timeout(Duration::from_millis(20), wait_for_shutdown(&mut rx))
            .await
            .is_err());
    }
}
