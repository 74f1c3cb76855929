//! Serial adapter for a locally attached radio.
//!
//! Reads happen on a blocking thread that owns one handle of the port and
//! forwards byte chunks over a channel; writes (want_config, heartbeat,
//! disconnect) go through a cloned handle on the async side.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use serialport::SerialPort;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout, Instant, MissedTickBehavior};

use super::packet::RawPacket;
use super::{
    disconnect_frame, heartbeat_frame, new_config_request_id, want_config_frame, CaptureClock,
    DeviceEvent, DeviceInfo, DeviceSource, LinkState, RadioSession,
};
use crate::config::MeshtasticConfig;

const READ_TIMEOUT: Duration = Duration::from_millis(500);
const CHUNK_QUEUE: usize = 64;

type Chunk = std::result::Result<Vec<u8>, String>;

pub struct SerialDevice {
    port_name: String,
    baud_rate: u32,
    handshake_timeout: Duration,
    heartbeat_interval: Duration,
    writer: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
    chunks: Option<mpsc::Receiver<Chunk>>,
    stop_reader: Arc<AtomicBool>,
    session: Option<RadioSession>,
    backlog: Vec<RawPacket>,
}

impl SerialDevice {
    pub fn new(cfg: &MeshtasticConfig) -> Self {
        Self {
            port_name: cfg.port.clone(),
            baud_rate: cfg.baud_rate,
            handshake_timeout: Duration::from_secs(cfg.handshake_timeout_secs),
            heartbeat_interval: Duration::from_secs(cfg.heartbeat_interval_secs.max(1)),
            writer: None,
            chunks: None,
            stop_reader: Arc::new(AtomicBool::new(false)),
            session: None,
            backlog: Vec::new(),
        }
    }

    fn write_frame(&self, frame: Option<Vec<u8>>) -> Result<()> {
        let frame = frame.ok_or_else(|| anyhow!("frame too large"))?;
        let writer = self
            .writer
            .as_ref()
            .ok_or_else(|| anyhow!("serial port is not open"))?;
        let mut port = writer
            .lock()
            .map_err(|_| anyhow!("serial writer lock poisoned"))?;
        port.write_all(&frame)?;
        port.flush()?;
        debug!("Sent ToRadio frame ({} bytes)", frame.len());
        Ok(())
    }

    async fn open_port(&self) -> Result<Box<dyn SerialPort>> {
        debug!("Opening serial port {} at {} baud", self.port_name, self.baud_rate);
        let mut builder = serialport::new(&self.port_name, self.baud_rate).timeout(READ_TIMEOUT);
        #[cfg(unix)]
        {
            builder = builder
                .data_bits(serialport::DataBits::Eight)
                .stop_bits(serialport::StopBits::One)
                .parity(serialport::Parity::None);
        }
        let mut port = builder
            .open()
            .map_err(|e| anyhow!("Failed to open serial port {}: {}", self.port_name, e))?;

        // Wake the device and drop any boot text already buffered.
        let _ = port.write_data_terminal_ready(true);
        let _ = port.write_request_to_send(true);
        sleep(Duration::from_millis(150)).await;
        let _ = port.clear(serialport::ClearBuffer::Input);
        Ok(port)
    }
}

fn spawn_reader(
    mut port: Box<dyn SerialPort>,
    tx: mpsc::Sender<Chunk>,
    stop: Arc<AtomicBool>,
) {
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 1024];
        while !stop.load(Ordering::Relaxed) {
            match port.read(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    if tx.blocking_send(Ok(buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::TimedOut | std::io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => {
                    let _ = tx.blocking_send(Err(e.to_string()));
                    break;
                }
            }
        }
        debug!("Serial reader thread exiting");
    });
}

#[async_trait]
impl DeviceSource for SerialDevice {
    fn describe(&self) -> String {
        format!("serial {} @ {} baud", self.port_name, self.baud_rate)
    }

    async fn open(&mut self) -> Result<DeviceInfo> {
        let port = self.open_port().await?;
        let reader = port
            .try_clone()
            .with_context(|| format!("Failed to clone handle for {}", self.port_name))?;
        self.writer = Some(Arc::new(Mutex::new(port)));

        let (tx, mut rx) = mpsc::channel(CHUNK_QUEUE);
        spawn_reader(reader, tx, self.stop_reader.clone());

        let mut session = RadioSession::new(new_config_request_id());
        info!(
            "Requesting config from radio (want_config_id=0x{:08x})",
            session.request_id()
        );
        self.write_frame(want_config_frame(session.request_id()))?;

        let deadline = Instant::now() + self.handshake_timeout;
        while !session.is_configured() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, rx.recv()).await {
                Ok(Some(Ok(bytes))) => self.backlog.extend(session.ingest(&bytes)),
                Ok(Some(Err(e))) => bail!("Serial read failed during handshake: {}", e),
                Ok(None) => bail!("Serial reader stopped during handshake"),
                Err(_) => {
                    self.stop_reader.store(true, Ordering::Relaxed);
                    bail!(
                        "Device on {} did not complete config within {:?}",
                        self.port_name,
                        self.handshake_timeout
                    );
                }
            }
        }

        let info = session.info().clone();
        self.session = Some(session);
        self.chunks = Some(rx);
        Ok(info)
    }

    async fn run(
        mut self: Box<Self>,
        events: mpsc::Sender<DeviceEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let (mut session, mut chunks) = match (self.session.take(), self.chunks.take()) {
            (Some(s), Some(c)) => (s, c),
            _ => bail!("serial device used before open()"),
        };

        let _ = events
            .send(DeviceEvent::Link(LinkState::Up(session.info().clone())))
            .await;
        let mut clock = CaptureClock::new();
        for packet in std::mem::take(&mut self.backlog) {
            if events.send(DeviceEvent::packet(packet, &mut clock)).await.is_err() {
                return Ok(());
            }
        }

        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        heartbeat.tick().await;
        let mut nonce: u32 = 0;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Serial reader received shutdown signal");
                        break;
                    }
                }
                chunk = chunks.recv() => {
                    match chunk {
                        Some(Ok(bytes)) => {
                            for packet in session.ingest(&bytes) {
                                let event = DeviceEvent::packet(packet, &mut clock);
                                if events.send(event).await.is_err() {
                                    debug!("Event channel closed; stopping serial reader");
                                    self.stop_reader.store(true, Ordering::Relaxed);
                                    return Ok(());
                                }
                            }
                            if session.take_rebooted() {
                                let frame = want_config_frame(session.request_id());
                                if let Err(e) = self.write_frame(frame) {
                                    warn!("Failed to re-request config after reboot: {}", e);
                                }
                            }
                        }
                        Some(Err(e)) => {
                            error!("Serial read error on {}: {}", self.port_name, e);
                            let _ = events.send(DeviceEvent::Link(LinkState::Down(e))).await;
                            break;
                        }
                        None => {
                            let _ = events
                                .send(DeviceEvent::Link(LinkState::Down("reader stopped".into())))
                                .await;
                            break;
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    nonce = nonce.wrapping_add(1);
                    if let Err(e) = self.write_frame(heartbeat_frame(nonce)) {
                        debug!("Heartbeat send error: {}", e);
                    }
                }
            }
        }

        if let Err(e) = self.write_frame(disconnect_frame()) {
            debug!("Disconnect send error: {}", e);
        }
        self.stop_reader.store(true, Ordering::Relaxed);
        info!("Serial device {} closed", self.port_name);
        Ok(())
    }
}

impl Drop for SerialDevice {
    fn drop(&mut self) {
        self.stop_reader.store(true, Ordering::Relaxed);
    }
}
