//! # Meshtastic Device Module
//!
//! Device adapters that feed raw packets to the collector.
//!
//! - [`serial::SerialDevice`] talks to a radio over USB/UART using the
//!   Meshtastic serial API: it sends `want_config`, waits for
//!   `config_complete_id`, then streams every `MeshPacket` while sending
//!   periodic heartbeats.
//! - [`replay::ReplaySource`] reads recorded packets from a JSON-lines file.
//!
//! Both implement [`DeviceSource`] and push [`DeviceEvent`]s into a bounded
//! channel owned by the run-loop. A `watch` flag tells them to stop.
//!
//! ```text
//! radio --bytes--> FrameDecoder --FromRadio--> RadioSession --RawPacket--> mpsc
//! ```

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, trace, warn};
use prost::Message;
use std::collections::HashSet;
use std::fmt;
use tokio::sync::{mpsc, watch};

pub mod framer;
pub mod packet;
pub mod replay;
#[cfg(feature = "serial")]
pub mod serial;
pub mod slip;

use crate::logutil::{escape_log, hex_snippet, node_label};
use crate::protobuf::meshtastic_generated as proto;
use framer::{encode_frame, FrameDecoder};
use packet::RawPacket;

/// What a device reports about itself once the handshake completes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub my_node_num: Option<u32>,
    pub long_name: Option<String>,
    pub node_count: usize,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let node = self
            .my_node_num
            .map(node_label)
            .unwrap_or_else(|| "unknown node".to_string());
        let name = self
            .long_name
            .as_deref()
            .map(escape_log)
            .unwrap_or_else(|| "Unknown".into());
        write!(f, "{} ({}), {} nodes in device db", name, node, self.node_count)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkState {
    Up(DeviceInfo),
    Down(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Packet {
        packet: RawPacket,
        received_at: DateTime<Utc>,
    },
    Link(LinkState),
}

impl DeviceEvent {
    /// Wrap a packet with its capture time from the adapter's clock.
    pub fn packet(packet: RawPacket, clock: &mut CaptureClock) -> Self {
        DeviceEvent::Packet {
            packet,
            received_at: clock.stamp(),
        }
    }
}

/// Capture timestamps in arrival order. A wall clock stepped backwards (NTP
/// correction) repeats the last stamp instead of going back in time.
#[derive(Debug, Default, Clone)]
pub struct CaptureClock {
    last: Option<DateTime<Utc>>,
}

impl CaptureClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stamp(&mut self) -> DateTime<Utc> {
        self.observe(Utc::now())
    }

    pub fn observe(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let stamped = match self.last {
            Some(last) if now < last => last,
            _ => now,
        };
        self.last = Some(stamped);
        stamped
    }
}

/// A producer of device events.
#[async_trait]
pub trait DeviceSource: Send {
    fn describe(&self) -> String;

    /// Open the device and finish any handshake. Failure here is fatal.
    async fn open(&mut self) -> Result<DeviceInfo>;

    /// Push events until `shutdown` flips to true or the input ends.
    async fn run(
        self: Box<Self>,
        events: mpsc::Sender<DeviceEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()>;
}

/// Request id for `want_config`; the device echoes it in `config_complete_id`.
pub fn new_config_request_id() -> u32 {
    let id: u32 = rand::random();
    if id == 0 {
        1
    } else {
        id
    }
}

fn to_radio_frame(variant: proto::to_radio::PayloadVariant) -> Option<Vec<u8>> {
    let msg = proto::ToRadio {
        payload_variant: Some(variant),
    };
    encode_frame(&msg.encode_to_vec())
}

pub fn want_config_frame(request_id: u32) -> Option<Vec<u8>> {
    to_radio_frame(proto::to_radio::PayloadVariant::WantConfigId(request_id))
}

pub fn heartbeat_frame(nonce: u32) -> Option<Vec<u8>> {
    to_radio_frame(proto::to_radio::PayloadVariant::Heartbeat(proto::Heartbeat {
        nonce,
    }))
}

pub fn disconnect_frame() -> Option<Vec<u8>> {
    to_radio_frame(proto::to_radio::PayloadVariant::Disconnect(true))
}

/// Protocol state for one serial session: frame decoding, the config
/// handshake and what it told us about the device.
#[derive(Debug)]
pub struct RadioSession {
    request_id: u32,
    decoder: FrameDecoder,
    info: DeviceInfo,
    seen_nodes: HashSet<u32>,
    configured: bool,
    rebooted: bool,
}

impl RadioSession {
    pub fn new(request_id: u32) -> Self {
        Self {
            request_id,
            decoder: FrameDecoder::new(),
            info: DeviceInfo::default(),
            seen_nodes: HashSet::new(),
            configured: false,
            rebooted: false,
        }
    }

    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// True once after the device reports a reboot; the caller should send a
    /// fresh `want_config`.
    pub fn take_rebooted(&mut self) -> bool {
        std::mem::take(&mut self.rebooted)
    }

    /// Feed raw bytes from the link; returns the mesh packets they completed.
    pub fn ingest(&mut self, bytes: &[u8]) -> Vec<RawPacket> {
        trace!("RAW {} bytes: {}", bytes.len(), hex_snippet(bytes, 64));
        let mut packets = Vec::new();
        for frame in self.decoder.push(bytes) {
            match proto::FromRadio::decode(frame.as_slice()) {
                Ok(msg) => {
                    if let Some(p) = self.handle(msg) {
                        packets.push(p);
                    }
                }
                Err(e) => debug!(
                    "Undecodable frame ({} bytes, {}): {}",
                    frame.len(),
                    hex_snippet(&frame, 16),
                    e
                ),
            }
        }
        packets
    }

    fn handle(&mut self, msg: proto::FromRadio) -> Option<RawPacket> {
        use proto::from_radio::PayloadVariant;
        match msg.payload_variant? {
            PayloadVariant::Packet(pkt) => return Some(RawPacket::from(&pkt)),
            PayloadVariant::MyInfo(my) => {
                debug!("Device reports node {}", node_label(my.my_node_num));
                self.info.my_node_num = Some(my.my_node_num);
            }
            PayloadVariant::NodeInfo(node) => {
                if self.seen_nodes.insert(node.num) {
                    self.info.node_count = self.seen_nodes.len();
                }
                if Some(node.num) == self.info.my_node_num {
                    if let Some(user) = node.user.filter(|u| !u.long_name.is_empty()) {
                        self.info.long_name = Some(user.long_name);
                    }
                }
            }
            PayloadVariant::ConfigCompleteId(id) => {
                if id == self.request_id {
                    self.configured = true;
                    info!("Device configuration complete: {}", self.info);
                } else {
                    debug!(
                        "Ignoring config_complete_id 0x{:08x} (waiting for 0x{:08x})",
                        id, self.request_id
                    );
                }
            }
            PayloadVariant::LogRecord(rec) => {
                debug!("Device log: {}", escape_log(&rec.message));
            }
            PayloadVariant::Rebooted(_) => {
                warn!("Device reported a reboot");
                self.configured = false;
                self.rebooted = true;
            }
        }
        None
    }
}
