//! Shared helpers for the integration tests.
#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use meshtastic_collector::collector::hardware::HardwareCode;
use meshtastic_collector::collector::Collector;
use meshtastic_collector::config::Config;
use meshtastic_collector::meshtastic::packet::{Decoded, Payload, PortTag, RawPacket, UserFields};
use meshtastic_collector::meshtastic::{CaptureClock, DeviceEvent, DeviceInfo, DeviceSource};
use meshtastic_collector::storage::retry::RecordingSleeper;
use meshtastic_collector::storage::Store;

/// Defaults with a quiet reporter and a short retry schedule.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.logging.file = None;
    config.collector.stats_interval_secs = 3600;
    config.collector.drain_grace_secs = 5;
    config.retry.max_attempts = 3;
    config.retry.initial_delay_ms = 1;
    config.retry.max_delay_ms = 4;
    config
}

pub fn collector(config: &Config, store: Arc<dyn Store>) -> Collector {
    Collector::with_sleeper(config, store, Arc::new(RecordingSleeper::new()))
}

/// Emits a fixed list of packets. With `hold_open` it then waits for the
/// shutdown flag instead of ending the stream.
pub struct ScriptedSource {
    packets: Vec<RawPacket>,
    hold_open: bool,
    fail_open: bool,
}

impl ScriptedSource {
    pub fn new(packets: Vec<RawPacket>) -> Self {
        Self {
            packets,
            hold_open: false,
            fail_open: false,
        }
    }

    pub fn held_open(packets: Vec<RawPacket>) -> Self {
        Self {
            hold_open: true,
            ..Self::new(packets)
        }
    }

    pub fn unopenable() -> Self {
        Self {
            fail_open: true,
            ..Self::new(Vec::new())
        }
    }
}

#[async_trait]
impl DeviceSource for ScriptedSource {
    fn describe(&self) -> String {
        "scripted".to_string()
    }

    async fn open(&mut self) -> Result<DeviceInfo> {
        if self.fail_open {
            anyhow::bail!("no such device");
        }
        Ok(DeviceInfo {
            my_node_num: Some(0x0a0b0c0d),
            long_name: Some("Scripted".into()),
            node_count: 0,
        })
    }

    async fn run(
        self: Box<Self>,
        events: mpsc::Sender<DeviceEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut clock = CaptureClock::new();
        for packet in self.packets {
            if events.send(DeviceEvent::packet(packet, &mut clock)).await.is_err() {
                return Ok(());
            }
        }
        if self.hold_open {
            while !*shutdown.borrow_and_update() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        }
        Ok(())
    }
}

pub fn nodeinfo(from: &str, long_name: &str, short_name: &str, hw: i64) -> RawPacket {
    RawPacket {
        from_id: Some(from.into()),
        to_id: Some("^all".into()),
        id: Some(1),
        decoded: Some(Decoded {
            portnum: Some(PortTag::Name("NODEINFO_APP".into())),
            payload: Some(Payload::User(UserFields {
                id: Some(from.into()),
                long_name: Some(long_name.into()),
                short_name: Some(short_name.into()),
                hw_model: Some(HardwareCode::Code(hw)),
                ..UserFields::default()
            })),
            ..Decoded::default()
        }),
        ..RawPacket::default()
    }
}

pub fn telemetry(from: &str) -> RawPacket {
    RawPacket {
        from_id: Some(from.into()),
        to_id: Some("^all".into()),
        id: Some(2),
        rx_snr: Some(6.25),
        rx_rssi: Some(-92),
        hop_limit: Some(3),
        decoded: Some(Decoded {
            portnum: Some(PortTag::Name("TELEMETRY_APP".into())),
            payload: Some(Payload::Bytes(vec![0u8; 17])),
            ..Decoded::default()
        }),
        ..RawPacket::default()
    }
}
