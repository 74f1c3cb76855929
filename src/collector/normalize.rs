//! Raw device packets to [`NormalizedPacket`]s.
//!
//! Normalization never touches the store. A packet is rejected only when its
//! source address cannot be parsed; everything else degrades to absent fields.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::sync::Arc;
use thiserror::Error;

use crate::collector::hardware::HardwareCode;
use crate::logutil::{escape_log, node_label};
use crate::meshtastic::packet::{
    decode_hex, Payload, RawPacket, UserFields, BROADCAST_ADDR, BROADCAST_ID,
};
use crate::metrics::CollectorStats;
use crate::storage::UNKNOWN_LABEL;

/// Port carrying identity announcements.
pub const NODEINFO_PORT: &str = "NODEINFO_APP";
/// Port recorded when the packet could not be decoded (for example encrypted).
pub const UNKNOWN_PORT: &str = "UNKNOWN_APP";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("packet has no source address")]
    MissingSource,
    #[error("malformed source address '{0}'")]
    MalformedSource(String),
}

/// Where in the packet an identity was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySource {
    PayloadFields,
    PayloadProtobuf,
    DecodedUser,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedIdentity {
    pub long_name: String,
    pub short_name: String,
    pub hardware: Option<HardwareCode>,
    pub role: Option<HardwareCode>,
    pub source: IdentitySource,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedPacket {
    pub timestamp: DateTime<Utc>,
    pub source_id: u32,
    pub destination_id: Option<u32>,
    pub port_type: String,
    pub packet_id: Option<u32>,
    pub channel: Option<u32>,
    pub rx_time: Option<u32>,
    pub rx_snr: Option<f32>,
    pub rx_rssi: Option<i32>,
    pub hop_limit: Option<u32>,
    pub hop_start: Option<u32>,
    pub want_ack: Option<bool>,
    pub via_mqtt: Option<bool>,
    pub payload_size: Option<u32>,
    pub embedded_identity: Option<EmbeddedIdentity>,
}

impl NormalizedPacket {
    pub fn is_identity_announcement(&self) -> bool {
        self.port_type == NODEINFO_PORT
    }
}

/// Parse a `!<hex>` node address.
pub fn parse_node_id(text: &str) -> Option<u32> {
    let hex = text.trim().strip_prefix('!')?;
    if hex.is_empty() || hex.len() > 8 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(hex, 16).ok()
}

fn parse_destination(text: Option<&str>) -> Option<u32> {
    let text = text?.trim();
    if text == BROADCAST_ID {
        return None;
    }
    parse_node_id(text).filter(|id| *id != BROADCAST_ADDR)
}

fn label_or_unknown(value: Option<&str>) -> String {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => UNKNOWN_LABEL.to_string(),
    }
}

/// Search the known identity encodings in order: structured payload, protobuf
/// payload (bytes or hex), then `decoded.user`.
pub fn extract_identity(raw: &RawPacket) -> Option<EmbeddedIdentity> {
    let decoded = raw.decoded.as_ref()?;

    let from_payload = decoded.payload.as_ref().and_then(|payload| match payload {
        Payload::User(fields) if !fields.is_empty() => {
            Some((fields.clone(), IdentitySource::PayloadFields))
        }
        Payload::User(_) => None,
        Payload::Bytes(bytes) => {
            UserFields::from_protobuf(bytes).map(|f| (f, IdentitySource::PayloadProtobuf))
        }
        Payload::Text(text) => decode_hex(text)
            .and_then(|bytes| UserFields::from_protobuf(&bytes))
            .map(|f| (f, IdentitySource::PayloadProtobuf)),
    });

    let (fields, source) = from_payload.or_else(|| {
        decoded
            .user
            .as_ref()
            .filter(|u| !u.is_empty())
            .map(|u| (u.clone(), IdentitySource::DecodedUser))
    })?;

    Some(EmbeddedIdentity {
        long_name: label_or_unknown(fields.long_name.as_deref()),
        short_name: label_or_unknown(fields.short_name.as_deref()),
        hardware: fields.hw_model,
        role: fields.role,
        source,
    })
}

pub struct Normalizer {
    stats: Arc<CollectorStats>,
}

impl Normalizer {
    pub fn new(stats: Arc<CollectorStats>) -> Self {
        Self { stats }
    }

    pub fn normalize(
        &self,
        raw: &RawPacket,
        captured_at: DateTime<Utc>,
    ) -> Result<NormalizedPacket, Rejection> {
        self.stats.inc_received();

        let source_id = match raw.from_id.as_deref() {
            None => {
                self.stats.inc_rejected();
                warn!("Dropping packet without source address");
                return Err(Rejection::MissingSource);
            }
            Some(text) => match parse_node_id(text) {
                Some(id) => id,
                None => {
                    self.stats.inc_rejected();
                    warn!("Could not parse source node ID: {}", escape_log(text));
                    return Err(Rejection::MalformedSource(text.to_string()));
                }
            },
        };

        let decoded = raw.decoded.as_ref();
        let port_type = decoded
            .and_then(|d| d.portnum.as_ref())
            .map(|p| p.label())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| UNKNOWN_PORT.to_string());

        let embedded_identity = if port_type == NODEINFO_PORT {
            self.stats.inc_nodeinfo_triggers();
            let identity = extract_identity(raw);
            if identity.is_none() {
                debug!("NODEINFO from {} carried no usable identity", node_label(source_id));
            }
            identity
        } else {
            None
        };

        let payload_size = raw.encoded_len.or_else(|| {
            decoded
                .and_then(|d| d.payload.as_ref())
                .and_then(Payload::byte_len)
                .and_then(|n| u32::try_from(n).ok())
        });

        Ok(NormalizedPacket {
            timestamp: captured_at,
            source_id,
            destination_id: parse_destination(raw.to_id.as_deref()),
            port_type,
            packet_id: raw.id,
            channel: raw.channel,
            rx_time: raw.rx_time,
            rx_snr: raw.rx_snr,
            rx_rssi: raw.rx_rssi,
            hop_limit: raw.hop_limit.or_else(|| decoded.and_then(|d| d.hop_limit)),
            hop_start: raw.hop_start.or_else(|| decoded.and_then(|d| d.hop_start)),
            want_ack: raw.want_ack.or_else(|| decoded.and_then(|d| d.want_ack)),
            via_mqtt: raw.via_mqtt,
            payload_size,
            embedded_identity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meshtastic::packet::{Decoded, PortTag};
    use crate::protobuf::meshtastic_generated as proto;
    use prost::Message;

    fn normalizer() -> (Normalizer, Arc<CollectorStats>) {
        let stats = Arc::new(CollectorStats::new());
        (Normalizer::new(stats.clone()), stats)
    }

    fn packet(from: &str, port: &str) -> RawPacket {
        RawPacket {
            from_id: Some(from.into()),
            decoded: Some(Decoded {
                portnum: Some(PortTag::Name(port.into())),
                ..Decoded::default()
            }),
            ..RawPacket::default()
        }
    }

    #[test]
    fn node_ids() {
        assert_eq!(parse_node_id("!1234abcd"), Some(305_441_741));
        assert_eq!(parse_node_id("!FFFFFFFF"), Some(u32::MAX));
        assert_eq!(parse_node_id("1234abcd"), None);
        assert_eq!(parse_node_id("!"), None);
        assert_eq!(parse_node_id("!+1234"), None);
        assert_eq!(parse_node_id("!123456789"), None);
        assert_eq!(parse_node_id("!xyz"), None);
    }

    #[test]
    fn broadcast_destinations_are_absent() {
        assert_eq!(parse_destination(Some("^all")), None);
        assert_eq!(parse_destination(Some("!ffffffff")), None);
        assert_eq!(parse_destination(None), None);
        assert_eq!(parse_destination(Some("garbage")), None);
        assert_eq!(parse_destination(Some("!00000010")), Some(16));
    }

    #[test]
    fn rejects_missing_and_malformed_source() {
        let (n, stats) = normalizer();
        let mut raw = packet("!zz", "TEXT_MESSAGE_APP");
        assert!(matches!(
            n.normalize(&raw, Utc::now()),
            Err(Rejection::MalformedSource(_))
        ));
        raw.from_id = None;
        assert_eq!(n.normalize(&raw, Utc::now()), Err(Rejection::MissingSource));
        let snap = stats.snapshot();
        assert_eq!(snap.received, 2);
        assert_eq!(snap.rejected, 2);
    }

    #[test]
    fn telemetry_has_no_identity() {
        let (n, stats) = normalizer();
        let mut raw = packet("!0000abcd", "TELEMETRY_APP");
        raw.to_id = Some("^all".into());
        raw.rx_snr = Some(7.5);
        let out = n.normalize(&raw, Utc::now()).unwrap();
        assert_eq!(out.source_id, 0xabcd);
        assert_eq!(out.destination_id, None);
        assert_eq!(out.port_type, "TELEMETRY_APP");
        assert!(out.embedded_identity.is_none());
        assert_eq!(stats.snapshot().nodeinfo_triggers, 0);
    }

    #[test]
    fn structured_payload_identity_wins() {
        let (n, stats) = normalizer();
        let mut raw = packet("!1234abcd", NODEINFO_PORT);
        if let Some(d) = raw.decoded.as_mut() {
            d.payload = Some(Payload::User(UserFields {
                long_name: Some("Bridge-7".into()),
                short_name: Some("B7".into()),
                hw_model: Some(HardwareCode::Code(9)),
                ..UserFields::default()
            }));
            d.user = Some(UserFields {
                long_name: Some("Other".into()),
                ..UserFields::default()
            });
        }
        let out = n.normalize(&raw, Utc::now()).unwrap();
        let id = out.embedded_identity.unwrap();
        assert_eq!(id.long_name, "Bridge-7");
        assert_eq!(id.short_name, "B7");
        assert_eq!(id.hardware, Some(HardwareCode::Code(9)));
        assert_eq!(id.source, IdentitySource::PayloadFields);
        assert_eq!(stats.snapshot().nodeinfo_triggers, 1);
    }

    #[test]
    fn protobuf_payload_identity() {
        let user = proto::User {
            long_name: "Hilltop".into(),
            short_name: "HT".into(),
            hw_model: 43,
            ..Default::default()
        };
        let bytes = user.encode_to_vec();
        let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();

        for payload in [Payload::Bytes(bytes.clone()), Payload::Text(hex)] {
            let mut raw = packet("!00000001", NODEINFO_PORT);
            if let Some(d) = raw.decoded.as_mut() {
                d.payload = Some(payload);
            }
            let id = extract_identity(&raw).unwrap();
            assert_eq!(id.long_name, "Hilltop");
            assert_eq!(id.hardware, Some(HardwareCode::Code(43)));
            assert_eq!(id.source, IdentitySource::PayloadProtobuf);
        }
    }

    #[test]
    fn falls_back_to_decoded_user_and_defaults_names() {
        let mut raw = packet("!00000002", NODEINFO_PORT);
        if let Some(d) = raw.decoded.as_mut() {
            d.payload = Some(Payload::Text("not hex".into()));
            d.user = Some(UserFields {
                short_name: Some("  ".into()),
                hw_model: Some(HardwareCode::Label("TBEAM".into())),
                ..UserFields::default()
            });
        }
        let id = extract_identity(&raw).unwrap();
        assert_eq!(id.source, IdentitySource::DecodedUser);
        assert_eq!(id.long_name, UNKNOWN_LABEL);
        assert_eq!(id.short_name, UNKNOWN_LABEL);
    }

    #[test]
    fn nodeinfo_without_identity_is_not_rejected() {
        let (n, stats) = normalizer();
        let raw = packet("!00000003", NODEINFO_PORT);
        let out = n.normalize(&raw, Utc::now()).unwrap();
        assert!(out.embedded_identity.is_none());
        assert!(out.is_identity_announcement());
        assert_eq!(stats.snapshot().rejected, 0);
    }

    #[test]
    fn payload_size_prefers_encoded_length() {
        let (n, _) = normalizer();
        let mut raw = packet("!00000004", "TEXT_MESSAGE_APP");
        if let Some(d) = raw.decoded.as_mut() {
            d.payload = Some(Payload::Bytes(vec![1, 2, 3, 4]));
        }
        assert_eq!(n.normalize(&raw, Utc::now()).unwrap().payload_size, Some(4));
        raw.encoded_len = Some(31);
        assert_eq!(n.normalize(&raw, Utc::now()).unwrap().payload_size, Some(31));
    }

    #[test]
    fn undecoded_packet_gets_unknown_port_and_legacy_hop_fields() {
        let (n, _) = normalizer();
        let raw = RawPacket {
            from_id: Some("!00000005".into()),
            decoded: Some(Decoded {
                hop_limit: Some(2),
                hop_start: Some(3),
                ..Decoded::default()
            }),
            ..RawPacket::default()
        };
        let out = n.normalize(&raw, Utc::now()).unwrap();
        assert_eq!(out.port_type, UNKNOWN_PORT);
        assert_eq!(out.hop_limit, Some(2));
        assert_eq!(out.hop_start, Some(3));
    }
}
