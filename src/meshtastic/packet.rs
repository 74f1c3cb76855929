//! Raw packet shape handed from a device adapter to the collector.
//!
//! The JSON form mirrors the dictionaries produced by the Meshtastic client
//! libraries (`fromId`, `toId`, `rxSnr`, `decoded.portnum` ...), so recorded
//! captures can be replayed as-is. The serial adapter builds the same shape
//! from a decoded protobuf `MeshPacket`.

use prost::Message;
use serde::{Deserialize, Serialize};

use crate::collector::hardware::HardwareCode;
use crate::protobuf::meshtastic_generated as proto;

/// Node address used by the firmware for broadcast.
pub const BROADCAST_ADDR: u32 = 0xffff_ffff;
/// Textual broadcast destination used by the client libraries.
pub const BROADCAST_ID: &str = "^all";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawPacket {
    pub from_id: Option<String>,
    pub to_id: Option<String>,
    pub id: Option<u32>,
    pub channel: Option<u32>,
    pub rx_time: Option<u32>,
    pub rx_snr: Option<f32>,
    pub rx_rssi: Option<i32>,
    pub hop_limit: Option<u32>,
    pub hop_start: Option<u32>,
    pub want_ack: Option<bool>,
    pub via_mqtt: Option<bool>,
    pub decoded: Option<Decoded>,
    /// Size of the packet as received, when the adapter knows it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoded_len: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Decoded {
    pub portnum: Option<PortTag>,
    pub payload: Option<Payload>,
    /// Alternate location some client versions use for a parsed NodeInfo user.
    pub user: Option<UserFields>,
    // Older captures carry routing fields here instead of on the packet.
    pub hop_limit: Option<u32>,
    pub hop_start: Option<u32>,
    pub want_ack: Option<bool>,
}

/// Port number as a name (`"TELEMETRY_APP"`) or a raw enum value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortTag {
    Number(i32),
    Name(String),
}

impl PortTag {
    pub fn label(&self) -> String {
        match self {
            PortTag::Name(name) => name.trim().to_string(),
            PortTag::Number(n) => port_name(*n),
        }
    }
}

/// Name of a `PortNum` value, or the number itself when it is not known.
pub fn port_name(portnum: i32) -> String {
    proto::PortNum::try_from(portnum)
        .map(|p| p.as_str_name().to_string())
        .unwrap_or_else(|_| portnum.to_string())
}

/// The encodings a `decoded.payload` is seen in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Bytes(Vec<u8>),
    User(UserFields),
    Text(String),
}

impl Payload {
    /// Raw payload length, if the payload is binary or hex encoded.
    pub fn byte_len(&self) -> Option<usize> {
        match self {
            Payload::Bytes(b) => Some(b.len()),
            Payload::Text(t) => decode_hex(t).map(|b| b.len()).or(Some(t.len())),
            Payload::User(_) => None,
        }
    }
}

/// A parsed `User` as the client libraries present it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserFields {
    pub id: Option<String>,
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    #[serde(alias = "hw")]
    pub hw_model: Option<HardwareCode>,
    pub role: Option<HardwareCode>,
}

impl UserFields {
    pub fn is_empty(&self) -> bool {
        self.long_name.is_none() && self.short_name.is_none() && self.hw_model.is_none()
    }

    /// Decode a protobuf `User`. Proto3 zero values count as not announced,
    /// except `role`, where 0 is `CLIENT`.
    pub fn from_protobuf(bytes: &[u8]) -> Option<Self> {
        let user = proto::User::decode(bytes).ok()?;
        let non_empty = |s: String| if s.is_empty() { None } else { Some(s) };
        let fields = Self {
            id: non_empty(user.id),
            long_name: non_empty(user.long_name),
            short_name: non_empty(user.short_name),
            hw_model: (user.hw_model != 0).then(|| HardwareCode::Code(i64::from(user.hw_model))),
            role: Some(HardwareCode::Code(i64::from(user.role))),
        };
        if fields.is_empty() {
            None
        } else {
            Some(fields)
        }
    }
}

/// Decode an even-length string of hex digits.
pub fn decode_hex(text: &str) -> Option<Vec<u8>> {
    let text = text.trim();
    if text.is_empty() || text.len() % 2 != 0 || !text.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).ok())
        .collect()
}

fn node_id_string(num: u32) -> String {
    if num == BROADCAST_ADDR {
        BROADCAST_ID.to_string()
    } else {
        format!("!{:08x}", num)
    }
}

fn non_zero<T: PartialEq + Default>(v: T) -> Option<T> {
    if v == T::default() {
        None
    } else {
        Some(v)
    }
}

impl From<&proto::MeshPacket> for RawPacket {
    fn from(pkt: &proto::MeshPacket) -> Self {
        let decoded = match &pkt.payload_variant {
            Some(proto::mesh_packet::PayloadVariant::Decoded(data)) => Some(Decoded {
                portnum: Some(PortTag::Name(port_name(data.portnum))),
                payload: Some(Payload::Bytes(data.payload.to_vec())),
                ..Decoded::default()
            }),
            _ => None,
        };
        // 0.0 dB is a real SNR reading once the radio stamped the packet as received.
        let rx_snr = if pkt.rx_time != 0 || pkt.rx_rssi != 0 {
            Some(pkt.rx_snr)
        } else {
            non_zero(pkt.rx_snr)
        };
        RawPacket {
            from_id: Some(node_id_string(pkt.from)),
            to_id: Some(node_id_string(pkt.to)),
            id: non_zero(pkt.id),
            channel: Some(pkt.channel),
            rx_time: non_zero(pkt.rx_time),
            rx_snr,
            rx_rssi: non_zero(pkt.rx_rssi),
            hop_limit: Some(pkt.hop_limit),
            hop_start: non_zero(pkt.hop_start),
            want_ack: Some(pkt.want_ack),
            via_mqtt: Some(pkt.via_mqtt),
            decoded,
            encoded_len: u32::try_from(pkt.encoded_len()).ok(),
        }
    }
}
