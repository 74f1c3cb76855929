//! Hardware model and device role labels.
//!
//! Codes follow the Meshtastic `HardwareModel` and `Config.DeviceConfig.Role`
//! enums. The hardware table can be extended or corrected from the
//! `[hardware_models]` config table; lookups never fail.

use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::storage::UNKNOWN_LABEL;

/// Hardware model as it appears in a packet: an enum code or an already
/// textual label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HardwareCode {
    Code(i64),
    Label(String),
}

impl From<i64> for HardwareCode {
    fn from(code: i64) -> Self {
        HardwareCode::Code(code)
    }
}

impl From<&str> for HardwareCode {
    fn from(label: &str) -> Self {
        HardwareCode::Label(label.to_string())
    }
}

const HARDWARE_MODELS: &[(i64, &str)] = &[
    (0, "UNSET"),
    (1, "TLORA_V2"),
    (2, "TLORA_V1"),
    (3, "TLORA_V2_1_1P6"),
    (4, "TBEAM"),
    (5, "HELTEC_V2_0"),
    (6, "TBEAM_V0P7"),
    (7, "T_ECHO"),
    (8, "TLORA_V1_1P3"),
    (9, "RAK4631"),
    (10, "HELTEC_V2_1"),
    (11, "HELTEC_V1"),
    (12, "LILYGO_TBEAM_S3_CORE"),
    (13, "RAK11200"),
    (14, "NANO_G1"),
    (15, "TLORA_V2_1_1P8"),
    (16, "TLORA_T3_S3"),
    (17, "NANO_G1_EXPLORER"),
    (18, "NANO_G2_ULTRA"),
    (19, "LORA_TYPE"),
    (20, "WIPHONE"),
    (21, "WIO_WM1110"),
    (22, "RAK2560"),
    (23, "HELTEC_HRU_3601"),
    (24, "HELTEC_WIRELESS_BRIDGE"),
    (25, "STATION_G1"),
    (26, "RAK11310"),
    (27, "SENSELORA_RP2040"),
    (28, "SENSELORA_S3"),
    (29, "CANARYONE"),
    (30, "RP2040_LORA"),
    (31, "STATION_G2"),
    (32, "LORA_RELAY_V1"),
    (33, "NRF52840DK"),
    (34, "PPR"),
    (35, "GENIEBLOCKS"),
    (36, "NRF52_UNKNOWN"),
    (37, "PORTDUINO"),
    (38, "ANDROID_SIM"),
    (39, "DIY_V1"),
    (40, "NRF52840_PCA10059"),
    (41, "DR_DEV"),
    (42, "M5STACK"),
    (43, "HELTEC_V3"),
    (44, "HELTEC_WSL_V3"),
    (45, "BETAFPV_2400_TX"),
    (46, "BETAFPV_900_NANO_TX"),
    (47, "RPI_PICO"),
    (48, "HELTEC_WIRELESS_TRACKER"),
    (49, "HELTEC_WIRELESS_PAPER"),
    (50, "T_DECK"),
    (51, "T_WATCH_S3"),
    (52, "PICOMPUTER_S3"),
    (53, "HELTEC_HT62"),
    (54, "EBYTE_ESP32_S3"),
    (55, "ESP32_S3_PICO"),
    (56, "CHATTER_2"),
    (57, "HELTEC_WIRELESS_PAPER_V1_0"),
    (58, "HELTEC_WIRELESS_TRACKER_V1_0"),
    (59, "UNPHONE"),
    (60, "TD_LORAC"),
    (61, "CDEBYTE_EORA_S3"),
    (62, "TWC_MESH_V4"),
    (63, "NRF52_PROMICRO_DIY"),
    (64, "RADIOMASTER_900_BANDIT_NANO"),
    (65, "HELTEC_CAPSULE_SENSOR_V3"),
    (66, "HELTEC_VISION_MASTER_T190"),
    (67, "HELTEC_VISION_MASTER_E213"),
    (68, "HELTEC_VISION_MASTER_E290"),
    (69, "HELTEC_MESH_NODE_T114"),
    (70, "SENSECAP_INDICATOR"),
    (71, "TRACKER_T1000_E"),
    (72, "RAK3172"),
    (73, "WIO_E5"),
    (74, "RADIOMASTER_900_BANDIT"),
    (75, "ME25LS01_4Y10TD"),
    (76, "RP2040_FEATHER_RFM95"),
    (77, "M5STACK_COREBASIC"),
    (78, "M5STACK_CORE2"),
    (79, "RPI_PICO2"),
    (80, "M5STACK_CORES3"),
    (81, "SEEED_XIAO_S3"),
    (82, "MS24SF1"),
    (83, "TLORA_C6"),
    (84, "WISMESH_TAP"),
    (85, "ROUTASTIC"),
    (86, "MESH_TAB"),
    (87, "MESHLINK"),
    (88, "XIAO_NRF52_KIT"),
    (89, "THINKNODE_M1"),
    (90, "THINKNODE_M2"),
    (91, "T_ETH_ELITE"),
    (92, "HELTEC_SENSOR_HUB"),
    (93, "RESERVED_FRIED_CHICKEN"),
    (94, "HELTEC_MESH_POCKET"),
    (95, "SEEED_SOLAR_NODE"),
    (96, "NOMADSTAR_METEOR_PRO"),
    (97, "CROWPANEL"),
    (255, "PRIVATE_HW"),
];

const ROLES: &[&str] = &[
    "CLIENT",
    "CLIENT_MUTE",
    "ROUTER",
    "ROUTER_CLIENT",
    "REPEATER",
    "TRACKER",
    "SENSOR",
    "TAK",
    "CLIENT_HIDDEN",
    "LOST_AND_FOUND",
    "TAK_TRACKER",
    "ROUTER_LATE",
];

#[derive(Debug, Clone)]
pub struct HardwareResolver {
    models: HashMap<i64, String>,
}

impl Default for HardwareResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareResolver {
    pub fn new() -> Self {
        let models = HARDWARE_MODELS
            .iter()
            .map(|(code, label)| (*code, (*label).to_string()))
            .collect();
        Self { models }
    }

    /// Built-in table plus operator overrides. Keys that are not integers are
    /// skipped with a warning.
    pub fn with_overrides(overrides: &HashMap<String, String>) -> Self {
        let mut resolver = Self::new();
        for (key, label) in overrides {
            match key.trim().parse::<i64>() {
                Ok(code) => {
                    resolver
                        .models
                        .insert(code, label.trim().to_ascii_uppercase());
                }
                Err(_) => warn!("Ignoring hardware model override with non-numeric code '{}'", key),
            }
        }
        resolver
    }

    pub fn resolve(&self, code: &HardwareCode) -> String {
        match code {
            HardwareCode::Code(n) => self.resolve_code(*n),
            HardwareCode::Label(text) => {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    return UNKNOWN_LABEL.to_string();
                }
                match trimmed.parse::<i64>() {
                    Ok(n) => self.resolve_code(n),
                    Err(_) => trimmed.to_ascii_uppercase(),
                }
            }
        }
    }

    fn resolve_code(&self, code: i64) -> String {
        self.models
            .get(&code)
            .cloned()
            .unwrap_or_else(|| format!("UNKNOWN_HW_{}", code))
    }

    pub fn resolve_role(&self, code: &HardwareCode) -> String {
        match code {
            HardwareCode::Code(n) => role_label(*n),
            HardwareCode::Label(text) => {
                let trimmed = text.trim();
                match trimmed.parse::<i64>() {
                    Ok(n) => role_label(n),
                    Err(_) => trimmed.to_ascii_uppercase(),
                }
            }
        }
    }
}

fn role_label(code: i64) -> String {
    usize::try_from(code)
        .ok()
        .and_then(|i| ROLES.get(i))
        .map(|s| (*s).to_string())
        .unwrap_or_else(|| format!("UNKNOWN_ROLE_{}", code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes() {
        let r = HardwareResolver::new();
        assert_eq!(r.resolve(&HardwareCode::Code(9)), "RAK4631");
        assert_eq!(r.resolve(&HardwareCode::Code(43)), "HELTEC_V3");
        assert_eq!(r.resolve(&HardwareCode::Code(71)), "TRACKER_T1000_E");
        assert_eq!(r.resolve(&HardwareCode::Code(255)), "PRIVATE_HW");
        assert_eq!(r.resolve(&HardwareCode::Code(0)), "UNSET");
    }

    #[test]
    fn unknown_codes_get_placeholder() {
        let r = HardwareResolver::new();
        assert_eq!(r.resolve(&HardwareCode::Code(200)), "UNKNOWN_HW_200");
        assert_eq!(r.resolve(&HardwareCode::Code(-1)), "UNKNOWN_HW_-1");
    }

    #[test]
    fn textual_labels() {
        let r = HardwareResolver::new();
        assert_eq!(r.resolve(&" rak4631 ".into()), "RAK4631");
        assert_eq!(r.resolve(&"43".into()), "HELTEC_V3");
        assert_eq!(r.resolve(&"HELTEC_V3".into()), "HELTEC_V3");
    }

    #[test]
    fn overrides_extend_and_correct() {
        let mut extra = HashMap::new();
        extra.insert("200".to_string(), "my_board".to_string());
        extra.insert("43".to_string(), "HELTEC_V3_CUSTOM".to_string());
        extra.insert("bogus".to_string(), "X".to_string());
        let r = HardwareResolver::with_overrides(&extra);
        assert_eq!(r.resolve(&HardwareCode::Code(200)), "MY_BOARD");
        assert_eq!(r.resolve(&HardwareCode::Code(43)), "HELTEC_V3_CUSTOM");
        assert_eq!(r.resolve(&HardwareCode::Code(9)), "RAK4631");
    }

    #[test]
    fn roles() {
        let r = HardwareResolver::new();
        assert_eq!(r.resolve_role(&HardwareCode::Code(0)), "CLIENT");
        assert_eq!(r.resolve_role(&HardwareCode::Code(11)), "ROUTER_LATE");
        assert_eq!(r.resolve_role(&HardwareCode::Code(42)), "UNKNOWN_ROLE_42");
        assert_eq!(r.resolve_role(&"router".into()), "ROUTER");
    }

    #[test]
    fn blank_label_is_unknown() {
        assert_eq!(HardwareResolver::new().resolve(&"  ".into()), "Unknown");
    }
}
