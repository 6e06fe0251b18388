use std::collections::BTreeMap;

use serde_derive::Serialize;

/// Version stamped on every advertisement and status payload.
pub const SCHEMA_VERSION: &str = "1.0";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressKind {
    Public,
    Random,
    Unknown,
}

/// One normalized advertisement, published as JSON on `{prefix}/raw/{scanner_id}`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Advertisement {
    pub version: &'static str,
    /// RFC 3339 UTC, taken when the detection was normalized.
    pub timestamp: String,
    pub scanner_id: String,
    pub device: DeviceInfo,
    /// Company id (`0x004c`) to base64 payload.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub manufacturer_data: BTreeMap<String, String>,
    /// Service UUID to base64 payload.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub service_data: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub service_uuids: Vec<String>,
    /// Base64 of the full advertising frame. Absent when the backend cannot
    /// expose raw bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_data: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub address: String,
    pub address_type: AddressKind,
    pub rssi: i16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_power: Option<i16>,
}

impl Advertisement {
    pub fn address(&self) -> &str {
        &self.device.address
    }
}

/// Retained scanner health report, published on `{prefix}/scanner/{scanner_id}/status`.
#[derive(Clone, Debug, Serialize)]
pub struct StatusReport {
    pub version: &'static str,
    pub scanner_id: String,
    pub timestamp: String,
    pub status: ScannerStatus,
    pub uptime_seconds: u64,
    pub metrics: StatusMetrics,
    pub bluetooth: BluetoothStatus,
    pub mqtt: MqttStatus,
    pub config: ConfigEcho,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScannerStatus {
    Online,
    Offline,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct StatusMetrics {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub messages_deduplicated: u64,
    pub malformed: u64,
    pub devices_seen: u64,
    pub devices_blocked: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct BluetoothStatus {
    pub adapter: String,
    pub status: String,
    pub errors: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct MqttStatus {
    pub connected: bool,
    pub reconnections: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct ConfigEcho {
    pub deduplication_enabled: bool,
    pub deduplication_interval: u64,
    pub blocklist_count: usize,
}

/// Minimal payload used as the MQTT last will and on graceful shutdown.
#[derive(Clone, Debug, Serialize)]
pub struct OfflineStatus<'a> {
    pub version: &'static str,
    pub scanner_id: &'a str,
    pub status: ScannerStatus,
}

impl<'a> OfflineStatus<'a> {
    pub fn new(scanner_id: &'a str) -> Self {
        OfflineStatus {
            version: SCHEMA_VERSION,
            scanner_id,
            status: ScannerStatus::Offline,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn advertisement() -> Advertisement {
        Advertisement {
            version: SCHEMA_VERSION,
            timestamp: "2025-04-06T20:23:39+00:00".to_string(),
            scanner_id: "kitchen".to_string(),
            device: DeviceInfo {
                address: "AA:BB:CC:DD:EE:FF".to_string(),
                address_type: AddressKind::Random,
                rssi: -67,
                name: None,
                tx_power: None,
            },
            manufacturer_data: BTreeMap::new(),
            service_data: BTreeMap::new(),
            service_uuids: Vec::new(),
            raw_data: None,
        }
    }

    #[test]
    fn test_advertisement_omits_empty_fields() {
        let value = serde_json::to_value(advertisement()).unwrap();
        assert_eq!(
            value,
            json!({
                "version": "1.0",
                "timestamp": "2025-04-06T20:23:39+00:00",
                "scanner_id": "kitchen",
                "device": {
                    "address": "AA:BB:CC:DD:EE:FF",
                    "address_type": "random",
                    "rssi": -67,
                },
            })
        );
    }

    #[test]
    fn test_advertisement_with_payloads() {
        let mut adv = advertisement();
        adv.device.name = Some("Tile".to_string());
        adv.manufacturer_data
            .insert("0x004c".to_string(), "AhUB".to_string());
        adv.service_uuids.push("0000feed-0000-1000-8000-00805f9b34fb".to_string());

        let value = serde_json::to_value(adv).unwrap();
        assert_eq!(value["device"]["name"], "Tile");
        assert_eq!(value["manufacturer_data"]["0x004c"], "AhUB");
        assert_eq!(value["service_uuids"][0], "0000feed-0000-1000-8000-00805f9b34fb");
        assert!(value.get("service_data").is_none());
        assert!(value.get("raw_data").is_none());
    }

    #[test]
    fn test_offline_status() {
        let value = serde_json::to_value(OfflineStatus::new("kitchen")).unwrap();
        assert_eq!(
            value,
            json!({"version": "1.0", "scanner_id": "kitchen", "status": "offline"})
        );
    }
}
