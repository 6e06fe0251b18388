use std::collections::{BTreeMap, HashMap};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{SecondsFormat, Utc};
use thiserror::Error;

use crate::messages::{AddressKind, Advertisement, DeviceInfo, SCHEMA_VERSION};

/// A detection as reported by the capture backend, before normalization.
#[derive(Clone, Debug, Default)]
pub struct RawDetection {
    pub address: String,
    pub address_kind: Option<AddressKind>,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub tx_power: Option<i16>,
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    pub service_data: HashMap<String, Vec<u8>>,
    pub services: Vec<String>,
    pub raw: Option<Vec<u8>>,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NormalizeError {
    #[error("detection has no device address")]
    MissingAddress,
    #[error("detection from {0} has no signal strength")]
    MissingRssi(String),
}

/// Convert a raw detection into the published advertisement shape.
pub fn normalize(raw: RawDetection, scanner_id: &str) -> Result<Advertisement, NormalizeError> {
    let address = raw.address.trim().to_uppercase();
    if address.is_empty() {
        return Err(NormalizeError::MissingAddress);
    }
    let rssi = raw
        .rssi
        .ok_or_else(|| NormalizeError::MissingRssi(address.clone()))?;

    let manufacturer_data = raw
        .manufacturer_data
        .iter()
        .map(|(company_id, data)| (company_key(*company_id), BASE64.encode(data)))
        .collect::<BTreeMap<_, _>>();

    let service_data = raw
        .service_data
        .iter()
        .map(|(uuid, data)| (uuid.clone(), BASE64.encode(data)))
        .collect::<BTreeMap<_, _>>();

    Ok(Advertisement {
        version: SCHEMA_VERSION,
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false),
        scanner_id: scanner_id.to_string(),
        device: DeviceInfo {
            address,
            address_type: raw.address_kind.unwrap_or(AddressKind::Unknown),
            rssi,
            name: raw.name.filter(|name| !name.is_empty()),
            tx_power: raw.tx_power,
        },
        manufacturer_data,
        service_data,
        service_uuids: raw.services,
        raw_data: raw.raw.map(|bytes| BASE64.encode(bytes)),
    })
}

/// Bluetooth SIG company identifiers render as `0x` plus four lowercase hex digits.
fn company_key(company_id: u16) -> String {
    format!("0x{company_id:04x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::detection;

    #[test]
    fn test_company_key() {
        assert_eq!(company_key(0x004C), "0x004c");
        assert_eq!(company_key(0x0499), "0x0499");
        assert_eq!(company_key(0xFFFF), "0xffff");
    }

    #[test]
    fn test_normalize_encodes_payloads() {
        let mut raw = detection("aa:bb:cc:dd:ee:ff");
        raw.name = Some("Thermometer".to_string());
        raw.address_kind = Some(AddressKind::Public);
        raw.manufacturer_data.insert(0x0499, vec![0x05, 0x12, 0xFC]);
        raw.service_data.insert(
            "0000181a-0000-1000-8000-00805f9b34fb".to_string(),
            vec![0x01, 0x02],
        );
        raw.services.push("0000181a-0000-1000-8000-00805f9b34fb".to_string());

        let adv = normalize(raw, "kitchen").unwrap();
        assert_eq!(adv.version, SCHEMA_VERSION);
        assert_eq!(adv.scanner_id, "kitchen");
        assert_eq!(adv.device.address, "AA:BB:CC:DD:EE:FF");
        assert_eq!(adv.device.address_type, AddressKind::Public);
        assert_eq!(adv.device.name.as_deref(), Some("Thermometer"));
        assert_eq!(adv.device.rssi, -60);
        assert_eq!(adv.manufacturer_data["0x0499"], "BRL8");
        assert_eq!(
            adv.service_data["0000181a-0000-1000-8000-00805f9b34fb"],
            "AQI="
        );
        assert_eq!(adv.service_uuids.len(), 1);
        assert!(adv.raw_data.is_none());
        assert!(chrono::DateTime::parse_from_rfc3339(&adv.timestamp).is_ok());
    }

    #[test]
    fn test_normalize_defaults() {
        let mut raw = detection("11:22:33:44:55:66");
        raw.name = Some(String::new());
        let adv = normalize(raw, "kitchen").unwrap();
        assert_eq!(adv.device.address_type, AddressKind::Unknown);
        assert!(adv.device.name.is_none());
        assert!(adv.manufacturer_data.is_empty());
    }

    #[test]
    fn test_normalize_raw_frame() {
        let mut raw = detection("11:22:33:44:55:66");
        raw.raw = Some(vec![0x02, 0x01, 0x06]);
        let adv = normalize(raw, "kitchen").unwrap();
        assert_eq!(adv.raw_data.as_deref(), Some("AgEG"));
    }

    #[test]
    fn test_normalize_rejects_malformed() {
        let mut raw = detection("  ");
        assert_eq!(
            normalize(raw.clone(), "kitchen"),
            Err(NormalizeError::MissingAddress)
        );

        raw.address = "aa:bb:cc:dd:ee:ff".to_string();
        raw.rssi = None;
        assert_eq!(
            normalize(raw, "kitchen"),
            Err(NormalizeError::MissingRssi("AA:BB:CC:DD:EE:FF".to_string()))
        );
    }
}
