use crate::error::{EmulatorError, Result};
use serde_json::{json, Value};
use std::time::Instant;

pub const DEFAULT_DEVICE_ID: &str = "shellypro3em-emulator";
pub const DEFAULT_MODEL: &str = "SPEM-003CEBEU";
pub const DEFAULT_FIRMWARE_VERSION: &str = "1.1.0";
pub const DEFAULT_FW_ID: &str = "20231219-133625/1.1.0-g9eb7ffd";

/// Static description of the emulated Shelly Pro 3EM.
///
/// Built once at startup and shared read-only by every protocol surface.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    device_id: String,
    device_name: String,
    mac_address: String,
    model: String,
    firmware_version: String,
    fw_id: String,
    started: Instant,
}

impl DeviceIdentity {
    /// Normalizes the MAC address (separators stripped, upper case) and derives
    /// the device id from it when the placeholder id is used.
    pub fn new(device_id: &str, device_name: &str, mac_address: &str) -> Result<Self> {
        let mac: String = mac_address
            .chars()
            .filter(|c| *c != ':' && *c != '-')
            .collect::<String>()
            .to_ascii_uppercase();
        if mac.len() != 12 || !mac.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(EmulatorError::InvalidMacAddress(mac_address.to_string()));
        }

        let device_id = if device_id.is_empty() || device_id == DEFAULT_DEVICE_ID {
            format!("shellypro3em-{}", mac[6..].to_ascii_lowercase())
        } else {
            device_id.to_string()
        };

        Ok(Self {
            device_id,
            device_name: device_name.to_string(),
            mac_address: mac,
            model: DEFAULT_MODEL.to_string(),
            firmware_version: DEFAULT_FIRMWARE_VERSION.to_string(),
            fw_id: DEFAULT_FW_ID.to_string(),
            started: Instant::now(),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Twelve upper case hex characters, no separators
    pub fn mac_address(&self) -> &str {
        &self.mac_address
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn firmware_version(&self) -> &str {
        &self.firmware_version
    }

    pub fn fw_id(&self) -> &str {
        &self.fw_id
    }

    pub fn mac_bytes(&self) -> [u8; 6] {
        let mut bytes = [0u8; 6];
        for (i, byte) in bytes.iter_mut().enumerate() {
            // Validated as hex in `new`
            *byte = u8::from_str_radix(&self.mac_address[i * 2..i * 2 + 2], 16).unwrap_or(0);
        }
        bytes
    }

    pub fn mac_formatted(&self) -> String {
        self.mac_bytes()
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(":")
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// `Shelly.GetDeviceInfo` result document
    pub fn device_info(&self) -> Value {
        json!({
            "id": self.device_id,
            "mac": self.mac_address,
            "model": self.model,
            "gen": 2,
            "fw_id": self.fw_id,
            "ver": self.firmware_version,
            "app": "Pro3EM",
            "auth_en": false,
            "auth_domain": null,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_is_normalized() {
        let device = DeviceIdentity::new("my-meter", "Meter", "aa:bb:cc-dd:ee:ff").unwrap();
        assert_eq!(device.mac_address(), "AABBCCDDEEFF");
        assert_eq!(device.mac_bytes(), [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        assert_eq!(device.mac_formatted(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(device.device_id(), "my-meter");
    }

    #[test]
    fn test_invalid_mac_is_rejected() {
        assert!(DeviceIdentity::new("", "Meter", "AA:BB:CC").is_err());
        assert!(DeviceIdentity::new("", "Meter", "GG:BB:CC:DD:EE:FF").is_err());
        let err = DeviceIdentity::new("", "Meter", "1234").unwrap_err();
        assert_eq!(err.to_string(), "Invalid MAC address: 1234");
    }

    #[test]
    fn test_device_id_derived_from_mac() {
        let device = DeviceIdentity::new(DEFAULT_DEVICE_ID, "Meter", "00:11:22:A3:B4:C5").unwrap();
        assert_eq!(device.device_id(), "shellypro3em-a3b4c5");

        let device = DeviceIdentity::new("", "Meter", "00:11:22:A3:B4:C5").unwrap();
        assert_eq!(device.device_id(), "shellypro3em-a3b4c5");
    }

    #[test]
    fn test_device_info_document() {
        let device = DeviceIdentity::new("", "Meter", "AABBCCDDEEFF").unwrap();
        let info = device.device_info();
        assert_eq!(info["id"], "shellypro3em-ddeeff");
        assert_eq!(info["mac"], "AABBCCDDEEFF");
        assert_eq!(info["model"], "SPEM-003CEBEU");
        assert_eq!(info["gen"], 2);
        assert_eq!(info["app"], "Pro3EM");
        assert_eq!(info["auth_en"], false);
        assert!(info["auth_domain"].is_null());
    }
}
