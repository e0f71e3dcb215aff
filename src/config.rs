use crate::entities::{
    EntityMapping, PowerLayout, SinglePhaseEntities, ThreePhaseEntities, TotalsEntities,
};
use crate::error::{EmulatorError, Result};
use serde_derive::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub device_id: String,
    pub device_name: String,
    pub mac_address: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: crate::device::DEFAULT_DEVICE_ID.to_string(),
            device_name: "Shelly Pro 3EM Emulator".to_string(),
            mac_address: "AA:BB:CC:DD:EE:FF".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModbusServerConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
}

impl Default for ModbusServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 502,
            unit_id: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpServerConfig {
    pub enabled: bool,
    pub host: String,
    pub ports: Vec<u16>,
}

impl Default for UdpServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            ports: vec![1010, 2220, 22222],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpServerConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "0.0.0.0".to_string(),
            port: 80,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServersConfig {
    pub modbus: ModbusServerConfig,
    pub udp: UdpServerConfig,
    pub http: HttpServerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HomeAssistantConfig {
    pub url: String,
    pub token: String,
    pub use_https: bool,
    pub verify_ssl: bool,
    /// Seconds between refresh cycles
    pub poll_interval: f64,
    /// Request timeout in seconds
    pub timeout: f64,
}

impl Default for HomeAssistantConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8123".to_string(),
            token: String::new(),
            use_https: false,
            verify_ssl: true,
            poll_interval: 2.0,
            timeout: 10.0,
        }
    }
}

/// Mapping of DSMR smart meter entities in Home Assistant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DsmrConfig {
    pub auto_discover: bool,
    pub single_phase: Option<SinglePhaseEntities>,
    pub three_phase: Option<ThreePhaseEntities>,
    pub totals: TotalsEntities,
}

impl Default for DsmrConfig {
    fn default() -> Self {
        Self {
            auto_discover: true,
            single_phase: None,
            three_phase: None,
            totals: TotalsEntities::default(),
        }
    }
}

impl DsmrConfig {
    /// The manually configured entities. Three phase wins when both are given.
    pub fn manual_mapping(&self) -> EntityMapping {
        let layout = match (&self.three_phase, &self.single_phase) {
            (Some(three), _) => PowerLayout::ThreePhase(three.clone()),
            (None, Some(single)) => PowerLayout::SinglePhase(single.clone()),
            (None, None) => PowerLayout::SinglePhase(SinglePhaseEntities::default()),
        };
        EntityMapping {
            layout,
            totals: self.totals.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub device: DeviceConfig,
    pub servers: ServersConfig,
    pub homeassistant: HomeAssistantConfig,
    pub dsmr: DsmrConfig,
    pub logging: LoggingConfig,
}

const DEFAULT_CONFIG_PATH: &str = "config/config.yaml";

impl Settings {
    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    /// Loads settings from the first config file found, falling back to
    /// defaults, then applies the `HA_URL` / `HA_TOKEN` overrides.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut settings = match Self::find_config_file(config_path) {
            Some(path) => {
                info!(path = %path.display(), "Loading config file");
                let text =
                    std::fs::read_to_string(&path).map_err(|source| EmulatorError::ConfigRead {
                        path: path.display().to_string(),
                        source,
                    })?;
                Self::from_yaml(&text)?
            }
            None => {
                info!("No config file found, using defaults");
                Self::default()
            }
        };
        settings.apply_env_overrides();
        Ok(settings)
    }

    fn find_config_file(config_path: Option<&Path>) -> Option<PathBuf> {
        let requested = config_path
            .map(Path::to_path_buf)
            .or_else(|| env::var("CONFIG_PATH").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        [requested, PathBuf::from("config.yaml")]
            .into_iter()
            .find(|p| p.exists())
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = env::var("HA_URL") {
            if !url.is_empty() {
                self.homeassistant.url = url;
            }
        }
        if let Ok(token) = env::var("HA_TOKEN") {
            if !token.is_empty() {
                self.homeassistant.token = token;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_gives_defaults() {
        let settings = Settings::from_yaml("").unwrap();
        assert_eq!(settings, Settings::default());
        assert!(settings.servers.modbus.enabled);
        assert_eq!(settings.servers.modbus.port, 502);
        assert_eq!(settings.servers.udp.ports, vec![1010, 2220, 22222]);
        assert!(!settings.servers.http.enabled);
        assert_eq!(settings.homeassistant.poll_interval, 2.0);
        assert!(settings.dsmr.auto_discover);
    }

    #[test]
    fn test_partial_config() {
        let settings = Settings::from_yaml(
            r#"
device:
  device_name: "Garage meter"
  mac_address: "00:11:22:33:44:55"
servers:
  http:
    enabled: true
    port: 8080
homeassistant:
  url: "http://ha.local:8123"
  token: "abc"
  poll_interval: 5
dsmr:
  auto_discover: false
  three_phase:
    phase_a:
      power: sensor.power_delivered_l1
      power_returned: sensor.power_returned_l1
    phase_b:
      power: sensor.power_delivered_l2
  totals:
    energy_delivered_tariff_1: sensor.energy_delivered_tariff_1
"#,
        )
        .unwrap();

        assert_eq!(settings.device.device_name, "Garage meter");
        assert_eq!(settings.device.device_id, "shellypro3em-emulator");
        assert!(settings.servers.http.enabled);
        assert_eq!(settings.servers.http.port, 8080);
        assert_eq!(settings.servers.http.host, "0.0.0.0");
        assert_eq!(settings.homeassistant.poll_interval, 5.0);
        assert_eq!(settings.homeassistant.timeout, 10.0);
        assert!(!settings.dsmr.auto_discover);

        let mapping = settings.dsmr.manual_mapping();
        assert!(mapping.is_three_phase());
        assert!(mapping.has_power_entity());
        match mapping.layout {
            PowerLayout::ThreePhase(three) => {
                assert_eq!(three.phase_a.power_returned, "sensor.power_returned_l1");
                assert_eq!(three.phase_b.power, "sensor.power_delivered_l2");
                assert!(three.phase_c.power.is_empty());
            }
            PowerLayout::SinglePhase(_) => panic!("Expected three phase layout"),
        }
        assert_eq!(
            mapping.totals.energy_delivered_tariff_1,
            "sensor.energy_delivered_tariff_1"
        );
    }

    #[test]
    fn test_single_phase_mapping() {
        let settings = Settings::from_yaml(
            r#"
dsmr:
  single_phase:
    power: sensor.power_consumption
"#,
        )
        .unwrap();
        let mapping = settings.dsmr.manual_mapping();
        assert!(!mapping.is_three_phase());
        assert!(mapping.has_power_entity());
    }

    #[test]
    fn test_invalid_yaml_is_error() {
        assert!(Settings::from_yaml("servers: [1, 2").is_err());
    }
}
