use crate::config::HomeAssistantConfig;
use crate::error::{EmulatorError, Result};
use async_trait::async_trait;
use serde_derive::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// A numeric reading taken from the upstream source.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityReading {
    /// Value converted to base units (W, Wh)
    pub value: f64,
    pub raw_value: f64,
    pub unit: Option<String>,
    /// Opaque upstream timestamp, only ever compared for equality
    pub last_updated: Option<String>,
}

/// Where the meter cache pulls its raw numbers from.
#[async_trait]
pub trait ReadingSource: Send + Sync {
    /// Returns `None` when the entity is unknown, unavailable or not numeric.
    async fn read_entity(&self, entity_id: &str) -> Option<EntityReading>;

    async fn read_value(&self, entity_id: &str) -> Option<f64> {
        if entity_id.is_empty() {
            return None;
        }
        self.read_entity(entity_id).await.map(|r| r.value)
    }

    /// Whether the last request reached the upstream server.
    fn is_connected(&self) -> bool;
}

/// Multiplier taking a Home Assistant unit to W or Wh
fn unit_factor(unit: &str) -> Option<f64> {
    match unit {
        "kW" | "kWh" => Some(1_000.0),
        "MW" | "MWh" => Some(1_000_000.0),
        _ => None,
    }
}

pub struct HomeAssistantAPI {
    endpoint_url: String,
    auth_token: String,
    client: reqwest::Client,
    connected: AtomicBool,
}

impl HomeAssistantAPI {
    pub fn new(config: &HomeAssistantConfig) -> Result<Self> {
        let mut endpoint_url = config.url.trim_end_matches('/').to_string();
        if config.use_https {
            if let Some(rest) = endpoint_url.strip_prefix("http://") {
                endpoint_url = format!("https://{rest}");
            }
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(config.timeout))
            .danger_accept_invalid_certs(!config.verify_ssl)
            .build()?;
        Ok(Self {
            endpoint_url,
            auth_token: config.token.clone(),
            client,
            connected: AtomicBool::new(false),
        })
    }

    pub fn endpoint_url(&self) -> &str {
        &self.endpoint_url
    }

    pub async fn read_sensor_value(&self, sensor_path: &str) -> Result<HASensor> {
        self.get_json(&format!("{}/api/states/{}", self.endpoint_url, sensor_path))
            .await
    }

    /// Every entity state known to Home Assistant
    pub async fn read_all_states(&self) -> Result<Vec<HASensor>> {
        self.get_json(&format!("{}/api/states", self.endpoint_url))
            .await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        if self.endpoint_url.is_empty() {
            return Err(EmulatorError::NoUpstream);
        }
        let response = match self
            .client
            .get(url)
            .bearer_auth(&self.auth_token)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                self.connected.store(false, Ordering::Relaxed);
                return Err(e.into());
            }
        };
        // The server answered, even if it was an error status
        self.connected.store(true, Ordering::Relaxed);
        Ok(response.error_for_status()?.json().await?)
    }
}

#[async_trait]
impl ReadingSource for HomeAssistantAPI {
    async fn read_entity(&self, entity_id: &str) -> Option<EntityReading> {
        if entity_id.is_empty() {
            return None;
        }
        let sensor = match self.read_sensor_value(entity_id).await {
            Ok(sensor) => sensor,
            Err(e) => {
                warn!(entity_id, error = %e, "Failed to read entity");
                return None;
            }
        };
        let reading = sensor.to_reading();
        if reading.is_none() {
            debug!(entity_id, state = %sensor.state, "Entity has no numeric value");
        }
        reading
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HASensor {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub last_changed: Option<String>,
    #[serde(default)]
    pub last_updated: Option<String>,
}

impl HASensor {
    pub fn unit(&self) -> Option<&str> {
        self.attributes
            .get("unit_of_measurement")
            .and_then(|u| u.as_str())
    }

    /// Numeric value in base units, `None` for unavailable or unparsable states.
    pub fn to_reading(&self) -> Option<EntityReading> {
        if matches!(self.state.as_str(), "unavailable" | "unknown" | "") {
            return None;
        }
        let raw_value: f64 = self.state.trim().parse().ok()?;
        let unit = self.unit().map(str::to_string);
        let value = match unit.as_deref().and_then(unit_factor) {
            Some(factor) => raw_value * factor,
            None => raw_value,
        };
        Some(EntityReading {
            value,
            raw_value,
            unit,
            last_updated: self.last_updated.clone(),
        })
    }
}
