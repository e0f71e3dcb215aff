//! Shelly Pro 3EM Emulation Library
//!
//! Presents a Home Assistant DSMR smart meter as a Shelly Pro 3EM energy meter.
//! A background refresh cycle keeps one meter snapshot up to date, and every
//! protocol surface (Modbus TCP, UDP JSON-RPC, HTTP/WebSocket) renders its
//! answers from that snapshot.

pub mod config;
pub mod device;
pub mod discovery;
pub mod entities;
pub mod error;
pub mod home_assistant;
pub mod http_server;
pub mod meter_cache;
pub mod meter_data;
pub mod modbus_server;
pub mod register_map;
pub mod status;
pub mod udp_server;

// Re-export commonly used types for easier access
pub use config::Settings;
pub use device::DeviceIdentity;
pub use error::{EmulatorError, Result};
pub use home_assistant::HomeAssistantAPI;
pub use meter_cache::MeterCache;
pub use meter_data::{MeterSnapshot, Phase, PhaseReading};
pub use register_map::RegisterMap;
