use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmulatorError {
    #[error("Invalid MAC address: {0}")]
    InvalidMacAddress(String),

    #[error("Failed to read config file {path}: {source}")]
    ConfigRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    #[error("No Home Assistant connection")]
    NoUpstream,

    #[error("Home Assistant request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T, E = EmulatorError> = std::result::Result<T, E>;
