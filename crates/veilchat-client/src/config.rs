use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ClientError;

/// Key exchange timing and retry budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// Fixed delay before re-requesting after a failed unwrap.
    pub retry_delay_ms: u64,
    /// Failed unwraps tolerated before a peer is abandoned.
    pub max_attempts: u8,
    /// Upper bound on identity key generation.
    pub keygen_timeout_secs: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: 1_000,
            max_attempts: 3,
            keygen_timeout_secs: 10,
        }
    }
}

impl ExchangeConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn keygen_timeout(&self) -> Duration {
        Duration::from_secs(self.keygen_timeout_secs)
    }
}

/// Client configuration, loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Relay address as `host:port` or `[v6]:port`.
    pub server: String,
    pub username: Option<String>,
    pub exchange: ExchangeConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:9987".into(),
            username: None,
            exchange: ExchangeConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, ClientError> {
        let config: Self = toml::from_str(text).map_err(|e| ClientError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ClientError> {
        match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    ClientError::Config(format!("failed to read {}: {e}", path.display()))
                })?;
                Self::from_toml(&text)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.exchange.max_attempts == 0 {
            return Err(ClientError::Config("exchange.max_attempts must be at least 1".into()));
        }
        if self.exchange.keygen_timeout_secs == 0 {
            return Err(ClientError::Config("exchange.keygen_timeout_secs must be positive".into()));
        }
        Ok(())
    }
}

/// Split a relay address into host and port.
pub fn parse_address(address: &str) -> Result<(String, u16), ClientError> {
    let invalid = |why: &str| ClientError::InvalidAddress(format!("{address}: {why}"));

    let (host, port_str) = if let Some(rest) = address.strip_prefix('[') {
        let (host, port) = rest
            .split_once("]:")
            .ok_or_else(|| invalid("expected [host]:port"))?;
        (host, port)
    } else {
        address
            .rsplit_once(':')
            .ok_or_else(|| invalid("expected host:port"))?
    };

    if host.is_empty() {
        return Err(invalid("host cannot be empty"));
    }
    let port: u16 = port_str.parse().map_err(|_| invalid("invalid port number"))?;
    Ok((host.to_string(), port))
}
