use serde::Deserialize;

/// Relay configuration, loaded from a TOML file.
#[derive(Debug, Deserialize)]
pub struct RelayConfig {
    /// IP address to bind on (default "0.0.0.0").
    #[serde(default = "default_host")]
    pub host: String,

    /// TCP port clients connect to.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum concurrent peers.
    #[serde(default = "default_max_users")]
    pub max_users: u32,
}

fn default_host() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    9987
}

fn default_max_users() -> u32 {
    64
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_users: default_max_users(),
        }
    }
}
