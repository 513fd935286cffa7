use std::path::{Path, PathBuf};

use serde::Deserialize;

use canvaslink_protocol::DEFAULT_PORT;

#[derive(Deserialize, Debug, Clone)]
pub struct RelayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

impl RelayConfig {
    /// Load from a TOML config file, falling back to defaults when the file
    /// does not exist.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path(),
        };
        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)?;
            Ok(toml::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn config_path() -> PathBuf {
        if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
            PathBuf::from(config_dir).join("canvaslink").join("relay.toml")
        } else if let Ok(home) = std::env::var("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("canvaslink")
                .join("relay.toml")
        } else {
            PathBuf::from("/tmp/canvaslink/relay.toml")
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self { port: default_port() }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
