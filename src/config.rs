use std::fs;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::network::Tuning;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not read config file: {0}")]
    ReadFile(#[from] std::io::Error),
    #[error("Could not parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase", default)]
pub struct Settings {
    pub interface: InterfaceSettings,
    pub log: LogSettings,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase", default)]
pub struct InterfaceSettings {
    pub pport: u16,
    pub bport: u16,
    pub heartbeat_ttl_secs: u64,
    pub dial_timeout_secs: u64,
    pub send_queue: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase", default)]
pub struct LogSettings {
    pub level: String,
    pub log_path: String,
    pub log_to_std: bool,
}

impl Default for InterfaceSettings {
    fn default() -> Self {
        Self {
            pport: 1080,
            bport: 4884,
            heartbeat_ttl_secs: 8,
            dial_timeout_secs: 4,
            send_queue: 256,
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_path: String::new(),
            log_to_std: true,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            interface: InterfaceSettings::default(),
            log: LogSettings::default(),
        }
    }
}

impl Settings {
    /// Loads settings from a TOML file. A missing file yields the
    /// defaults; CLI flags override either way.
    pub fn load(path: &str) -> Result<Settings, ConfigError> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(toml::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Settings::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn tuning(&self) -> Tuning {
        Tuning {
            heartbeat_ttl: Duration::from_secs(self.interface.heartbeat_ttl_secs),
            dial_timeout: Duration::from_secs(self.interface.dial_timeout_secs),
            send_queue: self.interface.send_queue,
        }
    }
}

pub const SAMPLE_CONFIG: &str = r#"
# booster config
[Interface]
# SOCKS5 proxy port
Pport = 1080
# control-plane port
Bport = 4884
# heartbeat cadence; a link times out after twice this
HeartbeatTtlSecs = 8
DialTimeoutSecs = 4
SendQueue = 256

[Log]
Level = "info"
# empty: no log file
LogPath = ""
LogToStd = true
"#;
