use std::fs;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::proxy::CacheConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub core: CoreConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoreConfig {
    // core address: eg: 127.0.0.1:7070
    pub addr: String,

    // connect timeout between proxy and core
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u16,

    // a call without response after this long fails with a timeout
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    // heartbeat interval
    #[serde(default = "default_keep_alive_interval")]
    pub keep_alive_interval: u64,

    // connection is dropped once keepalive writes failed more often than this
    #[serde(default = "default_keep_alive_thresh")]
    pub keep_alive_thresh: u8,
}

fn default_connect_timeout_secs() -> u16 {
    5
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_keep_alive_interval() -> u64 {
    10
}

fn default_keep_alive_thresh() -> u8 {
    5
}

impl CoreConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            keep_alive_interval: default_keep_alive_interval(),
            keep_alive_thresh: default_keep_alive_thresh(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs as u64)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval.max(1))
    }
}

/// HTTP status server
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HttpConfig {
    // disabled when not set
    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default = "default_http_bind")]
    pub bind: String,
}

fn default_http_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: None,
            bind: default_http_bind(),
        }
    }
}

pub fn load(path: &str) -> anyhow::Result<Config> {
    let content = fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content)?;
    Ok(config)
}
