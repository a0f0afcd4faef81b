//! Runtime configuration.
//!
//! Loaded from the YAML file named by `SWITCHYARD_CONFIG` when set, falling
//! back to defaults. `LISTEN` overrides the listen addresses (comma
//! separated) either way.

use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::client::ClientSettings;
use crate::http::connection::ServerSettings;
use crate::http::framer::FramingLimits;
use crate::server::datagram::DatagramSettings;

pub const CONFIG_ENV: &str = "SWITCHYARD_CONFIG";
pub const LISTEN_ENV: &str = "LISTEN";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub framing: FramingConfig,
    pub client: ClientConfig,
    pub datagram: DatagramConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: Vec<String>,
    pub read_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: vec!["127.0.0.1:8080".to_string()],
            read_timeout_ms: 30_000,
            idle_timeout_ms: 60_000,
            shutdown_grace_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FramingConfig {
    pub max_header_bytes: usize,
    pub max_chunk_line_bytes: usize,
    pub max_chunk_size: usize,
    pub max_body_bytes: usize,
}

impl Default for FramingConfig {
    fn default() -> Self {
        let limits = FramingLimits::default();
        Self {
            max_header_bytes: limits.max_header_bytes,
            max_chunk_line_bytes: limits.max_chunk_line_bytes,
            max_chunk_size: limits.max_chunk_size,
            max_body_bytes: limits.max_body_bytes,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub max_retries: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            read_timeout_ms: 30_000,
            max_retries: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatagramConfig {
    /// Receiver is only started when an address is given.
    pub bind: Option<String>,
    pub buffer_size: usize,
    pub receive_timeout_ms: u64,
}

impl Default for DatagramConfig {
    fn default() -> Self {
        Self {
            bind: None,
            buffer_size: 65_535,
            receive_timeout_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Bearer tokens accepted on routes that require authentication.
    pub tokens: Vec<String>,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let mut cfg = match std::env::var(CONFIG_ENV) {
            Ok(path) => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read config file {path}"))?;
                Self::from_yaml(&raw).with_context(|| format!("invalid config file {path}"))?
            }
            Err(_) => Self::default(),
        };

        if let Ok(listen) = std::env::var(LISTEN_ENV) {
            let addrs: Vec<String> = listen
                .split(',')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(String::from)
                .collect();
            if !addrs.is_empty() {
                cfg.server.listen = addrs;
            }
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml(raw: &str) -> anyhow::Result<Self> {
        let cfg: Config = serde_yaml::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.server.listen.is_empty() {
            anyhow::bail!("server.listen must name at least one address");
        }
        if self.framing.max_header_bytes == 0 || self.framing.max_chunk_line_bytes == 0 {
            anyhow::bail!("framing limits must be positive");
        }
        if self.datagram.buffer_size == 0 {
            anyhow::bail!("datagram.buffer_size must be positive");
        }
        Ok(())
    }

    pub fn framing_limits(&self) -> FramingLimits {
        FramingLimits {
            max_header_bytes: self.framing.max_header_bytes,
            max_chunk_line_bytes: self.framing.max_chunk_line_bytes,
            max_chunk_size: self.framing.max_chunk_size,
            max_body_bytes: self.framing.max_body_bytes,
        }
    }

    pub fn server_settings(&self) -> ServerSettings {
        ServerSettings {
            read_timeout: Duration::from_millis(self.server.read_timeout_ms),
            idle_timeout: Duration::from_millis(self.server.idle_timeout_ms),
            shutdown_grace: Duration::from_millis(self.server.shutdown_grace_ms),
            limits: self.framing_limits(),
        }
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            connect_timeout: Duration::from_millis(self.client.connect_timeout_ms),
            read_timeout: Duration::from_millis(self.client.read_timeout_ms),
            max_retries: self.client.max_retries,
            limits: self.framing_limits(),
        }
    }

    pub fn datagram_settings(&self) -> DatagramSettings {
        DatagramSettings {
            buffer_size: self.datagram.buffer_size,
            receive_timeout: Duration::from_millis(self.datagram.receive_timeout_ms),
        }
    }
}
