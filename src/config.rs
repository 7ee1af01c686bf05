//! Daemon configuration file.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::codec::Value;
use crate::incoming::ConnectionConfig;
use crate::protocol::{timeouts, DEFAULT_MAX_FRAME_SIZE};
use crate::sasl::{SaslRegistry, ANONYMOUS};
use crate::server::Server;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,               // host:port
    pub connect_timeout_ms: u64,    // 0 = no per-operation deadline
    pub negotiation_timeout_ms: u64,
    pub container_id: Option<String>, // random UUID when unset
    pub max_frame_size: u32,
    pub mechanisms: Vec<String>,
    pub groups: Vec<String>,
    pub properties: BTreeMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: "0.0.0.0:5672".to_string(),
            connect_timeout_ms: timeouts::CONNECT_MS,
            negotiation_timeout_ms: timeouts::NEGOTIATION_MS,
            container_id: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            mechanisms: vec![ANONYMOUS.to_string()],
            groups: Vec::new(),
            properties: BTreeMap::new(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let cfg: ServerConfig = toml::from_str(&data)
            .with_context(|| format!("parse config {}", path.display()))?;
        Ok(cfg)
    }

    /// Split `bind` into host and port.
    pub fn bind_addr(&self) -> Result<(String, u16)> {
        let (host, port) = self
            .bind
            .rsplit_once(':')
            .with_context(|| format!("bind address {:?} has no port", self.bind))?;
        let port = port
            .parse()
            .with_context(|| format!("invalid port in bind address {:?}", self.bind))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        Ok((host.to_string(), port))
    }

    pub fn connection_config(&self) -> Result<ConnectionConfig> {
        let mechanisms =
            SaslRegistry::from_names(self.mechanisms.as_slice()).map_err(anyhow::Error::msg)?;
        let mut cfg = ConnectionConfig::new()
            .with_connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .with_max_frame_size(self.max_frame_size)
            .with_groups(self.groups.clone())
            .with_mechanisms(mechanisms);
        if let Some(id) = &self.container_id {
            cfg = cfg.with_container_id(id.clone());
        }
        for (k, v) in &self.properties {
            cfg = cfg.with_property(k.clone(), Value::string(v.as_str()));
        }
        Ok(cfg)
    }

    pub fn server(&self) -> Result<Server> {
        Ok(Server::new(self.connection_config()?)
            .with_negotiation_timeout(Duration::from_millis(self.negotiation_timeout_ms)))
    }
}
