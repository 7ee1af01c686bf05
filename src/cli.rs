//! Command-line options for the amqpd daemon

use clap::Parser;
use std::path::PathBuf;

use crate::config::ServerConfig;

/// AMQP 1.0 connection establishment daemon
#[derive(Clone, Debug, Parser)]
#[command(name = "amqpd", version)]
pub struct DaemonOpts {
    /// Bind address (host:port), overrides the config file
    #[arg(long)]
    pub bind: Option<String>,

    /// TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Per-operation negotiation timeout in milliseconds (0 disables)
    #[arg(long)]
    pub connect_timeout_ms: Option<u64>,

    /// Largest frame accepted from peers
    #[arg(long)]
    pub max_frame_size: Option<u32>,

    /// Container id sent in OPEN (default: random UUID)
    #[arg(long)]
    pub container_id: Option<String>,

    /// Log filter, e.g. "info" or "amqpd=debug" (default: $AMQPD_LOG, then "info")
    #[arg(long)]
    pub log_level: Option<String>,
}

impl DaemonOpts {
    /// Apply command-line overrides on top of a loaded configuration.
    pub fn apply(&self, cfg: &mut ServerConfig) {
        if let Some(bind) = &self.bind {
            cfg.bind = bind.clone();
        }
        if let Some(ms) = self.connect_timeout_ms {
            cfg.connect_timeout_ms = ms;
        }
        if let Some(size) = self.max_frame_size {
            cfg.max_frame_size = size;
        }
        if let Some(id) = &self.container_id {
            cfg.container_id = Some(id.clone());
        }
    }
}
