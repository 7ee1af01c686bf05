use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use amqpd::cli::DaemonOpts;
use amqpd::config::ServerConfig;

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(l) => EnvFilter::new(l),
        None => EnvFilter::try_from_env("AMQPD_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();
    init_tracing(opts.log_level.as_deref());

    let mut cfg = match &opts.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    opts.apply(&mut cfg);

    let (host, port) = cfg.bind_addr()?;
    let server = cfg.server().context("invalid configuration")?;

    if host == "0.0.0.0" || host == "::" {
        tracing::warn!("binding to all interfaces");
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(async move {
        let handle = server
            .start(&host, port)
            .await
            .with_context(|| format!("bind {}:{}", host, port))?;

        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for ctrl-c")?;
        tracing::info!("shutdown requested");
        handle.stop().await;
        Ok(())
    })
}
