use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tally_settings::{LogFormat, TallySettings};
use tally_telemetry::TelemetryConfig;

/// Real-time planning poker server.
#[derive(Debug, Parser)]
#[command(name = "tally", version)]
struct Cli {
    /// JSON settings file, deep-merged over defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen port (overrides file and PORT).
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address (overrides file and HOST).
    #[arg(long)]
    host: Option<String>,
}

impl Cli {
    fn apply(&self, settings: &mut TallySettings) {
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(host) = &self.host {
            settings.server.host = host.clone();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings =
        tally_settings::load_settings(cli.config.as_deref()).context("failed to load settings")?;
    cli.apply(&mut settings);

    let telemetry = TelemetryConfig::from_level(
        &settings.logging.level,
        settings.logging.format == LogFormat::Json,
    )?;
    tally_telemetry::init_telemetry(&telemetry)?;

    tracing::info!(
        address = %settings.server.address(),
        development = settings.development,
        "starting tally server"
    );

    let handle = tally_server::start(tally_server::ServerConfig::from(&settings.server))
        .await
        .context("failed to start server")?;

    tracing::info!(port = handle.port(), "tally server ready");

    shutdown_signal().await?;

    tracing::info!(sessions = handle.registry().len(), "shutting down");
    handle.shutdown().await;
    Ok(())
}

/// Resolve on ctrl-c, or on SIGTERM where the platform has it.
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate =
            signal(SignalKind::terminate()).context("failed to listen for SIGTERM")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res.context("failed to listen for ctrl+c")?,
            _ = terminate.recv() => tracing::info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;
    Ok(())
}
