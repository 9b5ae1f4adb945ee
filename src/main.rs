use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::Level;
use vocalink_server::coordinator::{Coordinator, ServerIdentity};
use vocalink_server::discovery::{MdnsAdvertiser, NoopAdvertiser, ServiceAdvertiser};
use vocalink_server::identity::{detect_local_ip, random_server_name};
use vocalink_server::settings::{self, LoadedSettings, Settings};
use vocalink_telemetry::{init_telemetry, LogFormat, TelemetryConfig};

/// LAN coordinator for recording devices and their dashboard.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Settings file (defaults to ~/.vocalink/settings.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (0 picks a free port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Advertised server name
    #[arg(short, long)]
    name: Option<String>,

    /// Advertised LAN address
    #[arg(long)]
    ip: Option<String>,

    /// Do not publish an mDNS record
    #[arg(long)]
    no_advertise: bool,

    /// trace, debug, info, warn or error
    #[arg(long)]
    log_level: Option<String>,

    /// pretty or json
    #[arg(long)]
    log_format: Option<LogFormat>,
}

impl Cli {
    fn apply(self, settings: &mut Settings) {
        if let Some(host) = self.host {
            settings.host = host;
        }
        if let Some(port) = self.port {
            settings.port = port;
        }
        if self.name.is_some() {
            settings.name = self.name;
        }
        if self.ip.is_some() {
            settings.ip = self.ip;
        }
        if self.no_advertise {
            settings.advertise = false;
        }
        if let Some(level) = self.log_level {
            settings.log_level = level;
        }
        if let Some(format) = self.log_format {
            settings.log_format = format;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let LoadedSettings { mut settings, ignored } = match &cli.config {
        Some(path) => settings::load_settings_from_path(path),
        None => settings::load_settings(),
    }
    .context("failed to load settings")?;
    cli.apply(&mut settings);

    let log_level = settings.parsed_log_level();
    let _telemetry = init_telemetry(TelemetryConfig {
        log_level: log_level.unwrap_or(Level::INFO),
        module_levels: vec![("mdns_sd".to_string(), Level::WARN)],
        format: settings.log_format,
    })
    .context("failed to initialize logging")?;

    if let Err(raw) = log_level {
        tracing::warn!(value = raw, "unknown log level, using info");
    }
    for entry in &ignored {
        tracing::warn!(key = entry.key, value = %entry.value, "invalid environment override, ignoring");
    }

    let server_config = settings.server_config();
    let listener = vocalink_server::bind(&server_config)
        .await
        .with_context(|| format!("failed to bind {}:{}", server_config.host, server_config.port))?;
    let port = listener.local_addr().context("listener has no local address")?.port();

    let name = settings
        .name
        .clone()
        .and_then(|n| vocalink_core::session::validate_name(&n).ok())
        .unwrap_or_else(random_server_name);
    let ip = settings.ip.clone().unwrap_or_else(|| detect_local_ip().to_string());

    let advertiser: Arc<dyn ServiceAdvertiser> = if settings.advertise {
        match MdnsAdvertiser::new() {
            Ok(mdns) => Arc::new(mdns),
            Err(e) => {
                tracing::warn!(error = %e, "mDNS unavailable, continuing without discovery");
                Arc::new(NoopAdvertiser)
            }
        }
    } else {
        Arc::new(NoopAdvertiser)
    };

    let coordinator = Arc::new(Coordinator::new(ServerIdentity { name, ip, port }, advertiser));
    let handle = vocalink_server::serve(listener, Arc::clone(&coordinator), server_config)
        .context("failed to start server")?;

    // Failure is logged by the coordinator; serving continues without discovery.
    let _ = coordinator.start_advertising();

    let info = coordinator.server_info();
    tracing::info!(name = %info.name, ip = %info.ip, port, "vocalink ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    coordinator.shutdown();
    handle.shutdown().await;
    Ok(())
}
