//! CLI entry point for the traffic streamer.
//!
//! `serve` loops a traffic video through detection, congestion estimation
//! and the adaptive signal, and streams the annotated result over HTTP.
//! `check-config` resolves and validates the configuration without serving.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    filter::LevelFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use traffic_streamer::config::{Config, ConfigOverrides};
use traffic_streamer::hub::{Hub, HubOptions};
use traffic_streamer::pipeline::Producer;
use traffic_streamer::server::{self, AppState};
use traffic_streamer::stats::PipelineStats;
use traffic_streamer::telemetry;

#[derive(Parser)]
#[command(name = "traffic_streamer")]
#[command(about = "Adaptive traffic-signal demo streaming annotated video", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline and serve the stream until Ctrl+C
    Serve {
        /// JSON config file
        #[arg(short, long, env = "TRAFFIC_CONFIG")]
        config: Option<PathBuf>,

        #[command(flatten)]
        overrides: ConfigOverrides,
    },
    /// Load, validate and print the resolved configuration
    CheckConfig {
        /// JSON config file
        #[arg(short, long, env = "TRAFFIC_CONFIG")]
        config: Option<PathBuf>,

        #[command(flatten)]
        overrides: ConfigOverrides,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path = std::env::var("LOG_FILE_PATH")
        .unwrap_or_else(|_| "logs/traffic_streamer.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("traffic_streamer.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(env_filter("RUST_LOG", LevelFilter::INFO));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(env_filter("RUST_LOG_JSON", LevelFilter::DEBUG));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, overrides } => {
            let config = resolve_config(config.as_deref(), &overrides)?;
            serve(config).await?;
        }
        Commands::CheckConfig { config, overrides } => {
            let config = resolve_config(config.as_deref(), &overrides)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            info!("Configuration is valid");
        }
    }

    Ok(())
}

fn env_filter(var: &str, default: LevelFilter) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(default.into())
        .with_env_var(var)
        .from_env_lossy()
}

/// File (if any), then overrides, then validation.
fn resolve_config(path: Option<&Path>, overrides: &ConfigOverrides) -> Result<Config> {
    let mut config = Config::load_or_default(path)?;
    overrides.apply(&mut config);
    config.validate()?;
    Ok(config)
}

#[tracing::instrument(skip_all, fields(bind = %config.server.bind))]
async fn serve(config: Config) -> Result<()> {
    telemetry::init_metrics_recorder();

    let hub = Hub::new(HubOptions {
        push_backlog: config.hub.push_backlog,
        cycle_period: config.cycle_period(),
    });
    let stats = Arc::new(PipelineStats::default());

    let producer = Producer::spawn(config.clone(), hub.clone(), stats.clone())
        .await
        .context("Pipeline failed to start")?;

    let listener = match server::bind(config.bind_addr()?).await {
        Ok(listener) => listener,
        Err(err) => {
            producer.stop().await;
            return Err(err);
        }
    };

    let shutdown_hub = hub.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Ctrl+C received, shutting down"),
            Err(err) => warn!(error = %err, "Failed to listen for Ctrl+C; shutting down"),
        }
        shutdown_hub.shutdown();
    });

    let served = server::serve(listener, AppState::new(hub.clone(), stats.clone())).await;
    if let Err(err) = &served {
        error!(error = %err, "Server exited with error");
        hub.shutdown();
    }

    producer.stop().await;
    info!(stats = ?stats.snapshot(), "Shutdown complete");
    served
}
