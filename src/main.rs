//! Fashion Serving - Main Entry Point
//!
//! Binds the HTTP port, loads the model in the background and serves
//! predictions once it is ready.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use fashion_serving::{
    config::{AppConfig, LoggingConfig, DEFAULT_CONFIG_PATH},
    metrics::MetricsReporter,
    models::ModelLoader,
    server::{self, AppState},
};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Fashion article classification server
#[derive(Parser, Debug)]
#[command(name = "fashion-serving")]
#[command(version)]
#[command(about = "HTTP inference server for the fashion classifier")]
struct Cli {
    /// Configuration file (optional, TOML)
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Host to bind to
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Model artifact location, overriding MODEL_URI
    #[arg(long)]
    model_uri: Option<String>,
}

fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("fashion_serving={}", config.level).parse()?)
        .add_directive("tower_http=info".parse()?);

    match config.format.as_str() {
        "pretty" => tracing_subscriber::fmt().with_env_filter(filter).init(),
        _ => tracing_subscriber::fmt()
            .json()
            .flatten_event(true)
            .with_env_filter(filter)
            .init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = AppConfig::load_from_path(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(uri) = cli.model_uri {
        config.model.location = Some(uri);
    }

    init_logging(&config.logging)?;

    info!("Fashion Serving v{}", env!("CARGO_PKG_VERSION"));
    info!(
        categories = ?config.categories,
        input = %format!(
            "{}x{} {:?}",
            config.preprocessing.width, config.preprocessing.height, config.preprocessing.color
        ),
        max_upload_bytes = config.server.max_upload_bytes,
        "Configuration loaded successfully"
    );

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    let exit_on_load_failure = config.server.exit_on_load_failure;
    let report_interval = config.metrics.report_interval_secs;
    let loader = ModelLoader::new(&config.model);
    let state = Arc::new(AppState::new(config));

    // Start metrics reporter
    let reporter = MetricsReporter::new(state.registry.clone(), report_interval);
    tokio::spawn(reporter.start());

    // Health and metrics are served while the model loads
    let server_task = tokio::spawn(server::serve(state.clone(), listener));

    if let Err(e) = server::initialize(&state, &loader).await {
        if exit_on_load_failure {
            return Err(e).context("Model failed to load");
        }
        error!("Continuing without a model; /predict will answer 503 until restart");
    }

    server_task.await.context("Server task panicked")??;
    Ok(())
}
