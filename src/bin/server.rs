// Circuit Script - HTTP Server
// Hosts the engine behind the REST API
// Run with: cargo run --bin server

//! # Circuit Script Server Binary
//!
//! Wires the library together into a running service:
//!
//! ```text
//! main()
//!   ↓ loads
//! AppConfig (defaults, circuit.toml, CIRCUIT_* env)
//!   ↓ builds
//! Collaborators → ActionCatalog → CircuitEngine (+ metrics and logging observers)
//!   ↓ serves via
//! CircuitApiServer (Axum)
//! ```
//!
//! Circuits are registered at runtime with `POST /circuits`; the admin CLI
//! wraps that call.
//!
//! ## Rust Learning Notes:
//!
//! ### anyhow at the Edge
//! The library returns its own typed `CircuitError`. A binary only needs to
//! report failures, so `main` returns `anyhow::Result` and attaches context
//! with `.context(...)` as errors bubble up.

use anyhow::{Context, Result};
use circuit_script::engine::{ActionCatalog, FanoutObserver, LoggingObserver};
use circuit_script::{AppConfig, CircuitApiConfig, CircuitApiServer, CircuitEngine, CircuitMetrics};
use dotenv::dotenv;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional; real deployments set the environment directly
    let dotenv_result = dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = dotenv_result {
        warn!("No .env file loaded: {}", e);
    }

    info!("Starting Circuit Script Server...");

    let config = AppConfig::load().context("loading configuration")?;
    let engine_config = config.engine_config();
    info!(
        max_parallel_circuits = engine_config.max_parallel_circuits,
        circuit_budget_ms = config.circuit_budget_ms,
        action_timeout_ms = config.action_timeout_ms,
        history_capacity = engine_config.history_capacity,
        "engine configuration"
    );

    let collaborators = config.collaborators().context("configuring collaborators")?;
    info!(slots = ?collaborators.configured(), "collaborators configured");
    let catalog = ActionCatalog::with_builtins(&collaborators);

    let mut observer = FanoutObserver::new().with(Arc::new(LoggingObserver));
    let metrics = if config.metrics_enabled {
        let metrics = CircuitMetrics::new().context("creating metrics registry")?;
        observer = observer.with(Arc::new(metrics.clone()));
        Some(metrics)
    } else {
        None
    };

    let engine = CircuitEngine::builder(engine_config)
        .with_catalog(Arc::new(catalog))
        .with_authorizer(config.authorizer().context("loading permissions")?)
        .with_observer(Arc::new(observer))
        .build();

    let api_config = CircuitApiConfig::from_app_config(&config).context("loading api keys")?;
    let mut server = CircuitApiServer::new(api_config, engine);
    if let Some(metrics) = metrics {
        server = server.with_metrics(metrics);
    }

    server.run().await.context("running API server")?;
    Ok(())
}
