// Circuit Script HTTP API
// This module projects the engine operations onto a small REST surface

//! # HTTP API
//!
//! | Endpoint | Method | Engine operation |
//! |---|---|---|
//! | `/circuits` | POST | `register_definition` (201) |
//! | `/circuits` | GET | `list_circuits` |
//! | `/circuits/:name/execute` | POST | `execute` |
//! | `/events` | POST | `dispatch` |
//! | `/executions` | GET | `history` |
//! | `/health` | GET | status probe |
//! | `/metrics` | GET | Prometheus exposition |
//!
//! Run failures are not HTTP failures: `/events` and `/execute` answer 200
//! with the record list and the outcome lives in each record's `status`.

pub mod auth;
pub mod handlers;
pub mod types;

#[cfg(test)]
mod handlers_tests;

use axum::{
    routing::{get, post},
    Router,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use auth::ApiAuth;
use handlers::{
    create_circuit, dispatch_event, execute_circuit, health_check, list_circuits,
    list_executions, metrics, not_found, ApiState,
};
use crate::config::{AppConfig, AuthMode};
use crate::engine::{CircuitEngine, CircuitMetrics};
use crate::models::Principal;
use crate::{CircuitError, Result};

/// HTTP server configuration
#[derive(Clone, Debug)]
pub struct CircuitApiConfig {
    pub port: u16,
    pub host: String,
    pub cors_enabled: bool,
    pub auth_mode: AuthMode,
    pub api_keys: HashMap<String, Principal>,
}

impl Default for CircuitApiConfig {
    fn default() -> Self {
        Self {
            port: 4000,
            host: "0.0.0.0".to_string(),
            cors_enabled: true,
            auth_mode: AuthMode::None,
            api_keys: HashMap::new(),
        }
    }
}

impl CircuitApiConfig {
    pub fn from_app_config(config: &AppConfig) -> Result<Self> {
        Ok(Self {
            port: config.port,
            host: config.host.clone(),
            cors_enabled: config.cors_enabled,
            auth_mode: config.auth_mode,
            api_keys: config.api_keys()?,
        })
    }
}

/// Circuit Script API server
pub struct CircuitApiServer {
    config: CircuitApiConfig,
    state: ApiState,
}

impl CircuitApiServer {
    pub fn new(config: CircuitApiConfig, engine: CircuitEngine) -> Self {
        let mut state = ApiState::new(engine);
        state.auth = Arc::new(ApiAuth::new(config.auth_mode, config.api_keys.clone()));

        Self { config, state }
    }

    /// Serve `/metrics` from this registry
    pub fn with_metrics(mut self, metrics: CircuitMetrics) -> Self {
        self.state.metrics = Some(metrics);
        self
    }

    pub fn create_router(&self) -> Router {
        let api_router = Router::new()
            .route("/circuits", post(create_circuit).get(list_circuits))
            .route("/circuits/:name/execute", post(execute_circuit))
            .route("/events", post(dispatch_event))
            .route("/executions", get(list_executions))
            .route("/health", get(health_check))
            .route("/metrics", get(metrics))
            .fallback(not_found)
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http());

        if self.config.cors_enabled {
            api_router.layer(CorsLayer::permissive())
        } else {
            api_router
        }
    }

    pub async fn run(self) -> Result<()> {
        let app = self.create_router();
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|e| CircuitError::Config(format!("invalid bind address: {}", e)))?;

        info!("Circuit Script API server starting");
        info!("Server address: http://{}", addr);
        info!("   POST http://{}/circuits", addr);
        info!("   POST http://{}/events", addr);
        info!("   GET  http://{}/executions", addr);
        info!("CORS enabled: {}", self.config.cors_enabled);
        info!("Auth mode: {:?}", self.config.auth_mode);

        axum::Server::bind(&addr)
            .serve(app.into_make_service())
            .await
            .map_err(|e| CircuitError::Internal(format!("server error: {}", e)))
    }
}

/// Builder pattern for the API server
pub struct CircuitApiServerBuilder {
    config: CircuitApiConfig,
    engine: CircuitEngine,
    metrics: Option<CircuitMetrics>,
}

impl CircuitApiServerBuilder {
    pub fn new(engine: CircuitEngine) -> Self {
        Self {
            config: CircuitApiConfig::default(),
            engine,
            metrics: None,
        }
    }

    pub fn with_config(mut self, config: CircuitApiConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn with_cors(mut self, enabled: bool) -> Self {
        self.config.cors_enabled = enabled;
        self
    }

    pub fn with_api_keys(mut self, keys: HashMap<String, Principal>) -> Self {
        self.config.auth_mode = AuthMode::ApiKey;
        self.config.api_keys = keys;
        self
    }

    pub fn with_metrics(mut self, metrics: CircuitMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> CircuitApiServer {
        let server = CircuitApiServer::new(self.config, self.engine);
        match self.metrics {
            Some(metrics) => server.with_metrics(metrics),
            None => server,
        }
    }
}
