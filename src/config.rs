// Application configuration - defaults, optional file, environment

//! # Configuration
//!
//! [`AppConfig`] is assembled in layers with the `config` crate, later layers
//! overriding earlier ones:
//!
//! 1. built-in defaults (`AppConfig::default()`)
//! 2. `circuit.toml` in the working directory, or the file named by
//!    `CIRCUIT_CONFIG`; a missing file is fine
//! 3. environment variables prefixed `CIRCUIT_`, e.g. `CIRCUIT_PORT=8080`
//!    or `CIRCUIT_COLLABORATORS__CRM=http://crm.internal/actions`
//!
//! The binaries load `.env` with `dotenv` before calling [`AppConfig::load`].

use ::config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::engine::{AllowAll, AuthorizationHook, Collaborators, EngineConfig, StaticPolicy};
use crate::models::{Backoff, Principal, RetryPolicy, SnapshotPolicy};
use crate::{CircuitError, Result};

pub const CONFIG_PATH_VAR: &str = "CIRCUIT_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "circuit.toml";

/// How API callers authenticate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Principal comes from the `X-Principal` header or the event
    #[default]
    None,
    /// `Authorization: Bearer <key>` is required and names the principal
    ApiKey,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub cors_enabled: bool,

    pub max_parallel_circuits: usize,
    pub circuit_budget_ms: u64,
    pub action_timeout_ms: u64,
    pub history_capacity: usize,

    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_factor: f64,
    pub backoff_jitter: f64,
    pub backoff_cap_ms: u64,

    pub snapshot_policy: SnapshotPolicy,

    pub auth_mode: AuthMode,
    /// `key=principal` pairs separated by commas
    pub api_keys: String,
    /// `principal=perm|perm` groups separated by semicolons
    pub permissions: String,

    pub metrics_enabled: bool,

    /// Collaborator slot name to HTTP endpoint
    pub collaborators: HashMap<String, String>,
    pub collaborator_timeout_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4000,
            cors_enabled: true,
            max_parallel_circuits: 16,
            circuit_budget_ms: 60_000,
            action_timeout_ms: 10_000,
            history_capacity: 10_000,
            max_attempts: 3,
            backoff_base_ms: 250,
            backoff_factor: 2.0,
            backoff_jitter: 0.2,
            backoff_cap_ms: 5_000,
            snapshot_policy: SnapshotPolicy::Full,
            auth_mode: AuthMode::None,
            api_keys: String::new(),
            permissions: String::new(),
            metrics_enabled: true,
            collaborators: HashMap::new(),
            collaborator_timeout_ms: 10_000,
        }
    }
}

impl AppConfig {
    /// Load from `circuit.toml` (or `$CIRCUIT_CONFIG`) and the environment
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        let config = Config::builder()
            .add_source(File::with_name(&path).required(false))
            .add_source(
                Environment::with_prefix("CIRCUIT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Self::from_config(config)
    }

    /// Deserialize and check an already-built configuration
    pub fn from_config(config: Config) -> Result<Self> {
        let app: AppConfig = config.try_deserialize()?;
        app.validate()?;
        Ok(app)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_circuits == 0 {
            return Err(CircuitError::Config("max_parallel_circuits must be at least 1".into()));
        }
        if self.max_attempts == 0 {
            return Err(CircuitError::Config("max_attempts must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.backoff_jitter) {
            return Err(CircuitError::Config("backoff_jitter must be within 0..=1".into()));
        }
        let keys = self.api_keys()?;
        if self.auth_mode == AuthMode::ApiKey && keys.is_empty() {
            return Err(CircuitError::Config("auth_mode api_key needs at least one api key".into()));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Engine resource caps
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_parallel_circuits: self.max_parallel_circuits,
            circuit_budget: Duration::from_millis(self.circuit_budget_ms),
            action_timeout: Duration::from_millis(self.action_timeout_ms),
            history_capacity: self.history_capacity,
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                backoff: Backoff {
                    base: Duration::from_millis(self.backoff_base_ms),
                    factor: self.backoff_factor,
                    jitter: self.backoff_jitter,
                    cap: Duration::from_millis(self.backoff_cap_ms),
                },
            },
            snapshot_policy: self.snapshot_policy,
        }
    }

    /// API key to principal table
    pub fn api_keys(&self) -> Result<HashMap<String, Principal>> {
        let mut keys = HashMap::new();
        for pair in self.api_keys.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, principal) = pair.split_once('=').ok_or_else(|| {
                CircuitError::Config(format!("api key entry '{}' is not key=principal", pair))
            })?;
            let (key, principal) = (key.trim(), principal.trim());
            if key.is_empty() || principal.is_empty() {
                return Err(CircuitError::Config(format!(
                    "api key entry '{}' is not key=principal",
                    pair
                )));
            }
            keys.insert(key.to_string(), Principal::new(principal));
        }
        Ok(keys)
    }

    /// Static permission table when `permissions` is set, allow-all otherwise
    pub fn authorizer(&self) -> Result<Arc<dyn AuthorizationHook>> {
        if self.permissions.trim().is_empty() {
            return Ok(Arc::new(AllowAll));
        }
        Ok(Arc::new(StaticPolicy::parse(&self.permissions)?))
    }

    /// One HTTP collaborator per configured slot
    pub fn collaborators(&self) -> Result<Collaborators> {
        Collaborators::from_endpoints(
            &self.collaborators,
            Duration::from_millis(self.collaborator_timeout_ms),
        )
    }
}
