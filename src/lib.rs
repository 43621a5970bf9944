// Circuit Script - Rust Edition
// An event-driven workflow runtime that composes typed actions into circuits

//! # Circuit Script Library
//!
//! Circuit Script runs small, named workflows (*circuits*) in response to
//! incoming events. A circuit binds one or more triggers to an ordered
//! sequence of actions, optionally branching on predicates over a per-run
//! context. The engine dispatches matching circuits concurrently, enforces
//! timeouts, retries and budgets, and keeps a bounded history of runs.
//!
//! ## Core Components
//!
//! ### Domain Models
//! - [`TriggerEvent`] / [`Trigger`]: what happened, and who cares
//! - [`ActionSpec`] / [`ActionHandler`]: a unit of work and its contract
//! - [`Circuit`]: an arena of steps with key-flow validation
//! - [`ExecutionRecord`]: the history entry for one run
//!
//! ### Engine
//! - [`CircuitEngine`]: registration, dispatch, scheduling and history
//! - [`ActionCatalog`]: built-in and extension action types
//! - [`Observer`] / [`AuthorizationHook`]: pluggable collaborators
//!
//! ### HTTP Surface
//! - [`CircuitApiServer`]: an axum projection of the engine operations
//!
//! **Usage Example:**
//! ```rust,no_run
//! use circuit_script::{CircuitEngine, EngineConfig, EventKind, TriggerEvent};
//! use serde_json::json;
//!
//! # async fn run() -> circuit_script::Result<()> {
//! let engine = CircuitEngine::builder(EngineConfig::default()).build();
//! let event = TriggerEvent::new(EventKind::LeadCreated, "crm", json!({"lead_id": "L1"}));
//! let records = engine.dispatch(event).await;
//! assert!(records.is_empty()); // nothing registered yet
//! # Ok(())
//! # }
//! ```
//!
//! ## Rust Learning Notes:
//!
//! ### Errors as Values
//! Two layers of failure exist here. Engine operations that can be refused
//! (registration, lookup, configuration) return [`Result`] with a
//! [`CircuitError`]. Action failures during a run are *not* errors: they are
//! recorded in the run's [`ExecutionRecord`] and the caller still gets the
//! record back.
//!
//! ### Re-exports
//! `pub use` statements create shortcuts so users don't need to know the
//! internal module structure.

// Core domain models
pub mod models;

// Runtime: catalog, scheduler, observers, collaborators
pub mod engine;

// HTTP projection of the engine
pub mod api;

// Layered application configuration
pub mod config;

pub use models::{
    ActionHandler, ActionResult, ActionSpec, ActionType, Circuit, CircuitDefinition,
    ErrorKind, EventKind, ExecutionContext, ExecutionRecord, HistoryFilter, OnFailure,
    Predicate, RetryPolicy, RunStatus, Step, Trigger, TriggerEvent,
};

pub use engine::{
    ActionCatalog, AuthorizationHook, CircuitEngine, CircuitMetrics, Collaborator,
    Collaborators, EngineConfig, LoggingObserver, Observer, RunHandle,
};

pub use api::{CircuitApiConfig, CircuitApiServer, CircuitApiServerBuilder};

pub use config::AppConfig;

use thiserror::Error;

/// Error type for engine operations
///
/// ## Rust Learning Notes:
///
/// ### The `thiserror` Crate
/// - `#[derive(Error)]` implements the `std::error::Error` trait
/// - `#[error("...")]` provides human-readable error messages
/// - `#[from]` enables automatic conversion with the `?` operator
#[derive(Error, Debug)]
pub enum CircuitError {
    /// Invalid circuit graph or key-flow violation
    #[error("Definition error: {0}")]
    Definition(String),

    /// A circuit with the same name and version is already registered
    #[error("Circuit {name} v{version} is already registered")]
    DuplicateCircuit { name: String, version: u32 },

    /// An action type with the same name is already in the catalog
    #[error("Action type already registered: {0}")]
    DuplicateAction(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Engine bug or unexpected condition
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CircuitError {
    /// Stable string used on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            CircuitError::Definition(_) => "definition_error",
            CircuitError::DuplicateCircuit { .. } | CircuitError::DuplicateAction(_) => {
                "duplicate"
            }
            CircuitError::NotFound(_) => "not_found",
            CircuitError::InvalidInput(_) | CircuitError::Serialization(_) => "invalid_input",
            CircuitError::Unauthorized(_) => "unauthorized",
            CircuitError::Config(_) => "config_error",
            CircuitError::Metrics(_) | CircuitError::Internal(_) => "internal_error",
        }
    }
}

impl From<std::io::Error> for CircuitError {
    fn from(err: std::io::Error) -> Self {
        CircuitError::Internal(err.to_string())
    }
}

impl From<::config::ConfigError> for CircuitError {
    fn from(err: ::config::ConfigError) -> Self {
        CircuitError::Config(err.to_string())
    }
}

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, CircuitError>;
