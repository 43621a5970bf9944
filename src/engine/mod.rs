// Circuit Script Engine
// This contains the runtime that turns registered circuits into runs

//! # Circuit Script Engine Module
//!
//! This module contains the runtime that powers Circuit Script. The engine is
//! the layer between the domain models and the external world.
//!
//! ## Architecture Overview
//!
//! - **Domain Models**: circuits, events, actions and records (in `models/`)
//! - **Engine Layer**: scheduling and execution (this module)
//! - **API Layer**: HTTP projection of engine operations (in `api/`)
//!
//! ## Engine Components
//!
//! ### Scheduler (`scheduler` module)
//! - Owns the circuit table and the history
//! - Matches events to circuits and bounds concurrent runs
//! - Supervises each run's budget
//!
//! ### Runner (`runner` module)
//! - Walks one circuit's steps against one execution context
//! - Applies input, authorization, timeout and retry checks per action
//! - Applies the circuit's on-failure policy
//!
//! ### Action Catalog (`catalog` module)
//! - Maps action type names to handler factories
//! - Builds circuits from their JSON definitions
//!
//! ### Collaborators (`collaborators` module)
//! - External services behind the built-in actions
//!
//! ### Authorization, Observers and Metrics
//! - `authz`: permission checks against the event's principal
//! - `observe`: lifecycle hooks plus a tracing-backed observer
//! - `metrics`: a Prometheus observer
//!
//! ### History (`history` module)
//! - Bounded in-memory ring buffer of execution records
//!
//! ## Rust Learning Notes:
//!
//! ### Module Organization Pattern
//! This is a common Rust pattern for organizing large modules:
//! 1. Create a directory with the module name (`engine/`)
//! 2. Add a `mod.rs` file as the module root
//! 3. Declare submodules in `mod.rs`
//! 4. Re-export important types for clean API
//!
//! ### Visibility
//! `runner` is `pub(crate)`: only the scheduler starts runs, so the type
//! never shows up in the public API.

/// Authorization hook and its stock implementations
pub mod authz;

/// Action type registry and circuit building
///
/// Contains:
/// - ActionCatalog and CatalogEntry
/// - ActionFactory for extension types
/// - The built-in collaborator and log actions
pub mod catalog;

/// External services behind the built-in actions
pub mod collaborators;

/// Bounded history of execution records
pub mod history;

/// Prometheus metrics observer
pub mod metrics;

/// Lifecycle observers
///
/// Contains:
/// - Observer trait with no-op defaults
/// - LoggingObserver writing to `tracing`
/// - FanoutObserver for combining observers
pub mod observe;

/// Per-run step walker
pub(crate) mod runner;

/// Engine entry point
///
/// Contains:
/// - CircuitEngine and its builder
/// - EngineConfig resource caps
/// - RunHandle for scheduled runs
pub mod scheduler;


#[cfg(test)]
mod scenario_tests;

// Re-export main engine types for clean API access

pub use authz::{AllowAll, AuthorizationHook, DenyAll, StaticPolicy};

pub use catalog::{ActionCatalog, ActionFactory, CatalogEntry};

pub use collaborators::{
    Collaborator, CollaboratorSlot, Collaborators, ExternalError, FnCollaborator, HttpCollaborator,
};

pub use history::History;

pub use metrics::CircuitMetrics;

pub use observe::{FanoutObserver, LoggingObserver, NoopObserver, Observer, RunInfo};

pub use scheduler::{CircuitEngine, CircuitEngineBuilder, EngineConfig, RunHandle};
