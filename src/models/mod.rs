// Core domain models for the circuit engine
// Plain data plus the traits actions implement; no scheduling lives here

//! # Domain Models Module
//!
//! The building blocks of a circuit, from the leaves up:
//! - [`TriggerEvent`]: an immutable incoming event
//! - [`Trigger`]: a pure predicate deciding whether a circuit fires
//! - [`ExecutionContext`]: the per-run scratchpad
//! - [`ActionSpec`] / [`ActionHandler`]: a unit of work
//! - [`Circuit`]: triggers plus an ordered, validated action sequence
//! - [`ExecutionRecord`]: what history keeps about a finished run
//!
//! ## Rust Learning Notes:
//!
//! ### Re-exports for Clean APIs
//! The `pub use` statements at the bottom create a flat API. Users can
//! import `use circuit_script::models::Circuit` instead of
//! `use circuit_script::models::circuit::Circuit`.

// Trigger events and the event-kind vocabulary
pub mod event;

// Conditional predicates over context state
pub mod predicate;

// Triggers: simple and composite event predicates
pub mod trigger;

// Per-run execution context, log and snapshots
pub mod context;

// Action specs, results, retry policy and the handler trait
pub mod action;

// Circuits: arena of steps with key-flow validation
pub mod circuit;

// JSON circuit definitions accepted over the wire
pub mod definition;

// Execution records and history filters
pub mod record;

pub use event::{EventKind, EventSummary, TriggerEvent};

pub use predicate::Predicate;

pub use trigger::Trigger;

pub use context::{
    ContextSnapshot, ExecutionContext, LogEntry, LogLevel, Principal, StepTiming,
};

/// Action types: the typed catalog names, results and the handler trait
pub use action::{
    ActionFailure, ActionHandler, ActionKind, ActionResult, ActionSpec, ActionType, Backoff,
    ErrorKind, Idempotency, RetryPolicy, SideEffect, SkipReason,
};

pub use circuit::{Circuit, CircuitSummary, ConditionalNode, Node, NodeId, OnFailure, Step};

pub use definition::{ActionDefinition, CircuitDefinition, ConditionalDefinition, StepDefinition};

pub use record::{
    ActionOutcome, ActionRecord, Branch, ExecutionRecord, HistoryFilter, RunStatus,
    SnapshotPolicy,
};
