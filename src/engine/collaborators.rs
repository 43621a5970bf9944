// External collaborators behind the built-in actions

//! # Collaborators
//!
//! Built-in actions delegate their real work (fetching data, scoring,
//! posting to chat, ...) to a [`Collaborator`]: one async call that takes a
//! JSON request and returns a JSON answer. Each built-in action type is
//! wired to one [`CollaboratorSlot`].
//!
//! - [`HttpCollaborator`] POSTs the request to a configured endpoint
//! - [`FnCollaborator`] wraps a closure, for embedding and tests
//!
//! Failures come back as [`ExternalError`] with a `recoverable` flag that
//! the engine's retry loop honours.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::{CircuitError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ExternalError {
    pub message: String,
    pub recoverable: bool,
}

impl ExternalError {
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            recoverable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            recoverable: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollaboratorSlot {
    DataSource,
    Scraper,
    News,
    Retriever,
    ScoreModel,
    CompetitorIntel,
    Crm,
    Chat,
}

impl CollaboratorSlot {
    pub const ALL: [CollaboratorSlot; 8] = [
        CollaboratorSlot::DataSource,
        CollaboratorSlot::Scraper,
        CollaboratorSlot::News,
        CollaboratorSlot::Retriever,
        CollaboratorSlot::ScoreModel,
        CollaboratorSlot::CompetitorIntel,
        CollaboratorSlot::Crm,
        CollaboratorSlot::Chat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CollaboratorSlot::DataSource => "data_source",
            CollaboratorSlot::Scraper => "scraper",
            CollaboratorSlot::News => "news",
            CollaboratorSlot::Retriever => "retriever",
            CollaboratorSlot::ScoreModel => "score_model",
            CollaboratorSlot::CompetitorIntel => "competitor_intel",
            CollaboratorSlot::Crm => "crm",
            CollaboratorSlot::Chat => "chat",
        }
    }
}

impl fmt::Display for CollaboratorSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CollaboratorSlot {
    type Err = CircuitError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .find(|slot| slot.as_str() == s)
            .copied()
            .ok_or_else(|| CircuitError::Config(format!("unknown collaborator slot '{}'", s)))
    }
}

#[async_trait]
pub trait Collaborator: Send + Sync {
    async fn call(&self, request: Value) -> std::result::Result<Value, ExternalError>;
}

/// Collaborator reached over HTTP
///
/// The request is POSTed as JSON and the JSON response body is the answer.
/// Transport errors, 429 and 5xx are recoverable; any other non-success
/// status is not.
pub struct HttpCollaborator {
    client: Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpCollaborator {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            timeout,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn is_recoverable(status: StatusCode) -> bool {
        status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
    }
}

#[async_trait]
impl Collaborator for HttpCollaborator {
    async fn call(&self, request: Value) -> std::result::Result<Value, ExternalError> {
        debug!(endpoint = %self.endpoint, "calling collaborator");

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| ExternalError::recoverable(format!("{}: {}", self.endpoint, e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            let message = format!("{} returned {}: {}", self.endpoint, status, error_text);
            return Err(if Self::is_recoverable(status) {
                ExternalError::recoverable(message)
            } else {
                ExternalError::permanent(message)
            });
        }

        response.json::<Value>().await.map_err(|e| {
            ExternalError::permanent(format!("{} sent an invalid body: {}", self.endpoint, e))
        })
    }
}

/// Closure-backed collaborator
pub struct FnCollaborator<F> {
    f: F,
}

impl<F> FnCollaborator<F>
where
    F: Fn(Value) -> std::result::Result<Value, ExternalError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> Collaborator for FnCollaborator<F>
where
    F: Fn(Value) -> std::result::Result<Value, ExternalError> + Send + Sync,
{
    async fn call(&self, request: Value) -> std::result::Result<Value, ExternalError> {
        (self.f)(request)
    }
}

/// Slot to collaborator wiring handed to the action catalog
#[derive(Clone, Default)]
pub struct Collaborators {
    slots: HashMap<CollaboratorSlot, Arc<dyn Collaborator>>,
}

impl Collaborators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, slot: CollaboratorSlot, collaborator: Arc<dyn Collaborator>) -> Self {
        self.slots.insert(slot, collaborator);
        self
    }

    /// One [`HttpCollaborator`] per `slot name -> endpoint` entry
    pub fn from_endpoints(endpoints: &HashMap<String, String>, timeout: Duration) -> Result<Self> {
        let mut collaborators = Self::new();
        for (name, endpoint) in endpoints {
            let slot: CollaboratorSlot = name.parse()?;
            if endpoint.trim().is_empty() {
                continue;
            }
            collaborators = collaborators.with(slot, Arc::new(HttpCollaborator::new(endpoint, timeout)));
        }
        Ok(collaborators)
    }

    pub fn get(&self, slot: CollaboratorSlot) -> Option<Arc<dyn Collaborator>> {
        self.slots.get(&slot).cloned()
    }

    pub fn configured(&self) -> Vec<CollaboratorSlot> {
        CollaboratorSlot::ALL
            .iter()
            .copied()
            .filter(|slot| self.slots.contains_key(slot))
            .collect()
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("configured", &self.configured())
            .finish()
    }
}
