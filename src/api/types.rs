// Wire types for the HTTP API

use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{de::Error as _, Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::error;

use crate::models::{EventKind, RunStatus, TriggerEvent};
use crate::CircuitError;

/// Default page size for `GET /executions`
pub const DEFAULT_EXECUTIONS_LIMIT: usize = 100;

/// Event kind used when `POST /circuits/{name}/execute` gets a bare payload
pub const MANUAL_EVENT_KIND: &str = "manual";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

/// `{"error": {"kind": ..., "message": ...}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

/// Engine error on its way out as an HTTP response
#[derive(Debug)]
pub struct ApiError(pub CircuitError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            CircuitError::Definition(_)
            | CircuitError::InvalidInput(_)
            | CircuitError::Serialization(_) => StatusCode::BAD_REQUEST,
            CircuitError::DuplicateCircuit { .. } | CircuitError::DuplicateAction(_) => {
                StatusCode::CONFLICT
            }
            CircuitError::NotFound(_) => StatusCode::NOT_FOUND,
            CircuitError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            CircuitError::Config(_) | CircuitError::Metrics(_) | CircuitError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// A circuit definition body that could not be parsed
    pub fn definition(rejection: JsonRejection) -> Self {
        ApiError(CircuitError::Definition(rejection.body_text()))
    }

    pub fn json(rejection: JsonRejection) -> Self {
        ApiError(CircuitError::InvalidInput(rejection.body_text()))
    }

    pub fn query(rejection: QueryRejection) -> Self {
        ApiError(CircuitError::InvalidInput(rejection.body_text()))
    }
}

impl From<CircuitError> for ApiError {
    fn from(err: CircuitError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("request failed: {}", self.0);
        }

        let body = ErrorResponse {
            error: ErrorBody {
                kind: self.0.kind().to_string(),
                message: self.0.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

/// Query string of `GET /executions`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutionsQuery {
    pub limit: Option<usize>,
    pub circuit_name: Option<String>,
    pub status: Option<RunStatus>,
}

/// Query string of `POST /circuits/{name}/execute`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecuteQuery {
    pub version: Option<u32>,
}

/// Body of `POST /circuits/{name}/execute`
///
/// A JSON object carrying both `kind` and `payload` is a full trigger event.
/// Any other JSON value is the payload of a `manual` event, so a bare
/// payload may have a `kind` field of its own.
#[derive(Debug, Clone)]
pub enum ExecuteRequest {
    Event(TriggerEvent),
    Payload(Value),
}

impl<'de> Deserialize<'de> for ExecuteRequest {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let body = Value::deserialize(deserializer)?;
        let is_event = body
            .as_object()
            .map_or(false, |fields| fields.contains_key("kind") && fields.contains_key("payload"));

        if is_event {
            serde_json::from_value(body)
                .map(ExecuteRequest::Event)
                .map_err(D::Error::custom)
        } else {
            Ok(ExecuteRequest::Payload(body))
        }
    }
}

impl ExecuteRequest {
    pub fn into_event(self) -> TriggerEvent {
        match self {
            ExecuteRequest::Event(event) => event,
            ExecuteRequest::Payload(payload) => {
                TriggerEvent::new(EventKind::from(MANUAL_EVENT_KIND), "api", payload)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub circuits: usize,
    pub executions: usize,
}
