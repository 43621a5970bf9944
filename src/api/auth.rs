// Request authentication for the HTTP API

//! # Caller Authentication
//!
//! The API resolves the principal an event acts on behalf of before it
//! reaches the engine:
//!
//! - `api_key` mode: `Authorization: Bearer <key>` is required and the key
//!   names the principal; anything else is 401
//! - `none` mode: the `X-Principal` header, when present, names the
//!   principal; otherwise the event's own principal (if any) is used
//!
//! A resolved principal always replaces whatever the event body claims.

use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
};
use std::collections::HashMap;

use super::handlers::ApiState;
use super::types::ApiError;
use crate::config::AuthMode;
use crate::models::{Principal, TriggerEvent};
use crate::{CircuitError, Result};

pub const PRINCIPAL_HEADER: &str = "x-principal";

#[derive(Debug, Clone, Default)]
pub struct ApiAuth {
    mode: AuthMode,
    keys: HashMap<String, Principal>,
}

impl ApiAuth {
    pub fn new(mode: AuthMode, keys: HashMap<String, Principal>) -> Self {
        Self { mode, keys }
    }

    /// No authentication; principals come from headers or events
    pub fn open() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> AuthMode {
        self.mode
    }

    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Option<Principal>> {
        match self.mode {
            AuthMode::None => Ok(headers
                .get(PRINCIPAL_HEADER)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(Principal::new)),
            AuthMode::ApiKey => {
                let key = headers
                    .get(AUTHORIZATION)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.strip_prefix("Bearer "))
                    .map(str::trim)
                    .ok_or_else(|| CircuitError::Unauthorized("missing bearer api key".into()))?;

                self.keys
                    .get(key)
                    .cloned()
                    .map(Some)
                    .ok_or_else(|| CircuitError::Unauthorized("unknown api key".into()))
            }
        }
    }
}

/// The authenticated caller of a request
#[derive(Debug, Clone, PartialEq)]
pub struct Caller(pub Option<Principal>);

impl Caller {
    /// Stamp the caller's principal onto an event
    pub fn apply(&self, event: TriggerEvent) -> TriggerEvent {
        match &self.0 {
            Some(principal) => event.with_principal(principal.as_str()),
            None => event,
        }
    }
}

#[async_trait]
impl FromRequestParts<ApiState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &ApiState) -> std::result::Result<Self, Self::Rejection> {
        Ok(Caller(state.auth.authenticate(&parts.headers)?))
    }
}
