//! Error taxonomy shared by every operation
//!
//! Every operation returns either a success payload or a `GovError`
//! carrying one code from the fixed enumeration, a human-readable message,
//! optional structured details, and suggested recovery operations. Internal
//! helpers use the same type; a single boundary in the RPC layer converts
//! panics to `INTERNAL`.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

/// Fixed error-code enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation
    MissingParameter,
    InvalidParameterType,
    OutOfRange,
    AgentNotFound,
    SessionNotFound,
    AgentNotRegistered,
    ResourceNotFound,
    // Authentication / authorization
    AuthFailed,
    AuthenticationRequired,
    OwnershipViolation,
    PermissionDenied,
    SessionMismatch,
    // State / concurrency
    AlreadyOpen,
    WrongPhase,
    Contention,
    RateLimited,
    Timeout,
    Conflict,
    Unsafe,
    NoReviewer,
    AmbiguousExisting,
    // System
    Unavailable,
    IntegrationFailure,
    PersistFailure,
    Internal,
}

impl ErrorCode {
    /// Whether the caller may retry after backoff.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::Contention
                | ErrorCode::RateLimited
                | ErrorCode::Timeout
                | ErrorCode::Conflict
                | ErrorCode::Unavailable
        )
    }
}

/// Operation failure with the structured payload the surface returns.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{code:?}: {message}")]
pub struct GovError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub recovery: Vec<String>,
}

pub type GovResult<T> = Result<T, GovError>;

impl GovError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            recovery: Vec::new(),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_recovery<I, S>(mut self, ops: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.recovery = ops.into_iter().map(Into::into).collect();
        self
    }

    pub fn missing_parameter(name: &str) -> Self {
        Self::new(
            ErrorCode::MissingParameter,
            format!("missing required parameter '{}'", name),
        )
        .with_details(json!({ "parameter": name }))
    }

    pub fn invalid_type(name: &str, expected: &str) -> Self {
        Self::new(
            ErrorCode::InvalidParameterType,
            format!("parameter '{}' must be a {}", name, expected),
        )
        .with_details(json!({ "parameter": name, "expected": expected }))
    }

    pub fn out_of_range(name: &str, value: impl Into<Value>) -> Self {
        Self::new(
            ErrorCode::OutOfRange,
            format!("parameter '{}' is out of range", name),
        )
        .with_details(json!({ "parameter": name, "value": value.into() }))
    }

    pub fn agent_not_found(uuid: impl std::fmt::Display) -> Self {
        Self::new(ErrorCode::AgentNotFound, format!("agent not found: {}", uuid))
            .with_recovery(["onboard", "list"])
    }

    pub fn session_not_found(id: impl std::fmt::Display) -> Self {
        Self::new(
            ErrorCode::SessionNotFound,
            format!("dialectic session not found: {}", id),
        )
        .with_recovery(["list_sessions"])
    }

    pub fn auth_failed() -> Self {
        Self::new(ErrorCode::AuthFailed, "credentials did not verify")
    }

    pub fn unavailable(what: &str) -> Self {
        Self::new(ErrorCode::Unavailable, format!("{} unavailable", what))
    }

    pub fn contention(name: &str) -> Self {
        Self::new(
            ErrorCode::Contention,
            format!("could not acquire write-lock '{}' within the timeout", name),
        )
        .with_recovery(["retry after backoff"])
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    /// Structured failure body for the RPC surface.
    pub fn to_response(&self) -> Value {
        json!({
            "error": self.message,
            "error_code": self.code,
            "details": self.details,
            "recovery": self.recovery,
        })
    }
}

impl From<sqlx::Error> for GovError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => {
                GovError::new(ErrorCode::ResourceNotFound, "row not found")
            }
            sqlx::Error::PoolTimedOut => GovError::new(ErrorCode::Timeout, "store pool timed out"),
            other => GovError::new(ErrorCode::PersistFailure, format!("store error: {}", other)),
        }
    }
}

impl From<redis::RedisError> for GovError {
    fn from(err: redis::RedisError) -> Self {
        GovError::new(ErrorCode::Unavailable, format!("cache error: {}", err))
    }
}

impl From<serde_json::Error> for GovError {
    fn from(err: serde_json::Error) -> Self {
        GovError::new(
            ErrorCode::Internal,
            format!("serialization failure: {}", err),
        )
    }
}

impl From<eisv_dynamics::DynamicsError> for GovError {
    fn from(err: eisv_dynamics::DynamicsError) -> Self {
        match err {
            eisv_dynamics::DynamicsError::InputOutOfRange { field, value } => {
                GovError::out_of_range(field, value)
            }
            eisv_dynamics::DynamicsError::NonFinite { .. } => GovError::new(
                ErrorCode::IntegrationFailure,
                format!("integration produced a non-finite value: {}", err),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_wire_format() {
        let code = serde_json::to_string(&ErrorCode::AmbiguousExisting).unwrap();
        assert_eq!(code, "\"AMBIGUOUS_EXISTING\"");
        let code = serde_json::to_string(&ErrorCode::RateLimited).unwrap();
        assert_eq!(code, "\"RATE_LIMITED\"");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ErrorCode::Contention.retryable());
        assert!(ErrorCode::Unavailable.retryable());
        assert!(!ErrorCode::AuthFailed.retryable());
        assert!(!ErrorCode::IntegrationFailure.retryable());
    }

    #[test]
    fn test_failure_response_shape() {
        let err = GovError::missing_parameter("agent_uuid").with_recovery(["onboard"]);
        let body = err.to_response();
        assert_eq!(body["error_code"], "MISSING_PARAMETER");
        assert_eq!(body["details"]["parameter"], "agent_uuid");
        assert_eq!(body["recovery"][0], "onboard");
    }
}
