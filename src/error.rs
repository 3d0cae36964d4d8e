//! Error taxonomy for the proxy and the JSON error responses sent to clients

use crate::container::ServiceStatus;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Header carrying the machine-readable error code on every non-forwarded response
pub const X_PROXY_ERROR: &str = "x-proxy-error";

/// Kind of container transition guarded by a pending marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Start,
    Stop,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transition::Start => f.write_str("start"),
            Transition::Stop => f.write_str("stop"),
        }
    }
}

/// Errors produced while resolving, activating or forwarding to a service
#[derive(Debug, Error)]
pub enum GateError {
    /// No container advertises the requested service name
    #[error("no container serves service '{0}'")]
    NotFound(String),

    /// The container exists but declares no accessible port
    #[error("service '{0}' is not accessible at any port")]
    NotAccessible(String),

    /// The service exists but cannot be forwarded to right now
    #[error("service '{service}' (group '{group}') is {status}")]
    WrongStatus {
        service: String,
        group: String,
        status: ServiceStatus,
    },

    /// A start or stop is already pending for this container
    #[error("container {id} already has a pending {transition}")]
    DuplicateTransition { id: String, transition: Transition },

    /// The cached route's upstream refused or dropped the connection
    #[error("backend for service '{service}' is unavailable: {reason}")]
    BackendUnavailable { service: String, reason: String },

    /// A container carries labels that violate the label contract
    #[error("invalid labels on container {id}: {reason}")]
    InvalidLabels { id: String, reason: String },

    /// No container carries the group label
    #[error("no containers found in group '{0}'")]
    GroupNotFound(String),

    /// Failure reported by the container runtime
    #[error(transparent)]
    Runtime(#[from] anyhow::Error),
}

impl GateError {
    /// Error code reported to clients for this error
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            GateError::NotFound(_) | GateError::GroupNotFound(_) => ProxyErrorCode::UnknownService,
            GateError::NotAccessible(_) => ProxyErrorCode::ServiceNotAccessible,
            GateError::WrongStatus { status, .. } => match status {
                ServiceStatus::ShuttingDown => ProxyErrorCode::ServiceShuttingDown,
                _ => ProxyErrorCode::ServiceLoading,
            },
            GateError::BackendUnavailable { .. } => ProxyErrorCode::BackendUnavailable,
            GateError::DuplicateTransition { .. }
            | GateError::InvalidLabels { .. }
            | GateError::Runtime(_) => ProxyErrorCode::InternalError,
        }
    }
}

/// Error codes for proxy responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// The request did not name a service
    MissingServiceName,
    /// No container serves the requested service
    UnknownService,
    /// The service container declares no accessible port
    ServiceNotAccessible,
    /// The service group is starting
    ServiceLoading,
    /// The service group is being stopped
    ServiceShuttingDown,
    /// The cached backend stopped answering
    BackendUnavailable,
    /// Internal proxy or runtime error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingServiceName => StatusCode::BAD_REQUEST,
            ProxyErrorCode::UnknownService => StatusCode::NOT_FOUND,
            ProxyErrorCode::ServiceNotAccessible => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::ServiceLoading => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::ServiceShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::BackendUnavailable => StatusCode::FOUND,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingServiceName => "MISSING_SERVICE_NAME",
            ProxyErrorCode::UnknownService => "UNKNOWN_SERVICE",
            ProxyErrorCode::ServiceNotAccessible => "SERVICE_NOT_ACCESSIBLE",
            ProxyErrorCode::ServiceLoading => "SERVICE_LOADING",
            ProxyErrorCode::ServiceShuttingDown => "SERVICE_SHUTTING_DOWN",
            ProxyErrorCode::BackendUnavailable => "BACKEND_UNAVAILABLE",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);

    Response::builder()
        .status(code.status_code())
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .header(X_PROXY_ERROR, code.as_header_value())
        .body(Full::new(Bytes::from(error.to_json())).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_map_to_status() {
        assert_eq!(
            ProxyErrorCode::MissingServiceName.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ProxyErrorCode::UnknownService.status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ProxyErrorCode::ServiceLoading.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ProxyErrorCode::BackendUnavailable.status_code(),
            StatusCode::FOUND
        );
    }

    #[test]
    fn test_gate_error_codes() {
        let loading = GateError::WrongStatus {
            service: "web".to_string(),
            group: "stack".to_string(),
            status: ServiceStatus::Loading,
        };
        assert_eq!(loading.code(), ProxyErrorCode::ServiceLoading);

        let stopping = GateError::WrongStatus {
            service: "web".to_string(),
            group: "stack".to_string(),
            status: ServiceStatus::ShuttingDown,
        };
        assert_eq!(stopping.code(), ProxyErrorCode::ServiceShuttingDown);

        assert_eq!(
            GateError::NotFound("web".into()).code(),
            ProxyErrorCode::UnknownService
        );
        assert_eq!(
            GateError::Runtime(anyhow::anyhow!("daemon gone")).code(),
            ProxyErrorCode::InternalError
        );
    }

    #[test]
    fn test_error_messages() {
        let err = GateError::DuplicateTransition {
            id: "abc".to_string(),
            transition: Transition::Start,
        };
        assert_eq!(err.to_string(), "container abc already has a pending start");

        let err = GateError::WrongStatus {
            service: "web".to_string(),
            group: "stack".to_string(),
            status: ServiceStatus::ShuttingDown,
        };
        assert_eq!(err.to_string(), "service 'web' (group 'stack') is shutting down");
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ProxyErrorCode::UnknownService, "no container serves service 'x'");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"UNKNOWN_SERVICE\""));
        assert!(json.contains("\"status\":404"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ProxyErrorCode::ServiceShuttingDown, "stopping");

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get(X_PROXY_ERROR).unwrap(),
            "SERVICE_SHUTTING_DOWN"
        );
    }
}
