//! Error types for the drone host and the HTTP error responses built from them

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::path::PathBuf;

/// Errors surfaced by the registry, the supervisor and the repository layer.
///
/// Every variant names the application it concerns so callers can log or
/// display it without extra context.
#[derive(Debug, thiserror::Error)]
pub enum DroneError {
    #[error("Invalid application {app}: {reason}")]
    InvalidDescriptor { app: String, reason: String },

    #[error("Unknown repository type '{kind}' for {user}/{app}")]
    UnknownRepository {
        app: String,
        user: String,
        kind: String,
    },

    #[error("Cannot {action} application that is not running.")]
    NotRunning { app: String, action: &'static str },

    #[error("Spawn hook rejected {app}: {message}")]
    Hook { app: String, message: String },

    #[error("Error fetching source for {user}/{app}: {message}")]
    Fetch {
        app: String,
        user: String,
        message: String,
        stderr: Vec<String>,
    },

    #[error("Error installing dependencies for {user}/{app}: {message}")]
    Install {
        app: String,
        user: String,
        message: String,
        stderr: Vec<String>,
    },

    #[error("Error spawning drone: {app}: {source}")]
    Spawn {
        app: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Error spawning drone: {app} exited too quickly")]
    TooFastExit { app: String, stderr: Vec<String> },

    #[error("Error spawning drone: {app} exited with {status}")]
    Crashed {
        app: String,
        status: String,
        stderr: Vec<String>,
    },

    #[error("Error spawning drone: no port mapping from {app} within {timeout_ms}ms")]
    ReadinessTimeout { app: String, timeout_ms: u64 },

    #[error("Drone monitor for {app} (pid {pid}) is gone")]
    MonitorGone { app: String, pid: u32 },
}

impl DroneError {
    /// Errors caused by the caller's input; never retried, reported as 4xx
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            DroneError::InvalidDescriptor { .. }
                | DroneError::UnknownRepository { .. }
                | DroneError::NotRunning { .. }
                | DroneError::Hook { .. }
        )
    }

    /// Captured stderr lines of the failed child or subprocess, if any
    pub fn stderr(&self) -> &[String] {
        match self {
            DroneError::Fetch { stderr, .. }
            | DroneError::Install { stderr, .. }
            | DroneError::TooFastExit { stderr, .. }
            | DroneError::Crashed { stderr, .. } => stderr,
            _ => &[],
        }
    }

    pub fn status_code(&self) -> StatusCode {
        if self.is_user_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Errors from the process record store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record store I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed process record {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid record name: {0}")]
    InvalidName(String),
}

/// Error codes for balancer errors that are not routing misses
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Missing Host header in request
    MissingHostHeader,
    /// Request timed out waiting for a drone
    RequestTimeout,
    /// Failed to connect to the selected drone
    ConnectionFailed,
}

impl ProxyErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
        }
    }

    /// Value of the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
        }
    }
}

/// JSON error response body of the balancer
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    pub message: String,
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
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// Create a plain-text response, used for routing misses
pub fn text_error_response(
    status: StatusCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain")
        .body(
            Full::new(Bytes::from(message.into()))
                .map_err(|e| match e {})
                .boxed(),
        )
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_running_message() {
        let err = DroneError::NotRunning {
            app: "test".to_string(),
            action: "stop",
        };
        assert_eq!(err.to_string(), "Cannot stop application that is not running.");
        assert!(err.is_user_error());
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_spawn_errors_are_operational() {
        let err = DroneError::TooFastExit {
            app: "test".to_string(),
            stderr: vec!["boom".to_string()],
        };
        assert!(!err.is_user_error());
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.stderr(), &["boom".to_string()]);
        assert!(err.to_string().contains("exited too quickly"));

        let err = DroneError::ReadinessTimeout {
            app: "test".to_string(),
            timeout_ms: 200,
        };
        assert!(err.stderr().is_empty());
        assert!(err.to_string().contains("200ms"));
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ProxyErrorCode::ConnectionFailed, "Drone unreachable");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"CONNECTION_FAILED\""));
        assert!(json.contains("\"message\":\"Drone unreachable\""));
        assert!(json.contains("\"status\":502"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ProxyErrorCode::RequestTimeout, "Request timed out");

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "REQUEST_TIMEOUT"
        );
    }

    #[test]
    fn test_text_error_response() {
        let response = text_error_response(StatusCode::BAD_REQUEST, "No drones for example.com");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers().get("Content-Type").unwrap(), "text/plain");
    }
}
