//! Error types for flowcheck.
//!
//! Every variant carries a stable machine code so API clients can branch on
//! it without parsing messages.

use axum::http::StatusCode;
use thiserror::Error;

use crate::flow::ValidationError;

/// Result type alias for flowcheck operations.
pub type Result<T> = std::result::Result<T, Error>;

/// flowcheck error types.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Flow validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Dispatch error: {0}")]
    Dispatch(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get the error code for programmatic handling.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(e) => e.code(),
            Error::InvalidState(_) => "INVALID_STATE",
            Error::NotFound(_) => "NOT_FOUND",
            Error::Dispatch(_) => "DISPATCH_ERROR",
            Error::Stream(_) => "STREAM_ERROR",
            Error::Parse(_) => "PARSE_ERROR",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Http(_) => "HTTP_ERROR",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Yaml(_) => "YAML_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }

    /// HTTP status used when this error crosses the API boundary.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Parse(_) | Error::Yaml(_) | Error::Json(_) => StatusCode::BAD_REQUEST,
            Error::InvalidState(_) => StatusCode::CONFLICT,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Dispatch(_) | Error::Http(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get a sanitized error message safe for external consumers.
    ///
    /// Storage and IO details (paths, SQL) are never exposed.
    pub fn external_message(&self) -> String {
        match self {
            Error::Validation(e) => e.to_string(),
            Error::InvalidState(msg) => msg.clone(),
            Error::NotFound(msg) => format!("Not found: {}", msg),
            Error::Dispatch(msg) => format!("Dispatch failed: {}", msg),
            Error::Stream(msg) => format!("Stream error: {}", msg),
            Error::Parse(msg) => format!("Parse error: {}", msg),
            Error::Config(msg) => format!("Configuration error: {}", msg),

            Error::Storage(_) => "A storage error occurred".to_string(),
            Error::Internal(_) => "An internal error occurred".to_string(),
            Error::Database(_) => "A database error occurred".to_string(),
            Error::Io(_) => "An I/O error occurred".to_string(),

            Error::Http(e) => {
                if let Some(status) = e.status() {
                    format!("Worker request failed with status {}", status.as_u16())
                } else if e.is_timeout() {
                    "Worker request timed out".to_string()
                } else if e.is_connect() {
                    "Failed to connect to execution worker".to_string()
                } else {
                    "Worker request failed".to_string()
                }
            }

            Error::Yaml(_) => "Invalid YAML format".to_string(),
            Error::Json(_) => "Invalid JSON format".to_string(),
        }
    }

    /// Convert to a JSON error body with a sanitized message.
    pub fn to_external_json(&self) -> serde_json::Value {
        let mut body = serde_json::json!({
            "success": false,
            "error": {
                "code": self.code(),
                "message": self.external_message(),
            }
        });
        if let Error::Validation(e) = self {
            body["error"]["details"] = e.report();
        }
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            Error::InvalidState("done".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            Error::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::Dispatch("down".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            Error::Validation(ValidationError::MissingStart).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            Error::Storage("disk".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_external_message_hides_storage_details() {
        let err = Error::Storage("/var/lib/flowcheck/db.sqlite locked".into());
        assert!(!err.external_message().contains("/var/lib"));

        let err = Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "/etc/secret",
        ));
        assert!(!err.external_message().contains("/etc/secret"));
    }

    #[test]
    fn test_validation_json_has_details() {
        let err = Error::Validation(ValidationError::ForwardReference {
            node: "step_2".into(),
            source_node: "step_3".into(),
        });
        let body = err.to_external_json();
        assert_eq!(body["error"]["code"], "FORWARD_REFERENCE");
        assert_eq!(body["error"]["details"]["node"], "step_2");
        assert_eq!(body["error"]["details"]["source_node"], "step_3");
    }
}
