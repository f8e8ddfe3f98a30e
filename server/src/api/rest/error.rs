//! Error handling for the REST API.
//!
//! `AppError` maps the engine's error taxonomy onto HTTP statuses and
//! keeps internals server-side.

use crate::config::Config;
use axum::{
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::Internal(msg) => {
                // Log full details server-side, return a generic message.
                tracing::error!(details = %msg, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal error occurred".to_string(),
                )
            }
        };
        let body = serde_json::json!({ "error": message });
        (status, Json(body)).into_response()
    }
}

impl From<stash_core::Error> for AppError {
    fn from(err: stash_core::Error) -> Self {
        use stash_core::Error;
        match err {
            Error::InvalidArgument(msg) => AppError::BadRequest(msg),
            Error::Format(msg) => AppError::BadRequest(format!("malformed payload: {msg}")),
            Error::UnexpectedEof(msg) => AppError::BadRequest(format!("truncated payload: {msg}")),
            Error::NotFound(msg) => AppError::NotFound(msg),
            Error::Conflict(msg) => AppError::Conflict(msg),
            Error::SessionState(msg) => AppError::BadRequest(msg),
            Error::Cancelled => AppError::BadRequest("request cancelled".into()),
            Error::Corrupt(msg) => {
                tracing::error!(details = %msg, "stored data failed verification");
                AppError::Internal(msg)
            }
            Error::Io(err) => AppError::Internal(err.to_string()),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!("internal error: {err:#}");
        AppError::Internal(err.to_string())
    }
}

/// Check the bearer token when an API key is configured. Authorization is
/// all-or-nothing; per-repository grants live outside this server.
pub fn require_auth(config: &Config, headers: &axum::http::HeaderMap) -> Result<(), AppError> {
    let Some(expected) = config.api_key.as_deref() else {
        return Ok(());
    };
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| AppError::Unauthorized("missing bearer token".into()))?;
    if token != expected {
        return Err(AppError::Unauthorized("invalid API key".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, HeaderValue};

    fn config_with_key(key: Option<&str>) -> Config {
        Config {
            server_name: "test".into(),
            data_dir: ".".into(),
            rest_port: 0,
            api_key: key.map(String::from),
            max_pack_size: 1024,
            compression_level: 3,
            session_ttl_secs: 60,
        }
    }

    #[test]
    fn no_key_configured_allows_all() {
        let config = config_with_key(None);
        assert!(require_auth(&config, &HeaderMap::new()).is_ok());
    }

    #[test]
    fn wrong_or_missing_token_is_rejected() {
        let config = config_with_key(Some("secret"));
        assert!(require_auth(&config, &HeaderMap::new()).is_err());

        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer nope"),
        );
        assert!(require_auth(&config, &headers).is_err());

        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer secret"),
        );
        assert!(require_auth(&config, &headers).is_ok());
    }
}
