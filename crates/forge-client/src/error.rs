//! Error types for forge-client

use thiserror::Error;

/// Errors returned by forge API calls
#[derive(Error, Debug)]
pub enum ForgeError {
    /// Credentials missing, expired, or rejected (HTTP 401)
    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    /// Caller lacks a capability the operation needs (HTTP 403)
    #[error("Permission denied: missing '{capability}' capability")]
    Forbidden { capability: String },

    /// Resource does not exist (HTTP 404)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Too many requests (HTTP 429)
    #[error("Rate limited by forge")]
    RateLimited,

    /// Server-side failure (HTTP 5xx)
    #[error("Forge server error {status}: {message}")]
    Server { status: u16, message: String },

    /// Any other non-success status
    #[error("Forge API error {status}: {message}")]
    Api { status: u16, message: String },

    /// Request did not complete within the configured timeout
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Connection-level failure (DNS, refused, reset)
    #[error("Network error: {0}")]
    Network(String),

    /// Response body did not match the expected shape
    #[error("Unexpected response body: {0}")]
    Decode(String),

    /// Base URL cannot carry an API path
    #[error("Invalid forge URL: {0}")]
    InvalidUrl(String),

    /// Local file error while streaming an upload or download
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ForgeError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ForgeError::RateLimited
                | ForgeError::Server { .. }
                | ForgeError::Timeout(_)
                | ForgeError::Network(_)
        )
    }

    /// Map a non-success HTTP status to an error.
    ///
    /// `capability` names what the call needed, reported on 403.
    pub fn from_status(status: u16, capability: &str, body: &str) -> Self {
        let message = truncate(body.trim(), 200);
        match status {
            401 => ForgeError::Unauthorized(message),
            403 => ForgeError::Forbidden {
                capability: capability.to_string(),
            },
            404 => ForgeError::NotFound(message),
            429 => ForgeError::RateLimited,
            500..=599 => ForgeError::Server { status, message },
            _ => ForgeError::Api { status, message },
        }
    }
}

impl From<reqwest::Error> for ForgeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ForgeError::Timeout(err.to_string())
        } else if err.is_decode() {
            ForgeError::Decode(err.to_string())
        } else {
            ForgeError::Network(err.to_string())
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            ForgeError::from_status(401, "read namespace", ""),
            ForgeError::Unauthorized(_)
        ));
        assert!(ForgeError::from_status(429, "x", "").is_transient());
        assert!(ForgeError::from_status(503, "x", "down").is_transient());
        assert!(!ForgeError::from_status(404, "x", "").is_transient());
        assert!(!ForgeError::from_status(422, "x", "").is_transient());
    }

    #[test]
    fn test_forbidden_names_capability() {
        let err = ForgeError::from_status(403, "project create", "{\"message\":\"403 Forbidden\"}");
        assert!(err.to_string().contains("project create"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_long_bodies_are_truncated() {
        let body = "x".repeat(1000);
        match ForgeError::from_status(500, "x", &body) {
            ForgeError::Server { message, .. } => assert_eq!(message.len(), 203),
            other => panic!("unexpected {other:?}"),
        }
    }
}
