//! Error taxonomy shared by every client component.
//!
//! Each panel catches and displays its own errors; only `AuthExpired` is
//! additionally broadcast through the session (see `session.rs`).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP 401: the credential has already been cleared when this is returned.
    #[error("session expired, please log in again")]
    AuthExpired,

    /// HTTP 403: the credential is kept.
    #[error("permission denied")]
    PermissionDenied,

    /// Detected locally; no network call was made.
    #[error("{0}")]
    Validation(String),

    /// Any other non-2xx status. `message` is the raw response body.
    #[error("{message}")]
    Server { status: u16, message: String },

    #[error("could not decode local data: {0}")]
    LocalDecode(String),

    #[error("request failed: {0}")]
    Transport(String),

    #[error("local store error: {0}")]
    Storage(#[from] sled::Error),

    #[error("unexpected response payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ClientError {
    pub fn validation(msg: impl Into<String>) -> Self {
        ClientError::Validation(msg.into())
    }

    pub fn is_auth_expired(&self) -> bool {
        matches!(self, ClientError::AuthExpired)
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, ClientError::PermissionDenied)
    }

    /// True when the error was produced before any request left the process.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            ClientError::Validation(_) | ClientError::LocalDecode(_) | ClientError::Config(_)
        )
    }
}

pub type Result<T, E = ClientError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_error_displays_raw_body() {
        let err = ClientError::Server {
            status: 402,
            message: "plan limit reached (upgrade required)".to_string(),
        };
        assert_eq!(err.to_string(), "plan limit reached (upgrade required)");
        assert!(!err.is_local());
    }

    #[test]
    fn classification_helpers() {
        assert!(ClientError::AuthExpired.is_auth_expired());
        assert!(ClientError::PermissionDenied.is_permission_denied());
        assert!(ClientError::validation("Choose RBAC YAML file").is_local());
    }
}
