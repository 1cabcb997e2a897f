//! Shared error classification for source clients (§4.3).
//!
//! Handlers branch on this classification rather than inspecting
//! source-specific error types: a `TransientError` is retried on the next
//! poll, an `AuthError` routes through the connection registry's
//! `markInvalid`, and a `PermanentError` is recorded against the artifact
//! without retry.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("transient error: {0}")]
    Transient(String),
    #[error("authentication error: {0}")]
    Auth(String),
    #[error("permanent error: {0}")]
    Permanent(String),
}

impl SourceError {
    pub fn is_auth(&self) -> bool {
        matches!(self, SourceError::Auth(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Transient(_))
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return SourceError::Auth(e.to_string());
            }
            if status.is_client_error() {
                return SourceError::Permanent(e.to_string());
            }
        }
        if e.is_timeout() || e.is_connect() {
            return SourceError::Transient(e.to_string());
        }
        SourceError::Transient(e.to_string())
    }
}

impl From<octocrab::Error> for SourceError {
    fn from(e: octocrab::Error) -> Self {
        let message = e.to_string();
        if message.contains("401") || message.contains("403") || message.contains("Bad credentials") {
            SourceError::Auth(message)
        } else if message.contains("404") || message.contains("422") {
            SourceError::Permanent(message)
        } else {
            SourceError::Transient(message)
        }
    }
}

impl From<tokio_rusqlite::Error> for SourceError {
    fn from(e: tokio_rusqlite::Error) -> Self {
        SourceError::Transient(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SourceError>;
