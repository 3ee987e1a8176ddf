//! services/gateway/src/error.rs
//!
//! Defines the primary error type for the entire gateway service.

use crate::config::ConfigError;
use gateway_core::ports::PortError;

/// Message shown when the backend gave no usable detail.
pub const GENERIC_FAILURE: &str = "Something went wrong. Please try again.";

/// The primary error type for the `gateway` service.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Login or registration failed. Carries only the backend's `detail` or a generic message.
    #[error("Authentication failed: {0}")]
    AuthExchange(String),

    /// The usage service could not be reached or answered with an error.
    #[error("Usage service error: {0}")]
    QuotaService(PortError),

    /// The backend refused to record a use because the quota is exhausted.
    #[error("Usage limit reached: {0}")]
    QuotaExceeded(String),

    /// The agreement could not be fetched or accepted. Retrying is allowed.
    #[error("Agreement error: {0}")]
    Compliance(String),

    /// An authenticated endpoint rejected the bearer token. The session has been dropped.
    #[error("The session is no longer valid, please sign in again")]
    TokenInvalid,

    /// A generic non-2xx or network failure of a page-level call.
    #[error("{0}")]
    Transport(String),

    /// A file was refused before anything was sent.
    #[error("Upload rejected: {0}")]
    UploadRejected(#[from] crate::gateway::actions::UploadRejection),

    /// Represents an error that occurred during configuration loading.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Represents an error that propagated up from one of the core service ports.
    #[error("Service Port Error: {0}")]
    Port(#[from] PortError),

    /// Represents a standard Input/Output error (e.g., reading an upload from disk).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A catch-all for any other unexpected errors.
    #[error("An unexpected internal error occurred: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Maps a port error raised by a page-level call into the user-facing taxonomy.
    pub fn from_transport(err: PortError) -> Self {
        match err {
            PortError::Unauthorized => GatewayError::TokenInvalid,
            PortError::Timeout => GatewayError::Transport("The request timed out".to_string()),
            PortError::Http { status, detail } => GatewayError::Transport(
                detail.unwrap_or_else(|| format!("Request failed with status {}", status)),
            ),
            other => GatewayError::Transport(other.to_string()),
        }
    }

    pub fn is_token_invalid(&self) -> bool {
        matches!(self, GatewayError::TokenInvalid)
    }
}
