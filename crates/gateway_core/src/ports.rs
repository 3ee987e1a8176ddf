//! crates/gateway_core/src/ports.rs
//!
//! Defines the service contracts (traits) the gateway depends on.
//! These traits form the boundary of the hexagonal architecture, allowing the core
//! to be independent of the concrete backend transport and the local storage medium.

use async_trait::async_trait;
use crate::domain::{
    AccessToken, AuthSession, GuestUsage, Registration, ToolOutput, ToolRequest, UsageCheck,
};

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
/// This abstracts away the specific errors from external services (e.g., network, disk).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    #[error("Unauthorized")]
    Unauthorized,
    /// A non-2xx answer other than 401. `detail` is the backend's own message, if any.
    #[error("Backend answered {status}: {}", .detail.as_deref().unwrap_or("no detail"))]
    Http { status: u16, detail: Option<String> },
    #[error("The request timed out")]
    Timeout,
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
}

impl PortError {
    /// The backend's `detail` string, when the error carries one.
    pub fn detail(&self) -> Option<&str> {
        match self {
            PortError::Http { detail, .. } => detail.as_deref(),
            _ => None,
        }
    }

    pub fn is_client_error(&self) -> bool {
        matches!(self, PortError::Http { status, .. } if (400..500).contains(status))
    }
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

//=========================================================================================
// Local persistence
//=========================================================================================

/// How long values written to a store survive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceLifetime {
    /// Survives reloads within one browsing session only.
    Session,
    /// Survives indefinitely.
    Durable,
}

/// A string key-value store backing the gateway's client-side state.
///
/// Other processes may share the same store, so values must be re-read
/// before acting on them.
pub trait KeyValueStore: Send + Sync {
    fn lifetime(&self) -> PersistenceLifetime;
    fn get(&self, key: &str) -> PortResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> PortResult<()>;
    fn remove(&self, key: &str) -> PortResult<()>;
}

//=========================================================================================
// Backend Ports (Traits)
//=========================================================================================

#[async_trait]
pub trait AuthService: Send + Sync {
    /// Verifies an email/password pair and mints a session.
    async fn login(&self, email: &str, password: &str) -> PortResult<AuthSession>;

    /// Trades an identity-provider `id_token` for an application session.
    async fn exchange_identity_token(&self, id_token: &str) -> PortResult<AuthSession>;

    async fn register(&self, registration: &Registration) -> PortResult<()>;

    /// Fetches the agreement text in the requested language.
    async fn fetch_agreement(&self, lang: &str) -> PortResult<String>;

    async fn accept_agreement(&self, token: &AccessToken) -> PortResult<()>;

    async fn delete_account(&self, token: &AccessToken) -> PortResult<()>;
}

#[async_trait]
pub trait GuestService: Send + Sync {
    async fn create_session(&self) -> PortResult<GuestUsage>;

    async fn check_usage(&self, guest_id: &str) -> PortResult<UsageCheck>;

    /// Records one completed use. May fail with a 4xx once the quota is exhausted.
    async fn record_use(&self, guest_id: &str) -> PortResult<UsageCheck>;

    async fn delete_session(&self, guest_id: &str) -> PortResult<()>;
}

#[async_trait]
pub trait DocumentProcessor: Send + Sync {
    /// Runs one remote document operation.
    async fn process(&self, request: &ToolRequest) -> PortResult<ToolOutput>;
}
