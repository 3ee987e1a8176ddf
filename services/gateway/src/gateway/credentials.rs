//! services/gateway/src/gateway/credentials.rs
//!
//! The credential store: the single owner of the current session and its bearer token.
//! Every read of "who is the user" goes through here; only session exchange and
//! the sign-out paths write to it.

use chrono::{DateTime, Utc};
use gateway_core::domain::{AccessToken, AuthSession, ClaimUpdate, SessionStatus};
use gateway_core::ports::{KeyValueStore, PortError, PortResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Key of the persisted session record in the durable store.
pub const SESSION_KEY: &str = "auth_session";

//=========================================================================================
// "Impure" Persisted Record
//=========================================================================================

#[derive(Serialize, Deserialize)]
struct SessionRecord {
    user_id: String,
    email: Option<String>,
    username: Option<String>,
    access_token: String,
    eula_accepted: bool,
    established_at: DateTime<Utc>,
}

impl SessionRecord {
    fn from_domain(session: &AuthSession) -> Self {
        Self {
            user_id: session.user_id.clone(),
            email: session.email.clone(),
            username: session.username.clone(),
            access_token: session.access_token.as_str().to_string(),
            eula_accepted: session.eula_accepted,
            established_at: session.established_at,
        }
    }

    fn to_domain(self) -> AuthSession {
        AuthSession {
            user_id: self.user_id,
            email: self.email,
            username: self.username,
            access_token: AccessToken::new(self.access_token),
            eula_accepted: self.eula_accepted,
            established_at: self.established_at,
        }
    }
}

//=========================================================================================
// CredentialStore
//=========================================================================================

/// Cheap to clone; all clones share the same session channel.
#[derive(Clone)]
pub struct CredentialStore {
    status: Arc<watch::Sender<SessionStatus>>,
    store: Arc<dyn KeyValueStore>,
}

impl CredentialStore {
    /// Creates a store in the `Resolving` state. Call [`CredentialStore::restore`] next.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        let (tx, _rx) = watch::channel(SessionStatus::Resolving);
        Self {
            status: Arc::new(tx),
            store,
        }
    }

    /// Rehydrates the persisted session and settles the status.
    pub fn restore(&self) -> SessionStatus {
        let status = match self.store.get(SESSION_KEY) {
            Ok(Some(raw)) => match serde_json::from_str::<SessionRecord>(&raw) {
                Ok(record) if !record.access_token.is_empty() => {
                    SessionStatus::Authenticated(record.to_domain())
                }
                Ok(_) | Err(_) => {
                    warn!("Discarding unreadable persisted session.");
                    if let Err(e) = self.store.remove(SESSION_KEY) {
                        warn!("Failed to remove persisted session: {}", e);
                    }
                    SessionStatus::Anonymous
                }
            },
            Ok(None) => SessionStatus::Anonymous,
            Err(e) => {
                warn!("Failed to read persisted session, continuing signed out: {}", e);
                SessionStatus::Anonymous
            }
        };
        self.status.send_replace(status.clone());
        status
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// A receiver that is notified on every session change.
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// The bearer token of the authenticated principal, if any.
    pub fn current_token(&self) -> Option<AccessToken> {
        self.status
            .borrow()
            .session()
            .map(|session| session.access_token.clone())
    }

    pub fn is_authenticated(&self) -> bool {
        self.status.borrow().is_authenticated()
    }

    /// Makes `session` the current session and persists it.
    pub(crate) fn establish(&self, session: AuthSession) -> PortResult<()> {
        self.persist(&session)?;
        info!("Session established for user {}", session.user_id);
        self.status.send_replace(SessionStatus::Authenticated(session));
        Ok(())
    }

    /// Merges one claim into the current session without re-authenticating.
    ///
    /// The new status is published before this returns, so the next observer
    /// already sees the merged claim.
    pub(crate) fn merge_claim(&self, update: ClaimUpdate) -> PortResult<AuthSession> {
        let mut session = self
            .status
            .borrow()
            .session()
            .cloned()
            .ok_or(PortError::Unauthorized)?;
        match update {
            ClaimUpdate::EulaAccepted => session.eula_accepted = true,
        }
        self.persist(&session)?;
        self.status
            .send_replace(SessionStatus::Authenticated(session.clone()));
        Ok(session)
    }

    /// Drops the session and its token. Never fails: a leftover record is only logged.
    pub(crate) fn sign_out(&self) {
        if let Err(e) = self.store.remove(SESSION_KEY) {
            warn!("Failed to remove persisted session on sign-out: {}", e);
        }
        let previous = self.status.send_replace(SessionStatus::Anonymous);
        if let SessionStatus::Authenticated(session) = previous {
            info!("Signed out user {}", session.user_id);
        }
    }

    fn persist(&self, session: &AuthSession) -> PortResult<()> {
        let json = serde_json::to_string(&SessionRecord::from_domain(session))
            .map_err(|e| PortError::Storage(e.to_string()))?;
        self.store.set(SESSION_KEY, &json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::store::MemoryStore;
    use crate::gateway::testing::sample_session;
    use gateway_core::ports::PersistenceLifetime;

    fn durable() -> Arc<dyn KeyValueStore> {
        Arc::new(MemoryStore::new(PersistenceLifetime::Durable))
    }

    #[test]
    fn starts_resolving_and_restores_to_anonymous() {
        let credentials = CredentialStore::new(durable());
        assert_eq!(credentials.status(), SessionStatus::Resolving);
        assert_eq!(credentials.restore(), SessionStatus::Anonymous);
        assert!(credentials.current_token().is_none());
    }

    #[test]
    fn session_survives_a_reload() {
        let store = durable();
        let credentials = CredentialStore::new(store.clone());
        credentials.restore();
        credentials.establish(sample_session(false)).unwrap();

        let reloaded = CredentialStore::new(store);
        let status = reloaded.restore();
        assert_eq!(status, SessionStatus::Authenticated(sample_session(false)));
        assert_eq!(
            reloaded.current_token().unwrap().as_str(),
            sample_session(false).access_token.as_str()
        );
    }

    #[test]
    fn corrupt_record_is_removed() {
        let store = durable();
        store.set(SESSION_KEY, "{oops").unwrap();
        let credentials = CredentialStore::new(store.clone());
        assert_eq!(credentials.restore(), SessionStatus::Anonymous);
        assert_eq!(store.get(SESSION_KEY).unwrap(), None);
    }

    #[test]
    fn merge_claim_is_visible_immediately_and_persisted() {
        let store = durable();
        let credentials = CredentialStore::new(store.clone());
        credentials.establish(sample_session(false)).unwrap();
        let mut rx = credentials.subscribe();
        rx.borrow_and_update();

        credentials.merge_claim(ClaimUpdate::EulaAccepted).unwrap();

        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow().session().unwrap().eula_accepted);

        let reloaded = CredentialStore::new(store);
        assert!(reloaded.restore().session().unwrap().eula_accepted);
    }

    #[test]
    fn merge_claim_without_session_fails() {
        let credentials = CredentialStore::new(durable());
        credentials.restore();
        assert_eq!(
            credentials.merge_claim(ClaimUpdate::EulaAccepted),
            Err(PortError::Unauthorized)
        );
    }

    #[test]
    fn sign_out_leaves_no_token_behind() {
        let store = durable();
        let credentials = CredentialStore::new(store.clone());
        credentials.establish(sample_session(true)).unwrap();

        credentials.sign_out();

        assert_eq!(credentials.status(), SessionStatus::Anonymous);
        assert!(credentials.current_token().is_none());
        assert_eq!(store.get(SESSION_KEY).unwrap(), None);
    }
}
