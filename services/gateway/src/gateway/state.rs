//! services/gateway/src/gateway/state.rs
//!
//! The gateway context: every component, built once at start-up and handed to
//! whatever drives the gateway.

use crate::adapters::dispatcher::RequestDispatcher;
use crate::adapters::http::HttpBackend;
use crate::adapters::store::FileStore;
use crate::config::Config;
use crate::error::GatewayError;
use crate::gateway::actions::{GatedActions, UploadLimits};
use crate::gateway::compliance::ComplianceGate;
use crate::gateway::credentials::CredentialStore;
use crate::gateway::document::ActiveDocumentHandle;
use crate::gateway::guest::GuestIdentityService;
use crate::gateway::quota::QuotaGate;
use crate::gateway::session::SessionExchange;
use chrono::{DateTime, Utc};
use gateway_core::domain::{Principal, SessionStatus};
use gateway_core::ports::{
    AuthService, DocumentProcessor, GuestService, KeyValueStore, PersistenceLifetime, PortResult,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// File names of the stores inside the state directory.
pub const DURABLE_STORE_FILE: &str = "durable.json";
pub const SESSION_STORE_FILE: &str = "session.json";

/// Last-activity marker kept in the session store.
pub const SESSION_SEEN_KEY: &str = "session_last_seen";

/// The two key-value stores: one that outlives the session and one that doesn't.
#[derive(Clone)]
pub struct Stores {
    pub durable: Arc<dyn KeyValueStore>,
    pub session: Arc<dyn KeyValueStore>,
}

impl Stores {
    /// Opens the file-backed stores under `dir`, creating it if needed.
    ///
    /// A session store idle for longer than `session_idle`, or without a marker,
    /// is wiped first: that run starts a new session.
    pub fn open(dir: &Path, session_idle: Duration) -> Result<Self, GatewayError> {
        let durable = FileStore::open(dir.join(DURABLE_STORE_FILE), PersistenceLifetime::Durable)?;
        let session = FileStore::open(dir.join(SESSION_STORE_FILE), PersistenceLifetime::Session)?;
        begin_session(&session, session_idle, Utc::now())?;
        Ok(Self {
            durable: Arc::new(durable),
            session: Arc::new(session),
        })
    }
}

/// Continues the session kept in `store`, or wipes it if it went stale.
/// Returns whether it was wiped.
fn begin_session(store: &FileStore, idle: Duration, now: DateTime<Utc>) -> PortResult<bool> {
    let last_seen = store
        .get(SESSION_SEEN_KEY)?
        .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
        .map(|seen| seen.with_timezone(&Utc));
    let expired = match last_seen {
        // A marker from the future (clock change) keeps the session.
        Some(seen) => now
            .signed_duration_since(seen)
            .to_std()
            .map(|elapsed| elapsed > idle)
            .unwrap_or(false),
        None => true,
    };
    if expired {
        store.wipe()?;
        info!("New session, session-scoped state discarded");
    }
    store.set(SESSION_SEEN_KEY, &now.to_rfc3339())?;
    Ok(expired)
}

/// The remote ports.
#[derive(Clone)]
pub struct Backends {
    pub auth: Arc<dyn AuthService>,
    pub guests: Arc<dyn GuestService>,
    pub processor: Arc<dyn DocumentProcessor>,
}

#[derive(Clone)]
pub struct GatewayContext {
    pub config: Arc<Config>,
    pub credentials: CredentialStore,
    pub guests: Arc<GuestIdentityService>,
    pub session: Arc<SessionExchange>,
    pub quota: Arc<QuotaGate>,
    pub compliance: Arc<ComplianceGate>,
    pub documents: Arc<ActiveDocumentHandle>,
    pub actions: Arc<GatedActions>,
}

impl GatewayContext {
    pub fn new(config: Arc<Config>, stores: Stores, backends: Backends) -> Self {
        let credentials = CredentialStore::new(stores.durable.clone());
        Self::assemble(config, stores, credentials, backends)
    }

    /// Builds a context talking to the backend at `config.api_base_url`.
    pub fn connect(config: Arc<Config>, stores: Stores) -> Result<Self, GatewayError> {
        let credentials = CredentialStore::new(stores.durable.clone());
        let dispatcher = RequestDispatcher::new(&config.api_base_url, config.request_timeout)?
            .with_identity(credentials.clone(), stores.durable.clone());
        let backend = Arc::new(HttpBackend::new(dispatcher));
        let backends = Backends {
            auth: backend.clone(),
            guests: backend.clone(),
            processor: backend,
        };
        info!("Gateway connected to {}", config.api_base_url);
        Ok(Self::assemble(config, stores, credentials, backends))
    }

    fn assemble(
        config: Arc<Config>,
        stores: Stores,
        credentials: CredentialStore,
        backends: Backends,
    ) -> Self {
        let guests = Arc::new(GuestIdentityService::new(
            backends.guests,
            stores.durable.clone(),
        ));
        let quota = Arc::new(QuotaGate::new(credentials.clone(), guests.clone()));
        let session = Arc::new(SessionExchange::new(
            backends.auth.clone(),
            credentials.clone(),
            guests.clone(),
            quota.clone(),
        ));
        let compliance = Arc::new(ComplianceGate::new(
            backends.auth,
            credentials.clone(),
            config.eula_lang.clone(),
        ));
        let documents = Arc::new(ActiveDocumentHandle::new(stores.session));
        let actions = Arc::new(GatedActions::new(
            credentials.clone(),
            guests.clone(),
            quota.clone(),
            documents.clone(),
            backends.processor,
            UploadLimits::from_config(&config),
        ));

        Self {
            config,
            credentials,
            guests,
            session,
            quota,
            compliance,
            documents,
            actions,
        }
    }

    /// Rehydrates everything persisted by an earlier run and settles the session.
    pub async fn start(&self) -> SessionStatus {
        let status = self.credentials.restore();
        self.guests.initialize().await;
        self.documents.restore();
        match &status {
            SessionStatus::Authenticated(session) => {
                info!("Resumed session of user {}", session.user_id)
            }
            _ => info!("No session, continuing as a guest"),
        }
        status
    }

    /// The acting identity, if there is one yet. A signed-in user wins over a
    /// leftover guest id.
    pub async fn principal(&self) -> Option<Principal> {
        if let Some(session) = self.credentials.status().session() {
            return Some(Principal::from_session(session));
        }
        self.guests
            .current_guest_id()
            .await
            .map(|guest_id| Principal::Guest { guest_id })
    }
}
