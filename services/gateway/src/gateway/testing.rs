//! services/gateway/src/gateway/testing.rs
//!
//! In-memory fakes of the remote ports and a harness wiring them into a
//! `GatewayContext`, shared by the unit tests of the gateway modules.

use crate::adapters::store::MemoryStore;
use crate::config::Config;
use crate::gateway::state::{Backends, GatewayContext, Stores};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use gateway_core::domain::{
    AccessToken, ActiveDocument, AuthSession, GuestUsage, Registration, ToolOutput, ToolRequest,
    UsageCheck,
};
use gateway_core::ports::{
    AuthService, DocumentProcessor, GuestService, PersistenceLifetime, PortError, PortResult,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub const TEST_EMAIL: &str = "reader@example.com";
pub const TEST_PASSWORD: &str = "correct horse";
pub const TEST_ID_TOKEN: &str = "provider-id-token";
pub const GUEST_LIMIT: u32 = 3;

const AGREEMENT: &str = "Terms of use.\n\nRead all of this before accepting.";

/// A deterministic session, optionally with the agreement already accepted.
pub fn sample_session(eula_accepted: bool) -> AuthSession {
    AuthSession {
        user_id: "42".to_string(),
        email: Some(TEST_EMAIL.to_string()),
        username: Some("reader".to_string()),
        access_token: AccessToken::new("token-42"),
        eula_accepted,
        established_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
    }
}

//=========================================================================================
// FakeBackend
//=========================================================================================

#[derive(Default)]
struct FakeState {
    usage: HashMap<String, u32>,
    guest_sessions_created: u32,
    guest_sessions_deleted: u32,
    usage_checks: u32,
    guest_failure: Option<PortError>,
    exhaust_all: bool,
    agreement_fetches: u32,
    agreement_accepts: u32,
    agreement_rejection: Option<PortError>,
    agreement_fetch_fails: bool,
    processed: Vec<ToolRequest>,
    processing_failure: Option<PortError>,
}

/// Implements every remote port in memory.
#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<FakeState>,
}

impl FakeBackend {
    pub fn backends(self: &Arc<Self>) -> Backends {
        Backends {
            auth: self.clone(),
            guests: self.clone(),
            processor: self.clone(),
        }
    }

    pub fn guest_sessions_created(&self) -> u32 {
        self.state.lock().unwrap().guest_sessions_created
    }

    pub fn guest_sessions_deleted(&self) -> u32 {
        self.state.lock().unwrap().guest_sessions_deleted
    }

    pub fn usage_checks(&self) -> u32 {
        self.state.lock().unwrap().usage_checks
    }

    pub fn usage_of(&self, guest_id: &str) -> Option<u32> {
        self.state.lock().unwrap().usage.get(guest_id).copied()
    }

    /// Sets the recorded usage of `guest_id`.
    pub fn set_usage(&self, guest_id: &str, count: u32) {
        self.state
            .lock()
            .unwrap()
            .usage
            .insert(guest_id.to_string(), count);
    }

    /// Makes every guest call fail with `error` from now on.
    pub fn fail_guest_calls(&self, error: PortError) {
        self.state.lock().unwrap().guest_failure = Some(error);
    }

    /// Every guest, existing or future, is over the limit.
    pub fn exhaust_all_guests(&self) {
        self.state.lock().unwrap().exhaust_all = true;
    }

    pub fn agreement_text(&self) -> String {
        AGREEMENT.to_string()
    }

    pub fn agreement_fetches(&self) -> u32 {
        self.state.lock().unwrap().agreement_fetches
    }

    pub fn agreement_accepts(&self) -> u32 {
        self.state.lock().unwrap().agreement_accepts
    }

    pub fn reject_agreement_with(&self, error: PortError) {
        self.state.lock().unwrap().agreement_rejection = Some(error);
    }

    pub fn fail_agreement_fetch(&self) {
        self.state.lock().unwrap().agreement_fetch_fails = true;
    }

    pub fn processed_requests(&self) -> usize {
        self.state.lock().unwrap().processed.len()
    }

    pub fn fail_processing(&self, error: PortError) {
        self.state.lock().unwrap().processing_failure = Some(error);
    }

    fn guest_gate(&self) -> PortResult<()> {
        match &self.state.lock().unwrap().guest_failure {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn usage_check(count: u32, exhausted: bool) -> UsageCheck {
        let remaining = if exhausted {
            0
        } else {
            GUEST_LIMIT.saturating_sub(count)
        };
        UsageCheck {
            can_use: remaining > 0,
            usage_count: count,
            remaining_usage: remaining,
            message: format!("{} of {} uses left", remaining, GUEST_LIMIT),
        }
    }

    fn issued_session(eula_accepted: bool) -> AuthSession {
        AuthSession {
            access_token: AccessToken::new("issued-token"),
            established_at: Utc::now(),
            ..sample_session(eula_accepted)
        }
    }
}

#[async_trait]
impl AuthService for FakeBackend {
    async fn login(&self, email: &str, password: &str) -> PortResult<AuthSession> {
        if email == TEST_EMAIL && password == TEST_PASSWORD {
            Ok(Self::issued_session(false))
        } else {
            Err(PortError::Unauthorized)
        }
    }

    async fn exchange_identity_token(&self, id_token: &str) -> PortResult<AuthSession> {
        if id_token == TEST_ID_TOKEN {
            Ok(Self::issued_session(true))
        } else {
            Err(PortError::Http {
                status: 400,
                detail: Some("Invalid identity token".to_string()),
            })
        }
    }

    async fn register(&self, registration: &Registration) -> PortResult<()> {
        if registration.email == TEST_EMAIL {
            return Err(PortError::Http {
                status: 400,
                detail: Some("Email already registered".to_string()),
            });
        }
        Ok(())
    }

    async fn fetch_agreement(&self, _lang: &str) -> PortResult<String> {
        let mut state = self.state.lock().unwrap();
        state.agreement_fetches += 1;
        if state.agreement_fetch_fails {
            return Err(PortError::Http {
                status: 500,
                detail: None,
            });
        }
        Ok(AGREEMENT.to_string())
    }

    async fn accept_agreement(&self, _token: &AccessToken) -> PortResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = &state.agreement_rejection {
            return Err(error.clone());
        }
        state.agreement_accepts += 1;
        Ok(())
    }

    async fn delete_account(&self, _token: &AccessToken) -> PortResult<()> {
        Ok(())
    }
}

#[async_trait]
impl GuestService for FakeBackend {
    async fn create_session(&self) -> PortResult<GuestUsage> {
        self.guest_gate()?;
        let mut state = self.state.lock().unwrap();
        state.guest_sessions_created += 1;
        let guest_id = format!("guest-{}", state.guest_sessions_created);
        state.usage.insert(guest_id.clone(), 0);
        Ok(GuestUsage {
            guest_id,
            usage_count: 0,
            remaining_usage: GUEST_LIMIT,
            max_usage: GUEST_LIMIT,
        })
    }

    async fn check_usage(&self, guest_id: &str) -> PortResult<UsageCheck> {
        self.guest_gate()?;
        let mut state = self.state.lock().unwrap();
        state.usage_checks += 1;
        let count = state.usage.get(guest_id).copied().ok_or(PortError::Http {
            status: 404,
            detail: Some("Guest session not found".to_string()),
        })?;
        Ok(Self::usage_check(count, state.exhaust_all))
    }

    async fn record_use(&self, guest_id: &str) -> PortResult<UsageCheck> {
        self.guest_gate()?;
        let mut state = self.state.lock().unwrap();
        let exhausted = state.exhaust_all;
        let count = state.usage.get_mut(guest_id).ok_or(PortError::Http {
            status: 404,
            detail: Some("Guest session not found".to_string()),
        })?;
        if exhausted || *count >= GUEST_LIMIT {
            return Err(PortError::Http {
                status: 403,
                detail: Some("Usage limit reached".to_string()),
            });
        }
        *count += 1;
        Ok(Self::usage_check(*count, exhausted))
    }

    async fn delete_session(&self, guest_id: &str) -> PortResult<()> {
        self.guest_gate()?;
        let mut state = self.state.lock().unwrap();
        state.usage.remove(guest_id);
        state.guest_sessions_deleted += 1;
        Ok(())
    }
}

#[async_trait]
impl DocumentProcessor for FakeBackend {
    async fn process(&self, request: &ToolRequest) -> PortResult<ToolOutput> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = &state.processing_failure {
            return Err(error.clone());
        }
        state.processed.push(request.clone());

        let output = match request {
            ToolRequest::ConvertText { file } => {
                ToolOutput::Text(format!("text of {}", file.name))
            }
            ToolRequest::Summarize { file } => {
                ToolOutput::Text(format!("summary of {}", file.name))
            }
            other => {
                let bytes: Vec<u8> = other
                    .files()
                    .iter()
                    .flat_map(|file| file.bytes.iter().copied())
                    .collect();
                ToolOutput::Document(ActiveDocument::pdf(other.output_name(), bytes))
            }
        };
        Ok(output)
    }
}

//=========================================================================================
// TestHarness
//=========================================================================================

pub struct TestHarness {
    pub ctx: GatewayContext,
    pub backend: Arc<FakeBackend>,
    pub durable: Arc<MemoryStore>,
    pub session_store: Arc<MemoryStore>,
}

impl TestHarness {
    /// A context whose session has been restored (anonymous unless the stores say otherwise).
    pub fn new() -> Self {
        let harness = Self::unresolved();
        harness.ctx.credentials.restore();
        harness
    }

    /// A context that has not restored its session yet.
    pub fn unresolved() -> Self {
        let backend = Arc::new(FakeBackend::default());
        let durable = Arc::new(MemoryStore::new(PersistenceLifetime::Durable));
        let session_store = Arc::new(MemoryStore::new(PersistenceLifetime::Session));
        Self::assemble(backend, durable, session_store)
    }

    /// A fresh context over the same stores and backend, as after an application restart.
    pub fn reload(&self) -> Self {
        let harness = Self::assemble(
            self.backend.clone(),
            self.durable.clone(),
            self.session_store.clone(),
        );
        harness.ctx.credentials.restore();
        harness
    }

    fn assemble(
        backend: Arc<FakeBackend>,
        durable: Arc<MemoryStore>,
        session_store: Arc<MemoryStore>,
    ) -> Self {
        let stores = Stores {
            durable: durable.clone(),
            session: session_store.clone(),
        };
        let ctx = GatewayContext::new(Arc::new(Config::default()), stores, backend.backends());
        Self {
            ctx,
            backend,
            durable,
            session_store,
        }
    }
}
