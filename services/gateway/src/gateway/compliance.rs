//! services/gateway/src/gateway/compliance.rs
//!
//! The agreement gate in front of every authenticated page. An authenticated user
//! whose session says the agreement was not accepted is blocked until they have
//! waited out the dwell time, scrolled the text to the end, and accepted.

use crate::error::GatewayError;
use crate::gateway::credentials::CredentialStore;
use crate::gateway::quota::LOGIN_ROUTE;
use gateway_core::domain::{
    AgreementModal, ClaimUpdate, ComplianceState, ScrollPosition, SessionStatus,
};
use gateway_core::ports::{AuthService, PortError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Shown in place of the agreement when it cannot be fetched.
pub const AGREEMENT_FALLBACK: &str = "Error loading agreement.";

const COUNTDOWN_PERIOD: Duration = Duration::from_secs(1);

pub struct ComplianceGate {
    auth: Arc<dyn AuthService>,
    credentials: CredentialStore,
    lang: String,
    state: Arc<watch::Sender<ComplianceState>>,
    /// Cancels the countdown of the modal currently open, if any.
    timer: Mutex<Option<CancellationToken>>,
    next_modal_id: AtomicU64,
    reload_epoch: watch::Sender<u64>,
}

impl ComplianceGate {
    pub fn new(auth: Arc<dyn AuthService>, credentials: CredentialStore, lang: String) -> Self {
        let (state, _rx) = watch::channel(ComplianceState::Unknown);
        let (reload_epoch, _rx) = watch::channel(0);
        Self {
            auth,
            credentials,
            lang,
            state: Arc::new(state),
            timer: Mutex::new(None),
            next_modal_id: AtomicU64::new(0),
            reload_epoch,
        }
    }

    /// Follows session changes until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut sessions = self.credentials.subscribe();
        loop {
            let status = sessions.borrow_and_update().clone();
            self.observe(&status).await;
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = sessions.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        self.stop_timer();
        debug!("Compliance gate stopped.");
    }

    /// Re-evaluates the gate against one observed session status.
    pub async fn observe(&self, status: &SessionStatus) {
        match status {
            SessionStatus::Resolving => {
                self.stop_timer();
                self.state.send_replace(ComplianceState::Unknown);
            }
            SessionStatus::Anonymous => {
                self.stop_timer();
                self.state.send_replace(ComplianceState::Unblocked);
            }
            SessionStatus::Authenticated(session) => {
                if session.eula_accepted {
                    self.stop_timer();
                    self.state.send_replace(ComplianceState::Unblocked);
                    return;
                }
                // A session notification while the modal is up must not restart it.
                if self.state.borrow().is_blocked() {
                    return;
                }
                self.state.send_replace(ComplianceState::Evaluating);
                self.open_modal().await;
            }
        }
    }

    /// Records the latest scroll position of the agreement viewport.
    pub fn report_scroll(&self, position: ScrollPosition) {
        if !position.is_at_bottom() {
            return;
        }
        self.state.send_if_modified(|state| match state {
            ComplianceState::Blocked(modal) if !modal.has_scrolled_to_bottom => {
                modal.has_scrolled_to_bottom = true;
                true
            }
            _ => false,
        });
    }

    /// Whether the accept action is enabled right now.
    pub fn can_accept(&self) -> bool {
        self.state
            .borrow()
            .modal()
            .map(AgreementModal::can_accept)
            .unwrap_or(false)
    }

    /// Accepts the agreement on the backend and merges the claim into the session.
    ///
    /// A rejected token signs the user out and returns `TokenInvalid`; any other
    /// failure leaves the gate blocked so the user can retry.
    pub async fn accept(&self) -> Result<(), GatewayError> {
        {
            let state = self.state.borrow();
            match &*state {
                ComplianceState::Blocked(modal) if modal.can_accept() => {}
                ComplianceState::Blocked(_) => {
                    return Err(GatewayError::Compliance(
                        "The agreement must be read to the end before it can be accepted"
                            .to_string(),
                    ))
                }
                _ => {
                    return Err(GatewayError::Compliance(
                        "There is no agreement waiting for acceptance".to_string(),
                    ))
                }
            }
        }

        let Some(token) = self.credentials.current_token() else {
            warn!("Agreement accepted without a token, signing out.");
            self.force_sign_out();
            return Err(GatewayError::TokenInvalid);
        };

        match self.auth.accept_agreement(&token).await {
            Ok(()) => {
                let session = self
                    .credentials
                    .merge_claim(ClaimUpdate::EulaAccepted)
                    .map_err(|e| {
                        error!("Agreement accepted but the session could not be updated: {}", e);
                        GatewayError::Compliance(
                            "The agreement was accepted but the session could not be updated"
                                .to_string(),
                        )
                    })?;
                self.stop_timer();
                self.state.send_replace(ComplianceState::Unblocked);
                self.reload_epoch.send_modify(|epoch| *epoch += 1);
                info!("User {} accepted the agreement", session.user_id);
                Ok(())
            }
            Err(PortError::Unauthorized) => {
                warn!("Agreement acceptance rejected the token, signing out.");
                self.force_sign_out();
                Err(GatewayError::TokenInvalid)
            }
            Err(e) => {
                warn!("Agreement acceptance failed: {}", e);
                Err(GatewayError::Compliance(
                    e.detail().unwrap_or("An error occurred.").to_string(),
                ))
            }
        }
    }

    /// Refuses the agreement: the user is signed out. Returns the route to show next.
    pub fn decline(&self) -> &'static str {
        info!("Agreement declined, signing out.");
        self.force_sign_out();
        LOGIN_ROUTE
    }

    pub fn state(&self) -> ComplianceState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ComplianceState> {
        self.state.subscribe()
    }

    /// Whether protected content may render.
    pub fn render_allowed(&self) -> bool {
        matches!(*self.state.borrow(), ComplianceState::Unblocked)
    }

    /// Incremented each time protected content must reload after acceptance.
    pub fn subscribe_reloads(&self) -> watch::Receiver<u64> {
        self.reload_epoch.subscribe()
    }

    fn force_sign_out(&self) {
        self.credentials.sign_out();
        self.stop_timer();
        self.state.send_replace(ComplianceState::Unblocked);
    }

    async fn open_modal(&self) {
        let modal_id = self.next_modal_id.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        self.replace_timer(Some(cancel.clone()));

        self.state
            .send_replace(ComplianceState::Blocked(AgreementModal::open(modal_id)));
        let first_tick = Instant::now() + COUNTDOWN_PERIOD;
        tokio::spawn(run_countdown(self.state.clone(), modal_id, first_tick, cancel));
        info!("Agreement modal {} opened", modal_id);

        let text = match self.auth.fetch_agreement(&self.lang).await {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to load the agreement: {}", e);
                AGREEMENT_FALLBACK.to_string()
            }
        };
        self.state.send_if_modified(|state| match state {
            ComplianceState::Blocked(modal) if modal.modal_id == modal_id => {
                modal.agreement_text = text;
                true
            }
            _ => false,
        });
    }

    fn stop_timer(&self) {
        self.replace_timer(None);
    }

    fn replace_timer(&self, next: Option<CancellationToken>) {
        let previous = match self.timer.lock() {
            Ok(mut slot) => std::mem::replace(&mut *slot, next),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), next),
        };
        if let Some(previous) = previous {
            previous.cancel();
        }
    }
}

/// Decrements `time_left` of modal `modal_id` once per second until it reaches zero.
async fn run_countdown(
    state: Arc<watch::Sender<ComplianceState>>,
    modal_id: u64,
    first_tick: Instant,
    cancel: CancellationToken,
) {
    let mut ticker = interval_at(first_tick, COUNTDOWN_PERIOD);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let mut finished = false;
                state.send_if_modified(|state| match state {
                    ComplianceState::Blocked(modal) if modal.modal_id == modal_id => {
                        modal.time_left = modal.time_left.saturating_sub(1);
                        finished = modal.time_left == 0;
                        true
                    }
                    // Stale timer of a modal that is no longer showing.
                    _ => {
                        finished = true;
                        false
                    }
                });
                if finished {
                    break;
                }
            }
        }
    }
}
