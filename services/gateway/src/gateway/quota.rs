//! services/gateway/src/gateway/quota.rs
//!
//! The quota gate consulted before every gated action. Authenticated users always
//! pass; guests are checked against the backend usage counter.

use crate::gateway::credentials::CredentialStore;
use crate::gateway::guest::GuestIdentityService;
use gateway_core::domain::{QuotaGateState, SessionStatus, UsageCheck};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Where the "log in" button of the limit modal leads.
pub const LOGIN_ROUTE: &str = "/login";

pub struct QuotaGate {
    credentials: CredentialStore,
    guests: Arc<GuestIdentityService>,
    state: watch::Sender<QuotaGateState>,
    usage_info: Mutex<Option<UsageCheck>>,
}

impl QuotaGate {
    pub fn new(credentials: CredentialStore, guests: Arc<GuestIdentityService>) -> Self {
        let (state, _rx) = watch::channel(QuotaGateState::Idle);
        Self {
            credentials,
            guests,
            state,
            usage_info: Mutex::new(None),
        }
    }

    /// Decides whether a gated action may proceed.
    ///
    /// A failing usage check lets the action through: a transient backend issue
    /// must not block a legitimate user.
    pub async fn check_limit(&self) -> bool {
        match self.credentials.status() {
            SessionStatus::Authenticated(_) => {
                self.state.send_replace(QuotaGateState::Allowed);
                return true;
            }
            SessionStatus::Resolving => {
                debug!("Session still resolving, refusing the gated action for now.");
                return false;
            }
            SessionStatus::Anonymous => {}
        }

        // The limit modal stays up until it is closed or the user logs in.
        if *self.state.borrow() == QuotaGateState::Blocked {
            return false;
        }

        self.state.send_replace(QuotaGateState::Checking);
        let result = async {
            let guest_id = self.guests.get_or_create_guest_id().await?;
            self.guests.check_usage(&guest_id).await
        }
        .await;

        match result {
            Ok(check) => {
                let can_use = check.can_use;
                self.set_usage_info(Some(check));
                if can_use {
                    self.state.send_replace(QuotaGateState::Allowed);
                    true
                } else {
                    info!("Guest usage limit reached, showing the limit modal.");
                    self.state.send_replace(QuotaGateState::Blocked);
                    false
                }
            }
            Err(e) => {
                warn!("Error checking guest limit, allowing the action: {}", e);
                self.state.send_replace(QuotaGateState::Allowed);
                true
            }
        }
    }

    /// Hides the limit modal without consuming quota.
    pub fn close_limit_modal(&self) {
        self.state.send_replace(QuotaGateState::Idle);
    }

    /// Hides the limit modal and returns the login route to navigate to.
    pub fn redirect_to_login(&self) -> &'static str {
        self.state.send_replace(QuotaGateState::Idle);
        LOGIN_ROUTE
    }

    pub fn state(&self) -> QuotaGateState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<QuotaGateState> {
        self.state.subscribe()
    }

    pub fn limit_modal_visible(&self) -> bool {
        self.state() == QuotaGateState::Blocked
    }

    /// The last usage answer received from the backend.
    pub fn usage_info(&self) -> Option<UsageCheck> {
        self.usage_info.lock().ok().and_then(|info| info.clone())
    }

    fn set_usage_info(&self, check: Option<UsageCheck>) {
        if let Ok(mut info) = self.usage_info.lock() {
            *info = check;
        }
    }
}
