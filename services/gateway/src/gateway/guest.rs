//! services/gateway/src/gateway/guest.rs
//!
//! Owns the anonymous identity: mints a guest id on first need, keeps it in the
//! durable store, and talks to the backend usage counter on its behalf.

use crate::error::GatewayError;
use gateway_core::domain::UsageCheck;
use gateway_core::ports::{GuestService, KeyValueStore};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Key of the guest id in the durable store.
pub const GUEST_ID_KEY: &str = "guest_id";

pub struct GuestIdentityService {
    backend: Arc<dyn GuestService>,
    store: Arc<dyn KeyValueStore>,
    /// Last id seen. Guarded by an async mutex so concurrent callers share one mint.
    cached: Mutex<Option<String>>,
}

impl GuestIdentityService {
    pub fn new(backend: Arc<dyn GuestService>, store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            backend,
            store,
            cached: Mutex::new(None),
        }
    }

    /// Loads a previously minted id from the store, if there is one.
    pub async fn initialize(&self) -> Option<String> {
        let mut cached = self.cached.lock().await;
        *cached = self.read_stored();
        if let Some(id) = cached.as_ref() {
            info!("Existing guest session found: {}", id);
        }
        cached.clone()
    }

    /// The current guest id without minting a new one.
    pub async fn current_guest_id(&self) -> Option<String> {
        let cached = self.cached.lock().await;
        match self.store.get(GUEST_ID_KEY) {
            Ok(stored) => stored,
            Err(_) => cached.clone(),
        }
    }

    /// Returns the guest id, minting one on the backend if none exists yet.
    pub async fn get_or_create_guest_id(&self) -> Result<String, GatewayError> {
        let mut cached = self.cached.lock().await;

        // The store is shared with other processes, so it wins over the cache.
        match self.store.get(GUEST_ID_KEY) {
            Ok(Some(id)) => {
                *cached = Some(id.clone());
                return Ok(id);
            }
            Ok(None) => *cached = None,
            Err(e) => {
                warn!("Failed to read guest id from the store: {}", e);
                if let Some(id) = cached.as_ref() {
                    return Ok(id.clone());
                }
            }
        }

        let usage = self
            .backend
            .create_session()
            .await
            .map_err(GatewayError::QuotaService)?;
        if !usage.is_consistent() {
            warn!(
                "Guest session {} reported inconsistent usage ({} used + {} left != {})",
                usage.guest_id, usage.usage_count, usage.remaining_usage, usage.max_usage
            );
        }
        if let Err(e) = self.store.set(GUEST_ID_KEY, &usage.guest_id) {
            warn!("Failed to persist guest id, keeping it in memory only: {}", e);
        }
        info!("New guest session created: {}", usage.guest_id);
        *cached = Some(usage.guest_id.clone());
        Ok(usage.guest_id)
    }

    /// Asks the backend whether the guest may perform another gated action.
    pub async fn check_usage(&self, guest_id: &str) -> Result<UsageCheck, GatewayError> {
        self.backend
            .check_usage(guest_id)
            .await
            .map_err(GatewayError::QuotaService)
    }

    /// Records one completed gated action.
    ///
    /// Fails with `QuotaExceeded` when the backend refuses because the limit was
    /// reached in the meantime (for example from another tab).
    pub async fn increment_usage(&self, guest_id: &str) -> Result<UsageCheck, GatewayError> {
        match self.backend.record_use(guest_id).await {
            Ok(check) => {
                info!(
                    "Guest usage updated: {} used, {} remaining",
                    check.usage_count, check.remaining_usage
                );
                Ok(check)
            }
            Err(e) if e.is_client_error() => Err(GatewayError::QuotaExceeded(
                e.detail().unwrap_or("Usage limit reached").to_string(),
            )),
            Err(e) => Err(GatewayError::QuotaService(e)),
        }
    }

    /// Deletes the guest session. The local id is dropped even if the backend call fails.
    pub async fn clear_session(&self) {
        let mut cached = self.cached.lock().await;
        let Some(guest_id) = self.read_stored().or_else(|| cached.clone()) else {
            return;
        };

        if let Err(e) = self.backend.delete_session(&guest_id).await {
            warn!("Failed to delete guest session {}: {}", guest_id, e);
        }
        if let Err(e) = self.store.remove(GUEST_ID_KEY) {
            warn!("Failed to remove guest id from the store: {}", e);
        }
        *cached = None;
        info!("Guest session cleared");
    }

    fn read_stored(&self) -> Option<String> {
        self.store.get(GUEST_ID_KEY).unwrap_or_else(|e| {
            warn!("Failed to read guest id from the store: {}", e);
            None
        })
    }
}
