//! services/gateway/src/gateway/document.rs
//!
//! The single shared slot holding the document currently being worked on.
//! It is mirrored into the session-scoped store so it survives reloads.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use gateway_core::domain::ActiveDocument;
use gateway_core::ports::{KeyValueStore, PersistenceLifetime};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Key of the persisted document in the session store.
pub const DOCUMENT_KEY: &str = "activePdfBase64";

#[derive(Serialize, Deserialize)]
struct DocumentRecord {
    name: String,
    mime: String,
    /// `data:<mime>;base64,<payload>`
    data_url: String,
}

impl DocumentRecord {
    fn from_domain(doc: &ActiveDocument) -> Self {
        Self {
            name: doc.name.clone(),
            mime: doc.mime.clone(),
            data_url: format!("data:{};base64,{}", doc.mime, BASE64.encode(&doc.bytes)),
        }
    }

    fn to_domain(self) -> Result<ActiveDocument, String> {
        let (header, payload) = self
            .data_url
            .split_once(',')
            .ok_or_else(|| "data URL has no payload".to_string())?;
        if !header.starts_with("data:") || !header.ends_with(";base64") {
            return Err(format!("unexpected data URL header '{}'", header));
        }
        let bytes = BASE64.decode(payload).map_err(|e| e.to_string())?;
        Ok(ActiveDocument {
            bytes: bytes.into(),
            name: self.name,
            mime: self.mime,
        })
    }
}

pub struct ActiveDocumentHandle {
    store: Arc<dyn KeyValueStore>,
    current: watch::Sender<Option<ActiveDocument>>,
    refresh_key: AtomicU64,
}

impl ActiveDocumentHandle {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        if store.lifetime() != PersistenceLifetime::Session {
            warn!("The active document is stored in a store that outlives the session.");
        }
        let (current, _rx) = watch::channel(None);
        Self {
            store,
            current,
            refresh_key: AtomicU64::new(0),
        }
    }

    /// Rehydrates the document persisted by an earlier load of the application.
    /// A record that can't be decoded is removed.
    pub fn restore(&self) -> Option<ActiveDocument> {
        let raw = match self.store.get(DOCUMENT_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!("Failed to read the persisted document: {}", e);
                return None;
            }
        };

        let restored = serde_json::from_str::<DocumentRecord>(&raw)
            .map_err(|e| e.to_string())
            .and_then(DocumentRecord::to_domain);
        match restored {
            Ok(doc) => {
                info!("Restored active document '{}' ({} bytes)", doc.name, doc.bytes.len());
                self.current.send_replace(Some(doc.clone()));
                Some(doc)
            }
            Err(e) => {
                warn!("Discarding unreadable persisted document: {}", e);
                if let Err(e) = self.store.remove(DOCUMENT_KEY) {
                    warn!("Failed to remove the persisted document: {}", e);
                }
                None
            }
        }
    }

    /// Replaces the current document. The previous one is discarded.
    ///
    /// If the document can't be persisted (too large for the store, say) it is
    /// still kept in memory for this load.
    pub fn save(&self, doc: ActiveDocument) {
        let record = DocumentRecord::from_domain(&doc);
        let persisted = serde_json::to_string(&record)
            .map_err(|e| e.to_string())
            .and_then(|json| self.store.set(DOCUMENT_KEY, &json).map_err(|e| e.to_string()));
        if let Err(e) = persisted {
            warn!("Could not persist document '{}': {}", doc.name, e);
        }

        info!("Active document is now '{}' ({} bytes)", doc.name, doc.bytes.len());
        self.current.send_replace(Some(doc));
        self.trigger_refresh();
    }

    /// Removes both the in-memory document and its persisted form.
    pub fn clear(&self) {
        if let Err(e) = self.store.remove(DOCUMENT_KEY) {
            warn!("Failed to remove the persisted document: {}", e);
        }
        self.current.send_replace(None);
        self.trigger_refresh();
    }

    pub fn current(&self) -> Option<ActiveDocument> {
        self.current.borrow().clone()
    }

    /// Subscribers are notified on every save and clear.
    pub fn subscribe(&self) -> watch::Receiver<Option<ActiveDocument>> {
        self.current.subscribe()
    }

    pub fn refresh_key(&self) -> u64 {
        self.refresh_key.load(Ordering::Relaxed)
    }

    /// Asks views of the document to redraw without changing it.
    pub fn trigger_refresh(&self) {
        self.refresh_key.fetch_add(1, Ordering::Relaxed);
    }
}
