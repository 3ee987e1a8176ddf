//! services/gateway/src/gateway/actions.rs
//!
//! Runs gated actions: quota check first, then the action, then usage accounting
//! for guests. Remote document operations go through here.

use crate::config::Config;
use crate::error::GatewayError;
use crate::gateway::credentials::CredentialStore;
use crate::gateway::document::ActiveDocumentHandle;
use crate::gateway::guest::GuestIdentityService;
use crate::gateway::quota::QuotaGate;
use gateway_core::domain::{ToolOutput, ToolRequest, UsageCheck};
use gateway_core::ports::DocumentProcessor;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

//=========================================================================================
// Upload limits
//=========================================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum UploadRejection {
    #[error("'{0}' is not a PDF file")]
    InvalidType(String),
    #[error("'{name}' is larger than the {limit_mb} MB limit")]
    FileTooLarge { name: String, limit_mb: f64 },
    #[error("The files together are larger than the {limit_mb} MB limit")]
    TotalTooLarge { limit_mb: f64 },
    #[error("Select at least two files to merge")]
    MergeNeedsTwoFiles,
}

/// Client-side checks applied to uploads before any quota is consulted.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadLimits {
    pub max_file_guest_mb: f64,
    pub max_file_user_mb: f64,
    pub max_total_mb: f64,
}

impl UploadLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_file_guest_mb: config.max_file_size_guest_mb,
            max_file_user_mb: config.max_file_size_user_mb,
            max_total_mb: config.max_total_upload_mb,
        }
    }

    pub fn max_file_bytes(&self, is_guest: bool) -> u64 {
        let mb = if is_guest {
            self.max_file_guest_mb
        } else {
            self.max_file_user_mb
        };
        (mb * BYTES_PER_MB) as u64
    }

    pub fn validate(&self, request: &ToolRequest, is_guest: bool) -> Result<(), UploadRejection> {
        let files = request.files();
        if matches!(request, ToolRequest::Merge { .. }) && files.len() < 2 {
            return Err(UploadRejection::MergeNeedsTwoFiles);
        }

        let max_file = self.max_file_bytes(is_guest);
        let mut total: u64 = 0;
        for file in &files {
            if !file.looks_like_pdf() {
                return Err(UploadRejection::InvalidType(file.name.clone()));
            }
            let size = file.size() as u64;
            if size > max_file {
                return Err(UploadRejection::FileTooLarge {
                    name: file.name.clone(),
                    limit_mb: if is_guest {
                        self.max_file_guest_mb
                    } else {
                        self.max_file_user_mb
                    },
                });
            }
            total += size;
        }

        if total > (self.max_total_mb * BYTES_PER_MB) as u64 {
            return Err(UploadRejection::TotalTooLarge {
                limit_mb: self.max_total_mb,
            });
        }
        Ok(())
    }
}

//=========================================================================================
// GatedActions
//=========================================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome<T> {
    Completed(T),
    /// The quota gate refused; carries the usage answer that caused it, if any.
    LimitReached(Option<UsageCheck>),
}

pub struct GatedActions {
    credentials: CredentialStore,
    guests: Arc<GuestIdentityService>,
    quota: Arc<QuotaGate>,
    documents: Arc<ActiveDocumentHandle>,
    processor: Arc<dyn DocumentProcessor>,
    limits: UploadLimits,
}

impl GatedActions {
    pub fn new(
        credentials: CredentialStore,
        guests: Arc<GuestIdentityService>,
        quota: Arc<QuotaGate>,
        documents: Arc<ActiveDocumentHandle>,
        processor: Arc<dyn DocumentProcessor>,
        limits: UploadLimits,
    ) -> Self {
        Self {
            credentials,
            guests,
            quota,
            documents,
            processor,
            limits,
        }
    }

    /// Runs `action` behind the quota gate.
    ///
    /// A signed-in user whose session claim says the agreement is still pending
    /// is refused outright, whether or not the agreement gate has seen the session.
    /// After a successful action by a guest one use is recorded. A failure to
    /// record it is logged and otherwise ignored: the action already happened.
    pub async fn run<T, F, Fut>(&self, action: F) -> Result<GateOutcome<T>, GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        if let Some(session) = self.credentials.status().session() {
            if !session.eula_accepted {
                return Err(GatewayError::Compliance(
                    "The agreement must be accepted before continuing".to_string(),
                ));
            }
        }
        if !self.quota.check_limit().await {
            return Ok(GateOutcome::LimitReached(self.quota.usage_info()));
        }

        let value = match action().await {
            Ok(value) => value,
            Err(e) => {
                if e.is_token_invalid() {
                    warn!("The backend rejected the session token, signing out.");
                    self.credentials.sign_out();
                }
                return Err(e);
            }
        };

        if !self.credentials.is_authenticated() {
            match self.guests.current_guest_id().await {
                Some(guest_id) => {
                    if let Err(e) = self.guests.increment_usage(&guest_id).await {
                        warn!("Failed to record guest usage: {}", e);
                    }
                }
                None => warn!("Gated action completed without a guest id to charge."),
            }
        }
        Ok(GateOutcome::Completed(value))
    }

    /// Validates and runs a remote document operation. A PDF result becomes the
    /// active document.
    pub async fn process(
        &self,
        request: ToolRequest,
    ) -> Result<GateOutcome<ToolOutput>, GatewayError> {
        let is_guest = !self.credentials.is_authenticated();
        self.limits.validate(&request, is_guest)?;

        let processor = self.processor.clone();
        let outcome = self
            .run(move || async move {
                processor
                    .process(&request)
                    .await
                    .map_err(GatewayError::from_transport)
            })
            .await?;

        if let GateOutcome::Completed(ToolOutput::Document(doc)) = &outcome {
            info!("Processed document '{}' ({} bytes)", doc.name, doc.bytes.len());
            self.documents.save(doc.clone());
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::{sample_session, TestHarness, GUEST_LIMIT};
    use bytes::Bytes;
    use gateway_core::domain::{ClaimUpdate, ComplianceState, QuotaGateState, UploadFile};
    use gateway_core::ports::PortError;

    fn pdf(name: &str, len: usize) -> UploadFile {
        UploadFile {
            name: name.to_string(),
            mime: "application/pdf".to_string(),
            bytes: Bytes::from(vec![b'%'; len]),
        }
    }

    fn merge(a: &str, b: &str) -> ToolRequest {
        ToolRequest::Merge {
            files: vec![pdf(a, 4), pdf(b, 4)],
        }
    }

    fn limits() -> UploadLimits {
        UploadLimits {
            max_file_guest_mb: 1.0,
            max_file_user_mb: 2.0,
            max_total_mb: 3.0,
        }
    }

    #[test]
    fn per_file_limit_depends_on_the_principal() {
        let mb = 1024 * 1024;
        let request = ToolRequest::ConvertText {
            file: pdf("big.pdf", mb + 1),
        };

        assert!(matches!(
            limits().validate(&request, true),
            Err(UploadRejection::FileTooLarge { .. })
        ));
        assert_eq!(limits().validate(&request, false), Ok(()));
    }

    #[test]
    fn total_limit_and_merge_arity() {
        let mb = 1024 * 1024;
        let too_much = ToolRequest::Merge {
            files: vec![pdf("a.pdf", 2 * mb), pdf("b.pdf", 2 * mb)],
        };
        assert_eq!(
            limits().validate(&too_much, false),
            Err(UploadRejection::TotalTooLarge { limit_mb: 3.0 })
        );

        let single = ToolRequest::Merge {
            files: vec![pdf("a.pdf", 4)],
        };
        assert_eq!(
            limits().validate(&single, false),
            Err(UploadRejection::MergeNeedsTwoFiles)
        );
    }

    #[test]
    fn only_pdfs_are_accepted() {
        let request = ToolRequest::Reorder {
            file: UploadFile {
                name: "notes.docx".into(),
                mime: "application/msword".into(),
                bytes: Bytes::from_static(b"doc"),
            },
            page_numbers: "2,1".into(),
        };
        assert_eq!(
            limits().validate(&request, false),
            Err(UploadRejection::InvalidType("notes.docx".into()))
        );
    }

    #[tokio::test]
    async fn guest_with_one_use_left_gets_exactly_one_more() {
        let harness = TestHarness::new();
        let guest_id = harness.ctx.guests.get_or_create_guest_id().await.unwrap();
        harness.backend.set_usage(&guest_id, GUEST_LIMIT - 1);

        let first = harness
            .ctx
            .actions
            .process(merge("a.pdf", "b.pdf"))
            .await
            .unwrap();
        let GateOutcome::Completed(ToolOutput::Document(doc)) = first else {
            panic!("expected a document, got {:?}", first);
        };
        assert_eq!(doc.name, "merged.pdf");
        assert_eq!(harness.ctx.documents.current(), Some(doc));
        assert_eq!(harness.backend.usage_of(&guest_id), Some(GUEST_LIMIT));

        let second = harness
            .ctx
            .actions
            .process(merge("c.pdf", "d.pdf"))
            .await
            .unwrap();
        match second {
            GateOutcome::LimitReached(Some(check)) => {
                assert!(!check.can_use);
                assert_eq!(check.remaining_usage, 0);
            }
            other => panic!("expected the limit, got {:?}", other),
        }
        assert!(harness.ctx.quota.limit_modal_visible());
        assert_eq!(harness.backend.processed_requests(), 1);
    }

    #[tokio::test]
    async fn authenticated_users_are_not_charged() {
        let harness = TestHarness::new();
        harness.ctx.credentials.establish(sample_session(true)).unwrap();

        let outcome = harness
            .ctx
            .actions
            .process(ToolRequest::ConvertText {
                file: pdf("a.pdf", 4),
            })
            .await
            .unwrap();

        assert_eq!(
            outcome,
            GateOutcome::Completed(ToolOutput::Text("text of a.pdf".into()))
        );
        assert_eq!(harness.backend.guest_sessions_created(), 0);
        assert_eq!(harness.ctx.quota.state(), QuotaGateState::Allowed);
        // Text output leaves the active document alone.
        assert_eq!(harness.ctx.documents.current(), None);
    }

    #[tokio::test]
    async fn failed_increment_does_not_fail_the_action() {
        let harness = TestHarness::new();
        let guest_id = harness.ctx.guests.get_or_create_guest_id().await.unwrap();

        let outcome = harness
            .ctx
            .actions
            .run(|| async {
                harness.backend.fail_guest_calls(PortError::Timeout);
                Ok::<_, GatewayError>("done")
            })
            .await
            .unwrap();

        assert_eq!(outcome, GateOutcome::Completed("done"));
        assert_eq!(harness.backend.usage_of(&guest_id), Some(0));
    }

    #[tokio::test]
    async fn rejected_token_signs_the_user_out() {
        let harness = TestHarness::new();
        harness.ctx.credentials.establish(sample_session(true)).unwrap();
        harness.backend.fail_processing(PortError::Unauthorized);

        let err = harness
            .ctx
            .actions
            .process(merge("a.pdf", "b.pdf"))
            .await
            .unwrap_err();

        assert!(err.is_token_invalid());
        assert!(!harness.ctx.credentials.is_authenticated());
    }

    #[tokio::test(start_paused = true)]
    async fn pending_agreement_blocks_every_action() {
        let harness = TestHarness::new();
        harness.ctx.credentials.establish(sample_session(false)).unwrap();
        harness
            .ctx
            .compliance
            .observe(&harness.ctx.credentials.status())
            .await;

        let err = harness
            .ctx
            .actions
            .process(merge("a.pdf", "b.pdf"))
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::Compliance(_)));
        assert_eq!(harness.backend.processed_requests(), 0);
    }

    #[tokio::test]
    async fn pending_claim_blocks_even_before_the_gate_has_looked() {
        let harness = TestHarness::new();
        harness.ctx.credentials.establish(sample_session(false)).unwrap();
        assert_eq!(harness.ctx.compliance.state(), ComplianceState::Unknown);

        let err = harness
            .ctx
            .actions
            .process(merge("a.pdf", "b.pdf"))
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::Compliance(_)));
        assert_eq!(harness.backend.processed_requests(), 0);

        harness
            .ctx
            .session
            .update_session(ClaimUpdate::EulaAccepted)
            .unwrap();
        assert!(matches!(
            harness.ctx.actions.process(merge("a.pdf", "b.pdf")).await,
            Ok(GateOutcome::Completed(_))
        ));
    }

    #[tokio::test]
    async fn failed_guest_action_is_not_charged() {
        let harness = TestHarness::new();
        let guest_id = harness.ctx.guests.get_or_create_guest_id().await.unwrap();
        harness.backend.fail_processing(PortError::Http {
            status: 422,
            detail: Some("Invalid page range".to_string()),
        });

        let err = harness
            .ctx
            .actions
            .process(ToolRequest::ExtractPages {
                file: pdf("a.pdf", 4),
                page_range: "9-1".into(),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::Transport(ref msg) if msg == "Invalid page range"));
        assert_eq!(harness.backend.usage_of(&guest_id), Some(0));
        assert_eq!(harness.ctx.documents.current(), None);
        // The check ran, the increment never did.
        assert_eq!(harness.backend.usage_checks(), 1);
    }

    #[tokio::test]
    async fn guest_summary_is_text_and_charged() {
        let harness = TestHarness::new();
        let guest_id = harness.ctx.guests.get_or_create_guest_id().await.unwrap();

        let outcome = harness
            .ctx
            .actions
            .process(ToolRequest::Summarize {
                file: pdf("report.pdf", 4),
            })
            .await
            .unwrap();

        assert_eq!(
            outcome,
            GateOutcome::Completed(ToolOutput::Text("summary of report.pdf".into()))
        );
        assert_eq!(harness.backend.usage_of(&guest_id), Some(1));
        assert_eq!(harness.ctx.documents.current(), None);
    }

    #[tokio::test]
    async fn invalid_upload_is_rejected_before_the_gate() {
        let harness = TestHarness::new();
        let err = harness
            .ctx
            .actions
            .process(ToolRequest::Merge {
                files: vec![pdf("a.pdf", 4)],
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            GatewayError::UploadRejected(UploadRejection::MergeNeedsTwoFiles)
        ));
        assert_eq!(harness.backend.usage_checks(), 0);
    }
}
