//! crates/gateway_core/src/domain.rs
//!
//! Defines the pure, core data structures for the gateway.
//! These structs are independent of any transport or serialization format.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;

/// Mime type of every document the gateway hands around.
pub const PDF_MIME: &str = "application/pdf";

/// How long a reader must dwell on the agreement before accepting it.
pub const AGREEMENT_DWELL_SECS: u32 = 20;

/// Distance from the bottom of the agreement viewport that still counts as "read".
pub const SCROLL_TOLERANCE: f64 = 10.0;

//=========================================================================================
// Identity
//=========================================================================================

/// A backend-issued bearer token.
///
/// Deliberately has no `Display` impl and a redacted `Debug` impl so it can't
/// end up in logs by accident.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(<redacted>)")
    }
}

/// The claims carried by an authenticated session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSession {
    pub user_id: String,
    pub email: Option<String>,
    pub username: Option<String>,
    pub access_token: AccessToken,
    pub eula_accepted: bool,
    pub established_at: DateTime<Utc>,
}

/// What the session mechanism currently knows about the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    /// Persisted session state has not been read yet.
    Resolving,
    /// No authenticated session; the user acts as a guest.
    Anonymous,
    Authenticated(AuthSession),
}

impl SessionStatus {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, SessionStatus::Authenticated(_))
    }

    pub fn session(&self) -> Option<&AuthSession> {
        match self {
            SessionStatus::Authenticated(session) => Some(session),
            _ => None,
        }
    }
}

/// The acting identity for a request, resolved once from the session state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    Guest {
        guest_id: String,
    },
    Authenticated {
        user_id: String,
        access_token: AccessToken,
        eula_accepted: bool,
    },
}

impl Principal {
    pub fn from_session(session: &AuthSession) -> Self {
        Principal::Authenticated {
            user_id: session.user_id.clone(),
            access_token: session.access_token.clone(),
            eula_accepted: session.eula_accepted,
        }
    }

    pub fn is_guest(&self) -> bool {
        matches!(self, Principal::Guest { .. })
    }
}

/// A single claim that may be merged into an existing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimUpdate {
    EulaAccepted,
}

/// A proof of identity that can be exchanged for a session.
#[derive(Clone)]
pub enum LoginProof {
    Credentials { email: String, password: String },
    /// An `id_token` obtained from the federated identity provider.
    IdentityProvider { id_token: String },
}

impl fmt::Debug for LoginProof {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoginProof::Credentials { email, .. } => f
                .debug_struct("Credentials")
                .field("email", email)
                .field("password", &"<redacted>")
                .finish(),
            LoginProof::IdentityProvider { .. } => f
                .debug_struct("IdentityProvider")
                .field("id_token", &"<redacted>")
                .finish(),
        }
    }
}

// Only used for account creation - contains sensitive data
#[derive(Clone)]
pub struct Registration {
    pub username: String,
    pub email: String,
    pub password: String,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("username", &self.username)
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}

//=========================================================================================
// Guest quota
//=========================================================================================

/// The server-tracked usage record of a guest, as returned when the session is minted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestUsage {
    pub guest_id: String,
    pub usage_count: u32,
    pub remaining_usage: u32,
    pub max_usage: u32,
}

impl GuestUsage {
    pub fn is_consistent(&self) -> bool {
        self.usage_count.checked_add(self.remaining_usage) == Some(self.max_usage)
    }
}

/// The answer of the backend to "may this guest still use a tool?".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageCheck {
    pub can_use: bool,
    pub usage_count: u32,
    pub remaining_usage: u32,
    pub message: String,
}

/// Observable state of the quota gate for one gated interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaGateState {
    Idle,
    Checking,
    Allowed,
    /// The "limit reached" modal is showing.
    Blocked,
}

//=========================================================================================
// Compliance
//=========================================================================================

/// One opening of the agreement modal. Progress never carries over between openings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgreementModal {
    pub modal_id: u64,
    pub agreement_text: String,
    pub time_left: u32,
    pub has_scrolled_to_bottom: bool,
}

impl AgreementModal {
    pub fn open(modal_id: u64) -> Self {
        Self {
            modal_id,
            agreement_text: String::from("Loading..."),
            time_left: AGREEMENT_DWELL_SECS,
            has_scrolled_to_bottom: false,
        }
    }

    /// Both conditions are required; neither one alone enables acceptance.
    pub fn can_accept(&self) -> bool {
        self.time_left == 0 && self.has_scrolled_to_bottom
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComplianceState {
    /// The session has not been resolved yet.
    Unknown,
    /// An authenticated session was observed and is being inspected.
    Evaluating,
    Blocked(AgreementModal),
    /// Children may render. Guests always end up here.
    Unblocked,
}

impl ComplianceState {
    pub fn is_blocked(&self) -> bool {
        matches!(self, ComplianceState::Blocked(_))
    }

    pub fn modal(&self) -> Option<&AgreementModal> {
        match self {
            ComplianceState::Blocked(modal) => Some(modal),
            _ => None,
        }
    }
}

/// Scroll position of the agreement viewport, in the same unit for all three fields.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollPosition {
    pub scroll_top: f64,
    pub scroll_height: f64,
    pub client_height: f64,
}

impl ScrollPosition {
    pub fn is_at_bottom(&self) -> bool {
        self.scroll_top + self.client_height >= self.scroll_height - SCROLL_TOLERANCE
    }
}

//=========================================================================================
// Documents
//=========================================================================================

/// The document currently being worked on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveDocument {
    pub bytes: Bytes,
    pub name: String,
    pub mime: String,
}

impl ActiveDocument {
    pub fn pdf(name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            name: name.into(),
            mime: PDF_MIME.to_string(),
        }
    }
}

/// A file to be sent to the document-processing service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub name: String,
    pub mime: String,
    pub bytes: Bytes,
}

impl UploadFile {
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    pub fn looks_like_pdf(&self) -> bool {
        self.mime == PDF_MIME || self.name.to_lowercase().ends_with(".pdf")
    }
}

impl From<ActiveDocument> for UploadFile {
    fn from(doc: ActiveDocument) -> Self {
        Self {
            name: doc.name,
            mime: doc.mime,
            bytes: doc.bytes,
        }
    }
}

/// A remote document-processing operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolRequest {
    Merge { files: Vec<UploadFile> },
    /// `page_range` uses the "1-3,5" notation.
    ExtractPages { file: UploadFile, page_range: String },
    /// `page_numbers` is the new page order, e.g. "3,1,2".
    Reorder { file: UploadFile, page_numbers: String },
    ConvertText { file: UploadFile },
    Summarize { file: UploadFile },
}

impl ToolRequest {
    pub fn files(&self) -> Vec<&UploadFile> {
        match self {
            ToolRequest::Merge { files } => files.iter().collect(),
            ToolRequest::ExtractPages { file, .. }
            | ToolRequest::Reorder { file, .. }
            | ToolRequest::ConvertText { file }
            | ToolRequest::Summarize { file } => vec![file],
        }
    }

    /// Name given to the produced document.
    pub fn output_name(&self) -> &'static str {
        match self {
            ToolRequest::Merge { .. } => "merged.pdf",
            ToolRequest::ExtractPages { .. } => "extracted.pdf",
            ToolRequest::Reorder { .. } => "reordered.pdf",
            ToolRequest::ConvertText { .. } => "converted.txt",
            ToolRequest::Summarize { .. } => "summary.txt",
        }
    }
}

/// What a document-processing operation produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutput {
    Document(ActiveDocument),
    Text(String),
}
