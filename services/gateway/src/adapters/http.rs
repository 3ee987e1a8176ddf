//! services/gateway/src/adapters/http.rs
//!
//! The HTTP adapter for the remote backend. Implements the `AuthService`,
//! `GuestService` and `DocumentProcessor` ports on top of the `RequestDispatcher`.

use crate::adapters::dispatcher::{FormPart, OutboundRequest, Payload, RequestDispatcher};
use async_trait::async_trait;
use chrono::Utc;
use gateway_core::domain::{
    AccessToken, ActiveDocument, AuthSession, GuestUsage, Registration, ToolOutput, ToolRequest,
    UploadFile, UsageCheck,
};
use gateway_core::ports::{
    AuthService, DocumentProcessor, GuestService, PortError, PortResult,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

//=========================================================================================
// "Impure" Wire Records
//=========================================================================================

/// Nested user object some auth endpoints return next to the token.
#[derive(Deserialize, Default)]
struct UserClaims {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    eula_accepted: Option<bool>,
}

/// Answer of `/auth/login` and `/auth/google`. Claims may be flat or nested under `user`.
#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    user_id: Option<Value>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    eula_accepted: Option<bool>,
    #[serde(default)]
    user: Option<UserClaims>,
}

impl TokenResponse {
    fn to_domain(self) -> PortResult<AuthSession> {
        if self.access_token.is_empty() {
            return Err(PortError::Unexpected(
                "Token response without an access token".to_string(),
            ));
        }
        let user = self.user.unwrap_or_default();
        let user_id = self
            .user_id
            .or(user.id)
            .and_then(id_to_string)
            .ok_or_else(|| PortError::Unexpected("Token response without a user id".to_string()))?;

        Ok(AuthSession {
            user_id,
            email: self.email.or(user.email),
            username: self.username.or(user.username),
            access_token: AccessToken::new(self.access_token),
            // A missing claim means the agreement still has to be accepted.
            eula_accepted: self.eula_accepted.or(user.eula_accepted).unwrap_or(false),
            established_at: Utc::now(),
        })
    }
}

fn id_to_string(id: Value) -> Option<String> {
    match id {
        Value::String(id) if !id.is_empty() => Some(id),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// Usage cap assumed when the backend does not report one.
const DEFAULT_GUEST_MAX_USAGE: u32 = 3;

/// Answer of `POST /guest/session`. Some backends key the id as `id` and only
/// report the usage count.
#[derive(Deserialize)]
struct GuestSessionRecord {
    #[serde(alias = "id")]
    guest_id: String,
    #[serde(default)]
    usage_count: u32,
    #[serde(default)]
    remaining_usage: Option<u32>,
    #[serde(default)]
    max_usage: Option<u32>,
}

impl GuestSessionRecord {
    fn to_domain(self) -> GuestUsage {
        let max_usage = self.max_usage.unwrap_or(DEFAULT_GUEST_MAX_USAGE);
        GuestUsage {
            remaining_usage: self
                .remaining_usage
                .unwrap_or_else(|| max_usage.saturating_sub(self.usage_count)),
            guest_id: self.guest_id,
            usage_count: self.usage_count,
            max_usage,
        }
    }
}

#[derive(Deserialize)]
struct UsageCheckRecord {
    can_use: bool,
    usage_count: u32,
    remaining_usage: u32,
    #[serde(default)]
    message: String,
}

impl UsageCheckRecord {
    fn to_domain(self) -> UsageCheck {
        UsageCheck {
            can_use: self.can_use,
            usage_count: self.usage_count,
            remaining_usage: self.remaining_usage,
            message: self.message,
        }
    }
}

fn decode<T: DeserializeOwned>(payload: Payload, what: &str) -> PortResult<T> {
    match payload {
        Payload::Json(value) => serde_json::from_value(value)
            .map_err(|e| PortError::Unexpected(format!("Malformed {}: {}", what, e))),
        Payload::Binary(_) => Err(PortError::Unexpected(format!(
            "Expected JSON for {}, got a binary body",
            what
        ))),
    }
}

fn file_part(name: &str, file: &UploadFile) -> FormPart {
    FormPart::File {
        name: name.to_string(),
        file: file.clone(),
    }
}

fn text_part(name: &str, value: &str) -> FormPart {
    FormPart::Text {
        name: name.to_string(),
        value: value.to_string(),
    }
}

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

#[derive(Clone)]
pub struct HttpBackend {
    dispatcher: RequestDispatcher,
}

impl HttpBackend {
    pub fn new(dispatcher: RequestDispatcher) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl AuthService for HttpBackend {
    async fn login(&self, email: &str, password: &str) -> PortResult<AuthSession> {
        let request = OutboundRequest::post("/auth/login")
            .json(json!({ "email": email, "password": password }));
        let payload = self.dispatcher.send(request).await?;
        decode::<TokenResponse>(payload, "login response")?.to_domain()
    }

    async fn exchange_identity_token(&self, id_token: &str) -> PortResult<AuthSession> {
        let request =
            OutboundRequest::post("/auth/google").json(json!({ "id_token": id_token }));
        let payload = self.dispatcher.send(request).await?;
        decode::<TokenResponse>(payload, "identity exchange response")?.to_domain()
    }

    async fn register(&self, registration: &Registration) -> PortResult<()> {
        let request = OutboundRequest::post("/auth/register").json(json!({
            "username": registration.username,
            "email": registration.email,
            "password": registration.password,
            "eula_accepted": true,
        }));
        self.dispatcher.send(request).await?;
        Ok(())
    }

    async fn fetch_agreement(&self, lang: &str) -> PortResult<String> {
        let request = OutboundRequest::get("/auth/eula").query("lang", lang);
        let payload = self.dispatcher.send(request).await?;
        Ok(payload.into_text())
    }

    async fn accept_agreement(&self, token: &AccessToken) -> PortResult<()> {
        let request = OutboundRequest::post("/auth/accept-eula")
            .bearer(token)
            .json(json!({ "accepted": true }));
        self.dispatcher.send(request).await?;
        Ok(())
    }

    async fn delete_account(&self, token: &AccessToken) -> PortResult<()> {
        let request = OutboundRequest::delete("/auth/delete-account").bearer(token);
        self.dispatcher.send(request).await?;
        Ok(())
    }
}

#[async_trait]
impl GuestService for HttpBackend {
    async fn create_session(&self) -> PortResult<GuestUsage> {
        let payload = self
            .dispatcher
            .send(OutboundRequest::post("/guest/session"))
            .await?;
        Ok(decode::<GuestSessionRecord>(payload, "guest session")?.to_domain())
    }

    async fn check_usage(&self, guest_id: &str) -> PortResult<UsageCheck> {
        let request = OutboundRequest::get("/guest/check-usage").guest(guest_id);
        let payload = self.dispatcher.send(request).await?;
        Ok(decode::<UsageCheckRecord>(payload, "usage check")?.to_domain())
    }

    async fn record_use(&self, guest_id: &str) -> PortResult<UsageCheck> {
        let request = OutboundRequest::post("/guest/use").guest(guest_id);
        let payload = self.dispatcher.send(request).await?;
        Ok(decode::<UsageCheckRecord>(payload, "usage update")?.to_domain())
    }

    async fn delete_session(&self, guest_id: &str) -> PortResult<()> {
        let request = OutboundRequest::delete("/guest/session").guest(guest_id);
        self.dispatcher.send(request).await?;
        Ok(())
    }
}

#[async_trait]
impl DocumentProcessor for HttpBackend {
    async fn process(&self, request: &ToolRequest) -> PortResult<ToolOutput> {
        let (path, parts) = match request {
            ToolRequest::Merge { files } => (
                "/files/merge-pdfs",
                files.iter().map(|file| file_part("files", file)).collect::<Vec<_>>(),
            ),
            ToolRequest::ExtractPages { file, page_range } => (
                "/files/extract-pages",
                vec![file_part("file", file), text_part("page_range", page_range)],
            ),
            ToolRequest::Reorder { file, page_numbers } => (
                "/files/reorder",
                vec![file_part("file", file), text_part("page_numbers", page_numbers)],
            ),
            ToolRequest::ConvertText { file } => {
                ("/files/convert-text", vec![file_part("file", file)])
            }
            ToolRequest::Summarize { file } => ("/files/summarize", vec![file_part("file", file)]),
        };

        let payload = self
            .dispatcher
            .send(OutboundRequest::post(path).form(parts))
            .await?;

        match (request, payload) {
            (ToolRequest::ConvertText { .. }, Payload::Json(value)) => value
                .get("text")
                .and_then(Value::as_str)
                .map(|text| ToolOutput::Text(text.to_string()))
                .ok_or_else(|| {
                    PortError::Unexpected("Conversion answered without text".to_string())
                }),
            (ToolRequest::ConvertText { .. }, payload) => Ok(ToolOutput::Text(payload.into_text())),
            (ToolRequest::Summarize { .. }, Payload::Json(value)) => value
                .get("summary")
                .and_then(Value::as_str)
                .map(|summary| ToolOutput::Text(summary.to_string()))
                .ok_or_else(|| {
                    PortError::Unexpected("Summary answered without a summary".to_string())
                }),
            (ToolRequest::Summarize { .. }, Payload::Binary(_)) => Err(PortError::Unexpected(
                "/files/summarize answered a binary body".to_string(),
            )),
            (_, Payload::Binary(bytes)) => Ok(ToolOutput::Document(ActiveDocument::pdf(
                request.output_name(),
                bytes,
            ))),
            (_, Payload::Json(_)) => Err(PortError::Unexpected(format!(
                "{} answered JSON instead of a document",
                path
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_response(value: Value) -> PortResult<AuthSession> {
        serde_json::from_value::<TokenResponse>(value)
            .unwrap()
            .to_domain()
    }

    #[test]
    fn flat_claims() {
        let session = token_response(json!({
            "access_token": "abc",
            "user_id": 7,
            "email": "a@b.c",
            "username": "ab",
            "eula_accepted": true
        }))
        .unwrap();

        assert_eq!(session.user_id, "7");
        assert_eq!(session.access_token.as_str(), "abc");
        assert!(session.eula_accepted);
    }

    #[test]
    fn nested_claims_and_missing_eula_flag() {
        let nested = token_response(json!({
            "access_token": "abc",
            "user": { "id": "u-1", "email": "a@b.c", "eula_accepted": true }
        }))
        .unwrap();
        assert_eq!(nested.user_id, "u-1");
        assert_eq!(nested.email.as_deref(), Some("a@b.c"));
        assert!(nested.eula_accepted);

        let missing = token_response(json!({ "access_token": "abc", "user_id": "u-2" })).unwrap();
        assert!(!missing.eula_accepted);
    }

    #[test]
    fn token_response_needs_token_and_user() {
        assert!(token_response(json!({ "access_token": "", "user_id": 1 })).is_err());
        assert!(token_response(json!({ "access_token": "abc" })).is_err());
    }

    #[test]
    fn guest_session_keyed_by_id_with_only_a_count() {
        let payload = Payload::Json(json!({
            "id": "3f1c",
            "usage_count": 1,
            "created_at": "2024-05-01T10:00:00Z"
        }));
        let usage = decode::<GuestSessionRecord>(payload, "guest session")
            .unwrap()
            .to_domain();

        assert_eq!(usage.guest_id, "3f1c");
        assert_eq!(usage.usage_count, 1);
        assert_eq!(usage.remaining_usage, 2);
        assert_eq!(usage.max_usage, 3);
        assert!(usage.is_consistent());
    }

    #[test]
    fn guest_session_with_full_counters() {
        let payload = Payload::Json(json!({
            "guest_id": "g-9",
            "usage_count": 0,
            "remaining_usage": 5,
            "max_usage": 5
        }));
        let usage = decode::<GuestSessionRecord>(payload, "guest session")
            .unwrap()
            .to_domain();
        assert_eq!(usage.guest_id, "g-9");
        assert_eq!(usage.remaining_usage, 5);
    }

    #[test]
    fn binary_body_is_not_a_usage_check() {
        let payload = Payload::Binary(bytes::Bytes::from_static(b"%PDF"));
        assert!(decode::<UsageCheckRecord>(payload, "usage check").is_err());
    }
}
