//! services/gateway/src/adapters/dispatcher.rs
//!
//! The single funnel for outbound backend calls. Attaches the caller's identity
//! headers and turns responses into either JSON or opaque bytes.

use crate::gateway::credentials::CredentialStore;
use crate::gateway::guest::GUEST_ID_KEY;
use bytes::Bytes;
use gateway_core::domain::{AccessToken, UploadFile};
use gateway_core::ports::{KeyValueStore, PortError, PortResult};
use reqwest::header::CONTENT_TYPE;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Header carrying the anonymous identity.
pub const GUEST_HEADER: &str = "X-Guest-ID";

//=========================================================================================
// Request / Response Types
//=========================================================================================

#[derive(Debug, Clone)]
pub enum FormPart {
    Text { name: String, value: String },
    File { name: String, file: UploadFile },
}

#[derive(Debug, Clone)]
pub enum RequestBody {
    Empty,
    Json(Value),
    /// Sent as multipart form data; the boundary content type is set by the client.
    Form(Vec<FormPart>),
}

/// One outbound call. Identity headers come from the dispatcher unless overridden here.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    body: RequestBody,
    token: Option<AccessToken>,
    guest_id: Option<String>,
}

impl OutboundRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: RequestBody::Empty,
            token: None,
            guest_id: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn query(mut self, key: &str, value: &str) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn json(mut self, value: Value) -> Self {
        self.body = RequestBody::Json(value);
        self
    }

    pub fn form(mut self, parts: Vec<FormPart>) -> Self {
        self.body = RequestBody::Form(parts);
        self
    }

    /// Uses `token` instead of the current session token.
    pub fn bearer(mut self, token: &AccessToken) -> Self {
        self.token = Some(token.clone());
        self
    }

    /// Uses `guest_id` instead of the stored guest id.
    pub fn guest(mut self, guest_id: &str) -> Self {
        self.guest_id = Some(guest_id.to_string());
        self
    }
}

/// A successful response body.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Binary(Bytes),
}

impl Payload {
    /// The body as text, for endpoints that answer with either a JSON string or plain text.
    pub fn into_text(self) -> String {
        match self {
            Payload::Json(Value::String(text)) => text,
            Payload::Json(other) => other.to_string(),
            Payload::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        }
    }
}

//=========================================================================================
// RequestDispatcher
//=========================================================================================

/// Where the ambient identity headers are read from.
#[derive(Clone)]
struct AmbientIdentity {
    credentials: CredentialStore,
    durable: Arc<dyn KeyValueStore>,
}

#[derive(Clone)]
pub struct RequestDispatcher {
    client: Client,
    base_url: String,
    identity: Option<AmbientIdentity>,
}

impl RequestDispatcher {
    pub fn new(base_url: &str, timeout: Duration) -> PortResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PortError::Unexpected(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            identity: None,
        })
    }

    /// Attaches the session token and the stored guest id to every request.
    pub fn with_identity(
        mut self,
        credentials: CredentialStore,
        durable: Arc<dyn KeyValueStore>,
    ) -> Self {
        self.identity = Some(AmbientIdentity {
            credentials,
            durable,
        });
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn send(&self, request: OutboundRequest) -> PortResult<Payload> {
        let OutboundRequest {
            method,
            path,
            query,
            body,
            token,
            guest_id,
        } = request;
        let url = format!("{}{}", self.base_url, path);
        debug!("{} {}", method, url);

        let mut builder = self.client.request(method, &url);
        if !query.is_empty() {
            builder = builder.query(&query);
        }
        if let Some(token) = token.or_else(|| self.ambient_token()) {
            builder = builder.bearer_auth(token.as_str());
        }
        // The guest id is re-read on every call: another process may have replaced it.
        if let Some(guest_id) = guest_id.or_else(|| self.ambient_guest_id()) {
            builder = builder.header(GUEST_HEADER, guest_id);
        }
        builder = match body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(&value),
            RequestBody::Form(parts) => builder.multipart(build_form(parts)?),
        };

        let response = builder.send().await.map_err(map_transport_error)?;
        let status = response.status();
        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.contains("application/json"))
            .unwrap_or(false);
        let bytes = response.bytes().await.map_err(map_transport_error)?;

        if status == StatusCode::UNAUTHORIZED {
            warn!("{} answered 401", url);
            return Err(PortError::Unauthorized);
        }
        if !status.is_success() {
            let detail = detail_from_body(&bytes);
            warn!("{} answered {}", url, status);
            return Err(PortError::Http {
                status: status.as_u16(),
                detail,
            });
        }

        if !is_json {
            return Ok(Payload::Binary(bytes));
        }
        if bytes.is_empty() {
            return Ok(Payload::Json(Value::Null));
        }
        serde_json::from_slice(&bytes)
            .map(Payload::Json)
            .map_err(|e| PortError::Unexpected(format!("Malformed JSON from {}: {}", url, e)))
    }

    fn ambient_token(&self) -> Option<AccessToken> {
        self.identity
            .as_ref()
            .and_then(|identity| identity.credentials.current_token())
    }

    fn ambient_guest_id(&self) -> Option<String> {
        let identity = self.identity.as_ref()?;
        match identity.durable.get(GUEST_ID_KEY) {
            Ok(id) => id,
            Err(e) => {
                warn!("Failed to read the guest id for a request: {}", e);
                None
            }
        }
    }
}

fn build_form(parts: Vec<FormPart>) -> PortResult<Form> {
    let mut form = Form::new();
    for part in parts {
        form = match part {
            FormPart::Text { name, value } => form.text(name, value),
            FormPart::File { name, file } => {
                let part = Part::bytes(file.bytes.to_vec())
                    .file_name(file.name)
                    .mime_str(&file.mime)
                    .map_err(|e| PortError::Unexpected(format!("Invalid mime type: {}", e)))?;
                form.part(name, part)
            }
        };
    }
    Ok(form)
}

fn map_transport_error(err: reqwest::Error) -> PortError {
    if err.is_timeout() {
        PortError::Timeout
    } else {
        PortError::Unexpected(err.to_string())
    }
}

/// Pulls the `detail` field out of an error body, if it is JSON and has one.
fn detail_from_body(body: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(body).ok()?;
    match value.get("detail")? {
        Value::String(detail) => Some(detail.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}
