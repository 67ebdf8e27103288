//! REST client for session and attachment endpoints.
//!
//! Every call carries the current bearer token. Side effects of mutating
//! calls also arrive on the socket; callers should treat the socket as the
//! source of truth and use responses only for immediate feedback.
//!
//! ```text
//! GET    /v1/sessions/{id}                       → SessionDetails
//! POST   /v1/sessions                            → CreatedSession
//! POST   /v1/sessions/{id}/join | /v1/sessions/join → JoinedSession
//! POST   /v1/sessions/{id}/codes/rotate          → { code }
//! POST   /v1/sessions/{id}/kick
//! POST   /v1/sessions/{id}/end
//! GET    /v1/me/sessions?status=active           → { sessions }
//! GET    /v1/sessions/{id}/toasters              → { toasters }
//! POST   /v1/sessions/{id}/toasters              → { toaster }
//! PATCH  /v1/sessions/{id}/toasters/{cid}        → { toaster }
//! DELETE /v1/sessions/{id}/toasters/{cid}
//! ```

use std::sync::RwLock;

use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::ClientConfig;
use crate::error::ApiError;
use crate::model::{CampaignSelection, EntosisTier, Member, Role, SessionMeta, Toaster};

/// A session as returned by the session fetch.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct SessionDetails {
    #[serde(default)]
    pub members: Vec<Member>,
    #[serde(default)]
    pub session: SessionMeta,
}

/// Result of creating a session.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CreatedSession {
    #[serde(default)]
    pub session: SessionMeta,
    pub coordinator_code: String,
    pub line_code: String,
}

/// Result of joining with a code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinedSession {
    pub session_id: i64,
    pub role: Role,
}

/// One of the caller's active sessions.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ActiveSession {
    pub id: i64,
    #[serde(default)]
    pub created_at: Option<i64>,
    #[serde(default)]
    pub owner_id: Option<i64>,
    #[serde(default)]
    pub role: Option<Role>,
}

#[derive(Deserialize)]
struct JoinResponse {
    #[serde(default)]
    session: Option<SessionMeta>,
    role: Role,
}

#[derive(Deserialize)]
struct CodeResponse {
    code: String,
}

#[derive(Deserialize)]
struct SessionsResponse {
    #[serde(default)]
    sessions: Vec<ActiveSession>,
}

#[derive(Deserialize)]
struct ToastersResponse {
    #[serde(default)]
    toasters: Vec<Toaster>,
}

#[derive(Deserialize)]
struct ToasterResponse {
    #[serde(default)]
    toaster: Option<Toaster>,
}

#[derive(Serialize)]
struct AttachRequest {
    character_id: i64,
    entosis_tier: EntosisTier,
}

/// Map a response status onto the client's error classes.
pub fn check_status(status: StatusCode) -> Result<(), ApiError> {
    if status.is_success() {
        return Ok(());
    }
    Err(match status {
        StatusCode::BAD_REQUEST => ApiError::InvalidInput,
        StatusCode::UNAUTHORIZED => ApiError::Unauthenticated,
        StatusCode::FORBIDDEN => ApiError::Forbidden,
        StatusCode::NOT_FOUND => ApiError::NotFound,
        StatusCode::CONFLICT => ApiError::Duplicate,
        StatusCode::GONE => ApiError::Ended,
        other => ApiError::Status(other.as_u16()),
    })
}

/// Session id embedded in a `"<id>-XXXX"` join code.
pub fn parse_code_session_id(code: &str) -> Option<i64> {
    let (prefix, _) = code.trim().split_once('-')?;
    if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    prefix.parse().ok().filter(|id| *id > 0)
}

/// Bearer-authenticated REST client.
pub struct ApiClient {
    http: Client,
    config: ClientConfig,
    token: RwLock<Option<String>>,
}

impl ApiClient {
    pub fn new(config: ClientConfig) -> Result<Self, ApiError> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            http,
            config,
            token: RwLock::new(None),
        })
    }

    pub fn set_token(&self, token: Option<String>) {
        *self.token.write().unwrap_or_else(|e| e.into_inner()) = token;
    }

    pub fn has_token(&self) -> bool {
        self.token
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    fn authorized(&self, req: RequestBuilder) -> Result<RequestBuilder, ApiError> {
        let token = self.token.read().unwrap_or_else(|e| e.into_inner());
        match token.as_deref() {
            Some(token) => Ok(req.bearer_auth(token)),
            None => Err(ApiError::Unauthenticated),
        }
    }

    async fn call<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, ApiError> {
        let res = self.authorized(req)?.send().await?;
        check_status(res.status())?;
        Ok(res.json().await?)
    }

    async fn call_empty(&self, req: RequestBuilder) -> Result<(), ApiError> {
        let res = self.authorized(req)?.send().await?;
        check_status(res.status())
    }

    fn url(&self, path: &str) -> String {
        self.config.rest_url(path)
    }

    /// Fetch a session with its member list.
    pub async fn fetch_session(&self, session_id: i64) -> Result<SessionDetails, ApiError> {
        let req = self.http.get(self.url(&format!("/v1/sessions/{session_id}")));
        self.call(req).await
    }

    /// Create a session over the given campaigns. The caller becomes coordinator.
    pub async fn create_session(
        &self,
        campaigns: &[CampaignSelection],
    ) -> Result<CreatedSession, ApiError> {
        let req = self
            .http
            .post(self.url("/v1/sessions"))
            .json(&json!({ "campaigns": campaigns }));
        self.call(req).await
    }

    /// Join with a code. Codes of the form `"<id>-…"` use the session-scoped
    /// endpoint; anything else goes to the code-only endpoint.
    pub async fn join_with_code(&self, code: &str) -> Result<JoinedSession, ApiError> {
        let code = code.trim();
        if code.is_empty() {
            return Err(ApiError::InvalidCode(code.to_string()));
        }
        let parsed = parse_code_session_id(code);
        let path = match parsed {
            Some(id) => format!("/v1/sessions/{id}/join"),
            None => "/v1/sessions/join".to_string(),
        };
        let req = self
            .http
            .post(self.url(&path))
            .json(&json!({ "code": code }));
        let res: JoinResponse = self.call(req).await?;

        let session_id = res
            .session
            .and_then(|s| s.id)
            .or(parsed)
            .ok_or_else(|| ApiError::InvalidCode(code.to_string()))?;
        Ok(JoinedSession {
            session_id,
            role: res.role,
        })
    }

    /// Issue a fresh join code for `role`. Returns the new code.
    pub async fn rotate_code(&self, session_id: i64, role: Role) -> Result<String, ApiError> {
        let req = self
            .http
            .post(self.url(&format!("/v1/sessions/{session_id}/codes/rotate")))
            .json(&json!({ "role": role }));
        let res: CodeResponse = self.call(req).await?;
        Ok(res.code)
    }

    pub async fn kick(&self, session_id: i64, character_id: i64) -> Result<(), ApiError> {
        let req = self
            .http
            .post(self.url(&format!("/v1/sessions/{session_id}/kick")))
            .json(&json!({ "character_id": character_id }));
        self.call_empty(req).await
    }

    pub async fn end_session(&self, session_id: i64) -> Result<(), ApiError> {
        let req = self
            .http
            .post(self.url(&format!("/v1/sessions/{session_id}/end")));
        self.call_empty(req).await
    }

    /// Sessions the caller is currently a member of.
    pub async fn active_sessions(&self) -> Result<Vec<ActiveSession>, ApiError> {
        let req = self
            .http
            .get(self.url("/v1/me/sessions"))
            .query(&[("status", "active")]);
        let res: SessionsResponse = self.call(req).await?;
        Ok(res.sessions)
    }

    pub async fn list_toasters(&self, session_id: i64) -> Result<Vec<Toaster>, ApiError> {
        let req = self
            .http
            .get(self.url(&format!("/v1/sessions/{session_id}/toasters")));
        let res: ToastersResponse = self.call(req).await?;
        Ok(res.toasters)
    }

    /// Attach one of the caller's characters. `Duplicate` if already attached.
    pub async fn attach_toaster(
        &self,
        session_id: i64,
        character_id: i64,
        entosis_tier: EntosisTier,
    ) -> Result<Option<Toaster>, ApiError> {
        let req = self
            .http
            .post(self.url(&format!("/v1/sessions/{session_id}/toasters")))
            .json(&AttachRequest {
                character_id,
                entosis_tier,
            });
        let res: ToasterResponse = self.call(req).await?;
        Ok(res.toaster)
    }

    pub async fn detach_toaster(&self, session_id: i64, character_id: i64) -> Result<(), ApiError> {
        let req = self.http.delete(self.url(&format!(
            "/v1/sessions/{session_id}/toasters/{character_id}"
        )));
        self.call_empty(req).await
    }

    pub async fn update_toaster_tier(
        &self,
        session_id: i64,
        character_id: i64,
        entosis_tier: EntosisTier,
    ) -> Result<Option<Toaster>, ApiError> {
        let req = self
            .http
            .patch(self.url(&format!(
                "/v1/sessions/{session_id}/toasters/{character_id}"
            )))
            .json(&json!({ "entosis_tier": entosis_tier }));
        let res: ToasterResponse = self.call(req).await?;
        Ok(res.toaster)
    }
}
