//! Session lobby kept live over a connection and the REST client.
//!
//! ```text
//!  open(id) ── GET session ──► SessionLobby::apply_fetched ──► subscribe session.{id}
//!                                      ▲
//!  socket ── session.* ────────────────┤  effects ──► unsubscribe / refetch / notices
//!  socket ── toaster.* ──► ToasterRoster
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::api::{ActiveSession, ApiClient, CreatedSession, JoinedSession};
use crate::broadcast::HandlerRegistration;
use crate::connection::ConnectionHandle;
use crate::error::ApiError;
use crate::model::{CampaignSelection, EntosisTier, Role, Toaster};
use crate::protocol::ServerMessage;
use crate::session::{JoinCodes, LobbyEffect, LobbyNotice, LobbyPhase, SessionLobby, SessionState};
use crate::toasters::ToasterRoster;

struct Shared {
    api: Arc<ApiClient>,
    conn: ConnectionHandle,
    lobby: Mutex<SessionLobby>,
    roster: Mutex<ToasterRoster>,
    notices: mpsc::UnboundedSender<LobbyNotice>,
}

impl Shared {
    fn lobby(&self) -> std::sync::MutexGuard<'_, SessionLobby> {
        self.lobby.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn roster(&self) -> std::sync::MutexGuard<'_, ToasterRoster> {
        self.roster.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn on_message(self: &Arc<Self>, msg: &ServerMessage) {
        match msg {
            ServerMessage::Session(event) => {
                let (effects, session_id) = {
                    let mut lobby = self.lobby();
                    let effects = lobby.handle(event);
                    (effects, lobby.session_id())
                };
                if session_id.is_none() {
                    self.roster().set_session(None);
                }
                self.run_effects(effects);
            }
            ServerMessage::Toaster(event) => {
                if self.roster().handle(event) {
                    log::debug!("roster updated from {}", event.topic());
                }
            }
            _ => {}
        }
    }

    fn run_effects(self: &Arc<Self>, effects: Vec<LobbyEffect>) {
        for effect in effects {
            match effect {
                LobbyEffect::Subscribe(topic) => {
                    self.conn.subscribe(topic, None);
                    self.conn.ensure();
                }
                LobbyEffect::Unsubscribe(topic) => self.conn.unsubscribe(topic),
                LobbyEffect::RefetchMembers { session_id } => self.spawn_refetch(session_id),
                LobbyEffect::Notify(notice) => {
                    log::info!("lobby: {notice:?}");
                    // No receiver just means nobody is listening.
                    let _ = self.notices.send(notice);
                }
            }
        }
    }

    fn spawn_refetch(self: &Arc<Self>, session_id: i64) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            match shared.api.fetch_session(session_id).await {
                Ok(details) => shared
                    .lobby()
                    .apply_member_refetch(session_id, &details.members),
                Err(e) => {
                    log::warn!("member refetch for session {session_id} failed: {e}");
                    shared.lobby().refetch_failed();
                }
            }
        });
    }

    fn current_session(&self) -> Result<i64, ApiError> {
        self.lobby().session_id().ok_or(ApiError::NotOpen)
    }
}

/// Lobby of at most one session at a time, plus its attachment roster.
///
/// Dropping the service unregisters its handler and releases its hold on the
/// session topic.
pub struct LobbyService {
    shared: Arc<Shared>,
    _handler: HandlerRegistration,
    retry_interval: Duration,
}

impl LobbyService {
    /// Register on `conn`. Notices are delivered on the returned receiver.
    pub fn new(
        api: Arc<ApiClient>,
        conn: &ConnectionHandle,
        local_character_id: Option<i64>,
        retry_interval: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<LobbyNotice>) {
        let (notices, notices_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            api,
            conn: conn.clone(),
            lobby: Mutex::new(SessionLobby::new(local_character_id)),
            roster: Mutex::new(ToasterRoster::new()),
            notices,
        });
        let handler = {
            let shared = Arc::clone(&shared);
            conn.add_message_handler(move |msg| shared.on_message(msg))
        };
        (
            Self {
                shared,
                _handler: handler,
                retry_interval,
            },
            notices_rx,
        )
    }

    pub fn set_local_character(&self, character_id: Option<i64>) {
        self.shared.lobby().set_local_character(character_id);
    }

    pub fn phase(&self) -> LobbyPhase {
        self.shared.lobby().phase()
    }

    pub fn session_id(&self) -> Option<i64> {
        self.shared.lobby().session_id()
    }

    /// Snapshot of the session state.
    pub fn state(&self) -> Option<SessionState> {
        self.shared.lobby().state().cloned()
    }

    /// Attachments, online first.
    pub fn toasters(&self) -> Vec<Toaster> {
        self.shared.roster().sorted()
    }

    /// Fetch `session_id`, then follow its topic.
    ///
    /// Forbidden, ended and not-found come back as distinct errors.
    pub async fn open(&self, session_id: i64) -> Result<(), ApiError> {
        let effects = self.shared.lobby().request_open(session_id);
        self.shared.run_effects(effects);
        self.shared.roster().set_session(Some(session_id));

        let details = match self.shared.api.fetch_session(session_id).await {
            Ok(details) => details,
            Err(e) => {
                log::warn!("opening session {session_id} failed: {e}");
                let mut lobby = self.shared.lobby();
                lobby.open_failed(session_id);
                if lobby.session_id().is_none() {
                    self.shared.roster().set_session(None);
                }
                return Err(e);
            }
        };
        let effects = self.shared.lobby().apply_fetched(session_id, &details);
        self.shared.run_effects(effects);
        log::info!(
            "session {session_id} open with {} members",
            details.members.len()
        );

        if let Err(e) = self.refresh_toasters().await {
            log::warn!("toaster listing for session {session_id} failed: {e}");
        }
        Ok(())
    }

    /// [`open`](Self::open), retrying transient failures until success or a
    /// terminal error. Drop the future to give up.
    pub async fn open_with_retry(&self, session_id: i64) -> Result<(), ApiError> {
        loop {
            match self.open(session_id).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    log::debug!("retrying session {session_id} in {:?}", self.retry_interval);
                    tokio::time::sleep(self.retry_interval).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn close(&self) {
        let effects = self.shared.lobby().close();
        self.shared.run_effects(effects);
        self.shared.roster().set_session(None);
    }

    /// Create a session; the caller becomes its coordinator. Does not open it.
    pub async fn create(&self, campaigns: &[CampaignSelection]) -> Result<CreatedSession, ApiError> {
        let created = self.shared.api.create_session(campaigns).await?;
        if let Some(id) = created.session.id {
            self.shared.lobby().apply_created(
                id,
                JoinCodes {
                    coordinator: Some(created.coordinator_code.clone()),
                    line: Some(created.line_code.clone()),
                },
            );
        }
        Ok(created)
    }

    /// Join with a code and open the joined session.
    pub async fn join(&self, code: &str) -> Result<JoinedSession, ApiError> {
        let joined = self.shared.api.join_with_code(code).await?;
        self.open(joined.session_id).await?;
        Ok(joined)
    }

    /// Rotate the join code for `role` of the open session.
    pub async fn rotate_code(&self, role: Role) -> Result<String, ApiError> {
        let session_id = self.shared.current_session()?;
        let code = self.shared.api.rotate_code(session_id, role).await?;
        self.shared
            .lobby()
            .apply_rotated(session_id, role, code.clone());
        Ok(code)
    }

    /// Kick a member. The removal itself arrives as `member.kicked`.
    pub async fn kick(&self, character_id: i64) -> Result<(), ApiError> {
        let session_id = self.shared.current_session()?;
        self.shared.api.kick(session_id, character_id).await
    }

    /// End the open session. Teardown follows `session.ended`.
    pub async fn end(&self) -> Result<(), ApiError> {
        let session_id = self.shared.current_session()?;
        self.shared.api.end_session(session_id).await
    }

    pub async fn active_sessions(&self) -> Result<Vec<ActiveSession>, ApiError> {
        self.shared.api.active_sessions().await
    }

    pub async fn refresh_toasters(&self) -> Result<(), ApiError> {
        let session_id = self.shared.current_session()?;
        let toasters = self.shared.api.list_toasters(session_id).await?;
        let mut roster = self.shared.roster();
        if roster.topic().is_some() {
            roster.replace_all(toasters);
        }
        Ok(())
    }

    /// Attach a character. `Duplicate` if it is already attached.
    pub async fn attach_toaster(
        &self,
        character_id: i64,
        tier: EntosisTier,
    ) -> Result<(), ApiError> {
        let session_id = self.shared.current_session()?;
        let toaster = self
            .shared
            .api
            .attach_toaster(session_id, character_id, tier)
            .await?;
        if let Some(toaster) = toaster {
            self.shared.roster().upsert(toaster);
        }
        Ok(())
    }

    pub async fn detach_toaster(&self, character_id: i64) -> Result<(), ApiError> {
        let session_id = self.shared.current_session()?;
        self.shared
            .api
            .detach_toaster(session_id, character_id)
            .await?;
        self.shared.roster().remove(character_id);
        Ok(())
    }

    pub async fn update_toaster_tier(
        &self,
        character_id: i64,
        tier: EntosisTier,
    ) -> Result<(), ApiError> {
        let session_id = self.shared.current_session()?;
        let toaster = self
            .shared
            .api
            .update_toaster_tier(session_id, character_id, tier)
            .await?;
        if let Some(toaster) = toaster {
            self.shared.roster().upsert(toaster);
        }
        Ok(())
    }
}

impl Drop for LobbyService {
    fn drop(&mut self) {
        if let Some(topic) = self.shared.lobby().subscribed_topic() {
            self.shared.conn.unsubscribe(topic);
        }
    }
}
