//! Session lobby reducer.
//!
//! State machine:
//! ```text
//!            request_open            full snapshot (REST or socket)
//!   Closed ───────────────► Opening ───────────────────────────────► Open
//!     ▲                        │                                       │
//!     └──── open_failed ───────┘                                       │
//!     └──── session.ended / forced_leave / kicked / close ─────────────┘
//! ```
//! [`SessionLobby::handle`] consumes session-scoped events and returns the
//! effects the caller must perform (unsubscribe, roster refetch, notices).
//! Nothing here blocks or touches the network.

use std::collections::HashMap;

use crate::api::SessionDetails;
use crate::model::{CampaignSelection, Member, Role, SessionMeta};
use crate::protocol::SessionEvent;

/// Topic carrying the events of session `id`.
pub fn session_topic(session_id: i64) -> String {
    format!("session.{session_id}")
}

/// Lifecycle phase of the lobby.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LobbyPhase {
    Closed,
    Opening { session_id: i64 },
    Open,
}

/// Join codes known to this client, per role.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinCodes {
    pub coordinator: Option<String>,
    pub line: Option<String>,
}

impl JoinCodes {
    pub fn get(&self, role: Role) -> Option<&str> {
        match role {
            Role::Coordinator => self.coordinator.as_deref(),
            Role::Line => self.line.as_deref(),
        }
    }

    pub fn set(&mut self, role: Role, code: String) {
        match role {
            Role::Coordinator => self.coordinator = Some(code),
            Role::Line => self.line = Some(code),
        }
    }
}

/// The open session as seen by this client.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub session_id: i64,
    /// Never contains two entries for one character
    pub members: Vec<Member>,
    pub my_role: Option<Role>,
    pub owner_id: Option<i64>,
    pub created_at: Option<i64>,
    pub ended_at: Option<i64>,
    pub campaigns: Vec<CampaignSelection>,
    pub codes: JoinCodes,
    /// A live snapshot arrived over the socket
    pub connected: bool,
    /// Server time of the last presence heartbeat
    pub last_heartbeat: Option<i64>,
}

impl SessionState {
    fn new(session_id: i64) -> Self {
        Self {
            session_id,
            members: Vec::new(),
            my_role: None,
            owner_id: None,
            created_at: None,
            ended_at: None,
            campaigns: Vec::new(),
            codes: JoinCodes::default(),
            connected: false,
            last_heartbeat: None,
        }
    }

    pub fn topic(&self) -> String {
        session_topic(self.session_id)
    }

    pub fn member(&self, character_id: i64) -> Option<&Member> {
        self.members.iter().find(|m| m.character_id == character_id)
    }

    pub fn online_count(&self) -> usize {
        self.members.iter().filter(|m| m.online).count()
    }

    fn apply_meta(&mut self, meta: &SessionMeta) {
        self.owner_id = meta.owner_id.or(self.owner_id);
        self.created_at = meta.created_at.or(self.created_at);
        self.ended_at = meta.ended_at;
        self.campaigns = meta.campaigns.clone();
    }
}

/// Later entries win; first-seen order is kept.
fn dedup_members(members: &[Member]) -> Vec<Member> {
    let mut index: HashMap<i64, usize> = HashMap::new();
    let mut out: Vec<Member> = Vec::with_capacity(members.len());
    for member in members {
        match index.get(&member.character_id) {
            Some(&i) => out[i] = member.clone(),
            None => {
                index.insert(member.character_id, out.len());
                out.push(member.clone());
            }
        }
    }
    out
}

/// User-facing, transient notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LobbyNotice {
    MemberOnline { name: String },
    MemberOffline { name: String },
    MemberKicked { name: String },
    MemberLeft { name: String },
    /// Shown to coordinators only
    CodesRotated { role: Role },
    YouWereKicked,
    /// The local user left from another client
    YouLeft,
    SessionEnded,
    /// The server moved this user out of its previous session
    LeftPreviousSession,
}

/// Side effects requested by the reducer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LobbyEffect {
    Subscribe(String),
    Unsubscribe(String),
    /// Fetch the authoritative member list of this session.
    RefetchMembers { session_id: i64 },
    Notify(LobbyNotice),
}

/// Reducer over one session's lobby state.
#[derive(Debug, Clone)]
pub struct SessionLobby {
    local_character_id: Option<i64>,
    phase: LobbyPhase,
    state: Option<SessionState>,
    pending_codes: Option<(i64, JoinCodes)>,
    refetch_in_flight: bool,
    /// A `Subscribe` for the current topic was issued and not yet released.
    subscribed: bool,
}

impl SessionLobby {
    /// `local_character_id` identifies "me" for role lookup and kick detection.
    pub fn new(local_character_id: Option<i64>) -> Self {
        Self {
            local_character_id,
            phase: LobbyPhase::Closed,
            state: None,
            pending_codes: None,
            refetch_in_flight: false,
            subscribed: false,
        }
    }

    pub fn set_local_character(&mut self, character_id: Option<i64>) {
        self.local_character_id = character_id;
        self.refresh_role();
    }

    pub fn phase(&self) -> LobbyPhase {
        self.phase
    }

    pub fn is_open(&self) -> bool {
        self.phase == LobbyPhase::Open
    }

    /// Session state, present while opening or open.
    pub fn state(&self) -> Option<&SessionState> {
        self.state.as_ref()
    }

    /// Session id of the opening or open session.
    pub fn session_id(&self) -> Option<i64> {
        match self.phase {
            LobbyPhase::Closed => None,
            LobbyPhase::Opening { session_id } => Some(session_id),
            LobbyPhase::Open => self.state.as_ref().map(|s| s.session_id),
        }
    }

    pub fn topic(&self) -> Option<String> {
        self.session_id().map(session_topic)
    }

    /// Topic this lobby currently holds a subscription on.
    pub fn subscribed_topic(&self) -> Option<String> {
        self.topic().filter(|_| self.subscribed)
    }

    pub fn refetch_in_flight(&self) -> bool {
        self.refetch_in_flight
    }

    /// Begin opening `session_id`. Leaves any other session first.
    pub fn request_open(&mut self, session_id: i64) -> Vec<LobbyEffect> {
        let mut effects = Vec::new();
        match self.session_id() {
            Some(current) if current == session_id && self.is_open() => return effects,
            Some(current) if current != session_id => {
                effects.extend(self.release_topic());
                self.state = None;
            }
            _ => {}
        }

        let mut state = self
            .state
            .take()
            .filter(|s| s.session_id == session_id)
            .unwrap_or_else(|| SessionState::new(session_id));
        if let Some((id, codes)) = self.pending_codes.take() {
            if id == session_id {
                state.codes = codes;
            }
        }
        self.state = Some(state);
        self.phase = LobbyPhase::Opening { session_id };
        self.refetch_in_flight = false;
        effects
    }

    /// The session fetch succeeded. Opens the lobby and asks for the live topic.
    pub fn apply_fetched(&mut self, session_id: i64, details: &SessionDetails) -> Vec<LobbyEffect> {
        if self.session_id() != Some(session_id) {
            return Vec::new();
        }
        let was_open = self.is_open();
        let Some(state) = self.state.as_mut() else {
            return Vec::new();
        };
        state.members = dedup_members(&details.members);
        state.apply_meta(&details.session);
        self.phase = LobbyPhase::Open;
        self.refresh_role();

        if was_open && self.subscribed {
            return Vec::new();
        }
        self.subscribed = true;
        vec![LobbyEffect::Subscribe(session_topic(session_id))]
    }

    /// The session fetch failed; back to closed if still opening it.
    pub fn open_failed(&mut self, session_id: i64) {
        if self.phase == (LobbyPhase::Opening { session_id }) {
            self.reset();
        }
    }

    /// Authoritative member list after a refetch.
    pub fn apply_member_refetch(&mut self, session_id: i64, members: &[Member]) {
        self.refetch_in_flight = false;
        match self.state.as_mut() {
            Some(state) if self.phase == LobbyPhase::Open && state.session_id == session_id => {
                state.members = dedup_members(members);
            }
            _ => return,
        }
        self.refresh_role();
    }

    pub fn refetch_failed(&mut self) {
        self.refetch_in_flight = false;
    }

    /// Remember the codes of a session just created so opening it shows them.
    pub fn apply_created(&mut self, session_id: i64, codes: JoinCodes) {
        match self.state.as_mut() {
            Some(state) if state.session_id == session_id => state.codes = codes,
            _ => self.pending_codes = Some((session_id, codes)),
        }
    }

    /// Store a freshly rotated code.
    pub fn apply_rotated(&mut self, session_id: i64, role: Role, code: String) {
        if let Some(state) = self.state.as_mut().filter(|s| s.session_id == session_id) {
            state.codes.set(role, code);
        }
    }

    /// Leave the lobby explicitly.
    pub fn close(&mut self) -> Vec<LobbyEffect> {
        let effects = self.release_topic().into_iter().collect();
        self.reset();
        effects
    }

    fn release_topic(&mut self) -> Option<LobbyEffect> {
        let topic = self.subscribed_topic()?;
        self.subscribed = false;
        Some(LobbyEffect::Unsubscribe(topic))
    }

    /// Apply one session-scoped event.
    pub fn handle(&mut self, event: &SessionEvent) -> Vec<LobbyEffect> {
        if self.phase == LobbyPhase::Closed {
            return Vec::new();
        }
        if let SessionEvent::ForcedLeave = event {
            return self.exit(LobbyNotice::LeftPreviousSession);
        }
        let Some(topic) = self.topic() else {
            return Vec::new();
        };
        if event.topic() != Some(topic.as_str()) {
            return Vec::new();
        }

        match event {
            SessionEvent::Snapshot(snapshot) => {
                if let Some(state) = self.state.as_mut() {
                    state.members = dedup_members(&snapshot.members);
                    state.apply_meta(&snapshot.meta);
                    state.connected = true;
                }
                self.phase = LobbyPhase::Open;
                self.refresh_role();
                Vec::new()
            }
            SessionEvent::Ended { .. } => self.exit(LobbyNotice::SessionEnded),
            _ if !self.is_open() => Vec::new(),

            SessionEvent::PresenceJoined { character_id, .. } => {
                match self.set_online(*character_id, true) {
                    Some(name) => vec![LobbyEffect::Notify(LobbyNotice::MemberOnline { name })],
                    None => self.request_refetch(),
                }
            }
            SessionEvent::PresenceLeft { character_id, .. } => {
                match self.set_online(*character_id, false) {
                    Some(name) => vec![LobbyEffect::Notify(LobbyNotice::MemberOffline { name })],
                    None => self.request_refetch(),
                }
            }
            SessionEvent::PresenceHeartbeat { ts, .. } => {
                if let Some(state) = self.state.as_mut() {
                    state.last_heartbeat = Some(*ts);
                }
                Vec::new()
            }
            SessionEvent::MemberKicked { character_id, .. } => {
                if Some(*character_id) == self.local_character_id {
                    self.exit(LobbyNotice::YouWereKicked)
                } else {
                    self.remove_member(*character_id)
                        .map(|name| LobbyEffect::Notify(LobbyNotice::MemberKicked { name }))
                        .into_iter()
                        .collect()
                }
            }
            SessionEvent::MemberLeft { character_id, .. } => {
                if Some(*character_id) == self.local_character_id {
                    self.exit(LobbyNotice::YouLeft)
                } else {
                    self.remove_member(*character_id)
                        .map(|name| LobbyEffect::Notify(LobbyNotice::MemberLeft { name }))
                        .into_iter()
                        .collect()
                }
            }
            SessionEvent::CodesRotated { role, .. } => {
                let me_coordinator = self
                    .state
                    .as_ref()
                    .is_some_and(|s| s.my_role == Some(Role::Coordinator));
                if me_coordinator {
                    vec![LobbyEffect::Notify(LobbyNotice::CodesRotated { role: *role })]
                } else {
                    Vec::new()
                }
            }
            SessionEvent::ForcedLeave => Vec::new(),
        }
    }

    fn exit(&mut self, notice: LobbyNotice) -> Vec<LobbyEffect> {
        let mut effects = self.close();
        effects.push(LobbyEffect::Notify(notice));
        effects
    }

    fn reset(&mut self) {
        self.phase = LobbyPhase::Closed;
        self.state = None;
        self.refetch_in_flight = false;
    }

    fn request_refetch(&mut self) -> Vec<LobbyEffect> {
        if self.refetch_in_flight {
            return Vec::new();
        }
        let Some(session_id) = self.session_id() else {
            return Vec::new();
        };
        self.refetch_in_flight = true;
        vec![LobbyEffect::RefetchMembers { session_id }]
    }

    /// Toggle a known member's online flag; returns its display name.
    fn set_online(&mut self, character_id: i64, online: bool) -> Option<String> {
        let member = self
            .state
            .as_mut()?
            .members
            .iter_mut()
            .find(|m| m.character_id == character_id)?;
        member.online = online;
        Some(member.display_name())
    }

    fn remove_member(&mut self, character_id: i64) -> Option<String> {
        let state = self.state.as_mut()?;
        let pos = state
            .members
            .iter()
            .position(|m| m.character_id == character_id)?;
        Some(state.members.remove(pos).display_name())
    }

    fn refresh_role(&mut self) {
        let local = self.local_character_id;
        if let Some(state) = self.state.as_mut() {
            state.my_role = local
                .and_then(|id| state.members.iter().find(|m| m.character_id == id))
                .map(|m| m.role);
        }
    }
}
