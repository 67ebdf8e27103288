//! JSON wire protocol for the sync socket.
//!
//! Every frame is a JSON object with a `type` discriminator:
//! ```text
//! client → server   auth | subscribe | unsubscribe | ping | <feed>.catchup
//! server → client   ack | error | pong
//!                   <feed>.snapshot | <feed>.diff | <feed>.resync
//!                   session.snapshot | presence.* | member.* | codes.rotated
//!                   session.ended | session.forced_leave
//!                   toaster.*
//! ```
//!
//! Decoding never fails: a frame that cannot be understood comes back as
//! [`Inbound::Ignored`] with the reason, so nothing partial ever reaches a
//! handler.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::model::{EntosisTier, Member, Role, SessionMeta, Toaster};

/// A synchronized record: a JSON object keyed by an integer id field.
pub type Entity = Map<String, Value>;

// ───────────────────────────────────────────────────────────────────
// Outbound
// ───────────────────────────────────────────────────────────────────

/// Client → server control messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Associate the connection with a principal.
    Auth { token: String },
    /// Begin or resume a topic feed.
    Subscribe {
        topic: String,
        last_version: Option<u64>,
    },
    /// Stop a topic feed.
    Unsubscribe { topic: String },
    /// Liveness probe.
    Ping,
    /// Ask the server to replay `feed` history after `since`.
    Catchup {
        feed: String,
        topic: String,
        since: u64,
    },
}

impl ClientMessage {
    /// Wire `type` of this message.
    pub fn kind(&self) -> String {
        match self {
            ClientMessage::Auth { .. } => "auth".into(),
            ClientMessage::Subscribe { .. } => "subscribe".into(),
            ClientMessage::Unsubscribe { .. } => "unsubscribe".into(),
            ClientMessage::Ping => "ping".into(),
            ClientMessage::Catchup { feed, .. } => format!("{feed}.catchup"),
        }
    }

    /// JSON form, with `requestId` when given.
    pub fn to_value(&self, request_id: Option<&str>) -> Value {
        let mut value = match self {
            ClientMessage::Auth { token } => json!({ "type": "auth", "token": token }),
            ClientMessage::Subscribe { topic, last_version } => {
                let mut v = json!({ "type": "subscribe", "topic": topic });
                if let Some(version) = last_version {
                    v["lastVersion"] = json!(version);
                }
                v
            }
            ClientMessage::Unsubscribe { topic } => {
                json!({ "type": "unsubscribe", "topic": topic })
            }
            ClientMessage::Ping => json!({ "type": "ping" }),
            ClientMessage::Catchup { topic, since, .. } => {
                json!({ "type": self.kind(), "topic": topic, "since": since })
            }
        };
        if let Some(id) = request_id {
            value["requestId"] = json!(id);
        }
        value
    }
}

/// A message waiting to be written to the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub message: ClientMessage,
    pub request_id: Option<String>,
    /// Re-queued when a write fails. Control messages derived from
    /// connection state are rebuilt on the next open instead.
    pub durable: bool,
}

impl Outbound {
    /// A caller-submitted message, kept across reconnects.
    pub fn new(message: ClientMessage) -> Self {
        Self {
            message,
            request_id: None,
            durable: true,
        }
    }

    /// A message rebuilt from connection state; dropped on write failure.
    pub fn control(message: ClientMessage) -> Self {
        Self {
            message,
            request_id: None,
            durable: false,
        }
    }

    /// Attach a fresh UUID v4 request id.
    pub fn with_request_id(mut self) -> Self {
        self.request_id = Some(Uuid::new_v4().to_string());
        self
    }

    /// Serialize to a text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let value = self.message.to_value(self.request_id.as_deref());
        Ok(serde_json::to_string(&value)?)
    }
}

// ───────────────────────────────────────────────────────────────────
// Inbound
// ───────────────────────────────────────────────────────────────────

/// Full-replace message for a versioned feed.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Feed prefix of the message type (`campaigns` for `campaigns.snapshot`).
    #[serde(skip)]
    pub feed: String,
    pub topic: String,
    pub version: u64,
    #[serde(default)]
    pub data: Vec<Entity>,
    #[serde(default)]
    pub is_stale: bool,
    #[serde(default)]
    pub ts: Option<String>,
}

/// Partial update of one entity inside a diff: the key field plus `changes`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EntityPatch {
    #[serde(default)]
    pub changes: Entity,
    #[serde(flatten)]
    pub key: Entity,
}

impl EntityPatch {
    /// Id of the patched entity, read from `key_field` (or a plain `id`).
    pub fn id(&self, key_field: &str) -> Option<i64> {
        self.key
            .get(key_field)
            .or_else(|| self.key.get("id"))
            .and_then(Value::as_i64)
    }
}

/// Incremental message for a versioned feed.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diff {
    #[serde(skip)]
    pub feed: String,
    pub topic: String,
    pub since: u64,
    pub version: u64,
    #[serde(default)]
    pub added: Vec<Entity>,
    #[serde(default)]
    pub updated: Vec<EntityPatch>,
    #[serde(default)]
    pub removed: Vec<i64>,
    #[serde(default)]
    pub is_stale: bool,
    #[serde(default)]
    pub ts: Option<String>,
}

/// Messages of a versioned feed.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    Snapshot(Snapshot),
    Diff(Diff),
    /// A fresh snapshot follows.
    Resync { feed: String, topic: String },
}

impl FeedMessage {
    pub fn feed(&self) -> &str {
        match self {
            FeedMessage::Snapshot(s) => &s.feed,
            FeedMessage::Diff(d) => &d.feed,
            FeedMessage::Resync { feed, .. } => feed,
        }
    }

    pub fn topic(&self) -> &str {
        match self {
            FeedMessage::Snapshot(s) => &s.topic,
            FeedMessage::Diff(d) => &d.topic,
            FeedMessage::Resync { topic, .. } => topic,
        }
    }
}

/// Full session state pushed on the session topic.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SessionSnapshot {
    pub topic: String,
    #[serde(default)]
    pub members: Vec<Member>,
    #[serde(default)]
    pub meta: SessionMeta,
}

/// Session-scoped events.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Snapshot(SessionSnapshot),
    PresenceJoined { topic: String, character_id: i64 },
    PresenceLeft { topic: String, character_id: i64 },
    PresenceHeartbeat { topic: String, ts: i64 },
    MemberKicked { topic: String, character_id: i64 },
    MemberLeft { topic: String, character_id: i64 },
    CodesRotated {
        topic: String,
        role: Role,
        rotated_at: i64,
    },
    Ended { topic: String },
    /// Not topic-scoped: the server moved this principal out of its session.
    ForcedLeave,
}

impl SessionEvent {
    pub fn topic(&self) -> Option<&str> {
        match self {
            SessionEvent::Snapshot(s) => Some(&s.topic),
            SessionEvent::PresenceJoined { topic, .. }
            | SessionEvent::PresenceLeft { topic, .. }
            | SessionEvent::PresenceHeartbeat { topic, .. }
            | SessionEvent::MemberKicked { topic, .. }
            | SessionEvent::MemberLeft { topic, .. }
            | SessionEvent::CodesRotated { topic, .. }
            | SessionEvent::Ended { topic } => Some(topic),
            SessionEvent::ForcedLeave => None,
        }
    }
}

/// Live location/ship fields of an attached character.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct LocationUpdate {
    #[serde(default)]
    pub system_id: Option<i64>,
    #[serde(default)]
    pub ship_type_id: Option<i64>,
    #[serde(default)]
    pub ship_type_name: Option<String>,
    #[serde(default)]
    pub online: Option<bool>,
    #[serde(default)]
    pub last_seen_at: Option<i64>,
}

/// Attachment ("toaster") events on a session topic.
#[derive(Debug, Clone, PartialEq)]
pub enum ToasterEvent {
    Attached { topic: String, toaster: Toaster },
    Detached { topic: String, character_id: i64 },
    LocationUpdated {
        topic: String,
        character_id: i64,
        location: LocationUpdate,
    },
    Updated {
        topic: String,
        character_id: i64,
        entosis_tier: EntosisTier,
    },
}

impl ToasterEvent {
    pub fn topic(&self) -> &str {
        match self {
            ToasterEvent::Attached { topic, .. }
            | ToasterEvent::Detached { topic, .. }
            | ToasterEvent::LocationUpdated { topic, .. }
            | ToasterEvent::Updated { topic, .. } => topic,
        }
    }
}

/// Server → client messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Ack { request_id: Option<String> },
    Error {
        request_id: Option<String>,
        code: String,
        message: Option<String>,
    },
    Pong { request_id: Option<String> },
    Feed(FeedMessage),
    Session(SessionEvent),
    Toaster(ToasterEvent),
}

impl ServerMessage {
    /// Topic the message belongs to, if any.
    pub fn topic(&self) -> Option<&str> {
        match self {
            ServerMessage::Feed(m) => Some(m.topic()),
            ServerMessage::Session(e) => e.topic(),
            ServerMessage::Toaster(e) => Some(e.topic()),
            _ => None,
        }
    }
}

/// Why an inbound frame was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoredFrame {
    /// Not valid JSON, or fields missing / of the wrong shape.
    Malformed(String),
    /// JSON without a string `type`.
    MissingType,
    /// A `type` this client does not understand.
    UnknownType(String),
    /// Binary frame that is not UTF-8.
    NotText,
}

impl std::fmt::Display for IgnoredFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(e) => write!(f, "malformed frame: {e}"),
            Self::MissingType => write!(f, "frame without type"),
            Self::UnknownType(t) => write!(f, "unknown message type {t:?}"),
            Self::NotText => write!(f, "non-text binary frame"),
        }
    }
}

/// Result of decoding one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(ServerMessage),
    Ignored(IgnoredFrame),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Reply {
    #[serde(default)]
    request_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorReply {
    #[serde(default)]
    request_id: Option<String>,
    code: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct TopicOnly {
    topic: String,
}

#[derive(Deserialize)]
struct TopicCharacter {
    topic: String,
    character_id: i64,
}

#[derive(Deserialize)]
struct Heartbeat {
    topic: String,
    ts: i64,
}

#[derive(Deserialize)]
struct CodesRotated {
    topic: String,
    role: Role,
    #[serde(default)]
    rotated_at: i64,
}

#[derive(Deserialize)]
struct ToasterAttached {
    topic: String,
    toaster: Toaster,
}

#[derive(Deserialize)]
struct ToasterLocation {
    topic: String,
    character_id: i64,
    #[serde(flatten)]
    location: LocationUpdate,
}

#[derive(Deserialize)]
struct ToasterTier {
    topic: String,
    character_id: i64,
    entosis_tier: EntosisTier,
}

fn parse<T: DeserializeOwned>(value: Value) -> Result<T, IgnoredFrame> {
    serde_json::from_value(value).map_err(|e| IgnoredFrame::Malformed(e.to_string()))
}

/// Decode a text frame.
pub fn decode(text: &str) -> Inbound {
    match decode_value(text) {
        Ok(msg) => Inbound::Message(msg),
        Err(reason) => Inbound::Ignored(reason),
    }
}

/// Decode a binary frame carrying UTF-8 JSON.
pub fn decode_bytes(bytes: &[u8]) -> Inbound {
    match std::str::from_utf8(bytes) {
        Ok(text) => decode(text),
        Err(_) => Inbound::Ignored(IgnoredFrame::NotText),
    }
}

fn decode_value(text: &str) -> Result<ServerMessage, IgnoredFrame> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| IgnoredFrame::Malformed(e.to_string()))?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(IgnoredFrame::MissingType)?
        .to_owned();

    let msg = match kind.as_str() {
        "ack" => ServerMessage::Ack {
            request_id: parse::<Reply>(value)?.request_id,
        },
        "pong" => ServerMessage::Pong {
            request_id: parse::<Reply>(value)?.request_id,
        },
        "error" => {
            let e: ErrorReply = parse(value)?;
            ServerMessage::Error {
                request_id: e.request_id,
                code: e.code,
                message: e.message,
            }
        }

        "session.snapshot" => ServerMessage::Session(SessionEvent::Snapshot(parse(value)?)),
        "presence.joined" => {
            let p: TopicCharacter = parse(value)?;
            ServerMessage::Session(SessionEvent::PresenceJoined {
                topic: p.topic,
                character_id: p.character_id,
            })
        }
        "presence.left" => {
            let p: TopicCharacter = parse(value)?;
            ServerMessage::Session(SessionEvent::PresenceLeft {
                topic: p.topic,
                character_id: p.character_id,
            })
        }
        "presence.heartbeat" => {
            let h: Heartbeat = parse(value)?;
            ServerMessage::Session(SessionEvent::PresenceHeartbeat {
                topic: h.topic,
                ts: h.ts,
            })
        }
        "member.kicked" => {
            let p: TopicCharacter = parse(value)?;
            ServerMessage::Session(SessionEvent::MemberKicked {
                topic: p.topic,
                character_id: p.character_id,
            })
        }
        "member.left" => {
            let p: TopicCharacter = parse(value)?;
            ServerMessage::Session(SessionEvent::MemberLeft {
                topic: p.topic,
                character_id: p.character_id,
            })
        }
        "codes.rotated" => {
            let c: CodesRotated = parse(value)?;
            ServerMessage::Session(SessionEvent::CodesRotated {
                topic: c.topic,
                role: c.role,
                rotated_at: c.rotated_at,
            })
        }
        "session.ended" => ServerMessage::Session(SessionEvent::Ended {
            topic: parse::<TopicOnly>(value)?.topic,
        }),
        "session.forced_leave" => ServerMessage::Session(SessionEvent::ForcedLeave),

        "toaster.attached" => {
            let a: ToasterAttached = parse(value)?;
            ServerMessage::Toaster(ToasterEvent::Attached {
                topic: a.topic,
                toaster: a.toaster,
            })
        }
        "toaster.detached" => {
            let d: TopicCharacter = parse(value)?;
            ServerMessage::Toaster(ToasterEvent::Detached {
                topic: d.topic,
                character_id: d.character_id,
            })
        }
        "toaster.location_updated" => {
            let l: ToasterLocation = parse(value)?;
            ServerMessage::Toaster(ToasterEvent::LocationUpdated {
                topic: l.topic,
                character_id: l.character_id,
                location: l.location,
            })
        }
        "toaster.updated" => {
            let t: ToasterTier = parse(value)?;
            ServerMessage::Toaster(ToasterEvent::Updated {
                topic: t.topic,
                character_id: t.character_id,
                entosis_tier: t.entosis_tier,
            })
        }

        other => return decode_feed(other, value),
    };
    Ok(msg)
}

fn decode_feed(kind: &str, value: Value) -> Result<ServerMessage, IgnoredFrame> {
    let Some((feed, suffix)) = kind.rsplit_once('.') else {
        return Err(IgnoredFrame::UnknownType(kind.to_owned()));
    };
    if feed.is_empty() {
        return Err(IgnoredFrame::UnknownType(kind.to_owned()));
    }
    let feed = feed.to_owned();
    let msg = match suffix {
        "snapshot" => {
            let mut s: Snapshot = parse(value)?;
            s.feed = feed;
            FeedMessage::Snapshot(s)
        }
        "diff" => {
            let mut d: Diff = parse(value)?;
            d.feed = feed;
            FeedMessage::Diff(d)
        }
        "resync" => FeedMessage::Resync {
            feed,
            topic: parse::<TopicOnly>(value)?.topic,
        },
        _ => return Err(IgnoredFrame::UnknownType(kind.to_owned())),
    };
    Ok(ServerMessage::Feed(msg))
}
