//! # sov-sync: Real-time campaign and session synchronization client
//!
//! Keeps one persistent WebSocket open to the sync server, multiplexes
//! topic subscriptions over it, and turns server pushes into locally
//! consistent state.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐     WebSocket (JSON)     ┌─────────────┐
//! │ ConnectionManager│ ◄──────────────────────► │ Sync server │
//! │ (driver task)    │                          └──────┬──────┘
//! └───────┬──────────┘                                 │ REST
//!         │ handlers                                   │
//!         ├──────────────► CampaignFeed ── TopicSynchronizer (versioned entities)
//!         │                                            │
//!         └──────────────► LobbyService ── SessionLobby + ToasterRoster
//!                               │                      │
//!                               └──────── ApiClient ◄──┘
//!
//! AuthTokenBridge ── token changes ──► ConnectionManager, ApiClient
//! ```
//!
//! ## Modules
//!
//! - [`connection`]: Socket lifecycle, outbound queue, subscription replay
//! - [`topic`]: Versioned snapshot/diff reconciliation with catch-up
//! - [`campaigns`]: Public campaign feed built on [`topic`]
//! - [`session`]: Session lobby reducer
//! - [`toasters`]: Attachment roster of a session
//! - [`lobby`]: Lobby service combining the socket and REST
//! - [`api`]: REST client
//! - [`auth`]: Token propagation
//! - [`protocol`]: JSON wire format

pub mod api;
pub mod auth;
pub mod broadcast;
pub mod campaigns;
pub mod config;
pub mod connection;
pub mod error;
pub mod lobby;
pub mod model;
pub mod protocol;
pub mod scheduler;
pub mod session;
pub mod toasters;
pub mod topic;

// Re-exports for convenience
pub use api::{ActiveSession, ApiClient, CreatedSession, JoinedSession, SessionDetails};
pub use auth::AuthTokenBridge;
pub use broadcast::{
    ConnectionStats, HandlerId, HandlerRegistration, HandlerRegistry, MessageHandler,
};
pub use campaigns::{Campaign, CampaignBoard, CampaignFeed, CampaignSlot, FeedStatus};
pub use config::ClientConfig;
pub use connection::{ConnectionCore, ConnectionHandle, ConnectionManager, ConnectionState};
pub use error::{ApiError, ConfigError, ProtocolError, TransportError};
pub use lobby::LobbyService;
pub use model::{CampaignSelection, EntosisTier, Member, Role, SessionMeta, Side, Toaster};
pub use protocol::{ClientMessage, Entity, FeedMessage, Inbound, ServerMessage, SessionEvent};
pub use scheduler::{BackoffPolicy, ReconnectTimer};
pub use session::{LobbyEffect, LobbyNotice, LobbyPhase, SessionLobby, SessionState};
pub use toasters::ToasterRoster;
pub use topic::{CatchupPolicy, FeedSpec, Outcome, TopicEffect, TopicSynchronizer};
