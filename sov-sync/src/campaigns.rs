//! The public sovereignty campaign feed.
//!
//! [`CampaignBoard`] wraps a [`TopicSynchronizer`] for `public.campaigns` with
//! a typed view and keeps campaigns removed by a diff as "completed" so a
//! session can still show how they ended. [`CampaignFeed`] wires a board to a
//! live connection: it subscribes, feeds it every matching message, performs
//! its catch-up / resubscribe effects and publishes changes on a watch channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::broadcast::HandlerRegistration;
use crate::connection::{ConnectionHandle, ConnectionState};
use crate::model::Side;
use crate::protocol::{Entity, FeedMessage, ServerMessage};
use crate::topic::{CatchupPolicy, FeedSpec, Outcome, Step, TopicEffect, TopicSynchronizer};

/// Defender share (in percent) at or above which the defense wins.
pub const DEFENSE_WIN_PCT: i64 = 60;

/// A contested structure campaign as published on the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    pub campaign_id: i64,
    #[serde(default)]
    pub solar_system_id: Option<i64>,
    #[serde(default)]
    pub structure_id: Option<i64>,
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub defender_id: Option<i64>,
    #[serde(default)]
    pub defender_score: f64,
    #[serde(default)]
    pub attackers_score: f64,
    #[serde(default)]
    pub system_name: Option<String>,
    #[serde(default)]
    pub constellation_name: Option<String>,
    #[serde(default)]
    pub region_name: Option<String>,
    #[serde(default)]
    pub defender_name: Option<String>,
    #[serde(default)]
    pub defender_category: Option<String>,
    #[serde(default)]
    pub defender_icon: Option<String>,
    #[serde(default)]
    pub out_time_utc: Option<String>,
    #[serde(default)]
    pub out_time_raw: Option<String>,
    #[serde(default)]
    pub def_pct: Option<f64>,
    #[serde(default)]
    pub adm: Option<f64>,
    #[serde(default)]
    pub adm_observed_at: Option<String>,
}

impl Campaign {
    /// Typed view of a feed entity. `None` if the entity lacks an id or has
    /// fields of the wrong shape.
    pub fn from_entity(entity: &Entity) -> Option<Self> {
        serde_json::from_value(Value::Object(entity.clone())).ok()
    }

    /// Defender share in whole percent.
    pub fn defender_pct(&self) -> i64 {
        let pct = self.def_pct.unwrap_or(self.defender_score * 100.0);
        pct.round() as i64
    }

    /// Side that wins if the campaign ended now.
    pub fn winner(&self) -> Side {
        if self.defender_pct() >= DEFENSE_WIN_PCT {
            Side::Defense
        } else {
            Side::Offense
        }
    }

    /// When the structure comes out of reinforcement.
    pub fn out_time(&self) -> Option<DateTime<Utc>> {
        self.out_time_raw
            .as_deref()
            .and_then(parse_time)
            .or_else(|| self.out_time_utc.as_deref().and_then(parse_time))
    }

    /// Time left until [`out_time`](Self::out_time); negative once passed.
    pub fn eta(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.out_time().map(|out| out - now)
    }

    /// Out time passed while the campaign is still running.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.eta(now).is_some_and(|eta| eta <= chrono::Duration::zero())
    }

    /// Countdown label relative to `now`, e.g. `T-01:05:00`.
    pub fn countdown(&self, now: DateTime<Utc>) -> Option<String> {
        self.eta(now).map(|eta| format_countdown(eta.num_milliseconds()))
    }
}

fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y.%m.%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|t| t.and_utc())
}

/// Countdown label for a signed offset in milliseconds.
///
/// `T-hh:mm:ss` while in the future, `T+hh:mm:ss` once passed; a `d:` day
/// field is added from one day on.
pub fn format_countdown(delta_ms: i64) -> String {
    let sign = if delta_ms > 0 { '-' } else { '+' };
    let total = delta_ms.unsigned_abs() / 1000;
    let (days, hours) = (total / 86_400, (total % 86_400) / 3600);
    let (minutes, seconds) = ((total % 3600) / 60, total % 60);
    if days == 0 {
        format!("T{sign}{hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("T{sign}{days}:{hours:02}:{minutes:02}:{seconds:02}")
    }
}

/// A session-selected campaign as it should be displayed.
#[derive(Debug, Clone, PartialEq)]
pub enum CampaignSlot {
    Active(Campaign),
    /// Removed from the feed; `winner` derived from the last known score.
    Completed { campaign: Campaign, winner: Side },
    /// Not seen yet.
    Unknown(i64),
}

/// Campaign replica with completed-campaign retention.
#[derive(Debug, Clone)]
pub struct CampaignBoard {
    sync: TopicSynchronizer,
    completed: HashMap<i64, Campaign>,
}

impl CampaignBoard {
    pub fn new(policy: CatchupPolicy) -> Self {
        Self {
            sync: TopicSynchronizer::new(FeedSpec::public_campaigns(), policy),
            completed: HashMap::new(),
        }
    }

    pub fn synchronizer(&self) -> &TopicSynchronizer {
        &self.sync
    }

    pub fn apply(&mut self, msg: &FeedMessage, now: Instant) -> Step {
        let step = self.sync.apply(msg, now);
        match &step.outcome {
            Outcome::Applied(summary) => {
                for entity in &summary.removed {
                    if let Some(campaign) = Campaign::from_entity(entity) {
                        self.completed.insert(campaign.campaign_id, campaign);
                    }
                }
                for id in self.sync.entities().keys() {
                    self.completed.remove(id);
                }
            }
            Outcome::Replaced { .. } => {
                for id in self.sync.entities().keys() {
                    self.completed.remove(id);
                }
            }
            _ => {}
        }
        step
    }

    pub fn tick(&mut self, now: Instant) -> Option<TopicEffect> {
        self.sync.tick(now)
    }

    /// The connection dropped; the next snapshot is authoritative.
    pub fn begin_subscription(&mut self) {
        self.sync.begin_subscription();
    }

    pub fn get(&self, id: i64) -> Option<Campaign> {
        self.sync.get(id).and_then(Campaign::from_entity)
    }

    pub fn completed(&self, id: i64) -> Option<&Campaign> {
        self.completed.get(&id)
    }

    /// Forget a completed campaign (the user dismissed it).
    pub fn dismiss(&mut self, id: i64) -> bool {
        self.completed.remove(&id).is_some()
    }

    /// Active campaigns ordered by out time, unknown times last.
    pub fn campaigns(&self) -> Vec<Campaign> {
        let mut list: Vec<Campaign> = self
            .sync
            .entities()
            .values()
            .filter_map(Campaign::from_entity)
            .collect();
        list.sort_by(|a, b| match (a.out_time(), b.out_time()) {
            (Some(x), Some(y)) => x.cmp(&y).then(a.campaign_id.cmp(&b.campaign_id)),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.campaign_id.cmp(&b.campaign_id),
        });
        list
    }

    /// Display slots for a session's selected campaign ids, in the given order.
    pub fn slots(&self, ids: &[i64]) -> Vec<CampaignSlot> {
        ids.iter()
            .map(|&id| match (self.get(id), self.completed.get(&id)) {
                (Some(active), _) => CampaignSlot::Active(active),
                (None, Some(done)) => CampaignSlot::Completed {
                    winner: done.winner(),
                    campaign: done.clone(),
                },
                (None, None) => CampaignSlot::Unknown(id),
            })
            .collect()
    }

    pub fn status(&self) -> FeedStatus {
        FeedStatus {
            version: self.sync.version(),
            count: self.sync.len(),
            stale: self.sync.is_stale(),
            last_update: self.sync.last_update(),
            catchup_pending: self.sync.catchup_pending(),
        }
    }
}

/// Summary published on every change of a [`CampaignFeed`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FeedStatus {
    pub version: u64,
    pub count: usize,
    pub stale: bool,
    pub last_update: Option<DateTime<Utc>>,
    pub catchup_pending: bool,
}

/// A [`CampaignBoard`] kept live over a connection.
///
/// Several feeds may share one connection; each holds the topic
/// independently. Dropping a feed releases its hold and unregisters its
/// handler.
pub struct CampaignFeed {
    board: Arc<Mutex<CampaignBoard>>,
    conn: ConnectionHandle,
    topic: String,
    _handler: HandlerRegistration,
    status_rx: watch::Receiver<FeedStatus>,
    ticker: JoinHandle<()>,
}

impl CampaignFeed {
    /// Subscribe to the public campaign feed. Must be called within a tokio runtime.
    ///
    /// `tick_every` paces catch-up retries for unanswered gaps.
    /// A connection drop starts a new subscription lifetime for the board.
    pub fn attach(conn: &ConnectionHandle, policy: CatchupPolicy, tick_every: Duration) -> Self {
        let board = Arc::new(Mutex::new(CampaignBoard::new(policy)));
        let spec = FeedSpec::public_campaigns();
        let (status_tx, status_rx) = watch::channel(FeedStatus::default());
        let status_tx = Arc::new(status_tx);

        let handler = {
            let board = Arc::clone(&board);
            let handler_conn = conn.clone();
            let spec = spec.clone();
            let status_tx = Arc::clone(&status_tx);
            conn.add_message_handler(move |msg| {
                let ServerMessage::Feed(feed_msg) = msg else {
                    return;
                };
                if !spec.matches(feed_msg) {
                    return;
                }
                let (step, status) = {
                    let mut board = board.lock().unwrap_or_else(|e| e.into_inner());
                    let step = board.apply(feed_msg, Instant::now());
                    (step, board.status())
                };
                if let Some(effect) = step.effect {
                    run_effect(&handler_conn, &spec, effect);
                }
                if step.outcome.changed() {
                    handler_conn.set_resume_version(spec.topic.clone(), status.version);
                }
                status_tx.send_if_modified(|current| {
                    if *current == status {
                        false
                    } else {
                        *current = status;
                        true
                    }
                });
            })
        };

        let ticker = {
            let board = Arc::clone(&board);
            let conn = conn.clone();
            let spec = spec.clone();
            let mut states = conn.state_changes();
            let mut was_open = *states.borrow_and_update() == ConnectionState::Open;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(tick_every);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            let effect = board
                                .lock()
                                .unwrap_or_else(|e| e.into_inner())
                                .tick(Instant::now());
                            if let Some(effect) = effect {
                                run_effect(&conn, &spec, effect);
                            }
                        }
                        changed = states.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            let open = *states.borrow_and_update() == ConnectionState::Open;
                            // open -> open means a drop and reopen were coalesced
                            if !open || was_open {
                                board
                                    .lock()
                                    .unwrap_or_else(|e| e.into_inner())
                                    .begin_subscription();
                            }
                            was_open = open;
                        }
                    }
                }
            })
        };

        let resume = board
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .synchronizer()
            .resume_version();
        conn.subscribe(spec.topic.clone(), resume);
        conn.ensure();

        Self {
            board,
            conn: conn.clone(),
            topic: spec.topic,
            _handler: handler,
            status_rx,
            ticker,
        }
    }

    /// Receiver notified whenever the board changes.
    pub fn changes(&self) -> watch::Receiver<FeedStatus> {
        self.status_rx.clone()
    }

    pub fn status(&self) -> FeedStatus {
        self.status_rx.borrow().clone()
    }

    /// Run `f` against the current board.
    pub fn with_board<R>(&self, f: impl FnOnce(&CampaignBoard) -> R) -> R {
        let board = self.board.lock().unwrap_or_else(|e| e.into_inner());
        f(&board)
    }

    pub fn campaigns(&self) -> Vec<Campaign> {
        self.with_board(CampaignBoard::campaigns)
    }

    pub fn slots(&self, ids: &[i64]) -> Vec<CampaignSlot> {
        self.with_board(|board| board.slots(ids))
    }

    pub fn dismiss(&self, id: i64) -> bool {
        self.board
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .dismiss(id)
    }
}

impl Drop for CampaignFeed {
    fn drop(&mut self) {
        self.ticker.abort();
        self.conn.unsubscribe(self.topic.clone());
    }
}

fn run_effect(conn: &ConnectionHandle, spec: &FeedSpec, effect: TopicEffect) {
    match effect {
        TopicEffect::SendCatchup { since } => {
            log::info!("{}: requesting catch-up since v{since}", spec.topic);
            conn.send(spec.catchup_message(since));
        }
        TopicEffect::Resubscribe => {
            log::warn!("{}: resubscribing for a fresh snapshot", spec.topic);
            conn.resubscribe(spec.topic.clone());
        }
    }
}
