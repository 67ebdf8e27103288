//! Per-topic version reconciliation.
//!
//! A [`TopicSynchronizer`] keeps one topic's entity map in step with the
//! server's version counter:
//! ```text
//! snapshot(v)          → replace everything, version := v
//! diff(since, v)       → since == version: apply, version := v
//!                        since != version: gap, request catch-up, discard
//! resync               → catch-up wait over, snapshot follows
//! ```
//! It never touches the socket. [`TopicSynchronizer::apply`] returns an
//! [`Outcome`] plus an optional [`TopicEffect`] for the caller to perform.
//!
//! The first snapshot of a subscription lifetime (after subscribing,
//! reconnecting, a resync or a reset) is accepted even if its version is
//! lower than the local one: the server may have restarted its counter.
//! Later snapshots older than the local version are ignored.
//!
//! Catch-up requests are rate limited to one in flight. An unanswered request
//! is retried after `retry_after`; after `max_attempts` requests without a
//! contiguous update the topic is reset and a full resubscribe is requested.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::protocol::{ClientMessage, Diff, Entity, FeedMessage, Snapshot};

/// Identifies one versioned feed on the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedSpec {
    /// Message type prefix (`campaigns` for `campaigns.diff`)
    pub feed: String,
    /// Subscription topic
    pub topic: String,
    /// Integer field identifying an entity
    pub key_field: String,
}

impl FeedSpec {
    pub fn new(
        feed: impl Into<String>,
        topic: impl Into<String>,
        key_field: impl Into<String>,
    ) -> Self {
        Self {
            feed: feed.into(),
            topic: topic.into(),
            key_field: key_field.into(),
        }
    }

    /// The public sovereignty campaign feed.
    pub fn public_campaigns() -> Self {
        Self::new("campaigns", "public.campaigns", "campaign_id")
    }

    pub fn matches(&self, msg: &FeedMessage) -> bool {
        msg.feed() == self.feed && msg.topic() == self.topic
    }

    /// Catch-up request replaying history after `since`.
    pub fn catchup_message(&self, since: u64) -> ClientMessage {
        ClientMessage::Catchup {
            feed: self.feed.clone(),
            topic: self.topic.clone(),
            since,
        }
    }

    /// Id of `entity`, read from the key field (or a plain `id`).
    pub fn key_of(&self, entity: &Entity) -> Option<i64> {
        entity
            .get(&self.key_field)
            .or_else(|| entity.get("id"))
            .and_then(Value::as_i64)
    }
}

/// Catch-up retry limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatchupPolicy {
    /// Minimum time between two catch-up requests for one topic
    pub retry_after: Duration,
    /// Requests sent without progress before a hard resubscribe
    pub max_attempts: u32,
}

impl Default for CatchupPolicy {
    fn default() -> Self {
        Self {
            retry_after: Duration::from_secs(5),
            max_attempts: 3,
        }
    }
}

/// Why a message left the state untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Different feed or topic
    OtherTopic,
    /// Snapshot older than the local version, within one subscription lifetime
    StaleSnapshot { local: u64, received: u64 },
    /// Diff whose version precedes its own `since`
    InvalidRange { since: u64, version: u64 },
}

/// Summary of an applied diff.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DiffSummary {
    pub added: usize,
    pub updated: usize,
    /// Updates naming an id not present locally
    pub unknown_updates: usize,
    /// Entities taken out of the map, as they were before removal
    pub removed: Vec<Entity>,
}

/// Result of feeding one message to a synchronizer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Snapshot applied; the map now holds `count` entities.
    Replaced { count: usize },
    /// Contiguous diff applied.
    Applied(DiffSummary),
    /// Non-contiguous diff discarded.
    Gap { local: u64, since: u64 },
    /// Resync received; waiting for the snapshot.
    ResyncPending,
    Ignored(SkipReason),
}

impl Outcome {
    /// True if entities or version changed.
    pub fn changed(&self) -> bool {
        matches!(self, Outcome::Replaced { .. } | Outcome::Applied(_))
    }
}

/// Socket action requested by a synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicEffect {
    /// Send `<feed>.catchup` with this `since`.
    SendCatchup { since: u64 },
    /// Unsubscribe and subscribe again without a resume version.
    Resubscribe,
}

/// Outcome of one step plus the effect to run, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub outcome: Outcome,
    pub effect: Option<TopicEffect>,
}

impl Step {
    fn quiet(outcome: Outcome) -> Self {
        Self {
            outcome,
            effect: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingCatchup {
    since: u64,
    sent_at: Instant,
}

/// Local replica of one versioned topic.
#[derive(Debug, Clone)]
pub struct TopicSynchronizer {
    spec: FeedSpec,
    policy: CatchupPolicy,
    version: u64,
    entities: HashMap<i64, Entity>,
    stale: bool,
    last_update: Option<DateTime<Utc>>,
    pending: Option<PendingCatchup>,
    attempts: u32,
    awaiting_snapshot: bool,
}

impl TopicSynchronizer {
    pub fn new(spec: FeedSpec, policy: CatchupPolicy) -> Self {
        Self {
            spec,
            policy,
            version: 0,
            entities: HashMap::new(),
            stale: false,
            last_update: None,
            pending: None,
            attempts: 0,
            awaiting_snapshot: true,
        }
    }

    pub fn spec(&self) -> &FeedSpec {
        &self.spec
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn entities(&self) -> &HashMap<i64, Entity> {
        &self.entities
    }

    pub fn get(&self, id: i64) -> Option<&Entity> {
        self.entities.get(&id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Server flagged the data as stale, or the topic was reset.
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }

    pub fn catchup_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Catch-up requests sent since the last progress.
    pub fn catchup_attempts(&self) -> u32 {
        self.attempts
    }

    /// Version to resume from on resubscribe; `None` before the first update.
    pub fn resume_version(&self) -> Option<u64> {
        (self.version > 0).then_some(self.version)
    }

    /// Apply one feed message.
    pub fn apply(&mut self, msg: &FeedMessage, now: Instant) -> Step {
        if !self.spec.matches(msg) {
            return Step::quiet(Outcome::Ignored(SkipReason::OtherTopic));
        }
        match msg {
            FeedMessage::Snapshot(snapshot) => Step::quiet(self.apply_snapshot(snapshot)),
            FeedMessage::Diff(diff) => self.apply_diff(diff, now),
            FeedMessage::Resync { .. } => {
                // attempts survive a resync so repeated gaps stay bounded
                self.pending = None;
                self.awaiting_snapshot = true;
                Step::quiet(Outcome::ResyncPending)
            }
        }
    }

    /// Retry an overdue catch-up. Call periodically.
    pub fn tick(&mut self, now: Instant) -> Option<TopicEffect> {
        let pending = self.pending?;
        if now.saturating_duration_since(pending.sent_at) < self.policy.retry_after {
            return None;
        }
        self.request_catchup(now)
    }

    /// The subscription is being (re)established; the next snapshot is
    /// authoritative whatever its version.
    pub fn begin_subscription(&mut self) {
        self.awaiting_snapshot = true;
    }

    /// True until the first snapshot or diff of the current lifetime lands.
    pub fn awaiting_snapshot(&self) -> bool {
        self.awaiting_snapshot
    }

    /// Start a new subscription lifetime: version 0, entities kept but stale.
    pub fn reset(&mut self) {
        self.version = 0;
        self.stale = true;
        self.pending = None;
        self.attempts = 0;
        self.awaiting_snapshot = true;
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.reset();
        self.entities.clear();
        self.stale = false;
        self.last_update = None;
    }

    fn apply_snapshot(&mut self, snapshot: &Snapshot) -> Outcome {
        if snapshot.version < self.version && !self.awaiting_snapshot {
            log::debug!(
                "{}: ignoring snapshot v{} older than local v{}",
                self.spec.topic,
                snapshot.version,
                self.version
            );
            return Outcome::Ignored(SkipReason::StaleSnapshot {
                local: self.version,
                received: snapshot.version,
            });
        }

        if snapshot.version < self.version {
            log::info!(
                "{}: server version went back from v{} to v{}",
                self.spec.topic,
                self.version,
                snapshot.version
            );
        }
        self.entities = snapshot
            .data
            .iter()
            .filter_map(|entity| match self.spec.key_of(entity) {
                Some(id) => Some((id, entity.clone())),
                None => {
                    log::warn!("{}: snapshot entity without key dropped", self.spec.topic);
                    None
                }
            })
            .collect();
        self.mark_progress(snapshot.version, snapshot.is_stale, snapshot.ts.as_deref());
        Outcome::Replaced {
            count: self.entities.len(),
        }
    }

    fn apply_diff(&mut self, diff: &Diff, now: Instant) -> Step {
        if diff.version < diff.since {
            return Step::quiet(Outcome::Ignored(SkipReason::InvalidRange {
                since: diff.since,
                version: diff.version,
            }));
        }
        if diff.since != self.version {
            log::debug!(
                "{}: gap, diff since v{} but local v{}",
                self.spec.topic,
                diff.since,
                self.version
            );
            let local = self.version;
            let effect = match self.pending {
                None => self.request_catchup(now),
                Some(_) => self.tick(now),
            };
            return Step {
                outcome: Outcome::Gap {
                    local,
                    since: diff.since,
                },
                effect,
            };
        }

        let mut summary = DiffSummary::default();
        for id in &diff.removed {
            if let Some(entity) = self.entities.remove(id) {
                summary.removed.push(entity);
            }
        }
        for entity in &diff.added {
            if let Some(id) = self.spec.key_of(entity) {
                self.entities.insert(id, entity.clone());
                summary.added += 1;
            }
        }
        for patch in &diff.updated {
            let target = patch
                .id(&self.spec.key_field)
                .and_then(|id| self.entities.get_mut(&id));
            match target {
                Some(entity) => {
                    for (field, value) in &patch.changes {
                        if *field != self.spec.key_field {
                            entity.insert(field.clone(), value.clone());
                        }
                    }
                    summary.updated += 1;
                }
                None => summary.unknown_updates += 1,
            }
        }
        self.mark_progress(diff.version, diff.is_stale, diff.ts.as_deref());
        Step::quiet(Outcome::Applied(summary))
    }

    fn request_catchup(&mut self, now: Instant) -> Option<TopicEffect> {
        if self.attempts >= self.policy.max_attempts {
            log::warn!(
                "{}: {} catch-up requests unanswered, resubscribing",
                self.spec.topic,
                self.attempts
            );
            self.reset();
            // the resubscribe counts as the request in flight
            self.pending = Some(PendingCatchup { since: 0, sent_at: now });
            return Some(TopicEffect::Resubscribe);
        }
        self.attempts += 1;
        self.pending = Some(PendingCatchup {
            since: self.version,
            sent_at: now,
        });
        Some(TopicEffect::SendCatchup {
            since: self.version,
        })
    }

    fn mark_progress(&mut self, version: u64, stale: bool, ts: Option<&str>) {
        self.version = version;
        self.stale = stale;
        self.last_update = Some(
            ts.and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(Utc::now),
        );
        self.pending = None;
        self.attempts = 0;
        self.awaiting_snapshot = false;
    }

    /// `since` of the outstanding catch-up, if any.
    pub fn pending_since(&self) -> Option<u64> {
        self.pending.map(|p| p.since)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EntityPatch;
    use serde_json::json;

    fn entity(value: Value) -> Entity {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    fn sync() -> TopicSynchronizer {
        TopicSynchronizer::new(FeedSpec::public_campaigns(), CatchupPolicy::default())
    }

    fn snapshot(version: u64, data: Vec<Value>) -> FeedMessage {
        FeedMessage::Snapshot(Snapshot {
            feed: "campaigns".into(),
            topic: "public.campaigns".into(),
            version,
            data: data.into_iter().map(entity).collect(),
            is_stale: false,
            ts: Some("2025-06-01T12:00:00Z".into()),
        })
    }

    fn diff(since: u64, version: u64) -> Diff {
        Diff {
            feed: "campaigns".into(),
            topic: "public.campaigns".into(),
            since,
            version,
            added: vec![],
            updated: vec![],
            removed: vec![],
            is_stale: false,
            ts: None,
        }
    }

    fn patch(id: i64, changes: Value) -> EntityPatch {
        EntityPatch {
            changes: entity(changes),
            key: entity(json!({ "campaign_id": id })),
        }
    }

    fn at_v10() -> TopicSynchronizer {
        let mut s = sync();
        let data = (1..=6)
            .map(|id| json!({ "campaign_id": id, "defender_score": 0.5, "system": "X" }))
            .collect();
        s.apply(&snapshot(10, data), Instant::now());
        s
    }

    #[test]
    fn test_contiguous_diff_removes() {
        let mut s = at_v10();
        let mut d = diff(10, 11);
        d.removed = vec![5];
        let step = s.apply(&FeedMessage::Diff(d), Instant::now());

        assert!(s.get(5).is_none());
        assert_eq!(s.version(), 11);
        assert_eq!(s.len(), 5);
        let Outcome::Applied(summary) = step.outcome else {
            panic!("expected applied");
        };
        assert_eq!(summary.removed.len(), 1);
        assert_eq!(summary.removed[0]["campaign_id"], 5);
        assert!(step.effect.is_none());
    }

    #[test]
    fn test_gap_requests_catchup_from_local_version() {
        let mut s = at_v10();
        let before = s.entities().clone();
        let mut d = diff(9, 12);
        d.removed = vec![1];
        let step = s.apply(&FeedMessage::Diff(d), Instant::now());

        assert_eq!(step.outcome, Outcome::Gap { local: 10, since: 9 });
        assert_eq!(step.effect, Some(TopicEffect::SendCatchup { since: 10 }));
        assert_eq!(s.entities(), &before);
        assert_eq!(s.version(), 10);
        assert!(s.catchup_pending());
    }

    #[test]
    fn test_snapshot_replaces_exactly() {
        let mut s = at_v10();
        s.apply(&FeedMessage::Diff(diff(10, 11)), Instant::now());
        s.apply(&snapshot(20, vec![json!({ "id": 1, "x": 1 })]), Instant::now());

        assert_eq!(s.version(), 20);
        assert_eq!(s.len(), 1);
        assert_eq!(s.get(1).unwrap()["x"], 1);
    }

    #[test]
    fn test_snapshot_wins_over_prior_diffs() {
        let now = Instant::now();
        let snap = snapshot(30, vec![json!({ "campaign_id": 7, "score": 1 })]);

        let mut with_diffs = at_v10();
        let mut d = diff(10, 11);
        d.added = vec![entity(json!({ "campaign_id": 99 }))];
        d.updated = vec![patch(7, json!({ "score": 0 }))];
        with_diffs.apply(&FeedMessage::Diff(d), now);
        with_diffs.apply(&snap, now);

        let mut only = sync();
        only.apply(&snap, now);

        assert_eq!(with_diffs.entities(), only.entities());
        assert_eq!(with_diffs.version(), only.version());
    }

    #[test]
    fn test_sequential_diffs_equal_cumulative() {
        let now = Instant::now();
        let mut stepwise = at_v10();
        let mut first = diff(10, 11);
        first.added = vec![entity(json!({ "campaign_id": 8, "a": 1, "b": 1 }))];
        first.removed = vec![2];
        let mut second = diff(11, 12);
        second.updated = vec![patch(8, json!({ "b": 2 })), patch(3, json!({ "defender_score": 0.7 }))];
        second.removed = vec![4];
        stepwise.apply(&FeedMessage::Diff(first), now);
        stepwise.apply(&FeedMessage::Diff(second), now);

        let mut cumulative = at_v10();
        let mut both = diff(10, 12);
        both.added = vec![entity(json!({ "campaign_id": 8, "a": 1, "b": 2 }))];
        both.updated = vec![patch(3, json!({ "defender_score": 0.7 }))];
        both.removed = vec![2, 4];
        cumulative.apply(&FeedMessage::Diff(both), now);

        assert_eq!(stepwise.entities(), cumulative.entities());
        assert_eq!(stepwise.version(), cumulative.version());
    }

    #[test]
    fn test_many_gaps_one_catchup() {
        let mut s = at_v10();
        let now = Instant::now();
        let effects: Vec<_> = (0..20)
            .map(|n| s.apply(&FeedMessage::Diff(diff(50 + n, 51 + n)), now).effect)
            .collect();
        assert_eq!(effects.iter().filter(|e| e.is_some()).count(), 1);
        assert_eq!(s.version(), 10);
        assert_eq!(s.len(), 6);
    }

    #[test]
    fn test_update_merges_shallowly_and_keeps_key() {
        let mut s = at_v10();
        let mut d = diff(10, 11);
        d.updated = vec![
            patch(3, json!({ "defender_score": 0.9, "campaign_id": 77 })),
            patch(404, json!({ "defender_score": 0.1 })),
        ];
        let step = s.apply(&FeedMessage::Diff(d), Instant::now());

        let e = s.get(3).unwrap();
        assert_eq!(e["defender_score"], 0.9);
        assert_eq!(e["system"], "X");
        assert_eq!(e["campaign_id"], 3);
        assert!(s.get(404).is_none());
        let Outcome::Applied(summary) = step.outcome else {
            panic!("expected applied");
        };
        assert_eq!((summary.updated, summary.unknown_updates), (1, 1));
    }

    #[test]
    fn test_resync_clears_pending_without_touching_entities() {
        let mut s = at_v10();
        let now = Instant::now();
        s.apply(&FeedMessage::Diff(diff(3, 4)), now);
        assert!(s.catchup_pending());

        let step = s.apply(
            &FeedMessage::Resync {
                feed: "campaigns".into(),
                topic: "public.campaigns".into(),
            },
            now,
        );
        assert_eq!(step.outcome, Outcome::ResyncPending);
        assert!(!s.catchup_pending());
        assert_eq!(s.len(), 6);
        assert_eq!(s.version(), 10);
    }

    #[test]
    fn test_catchup_retried_then_resubscribe() {
        let policy = CatchupPolicy::default();
        let mut s = at_v10();
        let t0 = Instant::now();

        assert_eq!(
            s.apply(&FeedMessage::Diff(diff(3, 4)), t0).effect,
            Some(TopicEffect::SendCatchup { since: 10 })
        );
        assert_eq!(s.tick(t0 + Duration::from_secs(1)), None);
        assert_eq!(
            s.tick(t0 + policy.retry_after),
            Some(TopicEffect::SendCatchup { since: 10 })
        );
        assert_eq!(
            s.tick(t0 + policy.retry_after * 2),
            Some(TopicEffect::SendCatchup { since: 10 })
        );
        assert_eq!(s.catchup_attempts(), 3);

        assert_eq!(s.tick(t0 + policy.retry_after * 3), Some(TopicEffect::Resubscribe));
        assert_eq!(s.version(), 0);
        assert!(s.is_stale());
        assert_eq!(s.len(), 6);

        // new lifetime: any snapshot accepted
        let step = s.apply(&snapshot(2, vec![json!({ "campaign_id": 1 })]), t0);
        assert!(step.outcome.changed());
        assert!(!s.catchup_pending());
        assert!(!s.is_stale());
    }

    #[test]
    fn test_resync_does_not_reset_attempts() {
        let mut s = at_v10();
        let resync = FeedMessage::Resync {
            feed: "campaigns".into(),
            topic: "public.campaigns".into(),
        };
        let now = Instant::now();
        for _ in 0..3 {
            s.apply(&FeedMessage::Diff(diff(1, 2)), now);
            s.apply(&resync, now);
        }
        assert_eq!(
            s.apply(&FeedMessage::Diff(diff(1, 2)), now).effect,
            Some(TopicEffect::Resubscribe)
        );
    }

    #[test]
    fn test_contiguous_diff_clears_pending() {
        let mut s = at_v10();
        let now = Instant::now();
        s.apply(&FeedMessage::Diff(diff(3, 4)), now);
        s.apply(&FeedMessage::Diff(diff(10, 11)), now);
        assert!(!s.catchup_pending());
        assert_eq!(s.catchup_attempts(), 0);
        assert_eq!(s.version(), 11);
    }

    #[test]
    fn test_stale_snapshot_and_invalid_range_ignored() {
        let mut s = at_v10();
        let now = Instant::now();
        assert_eq!(
            s.apply(&snapshot(4, vec![]), now).outcome,
            Outcome::Ignored(SkipReason::StaleSnapshot { local: 10, received: 4 })
        );
        assert_eq!(
            s.apply(&FeedMessage::Diff(diff(10, 9)), now).outcome,
            Outcome::Ignored(SkipReason::InvalidRange { since: 10, version: 9 })
        );
        assert_eq!(s.len(), 6);
        assert_eq!(s.version(), 10);
    }

    #[test]
    fn test_first_snapshot_after_resubscribe_may_go_back() {
        let mut s = at_v10();
        let now = Instant::now();
        assert!(!s.awaiting_snapshot());

        s.begin_subscription();
        let step = s.apply(&snapshot(3, vec![json!({ "campaign_id": 42 })]), now);
        assert_eq!(step.outcome, Outcome::Replaced { count: 1 });
        assert_eq!(s.version(), 3);
        assert!(s.get(42).is_some());

        // same lifetime again: older snapshots are stale
        assert!(matches!(
            s.apply(&snapshot(2, vec![]), now).outcome,
            Outcome::Ignored(SkipReason::StaleSnapshot { local: 3, received: 2 })
        ));
    }

    #[test]
    fn test_resync_accepts_lower_snapshot() {
        let mut s = at_v10();
        let now = Instant::now();
        s.apply(
            &FeedMessage::Resync {
                feed: "campaigns".into(),
                topic: "public.campaigns".into(),
            },
            now,
        );
        assert!(s.apply(&snapshot(1, vec![]), now).outcome.changed());
        assert_eq!(s.version(), 1);
        assert!(s.is_empty());
    }

    #[test]
    fn test_diff_ends_snapshot_wait() {
        let mut s = at_v10();
        let now = Instant::now();
        s.begin_subscription();
        s.apply(&FeedMessage::Diff(diff(10, 11)), now);
        assert!(!s.awaiting_snapshot());
        assert!(!s.apply(&snapshot(4, vec![]), now).outcome.changed());
    }

    #[test]
    fn test_other_topic_ignored() {
        let mut s = at_v10();
        let mut d = diff(10, 11);
        d.topic = "session.4".into();
        assert_eq!(
            s.apply(&FeedMessage::Diff(d), Instant::now()).outcome,
            Outcome::Ignored(SkipReason::OtherTopic)
        );
        assert_eq!(s.version(), 10);
    }

    #[test]
    fn test_snapshot_timestamp_parsed() {
        let s = at_v10();
        let ts = s.last_update().unwrap();
        assert_eq!(ts.to_rfc3339(), "2025-06-01T12:00:00+00:00");
        assert_eq!(s.resume_version(), Some(10));
        assert_eq!(sync().resume_version(), None);
    }
}
