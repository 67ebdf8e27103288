//! Persistent socket connection with topic multiplexing.
//!
//! Provides:
//! - Connection lifecycle (ensure, reconnect, stop) with jittered backoff
//! - Outbound queue for messages sent while the socket is down
//! - Wanted-subscription bookkeeping replayed on every open, counted per
//!   holder so independent consumers can share a topic
//! - Fan-out of decoded inbound messages to registered handlers
//!
//! Architecture:
//! ```text
//! ConnectionHandle ──(Command)──┐
//! ConnectionHandle ──(Command)──┤
//!                               ▼
//!                        Driver task ── ConnectionCore (state, queue, wanted, token)
//!                          │    │
//!                 socket ◄─┘    └─► HandlerRegistry ─► handler, handler, …
//! ```
//!
//! All socket events, timers and commands of one connection are processed
//! sequentially by the driver task. The queue and the wanted set live in the
//! driver, so no lock guards them.

use std::collections::{BTreeMap, VecDeque};
use std::future::{pending, Future};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::broadcast::{AtomicConnectionStats, ConnectionStats, HandlerRegistration, HandlerRegistry};
use crate::config::ClientConfig;
use crate::error::TransportError;
use crate::protocol::{self, ClientMessage, Inbound, Outbound, ServerMessage};
use crate::scheduler::{BackoffPolicy, ReconnectTimer};

/// Connection state. Exactly one holds at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected, or stopped
    Idle,
    /// Connect attempt in flight
    Connecting,
    /// Socket open, wanted topics subscribed
    Open,
    /// Socket closed, reconnect timer armed
    ClosedPendingRetry,
}

// ───────────────────────────────────────────────────────────────────
// Outbound queue
// ───────────────────────────────────────────────────────────────────

/// FIFO of messages sent while the socket was down.
///
/// Replayed in order on the next open.
#[derive(Debug)]
pub struct OutboundQueue {
    queue: VecDeque<Outbound>,
    max_size: usize,
}

impl OutboundQueue {
    /// Create a queue holding at most `max_size` caller messages.
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Append a message. Returns false when the queue is full.
    pub fn enqueue(&mut self, msg: Outbound) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(msg);
        true
    }

    /// Put messages back at the head, keeping their order.
    ///
    /// Only durable messages are kept. Capacity is not enforced: these were
    /// already accepted once.
    pub fn requeue_front(&mut self, msgs: Vec<Outbound>) {
        for msg in msgs.into_iter().rev().filter(|m| m.durable) {
            self.queue.push_front(msg);
        }
    }

    /// Take every queued message in FIFO order.
    pub fn drain(&mut self) -> Vec<Outbound> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

// ───────────────────────────────────────────────────────────────────
// Core state machine
// ───────────────────────────────────────────────────────────────────

/// What to do with a caller message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendDecision {
    /// Socket is open: write it now.
    Transmit(Outbound),
    /// Held until the next open.
    Queued,
    /// Queue full; the message was discarded.
    Dropped,
}

/// One wanted topic: how many holders want it and where to resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Wanted {
    holders: usize,
    last_version: Option<u64>,
}

/// Socket-free connection bookkeeping.
///
/// The driver feeds it lifecycle events and caller commands; it answers with
/// the messages to write.
#[derive(Debug)]
pub struct ConnectionCore {
    state: ConnectionState,
    attempt: u32,
    queue: OutboundQueue,
    wanted: BTreeMap<String, Wanted>,
    token: Option<String>,
    backoff: BackoffPolicy,
}

impl ConnectionCore {
    pub fn new(backoff: BackoffPolicy, queue_capacity: usize) -> Self {
        Self {
            state: ConnectionState::Idle,
            attempt: 0,
            queue: OutboundQueue::new(queue_capacity),
            wanted: BTreeMap::new(),
            token: None,
            backoff,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Failed cycles since the last successful open.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Resume version wanted for `topic`, if subscribed.
    pub fn wanted(&self, topic: &str) -> Option<Option<u64>> {
        self.wanted.get(topic).map(|w| w.last_version)
    }

    /// Number of holders of `topic`; 0 when not wanted.
    pub fn holders(&self, topic: &str) -> usize {
        self.wanted.get(topic).map_or(0, |w| w.holders)
    }

    pub fn wanted_topics(&self) -> impl Iterator<Item = &str> {
        self.wanted.keys().map(String::as_str)
    }

    fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// Move to `Connecting`. False if an attempt is already in flight or open.
    pub fn begin_connect(&mut self) -> bool {
        match self.state {
            ConnectionState::Idle | ConnectionState::ClosedPendingRetry => {
                self.state = ConnectionState::Connecting;
                true
            }
            ConnectionState::Connecting | ConnectionState::Open => false,
        }
    }

    /// Socket opened. Returns the replay batch:
    /// auth, then queued messages in order, then one subscribe per wanted topic.
    pub fn on_open(&mut self) -> Vec<Outbound> {
        self.state = ConnectionState::Open;
        self.attempt = 0;

        let mut batch = Vec::with_capacity(1 + self.queue.len() + self.wanted.len());
        if let Some(token) = &self.token {
            batch.push(Outbound::control(ClientMessage::Auth {
                token: token.clone(),
            }));
        }
        batch.extend(self.queue.drain());
        batch.extend(self.wanted.iter().map(|(topic, wanted)| {
            Outbound::control(ClientMessage::Subscribe {
                topic: topic.clone(),
                last_version: wanted.last_version,
            })
        }));
        batch
    }

    /// Socket closed or connect failed. Returns the delay before the next attempt.
    pub fn on_closed<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        self.state = ConnectionState::ClosedPendingRetry;
        let delay = self.backoff.delay(self.attempt, rng);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Drop the link without scheduling a retry (manual reconnect, stop).
    pub fn reset_link(&mut self) {
        self.state = ConnectionState::Idle;
    }

    /// Add a holder of `topic`. Returns the subscribe to write if this is
    /// the first holder and the socket is open.
    ///
    /// A later holder shares the live subscription; its `last_version` only
    /// advances the resume version.
    pub fn subscribe(&mut self, topic: String, last_version: Option<u64>) -> Option<Outbound> {
        if let Some(wanted) = self.wanted.get_mut(&topic) {
            wanted.holders += 1;
            if let Some(version) = last_version {
                self.set_resume_version(&topic, version);
            }
            return None;
        }
        self.wanted.insert(
            topic.clone(),
            Wanted {
                holders: 1,
                last_version,
            },
        );
        self.is_open().then(|| {
            Outbound::control(ClientMessage::Subscribe {
                topic,
                last_version,
            })
        })
    }

    /// Release one holder of `topic`. Returns the unsubscribe to write if it
    /// was the last holder and the socket is open.
    pub fn unsubscribe(&mut self, topic: String) -> Option<Outbound> {
        let wanted = self.wanted.get_mut(&topic)?;
        if wanted.holders > 1 {
            wanted.holders -= 1;
            return None;
        }
        self.wanted.remove(&topic);
        self.is_open()
            .then(|| Outbound::control(ClientMessage::Unsubscribe { topic }))
    }

    /// Ask for a fresh snapshot of a wanted topic: forget the resume version
    /// and, if open, unsubscribe and subscribe again. Holders are unchanged.
    pub fn resubscribe(&mut self, topic: String) -> Vec<Outbound> {
        let Some(wanted) = self.wanted.get_mut(&topic) else {
            return Vec::new();
        };
        wanted.last_version = None;
        if !self.is_open() {
            return Vec::new();
        }
        vec![
            Outbound::control(ClientMessage::Unsubscribe {
                topic: topic.clone(),
            }),
            Outbound::control(ClientMessage::Subscribe {
                topic,
                last_version: None,
            }),
        ]
    }

    /// Advance the resume version of a wanted topic. Never moves backwards.
    pub fn set_resume_version(&mut self, topic: &str, version: u64) {
        if let Some(wanted) = self.wanted.get_mut(topic) {
            if wanted.last_version.map_or(true, |v| version > v) {
                wanted.last_version = Some(version);
            }
        }
    }

    /// Remember the bearer token. Returns the auth message to write if open.
    pub fn authenticate(&mut self, token: String) -> Option<Outbound> {
        self.token = Some(token.clone());
        self.is_open()
            .then(|| Outbound::control(ClientMessage::Auth { token }))
    }

    pub fn clear_token(&mut self) {
        self.token = None;
    }

    /// Route a caller message.
    pub fn send(&mut self, msg: Outbound) -> SendDecision {
        if self.is_open() {
            SendDecision::Transmit(msg)
        } else if self.queue.enqueue(msg) {
            SendDecision::Queued
        } else {
            SendDecision::Dropped
        }
    }

    /// Put unsent durable messages back at the head of the queue.
    pub fn requeue_front(&mut self, msgs: Vec<Outbound>) {
        self.queue.requeue_front(msgs);
    }
}

// ───────────────────────────────────────────────────────────────────
// Handle
// ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum Command {
    Ensure,
    Reconnect,
    Subscribe {
        topic: String,
        last_version: Option<u64>,
    },
    Unsubscribe {
        topic: String,
    },
    Resubscribe {
        topic: String,
    },
    SetResumeVersion {
        topic: String,
        version: u64,
    },
    Send(Outbound),
    Authenticate(String),
    ClearToken,
    Shutdown,
}

/// Cheap, cloneable front end of a [`ConnectionManager`].
///
/// Every method is non-blocking: it posts a command to the driver task.
/// Commands posted before `start()` are processed once the driver runs.
#[derive(Clone)]
pub struct ConnectionHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    registry: Arc<HandlerRegistry>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl ConnectionHandle {
    fn command(&self, cmd: Command) {
        if self.cmd_tx.send(cmd).is_err() {
            log::debug!("connection driver stopped; command dropped");
        }
    }

    /// Make sure a connection attempt is in flight or open.
    ///
    /// Keeps an already scheduled retry instead of bypassing the backoff.
    pub fn ensure(&self) {
        self.command(Command::Ensure);
    }

    /// Cancel any scheduled retry, drop the socket and connect immediately.
    pub fn reconnect(&self) {
        self.command(Command::Reconnect);
    }

    /// Add a holder of `topic`, resuming after `last_version` if given.
    ///
    /// Only the first holder subscribes on the wire; every call must be
    /// paired with one [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe(&self, topic: impl Into<String>, last_version: Option<u64>) {
        self.command(Command::Subscribe {
            topic: topic.into(),
            last_version,
        });
    }

    /// Release one holder of `topic`. The last one unsubscribes on the wire.
    pub fn unsubscribe(&self, topic: impl Into<String>) {
        self.command(Command::Unsubscribe {
            topic: topic.into(),
        });
    }

    /// Drop the resume version of a wanted topic and subscribe again so the
    /// server sends a fresh snapshot.
    pub fn resubscribe(&self, topic: impl Into<String>) {
        self.command(Command::Resubscribe {
            topic: topic.into(),
        });
    }

    /// Advance the version a later resubscribe resumes from.
    pub fn set_resume_version(&self, topic: impl Into<String>, version: u64) {
        self.command(Command::SetResumeVersion {
            topic: topic.into(),
            version,
        });
    }

    /// Send now if open, otherwise queue and connect.
    pub fn send(&self, message: ClientMessage) {
        self.command(Command::Send(Outbound::new(message)));
    }

    /// Like [`send`](Self::send), tagging the message with a fresh request id.
    ///
    /// Returns the id to correlate with `ack` / `error` replies.
    pub fn send_tracked(&self, message: ClientMessage) -> String {
        let out = Outbound::new(message).with_request_id();
        let id = out.request_id.clone().unwrap_or_default();
        self.command(Command::Send(out));
        id
    }

    /// Authenticate now if open; re-sent on every reconnect.
    pub fn authenticate(&self, token: impl Into<String>) {
        self.command(Command::Authenticate(token.into()));
    }

    /// Stop re-sending a token on reconnect.
    pub fn clear_token(&self) {
        self.command(Command::ClearToken);
    }

    /// Register a callback for every inbound message.
    ///
    /// The callback stays registered until the returned registration is
    /// dropped or unsubscribed. Other handlers are unaffected by either.
    pub fn add_message_handler<F>(&self, handler: F) -> HandlerRegistration
    where
        F: Fn(&ServerMessage) + Send + Sync + 'static,
    {
        self.registry.register(Arc::new(handler))
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Receiver notified on every state transition.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.registry.stats()
    }
}

// ───────────────────────────────────────────────────────────────────
// Manager
// ───────────────────────────────────────────────────────────────────

struct DriverParts {
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
}

/// Owner of one persistent connection.
///
/// Constructed explicitly; `start()` spawns the driver task and `stop()`
/// closes the socket and joins it. A stopped manager cannot be restarted.
pub struct ConnectionManager {
    handle: ConnectionHandle,
    parts: Mutex<Option<DriverParts>>,
    task: Mutex<Option<JoinHandle<()>>>,
    config: ClientConfig,
}

impl ConnectionManager {
    pub fn new(config: ClientConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        Self {
            handle: ConnectionHandle {
                cmd_tx,
                registry: Arc::new(HandlerRegistry::new()),
                state_rx,
            },
            parts: Mutex::new(Some(DriverParts { cmd_rx, state_tx })),
            task: Mutex::new(None),
            config,
        }
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Spawn the driver task. Must be called within a tokio runtime.
    ///
    /// Returns false if already started or stopped.
    pub fn start(&self) -> bool {
        let parts = self.parts.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(parts) = parts else {
            return false;
        };
        let driver = Driver::new(&self.config, parts, Arc::clone(&self.handle.registry));
        let task = tokio::spawn(driver.run());
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        true
    }

    /// Close the socket, cancel timers and wait for the driver to exit.
    pub async fn stop(&self) {
        // Never started: make sure it can't be started later either.
        self.parts.lock().unwrap_or_else(|e| e.into_inner()).take();

        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            self.handle.command(Command::Shutdown);
            if let Err(e) = task.await {
                log::error!("connection driver exited abnormally: {e}");
            }
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Driver
// ───────────────────────────────────────────────────────────────────

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ConnectFuture = Pin<Box<dyn Future<Output = Result<WsStream, TransportError>> + Send>>;

enum Link {
    Down,
    Connecting(ConnectFuture),
    Open(WsStream),
}

enum LinkEvent {
    Connected(WsStream),
    ConnectFailed(TransportError),
    Frame(Message),
    Closed(Option<TransportError>),
}

impl Link {
    /// Next event from the link. Pending forever while down.
    ///
    /// Cancel-safe: the connect future and the stream live in `self`.
    async fn next(&mut self) -> LinkEvent {
        match self {
            Link::Down => pending().await,
            Link::Connecting(fut) => match fut.await {
                Ok(ws) => LinkEvent::Connected(ws),
                Err(e) => LinkEvent::ConnectFailed(e),
            },
            Link::Open(ws) => match ws.next().await {
                Some(Ok(msg)) => LinkEvent::Frame(msg),
                Some(Err(e)) => LinkEvent::Closed(Some(e.into())),
                None => LinkEvent::Closed(None),
            },
        }
    }
}

struct Driver {
    url: String,
    connect_timeout: Duration,
    core: ConnectionCore,
    link: Link,
    timer: ReconnectTimer,
    heartbeat: Interval,
    heartbeat_period: Duration,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    registry: Arc<HandlerRegistry>,
    rng: StdRng,
    opened_before: bool,
}

impl Driver {
    fn new(config: &ClientConfig, parts: DriverParts, registry: Arc<HandlerRegistry>) -> Self {
        let period = config.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            url: config.ws_url(),
            connect_timeout: config.connect_timeout,
            core: ConnectionCore::new(config.backoff.clone(), config.queue_capacity),
            link: Link::Down,
            timer: ReconnectTimer::new(),
            heartbeat,
            heartbeat_period: period,
            cmd_rx: parts.cmd_rx,
            state_tx: parts.state_tx,
            registry,
            rng: StdRng::from_entropy(),
            opened_before: false,
        }
    }

    async fn run(mut self) {
        log::debug!("connection driver started for {}", self.url);
        loop {
            let open = self.core.state() == ConnectionState::Open;
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd).await,
                },
                event = self.link.next() => self.handle_link_event(event).await,
                token = self.timer.wait() => {
                    if self.timer.fire(token) {
                        self.connect_now();
                    }
                }
                _ = self.heartbeat.tick(), if open => {
                    self.transmit(vec![Outbound::control(ClientMessage::Ping)]).await;
                }
            }
        }

        self.timer.cancel();
        self.close_link().await;
        self.core.reset_link();
        self.publish();
        log::info!("connection to {} stopped", self.url);
    }

    fn publish(&self) {
        let state = self.core.state();
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Ensure => self.ensure(),
            Command::Reconnect => {
                self.timer.cancel();
                self.close_link().await;
                self.core.reset_link();
                self.connect_now();
            }
            Command::Subscribe {
                topic,
                last_version,
            } => match self.core.subscribe(topic, last_version) {
                Some(out) => self.transmit(vec![out]).await,
                None => self.ensure(),
            },
            Command::Unsubscribe { topic } => {
                if let Some(out) = self.core.unsubscribe(topic) {
                    self.transmit(vec![out]).await;
                }
            }
            Command::Resubscribe { topic } => {
                let batch = self.core.resubscribe(topic);
                if batch.is_empty() {
                    self.ensure();
                } else {
                    self.transmit(batch).await;
                }
            }
            Command::SetResumeVersion { topic, version } => {
                self.core.set_resume_version(&topic, version);
            }
            Command::Send(out) => match self.core.send(out) {
                SendDecision::Transmit(out) => self.transmit(vec![out]).await,
                SendDecision::Queued => self.ensure(),
                SendDecision::Dropped => {
                    AtomicConnectionStats::bump(&self.registry.stats.messages_dropped);
                    log::warn!("outbound queue full; message dropped");
                    self.ensure();
                }
            },
            Command::Authenticate(token) => {
                if let Some(out) = self.core.authenticate(token) {
                    self.transmit(vec![out]).await;
                }
            }
            Command::ClearToken => self.core.clear_token(),
            Command::Shutdown => {}
        }
    }

    fn ensure(&mut self) {
        match self.core.state() {
            ConnectionState::Idle => self.connect_now(),
            ConnectionState::ClosedPendingRetry if !self.timer.is_armed() => self.connect_now(),
            _ => {}
        }
    }

    fn connect_now(&mut self) {
        if !self.core.begin_connect() {
            return;
        }
        self.timer.cancel();
        self.publish();

        let url = self.url.clone();
        let timeout = self.connect_timeout;
        log::info!("connecting to {url}");
        self.link = Link::Connecting(Box::pin(async move {
            match tokio::time::timeout(timeout, connect_async(url)).await {
                Ok(Ok((ws, _response))) => Ok(ws),
                Ok(Err(e)) => Err(TransportError::WebSocket(e)),
                Err(_) => Err(TransportError::Timeout(timeout)),
            }
        }));
    }

    async fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Connected(ws) => {
                self.link = Link::Open(ws);
                let replay = self.core.on_open();
                if self.opened_before {
                    AtomicConnectionStats::bump(&self.registry.stats.reconnects);
                }
                self.opened_before = true;
                self.heartbeat.reset_after(self.heartbeat_period);
                self.publish();
                log::info!("connected to {} ({} messages to replay)", self.url, replay.len());
                self.transmit(replay).await;
            }
            LinkEvent::ConnectFailed(e) => {
                log::warn!("connect to {} failed: {e}", self.url);
                self.link = Link::Down;
                self.schedule_retry();
            }
            LinkEvent::Frame(msg) => match msg {
                Message::Text(text) => self.deliver(protocol::decode(text.as_str())),
                Message::Binary(bytes) => self.deliver(protocol::decode_bytes(&bytes)),
                Message::Close(frame) => {
                    log::info!("server closed connection: {frame:?}");
                    self.link = Link::Down;
                    self.schedule_retry();
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            },
            LinkEvent::Closed(err) => {
                match err {
                    Some(e) => log::warn!("connection lost: {e}"),
                    None => log::info!("connection closed"),
                }
                self.link = Link::Down;
                self.schedule_retry();
            }
        }
    }

    fn deliver(&self, inbound: Inbound) {
        match inbound {
            Inbound::Message(msg) => {
                self.registry.dispatch(&msg);
            }
            Inbound::Ignored(reason) => {
                AtomicConnectionStats::bump(&self.registry.stats.frames_ignored);
                log::debug!("ignored inbound frame: {reason}");
            }
        }
    }

    fn schedule_retry(&mut self) {
        let delay = self.core.on_closed(&mut self.rng);
        self.timer.schedule(delay);
        self.publish();
        log::info!(
            "reconnecting in {:?} (attempt {})",
            delay,
            self.core.attempt()
        );
    }

    /// Write `batch` in order. On failure the unsent durable messages go back
    /// to the head of the queue and the link is torn down.
    async fn transmit(&mut self, batch: Vec<Outbound>) {
        let Link::Open(ws) = &mut self.link else {
            self.core.requeue_front(batch);
            return;
        };

        let mut failed = None;
        let mut rest = batch.into_iter();
        while let Some(out) = rest.next() {
            let frame = match out.encode() {
                Ok(frame) => frame,
                Err(e) => {
                    log::warn!("dropping unencodable {} message: {e}", out.message.kind());
                    continue;
                }
            };
            match ws.send(Message::Text(frame.into())).await {
                Ok(()) => AtomicConnectionStats::bump(&self.registry.stats.messages_sent),
                Err(e) => {
                    failed = Some((e, out));
                    break;
                }
            }
        }

        if let Some((e, out)) = failed {
            log::warn!("send failed: {e}");
            let mut unsent = vec![out];
            unsent.extend(rest);
            self.core.requeue_front(unsent);
            self.link = Link::Down;
            self.schedule_retry();
        }
    }

    async fn close_link(&mut self) {
        if let Link::Open(ws) = &mut self.link {
            if let Err(e) = ws.close(None).await {
                log::debug!("close handshake failed: {e}");
            }
        }
        self.link = Link::Down;
    }
}
