//! Fan-out of inbound messages to registered handlers.
//!
//! Every decoded message is delivered to every handler, in registration
//! order. Handlers may be added or removed at any time, including from inside
//! a handler: dispatch iterates over a snapshot taken before the first call.
//!
//! Stats are kept in atomics so the driver never locks to count.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use crate::protocol::ServerMessage;

/// Callback invoked for each inbound message.
pub type MessageHandler = Arc<dyn Fn(&ServerMessage) + Send + Sync>;

/// Registration handle returned by [`HandlerRegistry::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Keeps a handler registered. Dropping it unregisters the handler.
#[must_use = "the handler is removed as soon as the registration is dropped"]
#[derive(Debug)]
pub struct HandlerRegistration {
    registry: Weak<HandlerRegistry>,
    id: HandlerId,
}

impl HandlerRegistration {
    pub fn id(&self) -> HandlerId {
        self.id
    }

    /// Unregister now. Returns false if the handler was already gone.
    pub fn unsubscribe(self) -> bool {
        self.release()
    }

    fn release(&self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|registry| registry.remove(self.id))
    }
}

impl Drop for HandlerRegistration {
    fn drop(&mut self) {
        self.release();
    }
}

/// Connection statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Messages decoded and dispatched
    pub messages_received: u64,
    /// Frames dropped as malformed or unknown
    pub frames_ignored: u64,
    /// Messages written to the socket
    pub messages_sent: u64,
    /// Messages rejected because the outbound queue was full
    pub messages_dropped: u64,
    /// Successful opens after the first
    pub reconnects: u64,
    /// Handler invocations that panicked
    pub handler_panics: u64,
    /// Handlers currently registered
    pub active_handlers: usize,
}

#[derive(Default)]
pub(crate) struct AtomicConnectionStats {
    pub(crate) messages_received: AtomicU64,
    pub(crate) frames_ignored: AtomicU64,
    pub(crate) messages_sent: AtomicU64,
    pub(crate) messages_dropped: AtomicU64,
    pub(crate) reconnects: AtomicU64,
    pub(crate) handler_panics: AtomicU64,
}

impl AtomicConnectionStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// The set of message handlers for one connection.
#[derive(Default)]
pub struct HandlerRegistry {
    next_id: AtomicU64,
    handlers: RwLock<Vec<(HandlerId, MessageHandler)>>,
    pub(crate) stats: AtomicConnectionStats,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler.
    pub fn add(&self, handler: MessageHandler) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.push((id, handler));
        id
    }

    /// Register a handler that stays until the returned registration drops.
    pub fn register(self: &Arc<Self>, handler: MessageHandler) -> HandlerRegistration {
        HandlerRegistration {
            registry: Arc::downgrade(self),
            id: self.add(handler),
        }
    }

    /// Remove a handler. Returns false if it was not registered.
    pub fn remove(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        let before = handlers.len();
        handlers.retain(|(h, _)| *h != id);
        handlers.len() != before
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `msg` to every handler registered at the time of the call.
    ///
    /// A panicking handler is logged and skipped; the rest still run.
    /// Returns the number of handlers invoked.
    pub fn dispatch(&self, msg: &ServerMessage) -> usize {
        let snapshot: Vec<MessageHandler> = {
            let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            handlers.iter().map(|(_, h)| Arc::clone(h)).collect()
        };
        AtomicConnectionStats::bump(&self.stats.messages_received);

        for handler in &snapshot {
            if catch_unwind(AssertUnwindSafe(|| handler(msg))).is_err() {
                AtomicConnectionStats::bump(&self.stats.handler_panics);
                log::error!("message handler panicked; continuing with remaining handlers");
            }
        }
        snapshot.len()
    }

    /// Lock-free statistics snapshot (handler count takes a read lock).
    pub fn stats(&self) -> ConnectionStats {
        let s = &self.stats;
        ConnectionStats {
            messages_received: s.messages_received.load(Ordering::Relaxed),
            frames_ignored: s.frames_ignored.load(Ordering::Relaxed),
            messages_sent: s.messages_sent.load(Ordering::Relaxed),
            messages_dropped: s.messages_dropped.load(Ordering::Relaxed),
            reconnects: s.reconnects.load(Ordering::Relaxed),
            handler_panics: s.handler_panics.load(Ordering::Relaxed),
            active_handlers: self.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn pong() -> ServerMessage {
        ServerMessage::Pong { request_id: None }
    }

    #[test]
    fn test_dispatch_reaches_all_handlers() {
        let registry = HandlerRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let seen = Arc::clone(&seen);
            registry.add(Arc::new(move |_| seen.lock().unwrap().push(n)));
        }
        assert_eq!(registry.dispatch(&pong()), 3);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_remove_leaves_others() {
        let registry = HandlerRegistry::new();
        let count = Arc::new(AtomicU64::new(0));
        let c1 = Arc::clone(&count);
        let first = registry.add(Arc::new(move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
        }));
        let c2 = Arc::clone(&count);
        registry.add(Arc::new(move |_| {
            c2.fetch_add(10, Ordering::SeqCst);
        }));

        assert!(registry.remove(first));
        assert!(!registry.remove(first));
        registry.dispatch(&pong());
        assert_eq!(count.load(Ordering::SeqCst), 10);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_handler_may_unregister_itself() {
        let registry = Arc::new(HandlerRegistry::new());
        let slot: Arc<Mutex<Option<HandlerId>>> = Arc::new(Mutex::new(None));
        let reg = Arc::clone(&registry);
        let s = Arc::clone(&slot);
        let id = registry.add(Arc::new(move |_| {
            if let Some(id) = *s.lock().unwrap() {
                reg.remove(id);
            }
        }));
        *slot.lock().unwrap() = Some(id);

        assert_eq!(registry.dispatch(&pong()), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registration_removes_on_drop() {
        let registry = Arc::new(HandlerRegistry::new());
        let hits = Arc::new(AtomicU64::new(0));
        let h = Arc::clone(&hits);
        let kept = registry.register(Arc::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        let dropped = registry.register(Arc::new(|_| {}));
        assert_eq!(registry.len(), 2);

        drop(dropped);
        assert_eq!(registry.len(), 1);
        registry.dispatch(&pong());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let id = kept.id();
        assert!(kept.unsubscribe());
        assert!(!registry.remove(id));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registration_outliving_registry() {
        let registry = Arc::new(HandlerRegistry::new());
        let registration = registry.register(Arc::new(|_| {}));
        drop(registry);
        assert!(!registration.unsubscribe());
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let registry = HandlerRegistry::new();
        let hits = Arc::new(AtomicU64::new(0));
        registry.add(Arc::new(|_| panic!("boom")));
        let h = Arc::clone(&hits);
        registry.add(Arc::new(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        registry.dispatch(&pong());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let stats = registry.stats();
        assert_eq!(stats.handler_panics, 1);
        assert_eq!(stats.messages_received, 1);
        assert_eq!(stats.active_handlers, 2);
    }
}
