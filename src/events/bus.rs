//! The message bus.
//!
//! Enqueue is O(1) under a single mutex and may happen from any thread.
//! Dispatch is single-threaded: `process_messages` drains the queue in FIFO
//! order on the caller's thread. A handler may publish new messages; they are
//! deferred to the *next* drain pass, which keeps handler recursion bounded.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::Mutex;

use super::{EventMessage, MessageType};

/// Handle for unsubscribing.
pub type SubscriptionId = u32;

/// Handler callback. The return value is reserved for stop-propagation and
/// currently ignored.
pub type MessageHandler = Arc<dyn Fn(&dyn EventMessage) -> bool + Send + Sync>;

#[derive(Clone, Debug, Default)]
pub struct BusStats {
    pub total_published: u64,
    pub total_processed: u64,
    pub current_queue_size: u64,
    pub published_by_type: FxHashMap<MessageType, u64>,
}

struct Subscription {
    id: SubscriptionId,
    /// `None` subscribes to every message.
    filter: Option<MessageType>,
    handler: MessageHandler,
}

/// Thread-safe publish/subscribe queue.
///
/// Queue, subscriptions and statistics are guarded by separate mutexes so a
/// publisher never contends with a subscriber registering a handler.
pub struct MessageBus {
    queue: Mutex<VecDeque<Box<dyn EventMessage>>>,
    subscriptions: Mutex<Vec<Subscription>>,
    next_subscription_id: AtomicU32,
    stats: Mutex<BusStats>,
    logging_enabled: AtomicBool,
}

impl Default for MessageBus {
    fn default() -> Self {
        MessageBus::new()
    }
}

impl MessageBus {
    pub fn new() -> MessageBus {
        MessageBus {
            queue: Mutex::new(VecDeque::new()),
            subscriptions: Mutex::new(Vec::new()),
            next_subscription_id: AtomicU32::new(1),
            stats: Mutex::new(BusStats::default()),
            logging_enabled: AtomicBool::new(false),
        }
    }

    //---------------------------------------------------------------------
    // Subscription management

    /// Subscribe to a specific message type.
    pub fn subscribe(
        &self,
        message_type: MessageType,
        handler: impl Fn(&dyn EventMessage) -> bool + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.add_subscription(Some(message_type), Arc::new(handler))
    }

    /// Subscribe to every message type.
    pub fn subscribe_all(
        &self,
        handler: impl Fn(&dyn EventMessage) -> bool + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.add_subscription(None, Arc::new(handler))
    }

    fn add_subscription(
        &self,
        filter: Option<MessageType>,
        handler: MessageHandler,
    ) -> SubscriptionId {
        let id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        self.subscriptions.lock().push(Subscription {
            id,
            filter,
            handler,
        });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscriptions.lock().retain(|s| s.id != id);
    }

    pub fn unsubscribe_all(&self) {
        self.subscriptions.lock().clear();
    }

    //---------------------------------------------------------------------
    // Publishing

    /// Enqueue a message for the next `process_messages` pass. Thread-safe.
    pub fn publish(&self, message: impl EventMessage + 'static) {
        self.publish_boxed(Box::new(message));
    }

    pub fn publish_boxed(&self, message: Box<dyn EventMessage>) {
        {
            let mut stats = self.stats.lock();
            stats.total_published += 1;
            *stats
                .published_by_type
                .entry(message.message_type())
                .or_insert(0) += 1;
        }
        let mut queue = self.queue.lock();
        queue.push_back(message);
        self.stats.lock().current_queue_size = queue.len() as u64;
    }

    /// Synchronous dispatch on the caller's thread, bypassing the queue.
    /// Reserved for latency-critical paths (input, before-frame hooks).
    pub fn publish_immediate(&self, message: &dyn EventMessage) {
        {
            let mut stats = self.stats.lock();
            stats.total_published += 1;
            stats.total_processed += 1;
            *stats
                .published_by_type
                .entry(message.message_type())
                .or_insert(0) += 1;
        }
        self.dispatch(message);
    }

    //---------------------------------------------------------------------
    // Processing

    /// Drain the queue in FIFO order and dispatch each message to all
    /// matching subscribers. Messages published by handlers during the drain
    /// land in the queue for the next call.
    pub fn process_messages(&self) {
        let batch: Vec<Box<dyn EventMessage>> = {
            let mut queue = self.queue.lock();
            queue.drain(..).collect()
        };
        if batch.is_empty() {
            return;
        }

        for message in &batch {
            if self.logging_enabled.load(Ordering::Relaxed) {
                log::debug!(
                    "bus: dispatching type {} from sender {}",
                    message.message_type(),
                    message.sender()
                );
            }
            self.dispatch(message.as_ref());
        }

        // Queue length read before taking the stats lock; publishers lock
        // queue then stats, and the same order avoids an inversion here.
        let remaining = self.queue.lock().len() as u64;
        let mut stats = self.stats.lock();
        stats.total_processed += batch.len() as u64;
        stats.current_queue_size = remaining;
    }

    fn dispatch(&self, message: &dyn EventMessage) {
        // Snapshot matching handlers so a handler can subscribe/unsubscribe
        // without deadlocking against the subscription lock.
        let handlers: Vec<MessageHandler> = {
            let subs = self.subscriptions.lock();
            subs.iter()
                .filter(|s| s.filter.map_or(true, |t| t == message.message_type()))
                .map(|s| Arc::clone(&s.handler))
                .collect()
        };

        for handler in handlers {
            let result = catch_unwind(AssertUnwindSafe(|| handler(message)));
            if let Err(payload) = result {
                log::error!(
                    "bus: handler panicked on message type {}: {}",
                    message.message_type(),
                    panic_message(&payload)
                );
            }
        }
    }

    //---------------------------------------------------------------------
    // Queue introspection

    /// Drop all queued messages without dispatching them.
    pub fn clear_queue(&self) {
        self.queue.lock().clear();
        self.stats.lock().current_queue_size = 0;
    }

    pub fn queued_count(&self) -> usize {
        self.queue.lock().len()
    }

    //---------------------------------------------------------------------
    // Statistics

    pub fn stats(&self) -> BusStats {
        self.stats.lock().clone()
    }

    pub fn reset_stats(&self) {
        *self.stats.lock() = BusStats::default();
    }

    pub fn set_logging_enabled(&self, enabled: bool) {
        self.logging_enabled.store(enabled, Ordering::Relaxed);
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown panic")
    }
}

//--------------------------------------------------------------------------------------------------
