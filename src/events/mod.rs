//! Typed publish/subscribe messaging.
//!
//! * `MessageBus` queues messages from any thread and dispatches them on the
//!   main thread during `process_messages`.
//! * `WorkerBridge` runs blocking work on a background thread and publishes
//!   the result back through the bus.
//! * Message type ids are partitioned: 0-99 core, 100-199 render graph,
//!   200-299 shader management. The assignments are stable across versions
//!   for drop-in interop with surrounding tooling.

use bitflags::bitflags;
use downcast_rs::{impl_downcast, Downcast};

mod bus;
mod messages;
mod worker;

pub use self::bus::{BusStats, MessageBus, MessageHandler, SubscriptionId};
pub use self::messages::*;
pub use self::worker::{WorkerBridge, WorkerResultMessage};

/// Identifies the message sender. Value 0 is reserved for "system".
pub type SenderId = u64;

/// Message type id used for filtered subscriptions.
pub type MessageType = u32;

/// Core message type ids (0-99).
pub mod core_types {
    use super::MessageType;

    pub const GENERIC: MessageType = 0;
    pub const WORKER_RESULT: MessageType = 1;
    pub const WINDOW_CLOSE_REQUESTED: MessageType = 10;
    pub const SHUTDOWN_ACK: MessageType = 11;
}

bitflags! {
    /// Coarse routing mask carried by every message. The bit assignments are
    /// stable and encoded as `u32` on the wire.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EventCategory: u32 {
        const APPLICATION_STATE     = 1 << 0;
        const RESOURCE_INVALIDATION = 1 << 1;
        const WINDOW_RESIZE         = 1 << 2;
        const SHADER_HOT_RELOAD     = 1 << 3;
        const CLEANUP_REQUEST       = 1 << 4;
        const GRAPH_MANAGEMENT      = 1 << 5;
    }
}

/// Base contract of everything that travels over the bus. Handlers receive
/// messages as `&dyn EventMessage` and downcast to the concrete type.
pub trait EventMessage: Downcast + Send + Sync {
    fn message_type(&self) -> MessageType;
    fn categories(&self) -> EventCategory;
    fn sender(&self) -> SenderId;
}

impl_downcast!(EventMessage);
