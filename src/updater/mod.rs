//! # Entity Updater
//!
//! One updater owns the index synchronization of exactly one entity. The
//! decision logic is the pure state machine in [`fsm`]; [`actor`] runs it as
//! a tokio task with a bounded mailbox, timers and the single in-flight
//! persistence.

pub mod actor;
pub mod fsm;

pub use actor::{EntityUpdater, UpdaterContext, UpdaterExit};
pub use fsm::{Effect, EntityFsm, Event, FsmSettings, State, StopReason, TimerKind};

use crate::model::{AckRecipient, AckRequest, Metadata};

/// A change observed for one entity.
#[derive(Debug, Clone)]
pub struct ChangeNotification {
    pub metadata: Metadata,
    /// Skip the coalescing window and flush as soon as possible.
    pub flush_now: bool,
}

impl ChangeNotification {
    pub fn new(metadata: Metadata) -> Self {
        Self {
            metadata,
            flush_now: false,
        }
    }

    /// Ask to be acknowledged once this revision is indexed. Implies an
    /// immediate flush.
    pub fn with_ack(mut self, recipient: AckRecipient) -> Self {
        let request = AckRequest::new(self.metadata.revision, recipient);
        self.metadata.acks.push(request);
        self.flush_now = true;
        self
    }
}

/// Messages accepted by an entity updater's mailbox.
#[derive(Debug, Clone)]
pub enum Command {
    /// A live change notification.
    Notify(ChangeNotification),
    /// Replace the metadata and force a full tombstone-then-rebuild cycle.
    Resync(Metadata),
    /// Stop once no write is in flight.
    Shutdown,
}

impl Command {
    pub fn entity_id(&self) -> Option<&crate::model::EntityId> {
        match self {
            Command::Notify(notification) => Some(&notification.metadata.entity_id),
            Command::Resync(metadata) => Some(&metadata.entity_id),
            Command::Shutdown => None,
        }
    }
}
