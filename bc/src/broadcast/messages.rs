//! Message types for the broadcast coordinator

use std::fmt;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::sink::Sink;

/// Identity of one registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(Uuid);

impl ListenerId {
    pub(crate) fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Internal requests to the coordinator task
pub(crate) enum BroadcastRequest<T> {
    /// Add a listener; acked once it is part of the active set
    Register {
        id: ListenerId,
        sink: Box<dyn Sink<T>>,
        cancel: CancellationToken,
        ack: oneshot::Sender<()>,
    },

    /// Fan an item out to every active listener
    Broadcast {
        item: T,
        reply_tx: oneshot::Sender<FanoutReport>,
    },

    /// Get current metrics
    GetMetrics {
        reply_tx: oneshot::Sender<BroadcastMetrics>,
    },
}

impl<T> fmt::Debug for BroadcastRequest<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Register { id, .. } => f.debug_struct("Register").field("id", id).finish_non_exhaustive(),
            Self::Broadcast { .. } => f.debug_struct("Broadcast").finish_non_exhaustive(),
            Self::GetMetrics { .. } => f.debug_struct("GetMetrics").finish_non_exhaustive(),
        }
    }
}

/// Outcome of a single fan-out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    /// Listeners that received the item
    pub delivered: usize,
    /// Listeners passed over for this item (cancelled or timed out)
    pub skipped: usize,
    /// Listeners removed during this fan-out
    pub retired: usize,
}

/// Coordinator metrics for observability
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastMetrics {
    pub active_listeners: usize,
    pub registrations: u64,
    pub retirements: u64,
    pub items_broadcast: u64,
    pub deliveries: u64,
    pub skips: u64,
    pub delivery_timeouts: u64,
    pub requests_received: u64,
}
