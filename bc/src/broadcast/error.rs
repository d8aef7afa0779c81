//! Error types for the broadcaster

use thiserror::Error;

/// Errors from broadcaster operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BroadcastError {
    /// The broadcaster was stopped before the request was accepted
    #[error("Broadcaster stopped")]
    Stopped,

    /// The coordinator dropped the reply channel before answering
    #[error("Channel error")]
    ChannelError,
}

/// Errors a sink can report while accepting an item
///
/// Any error retires the listener: the coordinator treats a failing sink as
/// one whose consumer has gone away.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("Sink closed")]
    Closed,

    #[error("Sink rejected item: {0}")]
    Rejected(String),
}

/// Response from broadcaster operations
pub type BroadcastResult<T> = Result<T, BroadcastError>;
