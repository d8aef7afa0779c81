//! Broadcast coordinator
//!
//! A single coordinator task owns the listener set. Every client operation
//! is a message into its queue, so registrations, removals, shutdown and
//! fan-out happen in one total order without locks:
//! - **register:** add a sink, acknowledged before returning
//! - **send:** deliver an item to every active listener, waiting for the fan-out
//! - **unregister:** cancel one listener and close its sink
//! - **stop:** end the coordinator and close every sink
//!
//! Each delivery races the listener's cancellation token, so a listener that
//! is leaving never stalls a broadcast.

mod core;
mod error;
mod handle;
mod messages;
mod sink;

pub use error::{BroadcastError, BroadcastResult, SinkError};
pub use handle::{BroadcastSender, Broadcaster, Listener, Unregister};
pub use messages::{BroadcastMetrics, FanoutReport, ListenerId};
pub use sink::{CallbackSink, Sink};
