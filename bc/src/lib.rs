//! bcast - in-process N:M broadcaster
//!
//! A [`Broadcaster`] fans items out to a dynamic set of listeners. Every
//! listener sees items in the order they were sent; a listener registered
//! after an item was sent never sees it.
//!
//! # Example
//!
//! ```rust,no_run
//! use bcast::{BroadcastConfig, Broadcaster};
//!
//! # async fn example() {
//! let bc = Broadcaster::spawn(BroadcastConfig::default());
//! let mut listener = bc.listen().await;
//!
//! let consumer = tokio::spawn(async move {
//!     while let Some(word) = listener.recv().await {
//!         println!("{word}");
//!     }
//! });
//!
//! for word in ["this", "is", "a", "test"] {
//!     bc.send(word).await.unwrap();
//! }
//! bc.stop();
//! consumer.await.unwrap();
//! # }
//! ```
//!
//! # Modules
//!
//! - [`broadcast`] - the coordinator and its client handles
//! - [`config`] - configuration types and loading
//! - [`cli`] - command-line interface of the `bc` binary

pub mod broadcast;
pub mod cli;
pub mod config;

pub use broadcast::{
    BroadcastError, BroadcastMetrics, BroadcastResult, BroadcastSender, Broadcaster, CallbackSink, FanoutReport,
    Listener, ListenerId, Sink, SinkError, Unregister,
};
pub use config::{BroadcastConfig, Config};
