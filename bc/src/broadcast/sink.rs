//! Listener sinks - where the coordinator delivers broadcast items

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use super::error::SinkError;

/// Destination for broadcast items of one listener
///
/// The coordinator owns the sink from registration until retirement. It calls
/// `deliver` once per item, in broadcast order, and never concurrently. When
/// the listener retires, `close` is called exactly once and the sink is then
/// dropped.
#[async_trait]
pub trait Sink<T>: Send + 'static {
    /// Hand one item to the consumer, waiting as long as the consumer needs
    async fn deliver(&mut self, item: T) -> Result<(), SinkError>;

    /// Finalize the sink so the consumer can observe completion
    fn close(&mut self) {}
}

/// Bounded mpsc sender as a sink
///
/// Closing happens when the coordinator drops its sender. If the caller keeps
/// its own clone of the sender, the receiver will not observe completion.
#[async_trait]
impl<T: Send + 'static> Sink<T> for mpsc::Sender<T> {
    async fn deliver(&mut self, item: T) -> Result<(), SinkError> {
        debug!("mpsc::Sender::deliver: called");
        self.send(item).await.map_err(|_| SinkError::Closed)
    }
}

#[async_trait]
impl<T: Send + 'static> Sink<T> for mpsc::UnboundedSender<T> {
    async fn deliver(&mut self, item: T) -> Result<(), SinkError> {
        debug!("mpsc::UnboundedSender::deliver: called");
        self.send(item).map_err(|_| SinkError::Closed)
    }
}

/// Sink that invokes a callback for every item
///
/// An optional `on_close` callback runs once at retirement.
pub struct CallbackSink<F> {
    callback: F,
    on_close: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl<F> CallbackSink<F> {
    /// Create a sink around `callback`
    pub fn new(callback: F) -> Self {
        Self {
            callback,
            on_close: None,
        }
    }

    /// Run `on_close` when the listener is retired
    pub fn on_close(mut self, on_close: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(on_close));
        self
    }
}

#[async_trait]
impl<T, F> Sink<T> for CallbackSink<F>
where
    T: Send + 'static,
    F: FnMut(T) + Send + 'static,
{
    async fn deliver(&mut self, item: T) -> Result<(), SinkError> {
        debug!("CallbackSink::deliver: called");
        (self.callback)(item);
        Ok(())
    }

    fn close(&mut self) {
        debug!("CallbackSink::close: called");
        if let Some(on_close) = self.on_close.take() {
            on_close();
        }
    }
}

// A registration that never reached the coordinator is dropped without close().
impl<F> Drop for CallbackSink<F> {
    fn drop(&mut self) {
        if let Some(on_close) = self.on_close.take() {
            on_close();
        }
    }
}
