//! Client handles - the only way callers reach the coordinator

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::core::Coordinator;
use super::error::{BroadcastError, BroadcastResult};
use super::messages::{BroadcastMetrics, BroadcastRequest, FanoutReport, ListenerId};
use super::sink::Sink;
use crate::config::BroadcastConfig;

/// Queues into a running coordinator
struct Channels<T> {
    tx: mpsc::Sender<BroadcastRequest<T>>,
    remove_tx: mpsc::UnboundedSender<ListenerId>,
}

struct Shared<T> {
    config: BroadcastConfig,
    /// Fired by `stop`; parent of every listener's cancellation token
    done: CancellationToken,
    /// Fired by the coordinator once every sink is closed
    finished: CancellationToken,
    channels: OnceLock<Channels<T>>,
}

/// N:M broadcaster
///
/// Cloning is cheap; all clones share one coordinator. `new` and `Default`
/// defer spawning the coordinator until the first operation, `spawn` starts
/// it immediately. Either way the spawn happens through `tokio::spawn`, so
/// the first operation must run inside a tokio runtime.
///
/// Items are delivered to every listener in the order they were sent. There
/// is no ordering between listeners for the same item.
pub struct Broadcaster<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Broadcaster<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Broadcaster<T> {
    fn default() -> Self {
        Self::new(BroadcastConfig::default())
    }
}

impl<T: Clone + Send + 'static> Broadcaster<T> {
    /// Create a broadcaster whose coordinator starts on first use
    pub fn new(config: BroadcastConfig) -> Self {
        debug!(?config, "Broadcaster::new: called");
        Self {
            shared: Arc::new(Shared {
                config,
                done: CancellationToken::new(),
                finished: CancellationToken::new(),
                channels: OnceLock::new(),
            }),
        }
    }

    /// Create a broadcaster and start its coordinator now
    pub fn spawn(config: BroadcastConfig) -> Self {
        let broadcaster = Self::new(config);
        broadcaster.channels();
        broadcaster
    }

    /// Start the coordinator exactly once, however many callers race here
    fn channels(&self) -> &Channels<T> {
        self.shared.channels.get_or_init(|| {
            debug!("Broadcaster::channels: starting coordinator");
            let config = self.shared.config.clone();
            let (tx, rx) = mpsc::channel(config.inbox_buffer.max(1));
            let (remove_tx, remove_rx) = mpsc::unbounded_channel();
            let coordinator = Coordinator::new(
                config,
                rx,
                remove_rx,
                self.shared.done.clone(),
                self.shared.finished.clone(),
            );
            tokio::spawn(coordinator.run());
            Channels { tx, remove_tx }
        })
    }

    /// Register `sink` as a listener
    ///
    /// Returns once the coordinator has added the listener: every item sent
    /// after this returns is delivered to it, no item whose broadcast began
    /// earlier is. Waits behind any broadcast in progress.
    ///
    /// After `stop` this closes the sink and returns a handle that does
    /// nothing.
    pub async fn register(&self, sink: impl Sink<T>) -> Unregister {
        let id = ListenerId::new();
        debug!(listener_id = %id, "Broadcaster::register: called");
        let mut sink: Box<dyn Sink<T>> = Box::new(sink);

        let done = &self.shared.done;
        if done.is_cancelled() {
            debug!(listener_id = %id, "Broadcaster::register: already stopped");
            sink.close();
            return Unregister::noop(id);
        }

        let channels = self.channels();
        let cancel = done.child_token();
        let (ack, ack_rx) = oneshot::channel();
        let req = BroadcastRequest::Register {
            id,
            sink,
            cancel: cancel.clone(),
            ack,
        };

        let queued = tokio::select! {
            biased;
            _ = done.cancelled() => false,
            result = channels.tx.send(req) => match result {
                Ok(()) => true,
                Err(mpsc::error::SendError(req)) => {
                    if let BroadcastRequest::Register { mut sink, .. } = req {
                        sink.close();
                    }
                    false
                }
            },
        };

        // A queued request is either acked or dropped by the exiting coordinator
        if !queued || ack_rx.await.is_err() {
            debug!(listener_id = %id, "Broadcaster::register: stopped before registration");
            return Unregister::noop(id);
        }

        Unregister {
            id,
            registration: Some(Arc::new(Registration {
                fired: AtomicBool::new(false),
                cancel,
                remove_tx: channels.remove_tx.clone(),
            })),
        }
    }

    /// Register a fresh channel and return its receiving end
    ///
    /// The channel capacity is `listener_buffer` from the config.
    pub async fn listen(&self) -> Listener<T> {
        let (tx, rx) = mpsc::channel(self.shared.config.listener_buffer.max(1));
        let unregister = self.register(tx).await;
        debug!(listener_id = %unregister.id(), "Broadcaster::listen: registered");
        Listener { rx, unregister }
    }

    /// Endpoint that broadcasts everything pushed into it
    pub fn sender(&self) -> BroadcastSender<T> {
        BroadcastSender {
            tx: self.channels().tx.clone(),
            done: self.shared.done.clone(),
        }
    }

    /// Broadcast one item; see [`BroadcastSender::send`]
    pub async fn send(&self, item: T) -> BroadcastResult<FanoutReport> {
        self.sender().send(item).await
    }

    /// Stop the coordinator and close every listener's sink
    ///
    /// Idempotent and non-blocking, and callable outside a tokio runtime. A
    /// broadcaster that never started stays unstarted. Use
    /// [`Broadcaster::stopped`] to wait until every sink has been closed.
    pub fn stop(&self) {
        debug!("Broadcaster::stop: called");
        self.shared.done.cancel();
    }

    /// Wait until the coordinator has exited and closed every sink
    pub async fn stopped(&self) {
        debug!("Broadcaster::stopped: called");
        // Stopped before first use: no coordinator, no sinks
        if self.shared.done.is_cancelled() && self.shared.channels.get().is_none() {
            return;
        }
        self.channels();
        self.shared.finished.cancelled().await;
    }

    /// Whether `stop` has been requested
    pub fn is_stopped(&self) -> bool {
        self.shared.done.is_cancelled()
    }

    /// Get current coordinator metrics
    pub async fn metrics(&self) -> BroadcastResult<BroadcastMetrics> {
        debug!("Broadcaster::metrics: called");
        if self.is_stopped() {
            return Err(BroadcastError::Stopped);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.channels()
            .tx
            .send(BroadcastRequest::GetMetrics { reply_tx })
            .await
            .map_err(|_| BroadcastError::Stopped)?;
        reply_rx.await.map_err(|_| BroadcastError::ChannelError)
    }
}

/// Send endpoint of a broadcaster
pub struct BroadcastSender<T> {
    tx: mpsc::Sender<BroadcastRequest<T>>,
    done: CancellationToken,
}

impl<T> Clone for BroadcastSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            done: self.done.clone(),
        }
    }
}

impl<T: Send + 'static> BroadcastSender<T> {
    /// Deliver `item` to every active listener
    ///
    /// Waits until the item has been delivered to, or skipped for, every
    /// listener that was active when its fan-out began. Broadcasts queue
    /// behind each other. A listener that neither drains its sink nor
    /// cancels blocks this call indefinitely unless a delivery timeout is
    /// configured.
    ///
    /// Sending after `stop` is a caller error and returns
    /// [`BroadcastError::Stopped`].
    pub async fn send(&self, item: T) -> BroadcastResult<FanoutReport> {
        if self.done.is_cancelled() {
            return Err(BroadcastError::Stopped);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(BroadcastRequest::Broadcast { item, reply_tx })
            .await
            .map_err(|_| BroadcastError::Stopped)?;
        let report = reply_rx.await.map_err(|_| BroadcastError::Stopped)?;
        debug!(?report, "BroadcastSender::send: fan-out complete");
        Ok(report)
    }
}

struct Registration {
    fired: AtomicBool,
    cancel: CancellationToken,
    /// Carries at most one id per registration
    remove_tx: mpsc::UnboundedSender<ListenerId>,
}

/// Handle that removes one listener
///
/// Every clone refers to the same registration; the first call to
/// `unregister` or `cancel` takes effect and later calls do nothing.
#[derive(Clone)]
pub struct Unregister {
    id: ListenerId,
    registration: Option<Arc<Registration>>,
}

impl Unregister {
    fn noop(id: ListenerId) -> Self {
        Self { id, registration: None }
    }

    /// Identity of the listener this handle removes
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Whether this handle has fired, or never referred to an active listener
    pub fn is_unregistered(&self) -> bool {
        self.registration
            .as_ref()
            .is_none_or(|reg| reg.fired.load(Ordering::SeqCst))
    }

    /// Claim the one-time right to fire; `None` if already fired or a no-op
    fn claim(&self) -> Option<&Registration> {
        let reg = self.registration.as_deref()?;
        if reg.fired.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(reg)
    }

    /// Signal cancellation and hand the removal to the coordinator
    ///
    /// Any delivery to this listener that is in progress is abandoned. The
    /// removal is queued without waiting; once the coordinator processes it
    /// the sink is closed. Does nothing after `stop`.
    pub async fn unregister(&self) {
        debug!(listener_id = %self.id, "Unregister::unregister: called");
        self.fire();
    }

    /// Synchronous form of [`Unregister::unregister`]
    ///
    /// Safe to call from synchronous code, including outside a tokio runtime.
    pub fn cancel(&self) {
        debug!(listener_id = %self.id, "Unregister::cancel: called");
        self.fire();
    }

    fn fire(&self) {
        let Some(reg) = self.claim() else {
            return;
        };
        reg.cancel.cancel();
        // Fails only once the coordinator has exited and closed every sink
        if reg.remove_tx.send(self.id).is_err() {
            debug!(listener_id = %self.id, "Unregister::fire: coordinator already stopped");
        }
    }
}

/// Channel-backed listener created by [`Broadcaster::listen`]
///
/// Yields items in broadcast order, then `None` once retired.
pub struct Listener<T> {
    rx: mpsc::Receiver<T>,
    unregister: Unregister,
}

impl<T> Listener<T> {
    /// Identity of this listener
    pub fn id(&self) -> ListenerId {
        self.unregister.id()
    }

    /// Receive the next item, or `None` once the listener is retired
    pub async fn recv(&mut self) -> Option<T> {
        debug!(listener_id = %self.id(), "Listener::recv: called");
        self.rx.recv().await
    }

    /// Try to receive an item without waiting
    pub fn try_recv(&mut self) -> Result<T, mpsc::error::TryRecvError> {
        debug!(listener_id = %self.id(), "Listener::try_recv: called");
        self.rx.try_recv()
    }

    /// Handle that removes this listener
    pub fn unregister_handle(&self) -> Unregister {
        debug!(listener_id = %self.id(), "Listener::unregister_handle: called");
        self.unregister.clone()
    }

    /// Remove this listener; see [`Unregister::unregister`]
    pub async fn unregister(&self) {
        debug!(listener_id = %self.id(), "Listener::unregister: called");
        self.unregister.unregister().await;
    }
}

impl<T> Stream for Listener<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::sink::CallbackSink;
    use futures::StreamExt;
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn test_lazy_broadcaster_starts_on_first_use() {
        let bc: Broadcaster<u32> = Broadcaster::default();
        assert!(bc.shared.channels.get().is_none());

        let mut listener = bc.listen().await;
        assert!(bc.shared.channels.get().is_some());

        bc.send(1).await.unwrap();
        assert_eq!(listener.recv().await, Some(1));
        bc.stop();
    }

    #[tokio::test]
    async fn test_register_after_stop_is_noop() {
        let bc = Broadcaster::<u32>::spawn(BroadcastConfig::default());
        bc.stop();

        let (tx, mut rx) = mpsc::channel(1);
        let handle = bc.register(tx).await;
        assert!(handle.is_unregistered());
        handle.unregister().await;
        handle.cancel();

        // Sink was closed immediately
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_send_after_stop_reports_stopped() {
        let bc = Broadcaster::<u32>::spawn(BroadcastConfig::default());
        let sender = bc.sender();
        bc.stop();
        assert_eq!(sender.send(1).await, Err(BroadcastError::Stopped));
        assert_eq!(bc.metrics().await, Err(BroadcastError::Stopped));
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let bc = Broadcaster::<u32>::spawn(BroadcastConfig::default());
        let mut listener = bc.listen().await;
        let other = bc.listen().await;

        let handle = listener.unregister_handle();
        handle.unregister().await;
        handle.unregister().await;
        listener.unregister().await;
        handle.cancel();
        assert!(handle.is_unregistered());

        assert_eq!(listener.recv().await, None);
        let metrics = bc.metrics().await.unwrap();
        assert_eq!(metrics.retirements, 1);
        assert_eq!(metrics.active_listeners, 1);

        drop(other);
        bc.stop();
    }

    #[tokio::test]
    async fn test_sync_cancel_retires_listener() {
        let bc = Broadcaster::<u32>::spawn(BroadcastConfig::default());
        let mut listener = bc.listen().await;

        listener.unregister_handle().cancel();
        let report = bc.send(5).await.unwrap();
        assert_eq!(report.delivered, 0);
        assert_eq!(listener.recv().await, None);
        bc.stop();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_closes_sinks() {
        let bc = Broadcaster::<&'static str>::spawn(BroadcastConfig::default());
        let closed = Arc::new(Mutex::new(0));
        let closed_cb = closed.clone();
        let seen = Arc::new(Mutex::new(Vec::<&'static str>::new()));
        let seen_cb = seen.clone();

        bc.register(
            CallbackSink::new(move |item: &'static str| seen_cb.lock().unwrap().push(item))
                .on_close(move || *closed_cb.lock().unwrap() += 1),
        )
        .await;
        let listener = bc.listen().await;

        bc.send("only").await.unwrap();
        bc.stop();
        bc.stop();
        bc.stopped().await;
        bc.stop();

        assert!(bc.is_stopped());
        assert_eq!(*seen.lock().unwrap(), vec!["only"]);
        assert_eq!(*closed.lock().unwrap(), 1);
        assert_eq!(listener.collect::<Vec<_>>().await, vec!["only"]);
    }

    #[tokio::test]
    async fn test_stop_before_first_use() {
        let bc = Broadcaster::<u32>::default();
        bc.stop();
        tokio::time::timeout(Duration::from_secs(1), bc.stopped())
            .await
            .expect("coordinator should exit");
        let mut listener = bc.listen().await;
        assert_eq!(listener.recv().await, None);
    }

    #[test]
    fn test_stop_outside_runtime_before_first_use() {
        let bc = Broadcaster::<u32>::default();
        bc.stop();
        bc.stop();
        assert!(bc.is_stopped());
        assert!(bc.shared.channels.get().is_none());

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            tokio::time::timeout(Duration::from_secs(1), bc.stopped())
                .await
                .expect("nothing to wait for");
            assert_eq!(bc.send(1).await, Err(BroadcastError::Stopped));
            let mut listener = bc.listen().await;
            assert_eq!(listener.recv().await, None);
        });
    }

    #[tokio::test]
    async fn test_burst_of_sync_cancels_closes_every_listener() {
        let config = BroadcastConfig {
            inbox_buffer: 1,
            ..Default::default()
        };
        let bc = Broadcaster::<u32>::spawn(config);
        let mut leaving = Vec::new();
        for _ in 0..3 {
            leaving.push(bc.listen().await);
        }
        let staying = bc.listen().await;

        // No await in between: the coordinator cannot drain the queue meanwhile
        for listener in &leaving {
            listener.unregister_handle().cancel();
        }

        for mut listener in leaving {
            let next = tokio::time::timeout(Duration::from_secs(1), listener.recv())
                .await
                .expect("cancelled listener should close without further sends");
            assert_eq!(next, None);
        }

        let metrics = bc.metrics().await.unwrap();
        assert_eq!(metrics.retirements, 3);
        assert_eq!(metrics.active_listeners, 1);

        drop(staying);
        bc.stop();
    }

    #[tokio::test]
    async fn test_listener_stream() {
        let bc = Broadcaster::<u32>::spawn(BroadcastConfig::default());
        let listener = bc.listen().await;

        for i in 0..3 {
            bc.send(i).await.unwrap();
        }
        bc.stop();

        let items: Vec<u32> = listener.collect::<Vec<_>>().await;
        assert_eq!(items, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_dropping_all_handles_closes_listeners() {
        let bc = Broadcaster::<u32>::spawn(BroadcastConfig::default());
        let (tx, mut rx) = mpsc::channel(1);
        let _handle = bc.register(tx).await;
        drop(bc);

        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("sink should close");
    }
}
