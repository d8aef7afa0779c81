//! Coordinator task - sole owner of the listener set

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::SinkError;
use super::messages::{BroadcastMetrics, BroadcastRequest, FanoutReport, ListenerId};
use super::sink::Sink;
use crate::config::BroadcastConfig;

/// Registered listener as seen by the coordinator
struct ListenerEntry<T> {
    sink: Box<dyn Sink<T>>,
    /// Child of the coordinator's `done` token
    cancel: CancellationToken,
}

/// Result of racing one delivery against the listener's cancellation
#[derive(Debug)]
enum Delivery {
    Delivered,
    Cancelled,
    Failed(SinkError),
    TimedOut,
}

/// The coordinator serializes registration, removal, shutdown and fan-out
///
/// Only `run` touches the listener map. Callers reach it through the
/// request and removal queues held by `Broadcaster`.
pub(crate) struct Coordinator<T> {
    config: BroadcastConfig,
    rx: mpsc::Receiver<BroadcastRequest<T>>,
    remove_rx: mpsc::UnboundedReceiver<ListenerId>,
    done: CancellationToken,
    finished: CancellationToken,
}

impl<T: Clone + Send + 'static> Coordinator<T> {
    pub(crate) fn new(
        config: BroadcastConfig,
        rx: mpsc::Receiver<BroadcastRequest<T>>,
        remove_rx: mpsc::UnboundedReceiver<ListenerId>,
        done: CancellationToken,
        finished: CancellationToken,
    ) -> Self {
        Self {
            config,
            rx,
            remove_rx,
            done,
            finished,
        }
    }

    /// Run the coordinator until `done` fires or every request sender is gone
    ///
    /// On exit every remaining listener is retired, queued requests are
    /// dropped (their callers observe a stopped broadcaster) and `finished`
    /// fires.
    pub(crate) async fn run(mut self) {
        let mut listeners: HashMap<ListenerId, ListenerEntry<T>> = HashMap::new();
        let mut metrics = BroadcastMetrics::default();
        let delivery_timeout = self.config.delivery_timeout();

        info!(?delivery_timeout, "Broadcast coordinator started");

        loop {
            tokio::select! {
                biased;

                _ = self.done.cancelled() => {
                    info!("Broadcast coordinator shutting down");
                    break;
                }

                Some(id) = self.remove_rx.recv() => {
                    metrics.requests_received += 1;
                    debug!(listener_id = %id, "Removing listener");
                    if let Some(entry) = listeners.remove(&id) {
                        retire(id, entry);
                        metrics.retirements += 1;
                    }
                    metrics.active_listeners = listeners.len();
                }

                req = self.rx.recv() => {
                    let Some(req) = req else {
                        debug!("All broadcaster handles dropped");
                        break;
                    };
                    metrics.requests_received += 1;

                    match req {
                        BroadcastRequest::Register { id, sink, cancel, ack } => {
                            debug!(listener_id = %id, "Registering listener");
                            listeners.insert(id, ListenerEntry { sink, cancel });
                            metrics.registrations += 1;
                            metrics.active_listeners = listeners.len();
                            let _ = ack.send(());
                        }

                        BroadcastRequest::Broadcast { item, reply_tx } => {
                            let report = fan_out(item, &mut listeners, delivery_timeout, &mut metrics).await;
                            metrics.active_listeners = listeners.len();
                            let _ = reply_tx.send(report);
                        }

                        BroadcastRequest::GetMetrics { reply_tx } => {
                            let _ = reply_tx.send(metrics.clone());
                        }
                    }
                }
            }
        }

        self.shutdown(listeners);
    }

    fn shutdown(mut self, mut listeners: HashMap<ListenerId, ListenerEntry<T>>) {
        self.done.cancel();

        let remaining = listeners.len();
        for (id, entry) in listeners.drain() {
            retire(id, entry);
        }

        // Registrations still queued never became active; finalize their sinks too
        self.rx.close();
        while let Ok(req) = self.rx.try_recv() {
            if let BroadcastRequest::Register { mut sink, .. } = req {
                sink.close();
            }
        }
        self.remove_rx.close();

        self.finished.cancel();
        info!(retired = remaining, "Broadcast coordinator stopped");
    }
}

/// Deliver `item` to every active listener, retiring any that cancelled or failed
async fn fan_out<T: Clone + Send + 'static>(
    item: T,
    listeners: &mut HashMap<ListenerId, ListenerEntry<T>>,
    delivery_timeout: Option<Duration>,
    metrics: &mut BroadcastMetrics,
) -> FanoutReport {
    let mut report = FanoutReport::default();
    let mut retiring = Vec::new();

    debug!(listeners = listeners.len(), "Broadcasting item");

    for (id, entry) in listeners.iter_mut() {
        match deliver(entry, item.clone(), delivery_timeout).await {
            Delivery::Delivered => report.delivered += 1,
            Delivery::Cancelled => {
                debug!(listener_id = %id, "Listener cancelled during delivery");
                report.skipped += 1;
                retiring.push(*id);
            }
            Delivery::Failed(e) => {
                debug!(listener_id = %id, error = %e, "Listener sink failed");
                report.skipped += 1;
                retiring.push(*id);
            }
            Delivery::TimedOut => {
                warn!(listener_id = %id, "Delivery timed out, skipping item for listener");
                report.skipped += 1;
                metrics.delivery_timeouts += 1;
            }
        }
    }

    for id in retiring {
        if let Some(entry) = listeners.remove(&id) {
            retire(id, entry);
            report.retired += 1;
        }
    }

    metrics.items_broadcast += 1;
    metrics.deliveries += report.delivered as u64;
    metrics.skips += report.skipped as u64;
    metrics.retirements += report.retired as u64;

    report
}

/// Race one delivery against the listener's cancellation
///
/// Cancellation is polled first, so a listener that already cancelled never
/// receives another item.
async fn deliver<T: Send + 'static>(
    entry: &mut ListenerEntry<T>,
    item: T,
    delivery_timeout: Option<Duration>,
) -> Delivery {
    let ListenerEntry { sink, cancel } = entry;
    let send = sink.deliver(item);

    match delivery_timeout {
        Some(timeout) => tokio::select! {
            biased;
            _ = cancel.cancelled() => Delivery::Cancelled,
            result = tokio::time::timeout(timeout, send) => match result {
                Ok(Ok(())) => Delivery::Delivered,
                Ok(Err(e)) => Delivery::Failed(e),
                Err(_) => Delivery::TimedOut,
            },
        },
        None => tokio::select! {
            biased;
            _ = cancel.cancelled() => Delivery::Cancelled,
            result = send => match result {
                Ok(()) => Delivery::Delivered,
                Err(e) => Delivery::Failed(e),
            },
        },
    }
}

/// Remove-side finalization: mark cancelled, then close the sink exactly once
fn retire<T: 'static>(id: ListenerId, mut entry: ListenerEntry<T>) {
    debug!(listener_id = %id, "Retiring listener");
    entry.cancel.cancel();
    entry.sink.close();
}
