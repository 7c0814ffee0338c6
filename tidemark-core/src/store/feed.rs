//! Live feed plumbing: bounded subscriber queues and drain tasks.
//!
//! Every subscriber owns a bounded queue the store publishes into while it
//! holds the append guard, so all subscribers observe events in strict
//! global-position order. What happens when a consumer falls behind is the
//! [`DeliveryPolicy`]: a `DropOldest` queue is a `tokio::sync::broadcast`
//! ring that skips the oldest entries (skips are counted and surfaced as
//! [`FeedItem::Lagged`]), while a `Block` queue is a bounded mpsc channel
//! that applies backpressure to `append` until the consumer drains.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::{
    sync::{broadcast, mpsc, oneshot, RwLock},
    task::JoinHandle,
};

use crate::{event::Event, metrics::StoreMetrics};

/// How a subscriber's bounded queue behaves when the consumer lags.
///
/// Chosen per deployment: the store has a default, and each `subscribe_with`
/// call may override it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryPolicy {
    /// Ring buffer: the oldest queued events are dropped for a lagging
    /// consumer. Appends never wait on this subscriber.
    DropOldest { capacity: usize },
    /// Backpressure: a full queue makes `append` wait until the consumer
    /// receives. Capacity frees on receive, not on handler completion, so a
    /// consumer that reads the store while the writer waits cannot deadlock.
    Block { capacity: usize },
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self::DropOldest { capacity: 1024 }
    }
}

/// Sending half of a subscriber queue, held in the store's registry.
pub(crate) enum SubscriberQueue {
    DropOldest(broadcast::Sender<Arc<Event>>),
    Block(mpsc::Sender<Arc<Event>>),
}

impl SubscriberQueue {
    /// Publish one event. Returns `false` when the consumer is gone and the
    /// queue should be pruned from the registry.
    pub(crate) async fn publish(&self, event: &Arc<Event>) -> bool {
        match self {
            Self::DropOldest(tx) => tx.send(Arc::clone(event)).is_ok(),
            Self::Block(tx) => tx.send(Arc::clone(event)).await.is_ok(),
        }
    }
}

pub(crate) enum FeedRx {
    DropOldest(broadcast::Receiver<Arc<Event>>),
    Block(mpsc::Receiver<Arc<Event>>),
}

pub(crate) fn queue_pair(policy: DeliveryPolicy) -> (SubscriberQueue, FeedRx) {
    match policy {
        DeliveryPolicy::DropOldest { capacity } => {
            let (tx, rx) = broadcast::channel(capacity.max(1));
            (SubscriberQueue::DropOldest(tx), FeedRx::DropOldest(rx))
        }
        DeliveryPolicy::Block { capacity } => {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            (SubscriberQueue::Block(tx), FeedRx::Block(rx))
        }
    }
}

/// Item yielded by [`LiveFeed::next`].
#[derive(Clone, Debug)]
pub enum FeedItem {
    /// The next event, in global-position order.
    Event(Arc<Event>),
    /// The consumer lagged and `n` oldest events were skipped
    /// (`DropOldest` queues only). Consumers that cannot tolerate gaps
    /// should re-read from their checkpoint via `read_all_since`.
    Lagged(u64),
}

/// Receiving half of a live subscription.
///
/// Dropping the feed does **not** eagerly deregister the queue; the store
/// prunes it on the next publish. Call [`unsubscribe`](Self::unsubscribe)
/// to remove it immediately.
pub struct LiveFeed {
    pub(crate) id: u64,
    pub(crate) rx: FeedRx,
    pub(crate) registry: Arc<RwLock<super::Inner>>,
    pub(crate) metrics: Arc<StoreMetrics>,
}

impl LiveFeed {
    /// Receive the next feed item, waiting if the queue is empty.
    ///
    /// Returns `None` once the feed is closed (the queue was deregistered).
    pub async fn next(&mut self) -> Option<FeedItem> {
        match &mut self.rx {
            FeedRx::DropOldest(rx) => match rx.recv().await {
                Ok(event) => Some(FeedItem::Event(event)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    self.metrics.record_lag_drops(skipped);
                    tracing::warn!(skipped, "subscriber lagged; oldest events dropped");
                    Some(FeedItem::Lagged(skipped))
                }
                Err(broadcast::error::RecvError::Closed) => None,
            },
            FeedRx::Block(rx) => rx.recv().await.map(FeedItem::Event),
        }
    }

    /// Try to receive without waiting. Returns `None` when the queue is
    /// currently empty or closed.
    pub fn try_next(&mut self) -> Option<FeedItem> {
        match &mut self.rx {
            FeedRx::DropOldest(rx) => match rx.try_recv() {
                Ok(event) => Some(FeedItem::Event(event)),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    self.metrics.record_lag_drops(skipped);
                    Some(FeedItem::Lagged(skipped))
                }
                Err(_) => None,
            },
            FeedRx::Block(rx) => rx.try_recv().ok().map(FeedItem::Event),
        }
    }

    /// Deregister this subscriber from the store.
    ///
    /// Safe to call at any time; events already queued are discarded.
    pub async fn unsubscribe(self) {
        let mut inner = self.registry.write().await;
        inner.subscribers.remove(&self.id);
        tracing::debug!(subscriber = self.id, "subscriber deregistered");
    }
}

/// Handle to a handler-driven subscriber task.
///
/// Dropping the handle does **not** stop the task. Call
/// [`stop`](Self::stop) for graceful shutdown; an in-flight handler
/// invocation completes first.
pub struct SubscriberHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SubscriberHandle {
    pub(crate) fn new(stop_tx: oneshot::Sender<()>, task: JoinHandle<()>) -> Self {
        Self {
            stop_tx: Some(stop_tx),
            task,
        }
    }

    /// Stop the subscriber and wait for its task to finish.
    pub async fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if self.task.await.is_err() {
            tracing::error!("subscriber task panicked");
        }
    }

    /// Whether the subscriber task is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}
