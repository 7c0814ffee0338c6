//! The event store: per-stream logs, global ordering, optimistic appends,
//! and the live subscription feed.
//!
//! [`EventStore`] owns every stream, the global position counter, and the
//! subscriber registry behind a single async lock. Appends validate, assign
//! contiguous per-stream versions and gapless global positions, write
//! through to the optional [`DurableEventLog`], then publish to every
//! subscriber queue in position order before returning; enqueue-before-
//! return is what makes delivery at-least-once for registered subscribers.
//!
//! Reads run concurrently with each other and observe a consistent prefix
//! of the log; the write guard serializes the check-then-act of optimistic
//! concurrency, so two racing appends with the same stale expectation
//! resolve to exactly one winner.

use std::{
    collections::{HashMap, HashSet},
    convert::Infallible,
    future::Future,
    sync::Arc,
};

use chrono::Utc;
pub use nonempty::NonEmpty;
use thiserror::Error;
use tokio::sync::{oneshot, RwLock};

use crate::{
    event::{Event, EventId, MalformedEvent, NewEvent, StreamId},
    metrics::StoreMetrics,
    store::feed::{DeliveryPolicy, FeedItem, LiveFeed, SubscriberHandle},
};

pub mod feed;

/// Expected stream state for an optimistic append.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Expected {
    /// No version check; last writer wins.
    Any,
    /// The stream must not exist yet (creating a new entity).
    NoStream,
    /// The stream's current version must equal this value exactly.
    Version(u64),
}

impl Expected {
    const fn required_version(self) -> Option<u64> {
        match self {
            Self::Any => None,
            Self::NoStream => Some(0),
            Self::Version(version) => Some(version),
        }
    }
}

/// Another writer changed the stream between load and append.
///
/// Recoverable: reload the stream, re-derive the batch, retry with fresh
/// expectations. The store never retries internally, since a blind retry could
/// apply a stale command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error(
    "version conflict: expected version {expected}, found {actual} \
     (hint: stream was modified; reload and retry)"
)]
pub struct VersionConflict {
    /// The version the caller expected (0 for a new stream).
    pub expected: u64,
    /// The stream's actual current version.
    pub actual: u64,
}

/// Error from [`EventStore::append`].
///
/// The three variants deliberately separate "retry with fresh state"
/// (conflict), "fix and resubmit" (malformed), and "retry later" (storage).
#[derive(Debug, Error)]
pub enum AppendError<E>
where
    E: std::error::Error + 'static,
{
    #[error(transparent)]
    Conflict(#[from] VersionConflict),
    #[error(transparent)]
    Malformed(#[from] MalformedEvent),
    /// The durable log rejected the batch; nothing was published.
    #[error("durable event log failed: {0}")]
    Storage(#[source] E),
}

/// Receipt for a successful append.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AppendReceipt {
    pub first_version: u64,
    pub last_version: u64,
    pub last_position: u64,
}

/// A bounded page of globally ordered events plus its continuation.
///
/// Catch-up readers loop: `read_all_since(batch.next_position, limit)`
/// until `caught_up` is true.
#[derive(Clone, Debug)]
pub struct ReadBatch {
    pub events: Vec<Arc<Event>>,
    /// Position to continue from; equals the request position when the
    /// batch is empty.
    pub next_position: u64,
    /// Whether the batch reached the end of the log at read time.
    pub caught_up: bool,
}

/// Backing store boundary for durable event persistence.
///
/// The event store validates and orders in memory and delegates durability
/// here. Each call is assumed atomic; failures surface to the appending
/// caller as [`AppendError::Storage`].
pub trait DurableEventLog: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Persist an ordered batch of stored events.
    fn append_persisted<'a>(
        &'a self,
        events: &'a [Arc<Event>],
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

    /// Read persisted events with global position strictly greater than
    /// `position`, in position order.
    fn read_persisted_since(
        &self,
        position: u64,
    ) -> impl Future<Output = Result<Vec<Event>, Self::Error>> + Send + '_;
}

/// No-op durable log for purely in-memory stores.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoDurableLog;

impl DurableEventLog for NoDurableLog {
    type Error = Infallible;

    fn append_persisted<'a>(
        &'a self,
        _events: &'a [Arc<Event>],
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a {
        std::future::ready(Ok(()))
    }

    fn read_persisted_since(
        &self,
        _position: u64,
    ) -> impl Future<Output = Result<Vec<Event>, Self::Error>> + Send + '_ {
        std::future::ready(Ok(Vec::new()))
    }
}

/// Error from [`EventStore::hydrate`].
#[derive(Debug, Error)]
pub enum HydrateError<E>
where
    E: std::error::Error + 'static,
{
    #[error("durable event log read failed: {0}")]
    Storage(#[source] E),
    #[error("persisted event at position {position} breaks global order (expected {expected})")]
    PositionGap { position: u64, expected: u64 },
    #[error("persisted event {id} at version {version} breaks continuity of stream {stream_id} (expected {expected})")]
    VersionGap {
        id: EventId,
        stream_id: StreamId,
        version: u64,
        expected: u64,
    },
    #[error("persisted event id {id} appears more than once")]
    DuplicateId { id: EventId },
}

pub(crate) struct Inner {
    streams: HashMap<StreamId, Vec<Arc<Event>>>,
    /// Global log in position order; `position == index + 1`.
    log: Vec<Arc<Event>>,
    by_id: HashMap<EventId, u64>,
    pub(crate) subscribers: HashMap<u64, feed::SubscriberQueue>,
    next_subscriber: u64,
}

impl Inner {
    fn empty() -> Self {
        Self {
            streams: HashMap::new(),
            log: Vec::new(),
            by_id: HashMap::new(),
            subscribers: HashMap::new(),
            next_subscriber: 0,
        }
    }

    fn current_version(&self, stream_id: &StreamId) -> u64 {
        self.streams.get(stream_id).map_or(0, |s| s.len() as u64)
    }
}

/// Append-only event store with per-stream versioning and a global order.
///
/// Cloning is cheap and shares the underlying state; pass clones to
/// anything needing to subscribe rather than reaching for globals.
pub struct EventStore<L = NoDurableLog> {
    inner: Arc<RwLock<Inner>>,
    durable: Arc<L>,
    policy: DeliveryPolicy,
    metrics: Arc<StoreMetrics>,
}

impl<L> Clone for EventStore<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            durable: Arc::clone(&self.durable),
            policy: self.policy,
            metrics: Arc::clone(&self.metrics),
        }
    }
}

impl EventStore<NoDurableLog> {
    /// Create a purely in-memory store with the default delivery policy.
    #[must_use]
    pub fn new() -> Self {
        Self::with_policy(DeliveryPolicy::default())
    }

    /// Create a purely in-memory store with an explicit delivery policy.
    #[must_use]
    pub fn with_policy(policy: DeliveryPolicy) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::empty())),
            durable: Arc::new(NoDurableLog),
            policy,
            metrics: Arc::new(StoreMetrics::default()),
        }
    }
}

impl Default for EventStore<NoDurableLog> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L> EventStore<L>
where
    L: DurableEventLog,
{
    /// Create a store that writes through to `log` on every append.
    #[must_use]
    pub fn with_durable_log(log: L) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::empty())),
            durable: Arc::new(log),
            policy: DeliveryPolicy::default(),
            metrics: Arc::new(StoreMetrics::default()),
        }
    }

    /// Override the default delivery policy for new subscribers.
    #[must_use]
    pub fn delivery_policy(mut self, policy: DeliveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Rebuild the in-memory index from a durable log at startup.
    ///
    /// Verifies that the persisted history is gapless (global positions and
    /// per-stream versions) before accepting it.
    ///
    /// # Errors
    ///
    /// Returns [`HydrateError::Storage`] when the log cannot be read, and a
    /// continuity variant when the history is inconsistent.
    pub async fn hydrate(log: L) -> Result<Self, HydrateError<L::Error>> {
        let persisted = log
            .read_persisted_since(0)
            .await
            .map_err(HydrateError::Storage)?;

        let mut inner = Inner::empty();
        for event in persisted {
            let expected_position = inner.log.len() as u64 + 1;
            if event.position != expected_position {
                return Err(HydrateError::PositionGap {
                    position: event.position,
                    expected: expected_position,
                });
            }
            let expected_version = inner.current_version(&event.stream_id) + 1;
            if event.version != expected_version {
                return Err(HydrateError::VersionGap {
                    id: event.id,
                    stream_id: event.stream_id.clone(),
                    version: event.version,
                    expected: expected_version,
                });
            }
            if inner.by_id.contains_key(&event.id) {
                return Err(HydrateError::DuplicateId { id: event.id });
            }

            let event = Arc::new(event);
            inner.by_id.insert(event.id, event.position);
            inner
                .streams
                .entry(event.stream_id.clone())
                .or_default()
                .push(Arc::clone(&event));
            inner.log.push(event);
        }

        tracing::info!(events = inner.log.len(), "event store hydrated");
        Ok(Self {
            inner: Arc::new(RwLock::new(inner)),
            durable: Arc::new(log),
            policy: DeliveryPolicy::default(),
            metrics: Arc::new(StoreMetrics::default()),
        })
    }

    /// Append a batch of events to one stream.
    ///
    /// The batch is atomic per stream: either every event is assigned a
    /// contiguous version and a gapless global position, or nothing is
    /// stored. On success every live subscriber queue has the events
    /// enqueued, in position order, before this returns.
    ///
    /// # Errors
    ///
    /// [`AppendError::Conflict`] when `expected` does not match the current
    /// stream version, [`AppendError::Malformed`] when validation rejects
    /// the batch before storage, [`AppendError::Storage`] when the durable
    /// log fails (nothing is published in that case).
    #[tracing::instrument(skip_all, fields(event_count = batch.len()))]
    pub async fn append(
        &self,
        stream_id: impl Into<StreamId>,
        batch: NonEmpty<NewEvent>,
        expected: Expected,
    ) -> Result<AppendReceipt, AppendError<L::Error>> {
        let stream_id: StreamId = stream_id.into();
        if stream_id.is_blank() {
            self.metrics.record_malformed();
            return Err(MalformedEvent::BlankStreamId.into());
        }
        let mut batch_ids = HashSet::with_capacity(batch.len());
        for event in batch.iter() {
            if let Err(reason) = event.validate() {
                self.metrics.record_malformed();
                return Err(reason.into());
            }
            if !batch_ids.insert(event.id) {
                self.metrics.record_malformed();
                return Err(MalformedEvent::DuplicateEventId { id: event.id }.into());
            }
        }

        let mut inner = self.inner.write().await;

        for event in batch.iter() {
            if inner.by_id.contains_key(&event.id) {
                self.metrics.record_malformed();
                return Err(MalformedEvent::DuplicateEventId { id: event.id }.into());
            }
        }

        let current = inner.current_version(&stream_id);
        if let Some(required) = expected.required_version() {
            if current != required {
                self.metrics.record_conflict();
                tracing::debug!(
                    stream = %stream_id,
                    expected = required,
                    actual = current,
                    "version mismatch, rejecting append"
                );
                return Err(VersionConflict {
                    expected: required,
                    actual: current,
                }
                .into());
            }
        }

        let recorded_at = Utc::now();
        let base_position = inner.log.len() as u64;
        let count = batch.len() as u64;
        let mut events = Vec::with_capacity(batch.len());
        for (offset, new) in batch.into_iter().enumerate() {
            events.push(Arc::new(Event::from_new(
                new,
                stream_id.clone(),
                current + 1 + offset as u64,
                base_position + 1 + offset as u64,
                recorded_at,
            )));
        }

        // Durability first: a failed write-through publishes nothing.
        self.durable
            .append_persisted(&events)
            .await
            .map_err(AppendError::Storage)?;

        for event in &events {
            inner.by_id.insert(event.id, event.position);
            inner.log.push(Arc::clone(event));
        }
        inner
            .streams
            .entry(stream_id.clone())
            .or_default()
            .extend(events.iter().cloned());

        // Publish in position order while still holding the guard, so no
        // concurrent append can interleave its events into any queue.
        let mut dead = HashSet::new();
        for event in &events {
            for (id, queue) in &inner.subscribers {
                if !queue.publish(event).await {
                    dead.insert(*id);
                }
            }
        }
        for id in dead {
            inner.subscribers.remove(&id);
        }
        drop(inner);

        self.metrics.record_appended(count);
        tracing::debug!(
            stream = %stream_id,
            events_appended = count,
            last_position = base_position + count,
            "events appended"
        );
        Ok(AppendReceipt {
            first_version: current + 1,
            last_version: current + count,
            last_position: base_position + count,
        })
    }

    /// Read a stream's events with `version > from_version`, in version
    /// order. Empty when the stream does not exist or has nothing newer.
    pub async fn read_stream(
        &self,
        stream_id: impl Into<StreamId>,
        from_version: u64,
    ) -> Vec<Arc<Event>> {
        let stream_id = stream_id.into();
        let inner = self.inner.read().await;
        inner.streams.get(&stream_id).map_or_else(Vec::new, |s| {
            s.iter().skip(from_version as usize).cloned().collect()
        })
    }

    /// Read up to `limit` events with global position strictly greater than
    /// `position`, in position order, plus a continuation.
    pub async fn read_all_since(&self, position: u64, limit: usize) -> ReadBatch {
        let inner = self.inner.read().await;
        let start = (position as usize).min(inner.log.len());
        let events: Vec<_> = inner.log[start..]
            .iter()
            .take(limit.max(1))
            .cloned()
            .collect();
        let next_position = events.last().map_or(position, |e| e.position);
        let caught_up = start + events.len() >= inner.log.len();
        ReadBatch {
            events,
            next_position,
            caught_up,
        }
    }

    /// Current version of a stream (0 when the stream does not exist).
    pub async fn stream_version(&self, stream_id: impl Into<StreamId>) -> u64 {
        let stream_id = stream_id.into();
        self.inner.read().await.current_version(&stream_id)
    }

    /// Global position of the most recently appended event (0 when empty).
    pub async fn latest_position(&self) -> u64 {
        self.inner.read().await.log.len() as u64
    }

    /// Global position of the event with the given id, if it exists.
    pub async fn position_of(&self, id: &EventId) -> Option<u64> {
        self.inner.read().await.by_id.get(id).copied()
    }

    /// Register a live feed with the store's default delivery policy.
    pub async fn subscribe(&self) -> LiveFeed {
        self.subscribe_with(self.policy).await
    }

    /// Register a live feed with an explicit delivery policy.
    ///
    /// Events appended after registration are delivered in global-position
    /// order. The registry is store-owned; use [`LiveFeed::unsubscribe`]
    /// (or drop the feed and let the store prune it) to deregister.
    pub async fn subscribe_with(&self, policy: DeliveryPolicy) -> LiveFeed {
        let (queue, rx) = feed::queue_pair(policy);
        let mut inner = self.inner.write().await;
        let id = inner.next_subscriber;
        inner.next_subscriber += 1;
        inner.subscribers.insert(id, queue);
        drop(inner);
        tracing::debug!(subscriber = id, "subscriber registered");
        LiveFeed {
            id,
            rx,
            registry: Arc::clone(&self.inner),
            metrics: Arc::clone(&self.metrics),
        }
    }

    /// Register a callback invoked once per appended event, in
    /// global-position order, on a background task.
    ///
    /// The returned handle stops and deregisters the subscriber; an
    /// in-flight callback invocation completes before the task exits.
    pub async fn subscribe_with_handler<F>(&self, handler: F) -> SubscriberHandle
    where
        F: FnMut(Arc<Event>) + Send + 'static,
    {
        let mut live = self.subscribe().await;
        let (stop_tx, mut stop_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let mut handler = handler;
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    item = live.next() => match item {
                        Some(FeedItem::Event(event)) => handler(event),
                        Some(FeedItem::Lagged(_)) => {}
                        None => break,
                    }
                }
            }
            live.unsubscribe().await;
        });
        SubscriberHandle::new(stop_tx, task)
    }

    /// Counters for external telemetry sampling.
    #[must_use]
    pub fn metrics(&self) -> &StoreMetrics {
        &self.metrics
    }
}
