//! Projection subscriptions: catch-up replay plus live tailing.
//!
//! A [`ProjectionSubscription`] drives a [`ProjectionBuilder`] from an
//! [`EventStore`]: it registers on the live feed first, replays history
//! from its checkpoint in paginated batches, then switches to live events,
//! deduplicating the overlap by position so the transition has no gaps and
//! no duplicates. Each successfully processed event advances the
//! checkpoint.
//!
//! Handler failures follow the configured [`ErrorPolicy`]: skip-and-report
//! keeps the feed moving past a bad event, halt-and-alert stops the
//! subscription for projections that cannot tolerate skips. Projection
//! store failures are retried with exponential backoff and become fatal
//! after `max_attempts`.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::{
    sync::{oneshot, watch},
    task::JoinHandle,
};

use crate::{
    event::{Event, EventId},
    projection::{DurableProjectionStore, ProjectionBuilder, ProjectionError},
    store::{
        feed::{DeliveryPolicy, FeedItem, LiveFeed},
        DurableEventLog, EventStore,
    },
};

/// What to do when a projection handler rejects an event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorPolicy {
    /// Count the error, invoke the error callback, advance past the event.
    /// One bad event never halts the feed.
    #[default]
    SkipAndReport,
    /// Invoke the error callback and stop the subscription in a failed
    /// state. For projections where a skipped event means a wrong answer.
    HaltAndAlert,
}

/// Subscription tuning.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SubscriptionConfig {
    /// Replay history from the checkpoint before going live.
    pub catch_up_on_start: bool,
    /// Checkpoint to resume from: events with positions at or below this
    /// are considered already processed.
    pub start_after: u64,
    /// Page size for catch-up reads.
    pub batch_size: usize,
    pub error_policy: ErrorPolicy,
    /// Attempts per event before a projection store failure becomes fatal.
    pub max_attempts: u32,
    /// Base delay for exponential retry backoff.
    pub retry_backoff: Duration,
    /// Per-subscription override of the store's delivery policy.
    pub delivery: Option<DeliveryPolicy>,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            catch_up_on_start: true,
            start_after: 0,
            batch_size: 256,
            error_policy: ErrorPolicy::default(),
            max_attempts: 5,
            retry_backoff: Duration::from_millis(50),
            delivery: None,
        }
    }
}

/// Lifecycle of a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Replaying history; not yet current.
    CatchingUp,
    /// Caught up and processing live events.
    Running,
    /// Stopped by request. Projection state is untouched.
    Stopped,
    /// Halted by policy or by exhausted retries.
    Failed,
}

type ErrorCallback<E> = Box<dyn Fn(&Event, &ProjectionError<E>) + Send + Sync>;
type AppliedCallback = Box<dyn Fn(&Event) + Send + Sync>;

/// Builder for a running subscription.
pub struct ProjectionSubscription<L, P>
where
    P: DurableProjectionStore,
{
    store: EventStore<L>,
    builder: Arc<ProjectionBuilder<P>>,
    config: SubscriptionConfig,
    on_error: Option<ErrorCallback<P::Error>>,
    on_applied: Option<AppliedCallback>,
    on_caught_up: Option<Box<dyn FnOnce() + Send>>,
}

impl<L, P> ProjectionSubscription<L, P>
where
    L: DurableEventLog + 'static,
    P: DurableProjectionStore + 'static,
{
    /// Subscription driving `builder` from `store`.
    ///
    /// The builder is shared so callers can keep a clone for reads; event
    /// processing should be left to the subscription.
    #[must_use]
    pub fn new(
        store: EventStore<L>,
        builder: Arc<ProjectionBuilder<P>>,
        config: SubscriptionConfig,
    ) -> Self {
        Self {
            store,
            builder,
            config,
            on_error: None,
            on_applied: None,
            on_caught_up: None,
        }
    }

    /// Callback invoked with each event that fails processing.
    #[must_use]
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Event, &ProjectionError<P::Error>) + Send + Sync + 'static,
    {
        self.on_error = Some(Box::new(callback));
        self
    }

    /// Callback invoked after each successfully applied event.
    ///
    /// Callbacks must complete quickly; long-running work should be handed
    /// off through a channel, or it stalls the subscription loop.
    #[must_use]
    pub fn on_applied<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.on_applied = Some(Box::new(callback));
        self
    }

    /// One-shot callback fired when catch-up completes and the
    /// subscription transitions to live processing. Useful for serving
    /// reads only once the projection is current.
    #[must_use]
    pub fn on_caught_up<F>(mut self, callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_caught_up = Some(Box::new(callback));
        self
    }

    /// Start processing on a background task.
    ///
    /// The live feed is registered before catch-up begins, so events
    /// appended during replay wait in the queue and are deduplicated by
    /// position afterwards.
    pub async fn start(self) -> SubscriptionHandle {
        let Self {
            store,
            builder,
            config,
            on_error,
            on_applied,
            on_caught_up,
        } = self;

        let live = match config.delivery {
            Some(policy) => store.subscribe_with(policy).await,
            None => store.subscribe().await,
        };

        let (state_tx, state_rx) = watch::channel(SubscriptionState::CatchingUp);
        let (stop_tx, stop_rx) = oneshot::channel();
        let position = Arc::new(AtomicU64::new(config.start_after));
        let last_event = Arc::new(Mutex::new(None));
        let errors = Arc::new(AtomicU64::new(0));

        let worker = Worker {
            store,
            builder,
            config,
            on_error,
            on_applied,
            position: Arc::clone(&position),
            last_event: Arc::clone(&last_event),
            errors: Arc::clone(&errors),
            state_tx,
        };
        let task = tokio::spawn(worker.run(live, stop_rx, on_caught_up));

        SubscriptionHandle {
            stop_tx: Some(stop_tx),
            task,
            state_rx,
            position,
            last_event,
            errors,
        }
    }
}

/// Handle to a running subscription.
///
/// Dropping the handle does **not** stop the subscription. Call
/// [`stop`](Self::stop) for graceful shutdown.
pub struct SubscriptionHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    state_rx: watch::Receiver<SubscriptionState>,
    position: Arc<AtomicU64>,
    last_event: Arc<Mutex<Option<EventId>>>,
    errors: Arc<AtomicU64>,
}

impl SubscriptionHandle {
    #[must_use]
    pub fn state(&self) -> SubscriptionState {
        *self.state_rx.borrow()
    }

    /// Checkpoint: global position of the last processed event.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn last_processed_event_id(&self) -> Option<EventId> {
        *self
            .last_event
            .lock()
            .expect("subscription checkpoint lock poisoned")
    }

    /// Number of events that failed processing so far.
    #[must_use]
    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Wait until the subscription leaves the catch-up phase, returning
    /// the state it settled in ([`SubscriptionState::Running`] on success).
    pub async fn wait_until_live(&mut self) -> SubscriptionState {
        loop {
            let state = *self.state_rx.borrow();
            if state != SubscriptionState::CatchingUp {
                return state;
            }
            if self.state_rx.changed().await.is_err() {
                return *self.state_rx.borrow();
            }
        }
    }

    /// Stop the subscription and wait for its task to finish.
    ///
    /// Safe to call at any time; an in-flight handler invocation completes
    /// first. Projection state is untouched.
    pub async fn stop(mut self) -> SubscriptionState {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if self.task.await.is_err() {
            tracing::error!("subscription task panicked");
        }
        *self.state_rx.borrow()
    }
}

enum Exit {
    Stopped,
    Failed,
}

struct Worker<L, P>
where
    P: DurableProjectionStore,
{
    store: EventStore<L>,
    builder: Arc<ProjectionBuilder<P>>,
    config: SubscriptionConfig,
    on_error: Option<ErrorCallback<P::Error>>,
    on_applied: Option<AppliedCallback>,
    position: Arc<AtomicU64>,
    last_event: Arc<Mutex<Option<EventId>>>,
    errors: Arc<AtomicU64>,
    state_tx: watch::Sender<SubscriptionState>,
}

impl<L, P> Worker<L, P>
where
    L: DurableEventLog + 'static,
    P: DurableProjectionStore + 'static,
{
    async fn run(
        self,
        mut live: LiveFeed,
        mut stop_rx: oneshot::Receiver<()>,
        mut on_caught_up: Option<Box<dyn FnOnce() + Send>>,
    ) {
        if self.config.catch_up_on_start {
            if let Err(exit) = self.drain_history().await {
                self.finish(live, exit).await;
                return;
            }
        } else {
            // Live-only subscription: everything up to now counts as seen.
            let latest = self.store.latest_position().await;
            let checkpoint = self.position.load(Ordering::Relaxed).max(latest);
            self.position.store(checkpoint, Ordering::Relaxed);
        }

        let _ = self.state_tx.send(SubscriptionState::Running);
        if let Some(callback) = on_caught_up.take() {
            callback();
        }
        tracing::info!(
            position = self.position.load(Ordering::Relaxed),
            "subscription caught up, processing live events"
        );

        let exit = loop {
            tokio::select! {
                biased;
                _ = &mut stop_rx => {
                    tracing::debug!("subscription stop requested");
                    break Some(Exit::Stopped);
                }
                item = live.next() => match item {
                    Some(FeedItem::Event(event)) => {
                        let checkpoint = self.position.load(Ordering::Relaxed);
                        // Deduplicate the catch-up/live overlap by position.
                        if event.position <= checkpoint {
                            continue;
                        }
                        // A gap means the queue missed events; recover from
                        // the log rather than processing out of order.
                        if event.position > checkpoint + 1 {
                            match self.drain_history().await {
                                Ok(()) => continue,
                                Err(exit) => break Some(exit),
                            }
                        }
                        if let Err(exit) = self.process_one(&event).await {
                            break Some(exit);
                        }
                    }
                    Some(FeedItem::Lagged(skipped)) => {
                        tracing::warn!(skipped, "subscription lagged; re-reading from checkpoint");
                        if let Err(exit) = self.drain_history().await {
                            break Some(exit);
                        }
                    }
                    None => {
                        tracing::debug!("subscription feed closed");
                        break None;
                    }
                }
            }
        };

        match exit {
            Some(exit) => self.finish(live, exit).await,
            // The feed was deregistered out from under us; just record the
            // terminal state.
            None => {
                let _ = self.state_tx.send(SubscriptionState::Stopped);
            }
        }
    }

    async fn finish(&self, live: LiveFeed, exit: Exit) {
        live.unsubscribe().await;
        let state = match exit {
            Exit::Stopped => SubscriptionState::Stopped,
            Exit::Failed => SubscriptionState::Failed,
        };
        let _ = self.state_tx.send(state);
    }

    /// Replay history from the checkpoint until the log is exhausted.
    async fn drain_history(&self) -> Result<(), Exit> {
        loop {
            let from = self.position.load(Ordering::Relaxed);
            let batch = self.store.read_all_since(from, self.config.batch_size).await;
            for event in &batch.events {
                self.process_one(event).await?;
            }
            if batch.caught_up {
                return Ok(());
            }
        }
    }

    /// Process one event, honouring the error policy and retrying store
    /// failures with exponential backoff.
    async fn process_one(&self, event: &Arc<Event>) -> Result<(), Exit> {
        let mut attempt: u32 = 0;
        loop {
            match self.builder.process_event(event).await {
                Ok(_) => {
                    self.advance(event);
                    if let Some(callback) = &self.on_applied {
                        callback(event);
                    }
                    return Ok(());
                }
                Err(error @ ProjectionError::Handler { .. }) => {
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    if let Some(callback) = &self.on_error {
                        callback(event, &error);
                    }
                    match self.config.error_policy {
                        ErrorPolicy::SkipAndReport => {
                            tracing::warn!(
                                position = event.position,
                                "handler failed; skipping event"
                            );
                            self.advance(event);
                            return Ok(());
                        }
                        ErrorPolicy::HaltAndAlert => {
                            tracing::error!(
                                position = event.position,
                                "handler failed; halting subscription"
                            );
                            return Err(Exit::Failed);
                        }
                    }
                }
                Err(error @ ProjectionError::Store(_)) => {
                    attempt += 1;
                    if attempt >= self.config.max_attempts {
                        self.errors.fetch_add(1, Ordering::Relaxed);
                        if let Some(callback) = &self.on_error {
                            callback(event, &error);
                        }
                        tracing::error!(
                            position = event.position,
                            attempts = attempt,
                            error = %error,
                            "projection store failed; subscription fatal"
                        );
                        return Err(Exit::Failed);
                    }
                    let backoff = self.config.retry_backoff * 2u32.saturating_pow(attempt - 1);
                    tracing::warn!(
                        position = event.position,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "projection store failed; retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    fn advance(&self, event: &Event) {
        self.position.store(event.position, Ordering::Relaxed);
        *self
            .last_event
            .lock()
            .expect("subscription checkpoint lock poisoned") = Some(event.id);
    }
}
