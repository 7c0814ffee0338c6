//! Read-side primitives.
//!
//! A [`Projection`] is a derived read model keyed by an id extracted from
//! each event (the stream id by default). The [`ProjectionBuilder`] is the
//! single writer of projection documents: handlers registered per event
//! kind fold events into new document versions, and a full rebuild replays
//! history from position 0. Documents live behind the
//! [`DurableProjectionStore`] boundary.

use std::{collections::HashMap, future::Future, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    event::{Event, EventId},
    metrics::ProjectionMetrics,
    store::{DurableEventLog, EventStore},
};

pub mod inmemory;

/// A versioned read-model document.
///
/// `version` increments once per successfully handled event; `data` is the
/// read-model payload and is only ever written by a [`ProjectionBuilder`].
/// Any document is fully rebuildable by replaying events from position 0.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Projection {
    pub id: String,
    pub version: u64,
    pub last_processed_event_id: Option<EventId>,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub data: serde_json::Value,
}

/// Filter for [`DurableProjectionStore::query`] and `count`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectionFilter {
    /// Match documents whose id starts with this prefix.
    pub id_prefix: Option<String>,
    /// Match documents whose `data` has these top-level fields equal to
    /// these values.
    pub data_equals: Vec<(String, serde_json::Value)>,
}

impl ProjectionFilter {
    /// Matches every document.
    #[must_use]
    pub fn any() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.id_prefix = Some(prefix.into());
        self
    }

    #[must_use]
    pub fn with_field(mut self, field: impl Into<String>, value: serde_json::Value) -> Self {
        self.data_equals.push((field.into(), value));
        self
    }

    #[must_use]
    pub fn matches(&self, projection: &Projection) -> bool {
        if let Some(prefix) = &self.id_prefix {
            if !projection.id.starts_with(prefix.as_str()) {
                return false;
            }
        }
        self.data_equals
            .iter()
            .all(|(field, value)| projection.data.get(field) == Some(value))
    }
}

/// Pagination window for [`DurableProjectionStore::query`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Page {
    #[must_use]
    pub const fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }

    /// The whole result set.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            offset: 0,
            limit: usize::MAX,
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

/// Persistence boundary for projection documents.
///
/// Each call is assumed atomic. Query results are ordered by document id so
/// pagination is stable.
pub trait DurableProjectionStore: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn get(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<Option<Projection>, Self::Error>> + Send + '_;

    fn save(
        &self,
        projection: Projection,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn delete(&self, id: &str) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

    fn query<'a>(
        &'a self,
        filter: &'a ProjectionFilter,
        page: &'a Page,
    ) -> impl Future<Output = Result<Vec<Projection>, Self::Error>> + Send + 'a;

    fn count<'a>(
        &'a self,
        filter: &'a ProjectionFilter,
    ) -> impl Future<Output = Result<usize, Self::Error>> + Send + 'a;
}

/// Error returned by a projection handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

type Handler = Box<
    dyn Fn(&Event, Option<&serde_json::Value>) -> Result<serde_json::Value, HandlerError>
        + Send
        + Sync,
>;

type IdExtractor = Box<dyn Fn(&Event) -> String + Send + Sync>;

/// Error from processing or rebuilding projections.
#[derive(Debug, Error)]
pub enum ProjectionError<E>
where
    E: std::error::Error + 'static,
{
    /// The projection store failed; the document was not touched.
    #[error("projection store failed: {0}")]
    Store(#[source] E),
    /// A registered handler rejected the event; the document was not
    /// touched.
    #[error("handler for `{kind}` failed on event {event_id}: {source}")]
    Handler {
        kind: String,
        event_id: EventId,
        #[source]
        source: HandlerError,
    },
}

/// Error from [`ProjectionBuilder::rebuild`].
#[derive(Debug, Error)]
pub enum RebuildError<E>
where
    E: std::error::Error + 'static,
{
    #[error(transparent)]
    Projection(#[from] ProjectionError<E>),
    /// The requested cut-off event does not exist in the log.
    #[error("cut-off event {0} not found in the event log")]
    UnknownCutOff(EventId),
}

/// What [`ProjectionBuilder::process_event`] did with an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// A handler ran and the document advanced one version.
    Applied,
    /// No handler is registered for the event's kind; no-op success.
    NoHandler,
}

/// Folds events into projection documents.
///
/// Handlers are pure functions `(event, current data) -> new data`,
/// registered explicitly per event kind at construction time and dispatched
/// through a hash map. The builder exclusively owns its projection store;
/// readers go through [`get`](Self::get)/[`query`](Self::query) and never
/// mutate documents directly.
pub struct ProjectionBuilder<P> {
    store: P,
    handlers: HashMap<String, Handler>,
    id_extractor: IdExtractor,
    metrics: Arc<ProjectionMetrics>,
}

impl<P> ProjectionBuilder<P>
where
    P: DurableProjectionStore,
{
    /// Builder over `store`, keying documents by stream id.
    #[must_use]
    pub fn new(store: P) -> Self {
        Self {
            store,
            handlers: HashMap::new(),
            id_extractor: Box::new(|event| event.stream_id.to_string()),
            metrics: Arc::new(ProjectionMetrics::default()),
        }
    }

    /// Register a handler for one event kind.
    ///
    /// The handler receives the event and the current document data
    /// (`None` the first time) and returns the replacement data. Handlers
    /// must be pure: rebuilds replay them against the same history and
    /// expect identical output.
    #[must_use]
    pub fn on<F>(mut self, kind: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Event, Option<&serde_json::Value>) -> Result<serde_json::Value, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(kind.into(), Box::new(handler));
        self
    }

    /// Derive document ids from something other than the stream id, e.g. a
    /// field of the payload for cross-entity roll-ups.
    #[must_use]
    pub fn with_id_extractor<F>(mut self, extractor: F) -> Self
    where
        F: Fn(&Event) -> String + Send + Sync + 'static,
    {
        self.id_extractor = Box::new(extractor);
        self
    }

    /// Apply one event to its projection document.
    ///
    /// Looks up the handler for `event.kind` (no-op success when none is
    /// registered), folds the current data through it, and persists the
    /// document with `version + 1` and the processed-event bookkeeping. A
    /// failed call writes nothing.
    ///
    /// # Errors
    ///
    /// [`ProjectionError::Handler`] when the handler rejects the event,
    /// [`ProjectionError::Store`] when the document cannot be loaded or
    /// saved.
    #[tracing::instrument(skip_all, fields(kind = %event.kind, position = event.position))]
    pub async fn process_event(
        &self,
        event: &Event,
    ) -> Result<ProcessOutcome, ProjectionError<P::Error>> {
        let Some(handler) = self.handlers.get(&event.kind) else {
            tracing::trace!(kind = %event.kind, "no handler registered, skipping");
            return Ok(ProcessOutcome::NoHandler);
        };

        let id = (self.id_extractor)(event);
        let current = self
            .store
            .get(&id)
            .await
            .map_err(ProjectionError::Store)?;

        let data = handler(event, current.as_ref().map(|p| &p.data)).map_err(|source| {
            self.metrics.record_handler_error();
            tracing::warn!(
                kind = %event.kind,
                event_id = %event.id,
                projection = %id,
                error = %source,
                "projection handler failed"
            );
            ProjectionError::Handler {
                kind: event.kind.clone(),
                event_id: event.id,
                source,
            }
        })?;

        let next = Projection {
            id,
            version: current.as_ref().map_or(0, |p| p.version) + 1,
            last_processed_event_id: Some(event.id),
            last_processed_at: Some(Utc::now()),
            data,
        };
        self.store
            .save(next)
            .await
            .map_err(ProjectionError::Store)?;
        self.metrics.record_processed();
        Ok(ProcessOutcome::Applied)
    }

    /// Delete and re-derive one document by replaying history in position
    /// order, optionally stopping after `up_to` (inclusive).
    ///
    /// Returns the number of events applied. Rebuilding is deterministic:
    /// two rebuilds over the same log produce identical `data`.
    ///
    /// # Errors
    ///
    /// [`RebuildError::UnknownCutOff`] when `up_to` is not in the log;
    /// otherwise the underlying [`ProjectionError`]. Handler errors abort
    /// the rebuild: skip policies belong to live subscriptions, not to
    /// re-derivation.
    #[tracing::instrument(skip_all, fields(projection = projection_id))]
    pub async fn rebuild<L>(
        &self,
        events: &EventStore<L>,
        projection_id: &str,
        up_to: Option<EventId>,
    ) -> Result<u64, RebuildError<P::Error>>
    where
        L: DurableEventLog,
    {
        let cut_off = match up_to {
            Some(id) => Some(
                events
                    .position_of(&id)
                    .await
                    .ok_or(RebuildError::UnknownCutOff(id))?,
            ),
            None => None,
        };

        self.store
            .delete(projection_id)
            .await
            .map_err(ProjectionError::Store)?;
        self.metrics.record_rebuild();

        let mut position = 0;
        let mut applied = 0;
        loop {
            let batch = events.read_all_since(position, 256).await;
            for event in &batch.events {
                if cut_off.is_some_and(|cut| event.position > cut) {
                    tracing::debug!(applied, "projection rebuilt up to cut-off");
                    return Ok(applied);
                }
                if (self.id_extractor)(event) == projection_id {
                    self.process_event(event).await?;
                    applied += 1;
                }
            }
            position = batch.next_position;
            if batch.caught_up {
                break;
            }
        }
        tracing::debug!(applied, "projection rebuilt");
        Ok(applied)
    }

    /// Read one document.
    ///
    /// # Errors
    ///
    /// Returns the store's error when the lookup fails.
    pub async fn get(&self, id: &str) -> Result<Option<Projection>, P::Error> {
        self.store.get(id).await
    }

    /// Query documents with a filter and pagination.
    ///
    /// # Errors
    ///
    /// Returns the store's error when the query fails.
    pub async fn query(
        &self,
        filter: &ProjectionFilter,
        page: &Page,
    ) -> Result<Vec<Projection>, P::Error> {
        self.store.query(filter, page).await
    }

    /// Count documents matching a filter.
    ///
    /// # Errors
    ///
    /// Returns the store's error when the count fails.
    pub async fn count(&self, filter: &ProjectionFilter) -> Result<usize, P::Error> {
        self.store.count(filter).await
    }

    /// Counters for external telemetry sampling.
    #[must_use]
    pub fn metrics(&self) -> &ProjectionMetrics {
        &self.metrics
    }
}
