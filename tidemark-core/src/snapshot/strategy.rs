//! Policies deciding when a snapshot should be taken.
//!
//! The manager consults one [`SnapshotStrategy`] after state has been
//! folded; stateful strategies (interval, adaptive) additionally get
//! notified when snapshots are stored and when streams are read, so they
//! can track per-entity activity.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};

use crate::event::{Event, StreamId};

/// What a strategy gets to look at when deciding.
pub struct StrategyContext<'a> {
    pub stream_id: &'a StreamId,
    pub current_version: u64,
    pub last_snapshot_version: Option<u64>,
    /// Events folded since the last snapshot (or since version 0).
    pub recent_events: &'a [Arc<Event>],
}

impl StrategyContext<'_> {
    fn events_since_snapshot(&self) -> u64 {
        self.current_version
            .saturating_sub(self.last_snapshot_version.unwrap_or(0))
    }
}

/// Decision seam for snapshot cadence.
pub trait SnapshotStrategy: Send + Sync {
    /// Tag recorded on snapshots this strategy approves.
    fn tag(&self) -> &'static str;

    fn should_snapshot(&self, ctx: &StrategyContext<'_>) -> bool;

    /// Notification that a snapshot was stored for `stream_id`.
    fn record_snapshot(&self, _stream_id: &StreamId, _version: u64) {}

    /// Notification that `stream_id` was read (reconstruction or snapshot
    /// lookup). Lets access-sensitive strategies track hot entities.
    fn record_access(&self, _stream_id: &StreamId) {}
}

/// Snapshot once at least `n` events have accumulated since the last one.
#[derive(Clone, Copy, Debug)]
pub struct EveryNEvents {
    threshold: u64,
}

impl EveryNEvents {
    #[must_use]
    pub const fn new(threshold: u64) -> Self {
        Self { threshold }
    }
}

impl SnapshotStrategy for EveryNEvents {
    fn tag(&self) -> &'static str {
        "every-n-events"
    }

    fn should_snapshot(&self, ctx: &StrategyContext<'_>) -> bool {
        ctx.events_since_snapshot() >= self.threshold
    }
}

/// Snapshot once the serialized size of the replayed suffix exceeds a byte
/// threshold.
#[derive(Clone, Copy, Debug)]
pub struct SerializedBytes {
    threshold: usize,
}

impl SerializedBytes {
    #[must_use]
    pub const fn new(threshold: usize) -> Self {
        Self { threshold }
    }

    fn suffix_bytes(events: &[Arc<Event>]) -> usize {
        events
            .iter()
            .map(|event| serde_json::to_vec(&**event).map_or(0, |b| b.len()))
            .sum()
    }
}

impl SnapshotStrategy for SerializedBytes {
    fn tag(&self) -> &'static str {
        "serialized-bytes"
    }

    fn should_snapshot(&self, ctx: &StrategyContext<'_>) -> bool {
        Self::suffix_bytes(ctx.recent_events) > self.threshold
    }
}

/// Snapshot when wall-clock time since the entity's last snapshot exceeds
/// an interval. Tracks a per-entity timestamp; an entity with no snapshot
/// yet is always due.
#[derive(Debug)]
pub struct Interval {
    interval: Duration,
    taken_at: Mutex<HashMap<StreamId, Instant>>,
}

impl Interval {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            taken_at: Mutex::new(HashMap::new()),
        }
    }
}

impl SnapshotStrategy for Interval {
    fn tag(&self) -> &'static str {
        "interval"
    }

    fn should_snapshot(&self, ctx: &StrategyContext<'_>) -> bool {
        let taken_at = self.taken_at.lock().expect("interval strategy lock poisoned");
        taken_at
            .get(ctx.stream_id)
            .is_none_or(|at| at.elapsed() > self.interval)
    }

    fn record_snapshot(&self, stream_id: &StreamId, _version: u64) {
        let mut taken_at = self.taken_at.lock().expect("interval strategy lock poisoned");
        taken_at.insert(stream_id.clone(), Instant::now());
    }
}

/// Tuning knobs for [`Adaptive`].
///
/// The defaults mirror common starting points and carry no particular
/// authority; deployments should treat them as configuration and tune
/// against observed replay cost.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    /// Threshold used when no pressure signal is active.
    pub base_frequency: u64,
    /// Floor for the effective threshold.
    pub min_frequency: u64,
    /// Ceiling for the effective threshold.
    pub max_frequency: u64,
    /// Weight of the prior observation in the moving averages; the
    /// remainder goes to the newest observation.
    pub smoothing: f64,
    /// Event rate (events/second) above which snapshots tighten.
    pub high_rate_per_sec: f64,
    /// Average serialized event size (bytes) above which snapshots tighten.
    pub large_event_bytes: f64,
    /// Accesses since the last snapshot above which snapshots tighten.
    pub hot_access_count: u64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            base_frequency: 100,
            min_frequency: 10,
            max_frequency: 500,
            smoothing: 0.7,
            high_rate_per_sec: 10.0,
            large_event_bytes: 4096.0,
            hot_access_count: 25,
        }
    }
}

#[derive(Default)]
struct AdaptiveState {
    ema_rate: Option<f64>,
    ema_size: Option<f64>,
    last_observed: Option<Instant>,
    accesses: u64,
}

impl AdaptiveState {
    fn blend(prior: Option<f64>, observation: f64, smoothing: f64) -> Option<f64> {
        Some(match prior {
            Some(prior) => smoothing * prior + (1.0 - smoothing) * observation,
            None => observation,
        })
    }
}

/// Tightens the frequency threshold for busy, bulky, or hot entities.
///
/// Keeps an exponential moving average of each entity's event rate and
/// average event size; a high rate, large events, or frequent access each
/// halve the effective threshold, clamped to
/// `[min_frequency, max_frequency]`.
#[derive(Debug, Default)]
pub struct Adaptive {
    config: AdaptiveConfig,
    state: Mutex<HashMap<StreamId, AdaptiveState>>,
}

impl std::fmt::Debug for AdaptiveState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveState")
            .field("ema_rate", &self.ema_rate)
            .field("ema_size", &self.ema_size)
            .field("accesses", &self.accesses)
            .finish_non_exhaustive()
    }
}

impl Adaptive {
    #[must_use]
    pub fn new(config: AdaptiveConfig) -> Self {
        Self {
            config,
            state: Mutex::new(HashMap::new()),
        }
    }

    fn effective_threshold(&self, state: &AdaptiveState) -> u64 {
        let mut threshold = self.config.base_frequency;
        if state.ema_rate.is_some_and(|rate| rate > self.config.high_rate_per_sec) {
            threshold /= 2;
        }
        if state.ema_size.is_some_and(|size| size > self.config.large_event_bytes) {
            threshold /= 2;
        }
        if state.accesses > self.config.hot_access_count {
            threshold /= 2;
        }
        threshold.clamp(self.config.min_frequency, self.config.max_frequency)
    }
}

impl SnapshotStrategy for Adaptive {
    fn tag(&self) -> &'static str {
        "adaptive"
    }

    fn should_snapshot(&self, ctx: &StrategyContext<'_>) -> bool {
        let mut states = self.state.lock().expect("adaptive strategy lock poisoned");
        let state = states.entry(ctx.stream_id.clone()).or_default();

        if !ctx.recent_events.is_empty() {
            let now = Instant::now();
            let observed = ctx.recent_events.len() as f64;
            let rate = match state.last_observed {
                Some(at) => {
                    let elapsed = now.duration_since(at).as_secs_f64();
                    if elapsed > 0.0 {
                        observed / elapsed
                    } else {
                        observed
                    }
                }
                // First observation: treat the suffix length as the rate.
                None => observed,
            };
            let avg_size = SerializedBytes::suffix_bytes(ctx.recent_events) as f64 / observed;

            state.last_observed = Some(now);
            state.ema_rate = AdaptiveState::blend(state.ema_rate, rate, self.config.smoothing);
            state.ema_size = AdaptiveState::blend(state.ema_size, avg_size, self.config.smoothing);
        }

        let threshold = self.effective_threshold(state);
        tracing::trace!(
            stream = %ctx.stream_id,
            threshold,
            events_since = ctx.events_since_snapshot(),
            "adaptive snapshot decision"
        );
        ctx.events_since_snapshot() >= threshold
    }

    fn record_snapshot(&self, stream_id: &StreamId, _version: u64) {
        let mut states = self.state.lock().expect("adaptive strategy lock poisoned");
        if let Some(state) = states.get_mut(stream_id) {
            state.accesses = 0;
        }
    }

    fn record_access(&self, stream_id: &StreamId) {
        let mut states = self.state.lock().expect("adaptive strategy lock poisoned");
        states.entry(stream_id.clone()).or_default().accesses += 1;
    }
}

/// How a [`Composite`] combines its children.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompositeMode {
    /// Snapshot when any child approves.
    Any,
    /// Snapshot only when every child approves.
    All,
}

/// Combines child strategies with [`CompositeMode`].
pub struct Composite {
    mode: CompositeMode,
    children: Vec<Box<dyn SnapshotStrategy>>,
}

impl Composite {
    #[must_use]
    pub fn new(mode: CompositeMode, children: Vec<Box<dyn SnapshotStrategy>>) -> Self {
        Self { mode, children }
    }
}

impl SnapshotStrategy for Composite {
    fn tag(&self) -> &'static str {
        "composite"
    }

    fn should_snapshot(&self, ctx: &StrategyContext<'_>) -> bool {
        match self.mode {
            CompositeMode::Any => self.children.iter().any(|c| c.should_snapshot(ctx)),
            CompositeMode::All => {
                !self.children.is_empty() && self.children.iter().all(|c| c.should_snapshot(ctx))
            }
        }
    }

    fn record_snapshot(&self, stream_id: &StreamId, version: u64) {
        for child in &self.children {
            child.record_snapshot(stream_id, version);
        }
    }

    fn record_access(&self, stream_id: &StreamId) {
        for child in &self.children {
            child.record_access(stream_id);
        }
    }
}
