#![doc = include_str!("../README.md")]

pub use tidemark_core::{
    event,
    event::{Event, EventId, MalformedEvent, Metadata, NewEvent, StreamId},
    metrics,
    reconstruct,
    reconstruct::{Aggregate, Reconstructed, Reconstructor},
    subscription,
    subscription::{
        ErrorPolicy, ProjectionSubscription, SubscriptionConfig, SubscriptionHandle,
        SubscriptionState,
    },
};

pub mod store {
    pub use tidemark_core::store::{
        feed::{DeliveryPolicy, FeedItem, LiveFeed, SubscriberHandle},
        AppendError, AppendReceipt, DurableEventLog, EventStore, Expected, HydrateError,
        NoDurableLog, NonEmpty, ReadBatch, VersionConflict,
    };
}

pub mod snapshot {
    pub use tidemark_core::snapshot::{
        cache::{CacheConfig, SnapshotCache},
        compress::{CompressError, Compressor, NoopCompressor, ZstdCompressor},
        inmemory,
        manager::{SnapshotManager, SnapshotOutcome},
        strategy::{
            Adaptive, AdaptiveConfig, Composite, CompositeMode, EveryNEvents, Interval,
            SerializedBytes, SnapshotStrategy, StrategyContext,
        },
        CompressedSnapshot, DurableSnapshotStore, Snapshot, SnapshotError,
    };
}

pub mod projection {
    pub use tidemark_core::projection::{
        inmemory, DurableProjectionStore, HandlerError, Page, ProcessOutcome, Projection,
        ProjectionBuilder, ProjectionError, ProjectionFilter, RebuildError,
    };
}
