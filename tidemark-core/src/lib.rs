//! Core types and engines for the Tidemark event-sourcing library.
//!
//! This crate provides the storage core:
//!
//! - [`event`] - Event records, identifiers, and pre-storage validation
//! - [`store`] - [`store::EventStore`]: per-stream versioning, global
//!   ordering, optimistic appends, and the live subscription feed
//! - [`reconstruct`] - Snapshot-accelerated state reconstruction
//! - [`snapshot`] - Snapshot strategies, compression, cache, and manager
//! - [`projection`] - Read models and the [`projection::ProjectionBuilder`]
//! - [`subscription`] - Catch-up plus live projection subscriptions
//! - [`metrics`] - Counters sampled by external telemetry
//!
//! # Example
//!
//! ```
//! use tidemark_core::store::EventStore;
//!
//! // Create an in-memory store; everything else hangs off it.
//! let store = EventStore::new();
//! # let _ = store;
//! ```
//!
//! Most users should depend on the `tidemark` crate, which re-exports these
//! types with a cleaner API surface.

pub mod event;
pub mod metrics;
pub mod projection;
pub mod reconstruct;
pub mod snapshot;
pub mod store;
pub mod subscription;
