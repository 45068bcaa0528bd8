//! Core append-and-projection engine for the Tidemark event store.
//!
//! This crate provides the backend-agnostic write pipeline:
//!
//! - [`stream`] - Stream identity, tenancy, and stream metadata
//! - [`envelope`] - Pending events and stored event envelopes
//! - [`registry`] - Event alias registry and typed decoding
//! - [`aggregate`] - Aggregate state folded from stream events
//! - [`action`] - Staged append operations and envelope preparation
//! - [`append`] - Batch commit pipeline, rich/quick strategies, tombstones
//! - [`projection`] - Inline projections applied in the commit's unit of work
//! - [`session`] - Unit-of-work sessions and fetch-for-writing workflows
//! - [`store`] - The configured [`EventStore`](store::EventStore) facade
//! - [`storage`] - Backend traits plus an in-memory implementation
//! - [`error`] - The append/read/fetch error taxonomy
//!
//! # Example
//!
//! ```
//! use tidemark_core::{
//!     registry::EventRegistry,
//!     storage::inmemory::InMemoryStorage,
//!     store::{EventStore, StoreConfig},
//! };
//!
//! let store = EventStore::new(
//!     InMemoryStorage::default(),
//!     StoreConfig::new(EventRegistry::new()),
//! );
//! let session = store.session();
//! # drop(session);
//! ```
//!
//! Most users should depend on the `tidemark` crate, which re-exports these
//! types together with the Postgres backend.

pub mod action;
pub mod aggregate;
pub mod append;
pub mod envelope;
pub mod error;
pub mod projection;
pub mod registry;
pub mod session;
pub mod storage;
pub mod store;
pub mod stream;
