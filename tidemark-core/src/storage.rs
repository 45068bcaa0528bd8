//! Storage contract consumed by the append pipeline.
//!
//! The core never talks to a database directly; it drives these narrow
//! interfaces: a durable sequence counter, a per-stream metadata record with
//! row-locking support, an append-only event log, and an aggregate-document
//! table for inline projections. A [`StorageUnit`] groups the writes of one
//! commit batch — everything staged into a unit becomes visible atomically at
//! [`StorageUnit::commit`], or not at all.

use std::{collections::VecDeque, future::Future};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    envelope::EventEnvelope,
    stream::{StreamId, StreamMeta, TenantId},
};

pub mod inmemory;

/// Backend error classification hooks.
///
/// The append pipeline needs to tell two backend failures apart from generic
/// transport errors: uniqueness violations (stream collisions) and lock-wait
/// timeouts (exclusive-mode contention). Backends map their native error
/// codes here; everything else surfaces as a generic store error.
pub trait StorageError: std::error::Error + Send + Sync + 'static {
    fn is_unique_violation(&self) -> bool;
    fn is_lock_timeout(&self) -> bool;
}

/// How a stream-metadata read should behave under concurrency.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    /// Plain read; optimistic callers re-validate the version later.
    Plain,
    /// Row-locking read held for the lifetime of the unit. Lock-wait
    /// timeouts surface through [`StorageError::is_lock_timeout`].
    ForUpdate,
}

/// Materialized aggregate state maintained by an inline projection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregateDoc {
    /// Aggregate kind, e.g. `"order"`.
    pub kind: String,
    pub tenant: TenantId,
    pub stream: StreamId,
    /// Stream version this document reflects.
    pub version: i64,
    /// Serialized aggregate state.
    pub data: serde_json::Value,
}

/// A transactional backing store for event streams.
///
/// Associated `Unit` is the open transaction type; it owns whatever it needs
/// (a pooled connection, a lock table entry) so no borrowed lifetimes leak
/// into the append pipeline.
pub trait EventStorage: Send + Sync {
    type Error: StorageError;
    type Unit: StorageUnit<Error = Self::Error> + Send;

    /// Reserve `count` distinct, strictly increasing, never-reused sequence
    /// values from the durable global counter.
    ///
    /// Reservation happens once per commit batch, before any rows are
    /// written. Abandoned reservations leave gaps; gaps are tolerated,
    /// duplicates are not.
    fn reserve_sequences(
        &self,
        count: usize,
    ) -> impl Future<Output = Result<VecDeque<i64>, Self::Error>> + Send + '_;

    /// Open a unit of work.
    fn begin(&self) -> impl Future<Output = Result<Self::Unit, Self::Error>> + Send + '_;

    /// Current version of a stream, or `None` when it does not exist.
    fn stream_version<'a>(
        &'a self,
        tenant: &'a TenantId,
        stream: &'a StreamId,
    ) -> impl Future<Output = Result<Option<i64>, Self::Error>> + Send + 'a;

    /// All committed events of one stream, in version order.
    fn fetch_stream<'a>(
        &'a self,
        tenant: &'a TenantId,
        stream: &'a StreamId,
    ) -> impl Future<Output = Result<Vec<EventEnvelope>, Self::Error>> + Send + 'a;

    /// Flip the archival flag. Returns `false` when the stream does not
    /// exist. Archival is terminal: every append path checks the flag.
    fn archive_stream<'a>(
        &'a self,
        tenant: &'a TenantId,
        stream: &'a StreamId,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a;

    /// Read a materialized aggregate document outside any unit of work.
    fn aggregate_doc<'a>(
        &'a self,
        kind: &'a str,
        tenant: &'a TenantId,
        stream: &'a StreamId,
    ) -> impl Future<Output = Result<Option<AggregateDoc>, Self::Error>> + Send + 'a;
}

/// One open unit of work against the backing store.
///
/// Reads observe committed state (plus this unit's own staged writes where
/// the backend supports it); writes become visible only at [`commit`].
/// Dropping a unit without committing discards everything and releases any
/// row locks it held.
///
/// [`commit`]: StorageUnit::commit
pub trait StorageUnit: Send + Sized {
    type Error: StorageError;

    /// Read the stream metadata record, optionally taking a row lock that is
    /// held until this unit commits or is dropped.
    fn read_stream<'a>(
        &'a mut self,
        tenant: &'a TenantId,
        stream: &'a StreamId,
        lock: LockMode,
    ) -> impl Future<Output = Result<Option<StreamMeta>, Self::Error>> + Send + 'a;

    /// Create the metadata record for a new stream. Fails with a uniqueness
    /// violation when the stream already exists.
    fn insert_stream<'a>(
        &'a mut self,
        meta: &'a StreamMeta,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

    /// Conditionally advance the stream version: the update applies only
    /// where the current version equals `expected` and the stream is not
    /// archived. Returns whether a row matched.
    fn update_stream_version<'a>(
        &'a mut self,
        tenant: &'a TenantId,
        stream: &'a StreamId,
        expected: i64,
        new_version: i64,
        last_modified: DateTime<Utc>,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a;

    /// Stage fully-prepared event rows for insertion.
    fn insert_events<'a>(
        &'a mut self,
        events: &'a [EventEnvelope],
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

    /// Read an aggregate document within this unit.
    fn read_aggregate<'a>(
        &'a mut self,
        kind: &'a str,
        tenant: &'a TenantId,
        stream: &'a StreamId,
    ) -> impl Future<Output = Result<Option<AggregateDoc>, Self::Error>> + Send + 'a;

    /// Stage an aggregate document write.
    fn upsert_aggregate(
        &mut self,
        doc: AggregateDoc,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

    /// Stage an aggregate document deletion.
    fn delete_aggregate<'a>(
        &'a mut self,
        kind: &'a str,
        tenant: &'a TenantId,
        stream: &'a StreamId,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

    /// Atomically apply every staged write.
    fn commit(self) -> impl Future<Output = Result<(), Self::Error>> + Send;
}
