//! In-memory storage backend for tests and examples.
//!
//! [`InMemoryStorage`] implements the full [`EventStorage`] contract: a
//! process-local atomic sequence counter, stream metadata with emulated row
//! locks, and a unit of work that stages every write and applies the whole
//! batch under one lock at commit — so atomicity behaves like a real
//! transactional backend.
//!
//! # Example
//!
//! ```
//! use tidemark_core::storage::inmemory::InMemoryStorage;
//!
//! let storage = InMemoryStorage::new();
//! ```

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicI64, Ordering},
    },
};

use chrono::{DateTime, Utc};

use crate::{
    envelope::EventEnvelope,
    storage::{AggregateDoc, EventStorage, LockMode, StorageError, StorageUnit},
    stream::{StreamId, StreamMeta, TenantId},
};

type StreamKey = (TenantId, String);
type DocKey = (String, TenantId, String);

/// Error type for the in-memory backend.
#[derive(Clone, Debug, thiserror::Error)]
pub enum InMemoryError {
    #[error("unique violation: {0}")]
    UniqueViolation(String),
    #[error("lock timeout on stream {0}")]
    LockTimeout(String),
    #[error("commit conflict: {0}")]
    Conflict(String),
}

impl StorageError for InMemoryError {
    fn is_unique_violation(&self) -> bool {
        matches!(self, Self::UniqueViolation(_))
    }

    fn is_lock_timeout(&self) -> bool {
        matches!(self, Self::LockTimeout(_))
    }
}

#[derive(Default)]
struct State {
    streams: HashMap<StreamKey, StreamMeta>,
    events: Vec<EventEnvelope>,
    aggregates: HashMap<DocKey, AggregateDoc>,
}

#[derive(Default)]
struct Inner {
    sequence: AtomicI64,
    state: Mutex<State>,
    /// Streams currently row-locked by an open unit.
    locks: Mutex<HashSet<StreamKey>>,
}

/// Thread-safe in-memory event storage.
///
/// Row locks are emulated fail-fast: a unit that finds a stream's row held
/// by another open unit errors with a lock timeout immediately instead of
/// blocking. Truly concurrent writers to one stream may therefore see
/// `StreamLocked` where PostgreSQL would briefly queue them, and must retry.
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    inner: Arc<Inner>,
}

impl InMemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every committed event across all streams, in global sequence order.
    ///
    /// Test hook for asserting sequence invariants.
    #[must_use]
    pub fn all_events(&self) -> Vec<EventEnvelope> {
        let state = self.inner.state.lock().expect("in-memory store lock poisoned");
        let mut events = state.events.clone();
        events.sort_by_key(|e| e.sequence);
        events
    }
}

fn stream_key(tenant: &TenantId, stream: &StreamId) -> StreamKey {
    (tenant.clone(), stream.to_string())
}

impl EventStorage for InMemoryStorage {
    type Error = InMemoryError;
    type Unit = InMemoryUnit;

    async fn reserve_sequences(&self, count: usize) -> Result<VecDeque<i64>, Self::Error> {
        let count = i64::try_from(count)
            .map_err(|_| InMemoryError::Conflict("sequence block too large".to_owned()))?;
        let start = self.inner.sequence.fetch_add(count, Ordering::SeqCst);
        Ok((start + 1..=start + count).collect())
    }

    async fn begin(&self) -> Result<Self::Unit, Self::Error> {
        Ok(InMemoryUnit {
            inner: Arc::clone(&self.inner),
            staged_streams: Vec::new(),
            staged_bumps: Vec::new(),
            staged_events: Vec::new(),
            staged_docs: Vec::new(),
            held_locks: Vec::new(),
        })
    }

    async fn stream_version(
        &self,
        tenant: &TenantId,
        stream: &StreamId,
    ) -> Result<Option<i64>, Self::Error> {
        let state = self.inner.state.lock().expect("in-memory store lock poisoned");
        Ok(state
            .streams
            .get(&stream_key(tenant, stream))
            .map(|meta| meta.version))
    }

    async fn fetch_stream(
        &self,
        tenant: &TenantId,
        stream: &StreamId,
    ) -> Result<Vec<EventEnvelope>, Self::Error> {
        let state = self.inner.state.lock().expect("in-memory store lock poisoned");
        let mut events: Vec<_> = state
            .events
            .iter()
            .filter(|e| e.tenant == *tenant && e.stream == *stream)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.version);
        Ok(events)
    }

    async fn archive_stream(
        &self,
        tenant: &TenantId,
        stream: &StreamId,
    ) -> Result<bool, Self::Error> {
        let mut state = self.inner.state.lock().expect("in-memory store lock poisoned");
        match state.streams.get_mut(&stream_key(tenant, stream)) {
            Some(meta) => {
                meta.is_archived = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn aggregate_doc(
        &self,
        kind: &str,
        tenant: &TenantId,
        stream: &StreamId,
    ) -> Result<Option<AggregateDoc>, Self::Error> {
        let state = self.inner.state.lock().expect("in-memory store lock poisoned");
        Ok(state
            .aggregates
            .get(&(kind.to_owned(), tenant.clone(), stream.to_string()))
            .cloned())
    }
}

struct Bump {
    key: StreamKey,
    expected: i64,
    new_version: i64,
    last_modified: DateTime<Utc>,
}

enum DocWrite {
    Upsert(AggregateDoc),
    Delete(DocKey),
}

/// Unit of work over the in-memory state.
///
/// Writes are staged locally and applied under one state lock at commit.
/// Emulated row locks are released when the unit is dropped.
pub struct InMemoryUnit {
    inner: Arc<Inner>,
    staged_streams: Vec<StreamMeta>,
    staged_bumps: Vec<Bump>,
    staged_events: Vec<EventEnvelope>,
    staged_docs: Vec<DocWrite>,
    held_locks: Vec<StreamKey>,
}

impl InMemoryUnit {
    fn acquire_lock(&mut self, key: StreamKey) -> Result<(), InMemoryError> {
        let mut locks = self.inner.locks.lock().expect("in-memory store lock poisoned");
        if self.held_locks.contains(&key) {
            return Ok(());
        }
        if locks.contains(&key) {
            // Another open unit holds the row; a real backend would block and
            // eventually hit its lock-wait timeout.
            return Err(InMemoryError::LockTimeout(key.1));
        }
        locks.insert(key.clone());
        self.held_locks.push(key);
        Ok(())
    }
}

impl Drop for InMemoryUnit {
    fn drop(&mut self) {
        if self.held_locks.is_empty() {
            return;
        }
        let mut locks = self.inner.locks.lock().expect("in-memory store lock poisoned");
        for key in self.held_locks.drain(..) {
            locks.remove(&key);
        }
    }
}

impl StorageUnit for InMemoryUnit {
    type Error = InMemoryError;

    async fn read_stream(
        &mut self,
        tenant: &TenantId,
        stream: &StreamId,
        lock: LockMode,
    ) -> Result<Option<StreamMeta>, Self::Error> {
        let key = stream_key(tenant, stream);
        if lock == LockMode::ForUpdate {
            self.acquire_lock(key.clone())?;
        }
        let state = self.inner.state.lock().expect("in-memory store lock poisoned");
        Ok(state.streams.get(&key).cloned())
    }

    async fn insert_stream(&mut self, meta: &StreamMeta) -> Result<(), Self::Error> {
        let key = stream_key(&meta.tenant, &meta.stream);
        let exists = {
            let state = self.inner.state.lock().expect("in-memory store lock poisoned");
            state.streams.contains_key(&key)
        };
        if exists
            || self
                .staged_streams
                .iter()
                .any(|m| stream_key(&m.tenant, &m.stream) == key)
        {
            return Err(InMemoryError::UniqueViolation(key.1));
        }
        self.staged_streams.push(meta.clone());
        Ok(())
    }

    async fn update_stream_version(
        &mut self,
        tenant: &TenantId,
        stream: &StreamId,
        expected: i64,
        new_version: i64,
        last_modified: DateTime<Utc>,
    ) -> Result<bool, Self::Error> {
        let key = stream_key(tenant, stream);
        let matched = {
            let state = self.inner.state.lock().expect("in-memory store lock poisoned");
            state
                .streams
                .get(&key)
                .is_some_and(|meta| meta.version == expected && !meta.is_archived)
        };
        if matched {
            self.staged_bumps.push(Bump {
                key,
                expected,
                new_version,
                last_modified,
            });
        }
        Ok(matched)
    }

    async fn insert_events(&mut self, events: &[EventEnvelope]) -> Result<(), Self::Error> {
        self.staged_events.extend_from_slice(events);
        Ok(())
    }

    async fn read_aggregate(
        &mut self,
        kind: &str,
        tenant: &TenantId,
        stream: &StreamId,
    ) -> Result<Option<AggregateDoc>, Self::Error> {
        let key: DocKey = (kind.to_owned(), tenant.clone(), stream.to_string());
        // Read-your-writes within the unit.
        for write in self.staged_docs.iter().rev() {
            match write {
                DocWrite::Upsert(doc)
                    if doc.kind == key.0 && doc.tenant == key.1 && doc.stream.to_string() == key.2 =>
                {
                    return Ok(Some(doc.clone()));
                }
                DocWrite::Delete(k) if *k == key => return Ok(None),
                _ => {}
            }
        }
        let state = self.inner.state.lock().expect("in-memory store lock poisoned");
        Ok(state.aggregates.get(&key).cloned())
    }

    async fn upsert_aggregate(&mut self, doc: AggregateDoc) -> Result<(), Self::Error> {
        self.staged_docs.push(DocWrite::Upsert(doc));
        Ok(())
    }

    async fn delete_aggregate(
        &mut self,
        kind: &str,
        tenant: &TenantId,
        stream: &StreamId,
    ) -> Result<(), Self::Error> {
        self.staged_docs
            .push(DocWrite::Delete((kind.to_owned(), tenant.clone(), stream.to_string())));
        Ok(())
    }

    async fn commit(mut self) -> Result<(), Self::Error> {
        let mut state = self.inner.state.lock().expect("in-memory store lock poisoned");

        // Validate everything before touching state: all or nothing.
        for meta in &self.staged_streams {
            let key = stream_key(&meta.tenant, &meta.stream);
            if state.streams.contains_key(&key) {
                return Err(InMemoryError::UniqueViolation(key.1));
            }
        }
        for bump in &self.staged_bumps {
            let current = state.streams.get(&bump.key);
            let ok = current.is_some_and(|meta| meta.version == bump.expected && !meta.is_archived);
            if !ok {
                return Err(InMemoryError::Conflict(format!(
                    "stream {} moved past version {}",
                    bump.key.1, bump.expected
                )));
            }
        }
        for event in &self.staged_events {
            let duplicate = state.events.iter().any(|e| {
                e.tenant == event.tenant && e.stream == event.stream && e.version == event.version
            });
            if duplicate {
                return Err(InMemoryError::UniqueViolation(format!(
                    "{}@{}",
                    event.stream, event.version
                )));
            }
        }

        for meta in self.staged_streams.drain(..) {
            state
                .streams
                .insert(stream_key(&meta.tenant, &meta.stream), meta);
        }
        for bump in self.staged_bumps.drain(..) {
            if let Some(meta) = state.streams.get_mut(&bump.key) {
                meta.version = bump.new_version;
                meta.last_modified = bump.last_modified;
            }
        }
        state.events.append(&mut self.staged_events);
        for write in self.staged_docs.drain(..) {
            match write {
                DocWrite::Upsert(doc) => {
                    let key = (doc.kind.clone(), doc.tenant.clone(), doc.stream.to_string());
                    state.aggregates.insert(key, doc);
                }
                DocWrite::Delete(key) => {
                    state.aggregates.remove(&key);
                }
            }
        }
        Ok(())
    }
}
