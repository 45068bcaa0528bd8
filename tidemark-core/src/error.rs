//! Append and read error taxonomy.
//!
//! Every error propagates to the caller; nothing is swallowed. The append
//! variants carry the stream identity and, for version conflicts, both the
//! expected and observed versions so callers can decide whether to retry.

use thiserror::Error;

use crate::{
    projection::ProjectionError,
    registry::EventDecodeError,
    storage::StorageError,
    stream::StreamId,
};

/// Error from committing a batch of stream actions.
///
/// Generic over the backend error type, like the storage traits themselves.
/// A failed append leaves every stream's durable version unchanged: commits
/// are all-or-nothing per batch.
#[derive(Debug, Error)]
pub enum AppendError<E: StorageError> {
    /// `Start` was called with zero events; rejected before any I/O.
    #[error("cannot start stream {stream} with zero events")]
    EmptyStreamStart { stream: StreamId },

    /// `Start` against an identity that already has a metadata row.
    #[error("stream {stream} already exists (hint: append instead of starting it)")]
    StreamCollision { stream: StreamId },

    /// The caller's expected version disagrees with the server version.
    #[error(
        "stream {stream}: expected version {expected}, found {actual} (hint: reload and retry)"
    )]
    VersionMismatch {
        stream: StreamId,
        expected: i64,
        actual: i64,
    },

    /// Append attempted against an archived stream; terminal, never retried.
    #[error("stream {stream} is archived and accepts no further events")]
    StreamArchived { stream: StreamId },

    /// Exclusive-mode lock contention or lock-wait timeout, distinguishable
    /// from generic transport failures so callers may retry with backoff.
    #[error("stream {stream} is locked by another writer (hint: retry with backoff)")]
    StreamLocked { stream: StreamId },

    /// Conjoined tenancy requires a non-default tenant on every session.
    #[error("a tenant id is required under conjoined tenancy")]
    TenantRequired,

    /// Reserving the global sequence block failed; the whole commit aborts
    /// before any rows are written.
    #[error("failed to reserve event sequence block: {0}")]
    SequenceAllocation(#[source] E),

    /// The backend returned fewer sequence values than requested.
    #[error("reserved sequence block exhausted before all events were assigned")]
    SequenceExhausted,

    /// An inline projection failed; the whole batch rolls back.
    #[error("inline projection `{projection}` failed: {source}")]
    Projection {
        projection: &'static str,
        #[source]
        source: ProjectionError,
    },

    /// Generic backend failure during the commit.
    #[error("store error: {0}")]
    Store(#[source] E),
}

impl<E: StorageError> AppendError<E> {
    /// Classify a backend error from a stream-metadata insert.
    pub(crate) fn from_insert(err: E, stream: &StreamId) -> Self {
        if err.is_unique_violation() {
            Self::StreamCollision {
                stream: stream.clone(),
            }
        } else {
            Self::Store(err)
        }
    }

    /// Classify a backend error from a locked stream-metadata read.
    pub(crate) fn from_locked_read(err: E, stream: &StreamId) -> Self {
        if err.is_lock_timeout() {
            Self::StreamLocked {
                stream: stream.clone(),
            }
        } else {
            Self::Store(err)
        }
    }
}

/// Error from reading a stream back out of the store.
#[derive(Debug, Error)]
pub enum ReadError<E: StorageError> {
    /// A stored alias could not be resolved to a registered payload type,
    /// not even through the type-name fallback.
    #[error("unknown event type alias `{alias}` (type name `{type_name}`)")]
    UnknownEventType { alias: String, type_name: String },

    /// Alias resolved, but the payload failed typed decoding.
    #[error(transparent)]
    Decode(#[from] EventDecodeError),

    #[error("store error: {0}")]
    Store(#[source] E),
}

/// Error from the exclusive fetch-for-writing workflow.
#[derive(Debug, Error)]
pub enum FetchError<E: StorageError> {
    /// Another exclusive writer holds the stream's row lock.
    #[error("stream {stream} is locked by another writer (hint: retry with backoff)")]
    StreamLocked { stream: StreamId },

    #[error("stream {stream} is archived and accepts no further events")]
    StreamArchived { stream: StreamId },

    #[error(transparent)]
    Read(#[from] ReadError<E>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::inmemory::InMemoryError;

    #[test]
    fn version_mismatch_names_stream_and_both_versions() {
        let err: AppendError<InMemoryError> = AppendError::VersionMismatch {
            stream: StreamId::key("s3"),
            expected: 3,
            actual: 4,
        };
        let msg = err.to_string();
        assert!(msg.contains("s3"));
        assert!(msg.contains('3'));
        assert!(msg.contains('4'));
        assert!(msg.contains("retry"));
    }

    #[test]
    fn locked_read_classification_distinguishes_lock_timeouts() {
        let stream = StreamId::key("s1");
        let locked = AppendError::from_locked_read(
            InMemoryError::LockTimeout("s1".to_owned()),
            &stream,
        );
        assert!(matches!(locked, AppendError::StreamLocked { .. }));

        let other = AppendError::from_locked_read(
            InMemoryError::Conflict("broken".to_owned()),
            &stream,
        );
        assert!(matches!(other, AppendError::Store(_)));
    }

    #[test]
    fn insert_classification_distinguishes_collisions() {
        let stream = StreamId::key("s1");
        let collision = AppendError::from_insert(
            InMemoryError::UniqueViolation("s1".to_owned()),
            &stream,
        );
        assert!(matches!(collision, AppendError::StreamCollision { .. }));
    }
}
