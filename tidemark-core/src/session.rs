//! Sessions: the unit-of-work surface callers append through.
//!
//! An [`EventSession`] queues stream actions in memory and commits them as
//! one atomic batch. Two fetch-for-writing workflows are layered on top:
//! [`EventSession::fetch_for_writing`] captures the stream version for an
//! optimistic append, and [`ExclusiveStream`] holds the stream's row lock
//! from fetch until commit for serialized writers.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use nonempty::NonEmpty;
use serde_json::{Map, Value};

use crate::{
    action::StreamAction,
    aggregate::{Aggregate, fold_envelopes},
    append::{self, CommitSummary},
    envelope::PendingEvent,
    error::{AppendError, FetchError, ReadError},
    projection,
    storage::{EventStorage, LockMode, StorageError, StorageUnit},
    store::{EventStore, StoreConfig},
    stream::{StreamId, TenantId},
};

/// Ambient metadata shared by every event a session commits.
#[derive(Clone, Debug, Default)]
pub struct SessionContext {
    pub tenant: TenantId,
    /// Default causation for events that carry none of their own.
    pub causation_id: Option<String>,
    /// Stamped on every event of the session, unconditionally.
    pub correlation_id: Option<String>,
    /// Free-form headers, copied onto events when the store enables them.
    pub headers: Option<Map<String, Value>>,
}

impl SessionContext {
    #[must_use]
    pub fn for_tenant(tenant: TenantId) -> Self {
        Self {
            tenant,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_causation(mut self, id: impl Into<String>) -> Self {
        self.causation_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_correlation(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: Value) -> Self {
        self.headers
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }
}

/// A unit of work queuing appends against one tenant.
///
/// Nothing touches the store until [`commit`](Self::commit). Queuing twice
/// against the same stream merges into a single action so the batch carries
/// one contiguous version range per stream.
pub struct EventSession<'a, S: EventStorage> {
    store: &'a EventStore<S>,
    context: SessionContext,
    pending: Vec<StreamAction>,
}

impl<'a, S: EventStorage> EventSession<'a, S> {
    pub(crate) fn new(store: &'a EventStore<S>, context: SessionContext) -> Self {
        Self {
            store,
            context,
            pending: Vec::new(),
        }
    }

    #[must_use]
    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn set_causation(&mut self, id: impl Into<String>) -> &mut Self {
        self.context.causation_id = Some(id.into());
        self
    }

    pub fn set_correlation(&mut self, id: impl Into<String>) -> &mut Self {
        self.context.correlation_id = Some(id.into());
        self
    }

    pub fn set_header(&mut self, key: impl Into<String>, value: Value) -> &mut Self {
        self.context
            .headers
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }

    /// Actions queued so far, in commit order.
    #[must_use]
    pub fn pending_actions(&self) -> &[StreamAction] {
        &self.pending
    }

    /// Queue a raw action, merging with any queued action for the same
    /// stream.
    pub fn queue(&mut self, action: StreamAction) {
        match self
            .pending
            .iter_mut()
            .find(|queued| queued.stream() == action.stream())
        {
            Some(queued) => queued.merge(action),
            None => self.pending.push(action),
        }
    }

    /// Queue the start of a new stream. Fails at commit with a collision if
    /// the stream already exists.
    pub fn start_stream(&mut self, stream: StreamId, events: NonEmpty<PendingEvent>) {
        self.queue(StreamAction::start(stream, events));
    }

    /// Start a stream tagged with `A::KIND` so inline aggregate projections
    /// maintain its document.
    pub fn start_stream_for<A: Aggregate>(&mut self, stream: StreamId, events: NonEmpty<PendingEvent>) {
        self.queue(StreamAction::start(stream, events).for_aggregate(A::KIND));
    }

    /// Queue an append with no version expectation (last write wins).
    /// Appending to a stream that does not exist starts it.
    pub fn append(&mut self, stream: StreamId, events: Vec<PendingEvent>) {
        self.queue(StreamAction::append(stream, events));
    }

    /// Queue an append guarded by an optimistic version expectation.
    pub fn append_expecting(&mut self, stream: StreamId, expected: i64, events: Vec<PendingEvent>) {
        self.queue(StreamAction::append(stream, events).with_expected_version(expected));
    }

    /// Queue an append tagged with `A::KIND`.
    pub fn append_for<A: Aggregate>(
        &mut self,
        stream: StreamId,
        expected: i64,
        events: Vec<PendingEvent>,
    ) {
        self.queue(
            StreamAction::append(stream, events)
                .with_expected_version(expected)
                .for_aggregate(A::KIND),
        );
    }

    /// Load current aggregate state plus the version to append against.
    ///
    /// No lock is taken; a concurrent writer wins the race and this caller's
    /// subsequent [`append_fetched`](Self::append_fetched) commit fails with
    /// a version mismatch.
    pub async fn fetch_for_writing<A: Aggregate>(
        &self,
        stream: &StreamId,
    ) -> Result<FetchedStream<A>, ReadError<S::Error>> {
        let envelopes = self
            .store
            .resolved_stream(&self.context.tenant, stream)
            .await?;
        let version = envelopes.last().map_or(0, |envelope| envelope.version);
        let aggregate = fold_envelopes::<A>(&envelopes)?;
        Ok(FetchedStream {
            stream: stream.clone(),
            version,
            aggregate,
        })
    }

    /// Queue an append against the version captured at fetch time.
    pub fn append_fetched<A: Aggregate>(
        &mut self,
        fetched: &FetchedStream<A>,
        events: Vec<PendingEvent>,
    ) {
        self.queue(
            StreamAction::append(fetched.stream.clone(), events)
                .with_expected_version(fetched.version)
                .for_aggregate(A::KIND),
        );
    }

    /// Commit every queued action atomically.
    ///
    /// On success the session is empty again and may be reused; the caller
    /// re-fetches if it needs post-commit versions beyond the summary. On
    /// failure nothing was made durable and the queue is already drained, so
    /// a retry must re-queue.
    pub async fn commit(&mut self) -> Result<CommitSummary, AppendError<S::Error>> {
        let actions = std::mem::take(&mut self.pending);
        append::execute_batch(self.store.storage(), self.store.config(), &self.context, actions)
            .await
    }
}

/// Aggregate state captured for an optimistic append.
#[derive(Clone, Debug)]
pub struct FetchedStream<A> {
    pub stream: StreamId,
    /// Stream version at fetch time; the append expectation.
    pub version: i64,
    pub aggregate: A,
}

/// An aggregate fetched under an exclusive row lock.
///
/// The stream's metadata row stays locked from fetch until [`commit`]
/// consumes this value or it is dropped. Competing exclusive fetchers fail
/// fast with [`FetchError::StreamLocked`] instead of queueing behind the
/// lock.
///
/// [`commit`]: Self::commit
pub struct ExclusiveStream<'a, A, S: EventStorage> {
    store: &'a EventStore<S>,
    context: SessionContext,
    unit: S::Unit,
    stream: StreamId,
    version: i64,
    pub aggregate: A,
    pending: Vec<PendingEvent>,
}

impl<'a, A: Aggregate, S: EventStorage> ExclusiveStream<'a, A, S> {
    pub(crate) async fn acquire(
        store: &'a EventStore<S>,
        context: SessionContext,
        stream: StreamId,
    ) -> Result<Self, FetchError<S::Error>> {
        let mut unit = store
            .storage()
            .begin()
            .await
            .map_err(|err| FetchError::Read(ReadError::Store(err)))?;
        let meta = unit
            .read_stream(&context.tenant, &stream, LockMode::ForUpdate)
            .await
            .map_err(|err| {
                if err.is_lock_timeout() {
                    FetchError::StreamLocked {
                        stream: stream.clone(),
                    }
                } else {
                    FetchError::Read(ReadError::Store(err))
                }
            })?;

        let version = match &meta {
            Some(meta) if meta.is_archived => {
                return Err(FetchError::StreamArchived { stream });
            }
            Some(meta) => meta.version,
            None => 0,
        };

        // The row lock blocks concurrent appends, so reading committed
        // events outside the unit observes exactly `version` events.
        let envelopes = if version > 0 {
            store.resolved_stream(&context.tenant, &stream).await?
        } else {
            Vec::new()
        };
        let aggregate =
            fold_envelopes::<A>(&envelopes).map_err(|err| FetchError::Read(ReadError::Decode(err)))?;

        Ok(Self {
            store,
            context,
            unit,
            stream,
            version,
            aggregate,
            pending: Vec::new(),
        })
    }

    #[must_use]
    pub fn stream(&self) -> &StreamId {
        &self.stream
    }

    /// Version at fetch time; the version the commit will append against.
    #[must_use]
    pub fn version(&self) -> i64 {
        self.version
    }

    /// Stage events to append at commit.
    pub fn append(&mut self, events: impl IntoIterator<Item = PendingEvent>) {
        self.pending.extend(events);
    }

    /// Append the staged events and release the lock.
    ///
    /// With nothing staged this just releases the lock. The locked metadata
    /// row cannot have moved, so a version conflict here indicates a backend
    /// that did not honor the lock.
    pub async fn commit(self) -> Result<CommitSummary, AppendError<S::Error>> {
        let Self {
            store,
            context,
            unit,
            stream,
            version,
            pending,
            ..
        } = self;

        if pending.is_empty() {
            unit.commit().await.map_err(AppendError::Store)?;
            return Ok(CommitSummary::default());
        }

        let action = StreamAction::append(stream, pending)
            .with_expected_version(version)
            .for_aggregate(A::KIND);
        let total = action.event_count();
        let mut sequences = store
            .storage()
            .reserve_sequences(total)
            .await
            .map_err(AppendError::SequenceAllocation)?;
        if sequences.len() < total {
            return Err(AppendError::SequenceExhausted);
        }
        let reserved: Vec<i64> = sequences.iter().copied().collect();
        let timestamp = Utc::now();

        match commit_locked(unit, store.config(), &context, &action, version, timestamp, &mut sequences)
            .await
        {
            Ok(summary) => Ok(summary),
            Err(error) => {
                append::post_tombstones(store.storage(), &context, &reserved, timestamp).await;
                Err(error)
            }
        }
    }
}

async fn commit_locked<S: EventStorage>(
    mut unit: S::Unit,
    config: &StoreConfig<S>,
    context: &SessionContext,
    action: &StreamAction,
    current_version: i64,
    timestamp: DateTime<Utc>,
    sequences: &mut VecDeque<i64>,
) -> Result<CommitSummary, AppendError<S::Error>> {
    let prepared = if current_version == 0 {
        append::start_stream_in_unit(&mut unit, context, &config.metadata, action, timestamp, sequences)
            .await?
    } else {
        append::append_at(
            &mut unit,
            context,
            &config.metadata,
            action,
            current_version,
            timestamp,
            sequences,
        )
        .await?
    };

    let batch = vec![prepared];
    projection::run_inline(&config.projections, &batch, context, &mut unit).await?;
    unit.commit().await.map_err(AppendError::Store)?;

    let prepared = &batch[0];
    Ok(CommitSummary {
        events_appended: prepared.envelopes.len(),
        streams: vec![(prepared.stream.clone(), prepared.last_version())],
    })
}
