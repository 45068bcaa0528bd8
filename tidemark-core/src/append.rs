//! The append pipeline: batch validation, sequence reservation, and the
//! rich/quick commit strategies.
//!
//! A commit batch runs in three phases. First the staged actions are
//! validated without I/O (tenancy, empty starts). Then one block of global
//! sequence values is reserved, sized to the whole batch. Finally a single
//! unit of work applies every action and every inline projection and commits
//! atomically. If anything fails after reservation, the reserved sequence
//! values are burned into tombstone events on a best-effort basis so
//! downstream consumers can account for the gap.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    action::{ActionType, PrepareError, PreparedAction, StreamAction},
    envelope::EventEnvelope,
    error::AppendError,
    projection,
    registry::{TOMBSTONE_ALIAS, TOMBSTONE_TYPE_NAME},
    session::SessionContext,
    storage::{EventStorage, LockMode, StorageUnit},
    store::{MetadataConfig, StoreConfig},
    stream::{StreamId, StreamMeta, TenancyStyle},
};

/// How appends to existing streams validate and advance the stream version.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AppendMode {
    /// Read the metadata row under a row lock, validate in memory, then
    /// conditionally bump the version. Full diagnostics on conflict.
    #[default]
    Rich,
    /// Skip the locked read when the caller supplies an expected version:
    /// issue the conditional bump directly and diagnose only on failure.
    /// An expectation of zero is checked with a plain read before the
    /// stream insert; appends without an expectation fall back to the rich
    /// path.
    Quick,
}

/// Outcome of a committed batch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommitSummary {
    /// Total events made durable across all streams.
    pub events_appended: usize,
    /// Post-commit version of each touched stream, in action order.
    pub streams: Vec<(StreamId, i64)>,
}

/// Validate, reserve, and commit one batch of stream actions.
#[tracing::instrument(
    skip_all,
    fields(actions = actions.len(), tenant = %context.tenant, mode = ?config.append_mode)
)]
pub(crate) async fn execute_batch<S: EventStorage>(
    storage: &S,
    config: &StoreConfig<S>,
    context: &SessionContext,
    actions: Vec<StreamAction>,
) -> Result<CommitSummary, AppendError<S::Error>> {
    if config.tenancy == TenancyStyle::Conjoined && context.tenant.is_default() {
        return Err(AppendError::TenantRequired);
    }

    let mut staged = Vec::with_capacity(actions.len());
    for action in actions {
        if action.events().is_empty() {
            if action.action_type() == ActionType::Start {
                return Err(AppendError::EmptyStreamStart {
                    stream: action.stream().clone(),
                });
            }
            // An empty append is a no-op, not an error.
            continue;
        }
        staged.push(action);
    }
    if staged.is_empty() {
        return Ok(CommitSummary::default());
    }

    let total: usize = staged.iter().map(StreamAction::event_count).sum();
    let mut sequences = storage
        .reserve_sequences(total)
        .await
        .map_err(AppendError::SequenceAllocation)?;
    if sequences.len() < total {
        return Err(AppendError::SequenceExhausted);
    }
    let reserved: Vec<i64> = sequences.iter().copied().collect();
    let timestamp = Utc::now();

    match commit_staged(storage, config, context, &staged, timestamp, &mut sequences).await {
        Ok(summary) => {
            tracing::debug!(
                events = summary.events_appended,
                streams = summary.streams.len(),
                "commit batch applied"
            );
            Ok(summary)
        }
        Err(error) => {
            post_tombstones(storage, context, &reserved, timestamp).await;
            Err(error)
        }
    }
}

async fn commit_staged<S: EventStorage>(
    storage: &S,
    config: &StoreConfig<S>,
    context: &SessionContext,
    staged: &[StreamAction],
    timestamp: DateTime<Utc>,
    sequences: &mut VecDeque<i64>,
) -> Result<CommitSummary, AppendError<S::Error>> {
    let mut unit = storage.begin().await.map_err(AppendError::Store)?;

    let mut prepared = Vec::with_capacity(staged.len());
    for action in staged {
        let applied = match config.append_mode {
            AppendMode::Rich => {
                apply_rich(&mut unit, context, &config.metadata, action, timestamp, sequences)
                    .await?
            }
            AppendMode::Quick => {
                apply_quick(&mut unit, context, &config.metadata, action, timestamp, sequences)
                    .await?
            }
        };
        prepared.push(applied);
    }

    projection::run_inline(&config.projections, &prepared, context, &mut unit).await?;
    unit.commit().await.map_err(AppendError::Store)?;

    Ok(CommitSummary {
        events_appended: prepared.iter().map(|p| p.envelopes.len()).sum(),
        streams: prepared
            .iter()
            .map(|p| (p.stream.clone(), p.last_version()))
            .collect(),
    })
}

/// Rich-mode application of one action: locked read, in-memory validation,
/// conditional version bump.
pub(crate) async fn apply_rich<U: StorageUnit>(
    unit: &mut U,
    context: &SessionContext,
    metadata: &MetadataConfig,
    action: &StreamAction,
    timestamp: DateTime<Utc>,
    sequences: &mut VecDeque<i64>,
) -> Result<PreparedAction, AppendError<U::Error>> {
    match action.action_type() {
        ActionType::Start => start_stream_in_unit(unit, context, metadata, action, timestamp, sequences).await,
        ActionType::Append => {
            let meta = unit
                .read_stream(&context.tenant, action.stream(), LockMode::ForUpdate)
                .await
                .map_err(|err| AppendError::from_locked_read(err, action.stream()))?;
            match meta {
                // Appending to a stream that does not exist yet starts it.
                None => start_stream_in_unit(unit, context, metadata, action, timestamp, sequences).await,
                Some(meta) if meta.is_archived => Err(AppendError::StreamArchived {
                    stream: action.stream().clone(),
                }),
                Some(meta) => {
                    append_at(unit, context, metadata, action, meta.version, timestamp, sequences)
                        .await
                }
            }
        }
    }
}

/// Quick-mode application: trust the caller's expected version and go
/// straight to the conditional bump, diagnosing only when it misses.
pub(crate) async fn apply_quick<U: StorageUnit>(
    unit: &mut U,
    context: &SessionContext,
    metadata: &MetadataConfig,
    action: &StreamAction,
    timestamp: DateTime<Utc>,
    sequences: &mut VecDeque<i64>,
) -> Result<PreparedAction, AppendError<U::Error>> {
    match (action.action_type(), action.expected_version()) {
        (ActionType::Start, _) => {
            start_stream_in_unit(unit, context, metadata, action, timestamp, sequences).await
        }
        // An expectation of zero means the stream must not exist yet. A
        // plain read classifies a stale expectation with the same
        // diagnostics the rich path gives, before any insert can fail the
        // unit.
        (ActionType::Append, Some(0)) => {
            let meta = unit
                .read_stream(&context.tenant, action.stream(), LockMode::Plain)
                .await
                .map_err(AppendError::Store)?;
            match meta {
                None => {
                    start_stream_in_unit(unit, context, metadata, action, timestamp, sequences)
                        .await
                }
                Some(meta) if meta.is_archived => Err(AppendError::StreamArchived {
                    stream: action.stream().clone(),
                }),
                Some(meta) => Err(AppendError::VersionMismatch {
                    stream: action.stream().clone(),
                    expected: 0,
                    actual: meta.version,
                }),
            }
        }
        (ActionType::Append, Some(expected)) => {
            append_at(unit, context, metadata, action, expected, timestamp, sequences).await
        }
        (ActionType::Append, None) => {
            apply_rich(unit, context, metadata, action, timestamp, sequences).await
        }
    }
}

/// Insert a new stream's metadata row and its first events.
pub(crate) async fn start_stream_in_unit<U: StorageUnit>(
    unit: &mut U,
    context: &SessionContext,
    metadata: &MetadataConfig,
    action: &StreamAction,
    timestamp: DateTime<Utc>,
    sequences: &mut VecDeque<i64>,
) -> Result<PreparedAction, AppendError<U::Error>> {
    if action.events().is_empty() {
        return Err(AppendError::EmptyStreamStart {
            stream: action.stream().clone(),
        });
    }
    let prepared = prepare_action(action, 0, sequences, timestamp, context, metadata)?;
    let meta = StreamMeta::starting(
        context.tenant.clone(),
        action.stream().clone(),
        prepared.last_version(),
        action.aggregate_type().map(str::to_owned),
        timestamp,
    );
    unit.insert_stream(&meta)
        .await
        .map_err(|err| AppendError::from_insert(err, action.stream()))?;
    unit.insert_events(&prepared.envelopes)
        .await
        .map_err(AppendError::Store)?;
    Ok(prepared)
}

/// Append against a known current version: prepare envelopes, conditionally
/// bump the metadata row, insert the event rows.
pub(crate) async fn append_at<U: StorageUnit>(
    unit: &mut U,
    context: &SessionContext,
    metadata: &MetadataConfig,
    action: &StreamAction,
    current_version: i64,
    timestamp: DateTime<Utc>,
    sequences: &mut VecDeque<i64>,
) -> Result<PreparedAction, AppendError<U::Error>> {
    let prepared = prepare_action(action, current_version, sequences, timestamp, context, metadata)?;
    let matched = unit
        .update_stream_version(
            &context.tenant,
            action.stream(),
            current_version,
            prepared.last_version(),
            timestamp,
        )
        .await
        .map_err(AppendError::Store)?;
    if !matched {
        return Err(diagnose_failed_bump(unit, context, action.stream(), current_version).await);
    }
    unit.insert_events(&prepared.envelopes)
        .await
        .map_err(AppendError::Store)?;
    Ok(prepared)
}

fn prepare_action<E: crate::storage::StorageError>(
    action: &StreamAction,
    current_version: i64,
    sequences: &mut VecDeque<i64>,
    timestamp: DateTime<Utc>,
    context: &SessionContext,
    metadata: &MetadataConfig,
) -> Result<PreparedAction, AppendError<E>> {
    action
        .prepare(current_version, sequences, timestamp, context, metadata)
        .map_err(|err| match err {
            PrepareError::VersionMismatch { expected, actual } => AppendError::VersionMismatch {
                stream: action.stream().clone(),
                expected,
                actual,
            },
            PrepareError::SequenceExhausted => AppendError::SequenceExhausted,
        })
}

/// Re-read the metadata row to explain why a conditional bump matched
/// nothing.
async fn diagnose_failed_bump<U: StorageUnit>(
    unit: &mut U,
    context: &SessionContext,
    stream: &StreamId,
    expected: i64,
) -> AppendError<U::Error> {
    match unit.read_stream(&context.tenant, stream, LockMode::Plain).await {
        Err(err) => AppendError::Store(err),
        Ok(None) => AppendError::VersionMismatch {
            stream: stream.clone(),
            expected,
            actual: 0,
        },
        Ok(Some(meta)) if meta.is_archived => AppendError::StreamArchived {
            stream: stream.clone(),
        },
        Ok(Some(meta)) => AppendError::VersionMismatch {
            stream: stream.clone(),
            expected,
            actual: meta.version,
        },
    }
}

/// Burn abandoned sequence values into the tombstone stream.
///
/// Best-effort: posting runs in its own unit of work after the failed commit
/// has been discarded, and a failure here is logged, never surfaced. The
/// original append error is what the caller sees either way.
pub(crate) async fn post_tombstones<S: EventStorage>(
    storage: &S,
    context: &SessionContext,
    sequences: &[i64],
    timestamp: DateTime<Utc>,
) {
    if sequences.is_empty() {
        return;
    }
    if let Err(error) = try_post_tombstones(storage, context, sequences, timestamp).await {
        tracing::warn!(
            %error,
            count = sequences.len(),
            "failed to post tombstone events; the sequence gap will remain"
        );
    }
}

async fn try_post_tombstones<S: EventStorage>(
    storage: &S,
    context: &SessionContext,
    sequences: &[i64],
    timestamp: DateTime<Utc>,
) -> Result<(), S::Error> {
    let stream = StreamId::tombstone();
    let mut unit = storage.begin().await?;
    let meta = unit
        .read_stream(&context.tenant, &stream, LockMode::ForUpdate)
        .await?;
    let base = meta.as_ref().map_or(0, |m| m.version);

    let envelopes: Vec<EventEnvelope> = sequences
        .iter()
        .enumerate()
        .map(|(offset, sequence)| EventEnvelope {
            id: Uuid::new_v4(),
            stream: stream.clone(),
            version: base + 1 + offset as i64,
            sequence: *sequence,
            event_type: TOMBSTONE_ALIAS.to_owned(),
            type_name: TOMBSTONE_TYPE_NAME.to_owned(),
            data: serde_json::json!({}),
            timestamp,
            tenant: context.tenant.clone(),
            causation_id: None,
            correlation_id: context.correlation_id.clone(),
            headers: None,
        })
        .collect();
    let new_version = base + envelopes.len() as i64;

    match meta {
        None => {
            let starting = StreamMeta::starting(
                context.tenant.clone(),
                stream.clone(),
                new_version,
                None,
                timestamp,
            );
            unit.insert_stream(&starting).await?;
        }
        Some(meta) => {
            unit.update_stream_version(&context.tenant, &stream, meta.version, new_version, timestamp)
                .await?;
        }
    }
    unit.insert_events(&envelopes).await?;
    unit.commit().await
}
