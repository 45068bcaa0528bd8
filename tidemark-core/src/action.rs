//! In-memory staging of append operations.
//!
//! A [`StreamAction`] represents "append N events to stream S" within one
//! unit of work. Actions are created when a caller queues events, merged when
//! the same stream is touched twice in one session, and consumed exactly once
//! at commit, when [`StreamAction::prepare`] renders the pending events into
//! fully-prepared envelopes: versions, sequences, timestamps, and
//! causation/correlation metadata.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use nonempty::NonEmpty;
use uuid::Uuid;

use crate::{
    envelope::{EventEnvelope, PendingEvent},
    session::SessionContext,
    store::MetadataConfig,
    stream::StreamId,
};

/// What kind of append this action performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionType {
    /// The stream must not already exist.
    Start,
    /// Create-if-absent-or-append.
    Append,
}

/// One logical append operation against a single stream.
#[derive(Clone, Debug)]
pub struct StreamAction {
    stream: StreamId,
    action_type: ActionType,
    aggregate_type: Option<String>,
    expected_version: Option<i64>,
    events: Vec<PendingEvent>,
}

impl StreamAction {
    /// Stage the start of a new stream. Starting a stream requires at least
    /// one event, which the `NonEmpty` argument enforces at the boundary.
    #[must_use]
    pub fn start(stream: StreamId, events: NonEmpty<PendingEvent>) -> Self {
        Self {
            stream,
            action_type: ActionType::Start,
            aggregate_type: None,
            expected_version: None,
            events: events.into_iter().collect(),
        }
    }

    /// Stage a start from an unvalidated event list. Commit rejects an empty
    /// list before any I/O; prefer [`start`](Self::start), which rules the
    /// empty case out at the type level.
    #[must_use]
    pub fn start_unchecked(stream: StreamId, events: Vec<PendingEvent>) -> Self {
        Self {
            stream,
            action_type: ActionType::Start,
            aggregate_type: None,
            expected_version: None,
            events,
        }
    }

    /// Stage an append to an existing (or implicitly created) stream.
    #[must_use]
    pub fn append(stream: StreamId, events: Vec<PendingEvent>) -> Self {
        Self {
            stream,
            action_type: ActionType::Append,
            aggregate_type: None,
            expected_version: None,
            events,
        }
    }

    /// Supply an optimistic-concurrency expectation: the append fails unless
    /// the server-side version still equals `version` at commit time.
    #[must_use]
    pub fn with_expected_version(mut self, version: i64) -> Self {
        self.expected_version = Some(version);
        self
    }

    /// Tag the stream with an aggregate type so inline aggregate projections
    /// pick it up.
    #[must_use]
    pub fn for_aggregate(mut self, kind: impl Into<String>) -> Self {
        self.aggregate_type = Some(kind.into());
        self
    }

    #[must_use]
    pub fn stream(&self) -> &StreamId {
        &self.stream
    }

    #[must_use]
    pub fn action_type(&self) -> ActionType {
        self.action_type
    }

    #[must_use]
    pub fn aggregate_type(&self) -> Option<&str> {
        self.aggregate_type.as_deref()
    }

    #[must_use]
    pub fn expected_version(&self) -> Option<i64> {
        self.expected_version
    }

    #[must_use]
    pub fn events(&self) -> &[PendingEvent] {
        &self.events
    }

    #[must_use]
    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// Merge a second action against the same stream identity into this one.
    ///
    /// Two actions for the same stream in one unit of work become a single
    /// append with the events concatenated, preserving one version sequence.
    /// The first action's expectation and type win; a later `Start` upgrades
    /// an earlier `Append`.
    pub(crate) fn merge(&mut self, other: Self) {
        debug_assert_eq!(self.stream, other.stream);
        if other.action_type == ActionType::Start {
            self.action_type = ActionType::Start;
        }
        if self.expected_version.is_none() {
            self.expected_version = other.expected_version;
        }
        if self.aggregate_type.is_none() {
            self.aggregate_type = other.aggregate_type;
        }
        self.events.extend(other.events);
    }

    /// Render the pending events into fully-prepared envelopes against the
    /// observed server version.
    ///
    /// Versions are assigned `current_version + 1, +2, …` in the order events
    /// were queued; one sequence value is dequeued per event in the same
    /// order, tying sequence order to version order within the stream. Every
    /// envelope gets the shared batch `timestamp` and the session tenant;
    /// causation defaults to the session value when the event has none,
    /// correlation is always taken from the session, and headers are copied
    /// when enabled.
    pub(crate) fn prepare(
        &self,
        current_version: i64,
        sequences: &mut VecDeque<i64>,
        timestamp: DateTime<Utc>,
        context: &SessionContext,
        metadata: &MetadataConfig,
    ) -> Result<PreparedAction, PrepareError> {
        if let Some(expected) = self.expected_version
            && current_version != 0
            && expected != current_version
        {
            return Err(PrepareError::VersionMismatch {
                expected,
                actual: current_version,
            });
        }

        let mut envelopes = Vec::with_capacity(self.events.len());
        for (offset, pending) in self.events.iter().enumerate() {
            let sequence = sequences
                .pop_front()
                .ok_or(PrepareError::SequenceExhausted)?;
            envelopes.push(EventEnvelope {
                id: pending.id.unwrap_or_else(Uuid::new_v4),
                stream: self.stream.clone(),
                version: current_version + 1 + offset as i64,
                sequence,
                event_type: pending.event_type.clone(),
                type_name: pending.type_name.clone(),
                data: pending.data.clone(),
                timestamp,
                tenant: context.tenant.clone(),
                causation_id: pending
                    .causation_id
                    .clone()
                    .or_else(|| context.causation_id.clone()),
                correlation_id: context.correlation_id.clone(),
                headers: if metadata.headers_enabled {
                    context.headers.clone()
                } else {
                    None
                },
            });
        }

        Ok(PreparedAction {
            stream: self.stream.clone(),
            aggregate_type: self.aggregate_type.clone(),
            starting_version: current_version,
            envelopes,
        })
    }
}

/// A stream action after version and sequence assignment, ready for storage
/// and for inline projections.
#[derive(Clone, Debug)]
pub struct PreparedAction {
    pub stream: StreamId,
    pub aggregate_type: Option<String>,
    /// Server version the envelopes were prepared against.
    pub starting_version: i64,
    pub envelopes: Vec<EventEnvelope>,
}

impl PreparedAction {
    /// Stream version after these envelopes commit.
    #[must_use]
    pub fn last_version(&self) -> i64 {
        self.starting_version + self.envelopes.len() as i64
    }
}

/// Failure while rendering pending events into envelopes. Converted into the
/// public append error (with the stream attached) by the appender.
#[derive(Debug)]
pub(crate) enum PrepareError {
    VersionMismatch { expected: i64, actual: i64 },
    SequenceExhausted,
}
