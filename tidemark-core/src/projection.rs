//! Inline projections, applied in the same unit of work as the append.
//!
//! An inline projection sees the prepared envelopes of a commit batch before
//! the batch is durable and stages its own writes into the same
//! [`StorageUnit`](crate::storage::StorageUnit). Either the events and every
//! projection's writes commit together, or none of them do; a projection
//! failure rolls the whole batch back.

use std::{error::Error, marker::PhantomData};

use futures::future::BoxFuture;
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error as ThisError;

use crate::{
    action::PreparedAction,
    aggregate::Aggregate,
    error::AppendError,
    registry::{EventDecodeError, EventSet},
    session::SessionContext,
    storage::{AggregateDoc, EventStorage, StorageUnit},
};

/// Failure inside an inline projection. Wrapped into
/// [`AppendError::Projection`] with the projection's name attached.
#[derive(Debug, ThisError)]
pub enum ProjectionError {
    /// A freshly-appended envelope could not be decoded into the projection's
    /// event type.
    #[error(transparent)]
    Decode(#[from] EventDecodeError),

    /// The aggregate document could not be serialized or deserialized.
    #[error("aggregate document (de)serialization failed: {0}")]
    Document(#[source] serde_json::Error),

    /// The backing store rejected a projection read or write.
    #[error("store error: {0}")]
    Store(#[source] Box<dyn Error + Send + Sync>),
}

/// A projection that runs inside the commit batch's unit of work.
///
/// Implementations receive every prepared action of the batch and may read
/// and stage writes through the open unit. They must not commit it.
pub trait InlineProjection<S: EventStorage>: Send + Sync {
    /// Stable name, used in error reporting and logging.
    fn name(&self) -> &'static str;

    fn apply<'a>(
        &'a self,
        actions: &'a [PreparedAction],
        context: &'a SessionContext,
        unit: &'a mut S::Unit,
    ) -> BoxFuture<'a, Result<(), ProjectionError>>;
}

/// The built-in single-stream aggregate projection.
///
/// For every action tagged with `A::KIND` it loads the current aggregate
/// document (or starts from `A::default()` for a new stream), folds the
/// batch's new events into it, and upserts the document stamped with the
/// stream's post-commit version.
pub struct AggregateProjection<A> {
    _marker: PhantomData<fn() -> A>,
}

impl<A> AggregateProjection<A> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<A> Default for AggregateProjection<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S, A> InlineProjection<S> for AggregateProjection<A>
where
    S: EventStorage,
    A: Aggregate + Serialize + DeserializeOwned + 'static,
{
    fn name(&self) -> &'static str {
        A::KIND
    }

    fn apply<'a>(
        &'a self,
        actions: &'a [PreparedAction],
        context: &'a SessionContext,
        unit: &'a mut S::Unit,
    ) -> BoxFuture<'a, Result<(), ProjectionError>> {
        Box::pin(async move {
            for action in actions
                .iter()
                .filter(|action| action.aggregate_type.as_deref() == Some(A::KIND))
            {
                let mut state = if action.starting_version == 0 {
                    A::default()
                } else {
                    match unit
                        .read_aggregate(A::KIND, &context.tenant, &action.stream)
                        .await
                        .map_err(|err| ProjectionError::Store(Box::new(err)))?
                    {
                        Some(doc) => {
                            serde_json::from_value(doc.data).map_err(ProjectionError::Document)?
                        }
                        // Document missing for a live stream: the projection
                        // was registered after the stream started. Fold from
                        // scratch with what this batch carries.
                        None => A::default(),
                    }
                };

                for envelope in &action.envelopes {
                    let event = A::Event::decode(&envelope.event_type, &envelope.data)?;
                    state.apply(&event);
                }

                let doc = AggregateDoc {
                    kind: A::KIND.to_owned(),
                    tenant: context.tenant.clone(),
                    stream: action.stream.clone(),
                    version: action.last_version(),
                    data: serde_json::to_value(&state).map_err(ProjectionError::Document)?,
                };
                unit.upsert_aggregate(doc)
                    .await
                    .map_err(|err| ProjectionError::Store(Box::new(err)))?;
            }
            Ok(())
        })
    }
}

/// Run every registered inline projection over the batch, inside `unit`.
pub(crate) async fn run_inline<S: EventStorage>(
    projections: &[Box<dyn InlineProjection<S>>],
    actions: &[PreparedAction],
    context: &SessionContext,
    unit: &mut S::Unit,
) -> Result<(), AppendError<S::Error>> {
    for projection in projections {
        tracing::debug!(projection = projection.name(), "applying inline projection");
        projection
            .apply(actions, context, unit)
            .await
            .map_err(|source| AppendError::Projection {
                projection: projection.name(),
                source,
            })?;
    }
    Ok(())
}
