//! Event shapes before and after commit.
//!
//! [`PendingEvent`] is the in-memory staging form: payload plus type alias,
//! no ordering assigned yet. [`EventEnvelope`] is the persisted record — the
//! same payload wrapped with identity, per-stream version, global sequence,
//! timestamp, and tenancy/causation metadata. Stream actions turn pending
//! events into envelopes at commit time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{registry::DomainEvent, stream::StreamId, stream::TenantId};

/// A raw event queued for append, before versions and sequences exist.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingEvent {
    /// Explicit event id, or `None` to have one assigned at prepare time.
    pub id: Option<Uuid>,
    /// Stable string alias used to resolve the payload type on read.
    pub event_type: String,
    /// Fully-qualified type name, the fallback resolution path.
    pub type_name: String,
    /// Opaque payload.
    pub data: Value,
    /// Per-event causation override; defaults to the session value.
    pub causation_id: Option<String>,
}

impl PendingEvent {
    /// Serialize a domain event into its pending form.
    ///
    /// # Errors
    ///
    /// Returns a `serde_json` error if the payload fails to serialize. This
    /// happens before any I/O, so a failing event never reaches the store.
    pub fn of<E: DomainEvent>(event: &E) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: None,
            event_type: E::ALIAS.to_owned(),
            type_name: std::any::type_name::<E>().to_owned(),
            data: serde_json::to_value(event)?,
            causation_id: None,
        })
    }

    /// Pin the event id instead of letting prepare assign one.
    #[must_use]
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    /// Override the causation id for this event only.
    #[must_use]
    pub fn caused_by(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }
}

/// The persisted record wrapping one event payload.
///
/// Invariants: `(stream, version)` is unique per tenant; `sequence` is
/// globally unique and strictly increasing in insertion order; every envelope
/// of one commit batch shares the same `timestamp`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Globally unique event id, for cross-database correlation.
    pub id: Uuid,
    /// Owning stream.
    pub stream: StreamId,
    /// 1-based position within the stream; gapless.
    pub version: i64,
    /// Global store-wide order number, independent of stream.
    pub sequence: i64,
    /// Stable string alias resolving the payload type.
    pub event_type: String,
    /// Fully-qualified type name, fallback resolution path.
    pub type_name: String,
    /// Opaque payload.
    pub data: Value,
    /// Commit timestamp, identical for all events of one batch.
    pub timestamp: DateTime<Utc>,
    /// Owning tenant.
    pub tenant: TenantId,
    pub causation_id: Option<String>,
    pub correlation_id: Option<String>,
    /// User-defined headers, copied from the session when enabled.
    pub headers: Option<Map<String, Value>>,
}
