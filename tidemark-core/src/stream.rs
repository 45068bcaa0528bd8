//! Stream identity, tenancy, and the durable per-stream metadata record.
//!
//! A stream is an ordered, append-only sequence of events sharing one
//! identity. Stores are configured to use exactly one identity scheme —
//! `Uuid` or string key — never both. The [`StreamMeta`] record is the durable
//! row tracking a stream's current version and archival status; every append
//! path reads or writes it.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of an event stream.
///
/// The `Display` rendering is the canonical text form used as the storage
/// key, so a `Uuid` stream and a `Key` stream with the same text never
/// collide in practice (hyphenated uuid text is not a typical business key).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamId {
    /// Guid-identified stream.
    Uuid(Uuid),
    /// String-keyed stream.
    Key(String),
}

impl StreamId {
    /// A fresh random `Uuid` stream identity.
    #[must_use]
    pub fn new() -> Self {
        Self::Uuid(Uuid::new_v4())
    }

    /// A string-keyed stream identity.
    #[must_use]
    pub fn key(key: impl Into<String>) -> Self {
        Self::Key(key.into())
    }

    /// The reserved stream that receives tombstone placeholder events after
    /// failed commits, keeping the global sequence high-water mark moving.
    #[must_use]
    pub fn tombstone() -> Self {
        Self::Key(TOMBSTONE_STREAM.to_owned())
    }

    /// Parse the canonical text form back into an identity. Anything that is
    /// not hyphenated uuid text is a string key.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        Uuid::parse_str(text).map_or_else(|_| Self::Key(text.to_owned()), Self::Uuid)
    }
}

/// Reserved key of the tombstone stream.
pub const TOMBSTONE_STREAM: &str = "+tombstone";

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uuid(id) => write!(f, "{id}"),
            Self::Key(key) => f.write_str(key),
        }
    }
}

impl FromStr for StreamId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl From<Uuid> for StreamId {
    fn from(id: Uuid) -> Self {
        Self::Uuid(id)
    }
}

impl From<&str> for StreamId {
    fn from(key: &str) -> Self {
        Self::Key(key.to_owned())
    }
}

/// Tenant identifier carried by every stream and event.
///
/// Single-tenant stores use the default tenant throughout; conjoined-tenancy
/// stores require a non-default tenant on every session.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantId(String);

/// Key of the implicit tenant used by single-tenant stores.
pub const DEFAULT_TENANT: &str = "*DEFAULT*";

impl TenantId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Whether this is the implicit single-tenant id.
    #[must_use]
    pub fn is_default(&self) -> bool {
        self.0 == DEFAULT_TENANT
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self(DEFAULT_TENANT.to_owned())
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// How stream and event rows are partitioned across tenants.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TenancyStyle {
    /// One implicit tenant; sessions use [`TenantId::default`].
    #[default]
    Single,
    /// Every stream and event carries a caller-supplied tenant id.
    Conjoined,
}

/// Durable per-stream metadata record.
///
/// `version` always equals the version of the most recently committed event
/// for the stream; `0` means the stream does not exist yet. Once
/// `is_archived` is set the stream is terminal and rejects further appends.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamMeta {
    pub tenant: TenantId,
    pub stream: StreamId,
    pub version: i64,
    pub aggregate_type: Option<String>,
    pub is_archived: bool,
    pub created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl StreamMeta {
    /// Metadata for a stream being created in the current commit.
    #[must_use]
    pub fn starting(
        tenant: TenantId,
        stream: StreamId,
        version: i64,
        aggregate_type: Option<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            tenant,
            stream,
            version,
            aggregate_type,
            is_archived: false,
            created: timestamp,
            last_modified: timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_stream_id_round_trips_through_display() {
        let id = StreamId::new();
        let text = id.to_string();
        let parsed: StreamId = text.parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn key_stream_id_round_trips_through_display() {
        let id = StreamId::key("invoice-42");
        let parsed: StreamId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn default_tenant_is_recognised() {
        assert!(TenantId::default().is_default());
        assert!(!TenantId::new("acme").is_default());
    }

    #[test]
    fn tombstone_stream_uses_reserved_key() {
        assert_eq!(StreamId::tombstone().to_string(), "+tombstone");
    }
}
