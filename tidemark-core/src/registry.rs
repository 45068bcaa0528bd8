//! Event-type registration and resolution.
//!
//! Every persisted event carries a stable string alias plus a fully-qualified
//! type name. The [`EventRegistry`] is an immutable-after-init map from alias
//! to [`EventTypeDescriptor`], with a secondary index by type name so that
//! rows written under a since-renamed alias stay resolvable. Unknown aliases
//! are a recoverable error, never a crash — silently skipping an event would
//! corrupt projection state.

use std::collections::HashMap;

use serde::Serialize;
use thiserror::Error;

/// Marker trait for events that can be appended to a stream.
///
/// Each event type carries a stable [`Self::ALIAS`] identifier stored with
/// every row; the registry routes stored payloads back to the right type
/// through it. Pick aliases that survive refactors: lowercase, dotted or
/// kebab-case, e.g. `"order.placed"`.
pub trait DomainEvent: Serialize {
    const ALIAS: &'static str;
}

/// A sum type over the events of one stream, able to decode itself from a
/// stored alias + payload.
///
/// Aggregates declare `type Event: EventSet` and fold decoded variants; the
/// usual implementation is a hand-written match over the aliases.
pub trait EventSet: Sized {
    /// The aliases this sum type can decode.
    const ALIASES: &'static [&'static str];

    /// Decode one stored event.
    ///
    /// # Errors
    ///
    /// Returns [`EventDecodeError::UnknownAlias`] for aliases outside
    /// [`Self::ALIASES`], or [`EventDecodeError::Payload`] when the payload
    /// does not deserialize.
    fn decode(alias: &str, data: &serde_json::Value) -> Result<Self, EventDecodeError>;
}

/// Error returned when decoding a stored event into a typed representation.
#[derive(Debug, Error)]
pub enum EventDecodeError {
    #[error("unknown event alias `{alias}`, expected one of {expected:?}")]
    UnknownAlias {
        alias: String,
        expected: &'static [&'static str],
    },
    #[error("failed to decode `{alias}` payload: {source}")]
    Payload {
        alias: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Registration record for one event type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventTypeDescriptor {
    /// Current stable alias.
    pub alias: &'static str,
    /// Fully-qualified Rust type name, the fallback resolution key.
    pub type_name: &'static str,
}

/// Alias of the tombstone placeholder event.
pub const TOMBSTONE_ALIAS: &str = "tombstone";

/// Fully-qualified name recorded for tombstone placeholder events.
pub const TOMBSTONE_TYPE_NAME: &str = "tidemark_core::Tombstone";

/// Immutable-after-init map from event alias to descriptor.
///
/// Built once at store configuration time and passed by reference into the
/// append and read pipelines; no process-wide singletons.
#[derive(Clone, Debug, Default)]
pub struct EventRegistry {
    by_alias: HashMap<&'static str, EventTypeDescriptor>,
    by_type_name: HashMap<&'static str, EventTypeDescriptor>,
}

impl EventRegistry {
    /// An empty registry pre-seeded with the tombstone descriptor.
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Self::default();
        registry.insert(EventTypeDescriptor {
            alias: TOMBSTONE_ALIAS,
            type_name: TOMBSTONE_TYPE_NAME,
        });
        registry
    }

    /// Register an event type under its current alias.
    pub fn register<E: DomainEvent>(&mut self) -> &mut Self {
        self.insert(EventTypeDescriptor {
            alias: E::ALIAS,
            type_name: std::any::type_name::<E>(),
        });
        self
    }

    /// Register an event type under its current alias but an explicit stored
    /// type name, for rows written by earlier code under a different Rust
    /// path.
    pub fn register_as<E: DomainEvent>(&mut self, type_name: &'static str) -> &mut Self {
        self.insert(EventTypeDescriptor {
            alias: E::ALIAS,
            type_name,
        });
        self
    }

    fn insert(&mut self, descriptor: EventTypeDescriptor) {
        self.by_type_name
            .insert(descriptor.type_name, descriptor.clone());
        self.by_alias.insert(descriptor.alias, descriptor);
    }

    /// Resolve a stored alias to its descriptor.
    ///
    /// Lookup order: current alias first, then the fully-qualified type name.
    /// The fallback keeps rows written under an old alias resolvable after
    /// the alias was renamed in a newer registration.
    #[must_use]
    pub fn resolve(&self, alias: &str, type_name: &str) -> Option<&EventTypeDescriptor> {
        self.by_alias
            .get(alias)
            .or_else(|| self.by_type_name.get(type_name))
    }

    /// Number of registered descriptors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_alias.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_alias.is_empty()
    }
}
