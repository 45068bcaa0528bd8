#![doc = include_str!("../README.md")]

pub use tidemark_core::{
    aggregate,
    aggregate::{Aggregate, fold_envelopes},
    envelope,
    envelope::{EventEnvelope, PendingEvent},
    registry,
    registry::{DomainEvent, EventDecodeError, EventRegistry, EventSet},
    session,
    session::{EventSession, ExclusiveStream, FetchedStream, SessionContext},
    stream,
    stream::{StreamId, StreamMeta, TenancyStyle, TenantId},
};

pub mod store {

    pub use tidemark_core::{
        action::{ActionType, PreparedAction, StreamAction},
        append::{AppendMode, CommitSummary},
        error::{AppendError, FetchError, ReadError},
        projection::{AggregateProjection, InlineProjection, ProjectionError},
        store::{EventStore, MetadataConfig, StoreConfig},
    };

    // Backend traits, for EventStorage implementors. Most users pick a
    // shipped backend instead.
    pub use tidemark_core::storage::{
        AggregateDoc, EventStorage, LockMode, StorageError, StorageUnit,
    };

    pub use tidemark_core::storage::inmemory;

    #[cfg(feature = "postgres")]
    #[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
    pub mod postgres {
        pub use tidemark_postgres::{Error, PgStorage, migrate};
    }
}
