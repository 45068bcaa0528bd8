//! The configured event store: storage plus registry, tenancy, append mode,
//! and inline projections.

use crate::{
    aggregate::Aggregate,
    append::AppendMode,
    envelope::EventEnvelope,
    error::{FetchError, ReadError},
    projection::{AggregateProjection, InlineProjection},
    registry::EventRegistry,
    session::{EventSession, ExclusiveStream, SessionContext},
    storage::EventStorage,
    stream::{StreamId, TenancyStyle, TenantId},
};

/// Which optional metadata columns are populated on stored events.
///
/// Causation and correlation ids are always carried; headers are opt-in
/// because they copy the whole session header map onto every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct MetadataConfig {
    pub headers_enabled: bool,
}

/// Store-wide configuration, fixed at construction.
pub struct StoreConfig<S: EventStorage> {
    pub tenancy: TenancyStyle,
    pub append_mode: AppendMode,
    pub metadata: MetadataConfig,
    pub registry: EventRegistry,
    pub projections: Vec<Box<dyn InlineProjection<S>>>,
}

impl<S: EventStorage> StoreConfig<S> {
    #[must_use]
    pub fn new(registry: EventRegistry) -> Self {
        Self {
            tenancy: TenancyStyle::Single,
            append_mode: AppendMode::default(),
            metadata: MetadataConfig::default(),
            registry,
            projections: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_tenancy(mut self, tenancy: TenancyStyle) -> Self {
        self.tenancy = tenancy;
        self
    }

    #[must_use]
    pub fn with_append_mode(mut self, mode: AppendMode) -> Self {
        self.append_mode = mode;
        self
    }

    #[must_use]
    pub fn with_headers_enabled(mut self) -> Self {
        self.metadata.headers_enabled = true;
        self
    }

    #[must_use]
    pub fn with_projection(mut self, projection: Box<dyn InlineProjection<S>>) -> Self {
        self.projections.push(projection);
        self
    }

    /// Register the built-in inline aggregate projection for `A`.
    #[must_use]
    pub fn project_aggregate<A>(self) -> Self
    where
        A: Aggregate + serde::Serialize + serde::de::DeserializeOwned + 'static,
    {
        self.with_projection(Box::new(AggregateProjection::<A>::new()))
    }
}

/// The event store facade. Cheap to share by reference; all I/O goes through
/// sessions or the read methods here.
pub struct EventStore<S: EventStorage> {
    storage: S,
    config: StoreConfig<S>,
}

impl<S: EventStorage> EventStore<S> {
    #[must_use]
    pub fn new(storage: S, config: StoreConfig<S>) -> Self {
        Self { storage, config }
    }

    #[must_use]
    pub fn storage(&self) -> &S {
        &self.storage
    }

    #[must_use]
    pub fn config(&self) -> &StoreConfig<S> {
        &self.config
    }

    /// Open a session for the default tenant.
    #[must_use]
    pub fn session(&self) -> EventSession<'_, S> {
        EventSession::new(self, SessionContext::default())
    }

    /// Open a session scoped to `tenant`.
    #[must_use]
    pub fn session_for(&self, tenant: TenantId) -> EventSession<'_, S> {
        EventSession::new(self, SessionContext::for_tenant(tenant))
    }

    /// Open a session with fully caller-supplied ambient metadata.
    #[must_use]
    pub fn session_with(&self, context: SessionContext) -> EventSession<'_, S> {
        EventSession::new(self, context)
    }

    /// Read a stream's committed events for the default tenant, with stored
    /// aliases resolved against the registry.
    pub async fn fetch_stream(
        &self,
        stream: &StreamId,
    ) -> Result<Vec<EventEnvelope>, ReadError<S::Error>> {
        self.resolved_stream(&TenantId::default(), stream).await
    }

    /// Tenant-scoped variant of [`fetch_stream`](Self::fetch_stream).
    pub async fn fetch_stream_for(
        &self,
        tenant: &TenantId,
        stream: &StreamId,
    ) -> Result<Vec<EventEnvelope>, ReadError<S::Error>> {
        self.resolved_stream(tenant, stream).await
    }

    /// Fetch aggregate `A` under an exclusive row lock, default tenant.
    pub async fn fetch_for_exclusive_writing<A: Aggregate>(
        &self,
        stream: StreamId,
    ) -> Result<ExclusiveStream<'_, A, S>, FetchError<S::Error>> {
        ExclusiveStream::acquire(self, SessionContext::default(), stream).await
    }

    /// Tenant-scoped exclusive fetch.
    pub async fn fetch_for_exclusive_writing_in<A: Aggregate>(
        &self,
        tenant: TenantId,
        stream: StreamId,
    ) -> Result<ExclusiveStream<'_, A, S>, FetchError<S::Error>> {
        ExclusiveStream::acquire(self, SessionContext::for_tenant(tenant), stream).await
    }

    /// Current version of a stream, or `None` when it does not exist.
    pub async fn stream_version(
        &self,
        tenant: &TenantId,
        stream: &StreamId,
    ) -> Result<Option<i64>, S::Error> {
        self.storage.stream_version(tenant, stream).await
    }

    /// Mark a stream archived. Archival is terminal; every subsequent append
    /// fails. Returns `false` when the stream does not exist.
    pub async fn archive_stream(
        &self,
        tenant: &TenantId,
        stream: &StreamId,
    ) -> Result<bool, S::Error> {
        let archived = self.storage.archive_stream(tenant, stream).await?;
        if archived {
            tracing::debug!(%tenant, %stream, "stream archived");
        }
        Ok(archived)
    }

    /// Fetch events and rewrite each stored alias to its current registered
    /// form, so callers decode against today's aliases even for events
    /// stored under a renamed one.
    pub(crate) async fn resolved_stream(
        &self,
        tenant: &TenantId,
        stream: &StreamId,
    ) -> Result<Vec<EventEnvelope>, ReadError<S::Error>> {
        let mut envelopes = self
            .storage
            .fetch_stream(tenant, stream)
            .await
            .map_err(ReadError::Store)?;
        for envelope in &mut envelopes {
            let descriptor = self
                .config
                .registry
                .resolve(&envelope.event_type, &envelope.type_name)
                .ok_or_else(|| ReadError::UnknownEventType {
                    alias: envelope.event_type.clone(),
                    type_name: envelope.type_name.clone(),
                })?;
            if envelope.event_type != descriptor.alias {
                envelope.event_type = descriptor.alias.to_owned();
            }
        }
        Ok(envelopes)
    }
}
