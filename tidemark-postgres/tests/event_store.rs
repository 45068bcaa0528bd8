//! Integration tests for the PostgreSQL event storage.
//!
//! These tests require Docker to be running and will spin up a PostgreSQL
//! container using testcontainers.

use std::time::Duration;

use nonempty::nonempty;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tidemark_core::{
    aggregate::Aggregate,
    envelope::PendingEvent,
    error::{AppendError, FetchError},
    registry::{DomainEvent, EventDecodeError, EventRegistry, EventSet},
    storage::EventStorage,
    store::{EventStore, StoreConfig},
    stream::{StreamId, TenantId},
};
use tidemark_postgres::{PgStorage, migrate};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
struct Deposited {
    amount: i64,
}

impl DomainEvent for Deposited {
    const ALIAS: &'static str = "account.deposited";
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
struct Withdrawn {
    amount: i64,
}

impl DomainEvent for Withdrawn {
    const ALIAS: &'static str = "account.withdrawn";
}

#[derive(Debug)]
enum AccountEvent {
    Deposited(Deposited),
    Withdrawn(Withdrawn),
}

impl EventSet for AccountEvent {
    const ALIASES: &'static [&'static str] = &[Deposited::ALIAS, Withdrawn::ALIAS];

    fn decode(alias: &str, data: &serde_json::Value) -> Result<Self, EventDecodeError> {
        let payload = |source| EventDecodeError::Payload {
            alias: alias.to_owned(),
            source,
        };
        match alias {
            Deposited::ALIAS => serde_json::from_value(data.clone())
                .map(Self::Deposited)
                .map_err(payload),
            Withdrawn::ALIAS => serde_json::from_value(data.clone())
                .map(Self::Withdrawn)
                .map_err(payload),
            other => Err(EventDecodeError::UnknownAlias {
                alias: other.to_owned(),
                expected: Self::ALIASES,
            }),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Account {
    balance: i64,
}

impl Aggregate for Account {
    const KIND: &'static str = "account";
    type Event = AccountEvent;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            AccountEvent::Deposited(e) => self.balance += e.amount,
            AccountEvent::Withdrawn(e) => self.balance -= e.amount,
        }
    }
}

/// Test helper to set up a PostgreSQL container and connection pool.
struct TestDb {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
}

impl TestDb {
    async fn new() -> Self {
        let container = Postgres::default().start().await.unwrap();
        let host = container.get_host().await.unwrap();
        let port = container.get_host_port_ipv4(5432).await.unwrap();

        let connection_string = format!("postgres://postgres:postgres@{host}:{port}/postgres");
        let pool = PgPool::connect(&connection_string).await.unwrap();
        migrate(&pool).await.unwrap();

        Self {
            _container: container,
            pool,
        }
    }
}

fn registry() -> EventRegistry {
    let mut registry = EventRegistry::new();
    registry.register::<Deposited>().register::<Withdrawn>();
    registry
}

fn store(pool: PgPool) -> EventStore<PgStorage> {
    EventStore::new(PgStorage::new(pool), StoreConfig::new(registry()))
}

fn deposit(amount: i64) -> PendingEvent {
    PendingEvent::of(&Deposited { amount }).unwrap()
}

#[tokio::test]
async fn migrate_is_idempotent_and_creates_empty_tables() {
    let db = TestDb::new().await;
    migrate(&db.pool).await.unwrap();

    let streams: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tm_streams")
        .fetch_one(&db.pool)
        .await
        .unwrap();
    let events: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tm_events")
        .fetch_one(&db.pool)
        .await
        .unwrap();

    assert_eq!(streams.0, 0);
    assert_eq!(events.0, 0);
}

#[tokio::test]
async fn started_stream_round_trips_with_versions_and_sequences() {
    let db = TestDb::new().await;
    let store = store(db.pool.clone());
    let stream = StreamId::new();

    let mut session = store.session();
    session.start_stream(stream.clone(), nonempty![deposit(100), deposit(50)]);
    let summary = session.commit().await.unwrap();
    assert_eq!(summary.events_appended, 2);
    assert_eq!(summary.streams, vec![(stream.clone(), 2)]);

    let events = store.fetch_stream(&stream).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].version, 1);
    assert_eq!(events[1].version, 2);
    assert!(events[0].sequence < events[1].sequence);
    assert_eq!(events[0].event_type, "account.deposited");
}

#[tokio::test]
async fn starting_an_existing_stream_is_a_collision() {
    let db = TestDb::new().await;
    let store = store(db.pool.clone());
    let stream = StreamId::key("acct-1");

    let mut session = store.session();
    session.start_stream(stream.clone(), nonempty![deposit(1)]);
    session.commit().await.unwrap();

    let mut session = store.session();
    session.start_stream(stream.clone(), nonempty![deposit(2)]);
    let err = session.commit().await.unwrap_err();
    assert!(matches!(err, AppendError::StreamCollision { .. }));

    // The loser's events never landed.
    let events = store.fetch_stream(&stream).await.unwrap();
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn stale_expected_version_is_rejected_with_both_versions() {
    let db = TestDb::new().await;
    let store = store(db.pool.clone());
    let stream = StreamId::key("acct-1");

    let mut session = store.session();
    session.start_stream(stream.clone(), nonempty![deposit(1)]);
    session.commit().await.unwrap();

    // Two writers read version 1; the second to commit loses.
    let mut winner = store.session();
    winner.append_expecting(stream.clone(), 1, vec![deposit(10)]);
    winner.commit().await.unwrap();

    let mut loser = store.session();
    loser.append_expecting(stream.clone(), 1, vec![deposit(20)]);
    match loser.commit().await.unwrap_err() {
        AppendError::VersionMismatch {
            expected, actual, ..
        } => {
            assert_eq!(expected, 1);
            assert_eq!(actual, 2);
        }
        other => panic!("expected version mismatch, got {other}"),
    }
}

#[tokio::test]
async fn archived_stream_rejects_appends() {
    let db = TestDb::new().await;
    let store = store(db.pool.clone());
    let stream = StreamId::key("acct-1");
    let tenant = TenantId::default();

    let mut session = store.session();
    session.start_stream(stream.clone(), nonempty![deposit(1)]);
    session.commit().await.unwrap();

    assert!(store.archive_stream(&tenant, &stream).await.unwrap());

    let mut session = store.session();
    session.append(stream.clone(), vec![deposit(2)]);
    let err = session.commit().await.unwrap_err();
    assert!(matches!(err, AppendError::StreamArchived { .. }));
}

#[tokio::test]
async fn inline_projection_maintains_aggregate_document() {
    let db = TestDb::new().await;
    let store = EventStore::new(
        PgStorage::new(db.pool.clone()),
        StoreConfig::new(registry()).project_aggregate::<Account>(),
    );
    let stream = StreamId::key("acct-1");

    let mut session = store.session();
    session.start_stream_for::<Account>(stream.clone(), nonempty![deposit(100)]);
    session.commit().await.unwrap();

    let mut session = store.session();
    session.append_for::<Account>(stream.clone(), 1, vec![deposit(25), deposit(25)]);
    session.commit().await.unwrap();

    let doc = store
        .storage()
        .aggregate_doc(Account::KIND, &TenantId::default(), &stream)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc.version, 3);
    let account: Account = serde_json::from_value(doc.data).unwrap();
    assert_eq!(account.balance, 150);
}

#[tokio::test]
async fn exclusive_fetch_blocks_competing_exclusive_writers() {
    let db = TestDb::new().await;
    let storage = PgStorage::new(db.pool.clone()).with_lock_timeout(Duration::from_millis(200));
    let store = EventStore::new(storage, StoreConfig::new(registry()));
    let stream = StreamId::key("acct-1");

    let mut session = store.session();
    session.start_stream(stream.clone(), nonempty![deposit(100)]);
    session.commit().await.unwrap();

    let mut holder = store
        .fetch_for_exclusive_writing::<Account>(stream.clone())
        .await
        .unwrap();
    assert_eq!(holder.version(), 1);
    assert_eq!(holder.aggregate.balance, 100);

    let contender = store
        .fetch_for_exclusive_writing::<Account>(stream.clone())
        .await;
    assert!(matches!(contender, Err(FetchError::StreamLocked { .. })));

    holder.append([deposit(10)]);
    let summary = holder.commit().await.unwrap();
    assert_eq!(summary.streams, vec![(stream.clone(), 2)]);

    // Lock released; the stream is fetchable again.
    let reacquired = store
        .fetch_for_exclusive_writing::<Account>(stream.clone())
        .await
        .unwrap();
    assert_eq!(reacquired.version(), 2);
}

#[tokio::test]
async fn conjoined_tenants_are_isolated() {
    let db = TestDb::new().await;
    let store = EventStore::new(
        PgStorage::new(db.pool.clone()),
        StoreConfig::new(registry()).with_tenancy(tidemark_core::stream::TenancyStyle::Conjoined),
    );
    let stream = StreamId::key("acct-1");

    let mut session = store.session_for(TenantId::new("acme"));
    session.start_stream(stream.clone(), nonempty![deposit(100)]);
    session.commit().await.unwrap();

    let mut session = store.session_for(TenantId::new("globex"));
    session.start_stream(stream.clone(), nonempty![deposit(7)]);
    session.commit().await.unwrap();

    let acme = store
        .fetch_stream_for(&TenantId::new("acme"), &stream)
        .await
        .unwrap();
    assert_eq!(acme.len(), 1);
    assert_eq!(acme[0].data, serde_json::json!({ "amount": 100 }));

    // Sessions without an explicit tenant are rejected outright.
    let mut session = store.session();
    session.append(stream.clone(), vec![deposit(1)]);
    assert!(matches!(
        session.commit().await.unwrap_err(),
        AppendError::TenantRequired
    ));
}
