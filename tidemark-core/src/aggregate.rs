//! Aggregate state rebuilt from stream events.
//!
//! An [`Aggregate`] is a `Default` state plus an apply function over its
//! event sum type. The same fold serves two callers: fetch-for-writing
//! workflows that load current state before handling a command, and the
//! inline [`AggregateProjection`](crate::projection::AggregateProjection)
//! that maintains a materialized document at append time.

use crate::{
    envelope::EventEnvelope,
    registry::{EventDecodeError, EventSet},
};

/// State that can be rebuilt by folding a stream's events.
pub trait Aggregate: Default + Send + Sync {
    /// Aggregate type identifier, stored on the stream metadata record and
    /// used to route inline projections. Lowercase kebab-case by convention.
    const KIND: &'static str;

    /// Sum type over the stream's events.
    type Event: EventSet + Send;

    /// Fold one event into the state.
    fn apply(&mut self, event: &Self::Event);
}

/// Build an aggregate from stored envelopes, in the order given.
///
/// # Errors
///
/// Returns an [`EventDecodeError`] when an envelope's alias or payload cannot
/// be decoded into `A::Event`.
pub fn fold_envelopes<A: Aggregate>(envelopes: &[EventEnvelope]) -> Result<A, EventDecodeError> {
    let mut state = A::default();
    for envelope in envelopes {
        let event = A::Event::decode(&envelope.event_type, &envelope.data)?;
        state.apply(&event);
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    use super::*;
    use crate::{
        registry::DomainEvent,
        stream::{StreamId, TenantId},
    };

    #[derive(Serialize, Deserialize)]
    struct Deposited {
        amount: i64,
    }

    impl DomainEvent for Deposited {
        const ALIAS: &'static str = "account.deposited";
    }

    enum AccountEvent {
        Deposited(Deposited),
    }

    impl EventSet for AccountEvent {
        const ALIASES: &'static [&'static str] = &["account.deposited"];

        fn decode(alias: &str, data: &serde_json::Value) -> Result<Self, EventDecodeError> {
            match alias {
                "account.deposited" => serde_json::from_value(data.clone())
                    .map(Self::Deposited)
                    .map_err(|source| EventDecodeError::Payload {
                        alias: alias.to_owned(),
                        source,
                    }),
                other => Err(EventDecodeError::UnknownAlias {
                    alias: other.to_owned(),
                    expected: Self::ALIASES,
                }),
            }
        }
    }

    #[derive(Debug, Default)]
    struct Account {
        balance: i64,
    }

    impl Aggregate for Account {
        const KIND: &'static str = "account";
        type Event = AccountEvent;

        fn apply(&mut self, event: &Self::Event) {
            match event {
                AccountEvent::Deposited(e) => self.balance += e.amount,
            }
        }
    }

    fn envelope(version: i64, amount: i64) -> EventEnvelope {
        EventEnvelope {
            id: Uuid::new_v4(),
            stream: StreamId::key("a1"),
            version,
            sequence: version,
            event_type: "account.deposited".to_owned(),
            type_name: "tests::Deposited".to_owned(),
            data: serde_json::json!({ "amount": amount }),
            timestamp: Utc::now(),
            tenant: TenantId::default(),
            causation_id: None,
            correlation_id: None,
            headers: None,
        }
    }

    #[test]
    fn fold_applies_events_in_order() {
        let account: Account =
            fold_envelopes(&[envelope(1, 10), envelope(2, 5), envelope(3, -3)]).unwrap();
        assert_eq!(account.balance, 12);
    }

    #[test]
    fn fold_surfaces_unknown_alias() {
        let mut bad = envelope(1, 10);
        bad.event_type = "account.closed".to_owned();

        let err = fold_envelopes::<Account>(&[bad]).unwrap_err();
        assert!(matches!(err, EventDecodeError::UnknownAlias { .. }));
    }
}
