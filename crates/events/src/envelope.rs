use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::Event;
use crate::sequenced::Sequenced;

/// Producer name stamped on envelopes when none is given.
pub const DEFAULT_SOURCE: &str = "inventory_service";

/// Wire envelope for a published event.
///
/// The payload's own fields are flattened into the envelope, so a consumer
/// reading raw JSON sees `event_type`, the key fields and `sequence` at the
/// top level next to the delivery metadata.
///
/// Notes:
/// - `event_id` is unique per publish attempt; consumers deduplicate on the
///   payload's (key, sequence), never on `event_id`.
/// - `schema_version` follows [`Event::version`] for the payload type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,
    source: String,
    schema_version: u32,
    published_at: DateTime<Utc>,

    #[serde(flatten)]
    payload: E,
}

impl<E> EventEnvelope<E>
where
    E: Event,
{
    pub fn wrap(payload: E) -> Self {
        Self::new(Uuid::now_v7(), DEFAULT_SOURCE, Utc::now(), payload)
    }

    pub fn new(
        event_id: Uuid,
        source: impl Into<String>,
        published_at: DateTime<Utc>,
        payload: E,
    ) -> Self {
        Self {
            event_id,
            source: source.into(),
            schema_version: payload.version(),
            published_at,
            payload,
        }
    }
}

impl<E> EventEnvelope<E> {
    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn published_at(&self) -> DateTime<Utc> {
        self.published_at
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}

impl<E> Sequenced for EventEnvelope<E>
where
    E: Sequenced,
{
    type Key = E::Key;

    fn stream_key(&self) -> Self::Key {
        self.payload.stream_key()
    }

    fn sequence(&self) -> u64 {
        self.payload.sequence()
    }
}
