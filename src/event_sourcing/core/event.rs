use serde::{Deserialize, Serialize};

// ============================================================================
// Event Envelope - One write request for the event store
// ============================================================================
//
// The decoded, store-agnostic form of a single event as it travels from the
// queue to the `events` table. The pair (aggregate_id, version) identifies
// one logical event for the whole lifetime of the store.
//
// ============================================================================

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct EventEnvelope {
    /// Identifier of the event stream
    pub aggregate_id: String,
    /// Position of the event within its stream
    pub version: i64,
    /// Schema identifier of the event, e.g. "Deposited"
    pub type_code: String,
    /// Opaque event body, stored as-is
    pub payload: String,
}

impl EventEnvelope {
    pub fn new(
        aggregate_id: impl Into<String>,
        version: i64,
        type_code: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            version,
            type_code: type_code.into(),
            payload: payload.into(),
        }
    }

    /// Storage key of the event
    pub fn key(&self) -> (&str, i64) {
        (&self.aggregate_id, self.version)
    }
}
