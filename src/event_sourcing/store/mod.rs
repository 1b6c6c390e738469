// ============================================================================
// Event Sourcing Store - Append-only persistence
// ============================================================================
//
// The consumer only talks to the traits below; Postgres is the shipped
// implementation of both.
//
// EventStoreWriter contract: appending a (aggregate_id, version) pair that
// already exists must not corrupt state. The consumer may present the same
// envelope more than once.
//
// ============================================================================

pub mod dead_letter;
pub mod event_store;

use async_trait::async_trait;

use crate::event_sourcing::core::EventEnvelope;
use crate::utils::IsTransient;

pub use dead_letter::{DeadLetter, DeadLetterSink, PgDeadLetterTable};
#[cfg(test)]
pub use dead_letter::DeadLetterError;
pub use event_store::PgEventStore;

/// Result of a successful append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// A new stored event was written
    Inserted,
    /// An event with the same (aggregate_id, version) was already stored; nothing written
    AlreadyExists,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("event store unavailable: {0}")]
    Unavailable(#[source] sqlx::Error),

    #[error("failed to append event: {0}")]
    Append(#[source] sqlx::Error),

    #[error("failed to prepare schema: {0}")]
    Schema(#[source] sqlx::Error),

    #[error("circuit breaker open for event store")]
    CircuitOpen,
}

impl IsTransient for StoreError {
    fn is_transient(&self) -> bool {
        match self {
            StoreError::Unavailable(_) | StoreError::CircuitOpen => true,
            // Constraint and type errors reported by the server will not go away on retry
            StoreError::Append(e) | StoreError::Schema(e) => e.as_database_error().is_none(),
        }
    }
}

#[async_trait]
pub trait EventStoreWriter: Send + Sync {
    async fn append(&self, envelope: &EventEnvelope) -> Result<AppendOutcome, StoreError>;
}
