use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use uuid::Uuid;

use crate::messaging::QueueMessage;

// ============================================================================
// Dead Letter Storage
// ============================================================================
//
// Holds messages the consumer gave up on, so they can be inspected and
// replayed by hand instead of being redelivered forever.
//
// A message is only deleted from the queue after its dead letter has been
// stored. If that delete fails the message comes back and is dead-lettered
// again; `message_id` is unique, so the second insert is a no-op.
//
// ============================================================================

const CREATE_DEAD_LETTER_TABLE: &str = "CREATE TABLE IF NOT EXISTS dead_letter_messages (
    id UUID PRIMARY KEY,
    message_id TEXT NOT NULL UNIQUE,
    body TEXT NOT NULL,
    reason TEXT NOT NULL,
    receive_count INTEGER NOT NULL,
    dead_lettered_at TIMESTAMPTZ NOT NULL
)";

const INSERT_DEAD_LETTER: &str = "INSERT INTO dead_letter_messages (
        id, message_id, body, reason, receive_count, dead_lettered_at
    ) VALUES ($1, $2, $3, $4, $5, $6)
    ON CONFLICT (message_id) DO NOTHING";

#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub id: Uuid,
    pub message_id: String,
    pub body: String,
    pub reason: String,
    pub receive_count: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn from_message(message: &QueueMessage, reason: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_id: message.message_id.clone(),
            body: message.body.clone(),
            reason: reason.into(),
            receive_count: message.receive_count,
            dead_lettered_at: Utc::now(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("failed to store dead letter {id}: {source}")]
pub struct DeadLetterError {
    pub id: Uuid,
    #[source]
    pub source: sqlx::Error,
}

/// Sending the same queue message twice stores one dead letter
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn send(&self, letter: DeadLetter) -> Result<(), DeadLetterError>;
}

/// Dead letters kept in the event store database
pub struct PgDeadLetterTable {
    pool: PgPool,
}

impl PgDeadLetterTable {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::query(CREATE_DEAD_LETTER_TABLE)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl DeadLetterSink for PgDeadLetterTable {
    async fn send(&self, letter: DeadLetter) -> Result<(), DeadLetterError> {
        tracing::error!(
            dead_letter_id = %letter.id,
            message_id = %letter.message_id,
            reason = %letter.reason,
            receive_count = letter.receive_count,
            "💀 Adding message to dead letter table"
        );

        let result = sqlx::query(INSERT_DEAD_LETTER)
            .bind(letter.id)
            .bind(&letter.message_id)
            .bind(&letter.body)
            .bind(&letter.reason)
            .bind(i32::try_from(letter.receive_count).unwrap_or(i32::MAX))
            .bind(letter.dead_lettered_at)
            .execute(&self.pool)
            .await
            .map_err(|source| DeadLetterError { id: letter.id, source })?;

        if result.rows_affected() == 0 {
            tracing::warn!(
                message_id = %letter.message_id,
                "Message was already in dead letter table"
            );
        } else {
            tracing::info!(dead_letter_id = %letter.id, "Message stored in dead letter table");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dead_letter_from_message() {
        let message = QueueMessage {
            message_id: "m-1".to_string(),
            receipt_handle: "rh-1".to_string(),
            body: r#"{"Message":"garbage"}"#.to_string(),
            receive_count: 5,
        };

        let letter = DeadLetter::from_message(&message, "malformed envelope: expected 4 fields, found 1");

        assert_eq!(letter.message_id, "m-1");
        assert_eq!(letter.body, message.body);
        assert_eq!(letter.receive_count, 5);
        assert!(letter.reason.contains("expected 4 fields"));
        assert_ne!(DeadLetter::from_message(&message, "x").id, letter.id);
    }

    #[test]
    fn test_insert_is_idempotent_per_message() {
        assert!(CREATE_DEAD_LETTER_TABLE.contains("message_id TEXT NOT NULL UNIQUE"));
        assert!(INSERT_DEAD_LETTER.contains("ON CONFLICT (message_id) DO NOTHING"));
    }

    #[test]
    fn test_insert_matches_table_columns() {
        for column in ["id", "message_id", "body", "reason", "receive_count", "dead_lettered_at"] {
            assert!(CREATE_DEAD_LETTER_TABLE.contains(column));
            assert!(INSERT_DEAD_LETTER.contains(column));
        }
    }
}
