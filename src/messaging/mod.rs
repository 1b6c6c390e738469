// ============================================================================
// Messaging - Queue side of the pipeline
// ============================================================================
//
// MessageSource contract:
// - receive: long poll for at most `max_messages`, blocking up to
//   `wait_time`; received messages stay hidden for `visibility_timeout`
// - delete: remove one message by receipt handle
//
// No ordering guarantee, no exactly-once guarantee. A message that is not
// deleted before its visibility timeout expires is delivered again.
//
// ============================================================================

mod sqs;

use async_trait::async_trait;
use std::time::Duration;

pub use sqs::SqsMessageSource;

/// A message received from the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// Queue-assigned id, used for logging only
    pub message_id: String,
    /// Opaque handle required to delete this delivery
    pub receipt_handle: String,
    pub body: String,
    /// How many times the queue has handed this message out, 1 on first delivery
    pub receive_count: u32,
}

/// Parameters of one long-poll receive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveRequest {
    pub max_messages: i32,
    pub wait_time: Duration,
    pub visibility_timeout: Duration,
}

impl Default for ReceiveRequest {
    fn default() -> Self {
        Self {
            max_messages: 1,
            wait_time: Duration::from_secs(5),
            visibility_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("failed to receive messages: {0}")]
    Receive(String),

    #[error("failed to delete message: {0}")]
    Delete(String),
}

#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Long poll; returns an empty batch when nothing arrived within `wait_time`
    async fn receive(&self, request: &ReceiveRequest) -> Result<Vec<QueueMessage>, QueueError>;

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError>;
}
