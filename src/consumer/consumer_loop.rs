use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use super::policy::{Disposition, ProcessingFailure, RedeliveryPolicy};
use crate::event_sourcing::{
    AppendOutcome, DeadLetter, DeadLetterSink, EnvelopeCodec, EventStoreWriter,
};
use crate::messaging::{MessageSource, QueueMessage, ReceiveRequest};
use crate::metrics::Metrics;
use crate::utils::{Backoff, RetryConfig};

// ============================================================================
// Consumer Loop - consume, decode, persist, acknowledge
// ============================================================================
//
// Two states, alternating until shutdown:
//
//   Polling    -- long-poll the queue for a batch
//   Processing -- handle the batch one message at a time, in receipt order
//
// A message is deleted only after a terminal outcome:
// - its envelope was appended (or was already stored), or
// - the redelivery policy chose to dead-letter it and the dead letter was stored
//
// Everything else leaves the message in the queue, where it becomes visible
// again once its visibility timeout expires. No per-message error ever stops
// the loop.
//
// Shutdown is checked between messages and while waiting on the queue, so an
// in-flight message always finishes.
//
// ============================================================================

/// Terminal or non-terminal result of handling one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Envelope appended as a new stored event
    Persisted,
    /// Envelope was already stored; the append was a no-op
    AlreadyPersisted,
    /// Message stored as a dead letter
    DeadLettered,
    /// Message left in the queue for redelivery
    LeftForRedelivery,
}

impl MessageOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageOutcome::Persisted => "persisted",
            MessageOutcome::AlreadyPersisted => "already_persisted",
            MessageOutcome::DeadLettered => "dead_lettered",
            MessageOutcome::LeftForRedelivery => "left_for_redelivery",
        }
    }

    /// Whether the message should be removed from the queue
    pub fn is_terminal(self) -> bool {
        !matches!(self, MessageOutcome::LeftForRedelivery)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessedMessage {
    pub outcome: MessageOutcome,
    /// True when the queue confirmed the delete
    pub deleted: bool,
}

#[derive(Debug)]
pub enum PollResult {
    Received(Vec<QueueMessage>),
    Empty,
    Failed,
}

enum ConsumerState {
    Polling,
    Processing(VecDeque<QueueMessage>),
    Stopped,
}

pub struct ConsumerLoop {
    source: Arc<dyn MessageSource>,
    store: Arc<dyn EventStoreWriter>,
    dead_letters: Arc<dyn DeadLetterSink>,
    policy: Arc<dyn RedeliveryPolicy>,
    request: ReceiveRequest,
    receive_backoff: RetryConfig,
    metrics: Arc<Metrics>,
}

impl ConsumerLoop {
    pub fn new(
        source: Arc<dyn MessageSource>,
        store: Arc<dyn EventStoreWriter>,
        dead_letters: Arc<dyn DeadLetterSink>,
        policy: Arc<dyn RedeliveryPolicy>,
        request: ReceiveRequest,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            source,
            store,
            dead_letters,
            policy,
            request,
            receive_backoff: RetryConfig::default(),
            metrics,
        }
    }

    /// Delays used after failed receives
    #[cfg(test)]
    pub fn with_receive_backoff(mut self, config: RetryConfig) -> Self {
        self.receive_backoff = config;
        self
    }

    /// Run until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(
            max_messages = self.request.max_messages,
            wait_time_secs = self.request.wait_time.as_secs(),
            visibility_timeout_secs = self.request.visibility_timeout.as_secs(),
            "🔄 Starting consumer loop"
        );

        let mut backoff = Backoff::new(self.receive_backoff.clone());
        let mut state = ConsumerState::Polling;

        loop {
            state = match state {
                ConsumerState::Polling => self.polling(&mut backoff, &shutdown).await,
                ConsumerState::Processing(batch) => self.processing(batch, &shutdown).await,
                ConsumerState::Stopped => break,
            };
        }

        tracing::info!("Consumer loop stopped");
    }

    async fn polling(&self, backoff: &mut Backoff, shutdown: &CancellationToken) -> ConsumerState {
        let result = tokio::select! {
            _ = shutdown.cancelled() => return ConsumerState::Stopped,
            result = self.poll() => result,
        };

        match result {
            PollResult::Received(batch) => {
                backoff.reset();
                ConsumerState::Processing(batch.into())
            }
            PollResult::Empty => {
                backoff.reset();
                ConsumerState::Polling
            }
            PollResult::Failed => {
                let delay = backoff.next_delay();
                tracing::debug!(delay_ms = delay.as_millis() as u64, "Backing off before next poll");
                tokio::select! {
                    _ = shutdown.cancelled() => ConsumerState::Stopped,
                    _ = sleep(delay) => ConsumerState::Polling,
                }
            }
        }
    }

    async fn processing(
        &self,
        mut batch: VecDeque<QueueMessage>,
        shutdown: &CancellationToken,
    ) -> ConsumerState {
        if shutdown.is_cancelled() {
            if !batch.is_empty() {
                tracing::info!(
                    remaining = batch.len(),
                    "Shutdown requested, leaving remaining messages for redelivery"
                );
            }
            return ConsumerState::Stopped;
        }

        match batch.pop_front() {
            Some(message) => {
                let processed = self.process_message(&message).await;
                tracing::debug!(
                    message_id = %message.message_id,
                    outcome = processed.outcome.as_str(),
                    deleted = processed.deleted,
                    "Message handled"
                );
                ConsumerState::Processing(batch)
            }
            None => ConsumerState::Polling,
        }
    }

    /// One bounded long-poll receive
    pub async fn poll(&self) -> PollResult {
        tracing::debug!("check messages...");

        match self.source.receive(&self.request).await {
            Ok(batch) => {
                self.metrics.record_poll(batch.len());
                if batch.is_empty() {
                    PollResult::Empty
                } else {
                    tracing::debug!(message_count = batch.len(), "📬 Received messages");
                    PollResult::Received(batch)
                }
            }
            Err(e) => {
                self.metrics.polls_total.inc();
                self.metrics.receive_failures.inc();
                tracing::error!(error = %e, "Failed to receive messages from queue");
                PollResult::Failed
            }
        }
    }

    /// Decode, append and acknowledge a single message
    pub async fn process_message(&self, message: &QueueMessage) -> ProcessedMessage {
        let started = Instant::now();

        let outcome = match EnvelopeCodec::decode(&message.body) {
            Err(e) => {
                tracing::warn!(
                    message_id = %message.message_id,
                    receive_count = message.receive_count,
                    error = %e,
                    "❌ Can't decode message"
                );
                self.metrics.record_decode_failure(e.kind());
                self.handle_failure(message, ProcessingFailure::Decode(e)).await
            }
            Ok(envelope) => {
                tracing::debug!(
                    message_id = %message.message_id,
                    aggregate_id = %envelope.aggregate_id,
                    version = envelope.version,
                    type_code = %envelope.type_code,
                    "Decoded event message"
                );

                match self.store.append(&envelope).await {
                    Ok(AppendOutcome::Inserted) => {
                        tracing::info!(
                            message_id = %message.message_id,
                            aggregate_id = %envelope.aggregate_id,
                            version = envelope.version,
                            "✅ Stored event"
                        );
                        MessageOutcome::Persisted
                    }
                    Ok(AppendOutcome::AlreadyExists) => {
                        tracing::warn!(
                            message_id = %message.message_id,
                            aggregate_id = %envelope.aggregate_id,
                            version = envelope.version,
                            "Event already stored, treating redelivery as done"
                        );
                        MessageOutcome::AlreadyPersisted
                    }
                    Err(e) => {
                        tracing::error!(
                            message_id = %message.message_id,
                            aggregate_id = %envelope.aggregate_id,
                            version = envelope.version,
                            error = %e,
                            "❌ Can't store message"
                        );
                        self.metrics.append_failures.inc();
                        self.handle_failure(message, ProcessingFailure::Append(e)).await
                    }
                }
            }
        };

        let deleted = outcome.is_terminal() && self.acknowledge(message).await;

        self.metrics
            .record_outcome(outcome.as_str(), started.elapsed().as_secs_f64());

        ProcessedMessage { outcome, deleted }
    }

    async fn handle_failure(&self, message: &QueueMessage, failure: ProcessingFailure) -> MessageOutcome {
        match self.policy.on_failure(&failure, message.receive_count) {
            Disposition::Redeliver => {
                tracing::debug!(
                    message_id = %message.message_id,
                    receive_count = message.receive_count,
                    "Leaving message for redelivery"
                );
                MessageOutcome::LeftForRedelivery
            }
            Disposition::DeadLetter => {
                let letter = DeadLetter::from_message(message, failure.to_string());
                match self.dead_letters.send(letter).await {
                    Ok(()) => MessageOutcome::DeadLettered,
                    Err(e) => {
                        tracing::error!(
                            message_id = %message.message_id,
                            error = %e,
                            "Failed to dead-letter message, leaving it for redelivery"
                        );
                        self.metrics.dead_letter_failures.inc();
                        MessageOutcome::LeftForRedelivery
                    }
                }
            }
        }
    }

    async fn acknowledge(&self, message: &QueueMessage) -> bool {
        match self.source.delete(&message.receipt_handle).await {
            Ok(()) => {
                tracing::debug!(message_id = %message.message_id, "Deleted message from queue");
                true
            }
            Err(e) => {
                // The message comes back after its visibility timeout; reprocessing is a no-op append
                tracing::error!(
                    message_id = %message.message_id,
                    error = %e,
                    "Error deleting message"
                );
                self.metrics.delete_failures.inc();
                false
            }
        }
    }
}
