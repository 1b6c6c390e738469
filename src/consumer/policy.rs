use std::sync::Arc;

use crate::config::RedeliveryMode;
use crate::event_sourcing::{DecodeError, StoreError};
use crate::utils::IsTransient;

// ============================================================================
// Redelivery Policy
// ============================================================================
//
// Decides what happens to a message whose processing failed:
// - Redeliver:  leave it in the queue; it becomes visible again after the
//               visibility timeout
// - DeadLetter: store it in the dead letter table, then delete it
//
// Only failures that will repeat on every delivery are ever dead-lettered.
//
// ============================================================================

/// Why a message could not be brought to a terminal success
#[derive(Debug, thiserror::Error)]
pub enum ProcessingFailure {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Append(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Redeliver,
    DeadLetter,
}

pub trait RedeliveryPolicy: Send + Sync {
    /// `receive_count` is 1 on the first delivery of the message
    fn on_failure(&self, failure: &ProcessingFailure, receive_count: u32) -> Disposition;
}

/// Never gives up on a message
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryForever;

impl RedeliveryPolicy for RetryForever {
    fn on_failure(&self, _failure: &ProcessingFailure, _receive_count: u32) -> Disposition {
        Disposition::Redeliver
    }
}

/// Dead-letters a message after `max_receives` deliveries when it can never
/// succeed: it does not decode, or the store rejected the row itself.
/// Transient store failures are always redelivered.
#[derive(Debug, Clone, Copy)]
pub struct CappedRetry {
    pub max_receives: u32,
}

impl RedeliveryPolicy for CappedRetry {
    fn on_failure(&self, failure: &ProcessingFailure, receive_count: u32) -> Disposition {
        let permanent = match failure {
            ProcessingFailure::Decode(_) => true,
            ProcessingFailure::Append(e) => !e.is_transient(),
        };

        if permanent && receive_count >= self.max_receives {
            Disposition::DeadLetter
        } else {
            Disposition::Redeliver
        }
    }
}

pub fn policy_for(mode: RedeliveryMode) -> Arc<dyn RedeliveryPolicy> {
    match mode {
        RedeliveryMode::RetryForever => Arc::new(RetryForever),
        RedeliveryMode::Capped { max_receives } => Arc::new(CappedRetry { max_receives }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_sourcing::test_support::rejected_row;
    use crate::event_sourcing::EnvelopeCodec;

    fn decode_failure() -> ProcessingFailure {
        EnvelopeCodec::decode(r#"{"Message":"garbage"}"#).unwrap_err().into()
    }

    fn append_failure() -> ProcessingFailure {
        StoreError::CircuitOpen.into()
    }

    #[test]
    fn test_retry_forever_never_dead_letters() {
        let policy = RetryForever;
        for receive_count in [1, 5, 1_000] {
            assert_eq!(policy.on_failure(&decode_failure(), receive_count), Disposition::Redeliver);
            assert_eq!(policy.on_failure(&append_failure(), receive_count), Disposition::Redeliver);
        }
    }

    #[test]
    fn test_capped_retry_dead_letters_decode_failures_at_cap() {
        let policy = CappedRetry { max_receives: 3 };

        assert_eq!(policy.on_failure(&decode_failure(), 1), Disposition::Redeliver);
        assert_eq!(policy.on_failure(&decode_failure(), 2), Disposition::Redeliver);
        assert_eq!(policy.on_failure(&decode_failure(), 3), Disposition::DeadLetter);
        assert_eq!(policy.on_failure(&decode_failure(), 4), Disposition::DeadLetter);
    }

    #[test]
    fn test_capped_retry_keeps_redelivering_transient_store_failures() {
        let policy = CappedRetry { max_receives: 1 };
        assert_eq!(policy.on_failure(&append_failure(), 50), Disposition::Redeliver);

        let pool_timeout: ProcessingFailure = StoreError::Append(sqlx::Error::PoolTimedOut).into();
        assert_eq!(policy.on_failure(&pool_timeout, 1_000_000), Disposition::Redeliver);
    }

    #[test]
    fn test_capped_retry_dead_letters_rejected_rows_at_cap() {
        let policy = CappedRetry { max_receives: 5 };
        let rejected: ProcessingFailure = StoreError::Append(rejected_row("22021")).into();

        assert_eq!(policy.on_failure(&rejected, 1), Disposition::Redeliver);
        assert_eq!(policy.on_failure(&rejected, 4), Disposition::Redeliver);
        assert_eq!(policy.on_failure(&rejected, 5), Disposition::DeadLetter);
        assert_eq!(policy.on_failure(&rejected, 1_000_000), Disposition::DeadLetter);
    }

    #[test]
    fn test_retry_forever_keeps_rejected_rows() {
        let rejected: ProcessingFailure = StoreError::Append(rejected_row("22021")).into();
        assert_eq!(RetryForever.on_failure(&rejected, 1_000_000), Disposition::Redeliver);
    }

    #[test]
    fn test_policy_for_mode() {
        let capped = policy_for(RedeliveryMode::Capped { max_receives: 1 });
        assert_eq!(capped.on_failure(&decode_failure(), 1), Disposition::DeadLetter);

        let forever = policy_for(RedeliveryMode::RetryForever);
        assert_eq!(forever.on_failure(&decode_failure(), 1), Disposition::Redeliver);
    }

    #[test]
    fn test_failure_message_is_the_underlying_error() {
        assert_eq!(
            decode_failure().to_string(),
            "malformed envelope: expected 4 fields, found 1"
        );
    }
}
