use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::types::{Message, MessageSystemAttributeName};
use aws_sdk_sqs::Client;
use std::time::Duration;

use super::{MessageSource, QueueError, QueueMessage, ReceiveRequest};
use crate::config::QueueSettings;

// ============================================================================
// Amazon SQS Message Source
// ============================================================================

pub struct SqsMessageSource {
    client: Client,
    queue_url: String,
}

impl SqsMessageSource {
    pub fn new(client: Client, queue_url: impl Into<String>) -> Self {
        Self {
            client,
            queue_url: queue_url.into(),
        }
    }

    /// Build a client for the configured region using the default AWS credential chain
    pub async fn from_settings(queue: &QueueSettings) -> Self {
        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(queue.region.clone()))
            .load()
            .await;

        tracing::info!(
            queue_url = %queue.url,
            region = %queue.region,
            "Created SQS client"
        );

        Self::new(Client::new(&sdk_config), queue.url.clone())
    }
}

fn whole_seconds(duration: Duration) -> i32 {
    i32::try_from(duration.as_secs()).unwrap_or(i32::MAX)
}

/// Map an SQS message; messages without a receipt handle cannot be acknowledged and are dropped
fn to_queue_message(message: Message) -> Option<QueueMessage> {
    let Some(receipt_handle) = message.receipt_handle else {
        tracing::warn!(
            message_id = ?message.message_id,
            "Received SQS message without receipt handle, ignoring"
        );
        return None;
    };

    let receive_count = message
        .attributes
        .as_ref()
        .and_then(|attrs| attrs.get(&MessageSystemAttributeName::ApproximateReceiveCount))
        .and_then(|count| count.parse::<u32>().ok())
        .unwrap_or(1);

    Some(QueueMessage {
        message_id: message.message_id.unwrap_or_default(),
        receipt_handle,
        body: message.body.unwrap_or_default(),
        receive_count,
    })
}

#[async_trait]
impl MessageSource for SqsMessageSource {
    async fn receive(&self, request: &ReceiveRequest) -> Result<Vec<QueueMessage>, QueueError> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(request.max_messages)
            .wait_time_seconds(whole_seconds(request.wait_time))
            .visibility_timeout(whole_seconds(request.visibility_timeout))
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
            .send()
            .await
            .map_err(|e| QueueError::Receive(DisplayErrorContext(&e).to_string()))?;

        Ok(output
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(to_queue_message)
            .collect())
    }

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| QueueError::Delete(DisplayErrorContext(&e).to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_maps_sqs_message() {
        let message = Message::builder()
            .message_id("m-1")
            .receipt_handle("rh-1")
            .body(r#"{"Message":"acct-1|3|Deposited|{amt:50}"}"#)
            .attributes(MessageSystemAttributeName::ApproximateReceiveCount, "4")
            .build();

        let mapped = to_queue_message(message).unwrap();

        assert_eq!(mapped.message_id, "m-1");
        assert_eq!(mapped.receipt_handle, "rh-1");
        assert_eq!(mapped.body, r#"{"Message":"acct-1|3|Deposited|{amt:50}"}"#);
        assert_eq!(mapped.receive_count, 4);
    }

    #[test]
    fn test_missing_receive_count_defaults_to_first_delivery() {
        let message = Message::builder().receipt_handle("rh-1").build();

        let mapped = to_queue_message(message).unwrap();

        assert_eq!(mapped.receive_count, 1);
        assert_eq!(mapped.body, "");
        assert_eq!(mapped.message_id, "");
    }

    #[test]
    fn test_message_without_receipt_handle_is_dropped() {
        let message = Message::builder().message_id("m-1").body("x").build();
        assert!(to_queue_message(message).is_none());
    }

    #[test]
    fn test_whole_seconds() {
        assert_eq!(whole_seconds(Duration::from_secs(5)), 5);
        assert_eq!(whole_seconds(Duration::from_millis(1500)), 1);
        assert_eq!(whole_seconds(Duration::from_secs(u64::MAX)), i32::MAX);
    }
}
