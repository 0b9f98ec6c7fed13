use std::sync::Arc;

use async_trait::async_trait;
use lapin::{
    BasicProperties, Channel,
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions, BasicPublishOptions},
    types::{AMQPValue, FieldTable},
};
use tracing::{error, info};

use super::message::{DeadLetterReason, Message, MessageSettler, SettlementError};
use crate::metrics::Metrics;

const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";
const ERROR_REASON_HEADER: &str = "x-error-reason";
const ERROR_DESCRIPTION_HEADER: &str = "x-error-description";
const ORIGINAL_QUEUE_HEADER: &str = "x-original-queue";

pub fn dead_letter_queue(queue_name: &str) -> String {
    format!("{}.dlq", queue_name)
}

/// Settles one RabbitMQ delivery on the channel it arrived on.
///
/// Abandon maps to a requeueing nack. Dead-lettering republishes the body to
/// `<queue>.dlq` with the reason in headers and then acks, since a plain reject would
/// drop the reason.
pub struct LapinSettler {
    channel: Channel,
    queue_name: String,
    delivery_tag: u64,
    properties: BasicProperties,
    metrics: Option<Arc<Metrics>>,
}

impl LapinSettler {
    pub fn new(
        channel: Channel,
        queue_name: String,
        delivery_tag: u64,
        properties: BasicProperties,
    ) -> Self {
        Self {
            channel,
            queue_name,
            delivery_tag,
            properties,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn record(
        &self,
        action: &'static str,
        result: Result<(), lapin::Error>,
    ) -> Result<(), SettlementError> {
        match result {
            Ok(()) => {
                if let Some(metrics) = &self.metrics {
                    metrics
                        .messages_settled_total
                        .with_label_values(&[&self.queue_name, action])
                        .inc();
                }
                Ok(())
            }
            Err(e) => {
                error!(error = %e, delivery_tag = self.delivery_tag, action, "Broker settlement failed");
                if let Some(metrics) = &self.metrics {
                    metrics
                        .settlement_failures_total
                        .with_label_values(&[&self.queue_name, action])
                        .inc();
                }
                Err(SettlementError::Broker {
                    action,
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn publish_to_dlq(
        &self,
        message: &Message,
        reason: &DeadLetterReason,
    ) -> Result<(), lapin::Error> {
        let dlq_name = dead_letter_queue(&self.queue_name);
        let headers = dead_letter_headers(&self.properties, &self.queue_name, reason);

        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default();
        let dlq_properties = BasicProperties::default()
            .with_headers(headers)
            .with_delivery_mode(2)
            .with_timestamp(timestamp);

        self.channel
            .basic_publish(
                "",
                &dlq_name,
                BasicPublishOptions::default(),
                message.body(),
                dlq_properties,
            )
            .await?
            .await?;

        self.channel
            .basic_ack(self.delivery_tag, BasicAckOptions::default())
            .await?;

        info!(
            delivery_tag = self.delivery_tag,
            reason = %reason.reason,
            dlq = %dlq_name,
            "Message sent to DLQ with error metadata"
        );
        Ok(())
    }
}

#[async_trait]
impl MessageSettler for LapinSettler {
    async fn complete(&self, _message: &Message) -> Result<(), SettlementError> {
        let result = self
            .channel
            .basic_ack(self.delivery_tag, BasicAckOptions::default())
            .await;
        self.record("complete", result)
    }

    async fn abandon(&self, _message: &Message) -> Result<(), SettlementError> {
        let result = self
            .channel
            .basic_nack(
                self.delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue: true,
                },
            )
            .await;
        self.record("abandon", result)
    }

    async fn dead_letter(
        &self,
        message: &Message,
        reason: &DeadLetterReason,
    ) -> Result<(), SettlementError> {
        let result = self.publish_to_dlq(message, reason).await;
        self.record("dead_letter", result)
    }
}

/// Wraps a delivery in a [`Message`] settled through `channel`.
pub fn message_from_delivery(
    delivery: Delivery,
    channel: Channel,
    queue_name: &str,
    metrics: Option<Arc<Metrics>>,
) -> Message {
    let id = delivery
        .properties
        .message_id()
        .as_ref()
        .map(|id| id.as_str().to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let delivery_count = delivery_count(&delivery.properties, delivery.redelivered);
    let properties = delivery.properties.clone();

    let mut settler = LapinSettler::new(
        channel,
        queue_name.to_string(),
        delivery.delivery_tag,
        delivery.properties,
    );
    if let Some(metrics) = metrics {
        settler = settler.with_metrics(metrics);
    }

    let mut message = Message::new(id, delivery.data, Arc::new(settler))
        .with_routing_key(delivery.routing_key.as_str())
        .with_lock_token(delivery.delivery_tag.to_string())
        .with_delivery_count(delivery_count);

    for (key, value) in string_headers(&properties) {
        message = message.with_property(key, value);
    }
    message
}

/// Headers with string values, the ones handlers route on.
pub fn string_headers(properties: &BasicProperties) -> Vec<(String, String)> {
    let Some(headers) = properties.headers() else {
        return Vec::new();
    };

    headers
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::LongString(s) => s.to_string(),
                AMQPValue::ShortString(s) => s.as_str().to_string(),
                _ => return None,
            };
            Some((key.as_str().to_string(), value))
        })
        .collect()
}

/// 1-based delivery count. Quorum queues report prior deliveries in
/// `x-delivery-count`; classic queues only flag redeliveries.
pub fn delivery_count(properties: &BasicProperties, redelivered: bool) -> u32 {
    let previous = properties
        .headers()
        .as_ref()
        .and_then(|headers| headers.inner().get(DELIVERY_COUNT_HEADER))
        .and_then(|value| match value {
            AMQPValue::ShortShortUInt(count) => Some(u32::from(*count)),
            AMQPValue::ShortUInt(count) => Some(u32::from(*count)),
            AMQPValue::LongUInt(count) => Some(*count),
            AMQPValue::LongInt(count) => u32::try_from(*count).ok(),
            AMQPValue::LongLongInt(count) => u32::try_from(*count).ok(),
            _ => None,
        });

    match previous {
        Some(previous) => previous.saturating_add(1),
        None if redelivered => 2,
        None => 1,
    }
}

pub fn dead_letter_headers(
    properties: &BasicProperties,
    queue_name: &str,
    reason: &DeadLetterReason,
) -> FieldTable {
    let mut headers = properties.headers().clone().unwrap_or_default();

    headers.insert(
        ERROR_REASON_HEADER.into(),
        AMQPValue::LongString(reason.reason.as_str().into()),
    );
    if let Some(description) = &reason.description {
        headers.insert(
            ERROR_DESCRIPTION_HEADER.into(),
            AMQPValue::LongString(description.as_str().into()),
        );
    }
    headers.insert(
        ORIGINAL_QUEUE_HEADER.into(),
        AMQPValue::LongString(queue_name.into()),
    );

    headers
}
