use futures::StreamExt;
use lapin::{options::*, types::FieldTable, Channel};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use super::context::Context;
use super::handler::{dispatch, Handler};
use super::lapin_settler::{dead_letter_queue, message_from_delivery};
use crate::metrics::Metrics;

pub struct Consumer {
    channel: Channel,
    queue_name: String,
    consumer_tag: String,
    handler: Arc<dyn Handler>,
    context: Context,
    message_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl Consumer {
    /// `context` is the consumer's root context: cancelling it stops the consume loop and
    /// every message context derived from it, pending deferred releases included.
    pub fn new(
        channel: Channel,
        queue_name: String,
        consumer_tag: String,
        handler: Arc<dyn Handler>,
        context: Context,
        message_timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            channel,
            queue_name,
            consumer_tag,
            handler,
            context,
            message_timeout,
            metrics,
        }
    }

    pub async fn setup_queues(&self) -> Result<(), ConsumerError> {
        let dlq_name = dead_letter_queue(&self.queue_name);

        self.channel
            .queue_declare(
                &dlq_name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| ConsumerError::SetupFailed(format!("DLQ setup failed: {}", e)))?;

        let mut main_args = FieldTable::default();
        main_args.insert(
            "x-dead-letter-exchange".into(),
            lapin::types::AMQPValue::LongString("".into()),
        );
        main_args.insert(
            "x-dead-letter-routing-key".into(),
            lapin::types::AMQPValue::LongString(dlq_name.clone().into()),
        );

        self.channel
            .queue_declare(
                &self.queue_name,
                QueueDeclareOptions {
                    durable: true,
                    passive: false,
                    ..Default::default()
                },
                main_args,
            )
            .await
            .map_err(|e| ConsumerError::SetupFailed(format!("Main queue setup failed: {}", e)))?;

        info!(
            queue = %self.queue_name,
            dlq = %dlq_name,
            message_timeout_ms = self.message_timeout.as_millis() as u64,
            "Queue topology configured"
        );

        Ok(())
    }

    pub async fn start(self) -> Result<(), ConsumerError> {
        info!(
            queue = %self.queue_name,
            consumer_tag = %self.consumer_tag,
            "Starting RabbitMQ consumer"
        );

        let mut consumer = self
            .channel
            .basic_consume(
                &self.queue_name,
                &self.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                error!(error = %e, queue = %self.queue_name, "Failed to start consumer");
                ConsumerError::ConsumeFailed(e.to_string())
            })?;
        info!(
            queue = %self.queue_name,
            consumer_tag = %self.consumer_tag,
            "Consumer started successfully"
        );

        self.metrics.active_consumers.inc();

        loop {
            tokio::select! {
                _ = self.context.done() => {
                    info!(
                        consumer_tag = %self.consumer_tag,
                        "Shutdown signal received, stopping consumer"
                    );
                    break;
                }

                delivery = consumer.next() => {
                    match delivery {
                        Some(Ok(delivery)) => {
                            self.process_message(delivery).await;
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "Error receiving message from RabbitMQ");
                        }
                        None => {
                            warn!("Consumer stream ended");
                            break;
                        }
                    }
                }
            }
        }

        self.metrics.active_consumers.dec();
        info!(consumer_tag = %self.consumer_tag, "Consumer stopped");
        Ok(())
    }

    async fn process_message(&self, delivery: lapin::message::Delivery) {
        let delivery_tag = delivery.delivery_tag;
        let message = message_from_delivery(
            delivery,
            self.channel.clone(),
            &self.queue_name,
            Some(self.metrics.clone()),
        );

        info!(
            delivery_tag,
            message_id = %message.id(),
            routing_key = message.routing_key().unwrap_or_default(),
            delivery_count = message.delivery_count(),
            payload_size = message.body().len(),
            "Processing message"
        );

        self.metrics
            .messages_received_total
            .with_label_values(&[&self.queue_name])
            .inc();

        // Outlives this call when a stage defers its decision; bounded by the timeout.
        let ctx = self.context.with_timeout(self.message_timeout);

        let start = std::time::Instant::now();
        dispatch(&ctx, &self.handler, &message).await;
        let duration = start.elapsed().as_secs_f64();

        self.metrics
            .message_handling_duration_seconds
            .with_label_values(&[&self.queue_name])
            .observe(duration);

        info!(delivery_tag, duration_ms = duration * 1000.0, "Message handled");
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("Failed to start consumer: {0}")]
    ConsumeFailed(String),

    #[error("Failed to setup queue topology: {0}")]
    SetupFailed(String),
}
