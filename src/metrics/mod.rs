use prometheus::{CounterVec, Gauge, HistogramOpts, HistogramVec, IntGauge, Opts, Registry};
use std::sync::Arc;

pub mod server;

pub struct Metrics {
    pub messages_received_total: CounterVec,
    pub messages_settled_total: CounterVec,
    pub settlement_failures_total: CounterVec,
    pub message_handling_duration_seconds: HistogramVec,
    pub deferred_releases_pending: IntGauge,
    pub deferred_releases_total: CounterVec,
    pub active_consumers: Gauge,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let messages_received_total = CounterVec::new(
            Opts::new(
                "consumer_messages_received_total",
                "Total number of deliveries received from the broker",
            ),
            &["queue"],
        )?;

        let messages_settled_total = CounterVec::new(
            Opts::new(
                "consumer_messages_settled_total",
                "Total number of messages settled with the broker",
            ),
            &["queue", "action"],
        )?;

        let settlement_failures_total = CounterVec::new(
            Opts::new(
                "consumer_settlement_failures_total",
                "Total number of settlement calls rejected or failed",
            ),
            &["queue", "action"],
        )?;

        let message_handling_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "consumer_message_handling_duration_seconds",
                "Time the handler chain held the consumer loop for one message",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
            &["queue"],
        )?;

        let deferred_releases_pending = IntGauge::new(
            "consumer_deferred_releases_pending",
            "Number of messages waiting on a deferred release",
        )?;

        let deferred_releases_total = CounterVec::new(
            Opts::new(
                "consumer_deferred_releases_total",
                "Total number of deferred releases by outcome",
            ),
            &["outcome"],
        )?;

        let active_consumers = Gauge::new(
            "consumer_active_consumers",
            "Number of active consumer loops",
        )?;

        registry.register(Box::new(messages_received_total.clone()))?;
        registry.register(Box::new(messages_settled_total.clone()))?;
        registry.register(Box::new(settlement_failures_total.clone()))?;
        registry.register(Box::new(message_handling_duration_seconds.clone()))?;
        registry.register(Box::new(deferred_releases_pending.clone()))?;
        registry.register(Box::new(deferred_releases_total.clone()))?;
        registry.register(Box::new(active_consumers.clone()))?;

        Ok(Arc::new(Self {
            messages_received_total,
            messages_settled_total,
            settlement_failures_total,
            message_handling_duration_seconds,
            deferred_releases_pending,
            deferred_releases_total,
            active_consumers,
            registry,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_families_registered() {
        let metrics = Metrics::new().unwrap();
        metrics
            .messages_received_total
            .with_label_values(&["telemetry"])
            .inc();
        metrics
            .messages_settled_total
            .with_label_values(&["telemetry", "complete"])
            .inc();
        metrics
            .settlement_failures_total
            .with_label_values(&["telemetry", "abandon"])
            .inc();
        metrics
            .message_handling_duration_seconds
            .with_label_values(&["telemetry"])
            .observe(0.01);
        metrics
            .deferred_releases_total
            .with_label_values(&["abandoned"])
            .inc();

        let names: Vec<String> = metrics
            .registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();

        for expected in [
            "consumer_messages_received_total",
            "consumer_messages_settled_total",
            "consumer_settlement_failures_total",
            "consumer_message_handling_duration_seconds",
            "consumer_deferred_releases_pending",
            "consumer_deferred_releases_total",
            "consumer_active_consumers",
        ] {
            assert!(names.iter().any(|name| name == expected), "missing {expected}");
        }
    }
}
