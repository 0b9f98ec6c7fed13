use std::sync::Arc;
use async_trait::async_trait;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

mod config;

use broker_consumer::contracts::{EVENT_VERSION_HEADER, TelemetryEvent};
use broker_consumer::messaging::{
    Chain, ChannelProvider, Consumer, Context, DeferredReleases, Handler, Message,
    OutcomeRouter, RabbitMqConnection, handle_fn,
};
use broker_consumer::metrics::{server::start_metrics_server, Metrics};
use config::Config;

struct TelemetryHandler {
    router: OutcomeRouter,
}

#[async_trait]
impl Handler for TelemetryHandler {
    async fn handle(
        &self,
        _ctx: &Context,
        _next: Arc<dyn Handler>,
        message: &Message,
    ) -> Arc<dyn Handler> {
        let result = TelemetryEvent::parse(event_version(message), message.body()).map(|event| {
            info!(event_type = %event.event_type, "Successfully processed v1 event");
        });

        self.router.route(result)
    }
}

fn event_version(message: &Message) -> &str {
    message.property(EVENT_VERSION_HEADER).unwrap_or("v1")
}

#[tokio::main]
async fn main() {
    setup_panic_handler();
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    setup_logging(&config.rust_log);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        service_name = %config.service_name,
        queue = %config.queue_name,
        retry_after_ms = config.retry_after.as_millis() as u64,
        "Broker consumer starting"
    );

    let rabbitmq = match RabbitMqConnection::connect(&config.rabbitmq_url, &config.service_name).await {
        Ok(conn) => conn,
        Err(e) => {
            eprintln!("Failed to connect to RabbitMQ: {}", e);
            std::process::exit(1);
        }
    };

    let channel =
        match ChannelProvider::create_channel(rabbitmq.get_connection(), config.prefetch_count)
            .await
        {
            Ok(ch) => ch,
            Err(e) => {
                eprintln!("Failed to create RabbitMQ channel: {}", e);
                std::process::exit(1);
            }
        };

    let metrics = match Metrics::new() {
        Ok(metrics) => metrics,
        Err(e) => {
            eprintln!("Failed to create metrics: {}", e);
            std::process::exit(1);
        }
    };

    let metrics_clone = metrics.clone();
    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_clone, metrics_port).await {
            eprintln!("Metrics server error: {}", e);
        }
    });

    let releases = DeferredReleases::with_metrics(metrics.clone());
    let router = OutcomeRouter::new(releases.retry_later(config.retry_after));

    let log_delivery = handle_fn(|_ctx, next, message| async move {
        info!(
            message_id = %message.id(),
            delivery_count = message.delivery_count(),
            "Handling telemetry message"
        );
        next
    });
    let telemetry: Arc<dyn Handler> = Arc::new(TelemetryHandler { router });
    let handler: Arc<dyn Handler> = Arc::new(Chain::new(vec![log_delivery, telemetry]));

    let root = Context::background();
    let consumer = Consumer::new(
        channel.clone(),
        config.queue_name.clone(),
        format!("{}-consumer", config.service_name),
        handler,
        root.clone(),
        config.message_timeout,
        metrics.clone(),
    );

    if let Err(e) = consumer.setup_queues().await {
        eprintln!("Failed to setup queue topology: {}", e);
        std::process::exit(1);
    }

    let consumer_handle = tokio::spawn(async move {
        if let Err(e) = consumer.start().await {
            eprintln!("Consumer error: {}", e);
        }
    });

    info!("Ready to process telemetry events");

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
    }

    warn!("Shutdown signal received, cleaning up...");

    // Ends the consume loop and every pending deferred release.
    root.cancel();

    if let Err(e) = tokio::time::timeout(config.shutdown_grace, consumer_handle).await {
        warn!(error = ?e, "Consumer shutdown timeout");
    }

    releases.shutdown(config.shutdown_grace).await;

    if let Err(e) = ChannelProvider::close_channel(channel).await {
        eprintln!("Error closing channel: {}", e);
    }

    if let Err(e) = rabbitmq.shutdown().await {
        eprintln!("Error during shutdown: {}", e);
    }

    info!("Broker consumer stopped");
}

fn setup_logging(rust_log: &str) {
    let log_level = match rust_log.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        eprintln!("PANIC: {} at {}", message, location);
        eprintln!("Thread: {:?}", std::thread::current().name());
    }));
}
