use std::env;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_QUEUE_NAME: &str = "telemetry";
const DEFAULT_RETRY_AFTER_MS: u64 = 5_000;
// Matches the longest lock duration brokers commonly allow.
const DEFAULT_MESSAGE_TIMEOUT_MS: u64 = 300_000;
const DEFAULT_PREFETCH_COUNT: u16 = 10;
const DEFAULT_METRICS_PORT: u16 = 9090;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;

#[derive(Debug, Clone)]
pub struct Config {
    pub rabbitmq_url: String,
    pub service_name: String,
    pub rust_log: String,
    pub queue_name: String,
    pub retry_after: Duration,
    pub message_timeout: Duration,
    pub prefetch_count: u16,
    pub metrics_port: u16,
    pub shutdown_grace: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let rabbitmq_url =
            lookup("RABBITMQ_URL").ok_or(ConfigError::MissingRequired("RABBITMQ_URL"))?;

        let service_name =
            lookup("SERVICE_NAME").ok_or(ConfigError::MissingRequired("SERVICE_NAME"))?;

        let rust_log = lookup("RUST_LOG").unwrap_or_else(|| "info".to_string());
        let queue_name = lookup("QUEUE_NAME").unwrap_or_else(|| DEFAULT_QUEUE_NAME.to_string());

        let retry_after = Duration::from_millis(parse_or(
            &lookup,
            "RETRY_AFTER_MS",
            DEFAULT_RETRY_AFTER_MS,
        )?);
        let message_timeout = Duration::from_millis(parse_or(
            &lookup,
            "MESSAGE_TIMEOUT_MS",
            DEFAULT_MESSAGE_TIMEOUT_MS,
        )?);
        if retry_after >= message_timeout {
            return Err(ConfigError::InvalidValue {
                name: "RETRY_AFTER_MS",
                value: retry_after.as_millis().to_string(),
            });
        }
        let prefetch_count = parse_or(&lookup, "PREFETCH_COUNT", DEFAULT_PREFETCH_COUNT)?;
        let metrics_port = parse_or(&lookup, "METRICS_PORT", DEFAULT_METRICS_PORT)?;
        let shutdown_grace = Duration::from_millis(parse_or(
            &lookup,
            "SHUTDOWN_GRACE_MS",
            DEFAULT_SHUTDOWN_GRACE_MS,
        )?);

        Ok(Self {
            rabbitmq_url,
            service_name,
            rust_log,
            queue_name,
            retry_after,
            message_timeout,
            prefetch_count,
            metrics_port,
            shutdown_grace,
        })
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value: raw }),
        None => Ok(default),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingRequired(&'static str),

    #[error("Invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[
            ("RABBITMQ_URL", "amqp://localhost:5672"),
            ("SERVICE_NAME", "collector"),
        ])
        .unwrap();

        assert_eq!(config.rust_log, "info");
        assert_eq!(config.queue_name, "telemetry");
        assert_eq!(config.retry_after, Duration::from_secs(5));
        assert_eq!(config.message_timeout, Duration::from_secs(300));
        assert_eq!(config.prefetch_count, 10);
        assert_eq!(config.metrics_port, 9090);
        assert_eq!(config.shutdown_grace, Duration::from_secs(5));
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("RABBITMQ_URL", "amqp://localhost:5672"),
            ("SERVICE_NAME", "collector"),
            ("QUEUE_NAME", "events"),
            ("RETRY_AFTER_MS", "250"),
            ("MESSAGE_TIMEOUT_MS", " 60000 "),
            ("PREFETCH_COUNT", "50"),
        ])
        .unwrap();

        assert_eq!(config.queue_name, "events");
        assert_eq!(config.retry_after, Duration::from_millis(250));
        assert_eq!(config.message_timeout, Duration::from_secs(60));
        assert_eq!(config.prefetch_count, 50);
    }

    #[test]
    fn test_missing_required() {
        let err = load(&[("SERVICE_NAME", "collector")]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired("RABBITMQ_URL")));
    }

    #[test]
    fn test_retry_after_must_fit_message_timeout() {
        for (retry_after, timeout) in [("300000", None), ("60000", Some("60000")), ("90000", Some("60000"))] {
            let mut vars = vec![
                ("RABBITMQ_URL", "amqp://localhost:5672"),
                ("SERVICE_NAME", "collector"),
                ("RETRY_AFTER_MS", retry_after),
            ];
            if let Some(timeout) = timeout {
                vars.push(("MESSAGE_TIMEOUT_MS", timeout));
            }

            let err = load(&vars).unwrap_err();
            assert!(
                matches!(&err, ConfigError::InvalidValue { name: "RETRY_AFTER_MS", value } if value == retry_after),
                "unexpected error for {retry_after}: {err}"
            );
        }

        let config = load(&[
            ("RABBITMQ_URL", "amqp://localhost:5672"),
            ("SERVICE_NAME", "collector"),
            ("RETRY_AFTER_MS", "59999"),
            ("MESSAGE_TIMEOUT_MS", "60000"),
        ])
        .unwrap();
        assert_eq!(config.retry_after, Duration::from_millis(59_999));
    }

    #[test]
    fn test_invalid_number() {
        let err = load(&[
            ("RABBITMQ_URL", "amqp://localhost:5672"),
            ("SERVICE_NAME", "collector"),
            ("RETRY_AFTER_MS", "soon"),
        ])
        .unwrap_err();

        assert!(matches!(
            err,
            ConfigError::InvalidValue { name: "RETRY_AFTER_MS", .. }
        ));
    }
}
