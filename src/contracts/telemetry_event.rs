use serde::Deserialize;
use serde_json::Value;

use super::ProcessingError;

pub const EVENT_VERSION_HEADER: &str = "x-event-version";

/// Telemetry event as published by the SDKs (schema v1).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TelemetryEvent {
    #[serde(rename = "eventType")]
    pub event_type: String,
    pub payload: Value,
}

impl TelemetryEvent {
    /// Parses and validates a message body for the given schema version.
    ///
    /// A top-level `"fail": "transient" | "permanent"` field forces the matching error,
    /// which the publish demos use to exercise the retry and DLQ paths.
    pub fn parse(version: &str, body: &[u8]) -> Result<Self, ProcessingError> {
        if version != "v1" {
            return Err(ProcessingError::permanent(format!(
                "Unsupported event version: {}. Only v1 is supported.",
                version
            )));
        }

        let json: Value = serde_json::from_slice(body)?;

        match json.get("fail").and_then(Value::as_str) {
            Some("transient") => {
                return Err(ProcessingError::transient("Simulated transient failure"));
            }
            Some("permanent") => {
                return Err(ProcessingError::permanent("Simulated permanent failure"));
            }
            _ => {}
        }

        for field in ["eventType", "payload"] {
            if json.get(field).is_none() {
                return Err(ProcessingError::permanent(format!(
                    "Missing required field: {}",
                    field
                )));
            }
        }

        Ok(serde_json::from_value(json)?)
    }
}
