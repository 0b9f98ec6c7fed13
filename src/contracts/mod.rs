pub mod processing_error;
pub mod telemetry_event;

pub use processing_error::ProcessingError;
pub use telemetry_event::{EVENT_VERSION_HEADER, TelemetryEvent};
