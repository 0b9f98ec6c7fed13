use std::sync::Arc;

use super::handler::Handler;
use super::settlement::{complete, dead_letter_with_description};
use crate::contracts::ProcessingError;

/// Maps the result of business processing onto the handler that settles the message.
#[derive(Clone)]
pub struct OutcomeRouter {
    retry: Arc<dyn Handler>,
}

impl OutcomeRouter {
    /// `retry` handles transient failures, usually a deferred-release stage.
    pub fn new(retry: Arc<dyn Handler>) -> Self {
        Self { retry }
    }

    pub fn route(&self, result: Result<(), ProcessingError>) -> Arc<dyn Handler> {
        match result {
            Ok(()) => complete(),
            Err(err @ ProcessingError::Transient { .. }) => {
                tracing::warn!(error = %err, "Transient error, scheduling retry");
                self.retry.clone()
            }
            Err(err @ ProcessingError::Permanent { .. }) => {
                tracing::error!(error = %err, "Permanent error, sending to DLQ");
                dead_letter_with_description(err.reason(), err.error_type())
            }
        }
    }
}
