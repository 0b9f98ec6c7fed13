//! Terminal handlers that settle a message with the broker.
//!
//! Every handler here performs its settlement inline, logs a failure instead of returning
//! it, and hands back [`done()`].

use std::fmt::Display;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{Instrument, error, info};

use super::context::Context;
use super::handler::{Handler, done};
use super::message::{DeadLetterReason, Message};
use crate::telemetry::message_span;

pub fn complete() -> Arc<dyn Handler> {
    Arc::new(Complete)
}

/// Releases the message lock so the broker redelivers it right away.
pub fn abandon() -> Arc<dyn Handler> {
    Arc::new(Abandon)
}

pub fn dead_letter(err: impl Display) -> Arc<dyn Handler> {
    Arc::new(DeadLetter {
        reason: DeadLetterReason::new(err.to_string()),
    })
}

pub fn dead_letter_with_description(
    err: impl Display,
    description: impl Into<String>,
) -> Arc<dyn Handler> {
    Arc::new(DeadLetter {
        reason: DeadLetterReason::new(err.to_string()).with_description(description),
    })
}

/// Logs `err` against the message, then abandons it.
pub fn error(err: impl Display) -> Arc<dyn Handler> {
    Arc::new(ErrorHandler {
        error: err.to_string(),
    })
}

#[derive(Debug, Clone, Copy)]
pub struct Complete;

#[async_trait]
impl Handler for Complete {
    async fn handle(&self, ctx: &Context, _: Arc<dyn Handler>, message: &Message) -> Arc<dyn Handler> {
        async {
            match message.complete(ctx).await {
                Ok(()) => info!("Message completed"),
                Err(e) => error!(error = %e, "Failed to complete message"),
            }
        }
        .instrument(message_span("complete", message))
        .await;

        done()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Abandon;

impl Abandon {
    /// Abandons `message` and reports whether the broker took the release.
    pub async fn release(&self, ctx: &Context, message: &Message) -> bool {
        async {
            match message.abandon(ctx).await {
                Ok(()) => {
                    info!("Message abandoned");
                    true
                }
                Err(e) => {
                    error!(error = %e, "Failed to abandon message");
                    false
                }
            }
        }
        .instrument(message_span("abandon", message))
        .await
    }
}

#[async_trait]
impl Handler for Abandon {
    async fn handle(&self, ctx: &Context, _: Arc<dyn Handler>, message: &Message) -> Arc<dyn Handler> {
        self.release(ctx, message).await;
        done()
    }
}

#[derive(Debug, Clone)]
pub struct DeadLetter {
    reason: DeadLetterReason,
}

#[async_trait]
impl Handler for DeadLetter {
    async fn handle(&self, ctx: &Context, _: Arc<dyn Handler>, message: &Message) -> Arc<dyn Handler> {
        async {
            match message.dead_letter(ctx, &self.reason).await {
                Ok(()) => info!(reason = %self.reason.reason, "Message dead-lettered"),
                Err(e) => error!(
                    error = %e,
                    reason = %self.reason.reason,
                    "Failed to dead-letter message"
                ),
            }
        }
        .instrument(message_span("dead_letter", message))
        .await;

        done()
    }
}

#[derive(Debug, Clone)]
pub struct ErrorHandler {
    error: String,
}

#[async_trait]
impl Handler for ErrorHandler {
    async fn handle(&self, ctx: &Context, next: Arc<dyn Handler>, message: &Message) -> Arc<dyn Handler> {
        message_span("error", message).in_scope(|| {
            error!(error = %self.error, "Message handling failed, abandoning");
        });

        abandon().handle(ctx, next, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::message::testing::{RecordingSettler, SettleAction};

    #[tokio::test]
    async fn test_complete_settles_once() {
        let settler = RecordingSettler::new();
        let message = settler.message("m-1");

        let next = complete().handle(&Context::background(), done(), &message).await;

        assert!(next.is_done());
        assert_eq!(settler.count(SettleAction::Complete), 1);
        assert_eq!(settler.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_abandon_settles_once() {
        let settler = RecordingSettler::new();
        let message = settler.message("m-1");

        let next = abandon().handle(&Context::background(), done(), &message).await;

        assert!(next.is_done());
        assert_eq!(settler.count(SettleAction::Abandon), 1);
    }

    #[tokio::test]
    async fn test_dead_letter_carries_reason() {
        let settler = RecordingSettler::new();
        let message = settler.message("m-1");

        dead_letter_with_description("Missing required field: eventType", "permanent")
            .handle(&Context::background(), done(), &message)
            .await;

        let calls = settler.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].action, SettleAction::DeadLetter);
        assert_eq!(
            calls[0].reason,
            Some(
                DeadLetterReason::new("Missing required field: eventType")
                    .with_description("permanent")
            )
        );
    }

    #[tokio::test]
    async fn test_error_abandons() {
        let settler = RecordingSettler::new();
        let message = settler.message("m-1");

        let next = error("downstream unavailable")
            .handle(&Context::background(), done(), &message)
            .await;

        assert!(next.is_done());
        assert_eq!(settler.count(SettleAction::Abandon), 1);
    }

    #[tokio::test]
    async fn test_release_reports_outcome() {
        let ctx = Context::background();

        let settler = RecordingSettler::new();
        assert!(Abandon.release(&ctx, &settler.message("m-1")).await);

        let failing = RecordingSettler::failing();
        assert!(!Abandon.release(&ctx, &failing.message("m-2")).await);

        let cancelled = Context::background();
        cancelled.cancel();
        assert!(!Abandon.release(&cancelled, &settler.message("m-3")).await);
        assert_eq!(settler.count(SettleAction::Abandon), 1);
    }

    #[tokio::test]
    async fn test_settlement_failure_is_swallowed() {
        let settler = RecordingSettler::failing();
        let message = settler.message("m-1");

        let next = abandon().handle(&Context::background(), done(), &message).await;

        assert!(next.is_done());
        assert_eq!(settler.count(SettleAction::Abandon), 1);
    }
}
