//! Deferred release: give up on a delivery attempt only after a delay.
//!
//! [`RetryLaterHandler`] returns [`done()`] to the pipeline straight away and spawns a task
//! that races the message context against a timer. If the timer wins the message is
//! abandoned so the broker redelivers it; if the context ends first the expiry is logged
//! and the message is left alone, to come back once its broker lock lapses.
//!
//! Keep `retry_after` plus handling time inside the queue's lock duration (five minutes
//! at most on most brokers). Past that point the broker may already have handed the
//! message to someone else and the abandon is rejected. The handler warns when it can
//! see this happening but does not shorten the delay.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, warn};

use super::context::{Context, ContextError};
use super::handler::{Handler, done};
use super::message::Message;
use super::settlement::Abandon;
use crate::metrics::Metrics;
use crate::telemetry::message_span;

/// How a deferred release ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The delay elapsed and the broker accepted the abandon.
    Abandoned,
    /// The delay elapsed but the abandon was rejected or cut short by the context.
    AbandonFailed,
    /// The context ended first; nothing was done to the message.
    Expired,
}

impl ReleaseOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Abandoned => "abandoned",
            Self::AbandonFailed => "abandon_failed",
            Self::Expired => "expired",
        }
    }
}

/// Registry of in-flight deferred releases.
///
/// Every wait spawned by a [`RetryLaterHandler`] is registered here so the service can
/// report how many are outstanding and wait for them when shutting down. Spawning never
/// blocks; there is no cap on outstanding waits.
#[derive(Default)]
pub struct DeferredReleases {
    tracker: TaskTracker,
    metrics: Option<Arc<Metrics>>,
}

impl DeferredReleases {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_metrics(metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self {
            tracker: TaskTracker::new(),
            metrics: Some(metrics),
        })
    }

    /// Deferred-release stage whose waits are tracked by this registry.
    pub fn retry_later(self: &Arc<Self>, retry_after: Duration) -> Arc<dyn Handler> {
        Arc::new(RetryLaterHandler::new(retry_after).tracked_by(self.clone()))
    }

    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Waits up to `grace` for outstanding releases. Returns false if some were still
    /// waiting when the grace period ran out.
    ///
    /// Cancel the contexts the releases were started with first, otherwise each one runs
    /// its full delay.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.tracker.close();
        let drained = tokio::time::timeout(grace, self.tracker.wait()).await.is_ok();

        if drained {
            debug!("Deferred releases drained");
        } else {
            warn!(
                pending = self.pending(),
                grace_ms = grace.as_millis() as u64,
                "Deferred releases still pending after grace period"
            );
        }
        drained
    }

    fn spawn<F>(self: &Arc<Self>, release: F)
    where
        F: Future<Output = ReleaseOutcome> + Send + 'static,
    {
        if let Some(metrics) = &self.metrics {
            metrics.deferred_releases_pending.inc();
        }

        let releases = self.clone();
        self.tracker.spawn(async move {
            let outcome = release.await;
            releases.finish(outcome);
        });
    }

    fn finish(&self, outcome: ReleaseOutcome) {
        if let Some(metrics) = &self.metrics {
            metrics.deferred_releases_pending.dec();
            metrics
                .deferred_releases_total
                .with_label_values(&[outcome.as_str()])
                .inc();
        }
    }
}

pub fn retry_later(retry_after: Duration) -> Arc<dyn Handler> {
    Arc::new(RetryLaterHandler::new(retry_after))
}

/// Abandons the message once `retry_after` has elapsed, unless the context ends first.
#[derive(Clone)]
pub struct RetryLaterHandler {
    retry_after: Duration,
    releases: Arc<DeferredReleases>,
}

impl RetryLaterHandler {
    pub fn new(retry_after: Duration) -> Self {
        Self {
            retry_after,
            releases: DeferredReleases::new(),
        }
    }

    pub fn tracked_by(mut self, releases: Arc<DeferredReleases>) -> Self {
        self.releases = releases;
        self
    }

    pub fn retry_after(&self) -> Duration {
        self.retry_after
    }
}

#[async_trait]
impl Handler for RetryLaterHandler {
    async fn handle(
        &self,
        ctx: &Context,
        _next: Arc<dyn Handler>,
        message: &Message,
    ) -> Arc<dyn Handler> {
        let span = message_span("retry_later", message);
        let retry_after = self.retry_after;

        if let Some(remaining) = message.remaining_lock() {
            if retry_after > remaining {
                span.in_scope(|| {
                    warn!(
                        retry_after_ms = retry_after.as_millis() as u64,
                        remaining_lock_ms = remaining.as_millis() as u64,
                        "Retry delay outlasts message lock, abandon may be rejected"
                    )
                });
            }
        }

        let ctx = ctx.clone();
        let message = message.clone();

        self.releases.spawn(
            async move {
                tokio::select! {
                    biased;

                    _ = ctx.done() => {
                        let err = ctx.err().unwrap_or(ContextError::Cancelled);
                        error!(
                            error = %err,
                            retry_after_ms = retry_after.as_millis() as u64,
                            "Retry context expired"
                        );
                        ReleaseOutcome::Expired
                    }

                    _ = tokio::time::sleep(retry_after) => {
                        if Abandon.release(&ctx, &message).await {
                            ReleaseOutcome::Abandoned
                        } else {
                            ReleaseOutcome::AbandonFailed
                        }
                    }
                }
            }
            .instrument(span),
        );

        done()
    }
}
