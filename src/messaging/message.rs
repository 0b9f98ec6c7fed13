use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;

use super::context::{Context, ContextError};

/// Broker-side settlement of a single delivery.
///
/// Implementations own the lock/lease protocol of their broker. They are handed the
/// message they settle so adapters that need the body (dead-lettering by republish) or
/// the lock token can reach it.
#[async_trait]
pub trait MessageSettler: Send + Sync {
    async fn complete(&self, message: &Message) -> Result<(), SettlementError>;

    async fn abandon(&self, message: &Message) -> Result<(), SettlementError>;

    async fn dead_letter(
        &self,
        message: &Message,
        reason: &DeadLetterReason,
    ) -> Result<(), SettlementError>;
}

/// Opaque handle to one delivery. Clones are cheap and refer to the same delivery.
#[derive(Clone)]
pub struct Message {
    inner: Arc<Inner>,
}

#[derive(Clone)]
struct Inner {
    id: String,
    body: Vec<u8>,
    routing_key: Option<String>,
    lock_token: Option<String>,
    delivery_count: u32,
    locked_until: Option<SystemTime>,
    properties: BTreeMap<String, String>,
    settler: Arc<dyn MessageSettler>,
}

impl Message {
    pub fn new(id: impl Into<String>, body: Vec<u8>, settler: Arc<dyn MessageSettler>) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: id.into(),
                body,
                routing_key: None,
                lock_token: None,
                delivery_count: 1,
                locked_until: None,
                properties: BTreeMap::new(),
                settler,
            }),
        }
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.inner).routing_key = Some(routing_key.into());
        self
    }

    pub fn with_lock_token(mut self, lock_token: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.inner).lock_token = Some(lock_token.into());
        self
    }

    pub fn with_delivery_count(mut self, delivery_count: u32) -> Self {
        Arc::make_mut(&mut self.inner).delivery_count = delivery_count;
        self
    }

    pub fn with_locked_until(mut self, locked_until: SystemTime) -> Self {
        Arc::make_mut(&mut self.inner).locked_until = Some(locked_until);
        self
    }

    /// Application property set by the publisher (message headers).
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.inner)
            .properties
            .insert(key.into(), value.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn body(&self) -> &[u8] {
        &self.inner.body
    }

    pub fn routing_key(&self) -> Option<&str> {
        self.inner.routing_key.as_deref()
    }

    pub fn lock_token(&self) -> Option<&str> {
        self.inner.lock_token.as_deref()
    }

    pub fn delivery_count(&self) -> u32 {
        self.inner.delivery_count
    }

    pub fn locked_until(&self) -> Option<SystemTime> {
        self.inner.locked_until
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.inner.properties.get(key).map(String::as_str)
    }

    /// Time left on the broker lock. `None` when the broker does not report one.
    pub fn remaining_lock(&self) -> Option<Duration> {
        self.inner.locked_until.map(|until| {
            until
                .duration_since(SystemTime::now())
                .unwrap_or(Duration::ZERO)
        })
    }

    pub async fn complete(&self, ctx: &Context) -> Result<(), SettlementError> {
        self.settle(ctx, self.inner.settler.complete(self)).await
    }

    pub async fn abandon(&self, ctx: &Context) -> Result<(), SettlementError> {
        self.settle(ctx, self.inner.settler.abandon(self)).await
    }

    pub async fn dead_letter(
        &self,
        ctx: &Context,
        reason: &DeadLetterReason,
    ) -> Result<(), SettlementError> {
        self.settle(ctx, self.inner.settler.dead_letter(self, reason))
            .await
    }

    async fn settle<F>(&self, ctx: &Context, action: F) -> Result<(), SettlementError>
    where
        F: Future<Output = Result<(), SettlementError>>,
    {
        if let Some(err) = ctx.err() {
            return Err(SettlementError::ContextDone(err));
        }

        tokio::select! {
            biased;
            result = action => result,
            _ = ctx.done() => Err(SettlementError::ContextDone(
                ctx.err().unwrap_or(ContextError::Cancelled),
            )),
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.inner.id)
            .field("routing_key", &self.inner.routing_key)
            .field("delivery_count", &self.inner.delivery_count)
            .field("locked_until", &self.inner.locked_until)
            .field("body_len", &self.inner.body.len())
            .finish()
    }
}

/// Why a message is being moved to the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterReason {
    pub reason: String,
    pub description: Option<String>,
}

impl DeadLetterReason {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    #[error("Broker rejected {action}: {reason}")]
    Broker {
        action: &'static str,
        reason: String,
    },

    #[error("Settlement skipped: {0}")]
    ContextDone(#[from] ContextError),
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use tokio::time::Instant;

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum SettleAction {
        Complete,
        Abandon,
        DeadLetter,
    }

    #[derive(Debug, Clone)]
    pub(crate) struct SettleCall {
        pub action: SettleAction,
        pub message_id: String,
        pub at: Instant,
        pub reason: Option<DeadLetterReason>,
    }

    /// Settler that records every call and optionally fails them.
    #[derive(Default)]
    pub(crate) struct RecordingSettler {
        calls: Mutex<Vec<SettleCall>>,
        fail: bool,
    }

    impl RecordingSettler {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub(crate) fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                fail: true,
            })
        }

        pub(crate) fn message(self: &Arc<Self>, id: &str) -> Message {
            Message::new(id, b"{}".to_vec(), self.clone())
        }

        pub(crate) fn calls(&self) -> Vec<SettleCall> {
            self.calls.lock().unwrap().clone()
        }

        pub(crate) fn count(&self, action: SettleAction) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|call| call.action == action)
                .count()
        }

        fn record(
            &self,
            action: SettleAction,
            message: &Message,
            reason: Option<DeadLetterReason>,
            name: &'static str,
        ) -> Result<(), SettlementError> {
            self.calls.lock().unwrap().push(SettleCall {
                action,
                message_id: message.id().to_string(),
                at: Instant::now(),
                reason,
            });

            if self.fail {
                return Err(SettlementError::Broker {
                    action: name,
                    reason: "lock lost".to_string(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl MessageSettler for RecordingSettler {
        async fn complete(&self, message: &Message) -> Result<(), SettlementError> {
            self.record(SettleAction::Complete, message, None, "complete")
        }

        async fn abandon(&self, message: &Message) -> Result<(), SettlementError> {
            self.record(SettleAction::Abandon, message, None, "abandon")
        }

        async fn dead_letter(
            &self,
            message: &Message,
            reason: &DeadLetterReason,
        ) -> Result<(), SettlementError> {
            self.record(
                SettleAction::DeadLetter,
                message,
                Some(reason.clone()),
                "dead_letter",
            )
        }
    }
}
