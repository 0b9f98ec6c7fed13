use std::future::Future;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use tracing::error;

use super::context::Context;
use super::message::Message;

/// Upper bound on handler hops `dispatch` follows for one message.
pub const MAX_HANDLER_HOPS: usize = 32;

/// One stage of a message-handling chain.
///
/// A handler either settles the message itself or delegates to `next`, and returns the
/// handler the pipeline should run after it. Returning [`done()`] means nothing more is
/// required. Handlers never fail: they report problems through tracing, because the
/// caller has already moved on by the time a failure can be acted on.
///
/// `handle` must return as soon as the delegation decision is made. Work that has to
/// wait (timers, slow I/O unrelated to the decision) belongs on a spawned task.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(
        &self,
        ctx: &Context,
        next: Arc<dyn Handler>,
        message: &Message,
    ) -> Arc<dyn Handler>;

    /// True only for the terminal sentinel.
    fn is_done(&self) -> bool {
        false
    }
}

static DONE: LazyLock<Arc<dyn Handler>> = LazyLock::new(|| Arc::new(Done));

/// Terminal sentinel: nothing left to do for the message.
pub fn done() -> Arc<dyn Handler> {
    DONE.clone()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Done;

#[async_trait]
impl Handler for Done {
    async fn handle(&self, _: &Context, _: Arc<dyn Handler>, _: &Message) -> Arc<dyn Handler> {
        done()
    }

    fn is_done(&self) -> bool {
        true
    }
}

/// Adapts an async closure into a handler.
pub struct HandleFn<F> {
    f: F,
}

pub fn handle_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(Context, Arc<dyn Handler>, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Arc<dyn Handler>> + Send + 'static,
{
    Arc::new(HandleFn { f })
}

#[async_trait]
impl<F, Fut> Handler for HandleFn<F>
where
    F: Fn(Context, Arc<dyn Handler>, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Arc<dyn Handler>> + Send + 'static,
{
    async fn handle(
        &self,
        ctx: &Context,
        next: Arc<dyn Handler>,
        message: &Message,
    ) -> Arc<dyn Handler> {
        (self.f)(ctx.clone(), next, message.clone()).await
    }
}

/// Runs its stages in order. Each stage sees the remaining stages, followed by the
/// chain's own `next`, as its `next`.
///
/// A stage that hands back exactly the `next` it was given is followed inside the chain,
/// so pass-through stages do not count against [`MAX_HANDLER_HOPS`] in [`dispatch`].
#[derive(Clone)]
pub struct Chain {
    stages: Arc<[Arc<dyn Handler>]>,
    position: usize,
    tail: Option<Arc<dyn Handler>>,
}

impl Chain {
    pub fn new(stages: Vec<Arc<dyn Handler>>) -> Self {
        Self {
            stages: stages.into(),
            position: 0,
            tail: None,
        }
    }

    pub fn len(&self) -> usize {
        self.stages.len() - self.position
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn from_position(&self, position: usize, tail: Arc<dyn Handler>) -> Arc<dyn Handler> {
        Arc::new(Self {
            stages: self.stages.clone(),
            position,
            tail: Some(tail),
        })
    }
}

fn same_handler(a: &Arc<dyn Handler>, b: &Arc<dyn Handler>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

#[async_trait]
impl Handler for Chain {
    async fn handle(
        &self,
        ctx: &Context,
        next: Arc<dyn Handler>,
        message: &Message,
    ) -> Arc<dyn Handler> {
        let tail = self.tail.clone().unwrap_or(next);
        let mut position = self.position;

        while let Some(stage) = self.stages.get(position) {
            let rest = self.from_position(position + 1, tail.clone());
            let returned = stage.handle(ctx, rest.clone(), message).await;
            if !same_handler(&returned, &rest) {
                return returned;
            }
            position += 1;
        }

        tail
    }
}

/// Drives `entry` for one message, following returned handlers until [`done()`].
///
/// Handlers that keep returning new work without settling are cut off after
/// [`MAX_HANDLER_HOPS`]; the message is then abandoned so the broker can redeliver it.
pub async fn dispatch(ctx: &Context, entry: &Arc<dyn Handler>, message: &Message) {
    let mut current = entry.clone();

    for _ in 0..MAX_HANDLER_HOPS {
        if current.is_done() {
            return;
        }
        current = current.handle(ctx, done(), message).await;
    }

    if current.is_done() {
        return;
    }

    error!(
        message_id = %message.id(),
        max_hops = MAX_HANDLER_HOPS,
        "Handler chain did not settle, abandoning message"
    );
    if let Err(e) = message.abandon(ctx).await {
        error!(error = %e, message_id = %message.id(), "Failed to abandon unsettled message");
    }
}
