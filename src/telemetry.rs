use tracing::{Span, info_span};

use crate::messaging::Message;

/// Span for one handler stage working on `message`.
///
/// The span is parented to whatever span is current at the call site, so a stage that
/// hands its work to a spawned task should open the span before spawning and instrument
/// the task with it. The span closes when the last guard or instrumented future drops.
pub fn message_span(stage: &'static str, message: &Message) -> Span {
    info_span!(
        "message",
        stage,
        message_id = %message.id(),
        delivery_count = message.delivery_count(),
        routing_key = message.routing_key().unwrap_or_default(),
    )
}
