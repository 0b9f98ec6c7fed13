//! Broker message consumer built around composable handler chains.
//!
//! Each delivery is wrapped in a [`messaging::Message`] and driven through an
//! [`messaging::Handler`] chain by [`messaging::dispatch`]. Stages settle the message
//! (complete, abandon, dead-letter) or delegate to the next stage. The
//! [`messaging::RetryLaterHandler`] stage defers abandoning a message for a fixed delay
//! without holding up the consumer.

pub mod contracts;
pub mod messaging;
pub mod metrics;
pub mod telemetry;
