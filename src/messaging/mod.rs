pub mod channel;
pub mod connection;
pub mod consumer;
pub mod context;
pub mod handler;
pub mod lapin_settler;
pub mod message;
pub mod outcome;
pub mod retry_later;
pub mod settlement;

pub use channel::{ChannelError, ChannelProvider};
pub use connection::{ConnectionError, RabbitMqConnection};
pub use consumer::{Consumer, ConsumerError};
pub use context::{Context, ContextError};
pub use handler::{Chain, Done, Handler, dispatch, done, handle_fn};
pub use lapin_settler::LapinSettler;
pub use message::{DeadLetterReason, Message, MessageSettler, SettlementError};
pub use outcome::OutcomeRouter;
pub use retry_later::{DeferredReleases, ReleaseOutcome, RetryLaterHandler, retry_later};
