//! Topic-addressed publish/subscribe.
//!
//! ```text
//! ┌─────────────┐ publish  ┌──────────────┐  queue   ┌──────────────┐
//! │  Publisher  │─────────▶│    Broker    │─────────▶│ Subscription │──▶ handler
//! └─────────────┘          │ (memory/TCP) │          │    worker    │
//!                          └──────────────┘          └──────────────┘
//! ```
//!
//! Every subscription owns a queue and a worker task. Publish enqueues for
//! each subscriber and returns; the worker invokes the handler one message at
//! a time, so a subscriber observes a single publisher's messages in publish
//! order and a slow handler only delays its own subscription.
//!
//! Delivery is at-least-once. Both implementations may hand the same message
//! to a handler more than once; consumers deduplicate by `message_id`. Each
//! delivery carries an [`Acknowledger`]; the networked transport replays any
//! message whose token was never completed.

mod dispatch;
mod faults;
mod memory;
mod network;
mod relay;
pub mod wire;

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;

use crate::config::{BrokerConfig, TransportKind};
use crate::error::Result;
use crate::messaging::Envelope;

pub use dispatch::Acknowledger;
pub use faults::FaultyBroker;
pub use memory::InMemoryBroker;
pub use network::NetworkBroker;
pub use relay::{RelayHandle, RelayServer};

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;

/// Callback invoked for every envelope delivered to a subscription.
///
/// Errors and panics are caught and logged by the broker.
pub type TopicHandler = Arc<dyn Fn(Envelope, Acknowledger) -> HandlerFuture + Send + Sync>;

/// Handler whose deliveries are acknowledged once its future finishes,
/// whether it succeeded, failed or panicked.
pub fn topic_handler<F, Fut>(f: F) -> TopicHandler
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |envelope: Envelope, ack: Acknowledger| -> HandlerFuture {
        let future = f(envelope);
        Box::pin(async move {
            let outcome = AssertUnwindSafe(future).catch_unwind().await;
            ack.complete();
            match outcome {
                Ok(result) => result,
                Err(panic) => std::panic::resume_unwind(panic),
            }
        })
    })
}

/// Handler that owns each delivery's [`Acknowledger`] and completes it itself,
/// possibly after its future has returned.
pub fn acked_handler<F, Fut>(f: F) -> TopicHandler
where
    F: Fn(Envelope, Acknowledger) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |envelope: Envelope, ack: Acknowledger| -> HandlerFuture {
        Box::pin(f(envelope, ack))
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    topic: String,
}

impl SubscriptionHandle {
    pub(crate) fn new(id: u64, topic: impl Into<String>) -> Self {
        Self {
            id,
            topic: topic.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.topic, self.id)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishAck {
    /// Live subscriptions the message was queued for.
    pub deliveries: usize,
    /// Position in the topic log, for transports that keep one.
    pub sequence: Option<u64>,
}

#[async_trait]
pub trait Broker: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fails fast when the transport is unavailable; retry belongs to the caller.
    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<PublishAck>;

    async fn subscribe(&self, topic: &str, handler: TopicHandler) -> Result<SubscriptionHandle>;

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<()>;
}

/// Process-wide broker handle, built once and passed to every agent.
pub type SharedBroker = Arc<dyn Broker>;

/// Builds the broker selected by `config.transport`.
pub async fn connect(config: &BrokerConfig) -> Result<SharedBroker> {
    match config.transport {
        TransportKind::Volatile => Ok(Arc::new(InMemoryBroker::new())),
        TransportKind::Network => Ok(Arc::new(NetworkBroker::connect(config.clone()).await?)),
    }
}
