//! Fault injection wrapper for exercising delivery guarantees.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::debug;

use super::{Broker, PublishAck, SharedBroker, SubscriptionHandle, TopicHandler};
use crate::error::{MeshError, Result};
use crate::messaging::Envelope;

/// Wraps a broker and injects transport flakes or redelivery.
pub struct FaultyBroker {
    inner: SharedBroker,
    fail_next: AtomicU32,
    duplicate: AtomicBool,
    attempts: AtomicU64,
}

impl FaultyBroker {
    pub fn new(inner: SharedBroker) -> Self {
        Self {
            inner,
            fail_next: AtomicU32::new(0),
            duplicate: AtomicBool::new(false),
            attempts: AtomicU64::new(0),
        }
    }

    /// The next `count` publishes fail with a transport error.
    pub fn fail_next_publishes(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Publish every message twice, simulating redelivery.
    pub fn duplicate_deliveries(&self, enabled: bool) {
        self.duplicate.store(enabled, Ordering::SeqCst);
    }

    /// Publish calls seen, including injected failures.
    pub fn publish_attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Broker for FaultyBroker {
    fn name(&self) -> &'static str {
        "faulty"
    }

    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<PublishAck> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.take_failure() {
            debug!(topic, "Injected publish failure");
            return Err(MeshError::transport("injected publish failure"));
        }

        if self.duplicate.load(Ordering::SeqCst) {
            let first = self.inner.publish(topic, envelope.clone()).await?;
            let second = self.inner.publish(topic, envelope).await?;
            return Ok(PublishAck {
                deliveries: first.deliveries + second.deliveries,
                sequence: second.sequence,
            });
        }

        self.inner.publish(topic, envelope).await
    }

    async fn subscribe(&self, topic: &str, handler: TopicHandler) -> Result<SubscriptionHandle> {
        self.inner.subscribe(topic, handler).await
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<()> {
        self.inner.unsubscribe(handle).await
    }
}
