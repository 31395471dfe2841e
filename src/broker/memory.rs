//! Volatile in-process broker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info};

use super::dispatch::{Delivery, DispatchWorker};
use super::{Broker, PublishAck, SubscriptionHandle, TopicHandler};
use crate::error::{MeshError, Result};
use crate::messaging::Envelope;

struct LocalSubscription {
    id: u64,
    worker: DispatchWorker,
}

/// Synchronous fan-out: a message is queued for every current subscriber of
/// its topic before `publish` returns.
pub struct InMemoryBroker {
    subscriptions: RwLock<HashMap<String, Vec<LocalSubscription>>>,
    next_id: AtomicU64,
    available: AtomicBool,
    published: AtomicU64,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            available: AtomicBool::new(true),
            published: AtomicU64::new(0),
        }
    }

    /// Simulates an outage; publishes fail fast while unavailable.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        info!(available, "In-memory broker availability changed");
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscriptions
            .read()
            .get(topic)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<PublishAck> {
        if !self.is_available() {
            return Err(MeshError::BrokerUnavailable(
                "in-memory broker is offline".into(),
            ));
        }

        let subscriptions = self.subscriptions.read();
        let mut deliveries = 0;
        if let Some(subs) = subscriptions.get(topic) {
            for sub in subs {
                let queued = sub.worker.deliver(Delivery {
                    envelope: envelope.clone(),
                    sequence: None,
                });
                if queued {
                    deliveries += 1;
                }
            }
        }
        drop(subscriptions);

        self.published.fetch_add(1, Ordering::Relaxed);
        debug!(topic, kind = envelope.kind(), deliveries, "Published");
        Ok(PublishAck {
            deliveries,
            sequence: None,
        })
    }

    async fn subscribe(&self, topic: &str, handler: TopicHandler) -> Result<SubscriptionHandle> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let worker = DispatchWorker::spawn(id, topic.to_string(), handler, None);

        self.subscriptions
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(LocalSubscription { id, worker });

        debug!(topic, subscription = id, "Subscribed");
        Ok(SubscriptionHandle::new(id, topic))
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<()> {
        let removed = {
            let mut subscriptions = self.subscriptions.write();
            let Some(subs) = subscriptions.get_mut(handle.topic()) else {
                return Err(MeshError::UnknownSubscription(handle.id()));
            };
            let removed = subs
                .iter()
                .position(|s| s.id == handle.id())
                .map(|idx| subs.remove(idx));
            if subs.is_empty() {
                subscriptions.remove(handle.topic());
            }
            removed
        };

        match removed {
            Some(sub) => {
                sub.worker.close();
                debug!(subscription = %handle, "Unsubscribed");
                Ok(())
            }
            None => Err(MeshError::UnknownSubscription(handle.id())),
        }
    }
}
