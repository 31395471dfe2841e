//! Per-subscription delivery queue and worker.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::TopicHandler;
use crate::messaging::Envelope;

#[derive(Debug)]
pub(crate) struct Delivery {
    pub envelope: Envelope,
    /// Relay log position; `None` for in-process deliveries.
    pub sequence: Option<u64>,
}

/// Receives the sequence number of each completed delivery.
pub(crate) type AckSink = Arc<dyn Fn(u64) + Send + Sync>;

/// Completion token handed to the subscription handler with each delivery.
///
/// The relay only moves a consumer past a message once its token has been
/// completed. A token dropped without [`Acknowledger::complete`] leaves the
/// message due for replay when the consumer next attaches.
pub struct Acknowledger {
    sink: Option<AckSink>,
    sequence: Option<u64>,
}

impl Acknowledger {
    pub(crate) fn new(sink: Option<AckSink>, sequence: Option<u64>) -> Self {
        Self { sink, sequence }
    }

    /// A token with nothing to acknowledge, for in-process deliveries.
    pub fn detached() -> Self {
        Self::new(None, None)
    }

    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    pub fn complete(mut self) {
        if let (Some(sink), Some(seq)) = (self.sink.take(), self.sequence) {
            sink(seq);
        }
    }
}

impl fmt::Debug for Acknowledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acknowledger")
            .field("sequence", &self.sequence)
            .field("armed", &self.sink.is_some())
            .finish()
    }
}

pub(crate) struct DispatchWorker {
    tx: mpsc::UnboundedSender<Delivery>,
    closed: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl DispatchWorker {
    pub fn spawn(
        subscription: u64,
        topic: String,
        handler: TopicHandler,
        ack: Option<AckSink>,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        let closed = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&closed);

        let handle = tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                let kind = delivery.envelope.kind();
                let token = Acknowledger::new(ack.clone(), delivery.sequence);
                invoke(&handler, delivery.envelope, token, &topic, subscription).await;
                debug!(topic = %topic, subscription, kind, "Delivered");
            }
            debug!(topic = %topic, subscription, "Dispatch worker stopped");
        });

        Self { tx, closed, handle }
    }

    /// Queues a delivery. Returns false once the worker has been closed.
    pub fn deliver(&self, delivery: Delivery) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        self.tx.send(delivery).is_ok()
    }

    /// Stops the worker after the in-progress handler call; queued deliveries are dropped.
    pub fn close(self) {
        self.closed.store(true, Ordering::Release);
        drop(self.tx);
        drop(self.handle);
    }
}

async fn invoke(
    handler: &TopicHandler,
    envelope: Envelope,
    token: Acknowledger,
    topic: &str,
    subscription: u64,
) {
    let future = match std::panic::catch_unwind(AssertUnwindSafe(|| handler(envelope, token))) {
        Ok(future) => future,
        Err(_) => {
            error!(topic = %topic, subscription, "Subscription handler panicked");
            return;
        }
    };

    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(topic = %topic, subscription, error = %e, "Subscription handler failed");
        }
        Err(_) => {
            error!(topic = %topic, subscription, "Subscription handler panicked");
        }
    }
}
