//! Client side of the TCP relay.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::dispatch::{AckSink, Delivery, DispatchWorker};
use super::wire::{self, ClientFrame, ServerFrame};
use super::{Broker, PublishAck, SubscriptionHandle, TopicHandler};
use crate::config::BrokerConfig;
use crate::error::{MeshError, Result};
use crate::messaging::Envelope;

struct RemoteSubscription {
    topic: String,
    consumer: String,
    worker: DispatchWorker,
}

struct NetworkInner {
    config: BrokerConfig,
    /// `None` while disconnected; publishes fail fast instead of queueing.
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientFrame>>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<ServerFrame>>>,
    subscriptions: Mutex<HashMap<u64, RemoteSubscription>>,
    next_req: AtomicU64,
    next_sub: AtomicU64,
    shutdown: watch::Sender<bool>,
}

/// Broker backed by a relay; survives relay restarts by reconnecting and
/// re-attaching every live subscription under its consumer name.
pub struct NetworkBroker {
    inner: Arc<NetworkInner>,
}

impl NetworkBroker {
    /// Fails fast if the relay cannot be reached within `connect_timeout_ms`.
    pub async fn connect(config: BrokerConfig) -> Result<Self> {
        let stream = dial(&config).await?;
        info!(relay = %config.relay_addr, client_id = %config.client_id, "Connected to relay");

        let (shutdown, shutdown_rx) = watch::channel(false);
        let inner = Arc::new(NetworkInner {
            config,
            outbound: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            next_req: AtomicU64::new(1),
            next_sub: AtomicU64::new(1),
            shutdown,
        });

        let session = inner.attach(stream);
        tokio::spawn(connection_loop(Arc::clone(&inner), session, shutdown_rx));
        Ok(Self { inner })
    }

    pub fn is_connected(&self) -> bool {
        self.inner.outbound.lock().is_some()
    }

    /// Closes the relay connection and stops reconnecting.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
    }
}

impl Drop for NetworkBroker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl Broker for NetworkBroker {
    fn name(&self) -> &'static str {
        "network"
    }

    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<PublishAck> {
        let topic = topic.to_string();
        let reply = self
            .inner
            .request(|req| ClientFrame::Publish {
                req,
                topic,
                envelope,
            })
            .await?;

        match reply {
            ServerFrame::Ok {
                seq, deliveries, ..
            } => Ok(PublishAck {
                deliveries,
                sequence: seq,
            }),
            ServerFrame::Error { message, .. } => Err(MeshError::Transport(message)),
            ServerFrame::Deliver { .. } => Err(MeshError::transport("unexpected relay reply")),
        }
    }

    async fn subscribe(&self, topic: &str, handler: TopicHandler) -> Result<SubscriptionHandle> {
        if !self.is_connected() {
            return Err(MeshError::BrokerUnavailable(format!(
                "not connected to relay {}",
                self.inner.config.relay_addr
            )));
        }

        let sub = self.inner.next_sub.fetch_add(1, Ordering::SeqCst);

        let weak: Weak<NetworkInner> = Arc::downgrade(&self.inner);
        let ack: AckSink = Arc::new(move |seq| {
            if let Some(inner) = weak.upgrade() {
                inner.send_frame(ClientFrame::Ack { sub, seq });
            }
        });
        let worker = DispatchWorker::spawn(sub, topic.to_string(), handler, Some(ack));
        let consumer = {
            let mut subscriptions = self.inner.subscriptions.lock();
            let consumer = consumer_name(
                &self.inner.config.client_id,
                topic,
                subscriptions.values().map(|s| s.consumer.as_str()),
            );
            subscriptions.insert(
                sub,
                RemoteSubscription {
                    topic: topic.to_string(),
                    consumer: consumer.clone(),
                    worker,
                },
            );
            consumer
        };

        let topic_name = topic.to_string();
        let outcome = self
            .inner
            .request(|req| ClientFrame::Subscribe {
                req,
                sub,
                topic: topic_name,
                consumer,
            })
            .await;

        let failure = match outcome {
            Ok(ServerFrame::Ok { .. }) => {
                debug!(topic, subscription = sub, "Subscribed via relay");
                return Ok(SubscriptionHandle::new(sub, topic));
            }
            Ok(ServerFrame::Error { message, .. }) => MeshError::Transport(message),
            Ok(ServerFrame::Deliver { .. }) => MeshError::transport("unexpected relay reply"),
            Err(e) => e,
        };

        if let Some(removed) = self.inner.subscriptions.lock().remove(&sub) {
            removed.worker.close();
        }
        Err(failure)
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<()> {
        let Some(removed) = self.inner.subscriptions.lock().remove(&handle.id()) else {
            return Err(MeshError::UnknownSubscription(handle.id()));
        };
        removed.worker.close();

        if self.is_connected() {
            let sub = handle.id();
            if let Err(e) = self
                .inner
                .request(|req| ClientFrame::Unsubscribe { req, sub })
                .await
            {
                debug!(subscription = %handle, error = %e, "Relay unsubscribe not confirmed");
            }
        }
        Ok(())
    }
}

impl NetworkInner {
    fn send_frame(&self, frame: ClientFrame) -> bool {
        match &*self.outbound.lock() {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    async fn request(&self, build: impl FnOnce(u64) -> ClientFrame) -> Result<ServerFrame> {
        let req = self.next_req.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(req, tx);

        if !self.send_frame(build(req)) {
            self.pending.lock().remove(&req);
            return Err(MeshError::BrokerUnavailable(format!(
                "not connected to relay {}",
                self.config.relay_addr
            )));
        }

        match tokio::time::timeout(self.config.publish_timeout(), rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(MeshError::transport("relay connection lost before reply")),
            Err(_) => {
                self.pending.lock().remove(&req);
                Err(MeshError::Timeout(format!(
                    "relay did not answer within {}ms",
                    self.config.publish_timeout_ms
                )))
            }
        }
    }

    /// Installs a fresh outbound queue, re-attaching live subscriptions first.
    fn attach(&self, stream: TcpStream) -> Session {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscriptions = self.subscriptions.lock();
        for (sub, remote) in subscriptions.iter() {
            let _ = tx.send(ClientFrame::Subscribe {
                req: self.next_req.fetch_add(1, Ordering::SeqCst),
                sub: *sub,
                topic: remote.topic.clone(),
                consumer: remote.consumer.clone(),
            });
        }
        if !subscriptions.is_empty() {
            info!(count = subscriptions.len(), "Re-attaching subscriptions");
        }
        drop(subscriptions);

        *self.outbound.lock() = Some(tx);
        Session { stream, rx }
    }

    fn detach(&self) {
        *self.outbound.lock() = None;
        // Dropping the senders fails every outstanding request.
        self.pending.lock().clear();
    }

    fn handle_line(&self, line: &str) {
        let frame = match wire::decode::<ServerFrame>(line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Dropping malformed relay frame");
                return;
            }
        };

        if let ServerFrame::Deliver { sub, seq, envelope } = frame {
            let subscriptions = self.subscriptions.lock();
            match subscriptions.get(&sub) {
                Some(remote) => {
                    remote.worker.deliver(Delivery {
                        envelope,
                        sequence: Some(seq),
                    });
                }
                None => debug!(subscription = sub, seq, "Delivery for closed subscription"),
            }
            return;
        }

        if let Some(req) = frame.request_id()
            && let Some(waiter) = self.pending.lock().remove(&req)
        {
            let _ = waiter.send(frame);
        }
    }
}

/// Durable cursor name for a new subscription to `topic`.
///
/// The first live subscription is `{client_id}:{topic}`, further concurrent
/// ones get `#2`, `#3`, ... A process that resubscribes in the same order after
/// a restart picks up the same cursors.
fn consumer_name<'a>(
    client_id: &str,
    topic: &str,
    taken: impl Iterator<Item = &'a str>,
) -> String {
    let taken: Vec<&str> = taken.collect();
    let base = format!("{}:{}", client_id, topic);
    if !taken.contains(&base.as_str()) {
        return base;
    }
    let mut ordinal = 2;
    loop {
        let name = format!("{}#{}", base, ordinal);
        if !taken.contains(&name.as_str()) {
            return name;
        }
        ordinal += 1;
    }
}

struct Session {
    stream: TcpStream,
    rx: mpsc::UnboundedReceiver<ClientFrame>,
}

async fn dial(config: &BrokerConfig) -> Result<TcpStream> {
    match tokio::time::timeout(
        config.connect_timeout(),
        TcpStream::connect(&config.relay_addr),
    )
    .await
    {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(MeshError::BrokerUnavailable(format!(
            "cannot reach relay {}: {}",
            config.relay_addr, e
        ))),
        Err(_) => Err(MeshError::BrokerUnavailable(format!(
            "connecting to relay {} timed out",
            config.relay_addr
        ))),
    }
}

async fn connection_loop(
    inner: Arc<NetworkInner>,
    mut session: Session,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let stopped = run_session(&inner, session, &mut shutdown).await;
        inner.detach();
        if stopped {
            break;
        }
        warn!(relay = %inner.config.relay_addr, "Lost relay connection, reconnecting");

        let stream = loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Relay client stopped while disconnected");
                        return;
                    }
                }
                _ = tokio::time::sleep(inner.config.reconnect_delay()) => {
                    match dial(&inner.config).await {
                        Ok(stream) => break stream,
                        Err(e) => debug!(error = %e, "Reconnect attempt failed"),
                    }
                }
            }
        };

        info!(relay = %inner.config.relay_addr, "Reconnected to relay");
        session = inner.attach(stream);
    }
    debug!("Relay client stopped");
}

/// Pumps one connection. Returns true when shutdown was requested.
async fn run_session(
    inner: &NetworkInner,
    session: Session,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let Session { stream, mut rx } = session;
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return true;
                }
            }
            frame = rx.recv() => {
                let Some(frame) = frame else {
                    return false;
                };
                let line = match wire::encode(&frame) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode frame");
                        continue;
                    }
                };
                if let Err(e) = write.write_all(line.as_bytes()).await {
                    debug!(error = %e, "Relay write failed");
                    return false;
                }
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => inner.handle_line(&line),
                    Ok(None) => return false,
                    Err(e) => {
                        debug!(error = %e, "Relay read failed");
                        return false;
                    }
                }
            }
        }
    }
}
