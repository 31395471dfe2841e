//! TCP relay backing the network transport.
//!
//! The relay keeps a bounded log per topic and a cursor per named consumer.
//! A consumer that disconnects (or a process that restarts under the same
//! client id) resumes after its last contiguously acknowledged sequence, so
//! messages published while it was away, or still unfinished when it went
//! away, are replayed instead of lost.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::wire::{self, ClientFrame, ServerFrame};
use crate::error::Result;
use crate::messaging::Envelope;

struct TopicLog {
    next_seq: u64,
    entries: VecDeque<(u64, Envelope)>,
}

impl TopicLog {
    fn new() -> Self {
        Self {
            next_seq: 1,
            entries: VecDeque::new(),
        }
    }

    fn append(&mut self, envelope: Envelope, retention: usize) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push_back((seq, envelope));
        while self.entries.len() > retention {
            self.entries.pop_front();
        }
        seq
    }
}

/// Durable position of one named consumer.
///
/// Acks may arrive out of order when handlers run concurrently; `committed`
/// only advances over an unbroken run of acknowledged sequences.
#[derive(Debug, Default)]
struct ConsumerCursor {
    committed: u64,
    acked: BTreeSet<u64>,
}

impl ConsumerCursor {
    fn at(committed: u64) -> Self {
        Self {
            committed,
            acked: BTreeSet::new(),
        }
    }

    fn ack(&mut self, seq: u64) {
        if seq <= self.committed {
            return;
        }
        self.acked.insert(seq);
        while self.acked.remove(&(self.committed + 1)) {
            self.committed += 1;
        }
    }

    /// Moves past sequences that fell out of retention.
    fn skip_to(&mut self, committed: u64) {
        if committed <= self.committed {
            return;
        }
        self.committed = committed;
        self.acked.retain(|seq| *seq > committed);
        while self.acked.remove(&(self.committed + 1)) {
            self.committed += 1;
        }
    }

    fn is_done(&self, seq: u64) -> bool {
        seq <= self.committed || self.acked.contains(&seq)
    }
}

struct LiveSubscriber {
    conn: u64,
    sub: u64,
    topic: String,
    consumer: String,
    tx: mpsc::UnboundedSender<ServerFrame>,
}

struct RelayState {
    retention: usize,
    topics: HashMap<String, TopicLog>,
    cursors: HashMap<String, ConsumerCursor>,
    live: Vec<LiveSubscriber>,
}

impl RelayState {
    fn publish(&mut self, topic: String, envelope: Envelope) -> (u64, usize) {
        let retention = self.retention;
        let log = self.topics.entry(topic.clone()).or_insert_with(TopicLog::new);
        let seq = log.append(envelope.clone(), retention);

        let mut deliveries = 0;
        for subscriber in self.live.iter().filter(|s| s.topic == topic) {
            let frame = ServerFrame::Deliver {
                sub: subscriber.sub,
                seq,
                envelope: envelope.clone(),
            };
            if subscriber.tx.send(frame).is_ok() {
                deliveries += 1;
            }
        }
        (seq, deliveries)
    }

    fn subscribe(
        &mut self,
        conn: u64,
        req: u64,
        sub: u64,
        topic: String,
        consumer: String,
        tx: mpsc::UnboundedSender<ServerFrame>,
    ) {
        let log = self.topics.entry(topic.clone()).or_insert_with(TopicLog::new);
        let cursor = self
            .cursors
            .entry(consumer.clone())
            .or_insert_with(|| ConsumerCursor::at(log.next_seq - 1));

        if let Some((first, _)) = log.entries.front()
            && *first > cursor.committed + 1
        {
            warn!(
                consumer = %consumer,
                topic = %topic,
                missed = first - cursor.committed - 1,
                "Consumer fell behind retention, messages were dropped"
            );
            cursor.skip_to(first - 1);
        }

        let _ = tx.send(ServerFrame::Ok {
            req,
            seq: Some(cursor.committed),
            deliveries: 0,
        });

        let mut replayed = 0;
        for (seq, envelope) in log.entries.iter().filter(|(seq, _)| !cursor.is_done(*seq)) {
            let _ = tx.send(ServerFrame::Deliver {
                sub,
                seq: *seq,
                envelope: envelope.clone(),
            });
            replayed += 1;
        }

        let committed = cursor.committed;
        debug!(conn, sub, topic = %topic, consumer = %consumer, committed, replayed, "Subscriber attached");
        self.live.push(LiveSubscriber {
            conn,
            sub,
            topic,
            consumer,
            tx,
        });
    }

    fn ack(&mut self, conn: u64, sub: u64, seq: u64) {
        let Some(subscriber) = self.live.iter().find(|s| s.conn == conn && s.sub == sub) else {
            return;
        };
        if let Some(cursor) = self.cursors.get_mut(&subscriber.consumer) {
            cursor.ack(seq);
        }
    }

    fn unsubscribe(&mut self, conn: u64, sub: u64) -> bool {
        let before = self.live.len();
        self.live.retain(|s| !(s.conn == conn && s.sub == sub));
        self.live.len() != before
    }

    fn drop_connection(&mut self, conn: u64) {
        self.live.retain(|s| s.conn != conn);
    }
}

pub struct RelayServer {
    listener: TcpListener,
    state: Arc<Mutex<RelayState>>,
    next_conn: AtomicU64,
}

impl RelayServer {
    pub async fn bind(addr: &str, retention: usize) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            state: Arc::new(Mutex::new(RelayState {
                retention: retention.max(1),
                topics: HashMap::new(),
                cursors: HashMap::new(),
                live: Vec::new(),
            })),
            next_conn: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr = self.local_addr()?;
        info!(%addr, "Relay listening");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let conn = self.next_conn.fetch_add(1, Ordering::SeqCst);
                            debug!(conn, %peer, "Client connected");
                            tokio::spawn(serve_connection(
                                stream,
                                conn,
                                Arc::clone(&self.state),
                                shutdown.clone(),
                            ));
                        }
                        Err(e) => warn!(error = %e, "Accept failed"),
                    }
                }
            }
        }

        info!(%addr, "Relay stopped");
        Ok(())
    }

    pub fn spawn(self) -> Result<RelayHandle> {
        let addr = self.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            if let Err(e) = self.run(shutdown_rx).await {
                warn!(error = %e, "Relay exited with error");
            }
        });
        Ok(RelayHandle {
            addr,
            shutdown_tx,
            join,
        })
    }
}

pub struct RelayHandle {
    addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl RelayHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stops accepting and closes every client connection.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.join.await;
    }
}

async fn serve_connection(
    stream: TcpStream,
    conn: u64,
    state: Arc<Mutex<RelayState>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (read, mut write) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let line = match wire::encode(&frame) {
                Ok(line) => line,
                Err(e) => {
                    warn!(conn, error = %e, "Failed to encode frame");
                    continue;
                }
            };
            if write.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(read).lines();
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => handle_frame(&line, conn, &state, &tx),
                    Ok(None) => break,
                    Err(e) => {
                        debug!(conn, error = %e, "Read failed");
                        break;
                    }
                }
            }
        }
    }

    state.lock().drop_connection(conn);
    drop(tx);
    if *shutdown.borrow() {
        writer.abort();
    }
    debug!(conn, "Client disconnected");
}

fn handle_frame(
    line: &str,
    conn: u64,
    state: &Mutex<RelayState>,
    tx: &mpsc::UnboundedSender<ServerFrame>,
) {
    let frame = match wire::decode::<ClientFrame>(line) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(conn, error = %e, "Dropping malformed frame");
            return;
        }
    };

    match frame {
        ClientFrame::Publish {
            req,
            topic,
            envelope,
        } => {
            let (seq, deliveries) = state.lock().publish(topic, envelope);
            let _ = tx.send(ServerFrame::Ok {
                req,
                seq: Some(seq),
                deliveries,
            });
        }
        ClientFrame::Subscribe {
            req,
            sub,
            topic,
            consumer,
        } => {
            state
                .lock()
                .subscribe(conn, req, sub, topic, consumer, tx.clone());
        }
        ClientFrame::Unsubscribe { req, sub } => {
            let reply = if state.lock().unsubscribe(conn, sub) {
                ServerFrame::Ok {
                    req,
                    seq: None,
                    deliveries: 0,
                }
            } else {
                ServerFrame::Error {
                    req,
                    message: format!("unknown subscription {}", sub),
                }
            };
            let _ = tx.send(reply);
        }
        ClientFrame::Ack { sub, seq } => state.lock().ack(conn, sub, seq),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{AgentStatus, Heartbeat};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::tcp::OwnedReadHalf;
    use tokio::io::Lines;

    struct RawClient {
        lines: Lines<BufReader<OwnedReadHalf>>,
        write: tokio::net::tcp::OwnedWriteHalf,
    }

    impl RawClient {
        async fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (read, write) = stream.into_split();
            Self {
                lines: BufReader::new(read).lines(),
                write,
            }
        }

        async fn send(&mut self, frame: ClientFrame) {
            let line = wire::encode(&frame).unwrap();
            self.write.write_all(line.as_bytes()).await.unwrap();
        }

        async fn recv(&mut self) -> ServerFrame {
            let line = tokio::time::timeout(std::time::Duration::from_secs(2), self.lines.next_line())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            wire::decode(&line).unwrap()
        }
    }

    fn hb(agent: &str) -> Envelope {
        Heartbeat::new(agent, AgentStatus::Idle).into()
    }

    fn publish(req: u64, agent: &str) -> ClientFrame {
        ClientFrame::Publish {
            req,
            topic: "t".into(),
            envelope: hb(agent),
        }
    }

    fn subscribe(req: u64, sub: u64) -> ClientFrame {
        ClientFrame::Subscribe {
            req,
            sub,
            topic: "t".into(),
            consumer: "c:t".into(),
        }
    }

    fn delivered_agent(frame: ServerFrame) -> (u64, String) {
        match frame {
            ServerFrame::Deliver {
                seq,
                envelope: Envelope::Heartbeat(hb),
                ..
            } => (seq, hb.agent_id),
            other => panic!("expected delivery, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unacked_messages_are_replayed_for_returning_consumer() {
        let relay = RelayServer::bind("127.0.0.1:0", 16).await.unwrap().spawn().unwrap();

        let mut consumer = RawClient::connect(relay.addr()).await;
        consumer.send(subscribe(1, 1)).await;
        assert!(matches!(consumer.recv().await, ServerFrame::Ok { req: 1, .. }));

        let mut producer = RawClient::connect(relay.addr()).await;
        producer.send(publish(1, "a")).await;
        assert!(matches!(
            producer.recv().await,
            ServerFrame::Ok { seq: Some(1), deliveries: 1, .. }
        ));

        assert_eq!(delivered_agent(consumer.recv().await), (1, "a".into()));
        consumer.send(ClientFrame::Ack { sub: 1, seq: 1 }).await;
        drop(consumer);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        producer.send(publish(2, "b")).await;
        assert!(matches!(
            producer.recv().await,
            ServerFrame::Ok { seq: Some(2), deliveries: 0, .. }
        ));

        let mut returning = RawClient::connect(relay.addr()).await;
        returning.send(subscribe(1, 7)).await;
        assert!(matches!(
            returning.recv().await,
            ServerFrame::Ok { seq: Some(1), .. }
        ));
        assert_eq!(delivered_agent(returning.recv().await), (2, "b".into()));

        relay.shutdown().await;
    }

    #[tokio::test]
    async fn test_unfinished_message_is_replayed_despite_later_acks() {
        let relay = RelayServer::bind("127.0.0.1:0", 16).await.unwrap().spawn().unwrap();

        let mut consumer = RawClient::connect(relay.addr()).await;
        consumer.send(subscribe(1, 1)).await;
        assert!(matches!(consumer.recv().await, ServerFrame::Ok { req: 1, .. }));

        let mut producer = RawClient::connect(relay.addr()).await;
        for (req, agent) in [(1, "a"), (2, "b"), (3, "c")] {
            producer.send(publish(req, agent)).await;
            assert!(matches!(producer.recv().await, ServerFrame::Ok { .. }));
        }
        for _ in 0..3 {
            consumer.recv().await;
        }
        // "b" is still being handled when the consumer goes away.
        consumer.send(ClientFrame::Ack { sub: 1, seq: 3 }).await;
        consumer.send(ClientFrame::Ack { sub: 1, seq: 1 }).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        drop(consumer);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut returning = RawClient::connect(relay.addr()).await;
        returning.send(subscribe(1, 2)).await;
        assert!(matches!(
            returning.recv().await,
            ServerFrame::Ok { seq: Some(1), .. }
        ));
        assert_eq!(delivered_agent(returning.recv().await), (2, "b".into()));

        producer.send(publish(4, "d")).await;
        assert!(matches!(producer.recv().await, ServerFrame::Ok { .. }));
        assert_eq!(delivered_agent(returning.recv().await), (4, "d".into()));

        relay.shutdown().await;
    }

    #[test]
    fn test_cursor_commits_contiguous_runs() {
        let mut cursor = ConsumerCursor::at(0);
        cursor.ack(2);
        cursor.ack(3);
        assert_eq!(cursor.committed, 0);
        assert!(cursor.is_done(3));
        assert!(!cursor.is_done(1));

        cursor.ack(1);
        assert_eq!(cursor.committed, 3);
        assert!(cursor.acked.is_empty());

        cursor.ack(6);
        cursor.skip_to(4);
        assert_eq!(cursor.committed, 4);
        cursor.ack(5);
        assert_eq!(cursor.committed, 6);
    }

    #[tokio::test]
    async fn test_unknown_unsubscribe_is_an_error() {
        let relay = RelayServer::bind("127.0.0.1:0", 16).await.unwrap().spawn().unwrap();
        let mut client = RawClient::connect(relay.addr()).await;
        client
            .send(ClientFrame::Unsubscribe { req: 3, sub: 99 })
            .await;
        assert!(matches!(client.recv().await, ServerFrame::Error { req: 3, .. }));
        relay.shutdown().await;
    }

    #[test]
    fn test_log_respects_retention() {
        let mut log = TopicLog::new();
        for i in 0..5 {
            log.append(hb(&i.to_string()), 3);
        }
        assert_eq!(log.entries.len(), 3);
        assert_eq!(log.entries.front().map(|(s, _)| *s), Some(3));
        assert_eq!(log.next_seq, 6);
    }
}
