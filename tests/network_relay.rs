mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;

use a2a_mesh::agent::IntentHandler;
use a2a_mesh::broker::{
    Acknowledger, Broker, NetworkBroker, RelayHandle, RelayServer, SharedBroker, acked_handler,
    topic_handler,
};
use a2a_mesh::config::{BrokerConfig, TransportKind};
use a2a_mesh::messaging::{Envelope, TaskRequest, TaskStatus};

use fixtures::{Echo, Recorder, fast_config, spawn_agent};

async fn start_relay(retention: usize) -> RelayHandle {
    RelayServer::bind("127.0.0.1:0", retention)
        .await
        .unwrap()
        .spawn()
        .unwrap()
}

fn client_config(relay: &RelayHandle, client_id: &str) -> BrokerConfig {
    BrokerConfig {
        transport: TransportKind::Network,
        relay_addr: relay.addr().to_string(),
        client_id: client_id.to_string(),
        connect_timeout_ms: 1000,
        publish_timeout_ms: 1000,
        reconnect_delay_ms: 50,
        ..BrokerConfig::default()
    }
}

fn recording(seen: Arc<Mutex<Vec<i64>>>) -> a2a_mesh::broker::TopicHandler {
    topic_handler(move |envelope: Envelope| {
        let seen = Arc::clone(&seen);
        async move {
            if let Envelope::TaskRequest(request) = envelope
                && let Some(n) = request.payload["n"].as_i64()
            {
                seen.lock().push(n);
            }
            Ok(())
        }
    })
}

fn numbered(n: i64) -> Envelope {
    TaskRequest::new("publisher", "worker", "lookup", json!({ "n": n })).into()
}

#[tokio::test]
async fn test_request_round_trip_over_relay() {
    let relay = start_relay(64).await;
    let host_a: SharedBroker =
        Arc::new(NetworkBroker::connect(client_config(&relay, "host-a")).await.unwrap());
    let host_b: SharedBroker =
        Arc::new(NetworkBroker::connect(client_config(&relay, "host-b")).await.unwrap());

    let worker = spawn_agent(
        &host_b,
        "worker",
        fast_config(),
        vec![("echo", Arc::new(Echo) as Arc<dyn IntentHandler>)],
    )
    .await;
    let manager = spawn_agent(&host_a, "manager", fast_config(), Vec::new()).await;

    let result = manager
        .send_request_and_wait("worker", "echo", json!({"q": "relay"}), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(result.status, TaskStatus::Completed);
    assert_eq!(result.output["echo"]["q"], "relay");

    manager.stop().await.unwrap();
    worker.stop().await.unwrap();
    relay.shutdown().await;
}

#[tokio::test]
async fn test_ordering_over_relay() {
    let relay = start_relay(256).await;
    let publisher = NetworkBroker::connect(client_config(&relay, "pub")).await.unwrap();
    let subscriber = NetworkBroker::connect(client_config(&relay, "sub")).await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    subscriber
        .subscribe("a2a.inbox.worker", recording(Arc::clone(&seen)))
        .await
        .unwrap();

    for n in 0..20 {
        let ack = publisher.publish("a2a.inbox.worker", numbered(n)).await.unwrap();
        assert!(ack.sequence.is_some());
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(*seen.lock(), (0..20).collect::<Vec<i64>>());
    relay.shutdown().await;
}

#[tokio::test]
async fn test_subscriber_restart_replays_missed_messages() {
    let relay = start_relay(64).await;
    let publisher = NetworkBroker::connect(client_config(&relay, "pub")).await.unwrap();

    let before_restart = Arc::new(Mutex::new(Vec::new()));
    let subscriber = NetworkBroker::connect(client_config(&relay, "worker-host")).await.unwrap();
    subscriber
        .subscribe("a2a.inbox.worker", recording(Arc::clone(&before_restart)))
        .await
        .unwrap();

    publisher.publish("a2a.inbox.worker", numbered(0)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(*before_restart.lock(), vec![0]);

    // Subscriber process goes away; traffic keeps flowing.
    subscriber.shutdown();
    drop(subscriber);
    tokio::time::sleep(Duration::from_millis(100)).await;
    for n in 1..=3 {
        publisher.publish("a2a.inbox.worker", numbered(n)).await.unwrap();
    }

    // Same consumer identity resumes from its last acknowledged message.
    let after_restart = Arc::new(Mutex::new(Vec::new()));
    let restarted = NetworkBroker::connect(client_config(&relay, "worker-host")).await.unwrap();
    restarted
        .subscribe("a2a.inbox.worker", recording(Arc::clone(&after_restart)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(*after_restart.lock(), vec![1, 2, 3]);
    relay.shutdown().await;
}

#[tokio::test]
async fn test_request_in_progress_at_crash_is_redelivered() {
    let relay = start_relay(64).await;
    let publisher = NetworkBroker::connect(client_config(&relay, "pub")).await.unwrap();

    let host = Arc::new(NetworkBroker::connect(client_config(&relay, "worker-host")).await.unwrap());
    let shared: SharedBroker = host.clone();
    let stuck = Recorder::with_delay(json!("never"), Duration::from_secs(10));
    let _crashed = spawn_agent(
        &shared,
        "worker",
        fast_config(),
        vec![("lookup", stuck.clone() as Arc<dyn IntentHandler>)],
    )
    .await;

    publisher.publish("a2a.inbox.worker", numbered(7)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(stuck.call_count(), 1);

    // Host dies while the handler is still running.
    host.shutdown();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let restarted: SharedBroker =
        Arc::new(NetworkBroker::connect(client_config(&relay, "worker-host")).await.unwrap());
    let fast = Recorder::new(json!("done"));
    let worker = spawn_agent(
        &restarted,
        "worker",
        fast_config(),
        vec![("lookup", fast.clone() as Arc<dyn IntentHandler>)],
    )
    .await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(fast.call_count(), 1);
    assert_eq!(fast.calls()[0].payload["n"], 7);

    worker.stop().await.unwrap();
    relay.shutdown().await;
}

#[tokio::test]
async fn test_two_subscriptions_keep_separate_cursors() {
    let relay = start_relay(64).await;
    let publisher = NetworkBroker::connect(client_config(&relay, "pub")).await.unwrap();
    let host = NetworkBroker::connect(client_config(&relay, "shared-host")).await.unwrap();

    let fast_seen = Arc::new(Mutex::new(Vec::new()));
    host.subscribe("a2a.inbox.worker", recording(Arc::clone(&fast_seen)))
        .await
        .unwrap();
    let parked = Arc::new(Mutex::new(Vec::new()));
    let park = Arc::clone(&parked);
    host.subscribe(
        "a2a.inbox.worker",
        acked_handler(move |envelope: Envelope, ack: Acknowledger| {
            let park = Arc::clone(&park);
            async move {
                park.lock().push((envelope, ack));
                Ok(())
            }
        }),
    )
    .await
    .unwrap();

    publisher.publish("a2a.inbox.worker", numbered(1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(*fast_seen.lock(), vec![1]);
    assert_eq!(parked.lock().len(), 1);
    host.shutdown();
    drop(host);
    parked.lock().clear();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let first = Arc::new(Mutex::new(Vec::new()));
    let second = Arc::new(Mutex::new(Vec::new()));
    let restarted = NetworkBroker::connect(client_config(&relay, "shared-host")).await.unwrap();
    restarted
        .subscribe("a2a.inbox.worker", recording(Arc::clone(&first)))
        .await
        .unwrap();
    restarted
        .subscribe("a2a.inbox.worker", recording(Arc::clone(&second)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert!(first.lock().is_empty());
    assert_eq!(*second.lock(), vec![1]);
    relay.shutdown().await;
}

#[tokio::test]
async fn test_new_consumer_starts_at_tail() {
    let relay = start_relay(64).await;
    let publisher = NetworkBroker::connect(client_config(&relay, "pub")).await.unwrap();
    publisher.publish("a2a.inbox.worker", numbered(0)).await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let late = NetworkBroker::connect(client_config(&relay, "late")).await.unwrap();
    late.subscribe("a2a.inbox.worker", recording(Arc::clone(&seen)))
        .await
        .unwrap();
    publisher.publish("a2a.inbox.worker", numbered(1)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(*seen.lock(), vec![1]);
    relay.shutdown().await;
}

#[tokio::test]
async fn test_relay_outage_is_a_transient_error() {
    let relay = start_relay(64).await;
    let broker = NetworkBroker::connect(client_config(&relay, "pub")).await.unwrap();
    assert!(broker.is_connected());

    relay.shutdown().await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    let err = broker
        .publish("a2a.inbox.worker", numbered(0))
        .await
        .unwrap_err();
    assert!(err.is_transient(), "unexpected error: {}", err);
}
