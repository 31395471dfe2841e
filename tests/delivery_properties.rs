mod fixtures;

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::json;

use a2a_mesh::agent::IntentHandler;
use a2a_mesh::broker::{Broker, FaultyBroker, InMemoryBroker, SharedBroker, topic_handler};
use a2a_mesh::messaging::{
    DedupCache, Envelope, MessagingClient, TaskRequest, TaskResult, TaskStatus, topic,
};

use fixtures::{Echo, Panicking, Recorder, fast_config, fast_retry, spawn_agent};

fn collecting_handler(
    seen: Arc<Mutex<Vec<Envelope>>>,
) -> a2a_mesh::broker::TopicHandler {
    topic_handler(move |envelope: Envelope| {
        let seen = Arc::clone(&seen);
        async move {
            seen.lock().push(envelope);
            Ok(())
        }
    })
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_at_least_once_under_redelivery() {
    let faulty = Arc::new(FaultyBroker::new(Arc::new(InMemoryBroker::new())));
    faulty.duplicate_deliveries(true);
    let broker: SharedBroker = faulty.clone();

    let first = Arc::new(Mutex::new(Vec::new()));
    let second = Arc::new(Mutex::new(Vec::new()));
    broker
        .subscribe("a2a.inbox.worker", collecting_handler(Arc::clone(&first)))
        .await
        .unwrap();
    broker
        .subscribe("a2a.inbox.worker", collecting_handler(Arc::clone(&second)))
        .await
        .unwrap();

    let request = TaskRequest::new("manager", "worker", "lookup", json!({}));
    broker
        .publish("a2a.inbox.worker", request.clone().into())
        .await
        .unwrap();
    settle().await;

    for seen in [&first, &second] {
        let seen = seen.lock();
        assert!(!seen.is_empty());
        assert!(
            seen.iter()
                .all(|e| e.message_id() == Some(request.message_id.as_str()))
        );
    }
}

#[tokio::test]
async fn test_duplicate_delivery_runs_handler_once() {
    let faulty = Arc::new(FaultyBroker::new(Arc::new(InMemoryBroker::new())));
    faulty.duplicate_deliveries(true);
    let broker: SharedBroker = faulty.clone();

    let recorder = Recorder::new(json!({"ok": true}));
    let _worker = spawn_agent(
        &broker,
        "worker",
        fast_config(),
        vec![("lookup", recorder.clone() as Arc<dyn IntentHandler>)],
    )
    .await;
    let requester = spawn_agent(&broker, "manager", fast_config(), Vec::new()).await;

    for _ in 0..5 {
        let result = requester
            .send_request_and_wait("worker", "lookup", json!({}), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(result.status, TaskStatus::Completed);
    }
    settle().await;

    assert_eq!(recorder.call_count(), 5);
    assert!(recorder.calls_per_task().values().all(|&n| n == 1));
}

#[tokio::test]
async fn test_resend_with_new_message_id_is_processed() {
    let broker: SharedBroker = Arc::new(InMemoryBroker::new());
    let recorder = Recorder::new(json!("done"));
    let _worker = spawn_agent(
        &broker,
        "worker",
        fast_config(),
        vec![("lookup", recorder.clone() as Arc<dyn IntentHandler>)],
    )
    .await;

    let sender = MessagingClient::new(
        "sender",
        Arc::clone(&broker),
        fast_retry(),
        Arc::new(DedupCache::new(100, Duration::from_secs(60))),
    );
    let results: Arc<Mutex<Vec<TaskResult>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&results);
    sender
        .on_results(move |result| sink.lock().push(result))
        .await
        .unwrap();

    let request = TaskRequest::new("sender", "worker", "lookup", json!({}));
    sender.send(request.clone()).await.unwrap();
    settle().await;

    // Same message id again: suppressed.
    sender.send(request.clone()).await.unwrap();
    settle().await;
    assert_eq!(recorder.call_count(), 1);

    // Same task, new message id: a legitimate resend.
    sender.send(request.resend()).await.unwrap();
    settle().await;
    assert_eq!(recorder.call_count(), 2);

    let results = results.lock();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.task_id == request.task_id));
}

#[tokio::test]
async fn test_timeout_independence() {
    let broker: SharedBroker = Arc::new(InMemoryBroker::new());
    let _echo = spawn_agent(
        &broker,
        "echo",
        fast_config(),
        vec![("echo", Arc::new(Echo) as Arc<dyn IntentHandler>)],
    )
    .await;
    let requester = spawn_agent(&broker, "manager", fast_config(), Vec::new()).await;

    let started = Instant::now();
    let result = requester
        .send_request_and_wait("nobody", "lookup", json!({}), Duration::from_millis(200))
        .await
        .unwrap();
    let elapsed = started.elapsed();
    assert_eq!(result.status, TaskStatus::Timeout);
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_millis(500), "took {:?}", elapsed);
    assert_eq!(requester.pending_requests(), 0);

    let result = requester
        .send_request_and_wait("echo", "echo", json!({"n": 1}), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(result.status, TaskStatus::Completed);
    assert_eq!(result.output["echo"]["n"], 1);
}

#[tokio::test]
async fn test_late_result_is_discarded() {
    let broker: SharedBroker = Arc::new(InMemoryBroker::new());
    let slow = Recorder::with_delay(json!("late"), Duration::from_millis(300));
    let _worker = spawn_agent(
        &broker,
        "slow",
        fast_config(),
        vec![("lookup", slow.clone() as Arc<dyn IntentHandler>)],
    )
    .await;
    let requester = spawn_agent(&broker, "manager", fast_config(), Vec::new()).await;

    let result = requester
        .send_request_and_wait("slow", "lookup", json!({}), Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(result.status, TaskStatus::Timeout);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(slow.call_count(), 1);
    assert_eq!(requester.pending_requests(), 0);
}

#[tokio::test]
async fn test_ordering_within_topic() {
    let broker: SharedBroker = Arc::new(InMemoryBroker::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    broker
        .subscribe(&topic::inbox("worker"), collecting_handler(Arc::clone(&seen)))
        .await
        .unwrap();

    for n in 0..50 {
        let request = TaskRequest::new("manager", "worker", "lookup", json!({"n": n}));
        broker
            .publish(&topic::inbox("worker"), request.into())
            .await
            .unwrap();
    }
    settle().await;

    let order: Vec<i64> = seen
        .lock()
        .iter()
        .filter_map(|e| match e {
            Envelope::TaskRequest(r) => r.payload["n"].as_i64(),
            _ => None,
        })
        .collect();
    assert_eq!(order, (0..50).collect::<Vec<i64>>());
}

#[tokio::test]
async fn test_backpressure_bound() {
    let broker: SharedBroker = Arc::new(InMemoryBroker::new());
    let mut config = fast_config();
    config.max_in_flight = 2;

    let recorder = Recorder::with_delay(json!("ok"), Duration::from_millis(200));
    let worker = spawn_agent(
        &broker,
        "worker",
        config,
        vec![("lookup", recorder.clone() as Arc<dyn IntentHandler>)],
    )
    .await;
    let requester = spawn_agent(&broker, "manager", fast_config(), Vec::new()).await;

    let started = Instant::now();
    let results = join_all((0..3).map(|n| {
        requester.send_request_and_wait("worker", "lookup", json!({"n": n}), Duration::from_secs(2))
    }))
    .await;

    assert!(results
        .iter()
        .all(|r| r.as_ref().unwrap().status == TaskStatus::Completed));
    assert_eq!(recorder.call_count(), 3);
    assert_eq!(recorder.peak_concurrency(), 2);
    // The third request had to wait for a permit.
    assert!(started.elapsed() >= Duration::from_millis(400));
    assert_eq!(worker.in_flight(), 0);
}

#[tokio::test]
async fn test_handler_failure_is_a_result() {
    let broker: SharedBroker = Arc::new(InMemoryBroker::new());
    let worker = spawn_agent(
        &broker,
        "worker",
        fast_config(),
        vec![("explode", Arc::new(Panicking) as Arc<dyn IntentHandler>)],
    )
    .await;
    let requester = spawn_agent(&broker, "manager", fast_config(), Vec::new()).await;

    let result = requester
        .send_request_and_wait("worker", "explode", json!({}), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(result.status, TaskStatus::Failed);
    assert_eq!(result.error_code(), Some("handler_panic"));
    assert!(worker.is_running());

    let result = requester
        .send_request_and_wait("worker", "unknown", json!({}), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(result.error_code(), Some("no_handler"));
}
