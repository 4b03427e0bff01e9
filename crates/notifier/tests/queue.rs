//! Redis queue tests.
//!
//! Requires a running Redis instance.
//!
//! ```bash
//! REDIS_URL="redis://localhost:6379" \
//!   cargo test -p herald-notifier --test queue -- --ignored --nocapture
//! ```

use redis::AsyncCommands;
use uuid::Uuid;

use herald_common::types::DeadLetter;
use herald_notifier::queue::{MessageQueue, QueueTopology, RedisQueue};

// ============================================================
// Helpers
// ============================================================

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}

/// Fresh key space per test so runs never interfere.
async fn fresh_queue() -> RedisQueue {
    let topology = QueueTopology {
        exchange: format!("herald-test-{}", Uuid::new_v4()),
        queue: "push.queue".to_string(),
        routing_key: "push".to_string(),
        dead_letter_routing_key: "failed".to_string(),
        max_priority: 10,
    };
    RedisQueue::connect(&redis_url(), topology).await.unwrap()
}

async fn processing_len(queue: &RedisQueue) -> u64 {
    let client = redis::Client::open(redis_url()).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    conn.hlen(queue.topology().processing_key()).await.unwrap()
}

// ============================================================
// Tests
// ============================================================

#[tokio::test]
#[ignore]
async fn test_claim_honours_priority_then_fifo() {
    let queue = fresh_queue().await;
    queue.publish(r#"{"n":"low"}"#, 1).await.unwrap();
    queue.publish(r#"{"n":"high-1"}"#, 5).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    queue.publish(r#"{"n":"high-2"}"#, 5).await.unwrap();

    let order: Vec<String> = {
        let mut order = Vec::new();
        while let Some(msg) = queue.claim().await.unwrap() {
            order.push(msg.payload.clone());
            queue.ack(&msg).await.unwrap();
        }
        order
    };

    assert_eq!(
        order,
        vec![r#"{"n":"high-1"}"#, r#"{"n":"high-2"}"#, r#"{"n":"low"}"#]
    );
    assert_eq!(processing_len(&queue).await, 0);
}

#[tokio::test]
#[ignore]
async fn test_claim_on_empty_queue() {
    let queue = fresh_queue().await;
    assert!(queue.claim().await.unwrap().is_none());
}

#[tokio::test]
#[ignore]
async fn test_requeue_returns_message() {
    let queue = fresh_queue().await;
    let id = queue.publish("payload", 3).await.unwrap();

    let msg = queue.claim().await.unwrap().unwrap();
    assert_eq!(msg.id, id);
    assert_eq!(processing_len(&queue).await, 1);

    queue.requeue(&msg).await.unwrap();
    assert_eq!(processing_len(&queue).await, 0);

    let again = queue.claim().await.unwrap().unwrap();
    assert_eq!(again, msg);
}

#[tokio::test]
#[ignore]
async fn test_dead_letter_records_reason() {
    let queue = fresh_queue().await;
    queue.publish("{broken", 0).await.unwrap();

    let msg = queue.claim().await.unwrap().unwrap();
    queue.dead_letter(&msg, "malformed payload").await.unwrap();

    let (ready, dead) = queue.depth().await.unwrap();
    assert_eq!((ready, dead), (0, 1));
    assert_eq!(processing_len(&queue).await, 0);

    let client = redis::Client::open(redis_url()).unwrap();
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    let raw: String = conn
        .lindex(queue.topology().dead_letter_key(), 0)
        .await
        .unwrap();
    let entry: DeadLetter = serde_json::from_str(&raw).unwrap();
    assert_eq!(entry.original_message, "{broken");
    assert_eq!(entry.failure_reason, "malformed payload");
}

#[tokio::test]
#[ignore]
async fn test_recover_in_flight_requeues_claimed() {
    let queue = fresh_queue().await;
    queue.publish("a", 1).await.unwrap();
    queue.publish("b", 1).await.unwrap();

    // Simulate a crash: claimed but never settled.
    queue.claim().await.unwrap().unwrap();
    queue.claim().await.unwrap().unwrap();
    assert_eq!(processing_len(&queue).await, 2);

    assert_eq!(queue.recover_in_flight().await.unwrap(), 2);
    assert_eq!(processing_len(&queue).await, 0);
    assert_eq!(queue.depth().await.unwrap().0, 2);
}

#[tokio::test]
#[ignore]
async fn test_ping() {
    let queue = fresh_queue().await;
    assert!(queue.ping().await);
}
