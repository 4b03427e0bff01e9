//! Redis-backed priority queue with a processing set and dead-letter list.
//!
//! Keys (for exchange `X`, queue `Q`):
//! - `X:{routing_key}`: sorted set of ready messages, highest score first
//! - `X:Q:processing`: hash of claimed message to its original score
//! - `X:{dead_letter_routing_key}`: list of [`DeadLetter`] entries
//!
//! A claim atomically moves a message from the ready set to the processing
//! hash. Messages stay there until acked, requeued or dead-lettered, so a
//! crashed worker's messages can be recovered on the next start.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use herald_common::config::AppConfig;
use herald_common::error::AppError;
use herald_common::types::DeadLetter;

/// Score slot reserved per priority level; larger than any epoch-millis value.
const PRIORITY_STRIDE: f64 = 1e13;

/// Atomically pop the best ready message into the processing hash.
const CLAIM_SCRIPT: &str = r#"
local popped = redis.call('ZPOPMAX', KEYS[1])
if #popped == 0 then
    return false
end
redis.call('HSET', KEYS[2], popped[1], popped[2])
return popped
"#;

/// Key layout derived from the exchange / routing configuration.
#[derive(Debug, Clone)]
pub struct QueueTopology {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
    pub dead_letter_routing_key: String,
    pub max_priority: u8,
}

impl QueueTopology {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            exchange: config.exchange_name.clone(),
            queue: config.queue_name.clone(),
            routing_key: config.routing_key.clone(),
            dead_letter_routing_key: config.dead_letter_routing_key.clone(),
            max_priority: config.queue_max_priority,
        }
    }

    pub fn ready_key(&self) -> String {
        format!("{}:{}", self.exchange, self.routing_key)
    }

    pub fn processing_key(&self) -> String {
        format!("{}:{}:processing", self.exchange, self.queue)
    }

    pub fn dead_letter_key(&self) -> String {
        format!("{}:{}", self.exchange, self.dead_letter_routing_key)
    }

    /// Higher priority first; within a priority, earlier messages first.
    pub fn score(&self, priority: i32, enqueued_at_ms: i64) -> f64 {
        let priority = priority.clamp(0, self.max_priority as i32) as f64;
        let age_rank = PRIORITY_STRIDE - (enqueued_at_ms.max(0) as f64).min(PRIORITY_STRIDE - 1.0);
        priority * PRIORITY_STRIDE + age_rank
    }
}

/// Stored member: a unique id keeps identical payloads distinct.
#[derive(Debug, Serialize, Deserialize)]
struct QueuedEnvelope {
    id: Uuid,
    payload: String,
}

/// A message owned by one worker until it is settled.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedMessage {
    pub id: String,
    pub payload: String,
    member: String,
    score: f64,
}

impl ClaimedMessage {
    fn from_member(member: String, score: f64) -> Self {
        match serde_json::from_str::<QueuedEnvelope>(&member) {
            Ok(envelope) => Self {
                id: envelope.id.to_string(),
                payload: envelope.payload,
                member,
                score,
            },
            // Raw payload pushed by a foreign producer.
            Err(_) => Self {
                id: "raw".to_string(),
                payload: member.clone(),
                member,
                score,
            },
        }
    }

    /// Build a claimed message without a backing store.
    pub fn detached(id: impl Into<String>, payload: impl Into<String>) -> Self {
        let payload = payload.into();
        Self {
            id: id.into(),
            member: payload.clone(),
            payload,
            score: 0.0,
        }
    }
}

/// Queue operations the consumer relies on.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Claim the next ready message, if any.
    async fn claim(&self) -> Result<Option<ClaimedMessage>, AppError>;

    /// Message fully processed.
    async fn ack(&self, message: &ClaimedMessage) -> Result<(), AppError>;

    /// Put the message back on the ready queue with its original ordering.
    async fn requeue(&self, message: &ClaimedMessage) -> Result<(), AppError>;

    /// Move the message to the dead-letter queue.
    async fn dead_letter(&self, message: &ClaimedMessage, reason: &str) -> Result<(), AppError>;

    /// Whether the backing store answers.
    async fn ping(&self) -> bool;
}

/// Redis implementation of [`MessageQueue`].
#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
    topology: QueueTopology,
    claim_script: Script,
}

impl RedisQueue {
    /// Connect and build a queue over the given topology.
    pub async fn connect(redis_url: &str, topology: QueueTopology) -> anyhow::Result<Self> {
        let client = Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;

        tracing::info!(
            ready = %topology.ready_key(),
            dead_letter = %topology.dead_letter_key(),
            "Connected to Redis queue"
        );
        Ok(Self::new(conn, topology))
    }

    pub fn new(conn: ConnectionManager, topology: QueueTopology) -> Self {
        Self {
            conn,
            topology,
            claim_script: Script::new(CLAIM_SCRIPT),
        }
    }

    pub fn topology(&self) -> &QueueTopology {
        &self.topology
    }

    /// Enqueue a raw JSON payload at the given priority.
    pub async fn publish(&self, payload: &str, priority: i32) -> Result<String, AppError> {
        let id = Uuid::new_v4();
        let member = serde_json::to_string(&QueuedEnvelope {
            id,
            payload: payload.to_string(),
        })?;
        let score = self
            .topology
            .score(priority, Utc::now().timestamp_millis());

        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(self.topology.ready_key(), member, score)
            .await?;
        Ok(id.to_string())
    }

    /// Requeue everything left in the processing hash by a previous run.
    pub async fn recover_in_flight(&self) -> Result<usize, AppError> {
        let mut conn = self.conn.clone();
        let stranded: HashMap<String, f64> = conn.hgetall(self.topology.processing_key()).await?;

        for (member, score) in &stranded {
            redis::pipe()
                .atomic()
                .zadd(self.topology.ready_key(), member, *score)
                .ignore()
                .hdel(self.topology.processing_key(), member)
                .ignore()
                .query_async::<()>(&mut conn)
                .await?;
        }

        if !stranded.is_empty() {
            tracing::warn!(count = stranded.len(), "Recovered in-flight messages from previous run");
        }
        Ok(stranded.len())
    }

    /// Ready and dead-lettered message counts.
    pub async fn depth(&self) -> Result<(u64, u64), AppError> {
        let mut conn = self.conn.clone();
        let ready: u64 = conn.zcard(self.topology.ready_key()).await?;
        let dead: u64 = conn.llen(self.topology.dead_letter_key()).await?;
        Ok((ready, dead))
    }
}

#[async_trait]
impl MessageQueue for RedisQueue {
    async fn claim(&self) -> Result<Option<ClaimedMessage>, AppError> {
        let mut conn = self.conn.clone();
        let popped: Option<(String, f64)> = self
            .claim_script
            .key(self.topology.ready_key())
            .key(self.topology.processing_key())
            .invoke_async(&mut conn)
            .await?;

        Ok(popped.map(|(member, score)| ClaimedMessage::from_member(member, score)))
    }

    async fn ack(&self, message: &ClaimedMessage) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        conn.hdel::<_, _, ()>(self.topology.processing_key(), &message.member)
            .await?;
        Ok(())
    }

    async fn requeue(&self, message: &ClaimedMessage) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .zadd(self.topology.ready_key(), &message.member, message.score)
            .ignore()
            .hdel(self.topology.processing_key(), &message.member)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn dead_letter(&self, message: &ClaimedMessage, reason: &str) -> Result<(), AppError> {
        let entry = serde_json::to_string(&DeadLetter {
            original_message: message.payload.clone(),
            failure_reason: reason.to_string(),
            failed_at: Utc::now(),
        })?;

        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .lpush(self.topology.dead_letter_key(), entry)
            .ignore()
            .hdel(self.topology.processing_key(), &message.member)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        tracing::warn!(message_id = %message.id, reason, "Message dead-lettered");
        Ok(())
    }

    async fn ping(&self) -> bool {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map(|pong| pong == "PONG")
            .unwrap_or(false)
    }
}
