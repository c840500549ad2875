//! Redis-backed stage queues.
//!
//! # Key Layout
//!
//! Every key lives under the configured namespace:
//!
//! - `{ns}:queues`: hash of declared stage queues (passive existence checks)
//! - `{ns}:queue:{stage}`: list holding published `TaskEnvelope`s
//! - `{ns}:reply:{task_id}`: list a worker pushes its result onto
//! - `{ns}:requests`: inbox of `PipelineRequest`s consumed by `serve`
//! - `{ns}:status:{request_id}`: stored `StatusMap` for a served request
//!
//! Envelopes are pushed on the left and consumed from the right, so each
//! stage queue is FIFO.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::AsyncCommands;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::envelope::{TaskEnvelope, TaskHandle};
use crate::config::ConnectRetry;
use crate::pipeline::{PipelineRequest, Stage, StatusMap};

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Failed to serialize or parse a message.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// A passive check found no declared queue for the stage.
    #[error("Queue for stage '{0}' has not been declared")]
    QueueMissing(Stage),

    /// The broker never became reachable at startup.
    #[error("Broker unavailable after {attempts} attempts: {last_error}")]
    BrokerUnavailable { attempts: u32, last_error: String },
}

/// Narrow broker interface used by the orchestrator, collector and autoscaler.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Declares one queue per stage. Declaring twice is harmless.
    async fn declare_queues(&self, durable: bool) -> Result<(), QueueError>;

    /// Publishes an envelope onto the stage queue.
    async fn publish(&self, stage: Stage, envelope: &TaskEnvelope)
        -> Result<TaskHandle, QueueError>;

    /// Takes a published message back off its queue.
    ///
    /// Returns `false` when a pool worker already consumed it.
    async fn claim(&self, handle: &TaskHandle) -> Result<bool, QueueError>;

    /// Waits up to `timeout` for the reply a worker pushed for `handle`.
    async fn await_reply(
        &self,
        handle: &TaskHandle,
        timeout: Duration,
    ) -> Result<Option<String>, QueueError>;

    /// Backlog of a stage queue. Passive: fails on an undeclared queue and
    /// never creates one.
    async fn sample_depth(&self, stage: Stage) -> Result<usize, QueueError>;
}

/// Broker key names under one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    namespace: String,
}

impl QueueKeys {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    pub fn declared(&self) -> String {
        format!("{}:queues", self.namespace)
    }

    pub fn queue(&self, stage: Stage) -> String {
        format!("{}:queue:{}", self.namespace, stage)
    }

    pub fn reply_prefix(&self) -> String {
        format!("{}:reply:", self.namespace)
    }

    pub fn reply(&self, task_id: Uuid) -> String {
        format!("{}{}", self.reply_prefix(), task_id)
    }

    pub fn requests(&self) -> String {
        format!("{}:requests", self.namespace)
    }

    pub fn status(&self, request_id: &str) -> String {
        format!("{}:status:{}", self.namespace, request_id)
    }
}

/// Retries `connect` with bounded exponential backoff.
///
/// Exhausting `retry.max_attempts` yields `QueueError::BrokerUnavailable`,
/// the only fatal broker condition.
pub async fn connect_with_backoff<T, F, Fut>(
    retry: &ConnectRetry,
    mut connect: F,
) -> Result<T, QueueError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, QueueError>>,
{
    let mut last_error = String::from("no attempt made");

    for attempt in 0..retry.max_attempts {
        match connect(attempt + 1).await {
            Ok(value) => {
                if attempt > 0 {
                    info!(attempts = attempt + 1, "Broker connection established");
                }
                return Ok(value);
            }
            Err(e) => {
                last_error = e.to_string();
                if attempt + 1 < retry.max_attempts {
                    let delay = retry.delay_for(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %last_error,
                        "Broker not ready, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    Err(QueueError::BrokerUnavailable {
        attempts: retry.max_attempts,
        last_error,
    })
}

/// Idle blocking-pop connections kept for reuse.
const MAX_IDLE_BLOCKING: usize = 8;

/// Bounded stack of idle connections.
#[derive(Debug)]
struct IdlePool<C> {
    idle: Mutex<Vec<C>>,
    max_idle: usize,
}

impl<C> IdlePool<C> {
    fn new(max_idle: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    fn take(&self) -> Option<C> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).pop()
    }

    /// Returns a connection; dropped when the pool is full.
    fn put(&self, conn: C) {
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        if idle.len() < self.max_idle {
            idle.push(conn);
        }
    }

    fn len(&self) -> usize {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Writes one `{ns}:queues` entry per stage.
///
/// `durable` is recorded for workers and operators; broker persistence
/// itself is a deployment setting and is never changed from here.
fn declaration(keys: &QueueKeys, durable: bool) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    for stage in Stage::ALL {
        let meta = serde_json::json!({
            "queue": keys.queue(stage),
            "durable": durable,
        });
        pipe.hset(keys.declared(), stage.as_str(), meta.to_string());
    }
    pipe
}

/// Redis implementation of [`TaskQueue`].
///
/// BRPOP/BLPOP hold their connection until they return, so they run on
/// dedicated connections taken from a small idle pool rather than on the
/// shared `ConnectionManager`.
#[derive(Clone)]
pub struct RedisTaskQueue {
    client: redis::Client,
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    blocking: Arc<IdlePool<MultiplexedConnection>>,
    keys: QueueKeys,
}

impl RedisTaskQueue {
    /// Connects to Redis once and verifies it answers PING.
    pub async fn connect(redis_url: &str, namespace: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let mut redis = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        redis::cmd("PING")
            .query_async::<_, String>(&mut redis)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self {
            client,
            redis,
            blocking: Arc::new(IdlePool::new(MAX_IDLE_BLOCKING)),
            keys: QueueKeys::new(namespace),
        })
    }

    /// Connects with bounded exponential backoff.
    pub async fn connect_with_retry(
        redis_url: &str,
        namespace: &str,
        retry: &ConnectRetry,
    ) -> Result<Self, QueueError> {
        connect_with_backoff(retry, |attempt| {
            debug!(attempt, url = %redis_url, "Connecting to broker");
            Self::connect(redis_url, namespace)
        })
        .await
    }

    /// Pushes a request onto the inbox consumed by `serve`.
    pub async fn enqueue_request(&self, request: &PipelineRequest) -> Result<(), QueueError> {
        let serialized = serde_json::to_string(request)?;
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(self.keys.requests(), serialized).await?;
        Ok(())
    }

    /// Pops the oldest request from the inbox, waiting up to `timeout`.
    pub async fn dequeue_request(
        &self,
        timeout: Duration,
    ) -> Result<Option<PipelineRequest>, QueueError> {
        let result = self
            .blocking_pop("BRPOP", self.keys.requests(), timeout.as_secs().max(1))
            .await?;

        match result {
            Some((_, data)) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    /// Stores the final status map of a served request.
    pub async fn store_status(&self, status: &StatusMap) -> Result<(), QueueError> {
        let serialized = serde_json::to_string(status)?;
        let mut conn = self.redis.clone();
        // Kept for 7 days
        conn.set_ex::<_, _, ()>(self.keys.status(&status.request_id), serialized, 604800)
            .await?;
        Ok(())
    }

    /// Reads a stored status map.
    pub async fn fetch_status(&self, request_id: &str) -> Result<Option<StatusMap>, QueueError> {
        let mut conn = self.redis.clone();
        let data: Option<String> = conn.get(self.keys.status(request_id)).await?;
        match data {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    /// Idle connections currently held for blocking pops.
    pub fn idle_blocking_connections(&self) -> usize {
        self.blocking.len()
    }

    /// Runs a blocking pop on a dedicated connection.
    ///
    /// The connection goes back to the pool only after a clean reply. One
    /// dropped mid-command (cancelled caller) or failed is discarded.
    async fn blocking_pop(
        &self,
        command: &str,
        key: String,
        timeout_secs: u64,
    ) -> Result<Option<(String, String)>, QueueError> {
        let mut conn = match self.blocking.take() {
            Some(conn) => conn,
            None => self
                .client
                .get_multiplexed_async_connection()
                .await
                .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?,
        };

        let result: Option<(String, String)> = redis::cmd(command)
            .arg(key)
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;
        self.blocking.put(conn);
        Ok(result)
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn declare_queues(&self, durable: bool) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        declaration(&self.keys, durable)
            .query_async::<_, ()>(&mut conn)
            .await?;

        info!(durable, namespace = %self.keys.namespace, "Declared stage queues");
        Ok(())
    }

    async fn publish(
        &self,
        stage: Stage,
        envelope: &TaskEnvelope,
    ) -> Result<TaskHandle, QueueError> {
        let queue = self.keys.queue(stage);
        let message = serde_json::to_string(envelope)?;
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(&queue, &message).await?;

        debug!(
            stage = %stage,
            task_id = %envelope.task_id,
            request_id = %envelope.request_id,
            attempt = envelope.attempt,
            "Published task"
        );

        Ok(TaskHandle {
            task_id: envelope.task_id,
            stage,
            queue,
            message,
        })
    }

    async fn claim(&self, handle: &TaskHandle) -> Result<bool, QueueError> {
        let mut conn = self.redis.clone();
        let removed: i64 = conn.lrem(&handle.queue, 1, &handle.message).await?;
        Ok(removed > 0)
    }

    async fn await_reply(
        &self,
        handle: &TaskHandle,
        timeout: Duration,
    ) -> Result<Option<String>, QueueError> {
        let secs = timeout.as_secs_f64().ceil().max(1.0) as u64;
        let result = self
            .blocking_pop("BLPOP", self.keys.reply(handle.task_id), secs)
            .await?;
        Ok(result.map(|(_, reply)| reply))
    }

    async fn sample_depth(&self, stage: Stage) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let declared: bool = conn.hexists(self.keys.declared(), stage.as_str()).await?;
        if !declared {
            return Err(QueueError::QueueMissing(stage));
        }
        let depth: usize = conn.llen(self.keys.queue(stage)).await?;
        Ok(depth)
    }
}
