//! Messages placed on stage queues.
//!
//! - `TaskEnvelope`: one stage invocation as published to the broker
//! - `TaskHandle`: what the publisher keeps to claim or await that message

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::pipeline::Stage;

/// One stage invocation as it travels through the broker.
///
/// Pool workers read `payload`, run the stage, and push their result to
/// `reply_to`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskEnvelope {
    /// Unique identifier for this invocation attempt.
    pub task_id: Uuid,
    /// Request the invocation belongs to.
    pub request_id: String,
    pub stage: Stage,
    /// Flat stage input.
    pub payload: Value,
    /// One-based attempt number.
    pub attempt: u32,
    /// Broker list the worker must push its result onto.
    pub reply_to: String,
    pub created_at: DateTime<Utc>,
}

impl TaskEnvelope {
    pub fn new(request_id: impl Into<String>, stage: Stage, payload: Value) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            request_id: request_id.into(),
            stage,
            payload,
            attempt: 1,
            reply_to: String::new(),
            created_at: Utc::now(),
        }
    }

    /// Sets the attempt number.
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// Sets the reply list.
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = reply_to.into();
        self
    }
}

/// Receipt for a published envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskHandle {
    pub task_id: Uuid,
    pub stage: Stage,
    /// Broker list the message was pushed to.
    pub queue: String,
    /// Exact serialized message, used to claim it back off the queue.
    pub message: String,
}
