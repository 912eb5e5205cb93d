//! Redis Manager - Redis-backed submission store and job ingress
//!
//! This module handles all Redis-related operations:
//! - Pulling judge requests from the queue list (BLPOP) into the engine
//! - Storing and publishing verdicts
//! - Publishing judge progress

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::core::{LimitOverride, Priority, Submission, SubmissionId};
use crate::engine::JudgeEngine;
use crate::error::{EngineError, ErrorBody};
use crate::judger::JudgeState;
use crate::reporter::{SubmissionStore, SubmissionVerdict};

/// Redis key constants
pub mod keys {
    /// Judge request queue (list)
    pub const JUDGE_QUEUE: &str = "judge:queue";
    /// Judge result key prefix
    pub const JUDGE_RESULT_PREFIX: &str = "judge:result:";
    /// Judge result channel
    pub const JUDGE_RESULT_CHANNEL: &str = "judge:results";
    /// Judge progress channel
    pub const JUDGE_PROGRESS_CHANNEL: &str = "judge:progress";
}

const RESULT_EXPIRY_SECS: u64 = 3600; // 1 hour
const BLPOP_TIMEOUT_SECS: f64 = 5.0;
const QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(500);

/// Judge request as pushed onto the Redis queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueRequest {
    pub submission_id: SubmissionId,
    pub problem_id: i64,
    pub language: String,
    pub code: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub limits: LimitOverride,
}

impl QueueRequest {
    pub fn into_submission(self) -> Submission {
        Submission::for_problem(self.submission_id, self.language, self.code, self.problem_id)
            .with_priority(self.priority)
            .with_limits(self.limits)
    }
}

/// Stored in place of a verdict when a queued request is rejected
#[derive(Debug, Serialize, Deserialize)]
pub struct RejectedRequest {
    pub submission_id: SubmissionId,
    pub error: ErrorBody,
}

fn result_key(id: SubmissionId) -> String {
    format!("{}{}", keys::JUDGE_RESULT_PREFIX, id)
}

/// Submission store that keeps verdicts in Redis
pub struct RedisSubmissionStore {
    client: redis::Client,
    conn: Mutex<MultiplexedConnection>,
}

impl RedisSubmissionStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;
        let conn = get_connection_with_retry(&client).await?;
        info!("Connected to Redis at {}", redis_url);
        Ok(Self {
            client,
            conn: Mutex::new(conn),
        })
    }

    /// Record that a queued request was refused by the engine
    pub async fn report_rejection(&self, id: SubmissionId, err: &EngineError) -> Result<()> {
        let rejected = RejectedRequest {
            submission_id: id,
            error: ErrorBody::from(err),
        };
        self.store_result(&result_key(id), Some(keys::JUDGE_RESULT_CHANNEL), &rejected)
            .await
    }

    /// Store a result with a 1-hour expiration and publish it to `channel`
    async fn store_result<T: Serialize>(
        &self,
        key: &str,
        channel: Option<&str>,
        result: &T,
    ) -> Result<()> {
        let json = serde_json::to_string(result)?;
        let mut conn = self.conn.lock().await.clone();

        // Try to store, reconnect on failure
        if let Err(e) = conn
            .set_ex::<_, _, ()>(key, &json, RESULT_EXPIRY_SECS)
            .await
        {
            warn!("Failed to store result: {}. Reconnecting...", e);
            conn = self.reconnect().await?;
            conn.set_ex::<_, _, ()>(key, &json, RESULT_EXPIRY_SECS)
                .await
                .with_context(|| format!("Failed to store {}", key))?;
        }

        // Publish to channel (ignore errors as there may be no subscribers)
        if let Some(chan) = channel {
            let _ = conn.publish::<_, _, ()>(chan, &json).await;
        }

        Ok(())
    }

    async fn reconnect(&self) -> Result<MultiplexedConnection> {
        let fresh = get_connection_with_retry(&self.client).await?;
        *self.conn.lock().await = fresh.clone();
        Ok(fresh)
    }
}

#[async_trait]
impl SubmissionStore for RedisSubmissionStore {
    async fn report_verdict(&self, id: SubmissionId, verdict: &SubmissionVerdict) -> Result<()> {
        self.store_result(&result_key(id), Some(keys::JUDGE_RESULT_CHANNEL), verdict)
            .await
    }

    async fn report_progress(&self, id: SubmissionId, state: JudgeState) -> Result<()> {
        let progress = serde_json::json!({
            "submission_id": id,
            "progress": state,
        });
        let json = serde_json::to_string(&progress)?;
        let mut conn = self.conn.lock().await.clone();

        // Ignore errors - progress updates are non-critical
        let _ = conn
            .publish::<_, _, ()>(keys::JUDGE_PROGRESS_CHANNEL, &json)
            .await;
        Ok(())
    }
}

/// Feed requests from the Redis queue into the engine until `shutdown`.
///
/// A full engine queue is retried with a backoff rather than dropped; a
/// request that is refused for any other reason is stored as a rejection.
pub async fn run_ingress(
    redis_url: String,
    engine: Arc<JudgeEngine>,
    store: Arc<RedisSubmissionStore>,
    shutdown: CancellationToken,
) -> Result<()> {
    let client = redis::Client::open(redis_url.as_str()).context("Failed to create Redis client")?;
    // BLPOP blocks its connection, so ingress gets its own
    let mut conn = get_connection_with_retry(&client).await?;
    info!("Listening for judge requests on {}", keys::JUDGE_QUEUE);

    loop {
        let popped = tokio::select! {
            _ = shutdown.cancelled() => break,
            popped = conn.blpop::<_, Option<(String, String)>>(keys::JUDGE_QUEUE, BLPOP_TIMEOUT_SECS) => popped,
        };

        let payload = match popped {
            Ok(Some((_, payload))) => payload,
            Ok(None) => continue,
            Err(e) => {
                warn!("Redis BLPOP failed: {}. Reconnecting...", e);
                conn = get_connection_with_retry(&client).await?;
                continue;
            }
        };

        let request = match serde_json::from_str::<QueueRequest>(&payload) {
            Ok(request) => request,
            Err(e) => {
                warn!("Failed to parse job data: {}. Data: {}", e, payload);
                continue;
            }
        };

        if !admit(&engine, &store, request, &shutdown).await {
            // Shutting down with a request in hand: put it back for the next worker
            let _ = conn
                .lpush::<_, _, ()>(keys::JUDGE_QUEUE, &payload)
                .await;
            break;
        }
    }

    info!("Redis ingress stopped");
    Ok(())
}

/// Submit one request, backing off while the engine queue is full.
/// Returns false if shutdown interrupted the attempt.
async fn admit(
    engine: &JudgeEngine,
    store: &RedisSubmissionStore,
    request: QueueRequest,
    shutdown: &CancellationToken,
) -> bool {
    let id = request.submission_id;
    let submission = request.into_submission();

    loop {
        match engine.submit(submission.clone()) {
            Ok(_) => return true,
            Err(EngineError::QueueFull { .. }) => {
                tokio::select! {
                    _ = shutdown.cancelled() => return false,
                    _ = tokio::time::sleep(QUEUE_FULL_BACKOFF) => {}
                }
            }
            Err(EngineError::ShuttingDown) => return false,
            Err(e) => {
                warn!("Rejected submission {}: {}", id, e);
                if let Err(e) = store.report_rejection(id, &e).await {
                    warn!("Failed to store rejection for {}: {:#}", id, e);
                }
                return true;
            }
        }
    }
}

/// Get a Redis connection with retry logic
async fn get_connection_with_retry(client: &redis::Client) -> Result<MultiplexedConnection> {
    loop {
        match client.get_multiplexed_async_connection().await {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                warn!(
                    "Failed to connect to Redis: {}. Retrying in 3 seconds...",
                    e
                );
                tokio::time::sleep(Duration::from_secs(3)).await;
            }
        }
    }
}
