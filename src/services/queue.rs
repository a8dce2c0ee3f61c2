use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

use crate::models::task::TaskId;

const QUEUE_KEY: &str = "shotdiff:tasks";
const PROCESSING_KEY: &str = "shotdiff:processing";

/// Atomically claim the earliest task whose ready time has passed.
const CLAIM_SCRIPT: &str = r#"
local items = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
if #items == 0 then
    return false
end
redis.call('ZREM', KEYS[1], items[1])
redis.call('ZADD', KEYS[2], ARGV[1], items[1])
return items[1]
"#;

/// Move claims older than the lease back onto the ready set.
const RECLAIM_SCRIPT: &str = r#"
local items = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, item in ipairs(items) do
    redis.call('ZREM', KEYS[2], item)
    redis.call('ZADD', KEYS[1], ARGV[2], item)
end
return #items
"#;

/// Task payload serialized into the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedTask {
    pub candidate_id: Uuid,
    pub task_id: TaskId,
    /// Capture attempts already made before this delivery.
    pub attempts: u32,
}

/// Durable pending-task queue with delayed delivery.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Make a task available for dispatch at `ready_at`.
    async fn enqueue(&self, task: &QueuedTask, ready_at: DateTime<Utc>) -> Result<(), QueueError>;

    /// Claim the next ready task, if any.
    async fn dequeue(&self) -> Result<Option<QueuedTask>, QueueError>;

    /// Release a claimed task for good.
    async fn ack(&self, task: &QueuedTask) -> Result<(), QueueError>;

    /// Pending tasks, including ones waiting out a backoff delay.
    async fn depth(&self) -> Result<u64, QueueError>;

    /// Requeue claims held longer than `lease` (their worker died).
    async fn reclaim_stale(&self, lease: Duration) -> Result<u64, QueueError>;

    async fn health_check(&self) -> Result<(), QueueError>;
}

/// Redis-backed queue: a sorted set scored by ready time plus a processing set
/// scored by claim time.
pub struct RedisTaskQueue {
    client: redis::Client,
}

impl RedisTaskQueue {
    pub fn new(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn enqueue(&self, task: &QueuedTask, ready_at: DateTime<Utc>) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(task)?;
        let _: () = conn
            .zadd(QUEUE_KEY, &payload, ready_at.timestamp_millis())
            .await?;
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<QueuedTask>, QueueError> {
        let mut conn = self.connection().await?;
        let claimed: Option<String> = redis::Script::new(CLAIM_SCRIPT)
            .key(QUEUE_KEY)
            .key(PROCESSING_KEY)
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        match claimed {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn ack(&self, task: &QueuedTask) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(task)?;
        let _: () = conn.zrem(PROCESSING_KEY, &payload).await?;
        Ok(())
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let depth: u64 = conn.zcard(QUEUE_KEY).await?;
        Ok(depth)
    }

    async fn reclaim_stale(&self, lease: Duration) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let now = Utc::now().timestamp_millis();
        let cutoff = now - lease.as_millis() as i64;
        let moved: u64 = redis::Script::new(RECLAIM_SCRIPT)
            .key(QUEUE_KEY)
            .key(PROCESSING_KEY)
            .arg(cutoff)
            .arg(now)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }
}

/// In-process queue with the same delayed-delivery semantics.
#[derive(Default)]
pub struct MemoryTaskQueue {
    inner: Mutex<MemoryQueueState>,
}

#[derive(Default)]
struct MemoryQueueState {
    /// Keyed by (ready time in ms, insertion sequence).
    pending: BTreeMap<(i64, u64), QueuedTask>,
    processing: Vec<(QueuedTask, DateTime<Utc>)>,
    seq: u64,
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().processing.len()
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn enqueue(&self, task: &QueuedTask, ready_at: DateTime<Utc>) -> Result<(), QueueError> {
        let mut state = self.inner.lock();
        state.seq += 1;
        let key = (ready_at.timestamp_millis(), state.seq);
        state.pending.insert(key, task.clone());
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<QueuedTask>, QueueError> {
        let now = Utc::now();
        let mut state = self.inner.lock();
        let ready = state
            .pending
            .keys()
            .next()
            .copied()
            .filter(|(ready_ms, _)| *ready_ms <= now.timestamp_millis());
        let Some(key) = ready else {
            return Ok(None);
        };
        let task = state.pending.remove(&key);
        if let Some(task) = &task {
            state.processing.push((task.clone(), now));
        }
        Ok(task)
    }

    async fn ack(&self, task: &QueuedTask) -> Result<(), QueueError> {
        let mut state = self.inner.lock();
        if let Some(pos) = state.processing.iter().position(|(t, _)| t == task) {
            state.processing.remove(pos);
        }
        Ok(())
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        Ok(self.inner.lock().pending.len() as u64)
    }

    async fn reclaim_stale(&self, lease: Duration) -> Result<u64, QueueError> {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::weeks(52));
        let mut state = self.inner.lock();
        let (stale, fresh): (Vec<_>, Vec<_>) = std::mem::take(&mut state.processing)
            .into_iter()
            .partition(|(_, claimed_at)| now.signed_duration_since(*claimed_at) > lease);
        state.processing = fresh;
        let moved = stale.len() as u64;
        for (task, _) in stale {
            state.seq += 1;
            let key = (now.timestamp_millis(), state.seq);
            state.pending.insert(key, task);
        }
        Ok(moved)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued(n: u32) -> QueuedTask {
        QueuedTask {
            candidate_id: Uuid::nil(),
            task_id: TaskId::from_raw(format!("task-{}", n)),
            attempts: 0,
        }
    }

    #[tokio::test]
    async fn test_memory_queue_respects_ready_time() {
        let queue = MemoryTaskQueue::new();
        let later = Utc::now() + chrono::Duration::hours(1);
        queue.enqueue(&queued(1), later).await.unwrap();
        queue.enqueue(&queued(2), Utc::now()).await.unwrap();

        assert_eq!(queue.depth().await.unwrap(), 2);
        assert_eq!(queue.dequeue().await.unwrap(), Some(queued(2)));
        assert_eq!(queue.dequeue().await.unwrap(), None);
        assert_eq!(queue.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_memory_queue_fifo_for_equal_ready_times() {
        let queue = MemoryTaskQueue::new();
        let now = Utc::now();
        for n in 0..3 {
            queue.enqueue(&queued(n), now).await.unwrap();
        }
        for n in 0..3 {
            assert_eq!(queue.dequeue().await.unwrap(), Some(queued(n)));
        }
    }

    #[tokio::test]
    async fn test_memory_queue_ack_and_reclaim() {
        let queue = MemoryTaskQueue::new();
        queue.enqueue(&queued(1), Utc::now()).await.unwrap();
        queue.enqueue(&queued(2), Utc::now()).await.unwrap();

        let first = queue.dequeue().await.unwrap().unwrap();
        let _second = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(queue.in_flight(), 2);

        queue.ack(&first).await.unwrap();
        assert_eq!(queue.in_flight(), 1);

        // A zero lease treats every claim as abandoned.
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(queue.reclaim_stale(Duration::ZERO).await.unwrap(), 1);
        assert_eq!(queue.in_flight(), 0);
        assert_eq!(queue.dequeue().await.unwrap(), Some(queued(2)));
    }
}
