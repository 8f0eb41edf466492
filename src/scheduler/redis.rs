use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use redis::aio::MultiplexedConnection;
use redis::Client;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::duplicate::{DuplicateRemover, RedisDuplicateRemover};
use super::{Scheduler, Traversal};
use crate::crawler::hasher::{RequestHasher, Sha256RequestHasher};
use crate::crawler::Request;
use crate::error::{Result, SpiderError};

/// Time to live of the bookkeeping sets, in seconds
const STATE_TTL: u64 = 86400;

/// Scheduler keeping its queue and seen set in redis, shared by every
/// spider process of a crawl
pub struct RedisScheduler {
    traversal: Traversal,
    hasher: Sha256RequestHasher,
    duplicate_remover: RedisDuplicateRemover,
    conn: Arc<Mutex<MultiplexedConnection>>,
    spider_id: RwLock<Option<String>>,
}

impl RedisScheduler {
    pub async fn connect(redis_url: &str, traversal: Traversal) -> Result<Self> {
        let client = Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;

        Ok(Self {
            traversal,
            hasher: Sha256RequestHasher,
            duplicate_remover: RedisDuplicateRemover::new(conn.clone()),
            conn: Arc::new(Mutex::new(conn)),
            spider_id: RwLock::new(None),
        })
    }

    fn key(&self, kind: &str) -> Result<String> {
        self.spider_id
            .read()
            .as_ref()
            .map(|id| format!("spider:{}:{}", kind, id))
            .ok_or_else(|| SpiderError::Usage("scheduler used before initialization".to_string()))
    }

    /// Add the request hash to a bookkeeping set, setting its TTL once
    async fn mark(&self, kind: &str, request: &Request) -> Result<()> {
        let key = self.key(kind)?;
        let mut conn = self.conn.lock().await;

        redis::cmd("SADD")
            .arg(&key)
            .arg(request.hash())
            .query_async::<_, ()>(&mut *conn)
            .await?;

        let ttl: i64 = redis::cmd("TTL")
            .arg(&key)
            .query_async(&mut *conn)
            .await
            .unwrap_or(-1);

        if ttl == -1 {
            redis::cmd("EXPIRE")
                .arg(&key)
                .arg(STATE_TTL)
                .query_async::<_, ()>(&mut *conn)
                .await?;
        }

        Ok(())
    }
}

#[async_trait]
impl Scheduler for RedisScheduler {
    async fn initialize(&self, spider_id: &str) -> Result<()> {
        self.duplicate_remover.initialize(spider_id).await?;
        *self.spider_id.write() = Some(spider_id.to_string());
        Ok(())
    }

    async fn enqueue(&self, requests: Vec<Request>) -> Result<usize> {
        let queue_key = self.key("queue")?;
        let mut accepted = 0;

        for mut request in requests {
            self.hasher.compute_hash(&mut request);
            if self.duplicate_remover.is_duplicate(&request).await? {
                continue;
            }

            let json = serde_json::to_string(&request)?;
            let mut conn = self.conn.lock().await;
            redis::cmd("LPUSH")
                .arg(&queue_key)
                .arg(&json)
                .query_async::<_, ()>(&mut *conn)
                .await?;
            accepted += 1;
        }

        debug!("Pushed {} requests to {}", accepted, queue_key);
        Ok(accepted)
    }

    async fn dequeue(&self, count: usize) -> Result<Vec<Request>> {
        let queue_key = self.key("queue")?;
        // LPUSH puts the newest entry at the head
        let pop = match self.traversal {
            Traversal::Breadth => "RPOP",
            Traversal::Depth => "LPOP",
        };

        // The connection lock serializes dequeues across tasks of this process
        let mut conn = self.conn.lock().await;
        let mut requests = Vec::with_capacity(count);

        for _ in 0..count {
            let json: Option<String> = redis::cmd(pop).arg(&queue_key).query_async(&mut *conn).await?;
            let Some(json) = json else {
                break;
            };

            match serde_json::from_str::<Request>(&json) {
                Ok(request) => requests.push(request),
                Err(e) => warn!("Dropping undecodable request from {}: {}", queue_key, e),
            }
        }

        Ok(requests)
    }

    async fn total(&self) -> Result<u64> {
        self.duplicate_remover.total().await
    }

    async fn reset_duplicate_check(&self) -> Result<()> {
        self.duplicate_remover.reset_duplicate_check().await
    }

    async fn success(&self, request: &Request) -> Result<()> {
        self.mark("completed", request).await
    }

    async fn fail(&self, request: &Request) -> Result<()> {
        self.mark("failed", request).await
    }

    async fn close(&self) -> Result<()> {
        self.duplicate_remover.close().await
    }
}
