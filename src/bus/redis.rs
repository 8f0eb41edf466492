use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Client;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{MessageBus, MessageHandler};
use crate::error::Result;

/// Seconds a consumer blocks on an empty topic before checking for cancellation
const POLL_TIMEOUT_SECS: u64 = 1;

/// Bus backed by redis lists, one list per topic.
///
/// Publishing is `LPUSH`, consuming is a `BRPOP` loop, so every message is
/// delivered to exactly one of the consumers of its topic, across processes.
pub struct RedisBus {
    client: Client,
    conn: Arc<Mutex<MultiplexedConnection>>,
    /// Seconds an idle topic list lives
    message_ttl: u64,
}

impl RedisBus {
    pub async fn connect(redis_url: &str, message_ttl: u64) -> Result<Self> {
        let client = Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        debug!("Connected message bus to {}", redis_url);

        Ok(Self {
            client,
            conn: Arc::new(Mutex::new(conn)),
            message_ttl,
        })
    }

    fn key(topic: &str) -> String {
        format!("spider:bus:{}", topic)
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn publish(&self, topic: &str, bytes: Vec<u8>) -> Result<()> {
        let key = Self::key(topic);
        let mut conn = self.conn.lock().await;

        redis::cmd("LPUSH")
            .arg(&key)
            .arg(bytes)
            .query_async::<_, ()>(&mut *conn)
            .await?;

        redis::cmd("EXPIRE")
            .arg(&key)
            .arg(self.message_ttl)
            .query_async::<_, ()>(&mut *conn)
            .await?;

        Ok(())
    }

    async fn consume(
        &self,
        topic: &str,
        handler: MessageHandler,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        // BRPOP blocks its connection, so each consumer gets its own
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = Self::key(topic);
        debug!("Consuming topic {}", topic);

        Ok(tokio::spawn(async move {
            while !cancel.is_cancelled() {
                let popped: redis::RedisResult<Option<(String, Vec<u8>)>> = redis::cmd("BRPOP")
                    .arg(&key)
                    .arg(POLL_TIMEOUT_SECS)
                    .query_async(&mut conn)
                    .await;

                match popped {
                    Ok(Some((_, bytes))) => handler(bytes).await,
                    Ok(None) => {}
                    Err(e) => {
                        warn!("Failed to pop from {}: {}", key, e);
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(Duration::from_secs(POLL_TIMEOUT_SECS)) => {}
                        }
                    }
                }
            }
            debug!("Stopped consuming {}", key);
        }))
    }

    async fn close_topic(&self, topic: &str) -> Result<()> {
        let key = Self::key(topic);
        let mut conn = self.conn.lock().await;
        redis::cmd("DEL").arg(&key).query_async::<_, ()>(&mut *conn).await?;
        Ok(())
    }

    fn is_distributed(&self) -> bool {
        true
    }
}
