use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use redis::aio::MultiplexedConnection;
use tracing::debug;

use crate::crawler::Request;
use crate::error::{Result, SpiderError};

/// Per-crawl set of seen request hashes
#[async_trait]
pub trait DuplicateRemover: Send + Sync {
    /// Bind this remover to a crawl
    async fn initialize(&self, spider_id: &str) -> Result<()>;

    /// Mark the request as seen; true when it had been seen before
    async fn is_duplicate(&self, request: &Request) -> Result<bool>;

    /// Number of distinct hashes marked seen
    async fn total(&self) -> Result<u64>;

    /// Forget every seen hash
    async fn reset_duplicate_check(&self) -> Result<()>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

fn check_owner(bound: Option<&str>, request: &Request) -> Result<()> {
    match bound {
        None => Err(SpiderError::Usage(
            "duplicate remover used before initialization".to_string(),
        )),
        Some(spider_id) if spider_id != request.owner() => Err(SpiderError::Usage(format!(
            "request owner {} does not match crawl {}",
            request.owner(),
            spider_id
        ))),
        Some(_) => Ok(()),
    }
}

/// Binds a remover to its crawl, once
fn bind(slot: &RwLock<Option<String>>, spider_id: &str) -> Result<()> {
    if spider_id.trim().is_empty() {
        return Err(SpiderError::Usage("spider id must not be empty".to_string()));
    }

    let mut bound = slot.write();
    if let Some(existing) = bound.as_deref() {
        return Err(SpiderError::Usage(format!(
            "duplicate remover already initialized for crawl {}",
            existing
        )));
    }
    *bound = Some(spider_id.to_string());
    Ok(())
}

/// Accepts everything, counting each check
#[derive(Default)]
pub struct NoopDuplicateRemover {
    total: AtomicU64,
}

#[async_trait]
impl DuplicateRemover for NoopDuplicateRemover {
    async fn initialize(&self, _spider_id: &str) -> Result<()> {
        Ok(())
    }

    async fn is_duplicate(&self, _request: &Request) -> Result<bool> {
        self.total.fetch_add(1, Ordering::SeqCst);
        Ok(false)
    }

    async fn total(&self) -> Result<u64> {
        Ok(self.total.load(Ordering::SeqCst))
    }

    async fn reset_duplicate_check(&self) -> Result<()> {
        self.total.store(0, Ordering::SeqCst);
        Ok(())
    }
}

/// Process-local seen set
#[derive(Default)]
pub struct HashSetDuplicateRemover {
    spider_id: RwLock<Option<String>>,
    seen: Mutex<HashSet<String>>,
}

impl HashSetDuplicateRemover {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DuplicateRemover for HashSetDuplicateRemover {
    async fn initialize(&self, spider_id: &str) -> Result<()> {
        bind(&self.spider_id, spider_id)
    }

    async fn is_duplicate(&self, request: &Request) -> Result<bool> {
        check_owner(self.spider_id.read().as_deref(), request)?;
        Ok(!self.seen.lock().insert(request.hash().to_string()))
    }

    async fn total(&self) -> Result<u64> {
        Ok(self.seen.lock().len() as u64)
    }

    async fn reset_duplicate_check(&self) -> Result<()> {
        self.seen.lock().clear();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.seen.lock().clear();
        Ok(())
    }
}

/// Seen set shared across processes through a redis set
pub struct RedisDuplicateRemover {
    conn: Arc<tokio::sync::Mutex<MultiplexedConnection>>,
    spider_id: RwLock<Option<String>>,
}

impl RedisDuplicateRemover {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self {
            conn: Arc::new(tokio::sync::Mutex::new(conn)),
            spider_id: RwLock::new(None),
        }
    }

    fn key(&self) -> Result<String> {
        self.spider_id
            .read()
            .as_ref()
            .map(|id| format!("spider:duplicate:{}", id))
            .ok_or_else(|| SpiderError::Usage("duplicate remover used before initialization".to_string()))
    }
}

#[async_trait]
impl DuplicateRemover for RedisDuplicateRemover {
    async fn initialize(&self, spider_id: &str) -> Result<()> {
        bind(&self.spider_id, spider_id)
    }

    async fn is_duplicate(&self, request: &Request) -> Result<bool> {
        check_owner(self.spider_id.read().as_deref(), request)?;
        let key = self.key()?;

        let mut conn = self.conn.lock().await;
        // SADD is atomic: only one caller can add a given member
        let added: i64 = redis::cmd("SADD")
            .arg(&key)
            .arg(request.hash())
            .query_async(&mut *conn)
            .await?;

        Ok(added == 0)
    }

    async fn total(&self) -> Result<u64> {
        let key = self.key()?;
        let mut conn = self.conn.lock().await;
        let count: u64 = redis::cmd("SCARD").arg(&key).query_async(&mut *conn).await?;
        Ok(count)
    }

    async fn reset_duplicate_check(&self) -> Result<()> {
        let key = self.key()?;
        let mut conn = self.conn.lock().await;
        redis::cmd("DEL").arg(&key).query_async::<_, ()>(&mut *conn).await?;
        debug!("Cleared duplicate set {}", key);
        Ok(())
    }
}
