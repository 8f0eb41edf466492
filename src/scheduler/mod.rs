//! Ordered, deduplicated work queues of requests

pub mod duplicate;
pub mod redis;

use std::cmp::Reverse;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::crawler::hasher::{RequestHasher, Sha256RequestHasher};
use crate::crawler::Request;
use crate::error::{Result, SpiderError};

pub use self::duplicate::{DuplicateRemover, HashSetDuplicateRemover, NoopDuplicateRemover, RedisDuplicateRemover};
pub use self::redis::RedisScheduler;

/// Work queue of requests pending dispatch
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Bind the scheduler and its duplicate remover to a crawl
    async fn initialize(&self, spider_id: &str) -> Result<()>;

    /// Hash and queue the requests that have not been seen yet.
    /// Returns the number accepted.
    async fn enqueue(&self, requests: Vec<Request>) -> Result<usize>;

    /// Remove up to `count` pending requests in scheduling order
    async fn dequeue(&self, count: usize) -> Result<Vec<Request>>;

    /// Number of distinct requests ever accepted
    async fn total(&self) -> Result<u64>;

    async fn reset_duplicate_check(&self) -> Result<()>;

    /// Mark a request as done
    async fn success(&self, _request: &Request) -> Result<()> {
        Ok(())
    }

    /// Mark a request as failed
    async fn fail(&self, _request: &Request) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()>;
}

/// Which scheduler a crawl uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    Bfs,
    #[default]
    DistinctBfs,
    Dfs,
    DistinctDfs,
    /// Redis-backed queue and seen set, breadth first
    RedisBfs,
    /// Redis-backed queue and seen set, depth first
    RedisDfs,
}

impl SchedulerKind {
    pub fn is_distributed(self) -> bool {
        matches!(self, SchedulerKind::RedisBfs | SchedulerKind::RedisDfs)
    }
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchedulerKind::Bfs => "bfs",
            SchedulerKind::DistinctBfs => "distinct_bfs",
            SchedulerKind::Dfs => "dfs",
            SchedulerKind::DistinctDfs => "distinct_dfs",
            SchedulerKind::RedisBfs => "redis_bfs",
            SchedulerKind::RedisDfs => "redis_dfs",
        };
        f.write_str(name)
    }
}

/// Traversal order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Traversal {
    /// FIFO, or deepest first while draining in-progress branches
    Breadth,
    /// LIFO
    Depth,
}

/// Create the scheduler for `kind`.
///
/// `drain_in_progress` is shared with the runtime options so the ordering can be
/// switched while a crawl runs. Redis kinds need `redis_url`.
pub async fn create_scheduler(
    kind: SchedulerKind,
    drain_in_progress: Arc<AtomicBool>,
    redis_url: Option<&str>,
) -> Result<Arc<dyn Scheduler>> {
    let scheduler: Arc<dyn Scheduler> = match kind {
        SchedulerKind::Bfs => Arc::new(QueueScheduler::bfs(drain_in_progress)),
        SchedulerKind::DistinctBfs => Arc::new(QueueScheduler::distinct_bfs(drain_in_progress)),
        SchedulerKind::Dfs => Arc::new(QueueScheduler::dfs()),
        SchedulerKind::DistinctDfs => Arc::new(QueueScheduler::distinct_dfs()),
        SchedulerKind::RedisBfs | SchedulerKind::RedisDfs => {
            let url = redis_url.ok_or_else(|| {
                SpiderError::Config(format!("scheduler {} requires a redis url", kind))
            })?;
            let traversal = if kind == SchedulerKind::RedisBfs {
                Traversal::Breadth
            } else {
                Traversal::Depth
            };
            Arc::new(RedisScheduler::connect(url, traversal).await?)
        }
    };

    debug!("Created {} scheduler", kind);
    Ok(scheduler)
}

/// In-memory queue scheduler
pub struct QueueScheduler {
    traversal: Traversal,
    drain_in_progress: Arc<AtomicBool>,
    hasher: Box<dyn RequestHasher>,
    duplicate_remover: Box<dyn DuplicateRemover>,
    requests: Mutex<VecDeque<Request>>,
}

impl QueueScheduler {
    pub fn new(
        traversal: Traversal,
        duplicate_remover: Box<dyn DuplicateRemover>,
        drain_in_progress: Arc<AtomicBool>,
    ) -> Self {
        Self {
            traversal,
            drain_in_progress,
            hasher: Box::new(Sha256RequestHasher),
            duplicate_remover,
            requests: Mutex::new(VecDeque::new()),
        }
    }

    /// Breadth first without deduplication
    pub fn bfs(drain_in_progress: Arc<AtomicBool>) -> Self {
        Self::new(Traversal::Breadth, Box::<NoopDuplicateRemover>::default(), drain_in_progress)
    }

    /// Breadth first, each request hash accepted once
    pub fn distinct_bfs(drain_in_progress: Arc<AtomicBool>) -> Self {
        Self::new(Traversal::Breadth, Box::new(HashSetDuplicateRemover::new()), drain_in_progress)
    }

    /// Depth first without deduplication
    pub fn dfs() -> Self {
        Self::new(
            Traversal::Depth,
            Box::<NoopDuplicateRemover>::default(),
            Arc::new(AtomicBool::new(false)),
        )
    }

    /// Depth first, each request hash accepted once
    pub fn distinct_dfs() -> Self {
        Self::new(
            Traversal::Depth,
            Box::new(HashSetDuplicateRemover::new()),
            Arc::new(AtomicBool::new(false)),
        )
    }

    pub fn pending(&self) -> usize {
        self.requests.lock().len()
    }

    fn pop_deepest(requests: &mut VecDeque<Request>, count: usize) -> Vec<Request> {
        let mut order: Vec<usize> = (0..requests.len()).collect();
        order.sort_by_key(|&index| Reverse(requests[index].depth()));
        order.truncate(count);

        let picked: Vec<Request> = order.iter().map(|&index| requests[index].clone()).collect();

        order.sort_unstable_by(|a, b| b.cmp(a));
        for index in order {
            requests.remove(index);
        }
        picked
    }
}

#[async_trait]
impl Scheduler for QueueScheduler {
    async fn initialize(&self, spider_id: &str) -> Result<()> {
        self.duplicate_remover.initialize(spider_id).await
    }

    async fn enqueue(&self, requests: Vec<Request>) -> Result<usize> {
        let mut accepted = 0;
        for mut request in requests {
            self.hasher.compute_hash(&mut request);
            if self.duplicate_remover.is_duplicate(&request).await? {
                continue;
            }
            self.requests.lock().push_back(request);
            accepted += 1;
        }
        Ok(accepted)
    }

    async fn dequeue(&self, count: usize) -> Result<Vec<Request>> {
        let mut requests = self.requests.lock();
        let count = count.min(requests.len());

        let batch = match self.traversal {
            Traversal::Breadth if self.drain_in_progress.load(Ordering::Relaxed) => {
                Self::pop_deepest(&mut requests, count)
            }
            Traversal::Breadth => requests.drain(..count).collect(),
            Traversal::Depth => (0..count).filter_map(|_| requests.pop_back()).collect(),
        };
        Ok(batch)
    }

    async fn total(&self) -> Result<u64> {
        self.duplicate_remover.total().await
    }

    async fn reset_duplicate_check(&self) -> Result<()> {
        self.duplicate_remover.reset_duplicate_check().await
    }

    async fn close(&self) -> Result<()> {
        self.requests.lock().clear();
        self.duplicate_remover.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    const CRAWL: &str = "crawl";

    fn seed(url: &str) -> Request {
        let mut request = Request::new(url).unwrap();
        request.set_owner(CRAWL);
        request
    }

    fn at_depth(url: &str, depth: u32) -> Request {
        let mut request = seed("http://example.test/");
        for _ in 0..depth {
            request = request.follow(Url::parse(url).unwrap());
        }
        request
    }

    fn urls(requests: &[Request]) -> Vec<String> {
        requests.iter().map(|r| r.url.path().to_string()).collect()
    }

    #[tokio::test]
    async fn test_distinct_accepts_once() {
        let scheduler = QueueScheduler::distinct_bfs(Arc::new(AtomicBool::new(false)));
        scheduler.initialize(CRAWL).await.unwrap();

        let batch: Vec<Request> = (0..5).map(|_| seed("http://example.test/same")).collect();
        assert_eq!(scheduler.enqueue(batch).await.unwrap(), 1);
        assert_eq!(scheduler.total().await.unwrap(), 1);
        assert_eq!(scheduler.pending(), 1);
    }

    #[tokio::test]
    async fn test_non_distinct_accepts_all() {
        let scheduler = QueueScheduler::bfs(Arc::new(AtomicBool::new(false)));
        scheduler.initialize(CRAWL).await.unwrap();

        let batch: Vec<Request> = (0..5).map(|_| seed("http://example.test/same")).collect();
        assert_eq!(scheduler.enqueue(batch).await.unwrap(), 5);
        assert_eq!(scheduler.total().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_retry_escapes_dedup() {
        let scheduler = QueueScheduler::distinct_bfs(Arc::new(AtomicBool::new(false)));
        scheduler.initialize(CRAWL).await.unwrap();

        assert_eq!(scheduler.enqueue(vec![seed("http://example.test/x")]).await.unwrap(), 1);
        let mut dispatched = scheduler.dequeue(1).await.unwrap().remove(0);

        dispatched.increase_requested_times();
        assert_eq!(scheduler.enqueue(vec![dispatched]).await.unwrap(), 1);
        assert_eq!(scheduler.total().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_bfs_fifo() {
        let scheduler = QueueScheduler::distinct_bfs(Arc::new(AtomicBool::new(false)));
        scheduler.initialize(CRAWL).await.unwrap();
        scheduler
            .enqueue(vec![
                seed("http://example.test/a"),
                seed("http://example.test/b"),
                seed("http://example.test/c"),
            ])
            .await
            .unwrap();

        assert_eq!(urls(&scheduler.dequeue(2).await.unwrap()), vec!["/a", "/b"]);
        assert_eq!(urls(&scheduler.dequeue(2).await.unwrap()), vec!["/c"]);
        assert!(scheduler.dequeue(2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bfs_drain_in_progress_deepest_first() {
        let drain = Arc::new(AtomicBool::new(true));
        let scheduler = QueueScheduler::distinct_bfs(drain.clone());
        scheduler.initialize(CRAWL).await.unwrap();
        scheduler
            .enqueue(vec![
                at_depth("http://example.test/two", 2),
                at_depth("http://example.test/one", 1),
                at_depth("http://example.test/three", 3),
            ])
            .await
            .unwrap();

        let depths: Vec<u32> = scheduler.dequeue(3).await.unwrap().iter().map(|r| r.depth()).collect();
        assert_eq!(depths, vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn test_drain_toggle_keeps_remaining_order() {
        let drain = Arc::new(AtomicBool::new(true));
        let scheduler = QueueScheduler::distinct_bfs(drain.clone());
        scheduler.initialize(CRAWL).await.unwrap();
        scheduler
            .enqueue(vec![
                at_depth("http://example.test/a", 1),
                at_depth("http://example.test/deep", 3),
                at_depth("http://example.test/b", 1),
            ])
            .await
            .unwrap();

        assert_eq!(urls(&scheduler.dequeue(1).await.unwrap()), vec!["/deep"]);

        drain.store(false, Ordering::Relaxed);
        assert_eq!(urls(&scheduler.dequeue(2).await.unwrap()), vec!["/a", "/b"]);
    }

    #[tokio::test]
    async fn test_dfs_stack_order() {
        let scheduler = QueueScheduler::distinct_dfs();
        scheduler.initialize(CRAWL).await.unwrap();
        scheduler
            .enqueue(vec![
                seed("http://example.test/a"),
                seed("http://example.test/b"),
                seed("http://example.test/c"),
            ])
            .await
            .unwrap();

        assert_eq!(urls(&scheduler.dequeue(2).await.unwrap()), vec!["/c", "/b"]);
        assert_eq!(urls(&scheduler.dequeue(5).await.unwrap()), vec!["/a"]);
    }

    #[tokio::test]
    async fn test_concurrent_dequeue_never_overlaps() {
        let scheduler = Arc::new(QueueScheduler::bfs(Arc::new(AtomicBool::new(false))));
        scheduler.initialize(CRAWL).await.unwrap();
        let batch: Vec<Request> = (0..100)
            .map(|i| seed(&format!("http://example.test/{}", i)))
            .collect();
        scheduler.enqueue(batch).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let scheduler = scheduler.clone();
            handles.push(tokio::spawn(async move { scheduler.dequeue(7).await.unwrap() }));
        }

        let mut seen = std::collections::HashSet::new();
        for handle in handles {
            for request in handle.await.unwrap() {
                assert!(seen.insert(request.url.to_string()));
            }
        }
        assert_eq!(seen.len(), 70);
    }

    #[tokio::test]
    async fn test_redis_kind_requires_url() {
        let result = create_scheduler(SchedulerKind::RedisBfs, Arc::new(AtomicBool::new(false)), None).await;
        assert!(matches!(result, Err(SpiderError::Config(_))));
    }
}
