use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::Result;

/// Counters for one crawl
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpiderStatistics {
    pub id: String,
    pub name: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub exit: Option<DateTime<Utc>>,
    pub total: u64,
    pub success: u64,
    pub failure: u64,
    pub creation_time: DateTime<Utc>,
    pub last_modification_time: DateTime<Utc>,
}

impl SpiderStatistics {
    pub fn new(id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            name: None,
            start: None,
            exit: None,
            total: 0,
            success: 0,
            failure: 0,
            creation_time: now,
            last_modification_time: now,
        }
    }

    /// Requests neither succeeded nor failed yet, if the counters are consistent
    pub fn left(&self) -> Option<u64> {
        self.total.checked_sub(self.success + self.failure)
    }

    /// Successes per second since start
    pub fn speed(&self, now: DateTime<Utc>) -> f64 {
        let start = self.start.unwrap_or_else(|| now - chrono::Duration::minutes(1));
        let seconds = (now - start).num_milliseconds() as f64 / 1000.0;
        if seconds <= 0.0 {
            return 0.0;
        }
        self.success as f64 / seconds
    }

    fn touch(&mut self) {
        self.last_modification_time = Utc::now();
    }
}

/// Counters for one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatistics {
    pub id: String,
    pub name: Option<String>,
    pub success: u64,
    pub failure: u64,
    pub elapsed_ms: u64,
    pub creation_time: DateTime<Utc>,
    pub last_modification_time: DateTime<Utc>,
}

impl AgentStatistics {
    pub fn new(id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            name: None,
            success: 0,
            failure: 0,
            elapsed_ms: 0,
            creation_time: now,
            last_modification_time: now,
        }
    }

    fn touch(&mut self) {
        self.last_modification_time = Utc::now();
    }
}

/// Persistence for statistics counters
#[async_trait]
pub trait StatisticsStore: Send + Sync {
    async fn start(&self, spider_id: &str, spider_name: &str) -> Result<()>;
    async fn exit(&self, spider_id: &str) -> Result<()>;
    async fn increase_total(&self, spider_id: &str, count: u64) -> Result<()>;
    async fn increase_success(&self, spider_id: &str) -> Result<()>;
    async fn increase_failure(&self, spider_id: &str) -> Result<()>;
    async fn register_agent(&self, agent_id: &str, agent_name: &str) -> Result<()>;
    async fn increase_agent_success(&self, agent_id: &str, elapsed_ms: u64) -> Result<()>;
    async fn increase_agent_failure(&self, agent_id: &str, elapsed_ms: u64) -> Result<()>;
    async fn spider_statistics(&self, spider_id: &str) -> Result<Option<SpiderStatistics>>;
    async fn agent_statistics(&self, agent_id: &str) -> Result<Option<AgentStatistics>>;
}

#[derive(Debug, Default)]
struct Counters {
    spiders: HashMap<String, SpiderStatistics>,
    agents: HashMap<String, AgentStatistics>,
}

impl Counters {
    fn spider(&mut self, id: &str) -> &mut SpiderStatistics {
        self.spiders
            .entry(id.to_string())
            .or_insert_with(|| SpiderStatistics::new(id))
    }

    fn agent(&mut self, id: &str) -> &mut AgentStatistics {
        self.agents
            .entry(id.to_string())
            .or_insert_with(|| AgentStatistics::new(id))
    }
}

/// Statistics kept in process memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryStatisticsStore {
    counters: Arc<Mutex<Counters>>,
}

impl InMemoryStatisticsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatisticsStore for InMemoryStatisticsStore {
    async fn start(&self, spider_id: &str, spider_name: &str) -> Result<()> {
        let mut counters = self.counters.lock().await;
        let statistics = counters.spider(spider_id);
        statistics.name = Some(spider_name.to_string());
        statistics.start = Some(Utc::now());
        statistics.touch();
        Ok(())
    }

    async fn exit(&self, spider_id: &str) -> Result<()> {
        let mut counters = self.counters.lock().await;
        let statistics = counters.spider(spider_id);
        statistics.exit = Some(Utc::now());
        statistics.touch();
        Ok(())
    }

    async fn increase_total(&self, spider_id: &str, count: u64) -> Result<()> {
        let mut counters = self.counters.lock().await;
        let statistics = counters.spider(spider_id);
        statistics.total += count;
        statistics.touch();
        Ok(())
    }

    async fn increase_success(&self, spider_id: &str) -> Result<()> {
        let mut counters = self.counters.lock().await;
        let statistics = counters.spider(spider_id);
        statistics.success += 1;
        statistics.touch();
        Ok(())
    }

    async fn increase_failure(&self, spider_id: &str) -> Result<()> {
        let mut counters = self.counters.lock().await;
        let statistics = counters.spider(spider_id);
        statistics.failure += 1;
        statistics.touch();
        Ok(())
    }

    async fn register_agent(&self, agent_id: &str, agent_name: &str) -> Result<()> {
        let mut counters = self.counters.lock().await;
        let statistics = counters.agent(agent_id);
        statistics.name = Some(agent_name.to_string());
        statistics.touch();
        Ok(())
    }

    async fn increase_agent_success(&self, agent_id: &str, elapsed_ms: u64) -> Result<()> {
        let mut counters = self.counters.lock().await;
        let statistics = counters.agent(agent_id);
        statistics.success += 1;
        statistics.elapsed_ms += elapsed_ms;
        statistics.touch();
        Ok(())
    }

    async fn increase_agent_failure(&self, agent_id: &str, elapsed_ms: u64) -> Result<()> {
        let mut counters = self.counters.lock().await;
        let statistics = counters.agent(agent_id);
        statistics.failure += 1;
        statistics.elapsed_ms += elapsed_ms;
        statistics.touch();
        Ok(())
    }

    async fn spider_statistics(&self, spider_id: &str) -> Result<Option<SpiderStatistics>> {
        Ok(self.counters.lock().await.spiders.get(spider_id).cloned())
    }

    async fn agent_statistics(&self, agent_id: &str) -> Result<Option<AgentStatistics>> {
        Ok(self.counters.lock().await.agents.get(agent_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spider_counters() {
        let store = InMemoryStatisticsStore::new();
        store.start("crawl", "example").await.unwrap();
        store.increase_total("crawl", 4).await.unwrap();
        store.increase_success("crawl").await.unwrap();
        store.increase_failure("crawl").await.unwrap();

        let statistics = store.spider_statistics("crawl").await.unwrap().unwrap();
        assert_eq!(statistics.total, 4);
        assert_eq!(statistics.success, 1);
        assert_eq!(statistics.failure, 1);
        assert_eq!(statistics.left(), Some(2));
        assert!(statistics.start.is_some());
        assert!(statistics.exit.is_none());

        store.exit("crawl").await.unwrap();
        let statistics = store.spider_statistics("crawl").await.unwrap().unwrap();
        assert!(statistics.exit.is_some());
    }

    #[tokio::test]
    async fn test_agent_counters() {
        let store = InMemoryStatisticsStore::new();
        store.register_agent("a1", "agent one").await.unwrap();
        store.increase_agent_success("a1", 120).await.unwrap();
        store.increase_agent_failure("a1", 30).await.unwrap();

        let statistics = store.agent_statistics("a1").await.unwrap().unwrap();
        assert_eq!(statistics.name.as_deref(), Some("agent one"));
        assert_eq!(statistics.success, 1);
        assert_eq!(statistics.failure, 1);
        assert_eq!(statistics.elapsed_ms, 150);
        assert!(store.agent_statistics("missing").await.unwrap().is_none());
    }

    #[test]
    fn test_left_when_inconsistent() {
        let mut statistics = SpiderStatistics::new("crawl");
        statistics.success = 3;
        assert_eq!(statistics.left(), None);
    }
}
