//! Crawl and agent counters carried as bus messages

pub mod store;

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{handler, topics, Message, MessageBus, MessageBusExt};
use crate::error::Result;

pub use self::store::{AgentStatistics, InMemoryStatisticsStore, SpiderStatistics, StatisticsStore};

/// Write-only statistics channel. Publishing failures are logged and swallowed.
#[derive(Clone)]
pub struct StatisticsClient {
    bus: Arc<dyn MessageBus>,
}

impl StatisticsClient {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self { bus }
    }

    async fn send(&self, message: Message) {
        if let Err(e) = self.bus.publish_message(topics::STATISTICS, &message).await {
            warn!("Failed to publish {} statistics: {}", message.kind(), e);
        }
    }

    pub async fn start(&self, spider_id: &str, spider_name: &str) {
        self.send(Message::StatisticsStart {
            spider_id: spider_id.to_string(),
            spider_name: spider_name.to_string(),
        })
        .await
    }

    pub async fn exit(&self, spider_id: &str) {
        self.send(Message::StatisticsExit {
            spider_id: spider_id.to_string(),
        })
        .await
    }

    pub async fn increase_total(&self, spider_id: &str, count: u64) {
        self.send(Message::StatisticsTotal {
            spider_id: spider_id.to_string(),
            count,
        })
        .await
    }

    pub async fn increase_success(&self, spider_id: &str) {
        self.send(Message::StatisticsSuccess {
            spider_id: spider_id.to_string(),
        })
        .await
    }

    pub async fn increase_failure(&self, spider_id: &str) {
        self.send(Message::StatisticsFailure {
            spider_id: spider_id.to_string(),
        })
        .await
    }

    pub async fn register_agent(&self, agent_id: &str, agent_name: &str) {
        self.send(Message::StatisticsRegisterAgent {
            agent_id: agent_id.to_string(),
            agent_name: agent_name.to_string(),
        })
        .await
    }

    pub async fn increase_agent_success(&self, agent_id: &str, elapsed_ms: u64) {
        self.send(Message::StatisticsAgentSuccess {
            agent_id: agent_id.to_string(),
            elapsed_ms,
        })
        .await
    }

    pub async fn increase_agent_failure(&self, agent_id: &str, elapsed_ms: u64) {
        self.send(Message::StatisticsAgentFailure {
            agent_id: agent_id.to_string(),
            elapsed_ms,
        })
        .await
    }

    /// Ask the statistics service to log a progress line
    pub async fn print(&self, spider_id: &str) {
        self.send(Message::StatisticsPrint {
            spider_id: spider_id.to_string(),
        })
        .await
    }
}

/// Consumes the statistics topic into a store
pub struct StatisticsService {
    bus: Arc<dyn MessageBus>,
    store: Arc<dyn StatisticsStore>,
}

impl StatisticsService {
    pub fn new(bus: Arc<dyn MessageBus>, store: Arc<dyn StatisticsStore>) -> Self {
        Self { bus, store }
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        let store = self.store.clone();
        let handle = self
            .bus
            .consume(
                topics::STATISTICS,
                handler(move |bytes| {
                    let store = store.clone();
                    async move {
                        match Message::from_bytes(&bytes) {
                            Ok(message) => {
                                if let Err(e) = apply(store.as_ref(), message).await {
                                    warn!("Failed to update statistics: {}", e);
                                }
                            }
                            Err(e) => warn!("Dropping malformed statistics message: {}", e),
                        }
                    }
                }),
                cancel,
            )
            .await?;

        info!("Statistics service started");
        Ok(handle)
    }
}

/// Apply one statistics message to the store
pub async fn apply(store: &dyn StatisticsStore, message: Message) -> Result<()> {
    match message {
        Message::StatisticsStart { spider_id, spider_name } => store.start(&spider_id, &spider_name).await,
        Message::StatisticsExit { spider_id } => store.exit(&spider_id).await,
        Message::StatisticsTotal { spider_id, count } => store.increase_total(&spider_id, count).await,
        Message::StatisticsSuccess { spider_id } => store.increase_success(&spider_id).await,
        Message::StatisticsFailure { spider_id } => store.increase_failure(&spider_id).await,
        Message::StatisticsRegisterAgent { agent_id, agent_name } => {
            store.register_agent(&agent_id, &agent_name).await
        }
        Message::StatisticsAgentSuccess { agent_id, elapsed_ms } => {
            store.increase_agent_success(&agent_id, elapsed_ms).await
        }
        Message::StatisticsAgentFailure { agent_id, elapsed_ms } => {
            store.increase_agent_failure(&agent_id, elapsed_ms).await
        }
        Message::StatisticsPrint { spider_id } => {
            match store.spider_statistics(&spider_id).await? {
                Some(statistics) => {
                    let left = statistics
                        .left()
                        .map(|left| left.to_string())
                        .unwrap_or_else(|| "unknown".to_string());
                    info!(
                        "{} total {}, speed: {:.2}, success {}, failure {}, left {}",
                        spider_id,
                        statistics.total,
                        statistics.speed(Utc::now()),
                        statistics.success,
                        statistics.failure,
                        left
                    );
                }
                None => debug!("No statistics for {} yet", spider_id),
            }
            Ok(())
        }
        other => {
            warn!("Not supported statistics message: {}", other.kind());
            Ok(())
        }
    }
}
