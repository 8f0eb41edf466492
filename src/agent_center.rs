//! Registry of agents and their heartbeats

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::{handler, topics, Message, MessageBus};
use crate::error::Result;

/// A registered agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: String,
    pub name: String,
    pub processor_count: usize,
    /// Total memory in MB
    pub memory: u64,
    pub creation_time: DateTime<Utc>,
    pub last_modification_time: DateTime<Utc>,
}

impl AgentInfo {
    pub fn new(id: &str, name: &str, processor_count: usize, memory: u64) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            name: name.to_string(),
            processor_count,
            memory,
            creation_time: now,
            last_modification_time: now,
        }
    }
}

/// A heartbeat received from an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentHeartbeat {
    pub agent_id: String,
    pub agent_name: String,
    /// Available memory in MB
    pub available_memory: u64,
    pub cpu_load: u32,
    pub creation_time: DateTime<Utc>,
}

/// Persistence for agent registrations and heartbeats
#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn register(&self, agent: AgentInfo) -> Result<()>;
    async fn heartbeat(&self, heartbeat: AgentHeartbeat) -> Result<()>;
    async fn agents(&self) -> Result<Vec<AgentInfo>>;
    async fn heartbeats(&self, agent_id: &str) -> Result<Vec<AgentHeartbeat>>;
}

#[derive(Debug, Default)]
struct Registry {
    agents: HashMap<String, AgentInfo>,
    heartbeats: HashMap<String, Vec<AgentHeartbeat>>,
}

/// Agent store in process memory, keeping the latest heartbeats per agent
#[derive(Debug, Clone, Default)]
pub struct InMemoryAgentStore {
    registry: Arc<Mutex<Registry>>,
}

/// Heartbeats kept per agent
const HEARTBEAT_HISTORY: usize = 100;

impl InMemoryAgentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AgentStore for InMemoryAgentStore {
    async fn register(&self, agent: AgentInfo) -> Result<()> {
        let mut registry = self.registry.lock().await;
        registry.agents.insert(agent.id.clone(), agent);
        Ok(())
    }

    async fn heartbeat(&self, heartbeat: AgentHeartbeat) -> Result<()> {
        let mut registry = self.registry.lock().await;
        if let Some(agent) = registry.agents.get_mut(&heartbeat.agent_id) {
            agent.last_modification_time = heartbeat.creation_time;
        }

        let history = registry.heartbeats.entry(heartbeat.agent_id.clone()).or_default();
        history.push(heartbeat);
        if history.len() > HEARTBEAT_HISTORY {
            history.remove(0);
        }
        Ok(())
    }

    async fn agents(&self) -> Result<Vec<AgentInfo>> {
        let registry = self.registry.lock().await;
        let mut agents: Vec<AgentInfo> = registry.agents.values().cloned().collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(agents)
    }

    async fn heartbeats(&self, agent_id: &str) -> Result<Vec<AgentHeartbeat>> {
        let registry = self.registry.lock().await;
        Ok(registry.heartbeats.get(agent_id).cloned().unwrap_or_default())
    }
}

/// Consumes registrations and heartbeats from the agent-center topic
pub struct AgentCenterService {
    bus: Arc<dyn MessageBus>,
    store: Arc<dyn AgentStore>,
}

impl AgentCenterService {
    pub fn new(bus: Arc<dyn MessageBus>, store: Arc<dyn AgentStore>) -> Self {
        Self { bus, store }
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        let store = self.store.clone();
        let distributed = self.bus.is_distributed();

        let handle = self
            .bus
            .consume(
                topics::AGENT_CENTER,
                handler(move |bytes| {
                    let store = store.clone();
                    async move {
                        let message = match Message::from_bytes(&bytes) {
                            Ok(message) => message,
                            Err(e) => {
                                warn!("Deserializing message failed: {}", e);
                                return;
                            }
                        };
                        if let Err(e) = apply(store.as_ref(), message, distributed).await {
                            warn!("Failed to update agent store: {}", e);
                        }
                    }
                }),
                cancel,
            )
            .await?;

        info!("Agent center service started");
        Ok(handle)
    }
}

async fn apply(store: &dyn AgentStore, message: Message, distributed: bool) -> Result<()> {
    match message {
        Message::AgentRegister {
            agent_id,
            agent_name,
            processor_count,
            memory,
        } => {
            if distributed {
                info!("Registering agent: {}, {}", agent_id, agent_name);
            }
            store
                .register(AgentInfo::new(&agent_id, &agent_name, processor_count, memory))
                .await
        }
        Message::AgentHeartbeat {
            agent_id,
            agent_name,
            available_memory,
            cpu_load,
        } => {
            if distributed {
                info!("Received heartbeat: {}, {}", agent_id, agent_name);
            }
            store
                .heartbeat(AgentHeartbeat {
                    agent_id,
                    agent_name,
                    available_memory,
                    cpu_load,
                    creation_time: Utc::now(),
                })
                .await
        }
        other => {
            warn!("Message not supported: {}", other.kind());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{InMemoryBus, MessageBusExt};
    use std::time::Duration;

    #[tokio::test]
    async fn test_register_and_heartbeat() {
        let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new());
        let store = Arc::new(InMemoryAgentStore::new());
        let cancel = CancellationToken::new();
        let handle = AgentCenterService::new(bus.clone(), store.clone())
            .run(cancel.clone())
            .await
            .unwrap();

        bus.publish_message(
            topics::AGENT_CENTER,
            &Message::AgentRegister {
                agent_id: "a1".to_string(),
                agent_name: "agent".to_string(),
                processor_count: 8,
                memory: 16000,
            },
        )
        .await
        .unwrap();
        bus.publish_message(
            topics::AGENT_CENTER,
            &Message::AgentHeartbeat {
                agent_id: "a1".to_string(),
                agent_name: "agent".to_string(),
                available_memory: 4000,
                cpu_load: 12,
            },
        )
        .await
        .unwrap();
        bus.publish(topics::AGENT_CENTER, b"garbage".to_vec()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while store.heartbeats("a1").await.unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let agents = store.agents().await.unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].processor_count, 8);
        assert_eq!(store.heartbeats("a1").await.unwrap()[0].cpu_load, 12);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_history_bounded() {
        let store = InMemoryAgentStore::new();
        for i in 0..(HEARTBEAT_HISTORY + 5) {
            store
                .heartbeat(AgentHeartbeat {
                    agent_id: "a1".to_string(),
                    agent_name: "agent".to_string(),
                    available_memory: i as u64,
                    cpu_load: 0,
                    creation_time: Utc::now(),
                })
                .await
                .unwrap();
        }
        let history = store.heartbeats("a1").await.unwrap();
        assert_eq!(history.len(), HEARTBEAT_HISTORY);
        assert_eq!(history[0].available_memory, 5);
    }
}
