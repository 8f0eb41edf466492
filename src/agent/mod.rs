//! Download agents: consume requests from the bus, fetch them and publish
//! the responses back to the owning crawl

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{handler, topics, Message, MessageBus, MessageBusExt};
use crate::downloader::Downloader;
use crate::error::Result;
use crate::statistics::StatisticsClient;
use crate::utils::machine;

/// Identity and timers of one agent
#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub agent_id: String,
    pub agent_name: String,
    pub heartbeat_interval: Duration,
}

impl Default for AgentOptions {
    fn default() -> Self {
        let agent_id = Uuid::new_v4().to_string();
        Self {
            agent_name: agent_id.clone(),
            agent_id,
            heartbeat_interval: Duration::from_secs(5),
        }
    }
}

impl AgentOptions {
    /// Read `AGENT_ID` and `AGENT_NAME`, falling back to a random id
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    /// Let `AGENT_ID` and `AGENT_NAME` override the identity
    pub fn with_env(mut self) -> Self {
        if let Some(id) = non_empty_env("AGENT_ID") {
            if self.agent_name == self.agent_id {
                self.agent_name = id.clone();
            }
            self.agent_id = id;
        }
        if let Some(name) = non_empty_env("AGENT_NAME") {
            self.agent_name = name;
        }
        self
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

/// Runs one downloader behind the bus
pub struct AgentService {
    bus: Arc<dyn MessageBus>,
    downloader: Arc<dyn Downloader>,
    statistics: StatisticsClient,
    options: AgentOptions,
}

impl AgentService {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        downloader: Arc<dyn Downloader>,
        statistics: StatisticsClient,
        options: AgentOptions,
    ) -> Self {
        Self {
            bus,
            downloader,
            statistics,
            options,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.options.agent_id
    }

    /// Start consuming. The returned handle completes once every consumer
    /// and the heartbeat have stopped.
    pub async fn run(&self, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        let agent_id = self.options.agent_id.clone();
        let agent_name = self.options.agent_name.clone();
        let distributed = self.bus.is_distributed();

        self.statistics.register_agent(&agent_id, &agent_name).await;

        if distributed {
            self.bus
                .publish_message(
                    topics::AGENT_CENTER,
                    &Message::AgentRegister {
                        agent_id: agent_id.clone(),
                        agent_name: agent_name.clone(),
                        processor_count: machine::processor_count(),
                        memory: machine::total_memory_mb(),
                    },
                )
                .await?;
        }

        let mut tasks = Vec::new();

        // Requests shared by all agents of this downloader type
        let topic = topics::downloader(self.downloader.name());
        tasks.push(self.consume(&topic, cancel.clone()).await?);

        if distributed {
            // Chained requests addressed to this agent only
            tasks.push(self.consume(&topics::agent(&agent_id), cancel.clone()).await?);
            tasks.push(self.spawn_heartbeat(cancel.clone()));
        }

        info!("Agent {} ({}) started on {}", agent_id, self.downloader.name(), topic);

        Ok(tokio::spawn(async move {
            for task in tasks {
                if let Err(e) = task.await {
                    error!("Agent task failed: {}", e);
                }
            }
            info!("Agent {} stopped", agent_id);
        }))
    }

    async fn consume(&self, topic: &str, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        let bus = self.bus.clone();
        let downloader = self.downloader.clone();
        let agent_id = self.options.agent_id.clone();
        let stop = cancel.clone();

        self.bus
            .consume(
                topic,
                handler(move |bytes| {
                    let bus = bus.clone();
                    let downloader = downloader.clone();
                    let agent_id = agent_id.clone();
                    let stop = stop.clone();
                    async move {
                        let message = match Message::from_bytes(&bytes) {
                            Ok(message) => message,
                            Err(e) => {
                                warn!("Deserializing message failed: {}", e);
                                return;
                            }
                        };

                        match message {
                            Message::AgentExit { agent_id: target } => {
                                if target == agent_id {
                                    info!("Agent {} received exit", agent_id);
                                    stop.cancel();
                                }
                            }
                            Message::Request(request) => {
                                // Downloads run concurrently, the consumer keeps reading
                                tokio::spawn(download(bus, downloader, agent_id, *request));
                            }
                            other => warn!("Message not supported: {}", other.kind()),
                        }
                    }
                }),
                cancel,
            )
            .await
    }

    fn spawn_heartbeat(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let bus = self.bus.clone();
        let agent_id = self.options.agent_id.clone();
        let agent_name = self.options.agent_name.clone();
        let period = self.options.heartbeat_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let heartbeat = Message::AgentHeartbeat {
                            agent_id: agent_id.clone(),
                            agent_name: agent_name.clone(),
                            available_memory: machine::available_memory_mb(),
                            cpu_load: machine::cpu_load(),
                        };
                        if let Err(e) = bus.publish_message(topics::AGENT_CENTER, &heartbeat).await {
                            warn!("Failed to send heartbeat: {}", e);
                        }
                    }
                }
            }
        })
    }
}

async fn download(
    bus: Arc<dyn MessageBus>,
    downloader: Arc<dyn Downloader>,
    agent_id: String,
    request: crate::crawler::Request,
) {
    let mut response = downloader.download(&request).await;
    response.agent = agent_id;
    response.request_hash = request.hash().to_string();

    debug!("Downloaded {} with status {}", request.url, response.status_code);

    let topic = topics::spider(request.owner());
    if let Err(e) = bus.publish_message(&topic, &Message::Response(Box::new(response))).await {
        error!("Failed to publish response of {}: {}", request.url, e);
    }
}
