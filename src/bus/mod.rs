//! Topic based publish/subscribe between spiders, agents and services

pub mod memory;
pub mod message;
pub mod redis;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

pub use self::memory::InMemoryBus;
pub use self::message::Message;
pub use self::redis::RedisBus;

/// Callback invoked for every message consumed from a topic
pub type MessageHandler = Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Topic names
pub mod topics {
    /// Agent registration and heartbeats
    pub const AGENT_CENTER: &str = "spider_agent_center";

    /// Statistics events
    pub const STATISTICS: &str = "spider_statistics_center";

    /// Responses for one crawl
    pub fn spider(spider_id: &str) -> String {
        format!("spider_{}", spider_id.to_lowercase())
    }

    /// Requests addressed to one agent instance
    pub fn agent(agent_id: &str) -> String {
        format!("spider_{}", agent_id.to_lowercase())
    }

    /// Requests load-shared across every agent of a downloader type
    pub fn downloader(name: &str) -> String {
        format!("spider_downloader_{}", name.to_lowercase())
    }
}

/// Publish/subscribe capability with at-least-once delivery.
/// Consumers of the same topic share its messages.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, bytes: Vec<u8>) -> Result<()>;

    /// Start consuming `topic` until `cancel` fires
    async fn consume(
        &self,
        topic: &str,
        handler: MessageHandler,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>>;

    /// Drop a topic and anything still queued on it
    async fn close_topic(&self, topic: &str) -> Result<()>;

    fn is_distributed(&self) -> bool;
}

/// Typed publishing on top of any bus
#[async_trait]
pub trait MessageBusExt {
    async fn publish_message(&self, topic: &str, message: &Message) -> Result<()>;
}

#[async_trait]
impl<T: MessageBus + ?Sized> MessageBusExt for T {
    async fn publish_message(&self, topic: &str, message: &Message) -> Result<()> {
        let bytes = message.to_bytes()?;
        self.publish(topic, bytes).await
    }
}

/// Wrap an async closure as a message handler
pub fn handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |bytes| Box::pin(f(bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_names() {
        assert_eq!(topics::spider("ABC"), "spider_abc");
        assert_eq!(topics::downloader("HTTP_CLIENT"), "spider_downloader_http_client");
        assert_ne!(topics::downloader("x"), topics::agent("x"));
    }
}
