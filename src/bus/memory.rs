use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{MessageBus, MessageHandler};
use crate::error::{Result, SpiderError};

type SharedReceiver = Arc<tokio::sync::Mutex<UnboundedReceiver<Vec<u8>>>>;

struct Topic {
    tx: UnboundedSender<Vec<u8>>,
    rx: SharedReceiver,
}

impl Topic {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }
}

#[derive(Default)]
struct Topics {
    open: HashMap<String, Topic>,
    closed: HashSet<String>,
}

/// Bus for a single process. Messages published before anyone consumes
/// a topic stay queued until a consumer arrives.
#[derive(Default)]
pub struct InMemoryBus {
    topics: Mutex<Topics>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn receiver(&self, topic: &str) -> SharedReceiver {
        let mut topics = self.topics.lock();
        topics.closed.remove(topic);
        topics
            .open
            .entry(topic.to_string())
            .or_insert_with(Topic::new)
            .rx
            .clone()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, topic: &str, bytes: Vec<u8>) -> Result<()> {
        let mut topics = self.topics.lock();
        if topics.closed.contains(topic) {
            trace!("Dropping message for closed topic {}", topic);
            return Ok(());
        }

        topics
            .open
            .entry(topic.to_string())
            .or_insert_with(Topic::new)
            .tx
            .send(bytes)
            .map_err(|_| SpiderError::Bus(format!("topic {} has no receiver", topic)))
    }

    async fn consume(
        &self,
        topic: &str,
        handler: MessageHandler,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        let rx = self.receiver(topic);
        let topic = topic.to_string();
        debug!("Consuming topic {}", topic);

        Ok(tokio::spawn(async move {
            loop {
                // Competing consumers take turns on the shared receiver
                let bytes = {
                    let mut rx = tokio::select! {
                        _ = cancel.cancelled() => break,
                        guard = rx.lock() => guard,
                    };
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        bytes = rx.recv() => bytes,
                    }
                };

                match bytes {
                    Some(bytes) => handler(bytes).await,
                    None => break,
                }
            }
            debug!("Stopped consuming topic {}", topic);
        }))
    }

    async fn close_topic(&self, topic: &str) -> Result<()> {
        let mut topics = self.topics.lock();
        topics.open.remove(topic);
        topics.closed.insert(topic.to_string());
        Ok(())
    }

    fn is_distributed(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::handler;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_buffers_until_consumed() {
        let bus = InMemoryBus::new();
        bus.publish("t", b"one".to_vec()).await.unwrap();
        bus.publish("t", b"two".to_vec()).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let handle = bus
            .consume(
                "t",
                handler(move |bytes| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(bytes);
                    }
                }),
                cancel.clone(),
            )
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap(), b"one".to_vec());
        assert_eq!(rx.recv().await.unwrap(), b"two".to_vec());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_consumers_share_messages() {
        let bus = InMemoryBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let count = count.clone();
            handles.push(
                bus.consume(
                    "shared",
                    handler(move |_| {
                        let count = count.clone();
                        async move {
                            count.fetch_add(1, Ordering::SeqCst);
                        }
                    }),
                    cancel.clone(),
                )
                .await
                .unwrap(),
            );
        }

        for i in 0..10u8 {
            bus.publish("shared", vec![i]).await.unwrap();
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            while count.load(Ordering::SeqCst) < 10 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // each message handled exactly once
        assert_eq!(count.load(Ordering::SeqCst), 10);

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_closed_topic_drops_messages() {
        let bus = InMemoryBus::new();
        let cancel = CancellationToken::new();
        let handle = bus
            .consume("gone", handler(|_| async {}), cancel.clone())
            .await
            .unwrap();

        bus.close_topic("gone").await.unwrap();
        // the consumer ends once its sender is dropped
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();

        bus.publish("gone", b"late".to_vec()).await.unwrap();
        assert!(!bus.topics.lock().open.contains_key("gone"));
    }
}
