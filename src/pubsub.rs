use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, warn};

/// A frame published to one topic, as received by a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    pub topic_key: String,
    pub payload: String,
}

/// Group-send primitive between the dispatch engine and the gateway.
/// Publishing to a topic nobody subscribes to is a no-op, not an error.
#[async_trait]
pub trait PubSubLayer: Send + Sync {
    async fn publish(&self, topic_key: &str, payload: &str) -> Result<()>;

    /// Subscribe to a set of topics; the receiver yields every frame
    /// published to any of them until it is dropped.
    async fn subscribe(&self, topic_keys: Vec<String>) -> Result<mpsc::Receiver<PubSubMessage>>;
}

/// In-process layer over tokio broadcast channels. Used by single-process
/// deployments and by the test suite.
#[derive(Default)]
pub struct LocalPubSub {
    topics: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

const TOPIC_CHANNEL_CAPACITY: usize = 64;

impl LocalPubSub {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PubSubLayer for LocalPubSub {
    async fn publish(&self, topic_key: &str, payload: &str) -> Result<()> {
        let mut topics = self.topics.lock().await;
        let Some(sender) = topics.get(topic_key) else {
            debug!("publish to topic {topic_key} with no subscribers, dropped");
            return Ok(());
        };
        if sender.send(payload.to_owned()).is_err() {
            // last receiver went away, drop the channel
            topics.remove(topic_key);
        }
        Ok(())
    }

    async fn subscribe(&self, topic_keys: Vec<String>) -> Result<mpsc::Receiver<PubSubMessage>> {
        let (out_tx, out_rx) = mpsc::channel(TOPIC_CHANNEL_CAPACITY);
        let mut topics = self.topics.lock().await;
        for topic_key in topic_keys {
            let sender = topics
                .entry(topic_key.clone())
                .or_insert_with(|| broadcast::channel(TOPIC_CHANNEL_CAPACITY).0);
            let mut rx = sender.subscribe();
            let out_tx = out_tx.clone();
            tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(payload) => {
                            let message = PubSubMessage {
                                topic_key: topic_key.clone(),
                                payload,
                            };
                            if out_tx.send(message).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("subscriber lagged on topic {topic_key}, skipped {skipped}");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
        }
        Ok(out_rx)
    }
}

/// Redis pub/sub layer for multi-process deployments: the dispatch engine in
/// any process publishes, every gateway process relays to its connections.
pub struct RedisPubSub {
    client: redis::Client,
    conn: ConnectionManager,
    prefix: String,
}

impl RedisPubSub {
    pub async fn connect(url: &str, prefix: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid redis url")?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .context("failed connecting redis pub/sub publisher")?;
        Ok(Self {
            client,
            conn,
            prefix: prefix.to_owned(),
        })
    }

    fn channel_name(&self, topic_key: &str) -> String {
        format!("{}topic.{topic_key}", self.prefix)
    }
}

#[async_trait]
impl PubSubLayer for RedisPubSub {
    async fn publish(&self, topic_key: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _subscribers: i64 = conn
            .publish(self.channel_name(topic_key), payload)
            .await
            .context("redis publish failed")?;
        Ok(())
    }

    async fn subscribe(&self, topic_keys: Vec<String>) -> Result<mpsc::Receiver<PubSubMessage>> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .context("failed opening redis pub/sub connection")?;
        for topic_key in &topic_keys {
            pubsub
                .subscribe(self.channel_name(topic_key))
                .await
                .with_context(|| format!("failed subscribing to topic {topic_key}"))?;
        }
        let (out_tx, out_rx) = mpsc::channel(TOPIC_CHANNEL_CAPACITY);
        let channel_prefix = format!("{}topic.", self.prefix);
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_owned();
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!("discarding non-text pub/sub payload on {channel}: {err}");
                        continue;
                    }
                };
                let topic_key = channel
                    .strip_prefix(&channel_prefix)
                    .unwrap_or(&channel)
                    .to_owned();
                if out_tx
                    .send(PubSubMessage { topic_key, payload })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
        Ok(out_rx)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::{LocalPubSub, PubSubLayer};

    #[tokio::test]
    async fn publish_without_subscribers_is_a_noop() {
        let layer = LocalPubSub::new();
        layer.publish("t1", "hello").await.expect("publish");
    }

    #[tokio::test]
    async fn subscriber_receives_published_frames() {
        let layer = LocalPubSub::new();
        let mut rx = layer
            .subscribe(vec!["t1".to_owned(), "t2".to_owned()])
            .await
            .expect("subscribe");
        layer.publish("t1", "one").await.expect("publish");
        layer.publish("t2", "two").await.expect("publish");
        layer.publish("t3", "dropped").await.expect("publish");

        let first = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timely")
            .expect("message");
        assert_eq!(first.payload, "one");
        assert_eq!(first.topic_key, "t1");
        let second = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timely")
            .expect("message");
        assert_eq!(second.payload, "two");
    }

    #[tokio::test]
    async fn every_subscriber_of_a_topic_receives() {
        let layer = LocalPubSub::new();
        let mut a = layer.subscribe(vec!["t".to_owned()]).await.expect("sub a");
        let mut b = layer.subscribe(vec!["t".to_owned()]).await.expect("sub b");
        layer.publish("t", "fanout").await.expect("publish");

        for rx in [&mut a, &mut b] {
            let msg = timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("timely")
                .expect("message");
            assert_eq!(msg.payload, "fanout");
        }
    }
}
