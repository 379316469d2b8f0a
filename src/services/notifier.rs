use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    error::AppError,
    models::event::{DomainEvent, ALL_TOPICS},
    services::metrics::NOTIFY_FAILURES_COUNTER,
};

/// Broker client seam: hands one serialized event to a topic.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, payload: &Value) -> anyhow::Result<()>;
}

/// Appends events to Redis Streams, one stream per topic.
pub struct RedisStreamPublisher {
    conn: MultiplexedConnection,
    maxlen: usize,
}

impl RedisStreamPublisher {
    pub fn new(conn: MultiplexedConnection, maxlen: usize) -> Self {
        Self { conn, maxlen }
    }
}

#[async_trait]
impl EventPublisher for RedisStreamPublisher {
    async fn publish(&self, topic: &str, key: &str, payload: &Value) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _id: String = redis::cmd("XADD")
            .arg(topic)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.maxlen)
            .arg("*")
            .arg("key")
            .arg(key)
            .arg("payload")
            .arg(payload.to_string())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

/// Best-effort, at-most-once event delivery.
///
/// Failures are logged and counted, then handed back as `NotifyFailed` so the
/// caller can report a warning; nothing is retried.
pub struct Notifier {
    publisher: Arc<dyn EventPublisher>,
    timeout: Duration,
}

impl Notifier {
    pub fn new(publisher: Arc<dyn EventPublisher>, timeout: Duration) -> Self {
        Self { publisher, timeout }
    }

    pub async fn publish<E: DomainEvent>(&self, event: &E) -> Result<(), AppError> {
        let topic = event.topic();
        let key = event.key();

        let result = match serde_json::to_value(event) {
            Ok(payload) => {
                match tokio::time::timeout(self.timeout, self.publisher.publish(topic, &key, &payload)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err(format!("timed out after {:?}", self.timeout)),
                }
            }
            Err(e) => Err(format!("unserializable event: {e}")),
        };

        match result {
            Ok(()) => {
                debug!(%topic, %key, "event published");
                Ok(())
            }
            Err(reason) => {
                NOTIFY_FAILURES_COUNTER.with_label_values(&[topic]).inc();
                warn!(%topic, %key, %reason, "event publish failed");
                Err(AppError::NotifyFailed {
                    topic: topic.to_string(),
                    reason,
                })
            }
        }
    }

    /// Publishes in a background task; the caller never waits on the broker.
    pub fn publish_detached<E>(self: &Arc<Self>, event: E)
    where
        E: DomainEvent + Send + Sync + 'static,
    {
        let notifier = Arc::clone(self);
        tokio::spawn(async move {
            // Failure is already logged and counted inside `publish`.
            let _ = notifier.publish(&event).await;
        });
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamBootstrap {
    Created,
    AlreadyExists,
    Failed(String),
}

/// Creates every topic stream together with the consumer group.
///
/// An existing group is not an error; any other failure is logged and the
/// remaining topics are still attempted.
pub async fn bootstrap_streams(
    conn: &mut MultiplexedConnection,
    group: &str,
) -> Vec<(&'static str, StreamBootstrap)> {
    let mut outcomes = Vec::with_capacity(ALL_TOPICS.len());

    for topic in ALL_TOPICS {
        let result: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(*topic)
            .arg(group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(conn)
            .await;

        let outcome = match result {
            Ok(()) => {
                info!(%topic, %group, "created event stream");
                StreamBootstrap::Created
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {
                info!(%topic, %group, "event stream already exists");
                StreamBootstrap::AlreadyExists
            }
            Err(e) => {
                warn!(%topic, %group, error = %e, "event stream bootstrap failed");
                StreamBootstrap::Failed(e.to_string())
            }
        };
        outcomes.push((*topic, outcome));
    }

    outcomes
}
