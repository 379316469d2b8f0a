use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::{
    aio::MultiplexedConnection,
    streams::{StreamId, StreamReadOptions, StreamReadReply},
    AsyncCommands,
};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::{models::event::ALL_TOPICS, services::metrics::EVENTS_CONSUMED_COUNTER};

const READ_BATCH: usize = 50;
const READ_BLOCK_MS: usize = 5_000;
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// One stream entry as the consumer group sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumedEvent {
    pub topic: String,
    pub id: String,
    pub key: Option<String>,
    /// Decoded JSON payload; a payload that is not JSON is kept as a string.
    pub payload: Value,
    /// Append time encoded in the entry id.
    pub published_at: Option<DateTime<Utc>>,
}

impl ConsumedEvent {
    pub fn parse(topic: &str, id: &str, key: Option<String>, payload: Option<String>) -> Self {
        let payload = match payload {
            Some(raw) => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
            None => Value::Null,
        };
        Self {
            topic: topic.to_string(),
            id: id.to_string(),
            key,
            payload,
            published_at: entry_timestamp(id),
        }
    }

    fn from_entry(topic: &str, entry: &StreamId) -> Self {
        Self::parse(topic, &entry.id, entry.get("key"), entry.get("payload"))
    }

    pub fn log(&self) {
        info!(
            topic = %self.topic,
            id = %self.id,
            key = self.key.as_deref().unwrap_or("-"),
            payload = %self.payload,
            published_at = ?self.published_at,
            "event received"
        );
    }
}

/// Entry ids are `<unix millis>-<sequence>`.
fn entry_timestamp(id: &str) -> Option<DateTime<Utc>> {
    let (millis, _) = id.split_once('-')?;
    DateTime::from_timestamp_millis(millis.parse().ok()?)
}

/// Reads every topic through the consumer group, logs each entry and acknowledges it.
///
/// Needs its own connection: a blocking `XREADGROUP` would stall everything
/// else multiplexed on a shared one.
pub struct EventConsumer {
    conn: MultiplexedConnection,
    group: String,
    consumer: String,
}

impl EventConsumer {
    pub fn new(conn: MultiplexedConnection, group: String, consumer: String) -> Self {
        Self { conn, group, consumer }
    }

    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        info!(group = %self.group, consumer = %self.consumer, "event consumer started");

        let options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(READ_BATCH)
            .block(READ_BLOCK_MS);
        let ids = vec![">"; ALL_TOPICS.len()];

        loop {
            let reply: redis::RedisResult<Option<StreamReadReply>> =
                self.conn.xread_options(ALL_TOPICS, &ids, &options).await;

            match reply {
                Ok(Some(reply)) => {
                    for stream in reply.keys {
                        for entry in &stream.ids {
                            self.handle(&stream.key, entry).await;
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, group = %self.group, "event stream read failed");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    }

    async fn handle(&mut self, topic: &str, entry: &StreamId) {
        ConsumedEvent::from_entry(topic, entry).log();
        EVENTS_CONSUMED_COUNTER.with_label_values(&[topic]).inc();

        let acked: redis::RedisResult<i64> = self.conn.xack(topic, &self.group, &[&entry.id]).await;
        if let Err(e) = acked {
            warn!(%topic, id = %entry.id, error = %e, "event acknowledge failed");
        }
    }
}
