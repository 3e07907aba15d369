//! Relays reservation events from the Redis Stream outbox to Kafka. An entry
//! is acknowledged and deleted only after its publish succeeds, so a crash
//! between publish and ack yields a duplicate delivery, never a lost event.

use anyhow::{anyhow, Context, Result};
use rdkafka::producer::{FutureProducer, FutureRecord};
use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::events::OrderMessage;

const READ_BATCH: usize = 16;
const BLOCK_MS: usize = 2_000;
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);
const RETRY_BACKOFF: Duration = Duration::from_millis(300);
const PUBLISH_BACKOFF: Duration = Duration::from_millis(200);

pub struct OutboxRelay {
    kv: ConnectionManager,
    producer: FutureProducer,
    topic: String,
    stream: String,
    group: String,
    consumer: String,
}

impl OutboxRelay {
    pub fn new(
        kv: ConnectionManager,
        producer: FutureProducer,
        topic: String,
        stream: String,
        group: String,
        consumer: String,
    ) -> Self {
        Self {
            kv,
            producer,
            topic,
            stream,
            group,
            consumer,
        }
    }

    pub async fn run(mut self, token: CancellationToken) {
        if let Err(e) = self.ensure_group().await {
            error!("outbox relay ensure group: {e:#}");
            return;
        }
        info!(stream = %self.stream, group = %self.group, "outbox relay started");

        loop {
            if token.is_cancelled() {
                info!("outbox relay stopped");
                return;
            }

            // Drain this consumer's own pending entries before asking for new
            // ones, so a restart picks up whatever a crash left unacked.
            let mut batch = match self.read_group("0", None).await {
                Ok(batch) => batch,
                Err(e) => {
                    warn!("outbox relay read pending: {e:#}");
                    tokio::time::sleep(RETRY_BACKOFF).await;
                    continue;
                }
            };
            if batch.is_empty() {
                batch = match self.read_group(">", Some(BLOCK_MS)).await {
                    Ok(batch) => batch,
                    Err(e) => {
                        warn!("outbox relay read new: {e:#}");
                        tokio::time::sleep(RETRY_BACKOFF).await;
                        continue;
                    }
                };
            }

            for entry in &batch {
                if let Err(e) = self.process_one(entry).await {
                    // The entry stays pending; resume from the recovery read.
                    warn!(entry_id = %entry.id, "outbox relay publish: {e:#}");
                    tokio::time::sleep(PUBLISH_BACKOFF).await;
                    break;
                }
            }
        }
    }

    async fn ensure_group(&mut self) -> Result<()> {
        let stream = self.stream.clone();
        let group = self.group.clone();
        let created: redis::RedisResult<String> =
            self.kv.xgroup_create_mkstream(&stream, &group, "0").await;
        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_group(&mut self, cursor: &str, block_ms: Option<usize>) -> Result<Vec<StreamId>> {
        let mut opts = StreamReadOptions::default()
            .group(self.group.clone(), self.consumer.clone())
            .count(READ_BATCH);
        if let Some(ms) = block_ms {
            opts = opts.block(ms);
        }
        let stream = self.stream.clone();
        let reply: Option<StreamReadReply> = self
            .kv
            .xread_options(&[stream.as_str()], &[cursor], &opts)
            .await?;
        let Some(reply) = reply else {
            return Ok(Vec::new());
        };
        Ok(reply.keys.into_iter().flat_map(|key| key.ids).collect())
    }

    async fn process_one(&mut self, entry: &StreamId) -> Result<()> {
        let msg = match parse_stream_event(entry) {
            Ok(msg) => msg,
            Err(e) => {
                // Malformed entries cannot be rescued by retrying; drop them
                // past their stream position.
                error!(entry_id = %entry.id, "dropping malformed outbox entry: {e:#}");
                return self.ack_and_delete(&entry.id).await;
            }
        };

        let payload = serde_json::to_string(&msg)?;
        self.producer
            .send(
                FutureRecord::to(&self.topic)
                    .key(&msg.request_id)
                    .payload(&payload),
                PUBLISH_TIMEOUT,
            )
            .await
            .map_err(|(e, _)| anyhow!("publish request {}: {e}", msg.request_id))?;

        self.ack_and_delete(&entry.id).await
    }

    /// Ack and delete travel as one transactional pipeline so the stream
    /// never holds an acked-but-undeleted entry.
    async fn ack_and_delete(&mut self, entry_id: &str) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .xack(&self.stream, &self.group, &[entry_id])
            .ignore()
            .xdel(&self.stream, &[entry_id])
            .ignore();
        let _: () = pipe.query_async(&mut self.kv).await?;
        Ok(())
    }
}

fn stream_field(entry: &StreamId, name: &str) -> Result<String> {
    entry
        .get::<String>(name)
        .ok_or_else(|| anyhow!("missing field {name}"))
}

fn parse_stream_event(entry: &StreamId) -> Result<OrderMessage> {
    let request_id = stream_field(entry, "request_id")?;
    let product_id = stream_field(entry, "product_id")?
        .parse::<i64>()
        .context("invalid product_id")?;
    let user_id = stream_field(entry, "user_id")?
        .parse::<i64>()
        .context("invalid user_id")?;
    let quantity = stream_field(entry, "quantity")?
        .parse::<i32>()
        .context("invalid quantity")?;
    let amount = stream_field(entry, "amount")?
        .parse::<i64>()
        .context("invalid amount")?;

    let msg = OrderMessage {
        request_id,
        product_id,
        user_id,
        quantity,
        amount,
    };
    msg.validate()?;
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn entry(fields: &[(&str, &str)]) -> StreamId {
        let map: HashMap<String, redis::Value> = fields
            .iter()
            .map(|(k, v)| ((*k).to_string(), redis::Value::Data(v.as_bytes().to_vec())))
            .collect();
        StreamId {
            id: "1-0".to_string(),
            map,
        }
    }

    #[test]
    fn well_formed_entry_parses() {
        let entry = entry(&[
            ("request_id", "req-1"),
            ("product_id", "7"),
            ("user_id", "42"),
            ("quantity", "1"),
            ("amount", "1999"),
        ]);
        let msg = parse_stream_event(&entry).unwrap();
        assert_eq!(msg.request_id, "req-1");
        assert_eq!(msg.product_id, 7);
        assert_eq!(msg.user_id, 42);
        assert_eq!(msg.quantity, 1);
        assert_eq!(msg.amount, 1999);
    }

    #[test]
    fn missing_field_is_poison() {
        let entry = entry(&[("request_id", "req-1"), ("product_id", "7")]);
        assert!(parse_stream_event(&entry).is_err());
    }

    #[test]
    fn non_numeric_field_is_poison() {
        let entry = entry(&[
            ("request_id", "req-1"),
            ("product_id", "seven"),
            ("user_id", "42"),
            ("quantity", "1"),
            ("amount", "1999"),
        ]);
        assert!(parse_stream_event(&entry).is_err());
    }
}
