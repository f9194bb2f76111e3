//! Kafka-backed command log (`kafka` feature).
//!
//! # Invariants
//! - Offsets are committed manually and synchronously; auto-commit is off.
//! - A group without committed offsets starts from the earliest record.
//! - Topics are created compacted with unlimited retention when missing.

use super::log::{CommandLog, LogError, LogReader, LogRecord, LogResult, RecordPosition};
use async_trait::async_trait;
use log::{info, warn};
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::util::Timeout;
use rdkafka::{Message, Offset, TopicPartitionList};
use std::time::Duration;
use tokio::sync::watch;

const SEND_TIMEOUT: Duration = Duration::from_secs(30);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

const TOPIC_CONFIG: [(&str, &str); 6] = [
    ("retention.ms", "-1"),
    ("retention.bytes", "-1"),
    ("cleanup.policy", "compact"),
    ("delete.retention.ms", "86400000"),
    ("segment.ms", "604800000"),
    ("min.cleanable.dirty.ratio", "0.1"),
];

impl From<KafkaError> for LogError {
    fn from(value: KafkaError) -> Self {
        Self::Backend(value.to_string())
    }
}

/// Command log talking to a Kafka cluster.
pub struct KafkaCommandLog {
    bootstrap_url: String,
    producer: FutureProducer,
    closed: watch::Sender<bool>,
}

impl KafkaCommandLog {
    /// Connects a producer and makes sure every topic in `topics` exists.
    pub async fn connect(bootstrap_url: &str, topics: &[&str]) -> LogResult<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", bootstrap_url)
            .set("message.timeout.ms", "30000")
            .create()?;
        let (closed, _) = watch::channel(false);
        let log = Self {
            bootstrap_url: bootstrap_url.to_string(),
            producer,
            closed,
        };
        for topic in topics {
            if let Err(err) = log.ensure_topic(topic).await {
                // Brokers with auto-creation still work without the explicit config.
                warn!(
                    "event=topic_init module=source status=error topic={} error={}",
                    topic, err
                );
            }
        }
        Ok(log)
    }

    async fn ensure_topic(&self, topic: &str) -> LogResult<()> {
        let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", &self.bootstrap_url)
            .create()?;
        let new_topic = TOPIC_CONFIG
            .iter()
            .fold(
                NewTopic::new(topic, 1, TopicReplication::Fixed(1)),
                |new_topic, (key, value)| new_topic.set(key, value),
            );
        let results = admin
            .create_topics([&new_topic], &AdminOptions::new())
            .await?;
        for result in results {
            match result {
                Ok(created) => info!(
                    "event=topic_init module=source status=ok topic={} created=true",
                    created
                ),
                Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {}
                Err((name, code)) => {
                    return Err(LogError::Backend(format!(
                        "unable to create topic `{name}`: {code}"
                    )))
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CommandLog for KafkaCommandLog {
    async fn append(&self, topic: &str, key: &[u8], value: &[u8]) -> LogResult<RecordPosition> {
        if *self.closed.borrow() {
            return Err(LogError::Closed);
        }
        let record = FutureRecord::to(topic).key(key).payload(value);
        let delivery = self
            .producer
            .send(record, Timeout::After(SEND_TIMEOUT))
            .await
            .map_err(|(err, _)| LogError::from(err))?;
        Ok(RecordPosition {
            partition: delivery.partition,
            offset: delivery.offset,
        })
    }

    async fn subscribe(&self, group_id: &str, topic: &str) -> LogResult<Box<dyn LogReader>> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.bootstrap_url)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()?;
        consumer.subscribe(&[topic])?;
        info!(
            "event=log_subscribe module=source status=ok backend=kafka topic={} group={}",
            topic, group_id
        );
        Ok(Box::new(KafkaLogReader {
            consumer,
            closed: self.closed.subscribe(),
        }))
    }

    async fn close(&self) -> LogResult<()> {
        self.closed.send_replace(true);
        self.producer.flush(Timeout::After(FLUSH_TIMEOUT))?;
        Ok(())
    }
}

struct KafkaLogReader {
    consumer: StreamConsumer,
    closed: watch::Receiver<bool>,
}

#[async_trait]
impl LogReader for KafkaLogReader {
    async fn fetch(&mut self) -> LogResult<Option<LogRecord>> {
        if *self.closed.borrow() {
            return Ok(None);
        }
        tokio::select! {
            _ = self.closed.wait_for(|closed| *closed) => Ok(None),
            message = self.consumer.recv() => {
                let message = message?;
                Ok(Some(LogRecord {
                    topic: message.topic().to_string(),
                    partition: message.partition(),
                    offset: message.offset(),
                    key: message.key().map(<[u8]>::to_vec).unwrap_or_default(),
                    value: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                }))
            }
        }
    }

    async fn commit(&mut self, record: &LogRecord) -> LogResult<()> {
        let mut positions = TopicPartitionList::new();
        positions.add_partition_offset(
            &record.topic,
            record.partition,
            Offset::Offset(record.offset + 1),
        )?;
        self.consumer.commit(&positions, CommitMode::Sync)?;
        Ok(())
    }
}
