use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{Message, Offset, TopicPartitionList};

use crate::configuration::KafkaConfiguration;
use crate::transport::consumer::{DeadLetterSink, InboundRecord, RecordStream};
use crate::transport::{BoxError, LinkUpdate, SendError, UpdateSender};

pub const DLQ_REASON_HEADER: &str = "dlq-reason";

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

fn client_config(kafka: &KafkaConfiguration) -> ClientConfig {
    let mut config = ClientConfig::new();
    config.set("bootstrap.servers", &kafka.brokers);
    config
}

fn producer(kafka: &KafkaConfiguration) -> Result<FutureProducer, KafkaError> {
    client_config(kafka)
        .set("acks", "all")
        .set("enable.idempotence", "true")
        .set("message.timeout.ms", "30000")
        .create()
}

/// Publishes updates keyed by chat id so one chat's updates stay ordered.
pub struct KafkaUpdateSender {
    producer: FutureProducer,
    topic: String,
}

impl KafkaUpdateSender {
    pub fn new(kafka: &KafkaConfiguration) -> Result<Self, KafkaError> {
        log::info!("Kafka producer for topic '{}' on {}", kafka.topic, kafka.brokers);
        Ok(Self {
            producer: producer(kafka)?,
            topic: kafka.topic.clone(),
        })
    }
}

#[async_trait]
impl UpdateSender for KafkaUpdateSender {
    async fn send(&self, chat_id: i64, url: &str, description: &str) -> Result<(), SendError> {
        let payload = serde_json::to_vec(&LinkUpdate {
            chat_id,
            url: url.to_string(),
            description: description.to_string(),
        })?;
        let key = chat_id.to_string();
        let record = FutureRecord::to(&self.topic).key(&key).payload(&payload);

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(SEND_TIMEOUT))
            .await
            .map_err(|(e, _)| e)?;
        log::debug!("Update for chat {chat_id} stored at {}[{partition}]@{offset}", self.topic);
        Ok(())
    }
}

pub struct KafkaRecordStream {
    consumer: StreamConsumer,
}

impl KafkaRecordStream {
    pub fn new(kafka: &KafkaConfiguration) -> Result<Self, KafkaError> {
        let consumer: StreamConsumer = client_config(kafka)
            .set("group.id", &kafka.consumer_group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "30000")
            .create()?;
        consumer.subscribe(&[kafka.topic.as_str()])?;
        log::info!(
            "Kafka consumer '{}' subscribed to '{}'",
            kafka.consumer_group,
            kafka.topic
        );
        Ok(Self { consumer })
    }
}

#[async_trait]
impl RecordStream for KafkaRecordStream {
    async fn next(&mut self) -> Result<InboundRecord, BoxError> {
        let message = self.consumer.recv().await?;
        Ok(InboundRecord {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(<[u8]>::to_vec),
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        })
    }

    async fn commit(&mut self, record: &InboundRecord) -> Result<(), BoxError> {
        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(&record.topic, record.partition, Offset::Offset(record.offset + 1))?;
        self.consumer.commit(&offsets, CommitMode::Sync)?;
        Ok(())
    }

    async fn rewind(&mut self, record: &InboundRecord) -> Result<(), BoxError> {
        self.consumer.seek(
            &record.topic,
            record.partition,
            Offset::Offset(record.offset),
            Timeout::After(SEND_TIMEOUT),
        )?;
        Ok(())
    }
}

/// Republishes failed records unchanged, with the reason in a header.
pub struct KafkaDeadLetterSink {
    producer: FutureProducer,
    topic: String,
}

impl KafkaDeadLetterSink {
    pub fn new(kafka: &KafkaConfiguration) -> Result<Self, KafkaError> {
        Ok(Self {
            producer: producer(kafka)?,
            topic: kafka.dlq_topic.clone(),
        })
    }
}

/// The failed record with its original key and payload, plus a single
/// `dlq-reason` header.
fn dead_letter_record<'a>(
    topic: &'a str,
    record: &'a InboundRecord,
    reason: &str,
) -> FutureRecord<'a, Vec<u8>, Vec<u8>> {
    let headers = OwnedHeaders::new().insert(Header {
        key: DLQ_REASON_HEADER,
        value: Some(reason),
    });
    let dead = FutureRecord::to(topic).payload(&record.payload).headers(headers);
    match &record.key {
        Some(key) => dead.key(key),
        None => dead,
    }
}

#[async_trait]
impl DeadLetterSink for KafkaDeadLetterSink {
    async fn publish(&self, record: &InboundRecord, reason: &str) -> Result<(), BoxError> {
        self.producer
            .send(dead_letter_record(&self.topic, record, reason), Timeout::After(SEND_TIMEOUT))
            .await
            .map_err(|(e, _)| e)?;
        Ok(())
    }
}
