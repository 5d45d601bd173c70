//! Read-process-commit loop of the Kafka receiver.
//!
//! Every record is committed exactly once, after it was either delivered or
//! republished to the dead-letter topic. When the dead-letter publish fails
//! the stream is rewound to that record and nothing is committed, so the
//! record is read again instead of being lost.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::transport::{BoxError, ChatMessenger, LinkUpdate, deliver};

const BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait RecordStream: Send {
    async fn next(&mut self) -> Result<InboundRecord, BoxError>;
    async fn commit(&mut self, record: &InboundRecord) -> Result<(), BoxError>;
    /// Makes `record` the next one `next` returns.
    async fn rewind(&mut self, record: &InboundRecord) -> Result<(), BoxError>;
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn publish(&self, record: &InboundRecord, reason: &str) -> Result<(), BoxError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("update consumer was cancelled")]
    Cancelled,
    #[error("failed to commit offset {offset} on {topic}[{partition}]: {source}")]
    Commit {
        topic: String,
        partition: i32,
        offset: i64,
        #[source]
        source: BoxError,
    },
    #[error("failed to rewind to offset {offset} on {topic}[{partition}]: {source}")]
    Rewind {
        topic: String,
        partition: i32,
        offset: i64,
        #[source]
        source: BoxError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    Delivered,
    DeadLettered,
    Rewound,
}

pub struct UpdateConsumer<S, D> {
    stream: S,
    dead_letters: D,
    messenger: Arc<dyn ChatMessenger>,
}

impl<S: RecordStream, D: DeadLetterSink> UpdateConsumer<S, D> {
    pub fn new(stream: S, dead_letters: D, messenger: Arc<dyn ChatMessenger>) -> Self {
        Self {
            stream,
            dead_letters,
            messenger,
        }
    }

    /// Consumes records one at a time until `shutdown` fires, which is
    /// reported as [`ConsumerError::Cancelled`]. A record being processed when
    /// the signal arrives is finished first. Read, commit and rewind failures
    /// are logged and followed by a backoff; they never end the loop.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), ConsumerError> {
        log::info!("Update consumer started");
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.changed() => return Err(ConsumerError::Cancelled),
                next = self.stream.next() => next,
            };

            let backoff = match next {
                Ok(record) => match self.handle(&record).await {
                    Ok(handled) => handled == Handled::Rewound,
                    Err(e) => {
                        log::error!("{e}; the record will be redelivered");
                        true
                    }
                },
                Err(e) => {
                    log::error!("Failed to read update record: {e}");
                    true
                }
            };

            if backoff {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => return Err(ConsumerError::Cancelled),
                    _ = tokio::time::sleep(BACKOFF) => {}
                }
            }
        }
    }

    pub async fn handle(&mut self, record: &InboundRecord) -> Result<Handled, ConsumerError> {
        let failure = match serde_json::from_slice::<LinkUpdate>(&record.payload) {
            Err(e) => Some(format!("deserialization failed: {e}")),
            Ok(update) => match deliver(self.messenger.as_ref(), &update).await {
                Ok(()) => None,
                Err(e) => Some(format!("delivery to chat {} failed: {e}", update.chat_id)),
            },
        };

        let handled = match failure {
            None => Handled::Delivered,
            Some(reason) => {
                log::error!(
                    "Dead-lettering {}[{}]@{}: {reason}",
                    record.topic,
                    record.partition,
                    record.offset
                );
                if let Err(e) = self.dead_letters.publish(record, &reason).await {
                    log::error!(
                        "Dead-letter publish failed for {}[{}]@{}, will reprocess: {e}",
                        record.topic,
                        record.partition,
                        record.offset
                    );
                    self.stream.rewind(record).await.map_err(|source| ConsumerError::Rewind {
                        topic: record.topic.clone(),
                        partition: record.partition,
                        offset: record.offset,
                        source,
                    })?;
                    return Ok(Handled::Rewound);
                }
                Handled::DeadLettered
            }
        };

        self.stream.commit(record).await.map_err(|source| ConsumerError::Commit {
            topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
            source,
        })?;
        Ok(handled)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;
    use crate::transport::http::test_support::RecordingMessenger;

    #[derive(Default)]
    struct StreamLog {
        pending: VecDeque<InboundRecord>,
        commits: Vec<i64>,
        rewinds: Vec<i64>,
        failing_commits: usize,
    }

    #[derive(Clone, Default)]
    struct FakeStream(Arc<Mutex<StreamLog>>);

    #[async_trait]
    impl RecordStream for FakeStream {
        async fn next(&mut self) -> Result<InboundRecord, BoxError> {
            let next = self.0.lock().unwrap().pending.pop_front();
            match next {
                Some(record) => Ok(record),
                None => std::future::pending().await,
            }
        }

        async fn commit(&mut self, record: &InboundRecord) -> Result<(), BoxError> {
            let mut log = self.0.lock().unwrap();
            if log.failing_commits > 0 {
                log.failing_commits -= 1;
                return Err("group is rebalancing".into());
            }
            log.commits.push(record.offset);
            Ok(())
        }

        async fn rewind(&mut self, record: &InboundRecord) -> Result<(), BoxError> {
            let mut log = self.0.lock().unwrap();
            log.rewinds.push(record.offset);
            log.pending.push_front(record.clone());
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct FakeSink {
        published: Arc<Mutex<Vec<(InboundRecord, String)>>>,
        broken: bool,
    }

    #[async_trait]
    impl DeadLetterSink for FakeSink {
        async fn publish(&self, record: &InboundRecord, reason: &str) -> Result<(), BoxError> {
            if self.broken {
                return Err("dead-letter topic unavailable".into());
            }
            self.published
                .lock()
                .unwrap()
                .push((record.clone(), reason.to_string()));
            Ok(())
        }
    }

    fn record(offset: i64, payload: &str) -> InboundRecord {
        InboundRecord {
            topic: "link-updates".into(),
            partition: 0,
            offset,
            key: Some(b"1".to_vec()),
            payload: payload.as_bytes().to_vec(),
        }
    }

    const VALID: &str = r#"{"chatId":1,"url":"https://github.com/o/r","description":"New issue"}"#;

    #[tokio::test]
    async fn delivered_record_is_committed_once() {
        let stream = FakeStream::default();
        let sink = FakeSink::default();
        let messenger = Arc::new(RecordingMessenger::default());
        let mut consumer = UpdateConsumer::new(stream.clone(), sink.clone(), messenger.clone());

        let handled = consumer.handle(&record(3, VALID)).await.unwrap();

        assert_eq!(handled, Handled::Delivered);
        assert_eq!(stream.0.lock().unwrap().commits, vec![3]);
        assert!(sink.published.lock().unwrap().is_empty());
        assert_eq!(messenger.sent.lock().unwrap()[0].0, 1);
    }

    #[tokio::test]
    async fn undecodable_record_goes_to_dead_letters_and_is_committed_once() {
        let stream = FakeStream::default();
        let sink = FakeSink::default();
        let messenger = Arc::new(RecordingMessenger::default());
        let mut consumer = UpdateConsumer::new(stream.clone(), sink.clone(), messenger.clone());

        let bad = record(5, r#"{"chatId":"one"}"#);
        let handled = consumer.handle(&bad).await.unwrap();

        assert_eq!(handled, Handled::DeadLettered);
        let published = sink.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, bad);
        assert!(published[0].1.starts_with("deserialization failed"));
        assert_eq!(stream.0.lock().unwrap().commits, vec![5]);
        assert!(messenger.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_delivery_goes_to_dead_letters() {
        let stream = FakeStream::default();
        let sink = FakeSink::default();
        let messenger = Arc::new(RecordingMessenger {
            failing: vec![1],
            ..RecordingMessenger::default()
        });
        let mut consumer = UpdateConsumer::new(stream.clone(), sink.clone(), messenger);

        let handled = consumer.handle(&record(8, VALID)).await.unwrap();

        assert_eq!(handled, Handled::DeadLettered);
        assert!(sink.published.lock().unwrap()[0].1.contains("chat 1"));
        assert_eq!(stream.0.lock().unwrap().commits, vec![8]);
    }

    #[tokio::test]
    async fn dead_letter_failure_rewinds_without_commit() {
        let stream = FakeStream::default();
        let sink = FakeSink {
            broken: true,
            ..FakeSink::default()
        };
        let mut consumer = UpdateConsumer::new(stream.clone(), sink, Arc::new(RecordingMessenger::default()));

        let handled = consumer.handle(&record(9, "not json")).await.unwrap();

        assert_eq!(handled, Handled::Rewound);
        let log = stream.0.lock().unwrap();
        assert!(log.commits.is_empty());
        assert_eq!(log.rewinds, vec![9]);
        assert_eq!(log.pending.front().map(|r| r.offset), Some(9));
    }

    #[tokio::test]
    async fn run_processes_in_order_and_reports_cancellation() {
        let stream = FakeStream::default();
        {
            let mut log = stream.0.lock().unwrap();
            log.pending.push_back(record(0, VALID));
            log.pending.push_back(record(1, "garbage"));
            log.pending.push_back(record(2, VALID));
        }
        let sink = FakeSink::default();
        let messenger = Arc::new(RecordingMessenger::default());
        let consumer = UpdateConsumer::new(stream.clone(), sink.clone(), messenger.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(consumer.run(shutdown_rx));

        for _ in 0..100 {
            if stream.0.lock().unwrap().commits.len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown_tx.send(true).unwrap();
        let result = task.await.unwrap();

        assert!(matches!(result, Err(ConsumerError::Cancelled)));
        assert_eq!(stream.0.lock().unwrap().commits, vec![0, 1, 2]);
        assert_eq!(sink.published.lock().unwrap().len(), 1);
        assert_eq!(messenger.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failed_commit_backs_off_and_keeps_consuming() {
        let stream = FakeStream::default();
        {
            let mut log = stream.0.lock().unwrap();
            log.failing_commits = 1;
            log.pending.push_back(record(0, VALID));
            log.pending.push_back(record(1, VALID));
        }
        let messenger = Arc::new(RecordingMessenger::default());
        let consumer = UpdateConsumer::new(stream.clone(), FakeSink::default(), messenger.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(consumer.run(shutdown_rx));

        for _ in 0..300 {
            if !stream.0.lock().unwrap().commits.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!task.is_finished());
        shutdown_tx.send(true).unwrap();
        let result = task.await.unwrap();

        assert!(matches!(result, Err(ConsumerError::Cancelled)));
        assert_eq!(stream.0.lock().unwrap().commits, vec![1]);
        assert_eq!(messenger.sent.lock().unwrap().len(), 2);
    }
}
