//! Delivery of link updates from the scrapper to the bot, either as a direct
//! HTTP call or through a Kafka topic with a dead-letter topic behind it.

pub mod consumer;
pub mod http;
pub mod kafka;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::configuration::{BotConfiguration, KafkaConfiguration};
use crate::transport::consumer::{ConsumerError, UpdateConsumer};
use crate::transport::http::HttpUpdateSender;
use crate::transport::kafka::{KafkaDeadLetterSink, KafkaRecordStream, KafkaUpdateSender};
use crate::utils::html_escape;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The record exchanged between scrapper and bot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct LinkUpdate {
    pub chat_id: i64,
    pub url: String,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageTransport {
    Http,
    Kafka,
}

impl FromStr for MessageTransport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(MessageTransport::Http),
            "kafka" => Ok(MessageTransport::Kafka),
            other => Err(format!("unknown message transport {other:?}")),
        }
    }
}

impl fmt::Display for MessageTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageTransport::Http => f.write_str("http"),
            MessageTransport::Kafka => f.write_str("kafka"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("request to bot failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("bot answered {status}: {body}")]
    Rejected { status: reqwest::StatusCode, body: String },
    #[error("failed to encode update: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("kafka delivery failed: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
}

/// Delivers one update to one chat.
#[async_trait]
pub trait UpdateSender: Send + Sync {
    async fn send(&self, chat_id: i64, url: &str, description: &str) -> Result<(), SendError>;
}

pub fn build_sender(
    transport: MessageTransport,
    bot_url: &str,
    kafka: &KafkaConfiguration,
) -> Result<Arc<dyn UpdateSender>, SendError> {
    log::info!("Delivering updates over {transport}");
    Ok(match transport {
        MessageTransport::Http => Arc::new(HttpUpdateSender::new(bot_url)?),
        MessageTransport::Kafka => Arc::new(KafkaUpdateSender::new(kafka)?),
    })
}

/// The bot's primitive for putting text in front of a chat.
#[async_trait]
pub trait ChatMessenger: Send + Sync {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), BoxError>;
}

/// Telegram HTML: the link on the first line, the escaped description below.
pub fn render_link_update(update: &LinkUpdate) -> String {
    let url = html_escape(&update.url);
    format!(
        "<a href=\"{url}\">{url}</a>\n\n{}",
        html_escape(&update.description)
    )
}

pub async fn deliver(messenger: &dyn ChatMessenger, update: &LinkUpdate) -> Result<(), BoxError> {
    messenger
        .send_text(update.chat_id, &render_link_update(update))
        .await
}

#[derive(Debug, thiserror::Error)]
pub enum ReceiverError {
    #[error("failed to serve updates endpoint: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Consumer(#[from] ConsumerError),
    #[error("failed to set up kafka consumer: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
}

/// Bot side of the transport pair.
pub enum UpdateReceiver {
    Http { listen_addr: String, router: axum::Router },
    Kafka(UpdateConsumer<KafkaRecordStream, KafkaDeadLetterSink>),
}

impl UpdateReceiver {
    pub fn from_configuration(
        config: &BotConfiguration,
        messenger: Arc<dyn ChatMessenger>,
    ) -> Result<Self, ReceiverError> {
        Ok(match config.transport {
            MessageTransport::Http => UpdateReceiver::Http {
                listen_addr: config.listen_addr.clone(),
                router: http::updates_router(messenger),
            },
            MessageTransport::Kafka => UpdateReceiver::Kafka(UpdateConsumer::new(
                KafkaRecordStream::new(&config.kafka)?,
                KafkaDeadLetterSink::new(&config.kafka)?,
                messenger,
            )),
        })
    }

    /// Runs until `shutdown` fires. A cancelled consumer is a clean exit.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ReceiverError> {
        match self {
            UpdateReceiver::Http { listen_addr, router } => {
                let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
                log::info!("Accepting updates on http://{listen_addr}/updates");
                axum::serve(listener, router)
                    .with_graceful_shutdown(async move {
                        let _ = shutdown.changed().await;
                    })
                    .await?;
                Ok(())
            }
            UpdateReceiver::Kafka(consumer) => match consumer.run(shutdown).await {
                Err(ConsumerError::Cancelled) => Ok(()),
                other => Ok(other?),
            },
        }
    }
}
