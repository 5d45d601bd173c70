use std::str::FromStr;
use std::time::Duration;

use crate::transport::MessageTransport;

#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),
    #[error("{name} has an invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Clone, Debug)]
pub struct ResilienceConfiguration {
    pub timeout: Duration,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub retryable_statuses: Vec<u16>,
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct ScheduleConfiguration {
    pub batch_size: u32,
    pub batch_interval: Duration,
    pub daily_hour: u32,
}

#[derive(Clone, Debug)]
pub struct KafkaConfiguration {
    pub brokers: String,
    pub topic: String,
    pub dlq_topic: String,
    pub consumer_group: String,
}

#[derive(Clone, Debug)]
pub struct ScrapperConfiguration {
    pub database_path: String,
    pub database_max_connections: u32,
    pub listen_addr: String,
    pub bot_url: String,
    pub github_api_url: String,
    pub github_token: Option<String>,
    pub stackoverflow_api_url: String,
    pub stackoverflow_key: Option<String>,
    pub transport: MessageTransport,
    pub kafka: KafkaConfiguration,
    pub resilience: ResilienceConfiguration,
    pub schedule: ScheduleConfiguration,
}

#[derive(Clone, Debug)]
pub struct BotConfiguration {
    pub teloxide_token: String,
    pub listen_addr: String,
    pub scrapper_url: String,
    pub transport: MessageTransport,
    pub kafka: KafkaConfiguration,
}

/// Reads variables through `lookup` so parsing can be exercised without
/// mutating the process environment.
struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn required(&self, name: &'static str) -> Result<String, ConfigurationError> {
        (self.lookup)(name)
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigurationError::Missing(name))
    }

    fn optional(&self, name: &'static str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.trim().is_empty())
    }

    fn or(&self, name: &'static str, default: &str) -> String {
        self.optional(name).unwrap_or_else(|| default.to_string())
    }

    fn parsed<T: FromStr>(&self, name: &'static str, default: T) -> Result<T, ConfigurationError> {
        match self.optional(name) {
            Some(value) => value
                .trim()
                .parse()
                .map_err(|_| ConfigurationError::Invalid { name, value }),
            None => Ok(default),
        }
    }

    fn transport(&self) -> Result<MessageTransport, ConfigurationError> {
        let value = self.or("MESSAGE_TRANSPORT", "http");
        value
            .parse()
            .map_err(|_| ConfigurationError::Invalid { name: "MESSAGE_TRANSPORT", value })
    }

    fn kafka(&self) -> KafkaConfiguration {
        let topic = self.or("KAFKA_TOPIC", "link-updates");
        KafkaConfiguration {
            brokers: self.or("KAFKA_BROKERS", "localhost:9092"),
            dlq_topic: self.or("KAFKA_DLQ_TOPIC", &format!("{topic}-dlq")),
            consumer_group: self.or("KAFKA_CONSUMER_GROUP", "link-tracker-bot"),
            topic,
        }
    }

    fn status_codes(&self) -> Result<Vec<u16>, ConfigurationError> {
        let raw = self.or("RETRY_STATUS_CODES", "500,502,503,504");
        raw.split(',')
            .map(str::trim)
            .filter(|code| !code.is_empty())
            .map(|code| {
                code.parse().map_err(|_| ConfigurationError::Invalid {
                    name: "RETRY_STATUS_CODES",
                    value: raw.clone(),
                })
            })
            .collect()
    }
}

impl ScrapperConfiguration {
    pub fn from_env() -> Result<Self, ConfigurationError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigurationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };

        let daily_hour: u32 = vars.parsed("DAILY_RUN_HOUR", 10)?;
        if daily_hour > 23 {
            return Err(ConfigurationError::Invalid {
                name: "DAILY_RUN_HOUR",
                value: daily_hour.to_string(),
            });
        }

        Ok(Self {
            database_path: vars.required("DATABASE_PATH")?,
            database_max_connections: vars.parsed("DATABASE_MAX_CONNECTIONS", 8)?,
            listen_addr: vars.or("SCRAPPER_ADDR", "0.0.0.0:8081"),
            bot_url: vars.or("BOT_URL", "http://localhost:8080"),
            github_api_url: vars.or("GITHUB_API_URL", "https://api.github.com"),
            github_token: vars.optional("GITHUB_TOKEN"),
            stackoverflow_api_url: vars.or("STACKOVERFLOW_API_URL", "https://api.stackexchange.com/2.3"),
            stackoverflow_key: vars.optional("STACKOVERFLOW_KEY"),
            transport: vars.transport()?,
            kafka: vars.kafka(),
            resilience: ResilienceConfiguration {
                timeout: Duration::from_secs(vars.parsed("HTTP_TIMEOUT_SECS", 10)?),
                max_attempts: vars.parsed("RETRY_MAX_ATTEMPTS", 3)?,
                retry_delay: Duration::from_millis(vars.parsed("RETRY_DELAY_MS", 1000)?),
                retryable_statuses: vars.status_codes()?,
                failure_threshold: vars.parsed("BREAKER_FAILURE_THRESHOLD", 5)?,
                reset_timeout: Duration::from_secs(vars.parsed("BREAKER_RESET_SECS", 30)?),
            },
            schedule: ScheduleConfiguration {
                batch_size: vars.parsed("UPDATER_BATCH_SIZE", 100)?,
                batch_interval: Duration::from_secs(vars.parsed("UPDATER_INTERVAL_SECS", 300)?),
                daily_hour,
            },
        })
    }
}

impl BotConfiguration {
    pub fn from_env() -> Result<Self, ConfigurationError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigurationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };
        Ok(Self {
            teloxide_token: vars.required("TELOXIDE_TOKEN")?,
            listen_addr: vars.or("BOT_ADDR", "0.0.0.0:8080"),
            scrapper_url: vars.or("SCRAPPER_URL", "http://localhost:8081"),
            transport: vars.transport()?,
            kafka: vars.kafka(),
        })
    }
}
