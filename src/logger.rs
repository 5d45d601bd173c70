use chrono::Local;
use env_logger::Builder;
use log::LevelFilter;
use std::io::Write;

/// Library and binary targets follow `LOG_LEVEL`; dependencies stay at info.
const TARGETS: [&str; 3] = ["link_tracker", "scrapper", "bot"];
const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogSettings {
    pub level: LevelFilter,
    pub debug: bool,
}

impl LogSettings {
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            level: lookup("LOG_LEVEL")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(LevelFilter::Info),
            debug: lookup("LOG_DEBUG")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(false),
        }
    }
}

fn builder(settings: LogSettings) -> Builder {
    let mut builder = Builder::new();
    if settings.debug {
        builder.format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] - {}:{} - {}",
                Local::now().format(TIME_FORMAT),
                record.level(),
                record.file().unwrap_or("?"),
                record.line().unwrap_or(0),
                record.args()
            )
        });
    } else {
        builder.format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] - {}",
                Local::now().format(TIME_FORMAT),
                record.level(),
                record.args()
            )
        });
    }
    for target in TARGETS {
        builder.filter(Some(target), settings.level);
    }
    builder.filter(None, LevelFilter::Info);
    builder
}

pub fn init_from_environment() {
    let settings = LogSettings::from_lookup(|name| std::env::var(name).ok());
    if let Err(e) = builder(settings).try_init() {
        eprintln!("Logger already initialized: {e}");
        return;
    }

    if settings.debug {
        log::debug!("Debug logger initialized at {}", settings.level);
    } else {
        log::info!("Logger initialized at {}", settings.level);
    }
}
