use std::sync::Arc;

use link_tracker::bot::{self, TelegramMessenger};
use link_tracker::configuration::BotConfiguration;
use link_tracker::logger;
use link_tracker::scrapper_client::{ScrapperApi, ScrapperClient};
use link_tracker::transport::{ChatMessenger, UpdateReceiver};
use teloxide::Bot;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("Starting link tracker bot");

    if cfg!(debug_assertions) {
        println!("Debug mode - loading .env file.");
        if let Err(e) = dotenvy::dotenv() {
            println!("No .env file loaded: {e}");
        }
    }
    logger::init_from_environment();

    log::debug!("Loading configuration");
    let config = BotConfiguration::from_env()?;

    let telegram = Bot::new(config.teloxide_token.clone());
    let api: Arc<dyn ScrapperApi> = Arc::new(ScrapperClient::new(&config.scrapper_url)?);
    let messenger: Arc<dyn ChatMessenger> = Arc::new(TelegramMessenger::new(telegram.clone()));
    let receiver = UpdateReceiver::from_configuration(&config, messenger)?;
    log::info!("Receiving updates over {}", config.transport);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut receiver_task = tokio::spawn(receiver.run(shutdown_rx.clone()));
    let dispatcher_task = tokio::spawn(bot::run(telegram, api, shutdown_rx));

    let early_exit = tokio::select! {
        _ = shutdown_signal() => None,
        finished = &mut receiver_task => {
            log::error!("Update receiver exited, shutting down");
            Some(finished)
        }
    };

    let _ = shutdown_tx.send(true);
    let received = match early_exit {
        Some(finished) => finished,
        None => receiver_task.await,
    };
    dispatcher_task.await?;
    received??;

    log::info!("Bot stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for shutdown signal: {e}");
        return;
    }
    log::info!("Shutdown requested");
}
