use std::sync::Arc;

use link_tracker::clients::Clients;
use link_tracker::configuration::ScrapperConfiguration;
use link_tracker::db::{self, Storage};
use link_tracker::notifier::Notifier;
use link_tracker::scheduler::Scheduler;
use link_tracker::updater::Updater;
use link_tracker::{api, logger, transport};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("Starting link tracker scrapper");

    if cfg!(debug_assertions) {
        println!("Debug mode - loading .env file.");
        if let Err(e) = dotenvy::dotenv() {
            println!("No .env file loaded: {e}");
        }
    }
    logger::init_from_environment();

    log::debug!("Loading configuration");
    let config = ScrapperConfiguration::from_env()?;

    log::debug!("Initializing database");
    let pool = db::initialize_db(&config).await?;
    let storage = Storage::new(pool);

    let clients = Clients::from_configuration(&config)?;
    let sender = transport::build_sender(config.transport, &config.bot_url, &config.kafka)?;

    let updater = Arc::new(Updater::new(
        storage.links(),
        clients.clone(),
        config.schedule.batch_size,
        config.schedule.daily_hour,
    ));
    let notifier = Arc::new(Notifier::new(
        storage.chats(),
        storage.links(),
        clients,
        sender,
        config.schedule.daily_hour,
    ));
    let mut scheduler = Scheduler::new(updater, notifier, config.schedule.clone());
    scheduler.start();

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    log::info!("Scrapper API listening on http://{}", config.listen_addr);
    let served = axum::serve(listener, api::router(storage))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    scheduler.stop().await;
    served?;
    log::info!("Scrapper stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for shutdown signal: {e}");
        return;
    }
    log::info!("Shutdown requested");
}
