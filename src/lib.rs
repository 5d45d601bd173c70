pub mod api;
pub mod bot;
pub mod chats;
pub mod clients;
pub mod configuration;
pub mod db;
pub mod links;
pub mod logger;
pub mod notifier;
pub mod scheduler;
pub mod scrapper_client;
pub mod transport;
pub mod updater;
pub mod utils;
