use std::sync::Arc;

use async_trait::async_trait;
use teloxide::dispatching::{Dispatcher, UpdateFilterExt};
use teloxide::dptree;
use teloxide::prelude::*;
use teloxide::types::ParseMode;
use teloxide::utils::command::BotCommands;
use tokio::sync::watch;

use crate::api::AddLinkRequest;
use crate::scrapper_client::{ScrapperApi, ScrapperError};
use crate::transport::{BoxError, ChatMessenger};
use crate::utils::html_escape;

const TRACK_USAGE: &str = "Usage: /track &lt;url&gt; [tag ...] [key:value ...]";

#[derive(BotCommands, Clone, Debug, PartialEq)]
#[command(rename_rule = "lowercase", description = "These commands are supported:")]
pub enum Command {
    #[command(description = "register this chat")]
    Start,
    #[command(description = "unregister this chat and forget its links")]
    Stop,
    #[command(description = "track a link: <url> [tag ...] [key:value ...]")]
    Track(String),
    #[command(description = "stop tracking a link: <url>")]
    Untrack(String),
    #[command(description = "list tracked links")]
    List,
    #[command(description = "display this help message")]
    Help,
}

/// Sends delivered updates to Telegram chats.
pub struct TelegramMessenger {
    bot: Bot,
}

impl TelegramMessenger {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl ChatMessenger for TelegramMessenger {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), BoxError> {
        self.bot
            .send_message(ChatId(chat_id), text)
            .parse_mode(ParseMode::Html)
            .await?;
        Ok(())
    }
}

/// `<url> [tag ...] [key:value ...]`: words with a colon are filters.
pub(crate) fn parse_track_args(args: &str) -> Option<AddLinkRequest> {
    let mut words = args.split_whitespace();
    let link = words.next()?.to_string();
    let (filters, tags): (Vec<String>, Vec<String>) = words.map(str::to_string).partition(|w| w.contains(':'));
    Some(AddLinkRequest { link, tags, filters })
}

pub(crate) async fn handle_start(api: &dyn ScrapperApi, chat_id: i64) -> String {
    match api.register_chat(chat_id).await {
        Ok(()) => "Welcome! Track a link with /track &lt;url&gt;, see /help for more.".to_string(),
        Err(ScrapperError::Conflict(_)) => "This chat is already registered.".to_string(),
        Err(e) => format!("Failed to register chat: {}", html_escape(&e.to_string())),
    }
}

pub(crate) async fn handle_stop(api: &dyn ScrapperApi, chat_id: i64) -> String {
    match api.delete_chat(chat_id).await {
        Ok(()) => "Chat unregistered, all tracked links were dropped.".to_string(),
        Err(ScrapperError::NotFound(_)) => "This chat is not registered.".to_string(),
        Err(e) => format!("Failed to unregister chat: {}", html_escape(&e.to_string())),
    }
}

pub(crate) async fn handle_track(api: &dyn ScrapperApi, chat_id: i64, args: &str) -> String {
    let Some(request) = parse_track_args(args) else {
        return TRACK_USAGE.to_string();
    };
    let url = html_escape(&request.link).into_owned();

    match api.add_link(chat_id, &request).await {
        Ok(_) => format!("Now tracking {url}."),
        Err(ScrapperError::Conflict(_)) => format!("{url} is already tracked."),
        Err(ScrapperError::NotFound(_)) => "This chat is not registered, send /start first.".to_string(),
        Err(ScrapperError::Status { status, description }) if status.is_client_error() => {
            format!("Cannot track {url}: {}", html_escape(&description))
        }
        Err(e) => format!("Failed to track link: {}", html_escape(&e.to_string())),
    }
}

pub(crate) async fn handle_untrack(api: &dyn ScrapperApi, chat_id: i64, args: &str) -> String {
    let url = args.trim();
    if url.is_empty() {
        return "Usage: /untrack &lt;url&gt;".to_string();
    }
    let escaped = html_escape(url);

    match api.remove_link(chat_id, url).await {
        Ok(_) => format!("Stopped tracking {escaped}."),
        Err(ScrapperError::NotFound(_)) => format!("{escaped} is not tracked."),
        Err(e) => format!("Failed to untrack link: {}", html_escape(&e.to_string())),
    }
}

pub(crate) async fn handle_list(api: &dyn ScrapperApi, chat_id: i64) -> String {
    let listing = match api.list_links(chat_id).await {
        Ok(listing) => listing,
        Err(ScrapperError::NotFound(_)) => return "This chat is not registered, send /start first.".to_string(),
        Err(e) => return format!("Failed to list links: {}", html_escape(&e.to_string())),
    };
    if listing.links.is_empty() {
        return "No links tracked yet.".to_string();
    }

    let lines: Vec<String> = listing
        .links
        .iter()
        .map(|link| {
            let url = html_escape(&link.url);
            let mut line = format!("- <a href=\"{url}\">{url}</a>");
            if !link.tags.is_empty() {
                line.push_str(&format!(" [{}]", html_escape(&link.tags.join(", "))));
            }
            line
        })
        .collect();
    format!("Tracked links ({}):\n{}", listing.size, lines.join("\n"))
}

pub async fn run(bot: Bot, api: Arc<dyn ScrapperApi>, mut shutdown: watch::Receiver<bool>) {
    if let Err(e) = bot.set_my_commands(Command::bot_commands()).await {
        log::warn!("Failed to set Telegram bot commands: {}", e);
    }

    let handler = Update::filter_message()
        .branch(dptree::entry().filter_command::<Command>().endpoint(answer))
        .branch(dptree::endpoint(fallback));

    let mut dispatcher = Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![api])
        .build();

    let token = dispatcher.shutdown_token();
    tokio::spawn(async move {
        let _ = shutdown.changed().await;
        match token.shutdown() {
            Ok(stopped) => stopped.await,
            Err(e) => log::warn!("Dispatcher was not running: {e}"),
        }
    });

    dispatcher.dispatch().await;
    log::info!("Dispatcher stopped");
}

async fn answer(bot: Bot, msg: Message, cmd: Command, api: Arc<dyn ScrapperApi>) -> ResponseResult<()> {
    let chat_id = msg.chat.id.0;
    log::debug!("Chat {chat_id} sent {cmd:?}");

    let reply = match cmd {
        Command::Start => handle_start(api.as_ref(), chat_id).await,
        Command::Stop => handle_stop(api.as_ref(), chat_id).await,
        Command::Track(args) => handle_track(api.as_ref(), chat_id, &args).await,
        Command::Untrack(args) => handle_untrack(api.as_ref(), chat_id, &args).await,
        Command::List => handle_list(api.as_ref(), chat_id).await,
        Command::Help => html_escape(&Command::descriptions().to_string()).into_owned(),
    };

    bot.send_message(msg.chat.id, reply)
        .parse_mode(ParseMode::Html)
        .await?;
    Ok(())
}

async fn fallback(bot: Bot, msg: Message) -> ResponseResult<()> {
    if let Some(text) = msg.text() {
        if text.starts_with('/') {
            bot.send_message(msg.chat.id, Command::descriptions().to_string())
                .await?;
        } else {
            bot.send_message(
                msg.chat.id,
                format!(
                    "Sorry, I only work with commands. \n\n{}",
                    Command::descriptions()
                ),
            )
            .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use reqwest::StatusCode;

    use super::*;
    use crate::api::{LinkResponse, ListLinksResponse};

    /// Scrapper stand-in with the same conflict and not-found rules.
    #[derive(Default)]
    struct FakeScrapper {
        chats: Mutex<HashSet<i64>>,
        links: Mutex<Vec<(i64, LinkResponse)>>,
        down: bool,
    }

    impl FakeScrapper {
        fn outage() -> ScrapperError {
            ScrapperError::Status {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                description: "internal error".into(),
            }
        }

        fn registered(&self, chat_id: i64) -> Result<(), ScrapperError> {
            if self.down {
                return Err(Self::outage());
            }
            if !self.chats.lock().unwrap().contains(&chat_id) {
                return Err(ScrapperError::NotFound(format!("chat {chat_id} is not registered")));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ScrapperApi for FakeScrapper {
        async fn register_chat(&self, chat_id: i64) -> Result<(), ScrapperError> {
            if self.down {
                return Err(Self::outage());
            }
            if !self.chats.lock().unwrap().insert(chat_id) {
                return Err(ScrapperError::Conflict(format!("chat {chat_id} is already registered")));
            }
            Ok(())
        }

        async fn delete_chat(&self, chat_id: i64) -> Result<(), ScrapperError> {
            self.registered(chat_id)?;
            self.chats.lock().unwrap().remove(&chat_id);
            self.links.lock().unwrap().retain(|(c, _)| *c != chat_id);
            Ok(())
        }

        async fn add_link(&self, chat_id: i64, request: &AddLinkRequest) -> Result<LinkResponse, ScrapperError> {
            self.registered(chat_id)?;
            if !request.link.starts_with("https://github.com/") {
                return Err(ScrapperError::Status {
                    status: StatusCode::BAD_REQUEST,
                    description: "no client handles host".into(),
                });
            }
            let mut links = self.links.lock().unwrap();
            if links.iter().any(|(c, l)| *c == chat_id && l.url == request.link) {
                return Err(ScrapperError::Conflict(format!("link {} is already tracked", request.link)));
            }
            let link = LinkResponse {
                id: links.len() as i64 + 1,
                url: request.link.clone(),
                tags: request.tags.clone(),
                filters: request.filters.clone(),
            };
            links.push((chat_id, link.clone()));
            Ok(link)
        }

        async fn remove_link(&self, chat_id: i64, url: &str) -> Result<LinkResponse, ScrapperError> {
            self.registered(chat_id)?;
            let mut links = self.links.lock().unwrap();
            let position = links
                .iter()
                .position(|(c, l)| *c == chat_id && l.url == url)
                .ok_or_else(|| ScrapperError::NotFound(format!("link {url} is not tracked")))?;
            Ok(links.remove(position).1)
        }

        async fn list_links(&self, chat_id: i64) -> Result<ListLinksResponse, ScrapperError> {
            self.registered(chat_id)?;
            let links: Vec<LinkResponse> = self
                .links
                .lock()
                .unwrap()
                .iter()
                .filter(|(c, _)| *c == chat_id)
                .map(|(_, l)| l.clone())
                .collect();
            Ok(ListLinksResponse {
                size: links.len(),
                links,
            })
        }
    }

    #[test]
    fn splits_track_arguments_into_tags_and_filters() {
        let request = parse_track_args("https://github.com/o/r work rust user:bot lang:en").unwrap();
        assert_eq!(request.link, "https://github.com/o/r");
        assert_eq!(request.tags, vec!["work".to_string(), "rust".to_string()]);
        assert_eq!(request.filters, vec!["user:bot".to_string(), "lang:en".to_string()]);

        assert!(parse_track_args("   ").is_none());
    }

    #[test]
    fn parses_commands() {
        assert_eq!(
            Command::parse("/track https://github.com/o/r work", "bot").unwrap(),
            Command::Track("https://github.com/o/r work".into())
        );
        assert_eq!(Command::parse("/list", "bot").unwrap(), Command::List);
    }

    #[tokio::test]
    async fn start_and_stop_report_registration_state() {
        let api = FakeScrapper::default();

        assert!(handle_start(&api, 1).await.starts_with("Welcome!"));
        assert_eq!(handle_start(&api, 1).await, "This chat is already registered.");
        assert!(handle_stop(&api, 1).await.starts_with("Chat unregistered"));
        assert_eq!(handle_stop(&api, 1).await, "This chat is not registered.");
    }

    #[tokio::test]
    async fn track_untrack_and_list() {
        let api = FakeScrapper::default();
        handle_start(&api, 1).await;

        assert_eq!(handle_track(&api, 1, "").await, TRACK_USAGE);
        assert_eq!(
            handle_track(&api, 1, "https://github.com/o/r work").await,
            "Now tracking https://github.com/o/r."
        );
        assert_eq!(
            handle_track(&api, 1, "https://github.com/o/r").await,
            "https://github.com/o/r is already tracked."
        );
        assert!(handle_track(&api, 1, "https://gitlab.com/o/r").await.starts_with("Cannot track"));

        let listing = handle_list(&api, 1).await;
        assert_eq!(
            listing,
            "Tracked links (1):\n- <a href=\"https://github.com/o/r\">https://github.com/o/r</a> [work]"
        );

        assert_eq!(
            handle_untrack(&api, 1, "https://github.com/o/r").await,
            "Stopped tracking https://github.com/o/r."
        );
        assert_eq!(
            handle_untrack(&api, 1, "https://github.com/o/r").await,
            "https://github.com/o/r is not tracked."
        );
        assert_eq!(handle_list(&api, 1).await, "No links tracked yet.");
    }

    #[tokio::test]
    async fn unregistered_chat_and_outage_replies() {
        let api = FakeScrapper::default();
        assert_eq!(
            handle_track(&api, 9, "https://github.com/o/r").await,
            "This chat is not registered, send /start first."
        );

        let down = FakeScrapper {
            down: true,
            ..FakeScrapper::default()
        };
        assert!(handle_list(&down, 9).await.starts_with("Failed to list links"));
        assert!(handle_start(&down, 9).await.starts_with("Failed to register chat"));
    }
}
