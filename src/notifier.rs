use std::sync::Arc;

use chrono::{DateTime, Local, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::chats::repository::ChatRepository;
use crate::clients::{ClientError, Clients, Update};
use crate::db::StoreError;
use crate::links::Link;
use crate::links::repository::LinkRepository;
use crate::scheduler::{activity_cutoff, worker_count};
use crate::transport::{SendError, UpdateSender};

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("upstream returned no updates for {0}")]
    NoUpdates(String),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NotifyReport {
    pub chats: usize,
    pub delivered: usize,
    /// Active links whose updates were all at or before the cutoff: already
    /// delivered by an earlier run, so the flag is cleared without a message.
    pub cleared: usize,
    pub failed: usize,
}

impl NotifyReport {
    fn merge(&mut self, other: NotifyReport) {
        self.chats += other.chats;
        self.delivered += other.delivered;
        self.cleared += other.cleared;
        self.failed += other.failed;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Sent,
    AlreadySeen,
}

/// One block per update after `cutoff`, oldest first, blocks separated by a
/// blank line. `None` when nothing is newer than the cutoff.
pub fn render_updates(updates: &[Update], cutoff: DateTime<Utc>) -> Option<String> {
    let mut fresh: Vec<&Update> = updates.iter().filter(|u| u.created_at > cutoff).collect();
    if fresh.is_empty() {
        return None;
    }
    fresh.sort_by_key(|u| u.created_at);

    let blocks: Vec<String> = fresh
        .into_iter()
        .map(|u| {
            format!(
                "New {}\nAuthor: {}\nDate: {}\nView: {}",
                u.title,
                u.author,
                u.created_at.format("%Y-%m-%d %H:%M UTC"),
                u.body
            )
        })
        .collect();
    Some(blocks.join("\n\n"))
}

/// Turns active links into delivered messages and clears their flag.
#[derive(Clone)]
pub struct Notifier {
    chats: Arc<dyn ChatRepository>,
    links: Arc<dyn LinkRepository>,
    clients: Clients,
    sender: Arc<dyn UpdateSender>,
    concurrency: usize,
    daily_hour: u32,
}

impl Notifier {
    pub fn new(
        chats: Arc<dyn ChatRepository>,
        links: Arc<dyn LinkRepository>,
        clients: Clients,
        sender: Arc<dyn UpdateSender>,
        daily_hour: u32,
    ) -> Self {
        Self {
            chats,
            links,
            clients,
            sender,
            concurrency: worker_count(),
            daily_hour,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub async fn run(&self) -> Result<NotifyReport, StoreError> {
        let cutoff = activity_cutoff(&Local::now(), self.daily_hour);
        self.run_with_cutoff(cutoff).await
    }

    /// Active links are read for every chat before any flag is cleared, so a
    /// link shared by several chats reaches all of them.
    pub async fn run_with_cutoff(&self, cutoff: DateTime<Utc>) -> Result<NotifyReport, StoreError> {
        let chat_ids = self.chats.get_chat_ids().await?;
        let mut report = NotifyReport::default();

        let mut pending = Vec::new();
        for chat_id in chat_ids {
            match self.links.get_links_with_chat_active(chat_id).await {
                Ok(links) if links.is_empty() => {}
                Ok(links) => pending.push((chat_id, links)),
                Err(e) => {
                    report.failed += 1;
                    log::warn!("Notifier failed to read active links of chat {chat_id}: {e}");
                }
            }
        }
        if pending.is_empty() {
            log::info!("No active links to notify about");
            return Ok(report);
        }

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut chats = JoinSet::new();
        for (chat_id, links) in pending {
            let notifier = self.clone();
            let semaphore = semaphore.clone();
            chats.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return NotifyReport::default();
                };
                notifier.notify_chat(chat_id, links, cutoff).await
            });
        }

        while let Some(joined) = chats.join_next().await {
            match joined {
                Ok(chat_report) => report.merge(chat_report),
                Err(e) => log::error!("Notifier task panicked: {e}"),
            }
        }

        log::info!(
            "Notified {} chats: {} delivered, {} already seen, {} failed",
            report.chats,
            report.delivered,
            report.cleared,
            report.failed
        );
        Ok(report)
    }

    async fn notify_chat(&self, chat_id: i64, links: Vec<Link>, cutoff: DateTime<Utc>) -> NotifyReport {
        let mut report = NotifyReport {
            chats: 1,
            ..NotifyReport::default()
        };
        for link in links {
            match self.notify_link(chat_id, &link, cutoff).await {
                Ok(Outcome::Sent) => report.delivered += 1,
                Ok(Outcome::AlreadySeen) => report.cleared += 1,
                Err(e) => {
                    report.failed += 1;
                    log::warn!("Failed to notify chat {chat_id} about {}: {e}", link.url);
                }
            }
        }
        report
    }

    async fn notify_link(&self, chat_id: i64, link: &Link, cutoff: DateTime<Utc>) -> Result<Outcome, NotifyError> {
        let updates = self.clients.retrieve_updates(&link.url).await?;
        if updates.is_empty() {
            return Err(NotifyError::NoUpdates(link.url.clone()));
        }

        let Some(description) = render_updates(&updates, cutoff) else {
            self.links.update_activity(link.id, false).await?;
            log::debug!("Nothing after {cutoff} for {}, clearing its flag", link.url);
            return Ok(Outcome::AlreadySeen);
        };

        self.sender.send(chat_id, &link.url, &description).await?;
        self.links.update_activity(link.id, false).await?;
        log::debug!("Chat {chat_id} notified about {}", link.url);
        Ok(Outcome::Sent)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::chats::repository::SqliteChatRepository;
    use crate::db::Transactor;
    use crate::db::test_support::memory_pool;
    use crate::links::repository::SqliteLinkRepository;
    use crate::updater::Updater;
    use crate::updater::test_support::StubClient;

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<(i64, String, String)>>,
        failing: Vec<i64>,
    }

    #[async_trait]
    impl UpdateSender for RecordingSender {
        async fn send(&self, chat_id: i64, url: &str, description: &str) -> Result<(), SendError> {
            if self.failing.contains(&chat_id) {
                return Err(SendError::Rejected {
                    status: reqwest::StatusCode::BAD_GATEWAY,
                    body: "blocked".into(),
                });
            }
            self.sent
                .lock()
                .unwrap()
                .push((chat_id, url.to_string(), description.to_string()));
            Ok(())
        }
    }

    fn update(title: &str, at: DateTime<Utc>) -> Update {
        Update {
            title: title.into(),
            author: "octocat".into(),
            created_at: at,
            body: "details".into(),
        }
    }

    struct Fixture {
        chats: Arc<SqliteChatRepository>,
        links: Arc<SqliteLinkRepository>,
    }

    async fn setup() -> Fixture {
        let transactor = Transactor::new(memory_pool().await);
        Fixture {
            chats: Arc::new(SqliteChatRepository::new(transactor.clone())),
            links: Arc::new(SqliteLinkRepository::new(transactor)),
        }
    }

    fn notifier(f: &Fixture, client: StubClient, sender: Arc<RecordingSender>) -> Notifier {
        let clients = Clients::new(Arc::new(client), Arc::new(StubClient::default()));
        Notifier::new(f.chats.clone(), f.links.clone(), clients, sender, 10).with_concurrency(2)
    }

    #[test]
    fn renders_blocks_for_fresh_updates_only() {
        let cutoff = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap();
        let updates = vec![
            update("issue \"late\"", Utc.with_ymd_and_hms(2025, 3, 2, 9, 5, 0).unwrap()),
            update("issue \"old\"", Utc.with_ymd_and_hms(2025, 2, 20, 0, 0, 0).unwrap()),
            update("pull request \"early\"", Utc.with_ymd_and_hms(2025, 3, 1, 11, 0, 0).unwrap()),
        ];

        let text = render_updates(&updates, cutoff).unwrap();

        assert_eq!(
            text,
            "New pull request \"early\"\nAuthor: octocat\nDate: 2025-03-01 11:00 UTC\nView: details\n\n\
             New issue \"late\"\nAuthor: octocat\nDate: 2025-03-02 09:05 UTC\nView: details"
        );
    }

    #[test]
    fn nothing_after_cutoff_renders_nothing() {
        let cutoff = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap();
        let updates = vec![
            update("answer", Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()),
            update("comment", cutoff),
        ];

        assert_eq!(render_updates(&updates, cutoff), None);
        assert_eq!(render_updates(&[], cutoff), None);
    }

    #[tokio::test]
    async fn delivers_active_links_and_clears_flag() {
        let f = setup().await;
        f.chats.add_chat(1).await.unwrap();
        let active = f.links.add_link(1, "https://github.com/o/active", &[], &[]).await.unwrap();
        f.links.add_link(1, "https://github.com/o/quiet", &[], &[]).await.unwrap();
        f.links.update_activity(active, true).await.unwrap();

        let now = Utc::now();
        let client = StubClient::with(vec![("https://github.com/o/active", vec![update("issue \"x\"", now)])]);
        let sender = Arc::new(RecordingSender::default());

        let report = notifier(&f, client, sender.clone())
            .run_with_cutoff(now - Duration::hours(1))
            .await
            .unwrap();

        assert_eq!(report, NotifyReport { chats: 1, delivered: 1, cleared: 0, failed: 0 });
        let sent = sender.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 1);
        assert_eq!(sent[0].1, "https://github.com/o/active");
        assert!(sent[0].2.starts_with("New issue \"x\"\nAuthor: octocat\n"));
        assert!(f.links.get_links_with_chat_active(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn shared_link_reaches_every_subscribed_chat() {
        let f = setup().await;
        let url = "https://github.com/o/shared";
        let mut link_id = 0;
        for chat in 1..=3 {
            f.chats.add_chat(chat).await.unwrap();
            link_id = f.links.add_link(chat, url, &[], &[]).await.unwrap();
        }
        f.links.update_activity(link_id, true).await.unwrap();

        let now = Utc::now();
        let client = StubClient::with(vec![(url, vec![update("issue \"x\"", now)])]);
        let sender = Arc::new(RecordingSender::default());

        let report = notifier(&f, client, sender.clone())
            .run_with_cutoff(now - Duration::hours(1))
            .await
            .unwrap();

        assert_eq!(report.delivered, 3);
        let mut chats: Vec<i64> = sender.sent.lock().unwrap().iter().map(|(c, _, _)| *c).collect();
        chats.sort();
        assert_eq!(chats, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn failed_send_keeps_link_active() {
        let f = setup().await;
        f.chats.add_chat(1).await.unwrap();
        f.chats.add_chat(2).await.unwrap();
        let a = f.links.add_link(1, "https://github.com/o/a", &[], &[]).await.unwrap();
        let b = f.links.add_link(2, "https://github.com/o/b", &[], &[]).await.unwrap();
        f.links.update_activity(a, true).await.unwrap();
        f.links.update_activity(b, true).await.unwrap();

        let now = Utc::now();
        let client = StubClient::with(vec![
            ("https://github.com/o/a", vec![update("issue \"a\"", now)]),
            ("https://github.com/o/b", vec![update("issue \"b\"", now)]),
        ]);
        let sender = Arc::new(RecordingSender {
            failing: vec![1],
            ..RecordingSender::default()
        });

        let report = notifier(&f, client, sender.clone())
            .run_with_cutoff(now - Duration::hours(1))
            .await
            .unwrap();

        assert_eq!(report, NotifyReport { chats: 2, delivered: 1, cleared: 0, failed: 1 });
        assert_eq!(f.links.get_links_with_chat_active(1).await.unwrap().len(), 1);
        assert!(f.links.get_links_with_chat_active(2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_already_delivered_is_not_sent_again_the_next_day() {
        let f = setup().await;
        f.chats.add_chat(1).await.unwrap();
        let url = "https://github.com/o/daily";
        f.links.add_link(1, url, &[], &[]).await.unwrap();

        let day0 = Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap();
        let day1 = Utc.with_ymd_and_hms(2025, 3, 2, 10, 0, 0).unwrap();
        let github = Arc::new(StubClient::with(vec![(
            url,
            vec![update("issue \"x\"", Utc.with_ymd_and_hms(2025, 3, 2, 9, 0, 0).unwrap())],
        )]));
        let clients = Clients::new(github, Arc::new(StubClient::default()));
        let updater = Updater::new(f.links.clone(), clients.clone(), 10, 10);
        let sender = Arc::new(RecordingSender::default());
        let notifier = Notifier::new(f.chats.clone(), f.links.clone(), clients, sender.clone(), 10);

        // Day one: polled, delivered, then polled again with the same cutoff.
        updater.run_iteration_with_cutoff(day0).await.unwrap();
        let first = notifier.run_with_cutoff(day0).await.unwrap();
        updater.run_iteration_with_cutoff(day0).await.unwrap();
        assert_eq!(first.delivered, 1);
        assert_eq!(f.links.get_links_with_chat_active(1).await.unwrap().len(), 1);

        // Day two: the issue is older than the new cutoff.
        updater.run_iteration_with_cutoff(day1).await.unwrap();
        let second = notifier.run_with_cutoff(day1).await.unwrap();

        assert_eq!(second, NotifyReport { chats: 1, delivered: 0, cleared: 1, failed: 0 });
        assert_eq!(sender.sent.lock().unwrap().len(), 1);
        assert!(f.links.get_links_with_chat_active(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upstream_failure_or_empty_answer_keeps_link_active() {
        let f = setup().await;
        f.chats.add_chat(1).await.unwrap();
        let broken = f.links.add_link(1, "https://github.com/o/broken", &[], &[]).await.unwrap();
        let empty = f.links.add_link(1, "https://github.com/o/empty", &[], &[]).await.unwrap();
        f.links.update_activity(broken, true).await.unwrap();
        f.links.update_activity(empty, true).await.unwrap();

        let client = StubClient::with(vec![("https://github.com/o/empty", vec![])]);
        let sender = Arc::new(RecordingSender::default());

        let report = notifier(&f, client, sender.clone())
            .run_with_cutoff(Utc::now())
            .await
            .unwrap();

        assert_eq!(report.failed, 2);
        assert!(sender.sent.lock().unwrap().is_empty());
        assert_eq!(f.links.get_links_with_chat_active(1).await.unwrap().len(), 2);
    }
}
