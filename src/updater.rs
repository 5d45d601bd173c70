use std::sync::Arc;

use chrono::{DateTime, Local, Utc};
use tokio::task::JoinSet;

use crate::clients::{ClientError, Clients};
use crate::db::StoreError;
use crate::links::Link;
use crate::links::repository::LinkRepository;
use crate::scheduler::{activity_cutoff, worker_count};

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IterationReport {
    pub polled: usize,
    pub activated: usize,
    pub failed: usize,
}

impl IterationReport {
    fn merge(&mut self, other: IterationReport) {
        self.polled += other.polled;
        self.activated += other.activated;
        self.failed += other.failed;
    }
}

/// Polls tracked links in oldest-first batches and records whether they
/// have activity newer than the cutoff.
pub struct Updater {
    links: Arc<dyn LinkRepository>,
    clients: Clients,
    batch_size: u32,
    workers: usize,
    daily_hour: u32,
}

impl Updater {
    pub fn new(links: Arc<dyn LinkRepository>, clients: Clients, batch_size: u32, daily_hour: u32) -> Self {
        Self {
            links,
            clients,
            batch_size: batch_size.max(1),
            workers: worker_count(),
            daily_hour,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// One batch. Only a failure to read the batch aborts it; per-link
    /// failures are logged and counted.
    pub async fn run_iteration(&self) -> Result<IterationReport, StoreError> {
        let cutoff = activity_cutoff(&Local::now(), self.daily_hour);
        self.run_iteration_with_cutoff(cutoff).await
    }

    pub async fn run_iteration_with_cutoff(&self, cutoff: DateTime<Utc>) -> Result<IterationReport, StoreError> {
        let batch = self.links.get_batch(self.batch_size).await?;
        if batch.is_empty() {
            log::debug!("No links to poll");
            return Ok(IterationReport::default());
        }

        let slice_len = batch.len().div_ceil(self.workers);
        log::info!(
            "Polling {} links on {} workers (cutoff {cutoff})",
            batch.len(),
            batch.len().div_ceil(slice_len)
        );

        let mut workers = JoinSet::new();
        for slice in batch.chunks(slice_len) {
            let slice = slice.to_vec();
            let links = self.links.clone();
            let clients = self.clients.clone();
            workers.spawn(async move { poll_slice(links.as_ref(), &clients, slice, cutoff).await });
        }

        let mut report = IterationReport::default();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(slice_report) => report.merge(slice_report),
                Err(e) => log::error!("Updater worker panicked: {e}"),
            }
        }

        log::info!(
            "Polled {} links: {} active, {} failed",
            report.polled,
            report.activated,
            report.failed
        );
        Ok(report)
    }

    /// Polls every tracked link once, batch after batch.
    pub async fn sweep(&self) -> Result<IterationReport, StoreError> {
        let cutoff = activity_cutoff(&Local::now(), self.daily_hour);
        let total = usize::try_from(self.links.count_links().await?).unwrap_or(0);
        log::info!("Starting full sweep over {total} links");

        let mut report = IterationReport::default();
        while report.polled < total {
            let iteration = self.run_iteration_with_cutoff(cutoff).await?;
            if iteration.polled == 0 {
                break;
            }
            report.merge(iteration);
        }
        Ok(report)
    }
}

async fn poll_slice(
    links: &dyn LinkRepository,
    clients: &Clients,
    slice: Vec<Link>,
    cutoff: DateTime<Utc>,
) -> IterationReport {
    let mut report = IterationReport::default();
    for link in slice {
        report.polled += 1;
        match poll_link(links, clients, &link, cutoff).await {
            Ok(true) => report.activated += 1,
            Ok(false) => {}
            Err(e) => {
                report.failed += 1;
                log::warn!("Updater failed to poll {}: {}", link.url, e);
            }
        }
    }
    report
}

/// Fetches the link's updates, raises the activity flag when one is newer
/// than `cutoff`, and advances the freshness cursor whatever happened.
async fn poll_link(
    links: &dyn LinkRepository,
    clients: &Clients,
    link: &Link,
    cutoff: DateTime<Utc>,
) -> Result<bool, PollError> {
    let fetched = clients.retrieve_updates(&link.url).await;

    let active = match &fetched {
        Ok(updates) => updates.iter().any(|u| u.created_at > cutoff),
        Err(_) => false,
    };
    let flagged = if active {
        links.update_activity(link.id, true).await
    } else {
        Ok(())
    };
    let touched = links.touch_link(link.id).await;

    fetched?;
    flagged?;
    touched?;
    Ok(active)
}
