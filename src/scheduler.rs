use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Days, Local, NaiveDate, TimeZone, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::configuration::ScheduleConfiguration;
use crate::notifier::Notifier;
use crate::updater::Updater;

pub(crate) fn worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// `date` at `hour`:00 in `tz`. Inside a DST gap the hour is read as UTC.
fn at_hour<Tz: TimeZone>(tz: &Tz, date: NaiveDate, hour: u32) -> DateTime<Utc> {
    let naive = date.and_hms_opt(hour.min(23), 0, 0).unwrap_or_default();
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
}

/// Yesterday at `hour`:00 in `now`'s zone. Updates strictly after it are new.
pub fn activity_cutoff<Tz: TimeZone>(now: &DateTime<Tz>, hour: u32) -> DateTime<Utc> {
    let today = now.date_naive();
    let yesterday = today.checked_sub_days(Days::new(1)).unwrap_or(today);
    at_hour(&now.timezone(), yesterday, hour)
}

/// The first `hour`:00 strictly after `now`, in `now`'s zone.
pub fn next_daily_run<Tz: TimeZone>(now: &DateTime<Tz>, hour: u32) -> DateTime<Utc> {
    let today = now.date_naive();
    let candidate = at_hour(&now.timezone(), today, hour);
    if candidate > now.with_timezone(&Utc) {
        return candidate;
    }
    let tomorrow = today.checked_add_days(Days::new(1)).unwrap_or(today);
    at_hour(&now.timezone(), tomorrow, hour)
}

/// Full sweep over every link followed by notification.
pub async fn run_daily(updater: &Updater, notifier: &Notifier) {
    log::info!("Starting daily update and notification");
    match updater.sweep().await {
        Ok(report) => log::info!("Daily sweep polled {} links, {} active", report.polled, report.activated),
        Err(e) => log::error!("Daily sweep failed: {e}"),
    }
    match notifier.run().await {
        Ok(report) => log::info!(
            "Daily notification delivered {} messages, cleared {} stale flags",
            report.delivered,
            report.cleared
        ),
        Err(e) => log::error!("Daily notification failed: {e}"),
    }
}

/// Drives the periodic batch loop and the daily job of the scrapper.
pub struct Scheduler {
    updater: Arc<Updater>,
    notifier: Arc<Notifier>,
    schedule: ScheduleConfiguration,
    shutdown: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(updater: Arc<Updater>, notifier: Arc<Notifier>, schedule: ScheduleConfiguration) -> Self {
        Self {
            updater,
            notifier,
            schedule,
            shutdown: None,
            tasks: Vec::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.shutdown.is_some()
    }

    pub fn start(&mut self) {
        if self.is_running() {
            log::warn!("Scheduler already running");
            return;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        log::info!(
            "Starting scheduler: batch every {:?}, daily run at {:02}:00",
            self.schedule.batch_interval,
            self.schedule.daily_hour
        );
        self.tasks.push(tokio::spawn(batch_loop(
            self.updater.clone(),
            self.schedule.batch_interval,
            shutdown_rx.clone(),
        )));
        self.tasks.push(tokio::spawn(daily_loop(
            self.updater.clone(),
            self.notifier.clone(),
            self.schedule.daily_hour,
            shutdown_rx,
        )));
        self.shutdown = Some(shutdown_tx);
    }

    /// Signals both loops and waits for them. Work in flight is abandoned at
    /// its next await point.
    pub async fn stop(&mut self) {
        let Some(shutdown) = self.shutdown.take() else {
            return;
        };
        log::info!("Stopping scheduler");
        let _ = shutdown.send(true);
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                log::error!("Scheduler task failed: {e}");
            }
        }
    }
}

async fn batch_loop(updater: Arc<Updater>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            result = updater.run_iteration() => {
                if let Err(e) = result {
                    log::error!("Updater iteration failed: {e}");
                }
            }
        }
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = sleep(interval) => {}
        }
    }
    log::debug!("Batch loop stopped");
}

async fn daily_loop(
    updater: Arc<Updater>,
    notifier: Arc<Notifier>,
    hour: u32,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let now = Local::now();
        let next = next_daily_run(&now, hour);
        let wait = (next - now.with_timezone(&Utc)).to_std().unwrap_or_default();
        log::debug!("Next daily run at {next}");

        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = sleep(wait) => {}
        }
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = run_daily(&updater, &notifier) => {}
        }
    }
    log::debug!("Daily loop stopped");
}
