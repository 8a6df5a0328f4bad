//! Namespace Worker
//!
//! One worker per served namespace. It runs the change feed into a
//! bounded channel, classifies and reconciles events strictly in delivery
//! order, and re-runs snapshot feeds every poll interval. Failed events
//! get one more attempt after the pass that produced them, or after one
//! poll interval while a continuous feed is still running.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use dirsync_connector::entry::ChangeEvent;
use dirsync_connector::resilience::sleep_or_cancel;
use dirsync_connector::traits::{Directory, FeedMessage, MailStore};

use crate::classifier::EntryClassifier;
use crate::error::{FeedError, ReconcileError};
use crate::feed::ChangeFeed;
use crate::reconciler::{Outcome, Reconciler};
use crate::watermark::WatermarkCache;

/// Failed events kept for retry; the oldest is dropped beyond this.
pub const MAX_RETRY_QUEUE: usize = 1024;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Ignore the resume point and the sync cursor on the first pass.
    pub resync: bool,

    /// Delay between snapshot passes, and between retries of failed
    /// events during a continuous feed.
    pub poll_interval: Duration,

    /// Pause after a transport failure while reconciling.
    pub backoff: Duration,

    /// Capacity of the feed channel.
    pub channel_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            resync: false,
            poll_interval: Duration::from_secs(300),
            backoff: Duration::from_secs(10),
            channel_capacity: 256,
        }
    }
}

/// Counters for one worker lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub passes: u64,
    pub applied: u64,
    pub replays: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// Synchronizes one namespace.
pub struct NamespaceWorker {
    namespace: String,
    feed: Arc<ChangeFeed>,
    classifier: EntryClassifier,
    reconciler: Reconciler,
    cache: WatermarkCache,
    directory: Arc<dyn Directory>,
    store: Arc<dyn MailStore>,
    aliases: watch::Receiver<Vec<String>>,
    config: WorkerConfig,
    retry_queue: VecDeque<ChangeEvent>,
    stats: WorkerStats,
}

impl NamespaceWorker {
    /// Create a new worker.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        namespace: impl Into<String>,
        feed: ChangeFeed,
        classifier: EntryClassifier,
        reconciler: Reconciler,
        cache: WatermarkCache,
        directory: Arc<dyn Directory>,
        store: Arc<dyn MailStore>,
        aliases: watch::Receiver<Vec<String>>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            feed: Arc::new(feed),
            classifier,
            reconciler,
            cache,
            directory,
            store,
            aliases,
            config,
            retry_queue: VecDeque::new(),
            stats: WorkerStats::default(),
        }
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Namespace first, then its current aliases.
    #[must_use]
    pub fn domains(&self) -> Vec<String> {
        let mut domains = vec![self.namespace.clone()];
        domains.extend(
            self.aliases
                .borrow()
                .iter()
                .filter(|alias| **alias != self.namespace)
                .cloned(),
        );
        domains
    }

    /// Run until cancelled. Connections are released on return.
    #[instrument(skip_all, fields(namespace = %self.namespace))]
    pub async fn run(mut self, cancel: CancellationToken) -> WorkerStats {
        info!(
            resync = self.config.resync,
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Starting namespace worker"
        );

        let mut resync = self.config.resync;
        while !cancel.is_cancelled() {
            let since = self.resume_point(resync).await;
            resync = false;

            if !self.run_pass(since, &cancel).await {
                break;
            }
            self.stats.passes += 1;
            self.retry_failed(&cancel).await;

            if !sleep_or_cancel(&cancel, self.config.poll_interval).await {
                break;
            }
        }

        self.release().await;
        info!(
            passes = self.stats.passes,
            applied = self.stats.applied,
            failed = self.stats.failed,
            "Namespace worker stopped"
        );
        self.stats
    }

    async fn resume_point(&self, resync: bool) -> Option<DateTime<Utc>> {
        if resync {
            info!("Full resync requested");
            if let Err(e) = self.feed.cursor().clear().await {
                warn!(error = %e, "Cannot clear sync cursor");
            }
            return None;
        }
        match self.cache.resume_from().await {
            Ok(since) => since,
            Err(e) => {
                warn!(error = %e, "Cannot read resume point, starting from the epoch");
                None
            }
        }
    }

    /// One feed session. Returns `false` when cancelled.
    async fn run_pass(&mut self, since: Option<DateTime<Utc>>, cancel: &CancellationToken) -> bool {
        let (tx, mut rx) = mpsc::channel(self.config.channel_capacity);
        let feed_cancel = cancel.child_token();
        let feed = Arc::clone(&self.feed);
        let token = feed_cancel.clone();
        let handle = tokio::spawn(async move { feed.run(since, &tx, &token).await });

        let period = self.config.poll_interval.max(Duration::from_millis(1));
        let mut retry_tick = interval_at(Instant::now() + period, period);
        retry_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut cancelled = false;
        loop {
            let message = tokio::select! {
                () = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                _ = retry_tick.tick(), if !self.retry_queue.is_empty() => {
                    self.retry_failed(cancel).await;
                    continue;
                }
                message = rx.recv() => message,
            };
            match message {
                Some(FeedMessage::Change(event)) => self.handle(event, cancel).await,
                Some(FeedMessage::Cursor(cookie)) => self.store_cursor(&cookie).await,
                None => break,
            }
        }

        feed_cancel.cancel();
        drop(rx);
        match handle.await {
            Ok(Ok(strategy)) => debug!(strategy = %strategy, "Feed pass complete"),
            Ok(Err(FeedError::Cancelled)) => debug!("Feed cancelled"),
            Ok(Err(e)) => warn!(error = %e, "Feed pass ended with an error"),
            Err(e) => error!(error = %e, "Feed task failed"),
        }
        !cancelled
    }

    async fn store_cursor(&self, cookie: &str) {
        let result = if cookie.is_empty() {
            self.feed.cursor().clear().await
        } else {
            self.feed.cursor().save(cookie).await
        };
        if let Err(e) = result {
            warn!(error = %e, "Cannot persist sync cursor");
        }
    }

    /// Classify and reconcile one event, queueing it on failure.
    async fn handle(&mut self, event: ChangeEvent, cancel: &CancellationToken) {
        match self.apply(&event).await {
            Ok(()) => {
                self.retry_queue.retain(|queued| queued.entry.id != event.entry.id);
            }
            Err(e) => {
                self.stats.failed += 1;
                warn!(
                    entry_id = %event.entry.id,
                    dn = %event.entry.dn,
                    change_kind = %event.kind,
                    error = %e,
                    "Reconciliation failed, queued for retry"
                );
                let transient = e.is_transient();
                self.retry_queue.retain(|queued| queued.entry.id != event.entry.id);
                if self.retry_queue.len() >= MAX_RETRY_QUEUE {
                    if let Some(dropped) = self.retry_queue.pop_front() {
                        warn!(entry_id = %dropped.entry.id, "Retry queue full, dropping oldest event");
                    }
                }
                self.retry_queue.push_back(event);
                if transient {
                    sleep_or_cancel(cancel, self.config.backoff).await;
                }
            }
        }
    }

    async fn apply(&mut self, event: &ChangeEvent) -> Result<(), ReconcileError> {
        let entry_type = self.classifier.classify(&event.entry).await;
        let event = event.clone().classified(entry_type);
        let domains = self.domains();

        match self.reconciler.reconcile(&event, &self.cache, &domains).await? {
            Outcome::Applied => self.stats.applied += 1,
            Outcome::Replay => self.stats.replays += 1,
            Outcome::NoOp => self.stats.skipped += 1,
        }
        Ok(())
    }

    /// Give every queued event one more attempt; failures are dropped.
    async fn retry_failed(&mut self, cancel: &CancellationToken) {
        if self.retry_queue.is_empty() {
            return;
        }
        info!(queued = self.retry_queue.len(), "Retrying failed events");

        let queued = std::mem::take(&mut self.retry_queue);
        for event in queued {
            if cancel.is_cancelled() {
                break;
            }
            if let Err(e) = self.apply(&event).await {
                error!(
                    entry_id = %event.entry.id,
                    change_kind = %event.kind,
                    error = %e,
                    "Retry failed, dropping event"
                );
            }
        }
    }

    async fn release(&self) {
        self.feed.disconnect().await;
        if let Err(e) = self.directory.disconnect().await {
            debug!(error = %e, "Directory disconnect failed");
        }
        if let Err(e) = self.store.disconnect().await {
            debug!(error = %e, "Mail store disconnect failed");
        }
        self.cache.close().await;
    }
}
