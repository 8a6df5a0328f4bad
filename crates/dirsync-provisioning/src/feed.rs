//! Change feed driver.
//!
//! Picks a feed strategy from the controls the directory advertises,
//! composes the search filter and pushes change events into the worker's
//! channel. Transport failures reconnect after a fixed backoff and resume
//! the strategy that was running; anything else ends the attempt.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use dirsync_connector::entry::ChangeEvent;
use dirsync_connector::error::{ConnectorError, ConnectorResult};
use dirsync_connector::filter::Filter;
use dirsync_connector::operation::SearchRequest;
use dirsync_connector::resilience::{sleep_or_cancel, RetryConfig, RetryExecutor};
use dirsync_connector::traits::{emit, ChangeSink, Directory, FeedMessage};
use dirsync_connector::types::FeedStrategy;

use crate::config::DirectorySchema;
use crate::cursor::SyncCursorStore;
use crate::error::{FeedError, FeedResult};

/// Default page size for paged enumeration.
pub const DEFAULT_PAGE_SIZE: u32 = 500;

/// Strategies to try, in order.
///
/// A forced strategy comes first even when the server does not advertise
/// it. The remaining advertised strategies follow in preference order and
/// plain search always closes the list.
#[must_use]
pub fn strategy_candidates(advertised: &[String], forced: Option<FeedStrategy>) -> Vec<FeedStrategy> {
    let supports = |strategy: &FeedStrategy| match strategy.required_control() {
        Some(oid) => advertised.iter().any(|a| a == oid),
        None => true,
    };

    let mut candidates = Vec::new();
    if let Some(forced) = forced {
        if !supports(&forced) {
            warn!(strategy = %forced, "Forced feed strategy is not advertised by the server");
        }
        candidates.push(forced);
    }
    for strategy in FeedStrategy::preference_order() {
        if *strategy != FeedStrategy::Plain && supports(strategy) && !candidates.contains(strategy)
        {
            candidates.push(*strategy);
        }
    }
    if !candidates.contains(&FeedStrategy::Plain) {
        candidates.push(FeedStrategy::Plain);
    }
    candidates
}

/// Search filter for a feed: any of the type filters, restricted to
/// entries modified at or after `since` for snapshot strategies.
#[must_use]
pub fn compose_filter(
    type_filters: &[Filter],
    schema: &DirectorySchema,
    since: Option<DateTime<Utc>>,
    strategy: FeedStrategy,
) -> Filter {
    let base = match type_filters {
        [single] => single.clone(),
        filters => Filter::or(filters.to_vec()),
    };
    if strategy.is_continuous() {
        return base;
    }
    let since = since.unwrap_or(DateTime::UNIX_EPOCH);
    base.and_with(Filter::ge(
        schema.modified_attribute.clone(),
        since.format(&schema.timestamp_format).to_string(),
    ))
}

/// Drives one namespace's directory feed.
pub struct ChangeFeed {
    directory: Arc<dyn Directory>,
    namespace: String,
    base_dn: String,
    type_filters: Vec<Filter>,
    schema: DirectorySchema,
    forced: Option<FeedStrategy>,
    backoff: Duration,
    page_size: u32,
    cursor: SyncCursorStore,
}

impl ChangeFeed {
    pub fn new(
        directory: Arc<dyn Directory>,
        namespace: impl Into<String>,
        base_dn: impl Into<String>,
        type_filters: Vec<Filter>,
        schema: DirectorySchema,
        cursor: SyncCursorStore,
    ) -> Self {
        Self {
            directory,
            namespace: namespace.into(),
            base_dn: base_dn.into(),
            type_filters,
            schema,
            forced: None,
            backoff: Duration::from_secs(10),
            page_size: DEFAULT_PAGE_SIZE,
            cursor,
        }
    }

    #[must_use]
    pub fn with_forced_strategy(mut self, strategy: Option<FeedStrategy>) -> Self {
        self.forced = strategy;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    #[must_use]
    pub fn cursor(&self) -> &SyncCursorStore {
        &self.cursor
    }

    /// Drop the feed's directory connection.
    pub async fn disconnect(&self) {
        if let Err(e) = self.directory.disconnect().await {
            debug!(error = %e, "Feed disconnect failed");
        }
    }

    /// Run one feed session.
    ///
    /// Snapshot strategies return the strategy used once the last entry is
    /// delivered. Continuous strategies run until cancelled. A permanent
    /// search error ends a snapshot session with an error; a continuous
    /// one is re-issued after the backoff.
    #[instrument(skip_all, fields(namespace = %self.namespace))]
    pub async fn run(
        &self,
        since: Option<DateTime<Utc>>,
        sink: &ChangeSink,
        cancel: &CancellationToken,
    ) -> FeedResult<FeedStrategy> {
        let mut sticky: Option<FeedStrategy> = None;

        'connection: loop {
            let advertised = self.connect(cancel).await?;
            let mut candidates = strategy_candidates(&advertised, self.forced);
            if let Some(strategy) = sticky {
                candidates.retain(|s| *s != strategy);
                candidates.insert(0, strategy);
            }

            for strategy in candidates {
                loop {
                    debug!(strategy = %strategy, "Issuing feed search");
                    let result = tokio::select! {
                        () = cancel.cancelled() => return Err(FeedError::Cancelled),
                        result = self.issue(strategy, since, sink) => result,
                    };

                    match result {
                        Ok(()) if !strategy.is_continuous() => {
                            debug!(strategy = %strategy, "Snapshot complete");
                            return Ok(strategy);
                        }
                        Ok(()) => {
                            info!(strategy = %strategy, "Continuous feed ended, re-issuing");
                        }
                        Err(ConnectorError::Unsupported { feature }) => {
                            info!(strategy = %strategy, feature = %feature, "Strategy unsupported, trying next");
                            break;
                        }
                        Err(ConnectorError::Cancelled) => return Err(FeedError::Cancelled),
                        Err(e) if e.is_transient() => {
                            warn!(strategy = %strategy, error = %e, "Directory connection lost, reconnecting");
                            sticky = Some(strategy);
                            let _ = self.directory.disconnect().await;
                            self.pause(cancel).await?;
                            continue 'connection;
                        }
                        Err(e) if strategy.is_continuous() => {
                            warn!(strategy = %strategy, error = %e, "Feed search failed, re-issuing");
                            if strategy == FeedStrategy::SyncRepl {
                                if let Err(e) = self.cursor.clear().await {
                                    warn!(error = %e, "Cannot clear sync cursor");
                                }
                            }
                        }
                        Err(e) => {
                            warn!(strategy = %strategy, error = %e, "Feed search failed");
                            return Err(e.into());
                        }
                    }
                    self.pause(cancel).await?;
                }
            }

            return Err(ConnectorError::unsupported("every feed strategy").into());
        }
    }

    /// Bind and read the advertised controls, retrying transport errors.
    async fn connect(&self, cancel: &CancellationToken) -> FeedResult<Vec<String>> {
        let retry = RetryExecutor::new(RetryConfig::forever(self.backoff));
        let controls = retry
            .execute(cancel, || async {
                self.directory.connect().await?;
                self.directory.supported_controls().await
            })
            .await
            .map_err(|e| match e {
                ConnectorError::Cancelled => FeedError::Cancelled,
                e => FeedError::Directory(e),
            })?;
        debug!(controls = controls.len(), "Connected to directory");
        Ok(controls)
    }

    async fn pause(&self, cancel: &CancellationToken) -> FeedResult<()> {
        if sleep_or_cancel(cancel, self.backoff).await {
            Ok(())
        } else {
            Err(FeedError::Cancelled)
        }
    }

    async fn issue(
        &self,
        strategy: FeedStrategy,
        since: Option<DateTime<Utc>>,
        sink: &ChangeSink,
    ) -> ConnectorResult<()> {
        let filter = compose_filter(&self.type_filters, &self.schema, since, strategy);
        let request = SearchRequest::subtree(self.base_dn.clone(), filter);

        match strategy {
            FeedStrategy::Persistent => self.directory.persistent_search(&request, sink).await,
            FeedStrategy::SyncRepl => {
                let cookie = match self.cursor.load().await {
                    Ok(cookie) => cookie,
                    Err(e) => {
                        warn!(error = %e, "Cannot read sync cursor, starting a full refresh");
                        None
                    }
                };
                self.directory
                    .sync_replication(&request, cookie.as_deref(), sink)
                    .await
            }
            FeedStrategy::Paged => {
                let count = self
                    .directory
                    .paged_search(&request, self.page_size, sink)
                    .await?;
                debug!(count, "Paged snapshot delivered");
                Ok(())
            }
            FeedStrategy::Plain => {
                let entries = self.directory.search(&request).await?;
                debug!(count = entries.len(), "Snapshot delivered");
                for entry in entries {
                    emit(sink, FeedMessage::Change(ChangeEvent::seen(entry))).await?;
                }
                Ok(())
            }
        }
    }
}
