//! Namespace supervisor.
//!
//! Polls the directory for served namespaces and keeps exactly one worker
//! task per primary namespace. Workers for vanished namespaces are
//! cancelled, new namespaces get a worker, and alias changes are pushed
//! to running workers. A worker task that ended on its own is reaped and
//! started again.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use dirsync_connector::error::ConnectorResult;
use dirsync_connector::resilience::sleep_or_cancel;
use dirsync_connector::traits::{Directory, MailStore};

use crate::classifier::EntryClassifier;
use crate::config::{DirectorySchema, ProvisioningConfig};
use crate::cursor::SyncCursorStore;
use crate::error::WorkerError;
use crate::feed::{ChangeFeed, DEFAULT_PAGE_SIZE};
use crate::policy::{NoopHooks, PolicyHooks, RecipientPolicy};
use crate::reconciler::Reconciler;
use crate::watermark::WatermarkCache;
use crate::worker::{NamespaceWorker, WorkerConfig};

/// Creates the per-namespace collaborators. Each call yields a fresh,
/// unshared connection.
pub trait ConnectorFactory: Send + Sync {
    fn directory(&self, namespace: &str) -> ConnectorResult<Arc<dyn Directory>>;

    fn mail_store(&self, namespace: &str) -> ConnectorResult<Arc<dyn MailStore>>;
}

/// Starts a worker task for a namespace.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(
        &self,
        namespace: &str,
        aliases: watch::Receiver<Vec<String>>,
        cancel: CancellationToken,
    ) -> JoinHandle<()>;
}

/// Spawns [`NamespaceWorker`]s built from configuration.
pub struct DefaultWorkerSpawner {
    config: Arc<ProvisioningConfig>,
    schema: DirectorySchema,
    factory: Arc<dyn ConnectorFactory>,
    hooks: Arc<dyn PolicyHooks>,
    page_size: u32,
    resync: bool,
    resynced: Mutex<HashSet<String>>,
}

impl DefaultWorkerSpawner {
    pub fn new(
        config: Arc<ProvisioningConfig>,
        schema: DirectorySchema,
        factory: Arc<dyn ConnectorFactory>,
    ) -> Self {
        Self {
            config,
            schema,
            factory,
            hooks: Arc::new(NoopHooks),
            page_size: DEFAULT_PAGE_SIZE,
            resync: false,
            resynced: Mutex::new(HashSet::new()),
        }
    }

    #[must_use]
    pub fn with_hooks(mut self, hooks: Arc<dyn PolicyHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    /// Resync each namespace once on its first start in this process.
    #[must_use]
    pub fn with_resync(mut self, resync: bool) -> Self {
        self.resync = resync;
        self
    }

    fn take_resync(&self, namespace: &str) -> bool {
        if !self.resync {
            return false;
        }
        match self.resynced.lock() {
            Ok(mut done) => done.insert(namespace.to_string()),
            Err(_) => false,
        }
    }

    /// Assemble a worker for `namespace`.
    pub async fn build(
        &self,
        namespace: &str,
        aliases: watch::Receiver<Vec<String>>,
        resync: bool,
    ) -> Result<NamespaceWorker, WorkerError> {
        let settings = &self.config.sync;
        let base_dn = settings.namespace_base_dn(namespace);
        let feed_directory = self.factory.directory(namespace)?;
        let directory = self.factory.directory(namespace)?;
        let store = self.factory.mail_store(namespace)?;

        let classifier = EntryClassifier::new(
            Arc::clone(&directory),
            &self.config.classifier,
            &base_dn,
            self.schema.id_attribute.clone(),
        )?;
        let policy = RecipientPolicy::new(
            Arc::clone(&directory),
            &self.config.policy,
            base_dn.clone(),
            self.schema.id_attribute.clone(),
            Arc::clone(&self.hooks),
        )?;
        let reconciler = Reconciler::new(
            Arc::clone(&directory),
            Arc::clone(&store),
            policy,
            &self.config,
        );
        let cache = WatermarkCache::open(&settings.cache_dir, namespace).await?;
        let cursor = SyncCursorStore::new(&settings.cache_dir, namespace);
        let feed = ChangeFeed::new(
            feed_directory,
            namespace,
            base_dn,
            classifier.type_filters(),
            self.schema.clone(),
            cursor,
        )
        .with_forced_strategy(settings.strategy)
        .with_backoff(settings.backoff())
        .with_page_size(self.page_size);

        let config = WorkerConfig {
            resync,
            poll_interval: settings.poll_interval(),
            backoff: settings.backoff(),
            channel_capacity: settings.channel_capacity,
        };
        Ok(NamespaceWorker::new(
            namespace, feed, classifier, reconciler, cache, directory, store, aliases, config,
        ))
    }
}

impl WorkerSpawner for Arc<DefaultWorkerSpawner> {
    fn spawn(
        &self,
        namespace: &str,
        aliases: watch::Receiver<Vec<String>>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let spawner = Arc::clone(self);
        let namespace = namespace.to_string();
        tokio::spawn(async move {
            let resync = spawner.take_resync(&namespace);
            match spawner.build(&namespace, aliases, resync).await {
                Ok(worker) => {
                    worker.run(cancel).await;
                }
                Err(e) => error!(namespace = %namespace, error = %e, "Cannot start namespace worker"),
            }
        })
    }
}

/// Supervisor settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Served when discovery finds no namespaces.
    pub primary_domain: String,

    /// Serve only this namespace and skip discovery.
    pub fixed_namespace: Option<String>,

    /// Delay between discovery polls when nothing changed.
    pub topology_interval: Duration,

    /// Worker starts per pass before pausing.
    pub burst_threshold: usize,

    /// Pause after each burst of starts.
    pub burst_pause: Duration,
}

impl SupervisorConfig {
    #[must_use]
    pub fn from_config(config: &ProvisioningConfig) -> Self {
        Self {
            primary_domain: config.sync.primary_domain.clone(),
            fixed_namespace: None,
            topology_interval: config.sync.topology_interval(),
            burst_threshold: config.sync.burst_threshold,
            burst_pause: config.sync.burst_pause(),
        }
    }

    #[must_use]
    pub fn with_fixed_namespace(mut self, namespace: Option<String>) -> Self {
        self.fixed_namespace = namespace.map(|n| n.to_lowercase());
        self
    }
}

struct RunningWorker {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
    aliases: watch::Sender<Vec<String>>,
}

/// Changes made by one discovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Namespaces that got a new worker.
    pub started: Vec<String>,
    /// Namespaces whose worker was stopped.
    pub stopped: Vec<String>,
    /// Namespaces whose worker had ended and was started again.
    pub restarted: Vec<String>,
    /// Whether discovery failed.
    pub discovery_failed: bool,
}

impl PollReport {
    /// Nothing was started or stopped.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty()
    }
}

/// Keeps one worker per namespace.
pub struct Supervisor {
    directory: Arc<dyn Directory>,
    spawner: Arc<dyn WorkerSpawner>,
    config: SupervisorConfig,
    workers: HashMap<String, RunningWorker>,
    cancel: CancellationToken,
}

impl Supervisor {
    pub fn new(
        directory: Arc<dyn Directory>,
        spawner: Arc<dyn WorkerSpawner>,
        config: SupervisorConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            directory,
            spawner,
            config,
            workers: HashMap::new(),
            cancel,
        }
    }

    /// Namespaces with a worker, sorted.
    #[must_use]
    pub fn running(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Poll until cancelled, then stop every worker.
    #[instrument(skip_all)]
    pub async fn run(&mut self) {
        info!(
            primary_domain = %self.config.primary_domain,
            fixed_namespace = ?self.config.fixed_namespace,
            "Starting supervisor"
        );

        while !self.cancel.is_cancelled() {
            let report = self.poll_once().await;
            if report.is_idle() && !sleep_or_cancel(&self.cancel, self.config.topology_interval).await
            {
                break;
            }
        }

        self.shutdown().await;
    }

    /// One discovery pass.
    pub async fn poll_once(&mut self) -> PollReport {
        let mut report = PollReport::default();
        let crashed = self.reap();

        let Some(desired) = self.discover().await else {
            report.discovery_failed = true;
            return report;
        };

        let removed: Vec<String> = self
            .workers
            .keys()
            .filter(|namespace| !desired.contains_key(*namespace))
            .cloned()
            .collect();
        for namespace in removed {
            self.stop(&namespace).await;
            report.stopped.push(namespace);
        }

        for (namespace, aliases) in &desired {
            if let Some(worker) = self.workers.get(namespace) {
                let changed = worker.aliases.send_if_modified(|current| {
                    if current == aliases {
                        false
                    } else {
                        current.clone_from(aliases);
                        true
                    }
                });
                if changed {
                    info!(namespace = %namespace, aliases = ?aliases, "Namespace aliases changed");
                }
            }
        }

        let mut starts = 0usize;
        for (namespace, aliases) in desired {
            if self.workers.contains_key(&namespace) || self.cancel.is_cancelled() {
                continue;
            }
            if starts > 0 && starts % self.config.burst_threshold.max(1) == 0 {
                debug!(started = starts, "Pausing after a burst of worker starts");
                if !sleep_or_cancel(&self.cancel, self.config.burst_pause).await {
                    break;
                }
            }
            self.start(&namespace, aliases);
            starts += 1;
            if crashed.contains(&namespace) {
                report.restarted.push(namespace);
            } else {
                report.started.push(namespace);
            }
        }

        report
    }

    /// Cancel every worker and wait for them to finish.
    pub async fn shutdown(&mut self) {
        info!(workers = self.workers.len(), "Stopping all namespace workers");
        for worker in self.workers.values() {
            worker.cancel.cancel();
        }
        for (namespace, worker) in self.workers.drain() {
            if let Err(e) = worker.handle.await {
                error!(namespace = %namespace, error = %e, "Namespace worker failed");
            }
        }
    }

    /// Drop workers whose task has ended.
    fn reap(&mut self) -> HashSet<String> {
        let finished: Vec<String> = self
            .workers
            .iter()
            .filter(|(_, worker)| worker.handle.is_finished())
            .map(|(namespace, _)| namespace.clone())
            .collect();
        for namespace in &finished {
            warn!(namespace = %namespace, "Namespace worker ended unexpectedly");
            self.workers.remove(namespace);
        }
        finished.into_iter().collect()
    }

    /// Desired namespaces and their aliases, or `None` when discovery failed.
    async fn discover(&self) -> Option<BTreeMap<String, Vec<String>>> {
        if let Some(namespace) = &self.config.fixed_namespace {
            return Some(BTreeMap::from([(namespace.clone(), Vec::new())]));
        }

        let topology = match self.directory.list_namespaces().await {
            Ok(topology) => topology,
            Err(e) => {
                warn!(error = %e, "Namespace discovery failed");
                if e.is_transient() {
                    let _ = self.directory.disconnect().await;
                }
                return None;
            }
        };

        if topology.is_empty() {
            debug!(primary_domain = %self.config.primary_domain, "No domain entries, serving the primary domain");
            return Some(BTreeMap::from([(
                self.config.primary_domain.to_lowercase(),
                Vec::new(),
            )]));
        }

        Some(
            topology
                .primaries()
                .map(|primary| (primary.to_string(), topology.aliases(primary)))
                .collect(),
        )
    }

    fn start(&mut self, namespace: &str, aliases: Vec<String>) {
        info!(namespace = %namespace, aliases = ?aliases, "Starting namespace worker");
        let cancel = self.cancel.child_token();
        let (tx, rx) = watch::channel(aliases);
        let handle = self.spawner.spawn(namespace, rx, cancel.clone());
        self.workers.insert(
            namespace.to_string(),
            RunningWorker {
                handle,
                cancel,
                aliases: tx,
            },
        );
    }

    async fn stop(&mut self, namespace: &str) {
        let Some(worker) = self.workers.remove(namespace) else {
            return;
        };
        info!(namespace = %namespace, "Stopping namespace worker");
        worker.cancel.cancel();
        if let Err(e) = worker.handle.await {
            error!(namespace = %namespace, error = %e, "Namespace worker failed");
        }
    }
}
