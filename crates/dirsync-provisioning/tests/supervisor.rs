//! Supervisor topology handling with a recording spawner.

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use dirsync_connector::types::DomainTopology;
use dirsync_provisioning::{Supervisor, SupervisorConfig, WorkerSpawner};

use common::MemoryDirectory;

#[derive(Default)]
struct RecordingSpawner {
    spawned: Mutex<Vec<String>>,
    spawned_at: Mutex<Vec<Instant>>,
    aliases: Mutex<HashMap<String, watch::Receiver<Vec<String>>>>,
    stopped: Arc<AtomicUsize>,
    exit_immediately: AtomicBool,
}

impl WorkerSpawner for RecordingSpawner {
    fn spawn(
        &self,
        namespace: &str,
        aliases: watch::Receiver<Vec<String>>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        self.spawned.lock().unwrap().push(namespace.to_string());
        self.spawned_at.lock().unwrap().push(Instant::now());
        self.aliases
            .lock()
            .unwrap()
            .insert(namespace.to_string(), aliases);
        let stopped = Arc::clone(&self.stopped);
        let exit = self.exit_immediately.load(Ordering::SeqCst);
        tokio::spawn(async move {
            if !exit {
                cancel.cancelled().await;
                stopped.fetch_add(1, Ordering::SeqCst);
            }
        })
    }
}

fn supervisor_config() -> SupervisorConfig {
    SupervisorConfig {
        primary_domain: "example.org".to_string(),
        fixed_namespace: None,
        topology_interval: Duration::from_millis(10),
        burst_threshold: 10,
        burst_pause: Duration::from_millis(1),
    }
}

fn setup(
    config: SupervisorConfig,
) -> (Arc<MemoryDirectory>, Arc<RecordingSpawner>, Supervisor) {
    let directory = Arc::new(MemoryDirectory::new(Vec::new()));
    let spawner = Arc::new(RecordingSpawner::default());
    let supervisor = Supervisor::new(
        directory.clone(),
        spawner.clone(),
        config,
        CancellationToken::new(),
    );
    (directory, spawner, supervisor)
}

#[tokio::test]
async fn test_topology_change_starts_and_stops_workers() {
    let (directory, spawner, mut supervisor) = setup(supervisor_config());
    directory.set_topology(
        DomainTopology::new()
            .with("a.example", Vec::<String>::new())
            .with("b.example", ["b-alias.example"]),
    );

    let report = supervisor.poll_once().await;
    assert_eq!(report.started, vec!["a.example", "b.example"]);
    assert!(report.stopped.is_empty());

    directory.set_topology(
        DomainTopology::new()
            .with("b.example", ["b-alias.example", "b-other.example"])
            .with("c.example", Vec::<String>::new()),
    );
    let report = supervisor.poll_once().await;

    assert_eq!(report.started, vec!["c.example"]);
    assert_eq!(report.stopped, vec!["a.example"]);
    assert_eq!(spawner.stopped.load(Ordering::SeqCst), 1);
    assert_eq!(supervisor.running(), vec!["b.example", "c.example"]);
    assert_eq!(
        spawner.spawned.lock().unwrap().as_slice(),
        ["a.example", "b.example", "c.example"]
    );

    let aliases = spawner.aliases.lock().unwrap()["b.example"].borrow().clone();
    assert_eq!(aliases, vec!["b-alias.example", "b-other.example"]);

    supervisor.shutdown().await;
    assert_eq!(spawner.stopped.load(Ordering::SeqCst), 3);
    assert!(supervisor.running().is_empty());
}

#[tokio::test]
async fn test_unchanged_topology_is_idle() {
    let (directory, spawner, mut supervisor) = setup(supervisor_config());
    directory.set_topology(DomainTopology::new().with("a.example", Vec::<String>::new()));

    assert!(!supervisor.poll_once().await.is_idle());
    assert!(supervisor.poll_once().await.is_idle());
    assert_eq!(spawner.spawned.lock().unwrap().len(), 1);
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_empty_topology_serves_primary_domain() {
    let (_directory, _spawner, mut supervisor) = setup(supervisor_config());

    let report = supervisor.poll_once().await;

    assert_eq!(report.started, vec!["example.org"]);
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_fixed_namespace_skips_discovery() {
    let config = supervisor_config().with_fixed_namespace(Some("Example.NET".to_string()));
    let (directory, _spawner, mut supervisor) = setup(config);
    directory.set_topology(DomainTopology::new().with("a.example", Vec::<String>::new()));

    let report = supervisor.poll_once().await;

    assert_eq!(report.started, vec!["example.net"]);
    assert_eq!(supervisor.running(), vec!["example.net"]);
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_discovery_failure_keeps_workers() {
    let (directory, spawner, mut supervisor) = setup(supervisor_config());
    directory.set_topology(DomainTopology::new().with("a.example", Vec::<String>::new()));
    supervisor.poll_once().await;

    directory.fail_discovery.store(true, Ordering::SeqCst);
    let report = supervisor.poll_once().await;

    assert!(report.discovery_failed);
    assert!(report.is_idle());
    assert_eq!(supervisor.running(), vec!["a.example"]);
    assert_eq!(spawner.stopped.load(Ordering::SeqCst), 0);
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_ended_worker_is_restarted() {
    let (directory, spawner, mut supervisor) = setup(supervisor_config());
    directory.set_topology(DomainTopology::new().with("a.example", Vec::<String>::new()));
    spawner.exit_immediately.store(true, Ordering::SeqCst);
    supervisor.poll_once().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    spawner.exit_immediately.store(false, Ordering::SeqCst);
    let report = supervisor.poll_once().await;

    assert_eq!(report.restarted, vec!["a.example"]);
    assert!(report.started.is_empty());
    assert_eq!(spawner.spawned.lock().unwrap().len(), 2);
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_run_stops_workers_on_cancel() {
    let directory = Arc::new(MemoryDirectory::new(Vec::new()));
    directory.set_topology(DomainTopology::new().with("a.example", Vec::<String>::new()));
    let spawner = Arc::new(RecordingSpawner::default());
    let cancel = CancellationToken::new();
    let mut supervisor = Supervisor::new(
        directory.clone(),
        spawner.clone(),
        supervisor_config(),
        cancel.clone(),
    );

    let handle = tokio::spawn(async move {
        supervisor.run().await;
        supervisor
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    let supervisor = handle.await.unwrap();

    assert!(supervisor.running().is_empty());
    assert_eq!(spawner.stopped.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_burst_of_starts_pauses_between_batches() {
    let pause = Duration::from_millis(150);
    let (directory, spawner, mut supervisor) = setup(SupervisorConfig {
        burst_threshold: 5,
        burst_pause: pause,
        ..supervisor_config()
    });
    let mut topology = DomainTopology::new();
    for n in 0..12 {
        topology = topology.with(format!("d{n:02}.example"), Vec::<String>::new());
    }
    directory.set_topology(topology);

    let started = Instant::now();
    let report = supervisor.poll_once().await;

    assert_eq!(report.started.len(), 12);
    assert!(started.elapsed() >= pause * 2);
    let times = spawner.spawned_at.lock().unwrap().clone();
    assert_eq!(times.len(), 12);
    assert!(times[5].duration_since(times[4]) >= pause);
    assert!(times[10].duration_since(times[9]) >= pause);

    supervisor.shutdown().await;
}
