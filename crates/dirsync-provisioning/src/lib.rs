//! # Sync Engine
//!
//! Keeps a mail store in step with a directory service.
//!
//! This crate provides:
//! - Change feed driving with strategy negotiation and fallback
//! - Entry classification by configured filters
//! - Recipient policy (address templates, collision suffixes, write-back)
//! - Reconciliation of mailboxes, shared folders, ACLs and quota
//! - A per-namespace watermark cache and sync cursor
//! - Namespace discovery with one worker per served domain
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  namespaces  ┌──────────────┐
//! │  Directory  │─────────────►│  Supervisor  │
//! └──────┬──────┘              └──────┬───────┘
//!        │ change feed                │ one per namespace
//!        ▼                            ▼
//! ┌─────────────┐   events     ┌──────────────┐     ┌────────────┐
//! │ ChangeFeed  │─────────────►│    Worker    │────►│ Classifier │
//! └─────────────┘              └──────┬───────┘     └────────────┘
//!                                     ▼
//!                              ┌──────────────┐     ┌────────────┐
//!                              │  Reconciler  │────►│ Mail store │
//!                              └──────┬───────┘     └────────────┘
//!                                     ▼
//!                              ┌──────────────┐
//!                              │  Watermarks  │
//!                              └──────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use dirsync_provisioning::{
//!     DefaultWorkerSpawner, DirectorySchema, ProvisioningConfig, Supervisor, SupervisorConfig,
//! };
//!
//! let config = Arc::new(ProvisioningConfig::new("example.org"));
//! let spawner = Arc::new(DefaultWorkerSpawner::new(
//!     Arc::clone(&config),
//!     DirectorySchema::default(),
//!     factory,
//! ));
//! let mut supervisor = Supervisor::new(
//!     discovery_directory,
//!     Arc::new(spawner),
//!     SupervisorConfig::from_config(&config),
//!     cancel,
//! );
//! supervisor.run().await;
//! ```

pub mod acl;
pub mod classifier;
pub mod config;
pub mod cursor;
pub mod error;
pub mod feed;
pub mod policy;
pub mod reconciler;
pub mod supervisor;
pub mod template;
pub mod watermark;
pub mod worker;

pub use acl::{expand_rights, merge_rights, partition_grants, FolderAcl};
pub use classifier::EntryClassifier;
pub use config::{
    AuxiliaryFolder, ClassifierConfig, DirectorySchema, MailboxNaming, PolicyConfig,
    ProvisioningConfig, SharedFolderConfig, SyncSettings, TypeRuleConfig,
};
pub use cursor::SyncCursorStore;
pub use error::{
    ConfigError, FeedError, FeedResult, PolicyError, PolicyResult, ReconcileError,
    ReconcileResult, WatermarkError, WatermarkResult, WorkerError,
};
pub use feed::{compose_filter, strategy_candidates, ChangeFeed};
pub use policy::{NoopHooks, PolicyHooks, RecipientPolicy, RecipientPolicyResult};
pub use reconciler::{dispatch_table, Handler, Outcome, Reconciler};
pub use supervisor::{
    ConnectorFactory, DefaultWorkerSpawner, PollReport, Supervisor, SupervisorConfig,
    WorkerSpawner,
};
pub use template::{AddressTemplate, TemplateError};
pub use watermark::{WatermarkCache, WatermarkRecord};
pub use worker::{NamespaceWorker, WorkerConfig, WorkerStats};
