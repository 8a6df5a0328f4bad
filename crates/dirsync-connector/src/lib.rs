//! # Connector Framework
//!
//! Shared model and collaborator traits for synchronizing a directory
//! service into a mail store.
//!
//! The sync engine (`dirsync-provisioning`) depends only on this crate.
//! Concrete connectors implement the traits:
//!
//! - [`Directory`] - identity records, change feeds, namespace discovery
//! - [`MailStore`] - mailboxes, ACLs, metadata and quota
//!
//! ## Example
//!
//! ```ignore
//! use dirsync_connector::prelude::*;
//!
//! let request = SearchRequest::subtree(
//!     "dc=example,dc=org",
//!     Filter::parse("(objectClass=kolabInetOrgPerson)")?,
//! );
//! for entry in directory.search(&request).await? {
//!     println!("{} {}", entry.id, entry.dn);
//! }
//! ```
//!
//! ## Crate Organization
//!
//! - [`types`] - Entry types, change kinds, feed strategies, topology
//! - [`entry`] - Directory entries, attributes and change events
//! - [`filter`] - RFC 4515 filter model with local evaluation
//! - [`operation`] - Search requests, attribute changes, ACL entries
//! - [`error`] - Error types with transient/permanent classification
//! - [`traits`] - Collaborator traits
//! - [`resilience`] - Fixed-backoff retry
//! - [`config`] - Connection settings
//! - [`oids`] - LDAP control OIDs

pub mod config;
pub mod entry;
pub mod error;
pub mod filter;
pub mod oids;
pub mod operation;
pub mod resilience;
pub mod traits;
pub mod types;

pub use traits::{Directory, MailStore};

/// Prelude module for convenient imports.
///
/// ```
/// use dirsync_connector::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::ConnectionSettings;
    pub use crate::entry::{AttributeValue, Attributes, ChangeEvent, DirectoryEntry};
    pub use crate::error::{ConnectorError, ConnectorResult};
    pub use crate::filter::{Filter, FilterParseError};
    pub use crate::operation::{AclEntry, AttributeChange, Scope, SearchRequest};
    pub use crate::resilience::{RetryConfig, RetryExecutor};
    pub use crate::traits::{ChangeSink, Directory, FeedMessage, MailStore};
    pub use crate::types::{ChangeKind, DomainTopology, EntryType, FeedStrategy};
}

// Re-export async_trait for connector implementors
pub use async_trait::async_trait;
