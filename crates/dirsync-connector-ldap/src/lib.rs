//! # LDAP Connector
//!
//! LDAP directory connector for dirsync.
//!
//! ## Features
//!
//! - LDAP v3 simple bind with a lazily cached, multiplexed connection
//! - Capability discovery through the root DSE `supportedControl` attribute
//! - Change feeds: persistent search with entry change notifications,
//!   RFC 4533 content synchronization (refreshAndPersist), paged results
//! - Namespace discovery from domain entries
//!
//! ## Example
//!
//! ```ignore
//! use dirsync_connector::prelude::*;
//! use dirsync_connector_ldap::{LdapConfig, LdapDirectory};
//!
//! let config = LdapConfig::new(
//!     "ldap.example.org",
//!     "dc=example,dc=org",
//!     "uid=kolab-service,ou=Special Users,dc=example,dc=org",
//! )
//! .with_password("secret");
//!
//! let directory = LdapDirectory::new(config)?;
//! directory.connect().await?;
//! let controls = directory.supported_controls().await?;
//! ```

pub mod config;
pub mod connector;
pub mod controls;

// Re-exports
pub use config::LdapConfig;
pub use connector::LdapDirectory;
