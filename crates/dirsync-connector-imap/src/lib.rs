//! # IMAP Mail Store Connector
//!
//! [`MailStore`](dirsync_connector::MailStore) implementation speaking
//! IMAP4rev1 with the ACL (RFC 4314), QUOTA (RFC 9208) and METADATA
//! (RFC 5464) extensions over an administrator session.
//!
//! ```ignore
//! let config = ImapConfig::new("imap.example.org", "cyrus-admin").with_password(password);
//! let store = ImapMailStore::new(config)?;
//! store.create_mailbox("user/jdoe@example.org", None).await?;
//! store.set_quota("user/jdoe@example.org", 1_048_576).await?;
//! ```

pub mod config;
pub mod protocol;
pub mod session;
pub mod store;

pub use config::ImapConfig;
pub use store::ImapMailStore;
