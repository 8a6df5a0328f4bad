//! Collaborator traits
//!
//! The sync engine talks to the directory and the mail store only through
//! these traits, so both sides can be replaced by test doubles.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::entry::{ChangeEvent, DirectoryEntry};
use crate::error::{ConnectorError, ConnectorResult};
use crate::operation::{AclEntry, AttributeChange, SearchRequest};
use crate::types::DomainTopology;

/// Metadata entry holding the backend server of a mailbox.
pub const SERVER_METADATA_KEY: &str = "/shared/vendor/cmu/cyrus-imapd/server";

/// Item delivered by a change feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedMessage {
    /// A changed or observed entry.
    Change(ChangeEvent),
    /// New replication cookie; everything before it has been delivered.
    Cursor(String),
}

/// Receiving half handed to feed methods.
pub type ChangeSink = mpsc::Sender<FeedMessage>;

/// Deliver a message, mapping a closed channel to [`ConnectorError::Cancelled`].
pub async fn emit(sink: &ChangeSink, message: FeedMessage) -> ConnectorResult<()> {
    sink.send(message)
        .await
        .map_err(|_| ConnectorError::Cancelled)
}

/// Directory service holding the identity records.
///
/// Feed methods push into `sink` and return when the feed ends. Continuous
/// feeds only return on error; a closed sink yields
/// [`ConnectorError::Cancelled`].
#[async_trait]
pub trait Directory: Send + Sync {
    /// Get the display name for this directory instance.
    fn display_name(&self) -> &str;

    /// Connect and bind with the configured credentials.
    async fn connect(&self) -> ConnectorResult<()>;

    /// Drop the connection. Safe to call when not connected.
    async fn disconnect(&self) -> ConnectorResult<()>;

    /// Control OIDs advertised by the server root DSE.
    async fn supported_controls(&self) -> ConnectorResult<Vec<String>>;

    /// Run a bounded search and return all matching entries.
    async fn search(&self, request: &SearchRequest) -> ConnectorResult<Vec<DirectoryEntry>>;

    /// Apply attribute changes to the entry at `dn`.
    async fn modify(&self, dn: &str, changes: Vec<AttributeChange>) -> ConnectorResult<()>;

    /// Served namespaces: primary domain to aliases.
    async fn list_namespaces(&self) -> ConnectorResult<DomainTopology>;

    /// Enumerate matching entries page by page, emitting one `Seen` event
    /// per entry. Returns the number of entries emitted.
    async fn paged_search(
        &self,
        request: &SearchRequest,
        _page_size: u32,
        sink: &ChangeSink,
    ) -> ConnectorResult<usize> {
        let entries = self.search(request).await?;
        let count = entries.len();
        for entry in entries {
            emit(sink, FeedMessage::Change(ChangeEvent::seen(entry))).await?;
        }
        Ok(count)
    }

    /// Subscribe to live change notifications.
    async fn persistent_search(
        &self,
        _request: &SearchRequest,
        _sink: &ChangeSink,
    ) -> ConnectorResult<()> {
        Err(ConnectorError::unsupported("persistent search"))
    }

    /// Tail the replication log starting at `cookie`.
    async fn sync_replication(
        &self,
        _request: &SearchRequest,
        _cookie: Option<&str>,
        _sink: &ChangeSink,
    ) -> ConnectorResult<()> {
        Err(ConnectorError::unsupported("content synchronization"))
    }
}

/// Mail store holding mailboxes and their permissions.
///
/// Creating an existing mailbox and deleting a missing one both succeed.
#[async_trait]
pub trait MailStore: Send + Sync {
    /// Get the display name for this store instance.
    fn display_name(&self) -> &str;

    /// Close the session. Safe to call when not connected.
    async fn disconnect(&self) -> ConnectorResult<()>;

    /// Check whether a mailbox exists.
    async fn mailbox_exists(&self, path: &str) -> ConnectorResult<bool>;

    /// Create a mailbox, optionally on a specific server or partition.
    async fn create_mailbox(&self, path: &str, server: Option<&str>) -> ConnectorResult<()>;

    /// Rename a mailbox, optionally moving it to another partition.
    async fn rename_mailbox(
        &self,
        from: &str,
        to: &str,
        partition: Option<&str>,
    ) -> ConnectorResult<()>;

    /// Delete a mailbox.
    async fn delete_mailbox(&self, path: &str) -> ConnectorResult<()>;

    /// List mailboxes matching an IMAP LIST pattern (`*`, `%`).
    async fn list_mailboxes(&self, pattern: &str) -> ConnectorResult<Vec<String>>;

    /// Current grants on a mailbox.
    async fn get_acl(&self, path: &str) -> ConnectorResult<Vec<AclEntry>>;

    /// Grant `rights` to `subject`, replacing any previous grant.
    async fn set_acl(&self, path: &str, subject: &str, rights: &str) -> ConnectorResult<()>;

    /// Remove every grant for `subject`.
    async fn delete_acl(&self, path: &str, subject: &str) -> ConnectorResult<()>;

    /// Read a metadata entry.
    async fn get_metadata(&self, path: &str, key: &str) -> ConnectorResult<Option<String>>;

    /// Write a metadata entry.
    async fn set_metadata(&self, path: &str, key: &str, value: &str) -> ConnectorResult<()>;

    /// Storage quota limit in KiB, if one is set.
    async fn get_quota(&self, path: &str) -> ConnectorResult<Option<u64>>;

    /// Set the storage quota limit in KiB.
    async fn set_quota(&self, path: &str, limit_kib: u64) -> ConnectorResult<()>;

    /// Backend server holding the mailbox.
    async fn mailbox_host(&self, path: &str) -> ConnectorResult<Option<String>> {
        self.get_metadata(path, SERVER_METADATA_KEY).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Filter;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticDirectory {
        searches: AtomicUsize,
    }

    #[async_trait]
    impl Directory for StaticDirectory {
        fn display_name(&self) -> &str {
            "static"
        }

        async fn connect(&self) -> ConnectorResult<()> {
            Ok(())
        }

        async fn disconnect(&self) -> ConnectorResult<()> {
            Ok(())
        }

        async fn supported_controls(&self) -> ConnectorResult<Vec<String>> {
            Ok(Vec::new())
        }

        async fn search(&self, _request: &SearchRequest) -> ConnectorResult<Vec<DirectoryEntry>> {
            self.searches.fetch_add(1, Ordering::SeqCst);
            Ok(vec![
                DirectoryEntry::new("1", "uid=a,dc=example,dc=org"),
                DirectoryEntry::new("2", "uid=b,dc=example,dc=org"),
            ])
        }

        async fn modify(&self, _dn: &str, _changes: Vec<AttributeChange>) -> ConnectorResult<()> {
            Ok(())
        }

        async fn list_namespaces(&self) -> ConnectorResult<DomainTopology> {
            Ok(DomainTopology::new().with("example.org", Vec::<String>::new()))
        }
    }

    fn request() -> SearchRequest {
        SearchRequest::subtree("dc=example,dc=org", Filter::present("objectClass"))
    }

    #[tokio::test]
    async fn test_default_paged_search_emits_seen_events() {
        let directory = StaticDirectory {
            searches: AtomicUsize::new(0),
        };
        let (tx, mut rx) = mpsc::channel(8);

        let count = directory.paged_search(&request(), 100, &tx).await.unwrap();
        drop(tx);

        assert_eq!(count, 2);
        assert_eq!(directory.searches.load(Ordering::SeqCst), 1);
        let mut ids = Vec::new();
        while let Some(FeedMessage::Change(event)) = rx.recv().await {
            assert_eq!(event.kind, crate::types::ChangeKind::Seen);
            ids.push(event.entry.id);
        }
        assert_eq!(ids, vec!["1", "2"]);
    }

    #[tokio::test]
    async fn test_closed_sink_is_cancelled() {
        let directory = StaticDirectory {
            searches: AtomicUsize::new(0),
        };
        let (tx, rx) = mpsc::channel(8);
        drop(rx);

        let err = directory.paged_search(&request(), 100, &tx).await.unwrap_err();
        assert!(matches!(err, ConnectorError::Cancelled));
    }

    #[tokio::test]
    async fn test_live_feeds_unsupported_by_default() {
        let directory = StaticDirectory {
            searches: AtomicUsize::new(0),
        };
        let (tx, _rx) = mpsc::channel(8);

        let err = directory.persistent_search(&request(), &tx).await.unwrap_err();
        assert_eq!(err.error_code(), "UNSUPPORTED");
        let err = directory
            .sync_replication(&request(), None, &tx)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "UNSUPPORTED");
    }
}
