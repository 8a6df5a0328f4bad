//! Entry classification.
//!
//! Each known type has one filter. Rules are tried in priority order and
//! the first match wins. A filter is evaluated against the entry's own
//! attributes first; the directory is asked only when the local answer is
//! indeterminate because the entry lacks a referenced attribute.

use std::sync::Arc;

use tracing::{debug, warn};

use dirsync_connector::entry::DirectoryEntry;
use dirsync_connector::filter::Filter;
use dirsync_connector::operation::SearchRequest;
use dirsync_connector::traits::Directory;
use dirsync_connector::types::EntryType;

use crate::config::ClassifierConfig;
use crate::error::ConfigError;

#[derive(Debug, Clone)]
struct TypeRule {
    entry_type: EntryType,
    filter: Filter,
    base_dn: String,
}

/// Assigns an [`EntryType`] to directory entries.
pub struct EntryClassifier {
    directory: Arc<dyn Directory>,
    rules: Vec<TypeRule>,
    id_attribute: String,
}

impl EntryClassifier {
    /// Build the rules for one namespace. Fails when a filter does not parse.
    pub fn new(
        directory: Arc<dyn Directory>,
        config: &ClassifierConfig,
        namespace_base_dn: &str,
        id_attribute: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let rules = config
            .compile()?
            .into_iter()
            .filter_map(|(entry_type, filter)| {
                config.rule(entry_type).map(|rule| TypeRule {
                    entry_type,
                    filter,
                    base_dn: rule.resolve_base(namespace_base_dn),
                })
            })
            .collect();

        Ok(Self {
            directory,
            rules,
            id_attribute: id_attribute.into(),
        })
    }

    /// Type filters in priority order, for composing feed filters.
    #[must_use]
    pub fn type_filters(&self) -> Vec<Filter> {
        self.rules.iter().map(|r| r.filter.clone()).collect()
    }

    /// Classify an entry. Already-typed entries are returned unchanged.
    pub async fn classify(&self, entry: &DirectoryEntry) -> EntryType {
        if entry.entry_type != EntryType::Unknown {
            return entry.entry_type;
        }

        for rule in &self.rules {
            if !within_base(&entry.dn, &rule.base_dn) {
                continue;
            }
            let matched = match rule.filter.evaluate(&entry.attributes) {
                Some(matched) => matched,
                None => self.matches_remotely(rule, entry).await,
            };
            if matched {
                debug!(entry_id = %entry.id, entry_type = %rule.entry_type, "Classified entry");
                return rule.entry_type;
            }
        }

        debug!(entry_id = %entry.id, dn = %entry.dn, "Entry matches no type");
        EntryType::Unknown
    }

    async fn matches_remotely(&self, rule: &TypeRule, entry: &DirectoryEntry) -> bool {
        if entry.id.is_empty() {
            return false;
        }
        let filter = rule
            .filter
            .clone()
            .and_with(Filter::eq(self.id_attribute.clone(), entry.id.clone()));
        let request = SearchRequest::subtree(rule.base_dn.clone(), filter)
            .with_attributes([self.id_attribute.clone()]);

        match self.directory.search(&request).await {
            Ok(rows) => !rows.is_empty(),
            Err(e) => {
                warn!(
                    entry_id = %entry.id,
                    entry_type = %rule.entry_type,
                    error = %e,
                    "Classification lookup failed, treating as no match"
                );
                false
            }
        }
    }
}

/// Whether `dn` lies at or below `base` (case-insensitive, whitespace
/// around separators ignored). An empty base contains everything.
fn within_base(dn: &str, base: &str) -> bool {
    let base = canonical_dn(base);
    if base.is_empty() {
        return true;
    }
    let dn = canonical_dn(dn);
    dn == base || dn.ends_with(&format!(",{base}"))
}

fn canonical_dn(dn: &str) -> String {
    dn.split(',')
        .map(|rdn| rdn.trim().to_lowercase())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dirsync_connector::error::{ConnectorError, ConnectorResult};
    use dirsync_connector::operation::AttributeChange;
    use dirsync_connector::types::DomainTopology;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers searches from a fixed set of entries.
    struct FixedDirectory {
        entries: Vec<DirectoryEntry>,
        searches: AtomicUsize,
        fail: bool,
    }

    impl FixedDirectory {
        fn new(entries: Vec<DirectoryEntry>) -> Self {
            Self {
                entries,
                searches: AtomicUsize::new(0),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl Directory for FixedDirectory {
        fn display_name(&self) -> &str {
            "fixed"
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

        async fn search(&self, request: &SearchRequest) -> ConnectorResult<Vec<DirectoryEntry>> {
            self.searches.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ConnectorError::operation_failed("boom"));
            }
            Ok(self
                .entries
                .iter()
                .filter(|e| {
                    let mut attrs = e.attributes.clone();
                    attrs.set("entryUUID", e.id.clone());
                    request.filter.evaluate(&attrs) == Some(true)
                })
                .cloned()
                .collect())
        }

        async fn modify(&self, _dn: &str, _changes: Vec<AttributeChange>) -> ConnectorResult<()> {
            Ok(())
        }

        async fn list_namespaces(&self) -> ConnectorResult<DomainTopology> {
            Ok(DomainTopology::new())
        }
    }

    const BASE: &str = "dc=example,dc=org";

    fn classifier(directory: Arc<FixedDirectory>) -> EntryClassifier {
        EntryClassifier::new(directory, &ClassifierConfig::default(), BASE, "entryUUID").unwrap()
    }

    fn user() -> DirectoryEntry {
        DirectoryEntry::new("u1", "uid=jdoe,ou=People,dc=example,dc=org")
            .with_attribute("objectClass", vec!["top", "inetOrgPerson", "kolabInetOrgPerson"])
    }

    #[tokio::test]
    async fn test_local_match_needs_no_search() {
        let directory = Arc::new(FixedDirectory::new(Vec::new()));
        let classifier = classifier(directory.clone());

        assert_eq!(classifier.classify(&user()).await, EntryType::User);
        assert_eq!(directory.searches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_priority_order() {
        let directory = Arc::new(FixedDirectory::new(Vec::new()));
        let classifier = classifier(directory);
        let entry = DirectoryEntry::new("g1", "cn=sales,ou=Groups,dc=example,dc=org")
            .with_attribute("objectClass", vec!["groupOfUniqueNames", "kolabSharedFolder"]);

        assert_eq!(classifier.classify(&entry).await, EntryType::Group);
    }

    #[tokio::test]
    async fn test_missing_attributes_fall_back_to_directory() {
        let stored = DirectoryEntry::new("f1", "cn=Sales,ou=Shared,dc=example,dc=org")
            .with_attribute("objectClass", "kolabSharedFolder");
        let directory = Arc::new(FixedDirectory::new(vec![stored]));
        let classifier = classifier(directory.clone());

        let bare = DirectoryEntry::new("f1", "cn=Sales,ou=Shared,dc=example,dc=org");
        assert_eq!(classifier.classify(&bare).await, EntryType::SharedFolder);
        assert!(directory.searches.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_lookup_failure_is_unknown() {
        let directory = Arc::new(FixedDirectory {
            fail: true,
            ..FixedDirectory::new(Vec::new())
        });
        let classifier = classifier(directory.clone());

        let bare = DirectoryEntry::new("x", "cn=x,dc=example,dc=org");
        assert_eq!(classifier.classify(&bare).await, EntryType::Unknown);
        assert_eq!(directory.searches.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_entry_outside_base_is_unknown() {
        let directory = Arc::new(FixedDirectory::new(Vec::new()));
        let classifier = classifier(directory);
        let entry = DirectoryEntry::new("u2", "uid=jdoe,dc=other,dc=net")
            .with_attribute("objectClass", "kolabInetOrgPerson");

        assert_eq!(classifier.classify(&entry).await, EntryType::Unknown);
    }

    #[tokio::test]
    async fn test_typed_entry_is_kept() {
        let directory = Arc::new(FixedDirectory::new(Vec::new()));
        let classifier = classifier(directory);
        let entry = DirectoryEntry::new("r1", "cn=car,dc=example,dc=org").with_type(EntryType::Resource);

        assert_eq!(classifier.classify(&entry).await, EntryType::Resource);
    }

    #[test]
    fn test_within_base() {
        assert!(within_base("uid=a, OU=People,DC=Example,dc=org", BASE));
        assert!(within_base(BASE, BASE));
        assert!(!within_base("uid=a,dc=xexample,dc=org", "dc=example,dc=org"));
        assert!(within_base("uid=a", ""));
    }
}
