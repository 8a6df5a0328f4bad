//! Shared enums and the domain topology model.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Kind of directory object an entry represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    /// Person with a personal mailbox.
    User,
    /// Group of users.
    Group,
    /// Bookable resource (room, car).
    Resource,
    /// Role object.
    Role,
    /// Shared folder in the mail store.
    SharedFolder,
    /// Not (yet) classified.
    #[default]
    Unknown,
}

impl EntryType {
    /// Known types in classification priority order.
    #[must_use]
    pub fn classification_order() -> &'static [EntryType] {
        &[
            EntryType::User,
            EntryType::Group,
            EntryType::SharedFolder,
            EntryType::Resource,
            EntryType::Role,
        ]
    }

    /// Every type, including `Unknown`.
    #[must_use]
    pub fn all() -> &'static [EntryType] {
        &[
            EntryType::User,
            EntryType::Group,
            EntryType::Resource,
            EntryType::Role,
            EntryType::SharedFolder,
            EntryType::Unknown,
        ]
    }

    /// Get the string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::User => "user",
            EntryType::Group => "group",
            EntryType::Resource => "resource",
            EntryType::Role => "role",
            EntryType::SharedFolder => "sharedfolder",
            EntryType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EntryType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(EntryType::User),
            "group" => Ok(EntryType::Group),
            "resource" => Ok(EntryType::Resource),
            "role" => Ok(EntryType::Role),
            "sharedfolder" | "shared_folder" => Ok(EntryType::SharedFolder),
            "unknown" => Ok(EntryType::Unknown),
            _ => Err(ParseEnumError::new("entry type", s)),
        }
    }
}

/// Kind of change a feed reported for an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Entry was created.
    Add,
    /// Entry was removed.
    Delete,
    /// Entry attributes changed.
    Modify,
    /// Entry was moved or its RDN changed.
    Rename,
    /// Entry observed in a snapshot; reconcile idempotently.
    Seen,
}

impl ChangeKind {
    /// Every change kind.
    #[must_use]
    pub fn all() -> &'static [ChangeKind] {
        &[
            ChangeKind::Add,
            ChangeKind::Delete,
            ChangeKind::Modify,
            ChangeKind::Rename,
            ChangeKind::Seen,
        ]
    }

    /// Get the string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Add => "add",
            ChangeKind::Delete => "delete",
            ChangeKind::Modify => "modify",
            ChangeKind::Rename => "rename",
            ChangeKind::Seen => "none",
        }
    }

    /// Map a persistent search change type bit (RFC draft-ietf-ldapext-psearch).
    #[must_use]
    pub fn from_psearch_change_type(value: i64) -> Option<Self> {
        match value {
            1 => Some(ChangeKind::Add),
            2 => Some(ChangeKind::Delete),
            4 => Some(ChangeKind::Modify),
            8 => Some(ChangeKind::Rename),
            _ => None,
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How change events are obtained from the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedStrategy {
    /// Long-lived persistent search with entry change notifications.
    Persistent,
    /// Content synchronization (RFC 4533) with a resumable cookie.
    SyncRepl,
    /// Paged snapshot of entries modified since the watermark.
    Paged,
    /// Plain snapshot search, last resort.
    Plain,
}

impl FeedStrategy {
    /// Strategies in preference order.
    #[must_use]
    pub fn preference_order() -> &'static [FeedStrategy] {
        &[
            FeedStrategy::Persistent,
            FeedStrategy::SyncRepl,
            FeedStrategy::Paged,
            FeedStrategy::Plain,
        ]
    }

    /// Server control OID that must be advertised for this strategy.
    #[must_use]
    pub fn required_control(&self) -> Option<&'static str> {
        match self {
            FeedStrategy::Persistent => Some(crate::oids::PERSISTENT_SEARCH),
            FeedStrategy::SyncRepl => Some(crate::oids::SYNC_REQUEST),
            FeedStrategy::Paged => Some(crate::oids::PAGED_RESULTS),
            FeedStrategy::Plain => None,
        }
    }

    /// Whether the strategy yields an unbounded stream of changes rather
    /// than a finite snapshot.
    #[must_use]
    pub fn is_continuous(&self) -> bool {
        matches!(self, FeedStrategy::Persistent | FeedStrategy::SyncRepl)
    }

    /// Get the string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedStrategy::Persistent => "persistent",
            FeedStrategy::SyncRepl => "syncrepl",
            FeedStrategy::Paged => "paged",
            FeedStrategy::Plain => "plain",
        }
    }
}

impl fmt::Display for FeedStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for FeedStrategy {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "persistent" | "psearch" => Ok(FeedStrategy::Persistent),
            "syncrepl" | "sync_repl" => Ok(FeedStrategy::SyncRepl),
            "paged" => Ok(FeedStrategy::Paged),
            "plain" | "normal" => Ok(FeedStrategy::Plain),
            _ => Err(ParseEnumError::new("feed strategy", s)),
        }
    }
}

/// Error parsing one of the enums above from a string.
#[derive(Debug, Clone)]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {} '{}'", self.kind, self.value)
    }
}

impl std::error::Error for ParseEnumError {}

/// Served namespaces: primary domain name to its alias domain names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainTopology {
    namespaces: BTreeMap<String, BTreeSet<String>>,
}

impl DomainTopology {
    /// Create an empty topology.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a primary namespace with its aliases. Names are lowercased.
    pub fn insert<I, S>(&mut self, primary: impl AsRef<str>, aliases: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let primary = primary.as_ref().to_lowercase();
        let entry = self.namespaces.entry(primary.clone()).or_default();
        for alias in aliases {
            let alias = alias.as_ref().to_lowercase();
            if alias != primary {
                entry.insert(alias);
            }
        }
    }

    /// Builder variant of [`DomainTopology::insert`].
    #[must_use]
    pub fn with<I, S>(mut self, primary: impl AsRef<str>, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.insert(primary, aliases);
        self
    }

    /// Primary namespace names, sorted.
    pub fn primaries(&self) -> impl Iterator<Item = &str> {
        self.namespaces.keys().map(String::as_str)
    }

    /// Alias names for a primary namespace.
    #[must_use]
    pub fn aliases(&self, primary: &str) -> Vec<String> {
        self.namespaces
            .get(primary)
            .map(|a| a.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Check whether a primary namespace is present.
    #[must_use]
    pub fn contains(&self, primary: &str) -> bool {
        self.namespaces.contains_key(primary)
    }

    /// Number of primary namespaces.
    #[must_use]
    pub fn len(&self) -> usize {
        self.namespaces.len()
    }

    /// Check if no namespaces are known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
    }
}
