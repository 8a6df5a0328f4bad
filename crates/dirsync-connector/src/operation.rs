//! Request and mutation types passed to collaborators.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::filter::Filter;

/// Search scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// The base object only.
    Base,
    /// Immediate children of the base.
    OneLevel,
    /// The base and everything below it.
    #[default]
    Subtree,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Scope::Base => "base",
            Scope::OneLevel => "one",
            Scope::Subtree => "sub",
        };
        f.write_str(s)
    }
}

/// A directory search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    /// Base DN.
    pub base: String,
    /// Scope below the base.
    pub scope: Scope,
    /// Filter entries must match.
    pub filter: Filter,
    /// Attributes to return. Empty means all user attributes.
    pub attributes: Vec<String>,
}

impl SearchRequest {
    /// Subtree search below `base`.
    pub fn subtree(base: impl Into<String>, filter: Filter) -> Self {
        Self {
            base: base.into(),
            scope: Scope::Subtree,
            filter,
            attributes: Vec::new(),
        }
    }

    /// Set the search scope.
    #[must_use]
    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    /// Restrict the returned attributes.
    #[must_use]
    pub fn with_attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes = attributes.into_iter().map(Into::into).collect();
        self
    }
}

/// One attribute modification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeChange {
    /// Replace all values. An empty list removes the attribute.
    Replace { attribute: String, values: Vec<String> },
    /// Add values.
    Add { attribute: String, values: Vec<String> },
    /// Delete values, or the whole attribute when `values` is empty.
    Delete { attribute: String, values: Vec<String> },
}

impl AttributeChange {
    /// Replace an attribute with the given values.
    pub fn replace<I, S>(attribute: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AttributeChange::Replace {
            attribute: attribute.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Name of the modified attribute.
    #[must_use]
    pub fn attribute(&self) -> &str {
        match self {
            AttributeChange::Replace { attribute, .. }
            | AttributeChange::Add { attribute, .. }
            | AttributeChange::Delete { attribute, .. } => attribute,
        }
    }
}

/// One access-control grant on a mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AclEntry {
    /// User, group (`group:` prefix), `anyone` or `anonymous`.
    pub subject: String,
    /// Rights letters, e.g. `lrswipkxtecdn`.
    pub rights: String,
}

impl AclEntry {
    /// Create a new grant.
    pub fn new(subject: impl Into<String>, rights: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            rights: rights.into(),
        }
    }

    /// Compare rights letters ignoring order.
    #[must_use]
    pub fn same_rights(&self, rights: &str) -> bool {
        let mut ours: Vec<char> = self.rights.chars().collect();
        let mut theirs: Vec<char> = rights.chars().collect();
        ours.sort_unstable();
        ours.dedup();
        theirs.sort_unstable();
        theirs.dedup();
        ours == theirs
    }
}
