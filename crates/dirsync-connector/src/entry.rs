//! Directory entries, attribute maps and change events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{ChangeKind, EntryType};

/// Value of a directory attribute: a single string or a list of strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// Single-valued attribute.
    Single(String),
    /// Multi-valued attribute.
    Multi(Vec<String>),
}

impl AttributeValue {
    /// Build a value from a list, collapsing one element to `Single`.
    /// Returns `None` for an empty list.
    #[must_use]
    pub fn from_values(mut values: Vec<String>) -> Option<Self> {
        match values.len() {
            0 => None,
            1 => values.pop().map(AttributeValue::Single),
            _ => Some(AttributeValue::Multi(values)),
        }
    }

    /// First value, if any.
    #[must_use]
    pub fn first(&self) -> Option<&str> {
        match self {
            AttributeValue::Single(s) => Some(s.as_str()),
            AttributeValue::Multi(v) => v.first().map(String::as_str),
        }
    }

    /// All values as string slices.
    #[must_use]
    pub fn values(&self) -> Vec<&str> {
        match self {
            AttributeValue::Single(s) => vec![s.as_str()],
            AttributeValue::Multi(v) => v.iter().map(String::as_str).collect(),
        }
    }

    /// Consume into owned values.
    #[must_use]
    pub fn into_values(self) -> Vec<String> {
        match self {
            AttributeValue::Single(s) => vec![s],
            AttributeValue::Multi(v) => v,
        }
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        AttributeValue::Single(s)
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        AttributeValue::Single(s.to_string())
    }
}

impl From<Vec<String>> for AttributeValue {
    fn from(v: Vec<String>) -> Self {
        AttributeValue::Multi(v)
    }
}

impl From<Vec<&str>> for AttributeValue {
    fn from(v: Vec<&str>) -> Self {
        AttributeValue::Multi(v.into_iter().map(str::to_string).collect())
    }
}

/// Attribute map with case-insensitive names (RFC 4512).
///
/// Names are stored lowercased; lookups lowercase the requested name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes {
    #[serde(flatten)]
    values: BTreeMap<String, AttributeValue>,
}

impl Attributes {
    /// Create an empty attribute map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an attribute value, replacing any previous value.
    pub fn set(&mut self, name: impl AsRef<str>, value: impl Into<AttributeValue>) {
        self.values
            .insert(name.as_ref().to_lowercase(), value.into());
    }

    /// Set an attribute using builder pattern.
    #[must_use]
    pub fn with(mut self, name: impl AsRef<str>, value: impl Into<AttributeValue>) -> Self {
        self.set(name, value);
        self
    }

    /// Get an attribute value.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&AttributeValue> {
        self.values.get(&name.to_lowercase())
    }

    /// Get the first value of an attribute.
    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(AttributeValue::first)
    }

    /// Get all values of an attribute (empty if absent).
    #[must_use]
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.get(name).map(AttributeValue::values).unwrap_or_default()
    }

    /// Check if an attribute is present.
    #[must_use]
    pub fn has(&self, name: &str) -> bool {
        self.values.contains_key(&name.to_lowercase())
    }

    /// Remove an attribute.
    pub fn remove(&mut self, name: &str) -> Option<AttributeValue> {
        self.values.remove(&name.to_lowercase())
    }

    /// Copy attributes from `other` that are not present here.
    pub fn fill_missing(&mut self, other: &Attributes) {
        for (name, value) in &other.values {
            self.values
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }
    }

    /// Attribute names (lowercased).
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Number of attributes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if the map is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K: AsRef<str>, V: Into<AttributeValue>> FromIterator<(K, V)> for Attributes {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut attrs = Attributes::new();
        for (k, v) in iter {
            attrs.set(k, v);
        }
        attrs
    }
}

/// An identity record read from the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    /// Directory-unique immutable identifier (e.g. entryUUID).
    pub id: String,
    /// Distinguished name.
    pub dn: String,
    /// Classified type.
    pub entry_type: EntryType,
    /// Attributes carried by the entry.
    pub attributes: Attributes,
    /// Last modification time reported by the directory.
    pub modified: Option<DateTime<Utc>>,
}

impl DirectoryEntry {
    /// Create an unclassified entry without attributes.
    pub fn new(id: impl Into<String>, dn: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            dn: dn.into(),
            entry_type: EntryType::Unknown,
            attributes: Attributes::new(),
            modified: None,
        }
    }

    /// Replace the attribute map.
    #[must_use]
    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }

    /// Set a single attribute.
    #[must_use]
    pub fn with_attribute(
        mut self,
        name: impl AsRef<str>,
        value: impl Into<AttributeValue>,
    ) -> Self {
        self.attributes.set(name, value);
        self
    }

    /// Set the modification timestamp.
    #[must_use]
    pub fn with_modified(mut self, modified: DateTime<Utc>) -> Self {
        self.modified = Some(modified);
        self
    }

    /// Set the entry type.
    #[must_use]
    pub fn with_type(mut self, entry_type: EntryType) -> Self {
        self.entry_type = entry_type;
        self
    }

    /// First value of an attribute.
    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.attributes.get_str(name)
    }

    /// The relative distinguished name as `(attribute, value)`.
    ///
    /// Multi-valued RDNs return their first component.
    #[must_use]
    pub fn rdn(&self) -> Option<(String, String)> {
        rdn_of(&self.dn)
    }
}

/// Split the leading RDN off a DN, honouring backslash escapes.
#[must_use]
pub fn rdn_of(dn: &str) -> Option<(String, String)> {
    let mut component = String::new();
    let mut escaped = false;
    for ch in dn.chars() {
        if escaped {
            component.push(ch);
            escaped = false;
            continue;
        }
        match ch {
            '\\' => escaped = true,
            ',' | '+' => break,
            _ => component.push(ch),
        }
    }
    let (attr, value) = component.split_once('=')?;
    let attr = attr.trim();
    if attr.is_empty() {
        return None;
    }
    Some((attr.to_lowercase(), value.trim().to_string()))
}

/// A change reported by a feed for one directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// What happened.
    pub kind: ChangeKind,
    /// Entry as of the change.
    pub entry: DirectoryEntry,
    /// Previous DN, for renames.
    pub previous_dn: Option<String>,
    /// Change sequence number, when the feed supplies one.
    pub sequence: Option<u64>,
}

impl ChangeEvent {
    /// Create an event of the given kind.
    #[must_use]
    pub fn new(kind: ChangeKind, entry: DirectoryEntry) -> Self {
        Self {
            kind,
            entry,
            previous_dn: None,
            sequence: None,
        }
    }

    /// Entry observed during a snapshot.
    #[must_use]
    pub fn seen(entry: DirectoryEntry) -> Self {
        Self::new(ChangeKind::Seen, entry)
    }

    /// Entry that was renamed from `previous_dn`.
    #[must_use]
    pub fn renamed(entry: DirectoryEntry, previous_dn: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::Rename,
            entry,
            previous_dn: Some(previous_dn.into()),
            sequence: None,
        }
    }

    /// Attach a change sequence number.
    #[must_use]
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Produce a copy of this event with the entry classified.
    #[must_use]
    pub fn classified(mut self, entry_type: EntryType) -> Self {
        self.entry.entry_type = entry_type;
        self
    }

    /// Type of the carried entry.
    #[must_use]
    pub fn entry_type(&self) -> EntryType {
        self.entry.entry_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_names_are_case_insensitive() {
        let attrs = Attributes::new()
            .with("givenName", "John")
            .with("MAIL", "john@example.org");

        assert_eq!(attrs.get_str("givenname"), Some("John"));
        assert_eq!(attrs.get_str("GivenName"), Some("John"));
        assert!(attrs.has("mail"));
        assert_eq!(attrs.names().collect::<Vec<_>>(), vec!["givenname", "mail"]);
    }

    #[test]
    fn test_multi_values() {
        let attrs = Attributes::new().with(
            "alias",
            vec!["a@example.org", "b@example.org"],
        );
        assert_eq!(attrs.get_all("alias").len(), 2);
        assert_eq!(attrs.get_str("alias"), Some("a@example.org"));
        assert!(attrs.get_all("missing").is_empty());
    }

    #[test]
    fn test_from_values_collapses() {
        assert_eq!(AttributeValue::from_values(vec![]), None);
        assert_eq!(
            AttributeValue::from_values(vec!["x".to_string()]),
            Some(AttributeValue::Single("x".to_string()))
        );
    }

    #[test]
    fn test_fill_missing_keeps_existing() {
        let mut attrs = Attributes::new().with("mail", "a@example.org");
        let other = Attributes::new()
            .with("mail", "b@example.org")
            .with("alias", "c@example.org");
        attrs.fill_missing(&other);
        assert_eq!(attrs.get_str("mail"), Some("a@example.org"));
        assert_eq!(attrs.get_str("alias"), Some("c@example.org"));
    }

    #[test]
    fn test_rdn_parsing() {
        assert_eq!(
            rdn_of("uid=jdoe,ou=People,dc=example,dc=org"),
            Some(("uid".to_string(), "jdoe".to_string()))
        );
        assert_eq!(
            rdn_of("cn=Doe\\, John,ou=People,dc=example,dc=org"),
            Some(("cn".to_string(), "Doe, John".to_string()))
        );
        assert_eq!(rdn_of("garbage"), None);
    }

    #[test]
    fn test_classified_sets_type() {
        let event = ChangeEvent::seen(DirectoryEntry::new("1", "uid=a,dc=x"));
        assert_eq!(event.entry_type(), EntryType::Unknown);
        let event = event.classified(EntryType::User);
        assert_eq!(event.entry_type(), EntryType::User);
        assert_eq!(event.kind, ChangeKind::Seen);
    }

    #[test]
    fn test_attributes_serialize_flat() {
        let attrs = Attributes::new().with("cn", "John");
        let json = serde_json::to_string(&attrs).unwrap();
        assert_eq!(json, r#"{"cn":"John"}"#);
    }
}
