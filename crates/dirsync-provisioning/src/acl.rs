//! Shared-folder ACL values.
//!
//! Directory entries carry grants as free text, one per value:
//! `subject, rights[, expiry epoch]`, for example
//! `group:sales@example.org, full` or `contractor@example.org, read, 1767225600`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

/// Subject that receives the delivery grant.
pub const ANYONE: &str = "anyone";

/// Right allowing delivery (posting) into a folder.
pub const POST_RIGHT: &str = "p";

/// Expand a symbolic rights name to IMAP ACL rights letters. Anything
/// else is taken as literal rights.
#[must_use]
pub fn expand_rights(rights: &str) -> String {
    match rights.trim().to_ascii_lowercase().as_str() {
        "all" => "lrsedntxakcpiw".to_string(),
        "append" => "wip".to_string(),
        "full" => "lrswipkxtecdn".to_string(),
        "read" => "lrs".to_string(),
        "semi-full" => "lrswit".to_string(),
        "write" => "lrswite".to_string(),
        "post" => POST_RIGHT.to_string(),
        other => other.to_string(),
    }
}

/// Union of two rights strings, keeping first-seen order.
#[must_use]
pub fn merge_rights(a: &str, b: &str) -> String {
    let mut merged = String::with_capacity(a.len() + b.len());
    for c in a.chars().chain(b.chars()) {
        if !merged.contains(c) {
            merged.push(c);
        }
    }
    merged
}

/// One parsed grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderAcl {
    pub subject: String,
    pub rights: String,
    pub expires: Option<DateTime<Utc>>,
}

impl FolderAcl {
    /// Parse one attribute value. Returns `None` for malformed values.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let parts: Vec<&str> = value.split(',').map(str::trim).collect();
        let (subject, rights, expires) = match parts.as_slice() {
            [subject, rights] => (*subject, *rights, None),
            [subject, rights, epoch] => {
                let epoch: i64 = epoch.parse().ok()?;
                (*subject, *rights, Some(DateTime::from_timestamp(epoch, 0)?))
            }
            _ => return None,
        };
        if subject.is_empty() || rights.is_empty() {
            return None;
        }
        Some(Self {
            subject: subject.to_lowercase(),
            rights: expand_rights(rights),
            expires,
        })
    }

    /// Check whether the grant has lapsed at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|expires| expires <= now)
    }
}

/// Split raw values into the grants to apply (subject to rights, merged
/// per subject) and the subjects whose grants have expired.
#[must_use]
pub fn partition_grants<'a, I>(values: I, now: DateTime<Utc>) -> (BTreeMap<String, String>, Vec<String>)
where
    I: IntoIterator<Item = &'a str>,
{
    let mut active: BTreeMap<String, String> = BTreeMap::new();
    let mut expired = Vec::new();

    for value in values {
        let Some(acl) = FolderAcl::parse(value) else {
            tracing::warn!(value = %value, "Ignoring malformed ACL value");
            continue;
        };
        if acl.is_expired(now) {
            expired.push(acl.subject);
            continue;
        }
        active
            .entry(acl.subject)
            .and_modify(|rights| *rights = merge_rights(rights, &acl.rights))
            .or_insert(acl.rights);
    }

    expired.retain(|subject| !active.contains_key(subject));
    expired.sort();
    expired.dedup();
    (active, expired)
}
