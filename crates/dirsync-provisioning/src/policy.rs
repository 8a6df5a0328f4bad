//! Recipient policy.
//!
//! Computes the primary and secondary mail addresses of a user entry from
//! the configured templates, resolves collisions with other entries by
//! numeric suffixes, and writes the result back to the directory when it
//! differs from what is stored.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, instrument};

use dirsync_connector::entry::DirectoryEntry;
use dirsync_connector::filter::Filter;
use dirsync_connector::operation::{AttributeChange, Scope, SearchRequest};
use dirsync_connector::traits::Directory;

use crate::config::PolicyConfig;
use crate::error::{ConfigError, PolicyError, PolicyResult};
use crate::template::AddressTemplate;

/// Site-specific adjustments to policy decisions.
///
/// Both methods default to leaving the computed value unchanged.
pub trait PolicyHooks: Send + Sync {
    /// Rewrite or veto (`None`) a computed primary address.
    fn rewrite_primary(&self, _entry: &DirectoryEntry, candidate: String) -> Option<String> {
        Some(candidate)
    }

    /// Quota in KiB to enforce on the mail store, given the directory
    /// value and the current store value. `None` leaves the store alone.
    fn adjust_quota(
        &self,
        _entry: &DirectoryEntry,
        directory_quota: Option<u64>,
        _store_quota: Option<u64>,
    ) -> Option<u64> {
        directory_quota
    }
}

/// Hooks that change nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl PolicyHooks for NoopHooks {}

/// Outcome of applying the policy to one entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecipientPolicyResult {
    /// Canonical address, if one could be determined.
    pub primary: Option<String>,
    /// Secondary addresses, sorted.
    pub secondary: Vec<String>,
    /// Attributes written back to the directory.
    pub changed: BTreeSet<String>,
}

impl RecipientPolicyResult {
    /// Whether anything was written back.
    #[must_use]
    pub fn is_changed(&self) -> bool {
        !self.changed.is_empty()
    }
}

/// Applies address templates and collision handling.
pub struct RecipientPolicy {
    directory: Arc<dyn Directory>,
    hooks: Arc<dyn PolicyHooks>,
    primary_attribute: String,
    secondary_attribute: String,
    primary_template: AddressTemplate,
    secondary_templates: Vec<AddressTemplate>,
    max_suffix: u32,
    search_base: String,
    id_attribute: String,
}

impl RecipientPolicy {
    pub fn new(
        directory: Arc<dyn Directory>,
        config: &PolicyConfig,
        search_base: impl Into<String>,
        id_attribute: impl Into<String>,
        hooks: Arc<dyn PolicyHooks>,
    ) -> Result<Self, ConfigError> {
        let (primary_template, secondary_templates) = config.compile()?;
        Ok(Self {
            directory,
            hooks,
            primary_attribute: config.primary_mail_attribute.to_lowercase(),
            secondary_attribute: config.secondary_mail_attribute.to_lowercase(),
            primary_template,
            secondary_templates,
            max_suffix: config.max_collision_suffix,
            search_base: search_base.into(),
            id_attribute: id_attribute.into(),
        })
    }

    /// Hooks in effect, shared with the reconciler for quota decisions.
    #[must_use]
    pub fn hooks(&self) -> &Arc<dyn PolicyHooks> {
        &self.hooks
    }

    #[must_use]
    pub fn primary_attribute(&self) -> &str {
        &self.primary_attribute
    }

    /// Whether `attribute` feeds into any address template.
    #[must_use]
    pub fn uses_attribute(&self, attribute: &str) -> bool {
        self.primary_template.uses(attribute)
            || self.secondary_templates.iter().any(|t| t.uses(attribute))
    }

    /// Apply the policy. `domains` lists the namespace first, then its
    /// aliases. The entry's attributes are updated with what was written.
    #[instrument(skip_all, fields(entry_id = %entry.id, dn = %entry.dn))]
    pub async fn apply(
        &self,
        entry: &mut DirectoryEntry,
        domains: &[String],
    ) -> PolicyResult<RecipientPolicyResult> {
        self.fetch_missing(entry).await?;

        let existing_primary = entry
            .get_str(&self.primary_attribute)
            .map(str::to_lowercase);
        let existing_secondary: BTreeSet<String> = entry
            .attributes
            .get_all(&self.secondary_attribute)
            .into_iter()
            .map(str::to_lowercase)
            .collect();

        let primary = self
            .resolve_primary(entry, existing_primary.as_deref(), domains)
            .await?;

        let mut reserved = BTreeSet::new();
        if let Some(primary) = &primary {
            reserved.insert(primary.clone());
        }
        let mut secondary: BTreeSet<String> = existing_secondary.clone();
        for template in &self.secondary_templates {
            for domain in domains {
                let Some(candidate) = template.render(&entry.attributes, domain) else {
                    continue;
                };
                if reserved.contains(&candidate) || secondary.contains(&candidate) {
                    continue;
                }
                let address = self.allocate(entry, &candidate, &reserved).await?;
                secondary.insert(address);
            }
        }
        if let Some(primary) = &primary {
            secondary.remove(primary);
        }

        let mut changes = Vec::new();
        let mut changed = BTreeSet::new();
        if let Some(primary) = &primary {
            if existing_primary.as_deref() != Some(primary.as_str()) {
                changes.push(AttributeChange::replace(
                    self.primary_attribute.clone(),
                    [primary.clone()],
                ));
                changed.insert(self.primary_attribute.clone());
            }
        }
        if secondary != existing_secondary {
            changes.push(AttributeChange::replace(
                self.secondary_attribute.clone(),
                secondary.iter().cloned(),
            ));
            changed.insert(self.secondary_attribute.clone());
        }

        if !changes.is_empty() {
            info!(changed = ?changed, "Writing recipient addresses");
            self.directory.modify(&entry.dn, changes).await?;
            if let Some(primary) = &primary {
                entry.attributes.set(&self.primary_attribute, primary.clone());
            }
            entry.attributes.set(
                &self.secondary_attribute,
                secondary.iter().cloned().collect::<Vec<_>>(),
            );
        }

        Ok(RecipientPolicyResult {
            primary,
            secondary: secondary.into_iter().collect(),
            changed,
        })
    }

    async fn resolve_primary(
        &self,
        entry: &DirectoryEntry,
        existing: Option<&str>,
        domains: &[String],
    ) -> PolicyResult<Option<String>> {
        let Some(domain) = domains.first() else {
            return Ok(existing.map(str::to_string));
        };
        let Some(candidate) = self.primary_template.render(&entry.attributes, domain) else {
            debug!(template = %self.primary_template, "Primary template rendered nothing");
            return Ok(existing.map(str::to_string));
        };
        let Some(candidate) = self.hooks.rewrite_primary(entry, candidate) else {
            debug!("Primary address vetoed by hook");
            return Ok(existing.map(str::to_string));
        };

        let address = self.allocate(entry, &candidate, &BTreeSet::new()).await?;
        if existing.is_some_and(|existing| existing != address) {
            info!(from = ?existing, to = %address, "Primary address changed");
        }
        Ok(Some(address))
    }

    /// First of `candidate`, `local2@domain`, `local3@domain`, ... that no
    /// other entry holds and that is not reserved.
    async fn allocate(
        &self,
        entry: &DirectoryEntry,
        candidate: &str,
        reserved: &BTreeSet<String>,
    ) -> PolicyResult<String> {
        let candidate = candidate.to_lowercase();
        let (local, domain) = candidate
            .rsplit_once('@')
            .filter(|(local, domain)| !local.is_empty() && !domain.is_empty())
            .ok_or_else(|| PolicyError::InvalidAddress {
                address: candidate.clone(),
            })?;

        for n in 1..=self.max_suffix {
            let address = if n == 1 {
                candidate.clone()
            } else {
                format!("{local}{n}@{domain}")
            };
            if reserved.contains(&address) {
                continue;
            }
            if !self.taken_by_other(entry, &address).await? {
                if n > 1 {
                    info!(candidate = %candidate, address = %address, "Resolved address collision");
                }
                return Ok(address);
            }
        }

        Err(PolicyError::CollisionLimit {
            candidate,
            limit: self.max_suffix,
        })
    }

    async fn taken_by_other(&self, entry: &DirectoryEntry, address: &str) -> PolicyResult<bool> {
        let filter = Filter::and(vec![
            Filter::or(vec![
                Filter::eq(self.primary_attribute.clone(), address),
                Filter::eq(self.secondary_attribute.clone(), address),
            ]),
            Filter::negate(Filter::eq(self.id_attribute.clone(), entry.id.clone())),
        ]);
        let request = SearchRequest::subtree(self.search_base.clone(), filter)
            .with_attributes([self.id_attribute.clone()]);
        let holders = self.directory.search(&request).await?;
        Ok(!holders.is_empty())
    }

    /// Read the mail slots and template inputs the entry does not carry.
    async fn fetch_missing(&self, entry: &mut DirectoryEntry) -> PolicyResult<()> {
        let mut wanted: Vec<String> = vec![
            self.primary_attribute.clone(),
            self.secondary_attribute.clone(),
        ];
        wanted.extend(
            std::iter::once(&self.primary_template)
                .chain(&self.secondary_templates)
                .flat_map(AddressTemplate::attributes)
                .map(str::to_string),
        );
        wanted.sort();
        wanted.dedup();
        wanted.retain(|name| !entry.attributes.has(name));

        if wanted.is_empty() || entry.dn.is_empty() {
            return Ok(());
        }

        debug!(attributes = ?wanted, "Fetching missing attributes");
        let request = SearchRequest::subtree(entry.dn.clone(), Filter::present("objectClass"))
            .with_scope(Scope::Base)
            .with_attributes(wanted);
        match self.directory.search(&request).await {
            Ok(rows) => {
                if let Some(row) = rows.first() {
                    entry.attributes.fill_missing(&row.attributes);
                }
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
