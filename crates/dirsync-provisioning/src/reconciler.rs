//! Mail store reconciliation.
//!
//! One classified change event in, the mail store mutations it implies
//! out. Handlers are looked up in a table keyed by change kind and entry
//! type; combinations without a handler do nothing.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use dirsync_connector::entry::{rdn_of, ChangeEvent, DirectoryEntry};
use dirsync_connector::operation::AttributeChange;
use dirsync_connector::traits::{Directory, MailStore};
use dirsync_connector::types::{ChangeKind, EntryType};

use crate::acl::{merge_rights, partition_grants, FolderAcl, ANYONE, POST_RIGHT};
use crate::config::{AuxiliaryFolder, MailboxNaming, ProvisioningConfig, SharedFolderConfig};
use crate::error::{ReconcileError, ReconcileResult};
use crate::policy::RecipientPolicy;
use crate::watermark::{WatermarkCache, WatermarkRecord};

/// Private folder-type annotation.
pub const PRIVATE_FOLDER_TYPE_KEY: &str = "/private/vendor/kolab/folder-type";

/// Shared folder-type annotation.
pub const SHARED_FOLDER_TYPE_KEY: &str = "/shared/vendor/kolab/folder-type";

/// Subject prefix for group grants.
const GROUP_SUBJECT_PREFIX: &str = "group:";

/// What to do for a `(ChangeKind, EntryType)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Handler {
    /// Apply the recipient policy and make sure the mailbox exists.
    UserUpsert,
    /// Re-run the policy only if the new RDN feeds an address template.
    UserRename,
    /// Delete the mailbox and every grant naming the user.
    UserDelete,
    /// Create or update a shared folder and its grants.
    SharedFolderUpsert,
    /// Move a shared folder to its new path.
    SharedFolderRename,
    /// Purge grants naming the group.
    GroupDelete,
    /// Resolve the deleted entry through its watermark record.
    UnknownDelete,
    /// Accepted without any action.
    Noop,
}

/// Result of reconciling one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Mutations were applied (or found unnecessary) and the cache updated.
    Applied,
    /// The entry was already reconciled at this modification time.
    Replay,
    /// Nothing to do for this event.
    NoOp,
}

enum Previous {
    Replay,
    Record(Option<WatermarkRecord>),
}

/// Dispatch table for every change kind and entry type.
#[must_use]
pub fn dispatch_table() -> HashMap<(ChangeKind, EntryType), Handler> {
    let mut table = HashMap::new();
    for kind in ChangeKind::all() {
        for entry_type in EntryType::all() {
            let handler = match (entry_type, kind) {
                (EntryType::User, ChangeKind::Add | ChangeKind::Seen | ChangeKind::Modify) => {
                    Handler::UserUpsert
                }
                (EntryType::User, ChangeKind::Rename) => Handler::UserRename,
                (EntryType::User, ChangeKind::Delete) => Handler::UserDelete,
                (
                    EntryType::SharedFolder,
                    ChangeKind::Add | ChangeKind::Seen | ChangeKind::Modify,
                ) => Handler::SharedFolderUpsert,
                (EntryType::SharedFolder, ChangeKind::Rename) => Handler::SharedFolderRename,
                (EntryType::Group, ChangeKind::Delete) => Handler::GroupDelete,
                (EntryType::Unknown, ChangeKind::Delete) => Handler::UnknownDelete,
                _ => Handler::Noop,
            };
            table.insert((*kind, *entry_type), handler);
        }
    }
    table
}

/// Applies change events for one namespace.
pub struct Reconciler {
    directory: Arc<dyn Directory>,
    store: Arc<dyn MailStore>,
    policy: RecipientPolicy,
    dispatch: HashMap<(ChangeKind, EntryType), Handler>,
    naming: MailboxNaming,
    shared: SharedFolderConfig,
    auxiliary_folders: Vec<AuxiliaryFolder>,
    quota_attribute: String,
    mailhost_attribute: String,
}

impl Reconciler {
    pub fn new(
        directory: Arc<dyn Directory>,
        store: Arc<dyn MailStore>,
        policy: RecipientPolicy,
        config: &ProvisioningConfig,
    ) -> Self {
        Self {
            directory,
            store,
            policy,
            dispatch: dispatch_table(),
            naming: config.sync.naming.clone(),
            shared: config.shared_folders.clone(),
            auxiliary_folders: config.auxiliary_folders.clone(),
            quota_attribute: config.sync.quota_attribute.clone(),
            mailhost_attribute: config.sync.mailhost_attribute.clone(),
        }
    }

    /// Handler for a change kind and entry type.
    #[must_use]
    pub fn handler(&self, kind: ChangeKind, entry_type: EntryType) -> Handler {
        self.dispatch
            .get(&(kind, entry_type))
            .copied()
            .unwrap_or(Handler::Noop)
    }

    /// Reconcile one classified event. `domains` lists the namespace
    /// first, then its aliases.
    #[instrument(
        skip_all,
        fields(
            namespace = %cache.namespace(),
            entry_id = %event.entry.id,
            change_kind = %event.kind,
            entry_type = %event.entry_type(),
        )
    )]
    pub async fn reconcile(
        &self,
        event: &ChangeEvent,
        cache: &WatermarkCache,
        domains: &[String],
    ) -> ReconcileResult<Outcome> {
        let handler = self.handler(event.kind, event.entry_type());
        debug!(handler = ?handler, "Dispatching change");

        let outcome = match handler {
            Handler::UserUpsert => self.user_upsert(&event.entry, cache, domains).await?,
            Handler::UserRename => self.user_rename(&event.entry, cache, domains).await?,
            Handler::UserDelete => {
                let record = cache.get(&event.entry.id).await?;
                let address = record
                    .and_then(|r| r.result_address)
                    .or_else(|| self.entry_address(&event.entry));
                self.user_delete(&event.entry.id, address, cache).await?
            }
            Handler::SharedFolderUpsert => {
                self.shared_folder_upsert(&event.entry, cache, domains, None)
                    .await?
            }
            Handler::SharedFolderRename => {
                self.shared_folder_rename(event, cache, domains).await?
            }
            Handler::GroupDelete => self.group_delete(&event.entry).await?,
            Handler::UnknownDelete => self.unknown_delete(&event.entry.id, cache).await?,
            Handler::Noop => Outcome::NoOp,
        };

        debug!(outcome = ?outcome, "Change reconciled");
        Ok(outcome)
    }

    /// Recorded state of an entry, unless this exact modification was
    /// already applied.
    async fn previous_state(
        &self,
        entry: &DirectoryEntry,
        cache: &WatermarkCache,
    ) -> ReconcileResult<Previous> {
        let record = cache.get(&entry.id).await?;
        if let Some(record) = &record {
            if record.modified.is_some() && record.modified == entry.modified {
                debug!("Entry already reconciled at this modification time");
                return Ok(Previous::Replay);
            }
        }
        Ok(Previous::Record(record))
    }

    async fn user_upsert(
        &self,
        entry: &DirectoryEntry,
        cache: &WatermarkCache,
        domains: &[String],
    ) -> ReconcileResult<Outcome> {
        let Previous::Record(record) = self.previous_state(entry, cache).await? else {
            return Ok(Outcome::Replay);
        };
        self.apply_user(entry, record, cache, domains).await
    }

    async fn apply_user(
        &self,
        entry: &DirectoryEntry,
        record: Option<WatermarkRecord>,
        cache: &WatermarkCache,
        domains: &[String],
    ) -> ReconcileResult<Outcome> {
        let mut entry = entry.clone();
        let result = self.policy.apply(&mut entry, domains).await?;
        let Some(address) = result.primary else {
            warn!(dn = %entry.dn, "No canonical address for user, skipping mailbox");
            return Ok(Outcome::NoOp);
        };

        let mailbox = self.naming.user_mailbox(&address);
        let server = entry
            .get_str(&self.mailhost_attribute)
            .map(str::to_string);
        let previous = record
            .and_then(|r| r.result_address)
            .filter(|previous| *previous != address);

        if !self.store.mailbox_exists(&mailbox).await? {
            let previous_mailbox = match previous {
                Some(previous) => {
                    let path = self.naming.user_mailbox(&previous);
                    self.store.mailbox_exists(&path).await?.then_some(path)
                }
                None => None,
            };

            match previous_mailbox {
                Some(from) => {
                    info!(from = %from, to = %mailbox, "Renaming mailbox");
                    self.store.rename_mailbox(&from, &mailbox, None).await?;
                }
                None => {
                    info!(mailbox = %mailbox, server = ?server, "Creating mailbox");
                    self.store
                        .create_mailbox(&mailbox, server.as_deref())
                        .await?;
                    self.create_auxiliary_folders(&address, server.as_deref())
                        .await?;
                }
            }
        }

        self.reconcile_mailhost(&entry, &mailbox).await?;
        self.reconcile_quota(&entry, &mailbox).await?;

        let record = WatermarkRecord::new(entry.id.clone())
            .with_result_address(address)
            .with_modified(entry.modified);
        cache.upsert(&record).await?;
        Ok(Outcome::Applied)
    }

    async fn create_auxiliary_folders(
        &self,
        address: &str,
        server: Option<&str>,
    ) -> ReconcileResult<()> {
        for folder in &self.auxiliary_folders {
            let path = self.naming.user_folder(address, &folder.name);
            debug!(folder = %path, "Creating auxiliary folder");
            self.store.create_mailbox(&path, server).await?;

            if let Some(folder_type) = &folder.folder_type {
                self.set_folder_type(&path, folder_type).await?;
            }
            for value in &folder.acl {
                match FolderAcl::parse(value) {
                    Some(grant) => {
                        self.store
                            .set_acl(&path, &grant.subject, &grant.rights)
                            .await?;
                    }
                    None => warn!(folder = %path, value = %value, "Ignoring malformed folder ACL"),
                }
            }
            if let Some(quota) = folder.quota_kib {
                self.store.set_quota(&path, quota).await?;
            }
        }
        Ok(())
    }

    async fn set_folder_type(&self, path: &str, folder_type: &str) -> ReconcileResult<()> {
        let shared_type = folder_type.split('.').next().unwrap_or(folder_type);
        self.store
            .set_metadata(path, PRIVATE_FOLDER_TYPE_KEY, folder_type)
            .await?;
        self.store
            .set_metadata(path, SHARED_FOLDER_TYPE_KEY, shared_type)
            .await?;
        Ok(())
    }

    /// Write the mailbox's actual backend server back to the entry.
    async fn reconcile_mailhost(&self, entry: &DirectoryEntry, mailbox: &str) -> ReconcileResult<()> {
        let Some(actual) = self.store.mailbox_host(mailbox).await? else {
            return Ok(());
        };
        let recorded = entry.get_str(&self.mailhost_attribute);
        if recorded.is_some_and(|r| r.eq_ignore_ascii_case(&actual)) {
            return Ok(());
        }

        info!(recorded = ?recorded, actual = %actual, "Updating mail host");
        self.directory
            .modify(
                &entry.dn,
                vec![AttributeChange::replace(
                    self.mailhost_attribute.clone(),
                    [actual],
                )],
            )
            .await?;
        Ok(())
    }

    /// Make the store quota match the directory, as adjusted by the hooks.
    async fn reconcile_quota(&self, entry: &DirectoryEntry, mailbox: &str) -> ReconcileResult<()> {
        let directory_quota = entry
            .get_str(&self.quota_attribute)
            .and_then(|v| v.trim().parse::<u64>().ok());
        let store_quota = self.store.get_quota(mailbox).await?;

        let target = self
            .policy
            .hooks()
            .adjust_quota(entry, directory_quota, store_quota);
        if let Some(target) = target {
            if Some(target) != store_quota {
                info!(mailbox, from = ?store_quota, to = target, "Adjusting quota");
                self.store.set_quota(mailbox, target).await?;
            }
        }
        Ok(())
    }

    async fn user_rename(
        &self,
        entry: &DirectoryEntry,
        cache: &WatermarkCache,
        domains: &[String],
    ) -> ReconcileResult<Outcome> {
        let record = cache.get(&entry.id).await?;
        let rdn_attribute = entry.rdn().map(|(attribute, _)| attribute);
        let affects_address = rdn_attribute
            .as_deref()
            .is_some_and(|attribute| self.policy.uses_attribute(attribute));

        match record {
            Some(record) if !affects_address => {
                debug!(rdn = ?rdn_attribute, "Renamed attribute does not affect addresses");
                let record = record.with_modified(entry.modified);
                cache.upsert(&record).await?;
                Ok(Outcome::Applied)
            }
            record => self.apply_user(entry, record, cache, domains).await,
        }
    }

    async fn user_delete(
        &self,
        entry_id: &str,
        address: Option<String>,
        cache: &WatermarkCache,
    ) -> ReconcileResult<Outcome> {
        let Some(address) = address else {
            debug!("No address known for deleted user");
            cache.remove(entry_id).await?;
            return Ok(Outcome::NoOp);
        };

        let mailbox = self.naming.user_mailbox(&address);
        info!(mailbox = %mailbox, "Deleting mailbox");
        self.store.delete_mailbox(&mailbox).await?;
        self.purge_grants(&[address]).await?;
        cache.remove(entry_id).await?;
        Ok(Outcome::Applied)
    }

    async fn group_delete(&self, entry: &DirectoryEntry) -> ReconcileResult<Outcome> {
        let Some(address) = self.entry_address(entry) else {
            return Ok(Outcome::NoOp);
        };
        let subjects = [
            format!("{GROUP_SUBJECT_PREFIX}{address}"),
            address,
        ];
        self.purge_grants(&subjects).await?;
        Ok(Outcome::Applied)
    }

    async fn unknown_delete(&self, entry_id: &str, cache: &WatermarkCache) -> ReconcileResult<Outcome> {
        let Some(record) = cache.get(entry_id).await? else {
            debug!("Deleted entry was never reconciled");
            return Ok(Outcome::NoOp);
        };
        match record.result_address {
            Some(path) if self.naming.is_shared(&path) => {
                debug!(folder = %path, "Shared folder entry deleted, folder kept");
                cache.remove(entry_id).await?;
                Ok(Outcome::NoOp)
            }
            address => self.user_delete(entry_id, address, cache).await,
        }
    }

    /// Remove every grant for `subjects` from every mailbox.
    async fn purge_grants(&self, subjects: &[String]) -> ReconcileResult<()> {
        let mailboxes = self
            .store
            .list_mailboxes(self.naming.all_mailboxes())
            .await?;
        for mailbox in mailboxes {
            let grants = match self.store.get_acl(&mailbox).await {
                Ok(grants) => grants,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e.into()),
            };
            for grant in grants {
                if !subjects
                    .iter()
                    .any(|s| s.eq_ignore_ascii_case(&grant.subject))
                {
                    continue;
                }
                debug!(mailbox = %mailbox, subject = %grant.subject, "Removing grant");
                match self.store.delete_acl(&mailbox, &grant.subject).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    fn entry_address(&self, entry: &DirectoryEntry) -> Option<String> {
        entry
            .get_str(self.policy.primary_attribute())
            .map(str::to_lowercase)
    }

    /// Folder path of a shared-folder entry: explicit target, then the
    /// delivery address, then the entry name.
    fn shared_folder_path(&self, entry: &DirectoryEntry, domain: &str) -> Option<String> {
        if let Some(target) = entry.get_str(&self.shared.target_folder_attribute) {
            let target = target.trim();
            if self.naming.is_shared(target) {
                return Some(target.to_string());
            }
            if let Some((name, target_domain)) = target.rsplit_once('@') {
                return Some(self.naming.shared_folder(name, target_domain));
            }
            return Some(self.naming.shared_folder(target, domain));
        }
        if let Some((local, address_domain)) = entry
            .get_str(&self.shared.delivery_address_attribute)
            .and_then(|address| address.trim().rsplit_once('@'))
        {
            return Some(
                self.naming
                    .shared_folder(local, &address_domain.to_lowercase()),
            );
        }
        entry
            .get_str(&self.shared.name_attribute)
            .map(|name| self.naming.shared_folder(name.trim(), domain))
    }

    async fn shared_folder_upsert(
        &self,
        entry: &DirectoryEntry,
        cache: &WatermarkCache,
        domains: &[String],
        previous_path: Option<String>,
    ) -> ReconcileResult<Outcome> {
        let Previous::Record(record) = self.previous_state(entry, cache).await? else {
            return Ok(Outcome::Replay);
        };
        let Some(domain) = domains.first() else {
            return Err(ReconcileError::incomplete(&entry.id, "no namespace domain"));
        };
        let path = self
            .shared_folder_path(entry, domain)
            .ok_or_else(|| ReconcileError::incomplete(&entry.id, "cannot resolve folder path"))?;
        let previous = record
            .and_then(|r| r.result_address)
            .or(previous_path)
            .filter(|previous| *previous != path);

        if !self.store.mailbox_exists(&path).await? {
            let moved = match previous {
                Some(previous) if self.store.mailbox_exists(&previous).await? => {
                    info!(from = %previous, to = %path, "Renaming shared folder");
                    self.store.rename_mailbox(&previous, &path, None).await?;
                    true
                }
                _ => false,
            };
            if !moved {
                info!(folder = %path, "Creating shared folder");
                let server = entry.get_str(&self.mailhost_attribute);
                self.store.create_mailbox(&path, server).await?;
            }
        }

        let folder_type = entry
            .get_str(&self.shared.folder_type_attribute)
            .unwrap_or(self.shared.default_folder_type.as_str())
            .to_string();
        let current_type = self
            .store
            .get_metadata(&path, PRIVATE_FOLDER_TYPE_KEY)
            .await?;
        if current_type.as_deref() != Some(folder_type.as_str()) {
            self.set_folder_type(&path, &folder_type).await?;
        }

        self.reconcile_folder_acl(entry, &path).await?;

        let record = WatermarkRecord::new(entry.id.clone())
            .with_result_address(path)
            .with_modified(entry.modified);
        cache.upsert(&record).await?;
        Ok(Outcome::Applied)
    }

    async fn reconcile_folder_acl(&self, entry: &DirectoryEntry, path: &str) -> ReconcileResult<()> {
        let (mut desired, expired) = partition_grants(
            entry.attributes.get_all(&self.shared.acl_attribute),
            Utc::now(),
        );
        if entry.get_str(&self.shared.delivery_address_attribute).is_some() {
            desired
                .entry(ANYONE.to_string())
                .and_modify(|rights| *rights = merge_rights(rights, POST_RIGHT))
                .or_insert_with(|| POST_RIGHT.to_string());
        }
        if !expired.is_empty() {
            info!(folder = %path, subjects = ?expired, "Clearing expired grants");
        }

        let current: BTreeMap<String, _> = self
            .store
            .get_acl(path)
            .await?
            .into_iter()
            .map(|grant| (grant.subject.to_lowercase(), grant))
            .collect();

        for (subject, rights) in &desired {
            let unchanged = current
                .get(subject)
                .is_some_and(|grant| grant.same_rights(rights));
            if !unchanged {
                debug!(folder = %path, subject = %subject, rights = %rights, "Setting grant");
                self.store.set_acl(path, subject, rights).await?;
            }
        }
        for (subject, grant) in &current {
            if !desired.contains_key(subject) {
                debug!(folder = %path, subject = %grant.subject, "Removing stale grant");
                self.store.delete_acl(path, &grant.subject).await?;
            }
        }
        Ok(())
    }

    async fn shared_folder_rename(
        &self,
        event: &ChangeEvent,
        cache: &WatermarkCache,
        domains: &[String],
    ) -> ReconcileResult<Outcome> {
        let previous_path = event.previous_dn.as_deref().and_then(|dn| {
            let (attribute, value) = rdn_of(dn)?;
            let domain = domains.first()?;
            attribute
                .eq_ignore_ascii_case(&self.shared.name_attribute)
                .then(|| self.naming.shared_folder(&value, domain))
        });
        self.shared_folder_upsert(&event.entry, cache, domains, previous_path)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_table_covers_every_pair() {
        let table = dispatch_table();
        assert_eq!(table.len(), ChangeKind::all().len() * EntryType::all().len());
    }

    #[test]
    fn test_dispatch_handlers() {
        let table = dispatch_table();
        let get = |kind, entry_type| table[&(kind, entry_type)];

        assert_eq!(get(ChangeKind::Seen, EntryType::User), Handler::UserUpsert);
        assert_eq!(get(ChangeKind::Modify, EntryType::User), Handler::UserUpsert);
        assert_eq!(get(ChangeKind::Rename, EntryType::User), Handler::UserRename);
        assert_eq!(get(ChangeKind::Delete, EntryType::User), Handler::UserDelete);
        assert_eq!(
            get(ChangeKind::Add, EntryType::SharedFolder),
            Handler::SharedFolderUpsert
        );
        assert_eq!(get(ChangeKind::Delete, EntryType::Group), Handler::GroupDelete);
        assert_eq!(get(ChangeKind::Delete, EntryType::SharedFolder), Handler::Noop);
        assert_eq!(get(ChangeKind::Add, EntryType::Group), Handler::Noop);
        assert_eq!(get(ChangeKind::Delete, EntryType::Resource), Handler::Noop);
        assert_eq!(get(ChangeKind::Modify, EntryType::Role), Handler::Noop);
        assert_eq!(get(ChangeKind::Add, EntryType::Unknown), Handler::Noop);
        assert_eq!(
            get(ChangeKind::Delete, EntryType::Unknown),
            Handler::UnknownDelete
        );
    }
}
