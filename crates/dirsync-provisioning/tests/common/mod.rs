//! In-memory collaborators shared by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use dirsync_connector::entry::{ChangeEvent, DirectoryEntry};
use dirsync_connector::error::{ConnectorError, ConnectorResult};
use dirsync_connector::operation::{AclEntry, AttributeChange, Scope, SearchRequest};
use dirsync_connector::traits::{emit, ChangeSink, Directory, FeedMessage, MailStore};
use dirsync_connector::types::{ChangeKind, DomainTopology};

pub const BASE_DN: &str = "dc=example,dc=org";
pub const DOMAIN: &str = "example.org";

pub fn at(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, day, 12, 0, 0).unwrap()
}

/// A `kolabInetOrgPerson` under `ou=People`.
pub fn user(id: &str, uid: &str) -> DirectoryEntry {
    DirectoryEntry::new(id, format!("uid={uid},ou=People,{BASE_DN}"))
        .with_attribute("objectClass", vec!["inetOrgPerson", "kolabInetOrgPerson"])
        .with_attribute("uid", uid)
}

/// A `kolabSharedFolder` under `ou=Shared Folders`.
pub fn shared_folder(id: &str, cn: &str) -> DirectoryEntry {
    DirectoryEntry::new(id, format!("cn={cn},ou=Shared Folders,{BASE_DN}"))
        .with_attribute("objectClass", "kolabSharedFolder")
        .with_attribute("cn", cn)
}

fn canonical(dn: &str) -> String {
    dn.split(',')
        .map(|rdn| rdn.trim().to_lowercase())
        .collect::<Vec<_>>()
        .join(",")
}

/// Directory over a list of entries. Filters are evaluated locally; an
/// indeterminate result does not match. With a live feed, persistent
/// search announces every matching entry as added and then stays open.
pub struct MemoryDirectory {
    entries: Mutex<Vec<DirectoryEntry>>,
    controls: Vec<String>,
    live: bool,
    topology: Mutex<DomainTopology>,
    pub fail_discovery: AtomicBool,
    pub searches: AtomicUsize,
    pub modifies: AtomicUsize,
    pub connects: AtomicUsize,
}

impl MemoryDirectory {
    pub fn new(entries: Vec<DirectoryEntry>) -> Self {
        Self {
            entries: Mutex::new(entries),
            controls: Vec::new(),
            live: false,
            topology: Mutex::new(DomainTopology::new()),
            fail_discovery: AtomicBool::new(false),
            searches: AtomicUsize::new(0),
            modifies: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
        }
    }

    pub fn with_controls(mut self, controls: &[&str]) -> Self {
        self.controls = controls.iter().map(|c| (*c).to_string()).collect();
        self
    }

    pub fn with_live_feed(mut self) -> Self {
        self.live = true;
        self
    }

    pub fn set_topology(&self, topology: DomainTopology) {
        *self.topology.lock().unwrap() = topology;
    }

    pub fn insert(&self, entry: DirectoryEntry) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|e| e.id != entry.id);
        entries.push(entry);
    }

    pub fn remove(&self, id: &str) {
        self.entries.lock().unwrap().retain(|e| e.id != id);
    }

    pub fn entry(&self, id: &str) -> Option<DirectoryEntry> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.id == id)
            .cloned()
    }

    /// Entry as seen by a filter: with its id and modification time.
    fn searchable(entry: &DirectoryEntry) -> DirectoryEntry {
        let mut entry = entry.clone();
        entry.attributes.set("entryUUID", entry.id.clone());
        if !entry.attributes.has("modifyTimestamp") {
            let modified = entry.modified.unwrap_or_else(|| at(1));
            entry
                .attributes
                .set("modifyTimestamp", modified.format("%Y%m%d%H%M%SZ").to_string());
        }
        entry
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    fn display_name(&self) -> &str {
        "memory"
    }

    async fn connect(&self) -> ConnectorResult<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> ConnectorResult<()> {
        Ok(())
    }

    async fn supported_controls(&self) -> ConnectorResult<Vec<String>> {
        Ok(self.controls.clone())
    }

    async fn search(&self, request: &SearchRequest) -> ConnectorResult<Vec<DirectoryEntry>> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        let base = canonical(&request.base);
        let entries = self.entries.lock().unwrap();
        let mut found = Vec::new();
        for entry in entries.iter() {
            let dn = canonical(&entry.dn);
            let in_scope = match request.scope {
                Scope::Base => dn == base,
                _ => dn == base || dn.ends_with(&format!(",{base}")),
            };
            if !in_scope {
                continue;
            }
            let entry = Self::searchable(entry);
            if request.filter.evaluate(&entry.attributes) == Some(true) {
                found.push(entry);
            }
        }
        if request.scope == Scope::Base && found.is_empty() && !entries.iter().any(|e| canonical(&e.dn) == base) {
            return Err(ConnectorError::not_found(request.base.clone()));
        }
        Ok(found)
    }

    async fn modify(&self, dn: &str, changes: Vec<AttributeChange>) -> ConnectorResult<()> {
        self.modifies.fetch_add(1, Ordering::SeqCst);
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .iter_mut()
            .find(|e| canonical(&e.dn) == canonical(dn))
            .ok_or_else(|| ConnectorError::not_found(dn))?;
        for change in changes {
            match change {
                AttributeChange::Replace { attribute, values } if values.is_empty() => {
                    entry.attributes.remove(&attribute);
                }
                AttributeChange::Replace { attribute, values } => {
                    entry.attributes.set(&attribute, values);
                }
                other => {
                    return Err(ConnectorError::operation_failed(format!(
                        "unexpected change on {}",
                        other.attribute()
                    )))
                }
            }
        }
        Ok(())
    }

    async fn persistent_search(
        &self,
        request: &SearchRequest,
        sink: &ChangeSink,
    ) -> ConnectorResult<()> {
        if !self.live {
            return Err(ConnectorError::unsupported("persistent search"));
        }
        for entry in self.search(request).await? {
            emit(sink, FeedMessage::Change(ChangeEvent::new(ChangeKind::Add, entry))).await?;
        }
        sink.closed().await;
        Err(ConnectorError::Cancelled)
    }

    async fn list_namespaces(&self) -> ConnectorResult<DomainTopology> {
        if self.fail_discovery.load(Ordering::SeqCst) {
            return Err(ConnectorError::connection_lost("discovery"));
        }
        Ok(self.topology.lock().unwrap().clone())
    }
}

#[derive(Default)]
struct StoreState {
    mailboxes: BTreeSet<String>,
    acls: BTreeMap<String, BTreeMap<String, String>>,
    metadata: BTreeMap<(String, String), String>,
    quotas: BTreeMap<String, u64>,
}

/// Mail store keeping mailboxes, grants, metadata and quota in memory.
/// Every mutating call is counted. While `fail_mutations` is set, every
/// mutating call is counted and then rejected.
#[derive(Default)]
pub struct MemoryMailStore {
    state: Mutex<StoreState>,
    pub fail_mutations: AtomicBool,
    pub creates: AtomicUsize,
    pub renames: AtomicUsize,
    pub deletes: AtomicUsize,
    pub acl_sets: AtomicUsize,
    pub acl_deletes: AtomicUsize,
    pub metadata_sets: AtomicUsize,
    pub quota_sets: AtomicUsize,
}

impl MemoryMailStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of mutating calls so far.
    pub fn mutations(&self) -> usize {
        [
            &self.creates,
            &self.renames,
            &self.deletes,
            &self.acl_sets,
            &self.acl_deletes,
            &self.metadata_sets,
            &self.quota_sets,
        ]
        .iter()
        .map(|counter| counter.load(Ordering::SeqCst))
        .sum()
    }

    pub fn has_mailbox(&self, path: &str) -> bool {
        self.state.lock().unwrap().mailboxes.contains(path)
    }

    pub fn mailboxes(&self) -> Vec<String> {
        self.state.lock().unwrap().mailboxes.iter().cloned().collect()
    }

    pub fn acl(&self, path: &str) -> BTreeMap<String, String> {
        self.state
            .lock()
            .unwrap()
            .acls
            .get(path)
            .cloned()
            .unwrap_or_default()
    }

    pub fn metadata(&self, path: &str, key: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .metadata
            .get(&(path.to_string(), key.to_string()))
            .cloned()
    }

    pub fn quota(&self, path: &str) -> Option<u64> {
        self.state.lock().unwrap().quotas.get(path).copied()
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_mutations.store(failing, Ordering::SeqCst);
    }

    fn check(&self, path: &str) -> ConnectorResult<()> {
        if self.fail_mutations.load(Ordering::SeqCst) {
            return Err(ConnectorError::operation_failed(format!(
                "mailbox {path} is locked"
            )));
        }
        Ok(())
    }

    /// Seed a mailbox without counting it as a mutation.
    pub fn seed_mailbox(&self, path: &str, grants: &[(&str, &str)]) {
        let mut state = self.state.lock().unwrap();
        state.mailboxes.insert(path.to_string());
        let acl = state.acls.entry(path.to_string()).or_default();
        for (subject, rights) in grants {
            acl.insert((*subject).to_string(), (*rights).to_string());
        }
    }
}

#[async_trait]
impl MailStore for MemoryMailStore {
    fn display_name(&self) -> &str {
        "memory"
    }

    async fn disconnect(&self) -> ConnectorResult<()> {
        Ok(())
    }

    async fn mailbox_exists(&self, path: &str) -> ConnectorResult<bool> {
        Ok(self.has_mailbox(path))
    }

    async fn create_mailbox(&self, path: &str, _server: Option<&str>) -> ConnectorResult<()> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.check(path)?;
        self.state.lock().unwrap().mailboxes.insert(path.to_string());
        Ok(())
    }

    async fn rename_mailbox(
        &self,
        from: &str,
        to: &str,
        _partition: Option<&str>,
    ) -> ConnectorResult<()> {
        self.renames.fetch_add(1, Ordering::SeqCst);
        self.check(from)?;
        let mut state = self.state.lock().unwrap();
        if !state.mailboxes.remove(from) {
            return Err(ConnectorError::not_found(from));
        }
        state.mailboxes.insert(to.to_string());
        if let Some(acl) = state.acls.remove(from) {
            state.acls.insert(to.to_string(), acl);
        }
        if let Some(quota) = state.quotas.remove(from) {
            state.quotas.insert(to.to_string(), quota);
        }
        Ok(())
    }

    async fn delete_mailbox(&self, path: &str) -> ConnectorResult<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.check(path)?;
        let mut state = self.state.lock().unwrap();
        state.mailboxes.remove(path);
        state.acls.remove(path);
        state.quotas.remove(path);
        Ok(())
    }

    async fn list_mailboxes(&self, _pattern: &str) -> ConnectorResult<Vec<String>> {
        Ok(self.mailboxes())
    }

    async fn get_acl(&self, path: &str) -> ConnectorResult<Vec<AclEntry>> {
        let state = self.state.lock().unwrap();
        if !state.mailboxes.contains(path) {
            return Err(ConnectorError::not_found(path));
        }
        Ok(state
            .acls
            .get(path)
            .map(|acl| {
                acl.iter()
                    .map(|(subject, rights)| AclEntry::new(subject.clone(), rights.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn set_acl(&self, path: &str, subject: &str, rights: &str) -> ConnectorResult<()> {
        self.acl_sets.fetch_add(1, Ordering::SeqCst);
        self.check(path)?;
        self.state
            .lock()
            .unwrap()
            .acls
            .entry(path.to_string())
            .or_default()
            .insert(subject.to_string(), rights.to_string());
        Ok(())
    }

    async fn delete_acl(&self, path: &str, subject: &str) -> ConnectorResult<()> {
        self.acl_deletes.fetch_add(1, Ordering::SeqCst);
        self.check(path)?;
        if let Some(acl) = self.state.lock().unwrap().acls.get_mut(path) {
            acl.remove(subject);
        }
        Ok(())
    }

    async fn get_metadata(&self, path: &str, key: &str) -> ConnectorResult<Option<String>> {
        Ok(self.metadata(path, key))
    }

    async fn set_metadata(&self, path: &str, key: &str, value: &str) -> ConnectorResult<()> {
        self.metadata_sets.fetch_add(1, Ordering::SeqCst);
        self.check(path)?;
        self.state
            .lock()
            .unwrap()
            .metadata
            .insert((path.to_string(), key.to_string()), value.to_string());
        Ok(())
    }

    async fn get_quota(&self, path: &str) -> ConnectorResult<Option<u64>> {
        Ok(self.quota(path))
    }

    async fn set_quota(&self, path: &str, limit_kib: u64) -> ConnectorResult<()> {
        self.quota_sets.fetch_add(1, Ordering::SeqCst);
        self.check(path)?;
        self.state
            .lock()
            .unwrap()
            .quotas
            .insert(path.to_string(), limit_kib);
        Ok(())
    }
}

/// Both collaborators as trait objects.
pub fn collaborators(
    directory: &Arc<MemoryDirectory>,
    store: &Arc<MemoryMailStore>,
) -> (Arc<dyn Directory>, Arc<dyn MailStore>) {
    (
        Arc::clone(directory) as Arc<dyn Directory>,
        Arc::clone(store) as Arc<dyn MailStore>,
    )
}
