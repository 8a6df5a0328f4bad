//! LDAP directory implementation
//!
//! Implements the [`Directory`] trait over `ldap3`, including the three
//! streaming change feeds.

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, NaiveDateTime, Utc};
use ldap3::adapters::{Adapter, EntriesOnly, PagedResults};
use ldap3::controls::{Control, RawControl, SyncInfo};
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, LdapError, Mod, SearchEntry};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use dirsync_connector::entry::{AttributeValue, Attributes, ChangeEvent, DirectoryEntry};
use dirsync_connector::error::{ConnectorError, ConnectorResult};
use dirsync_connector::oids;
use dirsync_connector::operation::{AttributeChange, Scope, SearchRequest};
use dirsync_connector::traits::{emit, ChangeSink, Directory, FeedMessage};
use dirsync_connector::types::{ChangeKind, DomainTopology};

use crate::config::LdapConfig;
use crate::controls;

const RC_SUCCESS: u32 = 0;
const RC_SIZE_LIMIT_EXCEEDED: u32 = 4;
const RC_UNAVAILABLE_CRITICAL_EXTENSION: u32 = 12;
const RC_NO_SUCH_OBJECT: u32 = 32;
const RC_INVALID_CREDENTIALS: u32 = 49;
const RC_INSUFFICIENT_ACCESS: u32 = 50;
const RC_BUSY: u32 = 51;
const RC_UNAVAILABLE: u32 = 52;
const RC_UNWILLING_TO_PERFORM: u32 = 53;
const RC_SYNC_REFRESH_REQUIRED: u32 = 4096;

const TAG_SEARCH_RESULT_REFERENCE: u64 = 19;
const TAG_INTERMEDIATE_RESPONSE: u64 = 25;

/// LDAP directory connector.
pub struct LdapDirectory {
    /// Configuration.
    config: LdapConfig,

    /// Display name for this connector instance.
    display_name: String,

    /// Cached LDAP connection (lazily initialized).
    connection: Arc<RwLock<Option<Ldap>>>,
}

impl LdapDirectory {
    /// Create a new LDAP directory connector with the given configuration.
    pub fn new(config: LdapConfig) -> ConnectorResult<Self> {
        config.validate()?;

        let display_name = format!("LDAP: {}", config.host);

        Ok(Self {
            config,
            display_name,
            connection: Arc::new(RwLock::new(None)),
        })
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &LdapConfig {
        &self.config
    }

    /// Get an LDAP connection, creating one if necessary.
    async fn get_connection(&self) -> ConnectorResult<Ldap> {
        {
            let conn_guard = self.connection.read().await;
            if let Some(ref conn) = *conn_guard {
                return Ok(conn.clone());
            }
        }

        let conn = self.create_connection().await?;

        {
            let mut conn_guard = self.connection.write().await;
            *conn_guard = Some(conn.clone());
        }

        Ok(conn)
    }

    /// Drop the cached connection after a transport failure.
    async fn invalidate(&self) {
        self.connection.write().await.take();
    }

    /// Map an error and forget the connection when it is transport-level.
    async fn fail(&self, error: LdapError, context: &str) -> ConnectorError {
        let error = map_ldap_error(
            error,
            context,
            self.config.connection.operation_timeout_secs,
        );
        if error.is_transient() {
            self.invalidate().await;
        }
        error
    }

    /// Create a new LDAP connection.
    async fn create_connection(&self) -> ConnectorResult<Ldap> {
        let url = self.config.url();

        debug!(url = %url, "Connecting to LDAP server");

        let settings =
            LdapConnSettings::new().set_conn_timeout(self.config.connection.connection_timeout());

        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, &url)
            .await
            .map_err(|e| {
                ConnectorError::connection_failed_with_source(
                    format!("Failed to connect to LDAP server at {url}"),
                    e,
                )
            })?;

        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                warn!(error = %e, "LDAP connection driver error");
            }
        });

        let bind_dn = &self.config.bind_dn;
        let bind_password = self.config.bind_password.as_deref().unwrap_or("");

        debug!(bind_dn = %bind_dn, "Performing LDAP bind");

        let result = ldap
            .simple_bind(bind_dn, bind_password)
            .await
            .map_err(|e| {
                ConnectorError::connection_failed_with_source(
                    format!("LDAP bind failed for {bind_dn}"),
                    e,
                )
            })?;

        if result.rc != RC_SUCCESS {
            return Err(map_result_code(result.rc, &result.text, "bind"));
        }

        info!(host = %self.config.host, "LDAP connection established");

        Ok(ldap)
    }

    /// Attributes to request: the caller's list plus the identifier and
    /// modification time, which are operational on most servers.
    fn requested_attributes(&self, request: &SearchRequest) -> Vec<String> {
        let mut attrs = if request.attributes.is_empty() {
            vec!["*".to_string()]
        } else {
            request.attributes.clone()
        };
        for extra in [&self.config.id_attribute, &self.config.modified_attribute] {
            if !attrs.iter().any(|a| a.eq_ignore_ascii_case(extra)) {
                attrs.push(extra.clone());
            }
        }
        attrs
    }

    /// Convert a search entry, skipping entries without an identifier.
    fn to_directory_entry(&self, entry: SearchEntry) -> Option<DirectoryEntry> {
        convert_entry(&self.config, entry, None)
    }

    async fn emit_entry(
        &self,
        sink: &ChangeSink,
        kind: ChangeKind,
        entry: DirectoryEntry,
        previous_dn: Option<String>,
        sequence: Option<i64>,
    ) -> ConnectorResult<()> {
        let mut event = ChangeEvent::new(kind, entry);
        event.previous_dn = previous_dn;
        if let Some(seq) = sequence.and_then(|s| u64::try_from(s).ok()) {
            event = event.with_sequence(seq);
        }
        emit(sink, FeedMessage::Change(event)).await
    }
}

#[async_trait]
impl Directory for LdapDirectory {
    fn display_name(&self) -> &str {
        &self.display_name
    }

    #[instrument(skip(self), fields(host = %self.config.host))]
    async fn connect(&self) -> ConnectorResult<()> {
        self.get_connection().await.map(|_| ())
    }

    async fn disconnect(&self) -> ConnectorResult<()> {
        let mut conn_guard = self.connection.write().await;
        if let Some(mut ldap) = conn_guard.take() {
            if let Err(e) = ldap.unbind().await {
                warn!(error = %e, "Error during LDAP unbind");
            }
            debug!("LDAP connection closed");
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn supported_controls(&self) -> ConnectorResult<Vec<String>> {
        let mut ldap = self.get_connection().await?;

        let result = ldap
            .with_timeout(self.config.connection.operation_timeout())
            .search("", ldap3::Scope::Base, "(objectClass=*)", vec!["supportedControl"])
            .await;
        let result = match result {
            Ok(r) => r,
            Err(e) => return Err(self.fail(e, "root DSE search failed").await),
        };

        let (entries, res) = (result.0, result.1);
        if res.rc != RC_SUCCESS {
            return Err(map_result_code(res.rc, &res.text, "root DSE search"));
        }

        let controls: Vec<String> = entries
            .into_iter()
            .map(SearchEntry::construct)
            .flat_map(|e| {
                e.attrs
                    .into_iter()
                    .filter(|(name, _)| name.eq_ignore_ascii_case("supportedControl"))
                    .flat_map(|(_, values)| values)
            })
            .collect();

        debug!(count = controls.len(), "Read supported controls");
        Ok(controls)
    }

    #[instrument(skip(self, request), fields(base = %request.base, filter = %request.filter))]
    async fn search(&self, request: &SearchRequest) -> ConnectorResult<Vec<DirectoryEntry>> {
        let mut ldap = self.get_connection().await?;
        let filter = request.filter.to_ldap_string();
        let attrs = self.requested_attributes(request);

        let result = ldap
            .with_timeout(self.config.connection.operation_timeout())
            .search(&request.base, to_ldap_scope(request.scope), &filter, attrs)
            .await;
        let result = match result {
            Ok(r) => r,
            Err(e) => return Err(self.fail(e, "LDAP search failed").await),
        };

        let (rows, res) = (result.0, result.1);
        match res.rc {
            RC_SUCCESS => {}
            RC_NO_SUCH_OBJECT => {
                debug!("Search base does not exist");
                return Ok(Vec::new());
            }
            RC_SIZE_LIMIT_EXCEEDED => {
                warn!(returned = rows.len(), "Size limit exceeded, results truncated");
            }
            rc => return Err(map_result_code(rc, &res.text, "search")),
        }

        let entries: Vec<DirectoryEntry> = rows
            .into_iter()
            .filter(|r| r.0.id != TAG_SEARCH_RESULT_REFERENCE)
            .map(SearchEntry::construct)
            .filter_map(|e| self.to_directory_entry(e))
            .collect();

        debug!(found = entries.len(), "LDAP search completed");
        Ok(entries)
    }

    #[instrument(skip(self, changes))]
    async fn modify(&self, dn: &str, changes: Vec<AttributeChange>) -> ConnectorResult<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut ldap = self.get_connection().await?;

        let mods: Vec<Mod<String>> = changes
            .into_iter()
            .map(|change| match change {
                AttributeChange::Replace { attribute, values } => {
                    Mod::Replace(attribute, values.into_iter().collect::<HashSet<_>>())
                }
                AttributeChange::Add { attribute, values } => {
                    Mod::Add(attribute, values.into_iter().collect::<HashSet<_>>())
                }
                AttributeChange::Delete { attribute, values } => {
                    Mod::Delete(attribute, values.into_iter().collect::<HashSet<_>>())
                }
            })
            .collect();

        let result = ldap
            .with_timeout(self.config.connection.operation_timeout())
            .modify(dn, mods)
            .await;
        let result = match result {
            Ok(r) => r,
            Err(e) => return Err(self.fail(e, "LDAP modify failed").await),
        };

        if result.rc == RC_NO_SUCH_OBJECT {
            return Err(ConnectorError::not_found(dn));
        }
        if result.rc != RC_SUCCESS {
            return Err(map_result_code(result.rc, &result.text, "modify"));
        }

        info!(dn = %dn, "LDAP entry updated");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_namespaces(&self) -> ConnectorResult<DomainTopology> {
        let Some(base) = self
            .config
            .domain_base_dn
            .as_deref()
            .filter(|b| !b.is_empty())
        else {
            return Ok(DomainTopology::new());
        };

        let mut ldap = self.get_connection().await?;
        let name_attr = self.config.domain_name_attribute.clone();

        let result = ldap
            .with_timeout(self.config.connection.operation_timeout())
            .search(
                base,
                ldap3::Scope::Subtree,
                &self.config.domain_filter,
                vec![name_attr.as_str()],
            )
            .await;
        let result = match result {
            Ok(r) => r,
            Err(e) => return Err(self.fail(e, "domain search failed").await),
        };

        let (rows, res) = (result.0, result.1);
        match res.rc {
            RC_SUCCESS => {}
            RC_NO_SUCH_OBJECT => return Ok(DomainTopology::new()),
            rc => return Err(map_result_code(rc, &res.text, "domain search")),
        }

        let mut topology = DomainTopology::new();
        for row in rows {
            let entry = SearchEntry::construct(row);
            let names = entry
                .attrs
                .into_iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(&name_attr))
                .map(|(_, values)| values)
                .unwrap_or_default();
            if let Some((primary, aliases)) = names.split_first() {
                topology.insert(primary, aliases);
            }
        }

        debug!(namespaces = topology.len(), "Listed namespaces");
        Ok(topology)
    }

    #[instrument(skip(self, request, sink), fields(base = %request.base))]
    async fn paged_search(
        &self,
        request: &SearchRequest,
        page_size: u32,
        sink: &ChangeSink,
    ) -> ConnectorResult<usize> {
        let mut ldap = self.get_connection().await?;
        let filter = request.filter.to_ldap_string();
        let attrs = self.requested_attributes(request);
        let page_size = i32::try_from(page_size).unwrap_or(i32::MAX);

        let adapters: Vec<Box<dyn Adapter<_, _>>> = vec![
            Box::new(EntriesOnly::new()),
            Box::new(PagedResults::new(page_size)),
        ];
        let stream = ldap
            .streaming_search_with(
                adapters,
                &request.base,
                to_ldap_scope(request.scope),
                &filter,
                attrs,
            )
            .await;
        let mut stream = match stream {
            Ok(s) => s,
            Err(e) => return Err(self.fail(e, "paged search failed").await),
        };

        let mut count = 0usize;
        loop {
            let row = match stream.next().await {
                Ok(Some(row)) => row,
                Ok(None) => break,
                Err(e) => return Err(self.fail(e, "paged search interrupted").await),
            };
            let Some(entry) = self.to_directory_entry(SearchEntry::construct(row)) else {
                continue;
            };
            emit(sink, FeedMessage::Change(ChangeEvent::seen(entry))).await?;
            count += 1;
        }

        let res = stream.finish().await;
        match res.rc {
            RC_SUCCESS | RC_NO_SUCH_OBJECT => {}
            rc => return Err(map_result_code(rc, &res.text, "paged search")),
        }

        debug!(count, "Paged search completed");
        Ok(count)
    }

    #[instrument(skip(self, request, sink), fields(base = %request.base))]
    async fn persistent_search(
        &self,
        request: &SearchRequest,
        sink: &ChangeSink,
    ) -> ConnectorResult<()> {
        let mut ldap = self.get_connection().await?;
        let filter = request.filter.to_ldap_string();
        let attrs = self.requested_attributes(request);
        let control = controls::persistent_search(controls::ALL_CHANGE_TYPES, true, true)?;

        let stream = ldap
            .with_controls(vec![control])
            .streaming_search(&request.base, to_ldap_scope(request.scope), &filter, attrs)
            .await;
        let mut stream = match stream {
            Ok(s) => s,
            Err(e) => return Err(self.fail(e, "persistent search failed").await),
        };

        info!("Persistent search established");

        loop {
            let row = match stream.next().await {
                Ok(Some(row)) => row,
                Ok(None) => break,
                Err(e) => return Err(self.fail(e, "persistent search interrupted").await),
            };
            if row.0.id == TAG_SEARCH_RESULT_REFERENCE || row.0.id == TAG_INTERMEDIATE_RESPONSE {
                continue;
            }

            let notification = match find_control(&row.1, oids::ENTRY_CHANGE_NOTIFICATION) {
                Some(value) => match controls::decode_entry_change(value) {
                    Ok(ecn) => Some(ecn),
                    Err(e) => {
                        warn!(error = %e, "Skipping entry with malformed change notification");
                        continue;
                    }
                },
                None => None,
            };

            let Some(entry) = self.to_directory_entry(SearchEntry::construct(row)) else {
                continue;
            };
            match notification {
                Some(ecn) => {
                    self.emit_entry(sink, ecn.kind, entry, ecn.previous_dn, ecn.change_number)
                        .await?;
                }
                None => {
                    self.emit_entry(sink, ChangeKind::Seen, entry, None, None)
                        .await?;
                }
            }
        }

        let res = stream.finish().await;
        match res.rc {
            RC_UNAVAILABLE_CRITICAL_EXTENSION | RC_UNWILLING_TO_PERFORM => {
                Err(ConnectorError::unsupported("persistent search"))
            }
            RC_SUCCESS => Err(ConnectorError::connection_lost(
                "persistent search ended by server",
            )),
            rc => Err(map_result_code(rc, &res.text, "persistent search")),
        }
    }

    #[instrument(skip(self, request, cookie, sink), fields(base = %request.base))]
    async fn sync_replication(
        &self,
        request: &SearchRequest,
        cookie: Option<&str>,
        sink: &ChangeSink,
    ) -> ConnectorResult<()> {
        let cookie_bytes = match cookie.filter(|c| !c.is_empty()) {
            Some(c) => Some(decode_cookie(c)?),
            None => None,
        };

        let mut ldap = self.get_connection().await?;
        let filter = request.filter.to_ldap_string();
        let attrs = self.requested_attributes(request);
        let resumed = cookie_bytes.is_some();
        let control = controls::sync_request(cookie_bytes);

        let stream = ldap
            .with_controls(vec![control])
            .streaming_search(&request.base, to_ldap_scope(request.scope), &filter, attrs)
            .await;
        let mut stream = match stream {
            Ok(s) => s,
            Err(e) => return Err(self.fail(e, "content synchronization failed").await),
        };

        info!(resumed, "Content synchronization established");

        loop {
            let row = match stream.next().await {
                Ok(Some(row)) => row,
                Ok(None) => break,
                Err(e) => {
                    return Err(self.fail(e, "content synchronization interrupted").await)
                }
            };

            let id = row.0.id;
            match id {
                TAG_SEARCH_RESULT_REFERENCE => continue,
                TAG_INTERMEDIATE_RESPONSE => {
                    match controls::decode_sync_info(row) {
                        Ok(info) => self.handle_sync_info(info, sink).await?,
                        Err(e) => warn!(error = %e, "Ignoring malformed sync info message"),
                    }
                    continue;
                }
                _ => {}
            }

            let state = match find_raw_control(&row.1, oids::SYNC_STATE)
                .map(controls::decode_sync_state)
                .transpose()
            {
                Ok(state) => state,
                Err(e) => {
                    warn!(error = %e, "Skipping entry with malformed sync state");
                    continue;
                }
            };

            let uuid = state
                .as_ref()
                .map(|s| controls::format_sync_uuid(&s.entry_uuid));
            let Some(entry) = convert_entry(&self.config, SearchEntry::construct(row), uuid)
            else {
                continue;
            };
            let kind = state
                .as_ref()
                .map_or(ChangeKind::Seen, |s| controls::entry_state_kind(&s.state));
            self.emit_entry(sink, kind, entry, None, None).await?;

            if let Some(cookie) = state.and_then(|s| s.cookie) {
                emit(sink, FeedMessage::Cursor(encode_cookie(&cookie))).await?;
            }
        }

        let res = stream.finish().await;
        if let Some(done) = find_raw_control(&res.ctrls, oids::SYNC_DONE) {
            match controls::decode_sync_done(done) {
                Ok(done) => {
                    if let Some(cookie) = done.cookie {
                        emit(sink, FeedMessage::Cursor(encode_cookie(&cookie))).await?;
                    }
                }
                Err(e) => warn!(error = %e, "Ignoring malformed sync done control"),
            }
        }

        match res.rc {
            RC_SYNC_REFRESH_REQUIRED => {
                warn!("Server requires a full refresh, discarding cookie");
                emit(sink, FeedMessage::Cursor(String::new())).await?;
                Err(ConnectorError::connection_lost("content synchronization refresh required"))
            }
            RC_UNAVAILABLE_CRITICAL_EXTENSION | RC_UNWILLING_TO_PERFORM => {
                Err(ConnectorError::unsupported("content synchronization"))
            }
            RC_SUCCESS => Err(ConnectorError::connection_lost(
                "content synchronization ended by server",
            )),
            rc => Err(map_result_code(rc, &res.text, "content synchronization")),
        }
    }
}

impl LdapDirectory {
    async fn handle_sync_info(&self, info: SyncInfo, sink: &ChangeSink) -> ConnectorResult<()> {
        if let SyncInfo::SyncIdSet {
            refresh_deletes: true,
            sync_uuids,
            ..
        } = &info
        {
            for uuid in sync_uuids {
                let id = controls::format_sync_uuid(uuid);
                let entry = DirectoryEntry::new(id, String::new());
                self.emit_entry(sink, ChangeKind::Delete, entry, None, None)
                    .await?;
            }
        }
        if let Some(cookie) = controls::sync_info_cookie(&info) {
            emit(sink, FeedMessage::Cursor(encode_cookie(cookie))).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for LdapDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LdapDirectory")
            .field("display_name", &self.display_name)
            .field("config", &self.config.redacted())
            .finish()
    }
}

fn to_ldap_scope(scope: Scope) -> ldap3::Scope {
    match scope {
        Scope::Base => ldap3::Scope::Base,
        Scope::OneLevel => ldap3::Scope::OneLevel,
        Scope::Subtree => ldap3::Scope::Subtree,
    }
}

/// Map a transport or protocol error from `ldap3`.
fn map_ldap_error(error: LdapError, context: &str, timeout_secs: u64) -> ConnectorError {
    match error {
        LdapError::Timeout { .. } => ConnectorError::Timeout { timeout_secs },
        LdapError::Io { .. } | LdapError::EndOfStream => {
            ConnectorError::connection_lost_with_source(context.to_string(), error)
        }
        LdapError::LdapResult { result } => map_result_code(result.rc, &result.text, context),
        other => ConnectorError::operation_failed_with_source(context.to_string(), other),
    }
}

/// Map a non-success LDAP result code.
fn map_result_code(rc: u32, text: &str, context: &str) -> ConnectorError {
    match rc {
        RC_INVALID_CREDENTIALS => ConnectorError::AuthenticationFailed,
        RC_INSUFFICIENT_ACCESS => ConnectorError::AuthorizationFailed {
            operation: context.to_string(),
        },
        RC_BUSY | RC_UNAVAILABLE => ConnectorError::Unavailable {
            message: format!("{context}: {text} (code {rc})"),
        },
        RC_NO_SUCH_OBJECT => ConnectorError::not_found(format!("{context}: {text}")),
        _ => ConnectorError::operation_failed(format!(
            "LDAP {context} failed with code {rc}: {text}"
        )),
    }
}

/// Find a response control by OID.
fn find_raw_control<'a>(controls: &'a [Control], oid: &str) -> Option<&'a RawControl> {
    controls.iter().map(|c| &c.1).find(|raw| raw.ctype == oid)
}

/// Find a response control value by OID.
fn find_control<'a>(controls: &'a [Control], oid: &str) -> Option<&'a [u8]> {
    find_raw_control(controls, oid).and_then(|raw| raw.val.as_deref())
}

fn encode_cookie(cookie: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(cookie)
}

fn decode_cookie(cookie: &str) -> ConnectorResult<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(cookie)
        .map_err(|e| ConnectorError::invalid_data(format!("stored sync cookie is not base64: {e}")))
}

/// Parse a directory timestamp in the configured format.
fn parse_timestamp(value: &str, format: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, format)
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y%m%d%H%M%S%.fZ"))
        .ok()
        .map(|naive| naive.and_utc())
}

/// Convert an `ldap3` entry. `fallback_id` is used when the identifier
/// attribute is absent (deleted entries in content synchronization).
fn convert_entry(
    config: &LdapConfig,
    entry: SearchEntry,
    fallback_id: Option<String>,
) -> Option<DirectoryEntry> {
    let mut attributes = Attributes::new();
    let mut id = None;

    for (name, values) in entry.attrs {
        if !config.id_is_binary && name.eq_ignore_ascii_case(&config.id_attribute) {
            id = values.first().cloned();
        }
        if let Some(value) = AttributeValue::from_values(values) {
            attributes.set(name, value);
        }
    }
    for (name, values) in entry.bin_attrs {
        if name.eq_ignore_ascii_case(&config.id_attribute) {
            id = values
                .first()
                .map(|v| base64::engine::general_purpose::STANDARD.encode(v));
        }
    }

    let Some(id) = id.or(fallback_id) else {
        warn!(dn = %entry.dn, attribute = %config.id_attribute, "Entry has no identifier, skipping");
        return None;
    };

    let modified = attributes
        .get_str(&config.modified_attribute)
        .and_then(|v| parse_timestamp(v, &config.timestamp_format));

    let mut result = DirectoryEntry::new(id, entry.dn).with_attributes(attributes);
    result.modified = modified;
    Some(result)
}
