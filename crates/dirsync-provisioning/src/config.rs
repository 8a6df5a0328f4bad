//! Engine configuration.
//!
//! These sections are deserialized from the daemon's TOML file. Every
//! field except `sync.primary_domain` has a default.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use dirsync_connector::filter::Filter;
use dirsync_connector::types::{EntryType, FeedStrategy};

use crate::error::ConfigError;
use crate::template::AddressTemplate;

/// Placeholder in type base DNs replaced by the namespace base DN.
pub const BASE_DN_PLACEHOLDER: &str = "{base_dn}";

/// `[sync]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Namespace served when no domain entries are found.
    pub primary_domain: String,

    /// Base DN of the primary namespace. Other namespaces, and the
    /// primary one when unset, use `dc=` components of the domain name.
    #[serde(default)]
    pub base_dn: Option<String>,

    /// Directory holding watermark databases and sync cursors.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Forced feed strategy.
    #[serde(default)]
    pub strategy: Option<FeedStrategy>,

    /// Interval between namespace discovery polls, in seconds.
    #[serde(default = "default_topology_interval")]
    pub topology_interval_secs: u64,

    /// Interval between snapshot feed passes, in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Worker starts per pass before pausing.
    #[serde(default = "default_burst_threshold")]
    pub burst_threshold: usize,

    /// Pause after a burst of worker starts, in seconds.
    #[serde(default = "default_burst_pause")]
    pub burst_pause_secs: u64,

    /// Delay before reconnecting after a transport failure, in seconds.
    #[serde(default = "default_backoff")]
    pub backoff_secs: u64,

    /// Capacity of the channel between a feed and its worker.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Directory attribute holding the mailbox quota in KiB.
    #[serde(default = "default_quota_attribute")]
    pub quota_attribute: String,

    /// Directory attribute holding the backend server of a mailbox.
    #[serde(default = "default_mailhost_attribute")]
    pub mailhost_attribute: String,

    /// Mailbox naming.
    #[serde(default)]
    pub naming: MailboxNaming,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("/var/lib/dirsync")
}

fn default_topology_interval() -> u64 {
    60
}

fn default_poll_interval() -> u64 {
    300
}

fn default_burst_threshold() -> usize {
    5
}

fn default_burst_pause() -> u64 {
    10
}

fn default_backoff() -> u64 {
    10
}

fn default_channel_capacity() -> usize {
    256
}

fn default_quota_attribute() -> String {
    "mailQuota".to_string()
}

fn default_mailhost_attribute() -> String {
    "mailHost".to_string()
}

impl SyncSettings {
    /// Settings with defaults for `primary_domain`.
    pub fn new(primary_domain: impl Into<String>) -> Self {
        Self {
            primary_domain: primary_domain.into().to_lowercase(),
            base_dn: None,
            cache_dir: default_cache_dir(),
            strategy: None,
            topology_interval_secs: default_topology_interval(),
            poll_interval_secs: default_poll_interval(),
            burst_threshold: default_burst_threshold(),
            burst_pause_secs: default_burst_pause(),
            backoff_secs: default_backoff(),
            channel_capacity: default_channel_capacity(),
            quota_attribute: default_quota_attribute(),
            mailhost_attribute: default_mailhost_attribute(),
            naming: MailboxNaming::default(),
        }
    }

    /// Base DN searched for a namespace.
    #[must_use]
    pub fn namespace_base_dn(&self, namespace: &str) -> String {
        match &self.base_dn {
            Some(base_dn) if namespace.eq_ignore_ascii_case(&self.primary_domain) => {
                base_dn.clone()
            }
            _ => domain_to_dn(namespace),
        }
    }

    #[must_use]
    pub fn topology_interval(&self) -> Duration {
        Duration::from_secs(self.topology_interval_secs)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    #[must_use]
    pub fn burst_pause(&self) -> Duration {
        Duration::from_secs(self.burst_pause_secs)
    }

    #[must_use]
    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.primary_domain.trim().is_empty() {
            return Err(ConfigError::invalid("sync.primary_domain", "must not be empty"));
        }
        let positive = [
            ("sync.topology_interval_secs", self.topology_interval_secs),
            ("sync.poll_interval_secs", self.poll_interval_secs),
            ("sync.backoff_secs", self.backoff_secs),
            ("sync.burst_threshold", self.burst_threshold as u64),
            ("sync.channel_capacity", self.channel_capacity as u64),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::invalid(field, "must be greater than zero"));
            }
        }
        self.naming.validate()
    }
}

/// `dc=` form of a domain name: `example.org` becomes `dc=example,dc=org`.
#[must_use]
pub fn domain_to_dn(domain: &str) -> String {
    domain
        .split('.')
        .filter(|label| !label.is_empty())
        .map(|label| format!("dc={}", label.to_lowercase()))
        .collect::<Vec<_>>()
        .join(",")
}

/// `[sync.naming]`: mailbox path layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxNaming {
    #[serde(default = "default_user_prefix")]
    pub user_prefix: String,

    #[serde(default = "default_shared_prefix")]
    pub shared_prefix: String,

    #[serde(default = "default_separator")]
    pub separator: String,
}

fn default_user_prefix() -> String {
    "user".to_string()
}

fn default_shared_prefix() -> String {
    "shared".to_string()
}

fn default_separator() -> String {
    "/".to_string()
}

impl Default for MailboxNaming {
    fn default() -> Self {
        Self {
            user_prefix: default_user_prefix(),
            shared_prefix: default_shared_prefix(),
            separator: default_separator(),
        }
    }
}

impl MailboxNaming {
    /// `user/<local>@<domain>` for an address.
    #[must_use]
    pub fn user_mailbox(&self, address: &str) -> String {
        format!("{}{}{}", self.user_prefix, self.separator, address)
    }

    /// `user/<local>/<folder>@<domain>` for an address.
    #[must_use]
    pub fn user_folder(&self, address: &str, folder: &str) -> String {
        match address.rsplit_once('@') {
            Some((local, domain)) => format!(
                "{prefix}{sep}{local}{sep}{folder}@{domain}",
                prefix = self.user_prefix,
                sep = self.separator,
            ),
            None => format!(
                "{prefix}{sep}{address}{sep}{folder}",
                prefix = self.user_prefix,
                sep = self.separator,
            ),
        }
    }

    /// `shared/<path>@<domain>`.
    #[must_use]
    pub fn shared_folder(&self, path: &str, domain: &str) -> String {
        format!("{}{}{}@{}", self.shared_prefix, self.separator, path, domain)
    }

    /// Pattern listing every mailbox.
    #[must_use]
    pub fn all_mailboxes(&self) -> &'static str {
        "*"
    }

    /// Whether `path` names a shared folder.
    #[must_use]
    pub fn is_shared(&self, path: &str) -> bool {
        path.strip_prefix(&self.shared_prefix)
            .is_some_and(|rest| rest.starts_with(&self.separator))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.separator.chars().count() != 1 {
            return Err(ConfigError::invalid(
                "sync.naming.separator",
                "must be a single character",
            ));
        }
        if self.user_prefix.is_empty() || self.shared_prefix.is_empty() {
            return Err(ConfigError::invalid(
                "sync.naming",
                "prefixes must not be empty",
            ));
        }
        if self.user_prefix == self.shared_prefix {
            return Err(ConfigError::invalid(
                "sync.naming",
                "user and shared prefixes must differ",
            ));
        }
        Ok(())
    }
}

/// `[policy]` section: recipient address policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Attribute holding the primary address.
    #[serde(default = "default_primary_attribute")]
    pub primary_mail_attribute: String,

    /// Multi-valued attribute holding secondary addresses.
    #[serde(default = "default_secondary_attribute")]
    pub secondary_mail_attribute: String,

    /// Template for the primary address.
    #[serde(default = "default_primary_template")]
    pub primary_template: String,

    /// Templates for secondary addresses, each rendered per domain.
    #[serde(default = "default_secondary_templates")]
    pub secondary_templates: Vec<String>,

    /// Highest numeric suffix tried before giving up on an address.
    #[serde(default = "default_max_collision_suffix")]
    pub max_collision_suffix: u32,
}

fn default_primary_attribute() -> String {
    "mail".to_string()
}

fn default_secondary_attribute() -> String {
    "alias".to_string()
}

fn default_primary_template() -> String {
    "{givenname|normalize}.{sn|normalize}@{domain}".to_string()
}

fn default_secondary_templates() -> Vec<String> {
    vec!["{givenname|initial|normalize}.{sn|normalize}@{domain}".to_string()]
}

fn default_max_collision_suffix() -> u32 {
    1000
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            primary_mail_attribute: default_primary_attribute(),
            secondary_mail_attribute: default_secondary_attribute(),
            primary_template: default_primary_template(),
            secondary_templates: default_secondary_templates(),
            max_collision_suffix: default_max_collision_suffix(),
        }
    }
}

impl PolicyConfig {
    /// Parse the primary template and every secondary template.
    pub fn compile(&self) -> Result<(AddressTemplate, Vec<AddressTemplate>), ConfigError> {
        let primary = AddressTemplate::parse(&self.primary_template).map_err(|e| {
            ConfigError::InvalidTemplate {
                field: "policy.primary_template".to_string(),
                message: e.to_string(),
            }
        })?;
        let secondary = self
            .secondary_templates
            .iter()
            .enumerate()
            .map(|(i, t)| {
                AddressTemplate::parse(t).map_err(|e| ConfigError::InvalidTemplate {
                    field: format!("policy.secondary_templates[{i}]"),
                    message: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok((primary, secondary))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.primary_mail_attribute.is_empty() || self.secondary_mail_attribute.is_empty() {
            return Err(ConfigError::invalid(
                "policy",
                "mail attributes must not be empty",
            ));
        }
        if self.max_collision_suffix < 2 {
            return Err(ConfigError::invalid(
                "policy.max_collision_suffix",
                "must be at least 2",
            ));
        }
        self.compile().map(|_| ())
    }
}

/// Filter and search base for one entry type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeRuleConfig {
    pub filter: String,

    /// Base DN for fallback lookups; `{base_dn}` is the namespace base.
    #[serde(default = "default_rule_base")]
    pub base_dn: String,
}

fn default_rule_base() -> String {
    BASE_DN_PLACEHOLDER.to_string()
}

impl TypeRuleConfig {
    fn new(filter: &str) -> Self {
        Self {
            filter: filter.to_string(),
            base_dn: default_rule_base(),
        }
    }

    /// Resolve the base DN for a namespace.
    #[must_use]
    pub fn resolve_base(&self, namespace_base: &str) -> String {
        self.base_dn.replace(BASE_DN_PLACEHOLDER, namespace_base)
    }
}

/// `[classifier]` section: one rule per entry type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default = "default_user_rule")]
    pub user: TypeRuleConfig,

    #[serde(default = "default_group_rule")]
    pub group: TypeRuleConfig,

    #[serde(default = "default_shared_folder_rule")]
    pub shared_folder: TypeRuleConfig,

    #[serde(default = "default_resource_rule")]
    pub resource: TypeRuleConfig,

    #[serde(default = "default_role_rule")]
    pub role: TypeRuleConfig,
}

fn default_user_rule() -> TypeRuleConfig {
    TypeRuleConfig::new("(objectClass=kolabInetOrgPerson)")
}

fn default_group_rule() -> TypeRuleConfig {
    TypeRuleConfig::new("(|(objectClass=groupOfUniqueNames)(objectClass=groupOfURLs))")
}

fn default_shared_folder_rule() -> TypeRuleConfig {
    TypeRuleConfig::new("(objectClass=kolabSharedFolder)")
}

fn default_resource_rule() -> TypeRuleConfig {
    TypeRuleConfig::new("(|(objectClass=kolabGroupOfUniqueNames)(objectClass=kolabResource))")
}

fn default_role_rule() -> TypeRuleConfig {
    TypeRuleConfig::new("(&(objectClass=ldapSubEntry)(objectClass=nsRoleDefinition))")
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            user: default_user_rule(),
            group: default_group_rule(),
            shared_folder: default_shared_folder_rule(),
            resource: default_resource_rule(),
            role: default_role_rule(),
        }
    }
}

impl ClassifierConfig {
    /// Rules in classification priority order.
    #[must_use]
    pub fn rules(&self) -> Vec<(EntryType, &TypeRuleConfig)> {
        EntryType::classification_order()
            .iter()
            .filter_map(|t| self.rule(*t).map(|rule| (*t, rule)))
            .collect()
    }

    /// Rule for a known type.
    #[must_use]
    pub fn rule(&self, entry_type: EntryType) -> Option<&TypeRuleConfig> {
        match entry_type {
            EntryType::User => Some(&self.user),
            EntryType::Group => Some(&self.group),
            EntryType::SharedFolder => Some(&self.shared_folder),
            EntryType::Resource => Some(&self.resource),
            EntryType::Role => Some(&self.role),
            EntryType::Unknown => None,
        }
    }

    /// Parse every rule filter, in classification order.
    pub fn compile(&self) -> Result<Vec<(EntryType, Filter)>, ConfigError> {
        self.rules()
            .into_iter()
            .map(|(entry_type, rule)| {
                Filter::parse(&rule.filter)
                    .map(|filter| (entry_type, filter))
                    .map_err(|source| ConfigError::InvalidFilter {
                        field: format!("classifier.{}.filter", entry_type.as_str()),
                        source,
                    })
            })
            .collect()
    }
}

/// One `[[auxiliary_folders]]` entry created beneath new personal mailboxes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuxiliaryFolder {
    /// Name relative to the personal mailbox, e.g. `Calendar`.
    pub name: String,

    /// Folder type such as `event.default`; the shared annotation gets the
    /// part before the first dot.
    #[serde(default)]
    pub folder_type: Option<String>,

    /// Extra grants in `subject, rights` form.
    #[serde(default)]
    pub acl: Vec<String>,

    /// Storage quota in KiB.
    #[serde(default)]
    pub quota_kib: Option<u64>,
}

impl AuxiliaryFolder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            folder_type: None,
            acl: Vec::new(),
            quota_kib: None,
        }
    }

    #[must_use]
    pub fn with_folder_type(mut self, folder_type: impl Into<String>) -> Self {
        self.folder_type = Some(folder_type.into());
        self
    }
}

/// `[shared_folders]` section: attributes of shared-folder entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedFolderConfig {
    /// Explicit target folder, e.g. `shared/Sales@example.org`.
    #[serde(default = "default_target_folder_attribute")]
    pub target_folder_attribute: String,

    /// Delivery address; its local part names the folder.
    #[serde(default = "default_delivery_address_attribute")]
    pub delivery_address_attribute: String,

    /// Attribute naming the folder when nothing else does.
    #[serde(default = "default_name_attribute")]
    pub name_attribute: String,

    /// Multi-valued `subject, rights[, epoch]` grants.
    #[serde(default = "default_acl_attribute")]
    pub acl_attribute: String,

    #[serde(default = "default_folder_type_attribute")]
    pub folder_type_attribute: String,

    #[serde(default = "default_folder_type")]
    pub default_folder_type: String,
}

fn default_target_folder_attribute() -> String {
    "kolabTargetFolder".to_string()
}

fn default_delivery_address_attribute() -> String {
    "mail".to_string()
}

fn default_name_attribute() -> String {
    "cn".to_string()
}

fn default_acl_attribute() -> String {
    "acl".to_string()
}

fn default_folder_type_attribute() -> String {
    "kolabFolderType".to_string()
}

fn default_folder_type() -> String {
    "mail".to_string()
}

impl Default for SharedFolderConfig {
    fn default() -> Self {
        Self {
            target_folder_attribute: default_target_folder_attribute(),
            delivery_address_attribute: default_delivery_address_attribute(),
            name_attribute: default_name_attribute(),
            acl_attribute: default_acl_attribute(),
            folder_type_attribute: default_folder_type_attribute(),
            default_folder_type: default_folder_type(),
        }
    }
}

/// Directory attribute conventions the engine needs to build searches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectorySchema {
    /// Immutable identifier attribute.
    pub id_attribute: String,
    /// Modification time attribute.
    pub modified_attribute: String,
    /// chrono format of the modification time.
    pub timestamp_format: String,
}

impl Default for DirectorySchema {
    fn default() -> Self {
        Self {
            id_attribute: "entryUUID".to_string(),
            modified_attribute: "modifyTimestamp".to_string(),
            timestamp_format: "%Y%m%d%H%M%SZ".to_string(),
        }
    }
}

/// All engine sections together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningConfig {
    pub sync: SyncSettings,

    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(default)]
    pub classifier: ClassifierConfig,

    #[serde(default)]
    pub auxiliary_folders: Vec<AuxiliaryFolder>,

    #[serde(default)]
    pub shared_folders: SharedFolderConfig,
}

impl ProvisioningConfig {
    /// Configuration with defaults for `primary_domain`.
    pub fn new(primary_domain: impl Into<String>) -> Self {
        Self {
            sync: SyncSettings::new(primary_domain),
            policy: PolicyConfig::default(),
            classifier: ClassifierConfig::default(),
            auxiliary_folders: Vec::new(),
            shared_folders: SharedFolderConfig::default(),
        }
    }

    /// Check every section, parsing filters and templates.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.sync.validate()?;
        self.policy.validate()?;
        self.classifier.compile()?;
        for (i, folder) in self.auxiliary_folders.iter().enumerate() {
            if folder.name.trim().is_empty() {
                return Err(ConfigError::invalid(
                    format!("auxiliary_folders[{i}].name"),
                    "must not be empty",
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = ProvisioningConfig::new("Example.org");
        assert_eq!(config.sync.primary_domain, "example.org");
        assert!(config.validate().is_ok());
        assert_eq!(config.sync.burst_threshold, 5);
        assert_eq!(config.policy.max_collision_suffix, 1000);
    }

    #[test]
    fn test_namespace_base_dn() {
        let mut sync = SyncSettings::new("example.org");
        assert_eq!(sync.namespace_base_dn("example.org"), "dc=example,dc=org");

        sync.base_dn = Some("o=corp".to_string());
        assert_eq!(sync.namespace_base_dn("example.org"), "o=corp");
        assert_eq!(sync.namespace_base_dn("sub.example.com"), "dc=sub,dc=example,dc=com");
    }

    #[test]
    fn test_mailbox_naming() {
        let naming = MailboxNaming::default();
        assert_eq!(naming.user_mailbox("jdoe@example.org"), "user/jdoe@example.org");
        assert_eq!(
            naming.user_folder("jdoe@example.org", "Calendar"),
            "user/jdoe/Calendar@example.org"
        );
        assert_eq!(
            naming.shared_folder("Sales", "example.org"),
            "shared/Sales@example.org"
        );
        assert!(naming.is_shared("shared/Sales@example.org"));
        assert!(!naming.is_shared("sharedx/Sales@example.org"));
        assert!(!naming.is_shared("jdoe@example.org"));
    }

    #[test]
    fn test_invalid_filter_is_reported() {
        let mut config = ProvisioningConfig::new("example.org");
        config.classifier.group.filter = "(objectClass=group".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("classifier.group.filter"));
    }

    #[test]
    fn test_invalid_template_is_reported() {
        let mut config = ProvisioningConfig::new("example.org");
        config.policy.secondary_templates = vec!["{uid|shout}@{domain}".to_string()];
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidTemplate { .. }));
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let mut config = ProvisioningConfig::new("example.org");
        config.sync.burst_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_classifier_order() {
        let config = ClassifierConfig::default();
        let order: Vec<EntryType> = config.rules().into_iter().map(|(t, _)| t).collect();
        assert_eq!(order, EntryType::classification_order().to_vec());
        assert_eq!(
            config.user.resolve_base("dc=example,dc=org"),
            "dc=example,dc=org"
        );
    }

    #[test]
    fn test_deserialize_partial_sections() {
        let config: ProvisioningConfig = serde_json::from_str(
            r#"{
                "sync": {"primary_domain": "example.org", "strategy": "paged"},
                "auxiliary_folders": [{"name": "Calendar", "folder_type": "event.default"}]
            }"#,
        )
        .unwrap();
        assert_eq!(config.sync.strategy, Some(FeedStrategy::Paged));
        assert_eq!(config.auxiliary_folders[0].folder_type.as_deref(), Some("event.default"));
        assert_eq!(config.shared_folders.acl_attribute, "acl");
    }
}
