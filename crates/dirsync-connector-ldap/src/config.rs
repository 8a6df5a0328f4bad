//! LDAP Connector configuration

use serde::{Deserialize, Serialize};

use dirsync_connector::config::ConnectionSettings;
use dirsync_connector::error::{ConnectorError, ConnectorResult};

/// Configuration for the LDAP directory connector.
#[derive(Clone, Serialize, Deserialize)]
pub struct LdapConfig {
    /// LDAP server hostname or IP address.
    pub host: String,

    /// LDAP server port.
    #[serde(default = "default_ldap_port")]
    pub port: u16,

    /// Base DN for entry searches (e.g., "dc=example,dc=org").
    pub base_dn: String,

    /// Bind DN for authentication.
    pub bind_dn: String,

    /// Bind password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_password: Option<String>,

    /// Connection settings (timeouts, reconnect delay).
    #[serde(default)]
    pub connection: ConnectionSettings,

    /// Attribute holding the immutable entry identifier.
    #[serde(default = "default_id_attribute")]
    pub id_attribute: String,

    /// Whether the identifier attribute is binary (e.g. objectGUID).
    /// Binary identifiers are base64 encoded.
    #[serde(default)]
    pub id_is_binary: bool,

    /// Attribute holding the last modification time.
    #[serde(default = "default_modified_attribute")]
    pub modified_attribute: String,

    /// chrono format of the modification time attribute.
    #[serde(default = "default_timestamp_format")]
    pub timestamp_format: String,

    /// Page size for paged searches.
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Base DN of the domain entries. Unset disables domain discovery.
    #[serde(default = "default_domain_base_dn")]
    pub domain_base_dn: Option<String>,

    /// Filter selecting domain entries.
    #[serde(default = "default_domain_filter")]
    pub domain_filter: String,

    /// Multi-valued attribute naming a domain; the first value is the
    /// primary name, the rest are aliases.
    #[serde(default = "default_domain_name_attribute")]
    pub domain_name_attribute: String,
}

impl std::fmt::Debug for LdapConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LdapConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("base_dn", &self.base_dn)
            .field("bind_dn", &self.bind_dn)
            .field(
                "bind_password",
                &self.bind_password.as_ref().map(|_| "***REDACTED***"),
            )
            .field("connection", &self.connection)
            .field("id_attribute", &self.id_attribute)
            .field("id_is_binary", &self.id_is_binary)
            .field("modified_attribute", &self.modified_attribute)
            .field("timestamp_format", &self.timestamp_format)
            .field("page_size", &self.page_size)
            .field("domain_base_dn", &self.domain_base_dn)
            .field("domain_filter", &self.domain_filter)
            .field("domain_name_attribute", &self.domain_name_attribute)
            .finish()
    }
}

fn default_ldap_port() -> u16 {
    389
}

fn default_id_attribute() -> String {
    "entryUUID".to_string()
}

fn default_modified_attribute() -> String {
    "modifyTimestamp".to_string()
}

fn default_timestamp_format() -> String {
    "%Y%m%d%H%M%SZ".to_string()
}

fn default_page_size() -> u32 {
    500
}

#[allow(clippy::unnecessary_wraps)]
fn default_domain_base_dn() -> Option<String> {
    Some("cn=kolab,cn=config".to_string())
}

fn default_domain_filter() -> String {
    "(&(objectClass=domainrelatedobject)(associatedDomain=*))".to_string()
}

fn default_domain_name_attribute() -> String {
    "associatedDomain".to_string()
}

impl LdapConfig {
    /// Create a new LDAP config with required fields.
    pub fn new(
        host: impl Into<String>,
        base_dn: impl Into<String>,
        bind_dn: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: default_ldap_port(),
            base_dn: base_dn.into(),
            bind_dn: bind_dn.into(),
            bind_password: None,
            connection: ConnectionSettings::default(),
            id_attribute: default_id_attribute(),
            id_is_binary: false,
            modified_attribute: default_modified_attribute(),
            timestamp_format: default_timestamp_format(),
            page_size: default_page_size(),
            domain_base_dn: default_domain_base_dn(),
            domain_filter: default_domain_filter(),
            domain_name_attribute: default_domain_name_attribute(),
        }
    }

    /// Set bind password.
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.bind_password = Some(password.into());
        self
    }

    /// Set the port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Use a binary identifier attribute such as objectGUID.
    #[must_use]
    pub fn with_binary_id(mut self, attribute: impl Into<String>) -> Self {
        self.id_attribute = attribute.into();
        self.id_is_binary = true;
        self
    }

    /// Disable domain discovery.
    #[must_use]
    pub fn without_domain_discovery(mut self) -> Self {
        self.domain_base_dn = None;
        self
    }

    /// Get the LDAP URL.
    #[must_use]
    pub fn url(&self) -> String {
        format!("ldap://{}:{}", self.host, self.port)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ConnectorResult<()> {
        let required = [
            ("host", &self.host),
            ("base_dn", &self.base_dn),
            ("bind_dn", &self.bind_dn),
            ("id_attribute", &self.id_attribute),
            ("modified_attribute", &self.modified_attribute),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(ConnectorError::InvalidConfiguration {
                    message: format!("{name} is required"),
                });
            }
        }

        if self.page_size == 0 {
            return Err(ConnectorError::InvalidConfiguration {
                message: "page_size must be greater than zero".to_string(),
            });
        }

        if self.domain_base_dn.is_some() && self.domain_name_attribute.trim().is_empty() {
            return Err(ConnectorError::InvalidConfiguration {
                message: "domain_name_attribute is required for domain discovery".to_string(),
            });
        }

        Ok(())
    }

    /// Create a redacted copy for display.
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if config.bind_password.is_some() {
            config.bind_password = Some("***REDACTED***".to_string());
        }
        config
    }
}
