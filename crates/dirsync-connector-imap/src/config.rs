//! IMAP Connector configuration

use serde::{Deserialize, Serialize};

use dirsync_connector::config::ConnectionSettings;
use dirsync_connector::error::{ConnectorError, ConnectorResult};

/// Configuration for the administrative IMAP connection.
#[derive(Clone, Serialize, Deserialize)]
pub struct ImapConfig {
    /// IMAP server hostname or IP address.
    pub host: String,

    /// IMAP server port.
    #[serde(default = "default_imap_port")]
    pub port: u16,

    /// Administrator login.
    pub admin_login: String,

    /// Administrator password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_password: Option<String>,

    /// Rights the administrator grants itself before deleting a mailbox
    /// it cannot otherwise remove.
    #[serde(default = "default_admin_delete_rights")]
    pub admin_delete_rights: String,

    /// Connection settings (timeouts, reconnect delay).
    #[serde(default)]
    pub connection: ConnectionSettings,
}

impl std::fmt::Debug for ImapConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("admin_login", &self.admin_login)
            .field(
                "admin_password",
                &self.admin_password.as_ref().map(|_| "***REDACTED***"),
            )
            .field("admin_delete_rights", &self.admin_delete_rights)
            .field("connection", &self.connection)
            .finish()
    }
}

fn default_imap_port() -> u16 {
    143
}

fn default_admin_delete_rights() -> String {
    "x".to_string()
}

impl ImapConfig {
    /// Create a new IMAP config with required fields.
    pub fn new(host: impl Into<String>, admin_login: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_imap_port(),
            admin_login: admin_login.into(),
            admin_password: None,
            admin_delete_rights: default_admin_delete_rights(),
            connection: ConnectionSettings::default(),
        }
    }

    /// Set the administrator password.
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.admin_password = Some(password.into());
        self
    }

    /// Set the port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set connection settings.
    #[must_use]
    pub fn with_connection(mut self, connection: ConnectionSettings) -> Self {
        self.connection = connection;
        self
    }

    /// `host:port` address.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ConnectorResult<()> {
        if self.host.trim().is_empty() {
            return Err(ConnectorError::InvalidConfiguration {
                message: "host is required".to_string(),
            });
        }
        if self.admin_login.trim().is_empty() {
            return Err(ConnectorError::InvalidConfiguration {
                message: "admin_login is required".to_string(),
            });
        }
        if self.admin_password.is_none() {
            return Err(ConnectorError::InvalidConfiguration {
                message: "admin_password is required".to_string(),
            });
        }
        Ok(())
    }

    /// Create a redacted copy for display.
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if config.admin_password.is_some() {
            config.admin_password = Some("***REDACTED***".to_string());
        }
        config
    }
}
