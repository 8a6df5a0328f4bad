//! Daemon configuration loaded from a TOML file.
//!
//! Loading is fail-fast: the file must parse, every filter and template
//! must compile and both connections must be fully specified, or the
//! daemon refuses to start with a clear error message.

use std::env;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use dirsync_connector::error::ConnectorError;
use dirsync_connector_imap::ImapConfig;
use dirsync_connector_ldap::LdapConfig;
use dirsync_provisioning::{DirectorySchema, ProvisioningConfig};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/dirsync/dirsync.toml";

/// Environment variable overriding `[ldap] bind_password`.
pub const LDAP_PASSWORD_VAR: &str = "DIRSYNC_LDAP_BIND_PASSWORD";

/// Environment variable overriding `[imap] admin_password`.
pub const IMAP_PASSWORD_VAR: &str = "DIRSYNC_IMAP_PASSWORD";

/// Errors that prevent startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Engine(#[from] dirsync_provisioning::ConfigError),

    #[error("Invalid [{section}] section: {source}")]
    Connection {
        section: &'static str,
        #[source]
        source: ConnectorError,
    },
}

/// Complete daemon configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Directory connection.
    pub ldap: LdapConfig,

    /// Mail store connection.
    pub imap: ImapConfig,

    /// Engine sections: `[sync]`, `[policy]`, `[classifier]`,
    /// `[[auxiliary_folders]]` and `[shared_folders]`.
    #[serde(flatten)]
    pub engine: ProvisioningConfig,

    /// Log filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// PID file written at startup.
    #[serde(default)]
    pub pid_file: Option<PathBuf>,
}

fn default_log_filter() -> String {
    "info,dirsync=debug".to_string()
}

impl DaemonConfig {
    /// Read, override from the environment and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::parse(&contents, path)?;
        config.apply_overrides(|name| env::var(name).ok().filter(|v| !v.is_empty()));
        config.validate()?;
        Ok(config)
    }

    pub(crate) fn parse(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        if config.engine.sync.base_dn.is_none() {
            config.engine.sync.base_dn = Some(config.ldap.base_dn.clone());
        }
        Ok(config)
    }

    /// Replace secrets with values from `lookup` when it has them.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(password) = lookup(LDAP_PASSWORD_VAR) {
            self.ldap.bind_password = Some(password);
        }
        if let Some(password) = lookup(IMAP_PASSWORD_VAR) {
            self.imap.admin_password = Some(password);
        }
    }

    /// Check every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate()?;
        self.ldap
            .validate()
            .map_err(|source| ConfigError::Connection {
                section: "ldap",
                source,
            })?;
        self.imap
            .validate()
            .map_err(|source| ConfigError::Connection {
                section: "imap",
                source,
            })?;
        Ok(())
    }

    /// Attribute conventions of the configured directory.
    #[must_use]
    pub fn schema(&self) -> DirectorySchema {
        DirectorySchema {
            id_attribute: self.ldap.id_attribute.clone(),
            modified_attribute: self.ldap.modified_attribute.clone(),
            timestamp_format: self.ldap.timestamp_format.clone(),
        }
    }
}
