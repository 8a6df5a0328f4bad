//! Connections handed to namespace workers.

use std::sync::Arc;

use dirsync_connector::error::ConnectorResult;
use dirsync_connector::traits::{Directory, MailStore};
use dirsync_connector_imap::{ImapConfig, ImapMailStore};
use dirsync_connector_ldap::{LdapConfig, LdapDirectory};
use dirsync_provisioning::{ConnectorFactory, SyncSettings};

/// Opens an LDAP directory and an IMAP session per request.
pub struct LdapImapFactory {
    ldap: LdapConfig,
    imap: ImapConfig,
    sync: SyncSettings,
}

impl LdapImapFactory {
    pub fn new(ldap: LdapConfig, imap: ImapConfig, sync: SyncSettings) -> Self {
        Self { ldap, imap, sync }
    }

    /// Directory config rooted at the namespace's base DN.
    fn ldap_for(&self, namespace: &str) -> LdapConfig {
        let mut config = self.ldap.clone();
        config.base_dn = self.sync.namespace_base_dn(namespace);
        config
    }

    /// Directory used for namespace discovery.
    pub fn discovery(&self) -> ConnectorResult<Arc<dyn Directory>> {
        Ok(Arc::new(LdapDirectory::new(self.ldap.clone())?))
    }
}

impl ConnectorFactory for LdapImapFactory {
    fn directory(&self, namespace: &str) -> ConnectorResult<Arc<dyn Directory>> {
        Ok(Arc::new(LdapDirectory::new(self.ldap_for(namespace))?))
    }

    fn mail_store(&self, _namespace: &str) -> ConnectorResult<Arc<dyn MailStore>> {
        Ok(Arc::new(ImapMailStore::new(self.imap.clone())?))
    }
}
