//! IMAP mail store implementation

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use dirsync_connector::error::{ConnectorError, ConnectorResult};
use dirsync_connector::operation::AclEntry;
use dirsync_connector::traits::MailStore;

use crate::config::ImapConfig;
use crate::protocol::{acl_entries, list_name, metadata_entries, quote, storage_limit, Status};
use crate::session::{CommandOutcome, ImapSession};

/// Any bidirectional byte stream an IMAP session can run over.
pub trait ImapStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ImapStream for T {}

type BoxedStream = Box<dyn ImapStream>;

/// Mail store reached over an administrative IMAP session.
///
/// The session is opened lazily and dropped after any transport failure;
/// the next call reconnects.
pub struct ImapMailStore {
    config: ImapConfig,
    display_name: String,
    session: Mutex<Option<ImapSession<BoxedStream>>>,
}

impl ImapMailStore {
    /// Create a new store. No connection is made until first use.
    pub fn new(config: ImapConfig) -> ConnectorResult<Self> {
        config.validate()?;
        let display_name = format!("IMAP: {}", config.host);
        Ok(Self {
            config,
            display_name,
            session: Mutex::new(None),
        })
    }

    /// Create a store over an already established stream, reading the
    /// greeting and logging in.
    pub async fn from_stream(
        config: ImapConfig,
        stream: impl ImapStream + 'static,
    ) -> ConnectorResult<Self> {
        let store = Self::new(config)?;
        let session = store.authenticate(Box::new(stream)).await?;
        *store.session.lock().await = Some(session);
        Ok(store)
    }

    /// Set a custom display name.
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Get the configuration.
    pub fn config(&self) -> &ImapConfig {
        &self.config
    }

    async fn authenticate(
        &self,
        stream: BoxedStream,
    ) -> ConnectorResult<ImapSession<BoxedStream>> {
        let mut session = ImapSession::new(stream);
        session.read_greeting().await?;
        let password = self.config.admin_password.as_deref().unwrap_or_default();
        session.login(&self.config.admin_login, password).await?;
        Ok(session)
    }

    async fn open_session(&self) -> ConnectorResult<ImapSession<BoxedStream>> {
        let address = self.config.address();
        debug!(address = %address, "Connecting to IMAP server");

        let timeout = self.config.connection.connection_timeout();
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| ConnectorError::Timeout {
                timeout_secs: self.config.connection.connection_timeout_secs,
            })?
            .map_err(|e| {
                ConnectorError::connection_failed_with_source(
                    format!("failed to connect to {address}"),
                    e,
                )
            })?;

        let session = tokio::time::timeout(timeout, self.authenticate(Box::new(stream)))
            .await
            .map_err(|_| ConnectorError::Timeout {
                timeout_secs: self.config.connection.connection_timeout_secs,
            })??;

        info!(address = %address, login = %self.config.admin_login, "IMAP session established");
        Ok(session)
    }

    /// Run one command, reconnecting first if needed.
    async fn execute(&self, command: String) -> ConnectorResult<CommandOutcome> {
        let mut guard = self.session.lock().await;
        if guard.is_none() {
            *guard = Some(self.open_session().await?);
        }
        let Some(session) = guard.as_mut() else {
            return Err(ConnectorError::internal("IMAP session missing after connect"));
        };

        let timeout = self.config.connection.operation_timeout();
        match tokio::time::timeout(timeout, session.command(&command)).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(e)) => {
                warn!(error = %e, "IMAP session failed, dropping it");
                *guard = None;
                Err(e)
            }
            Err(_) => {
                *guard = None;
                Err(ConnectorError::Timeout {
                    timeout_secs: self.config.connection.operation_timeout_secs,
                })
            }
        }
    }

    /// Run a command and map a NO/BAD completion to an error.
    async fn execute_checked(
        &self,
        command: String,
        operation: &str,
        path: &str,
    ) -> ConnectorResult<CommandOutcome> {
        let outcome = self.execute(command).await?;
        if outcome.is_ok() {
            Ok(outcome)
        } else {
            Err(completion_error(&outcome, operation, path))
        }
    }
}

/// Classify a failed completion by response code, falling back to the
/// wording servers without RFC 5530 codes use.
fn completion_error(outcome: &CommandOutcome, operation: &str, path: &str) -> ConnectorError {
    let text = outcome.text.to_ascii_lowercase();
    let code = outcome.code().map(str::to_ascii_uppercase);

    if matches!(outcome.status, Status::Bad) {
        return ConnectorError::operation_failed(format!(
            "{operation} {path} rejected: {}",
            outcome.text
        ));
    }

    match code.as_deref() {
        Some("NONEXISTENT") => return ConnectorError::not_found(path),
        Some("ALREADYEXISTS") => {
            return ConnectorError::ObjectAlreadyExists {
                identifier: path.to_string(),
            }
        }
        Some("NOPERM") => {
            return ConnectorError::AuthorizationFailed {
                operation: format!("{operation} {path}"),
            }
        }
        Some("UNAVAILABLE" | "INUSE") => {
            return ConnectorError::Unavailable {
                message: outcome.text.clone(),
            }
        }
        _ => {}
    }

    if text.contains("already exists") {
        ConnectorError::ObjectAlreadyExists {
            identifier: path.to_string(),
        }
    } else if text.contains("does not exist") || text.contains("nonexistent") {
        ConnectorError::not_found(path)
    } else if text.contains("permission denied") {
        ConnectorError::AuthorizationFailed {
            operation: format!("{operation} {path}"),
        }
    } else {
        ConnectorError::operation_failed(format!("{operation} {path} failed: {}", outcome.text))
    }
}

#[async_trait]
impl MailStore for ImapMailStore {
    fn display_name(&self) -> &str {
        &self.display_name
    }

    async fn disconnect(&self) -> ConnectorResult<()> {
        if let Some(mut session) = self.session.lock().await.take() {
            session.logout().await;
            debug!("IMAP session closed");
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn mailbox_exists(&self, path: &str) -> ConnectorResult<bool> {
        Ok(self.list_mailboxes(path).await?.iter().any(|name| name == path))
    }

    #[instrument(skip(self))]
    async fn create_mailbox(&self, path: &str, server: Option<&str>) -> ConnectorResult<()> {
        let command = match server {
            Some(server) => format!("CREATE {} {}", quote(path), quote(server)),
            None => format!("CREATE {}", quote(path)),
        };
        match self.execute_checked(command, "CREATE", path).await {
            Ok(_) => {
                info!(mailbox = %path, "Mailbox created");
                Ok(())
            }
            Err(ConnectorError::ObjectAlreadyExists { .. }) => {
                debug!(mailbox = %path, "Mailbox already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    async fn rename_mailbox(
        &self,
        from: &str,
        to: &str,
        partition: Option<&str>,
    ) -> ConnectorResult<()> {
        let command = match partition {
            Some(partition) => {
                format!("RENAME {} {} {}", quote(from), quote(to), quote(partition))
            }
            None => format!("RENAME {} {}", quote(from), quote(to)),
        };
        self.execute_checked(command, "RENAME", from).await?;
        info!(from = %from, to = %to, "Mailbox renamed");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_mailbox(&self, path: &str) -> ConnectorResult<()> {
        let command = format!("DELETE {}", quote(path));
        match self.execute_checked(command.clone(), "DELETE", path).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                debug!(mailbox = %path, "Mailbox already absent");
                return Ok(());
            }
            Err(ConnectorError::AuthorizationFailed { .. }) => {
                debug!(mailbox = %path, "Granting admin delete rights before retrying");
                self.set_acl(path, &self.config.admin_login, &self.config.admin_delete_rights)
                    .await?;
                self.execute_checked(command, "DELETE", path).await?;
            }
            Err(e) => return Err(e),
        }
        info!(mailbox = %path, "Mailbox deleted");
        Ok(())
    }

    async fn list_mailboxes(&self, pattern: &str) -> ConnectorResult<Vec<String>> {
        let outcome = self
            .execute_checked(format!("LIST \"\" {}", quote(pattern)), "LIST", pattern)
            .await?;
        Ok(outcome
            .untagged
            .iter()
            .filter_map(list_name)
            .map(str::to_string)
            .collect())
    }

    async fn get_acl(&self, path: &str) -> ConnectorResult<Vec<AclEntry>> {
        let outcome = self
            .execute_checked(format!("GETACL {}", quote(path)), "GETACL", path)
            .await?;
        Ok(outcome
            .untagged
            .iter()
            .filter_map(acl_entries)
            .flatten()
            .collect())
    }

    #[instrument(skip(self))]
    async fn set_acl(&self, path: &str, subject: &str, rights: &str) -> ConnectorResult<()> {
        if rights.is_empty() {
            return self.delete_acl(path, subject).await;
        }
        let command = format!("SETACL {} {} {}", quote(path), quote(subject), quote(rights));
        self.execute_checked(command, "SETACL", path).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_acl(&self, path: &str, subject: &str) -> ConnectorResult<()> {
        let command = format!("DELETEACL {} {}", quote(path), quote(subject));
        self.execute_checked(command, "DELETEACL", path).await?;
        Ok(())
    }

    async fn get_metadata(&self, path: &str, key: &str) -> ConnectorResult<Option<String>> {
        let command = format!("GETMETADATA {} {}", quote(path), quote(key));
        let outcome = self.execute_checked(command, "GETMETADATA", path).await?;
        Ok(outcome
            .untagged
            .iter()
            .filter_map(metadata_entries)
            .flatten()
            .find(|metadata| metadata.entry.eq_ignore_ascii_case(key))
            .and_then(|metadata| metadata.value.clone()))
    }

    #[instrument(skip(self))]
    async fn set_metadata(&self, path: &str, key: &str, value: &str) -> ConnectorResult<()> {
        let command = format!(
            "SETMETADATA {} ({} {})",
            quote(path),
            quote(key),
            quote(value)
        );
        self.execute_checked(command, "SETMETADATA", path).await?;
        Ok(())
    }

    async fn get_quota(&self, path: &str) -> ConnectorResult<Option<u64>> {
        let command = format!("GETQUOTAROOT {}", quote(path));
        let outcome = self.execute_checked(command, "GETQUOTAROOT", path).await?;
        Ok(outcome
            .untagged
            .iter()
            .find_map(|response| storage_limit(response, path)))
    }

    #[instrument(skip(self))]
    async fn set_quota(&self, path: &str, limit_kib: u64) -> ConnectorResult<()> {
        let command = format!("SETQUOTA {} (STORAGE {limit_kib})", quote(path));
        self.execute_checked(command, "SETQUOTA", path).await?;
        info!(mailbox = %path, limit_kib, "Quota set");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(status: Status, text: &str) -> CommandOutcome {
        CommandOutcome {
            untagged: Vec::new(),
            status,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_completion_error_by_code() {
        let err = completion_error(
            &outcome(Status::No, "[NONEXISTENT] Mailbox does not exist"),
            "DELETE",
            "user/x@example.org",
        );
        assert!(err.is_not_found());

        let err = completion_error(&outcome(Status::No, "[NOPERM] no"), "DELETE", "x");
        assert!(matches!(err, ConnectorError::AuthorizationFailed { .. }));

        let err = completion_error(&outcome(Status::No, "[INUSE] locked"), "CREATE", "x");
        assert!(err.is_transient());
    }

    #[test]
    fn test_completion_error_by_text() {
        let err = completion_error(
            &outcome(Status::No, "Mailbox already exists"),
            "CREATE",
            "x",
        );
        assert!(matches!(err, ConnectorError::ObjectAlreadyExists { .. }));

        let err = completion_error(&outcome(Status::No, "Permission denied"), "DELETE", "x");
        assert!(matches!(err, ConnectorError::AuthorizationFailed { .. }));

        let err = completion_error(&outcome(Status::Bad, "Invalid mailbox name"), "CREATE", "x");
        assert_eq!(err.error_code(), "OPERATION_FAILED");
    }

    #[test]
    fn test_new_validates_config() {
        assert!(ImapMailStore::new(ImapConfig::new("", "cyrus-admin")).is_err());
        let store =
            ImapMailStore::new(ImapConfig::new("imap.example.org", "cyrus-admin").with_password("pw"))
                .unwrap();
        assert_eq!(store.display_name(), "IMAP: imap.example.org");
    }
}
