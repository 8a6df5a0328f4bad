//! Error types for the sync engine.

use std::path::PathBuf;

use thiserror::Error;

use dirsync_connector::error::ConnectorError;
use dirsync_connector::filter::FilterParseError;

/// Errors from the watermark cache.
#[derive(Debug, Error)]
pub enum WatermarkError {
    /// Database error.
    #[error("watermark database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Cache directory could not be prepared.
    #[error("cannot prepare cache directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result type for watermark operations.
pub type WatermarkResult<T> = Result<T, WatermarkError>;

/// Errors from the recipient policy engine.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// Directory lookup or write-back failed.
    #[error("directory error: {0}")]
    Directory(#[from] ConnectorError),

    /// Suffix probing ran past the configured bound.
    #[error("no free address for '{candidate}' within {limit} suffixes")]
    CollisionLimit { candidate: String, limit: u32 },

    /// Rendered address is not `local@domain`.
    #[error("invalid address '{address}'")]
    InvalidAddress { address: String },
}

impl PolicyError {
    /// Check if retrying after reconnect may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, PolicyError::Directory(e) if e.is_transient())
    }
}

/// Result type for policy operations.
pub type PolicyResult<T> = Result<T, PolicyError>;

/// Errors from reconciling one change event.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Directory or mail store call failed.
    #[error("connector error: {0}")]
    Connector(#[from] ConnectorError),

    /// Recipient policy failed.
    #[error("recipient policy error: {0}")]
    Policy(#[from] PolicyError),

    /// Watermark cache failed.
    #[error("watermark error: {0}")]
    Watermark(#[from] WatermarkError),

    /// Entry lacks data the handler needs.
    #[error("entry {entry_id} is incomplete: {message}")]
    IncompleteEntry { entry_id: String, message: String },
}

impl ReconcileError {
    /// Check if this error is a transport failure.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            ReconcileError::Connector(e) => e.is_transient(),
            ReconcileError::Policy(e) => e.is_transient(),
            ReconcileError::Watermark(_) | ReconcileError::IncompleteEntry { .. } => false,
        }
    }

    pub(crate) fn incomplete(entry_id: &str, message: impl Into<String>) -> Self {
        ReconcileError::IncompleteEntry {
            entry_id: entry_id.to_string(),
            message: message.into(),
        }
    }
}

/// Result type for reconciliation.
pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Errors from the change feed driver.
#[derive(Debug, Error)]
pub enum FeedError {
    /// Directory error that ended the feed pass.
    #[error("directory error: {0}")]
    Directory(#[from] ConnectorError),

    /// Sync cursor could not be read or written.
    #[error("sync cursor {path}: {message}")]
    Cursor { path: PathBuf, message: String },

    /// Feed was cancelled.
    #[error("feed cancelled")]
    Cancelled,
}

impl FeedError {
    pub(crate) fn cursor(path: impl Into<PathBuf>, message: impl std::fmt::Display) -> Self {
        FeedError::Cursor {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

/// Result type for feed operations.
pub type FeedResult<T> = Result<T, FeedError>;

/// Invalid engine configuration, detected once at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A configured filter does not parse.
    #[error("invalid filter in {field}: {source}")]
    InvalidFilter {
        field: String,
        #[source]
        source: FilterParseError,
    },

    /// A configured address template does not parse.
    #[error("invalid template in {field}: {message}")]
    InvalidTemplate { field: String, message: String },

    /// Any other invalid value.
    #[error("invalid value for {field}: {message}")]
    Invalid { field: String, message: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Errors assembling a namespace worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Invalid configuration for this namespace.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Watermark cache could not be opened.
    #[error(transparent)]
    Watermark(#[from] WatermarkError),

    /// Connector could not be created.
    #[error(transparent)]
    Connector(#[from] ConnectorError),
}
