//! Replication cookie persistence.
//!
//! Content synchronization resumes from the last cookie the directory
//! handed out. The cookie is stored next to the watermark database as a
//! small JSON document and replaced atomically.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FeedError, FeedResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CursorFile {
    namespace: String,
    cookie: String,
    updated_at: DateTime<Utc>,
}

/// Cookie store for one namespace.
#[derive(Debug, Clone)]
pub struct SyncCursorStore {
    path: PathBuf,
    namespace: String,
}

impl SyncCursorStore {
    /// Store under `cache_dir` for `namespace`.
    #[must_use]
    pub fn new(cache_dir: &Path, namespace: &str) -> Self {
        let file = format!("{}.cursor.json", namespace.to_lowercase().replace('/', "_"));
        Self {
            path: cache_dir.join(file),
            namespace: namespace.to_string(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last saved cookie, if any.
    pub async fn load(&self) -> FeedResult<Option<String>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(FeedError::cursor(&self.path, e)),
        };
        let file: CursorFile =
            serde_json::from_slice(&raw).map_err(|e| FeedError::cursor(&self.path, e))?;
        if file.cookie.is_empty() {
            return Ok(None);
        }
        Ok(Some(file.cookie))
    }

    /// Persist `cookie`, replacing the previous one.
    pub async fn save(&self, cookie: &str) -> FeedResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FeedError::cursor(parent, e))?;
        }

        let file = CursorFile {
            namespace: self.namespace.clone(),
            cookie: cookie.to_string(),
            updated_at: Utc::now(),
        };
        let body = serde_json::to_vec_pretty(&file).map_err(|e| FeedError::cursor(&self.path, e))?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| FeedError::cursor(&tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| FeedError::cursor(&self.path, e))?;

        debug!(namespace = %self.namespace, "Saved sync cursor");
        Ok(())
    }

    /// Forget the cookie so the next session starts from scratch.
    pub async fn clear(&self) -> FeedResult<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!(namespace = %self.namespace, "Cleared sync cursor");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FeedError::cursor(&self.path, e)),
        }
    }
}
