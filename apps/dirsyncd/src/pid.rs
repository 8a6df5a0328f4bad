//! PID file handling.

use std::io;
use std::path::{Path, PathBuf};

use tracing::warn;

/// PID file removed again when dropped.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Write the current process id to `path`.
    pub fn create(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, format!("{}\n", std::process::id()))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Cannot remove PID file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_written_and_removed() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("run").join("dirsyncd.pid");

        let pid = PidFile::create(&path).unwrap();
        let contents = std::fs::read_to_string(pid.path()).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());

        drop(pid);
        assert!(!path.exists());
    }
}
