//! The `.inprogress` marker: cross-process mutual exclusion for a single
//! backup root.
//!
//! Grounded in `rsync_backup.py`'s `create_progress_marker` context
//! manager. Exclusive creation (`O_EXCL`) makes the "already running"
//! check atomic: at most one process observes `created == true` for a
//! given backup root at a time. [`ProgressMarker`] removes the file on
//! drop only if this process is the one that created it, so a refused
//! run never deletes another run's marker.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// RAII guard around the `.inprogress` marker file.
///
/// `ProgressMarker::acquire` returns `Ok(None)` if the marker already
/// existed (another run owns the tree) and `Ok(Some(marker))` once this
/// process has exclusively created it.
pub struct ProgressMarker {
    path: PathBuf,
}

impl ProgressMarker {
    /// Path the marker would live at for a given backup root, without
    /// attempting to create it.
    #[must_use]
    pub fn path_for(backup_path: &Path) -> PathBuf {
        backup_path.join(".inprogress")
    }

    /// Attempts to exclusively create the marker. Returns `None` if it
    /// already exists.
    pub fn acquire(backup_path: &Path) -> io::Result<Option<Self>> {
        let path = Self::path_for(backup_path);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs();
                let _ = write!(file, "{now}");
                Ok(Some(Self { path }))
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ProgressMarker {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_refused_while_first_is_held() {
        let dir = tempfile::tempdir().unwrap();
        let first = ProgressMarker::acquire(dir.path()).unwrap();
        assert!(first.is_some());
        let second = ProgressMarker::acquire(dir.path()).unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn marker_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _marker = ProgressMarker::acquire(dir.path()).unwrap().unwrap();
            assert!(ProgressMarker::path_for(dir.path()).exists());
        }
        assert!(!ProgressMarker::path_for(dir.path()).exists());
    }

    #[test]
    fn can_reacquire_after_drop() {
        let dir = tempfile::tempdir().unwrap();
        drop(ProgressMarker::acquire(dir.path()).unwrap());
        let second = ProgressMarker::acquire(dir.path()).unwrap();
        assert!(second.is_some());
    }
}
