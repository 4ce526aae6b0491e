//! Per-job scratch directories under a configured base.

use crate::error::{BackupError, Result};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::fs;
use std::path::{Path, PathBuf};

const NAME_LENGTH: usize = 40;

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    base: PathBuf,
}

impl WorkspaceManager {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Creates a fresh directory with a random name. The directory is made
    /// world-writable: dumper containers run under arbitrary uids.
    pub fn allocate(&self) -> Result<PathBuf> {
        let name: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(NAME_LENGTH)
            .map(char::from)
            .collect();
        let dir = self.base.join(name);

        fs::create_dir(&dir).map_err(BackupError::Workspace)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o777))
                .map_err(BackupError::Workspace)?;
        }

        Ok(dir)
    }

    /// Removes the tree recursively. A path that is already gone is fine.
    pub fn deallocate(&self, dir: &Path) -> Result<()> {
        match fs::remove_dir_all(dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BackupError::Workspace(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_then_deallocate() {
        let base = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(base.path());

        let dir = manager.allocate().unwrap();
        assert!(dir.is_dir());
        assert!(dir.starts_with(base.path()));
        assert_eq!(dir.file_name().unwrap().len(), NAME_LENGTH);

        manager.deallocate(&dir).unwrap();
        assert!(!dir.exists());
    }

    #[test]
    fn allocate_fails_without_base() {
        let manager = WorkspaceManager::new("/nonexistent_backuper_base");
        assert!(manager.allocate().is_err());
    }

    #[test]
    fn deallocate_missing_path_is_ok() {
        let base = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(base.path());

        manager.deallocate(&base.path().join("gone")).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn allocated_directory_is_world_writable() {
        use std::os::unix::fs::PermissionsExt;

        let base = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(base.path());

        let dir = manager.allocate().unwrap();
        let mode = std::fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o777);
    }
}
