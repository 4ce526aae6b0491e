//! Local filesystem mount.
//!
//! The destination is `<root>/<rule>_<created_at>`. Source and destination
//! may live on different filesystems, so the move is copy-then-remove,
//! never a rename.

use crate::error::{BackupError, Result};
use crate::models::backup::Backup;
use crate::transfer::Transport;
use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};

pub struct LocalMount {
    root: PathBuf,
    force: bool,
}

impl LocalMount {
    pub fn new(root: impl Into<PathBuf>, force: bool) -> Self {
        Self {
            root: root.into(),
            force,
        }
    }
}

#[async_trait]
impl Transport for LocalMount {
    async fn transfer(&self, backup: &Backup) -> Result<String> {
        let name = format!(
            "{}_{}",
            backup.rule,
            backup.created_at.format("%Y-%m-%d_%H-%M-%S")
        );
        let destination = self.root.join(name);

        let source = PathBuf::from(&backup.temp_directory);
        let target = destination.clone();
        let force = self.force;
        tokio::task::spawn_blocking(move || move_dir(&source, &target, force)).await??;

        Ok(destination.to_string_lossy().into_owned())
    }

    async fn remove(&self, backup: &Backup) -> Result<()> {
        let path = PathBuf::from(&backup.backup_file);
        tokio::task::spawn_blocking(move || {
            fs::remove_dir_all(&path).map_err(|e| BackupError::Transport(e.to_string()))
        })
        .await?
    }
}

fn move_dir(src: &Path, dst: &Path, force: bool) -> Result<()> {
    copy_dir(src, dst, force)
        .map_err(|e| BackupError::Transport(format!("failed to copy {} to {}: {}", src.display(), dst.display(), e)))?;
    fs::remove_dir_all(src)
        .map_err(|e| BackupError::Transport(format!("failed to cleanup source dir {}: {}", src.display(), e)))?;
    Ok(())
}

fn copy_dir(src: &Path, dst: &Path, force: bool) -> std::io::Result<()> {
    let src_meta = fs::metadata(src)?;
    if !src_meta.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "source is not a directory",
        ));
    }

    match fs::symlink_metadata(dst) {
        Ok(_) if force => fs::remove_dir_all(dst)?,
        Ok(_) => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "destination already exists",
            ))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    fs::create_dir_all(dst)?;
    fs::set_permissions(dst, src_meta.permissions())?;

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let from = entry.path();
        let to = dst.join(entry.file_name());

        if file_type.is_dir() {
            copy_dir(&from, &to, force)?;
        } else if file_type.is_symlink() {
            // Skip symlinks.
            continue;
        } else {
            fs::copy(&from, &to)?;
        }
    }

    Ok(())
}
