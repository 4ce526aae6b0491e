//! Named storage backends that move a finished backup to durable storage
//! and delete it later.

pub mod local;
pub mod yadisk;

use crate::config::TransferEntry;
use crate::error::{BackupError, Result};
use crate::models::backup::Backup;
use async_trait::async_trait;
use std::collections::HashMap;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Moves the packed artifact to durable storage and returns an opaque
    /// locator used later for deletion.
    async fn transfer(&self, backup: &Backup) -> Result<String>;

    /// Removes the artifact referenced by `backup.backup_file`.
    async fn remove(&self, backup: &Backup) -> Result<()>;
}

pub struct TransferRegistry {
    mounts: HashMap<String, Box<dyn Transport>>,
}

impl TransferRegistry {
    pub fn from_config(entries: &HashMap<String, TransferEntry>) -> Result<Self> {
        let mut mounts: HashMap<String, Box<dyn Transport>> = HashMap::new();

        for (name, entry) in entries {
            let mount: Box<dyn Transport> = match entry.kind.as_str() {
                "local" => {
                    let force = entry
                        .opts
                        .get("force")
                        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                        .unwrap_or(false);
                    Box::new(local::LocalMount::new(&entry.root, force))
                }
                "yadisk" => {
                    let token = entry.opts.get("access_token").ok_or_else(|| {
                        BackupError::Config(format!(
                            "transfer '{}': yadisk requires opts.access_token",
                            name
                        ))
                    })?;
                    Box::new(yadisk::YadiskMount::new(token, &entry.root))
                }
                other => {
                    tracing::warn!(name = %name, kind = %other, "skipping transfer entry of unknown type");
                    continue;
                }
            };
            mounts.insert(name.clone(), mount);
        }

        Ok(Self { mounts })
    }

    #[cfg(test)]
    pub fn with_mounts(mounts: HashMap<String, Box<dyn Transport>>) -> Self {
        Self { mounts }
    }

    pub async fn transfer(&self, backup: &Backup) -> Result<String> {
        match self.mounts.get(&backup.storage_name) {
            Some(mount) => mount.transfer(backup).await,
            None => Err(BackupError::MountDoesNotExist),
        }
    }

    pub async fn remove(&self, backup: &Backup) -> Result<()> {
        match self.mounts.get(&backup.storage_name) {
            Some(mount) => mount.remove(backup).await,
            None => Err(BackupError::MountDoesNotExist),
        }
    }
}
