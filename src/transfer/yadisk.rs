//! Yandex.Disk remote mount.
//!
//! Transfer requests a pre-signed upload link, then streams the packed
//! archive to it. Link request and deletion are bounded to 30 seconds; the
//! upload itself runs as long as the body takes.

use crate::error::{BackupError, Result};
use crate::models::backup::Backup;
use crate::transfer::Transport;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tokio_util::io::ReaderStream;

const API_BASE: &str = "https://cloud-api.yandex.net/v1/disk";
const OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

pub struct YadiskMount {
    client: reqwest::Client,
    access_token: String,
    root: String,
}

#[derive(Debug, Deserialize)]
struct UploadLink {
    href: String,
}

impl YadiskMount {
    pub fn new(access_token: impl Into<String>, root: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            access_token: access_token.into(),
            root: root.into(),
        }
    }

    fn authorization(&self) -> String {
        format!("OAuth {}", self.access_token)
    }
}

#[async_trait]
impl Transport for YadiskMount {
    async fn transfer(&self, backup: &Backup) -> Result<String> {
        let name = format!(
            "{}_{}.zip",
            backup.rule,
            backup.created_at.format("%Y-%m-%d_%H-%M-%S")
        );
        let target = format!("{}/{}", self.root.trim_end_matches('/'), name);

        let link: UploadLink = self
            .client
            .get(format!("{}/resources/upload", API_BASE))
            .query(&[("path", target.as_str()), ("overwrite", "false")])
            .header(reqwest::header::AUTHORIZATION, self.authorization())
            .timeout(OPERATION_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let file = tokio::fs::File::open(&backup.temp_backup_file)
            .await
            .map_err(|e| {
                BackupError::Transport(format!(
                    "unable to open {}: {}",
                    backup.temp_backup_file, e
                ))
            })?;

        self.client
            .put(&link.href)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await?
            .error_for_status()?;

        Ok(target)
    }

    async fn remove(&self, backup: &Backup) -> Result<()> {
        self.client
            .delete(format!("{}/resources", API_BASE))
            .query(&[("path", backup.backup_file.as_str()), ("permanently", "true")])
            .header(reqwest::header::AUTHORIZATION, self.authorization())
            .timeout(OPERATION_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }
}
