//! Docker container driver for dumper containers.

use crate::error::{BackupError, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
    WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use bollard::{ClientVersion, Docker, API_DEFAULT_VERSION};
use futures_util::{StreamExt, TryStreamExt};
use std::time::Duration;

/// Mount point of the scratch directory inside every dumper container.
pub const BACKUP_TARGET_DIR: &str = "/__backup__";

const CONNECT_TIMEOUT_SECS: u64 = 120;
const PING_TIMEOUT: Duration = Duration::from_secs(10);

/// The subset of the container runtime the backup service consumes.
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    async fn pull(&self, image: &str) -> Result<()>;

    /// Creates a container with the scratch directory bind-mounted at
    /// [`BACKUP_TARGET_DIR`] and returns the runtime's container id.
    async fn create(
        &self,
        name: &str,
        image: &str,
        command: &[String],
        temp_directory: &str,
    ) -> Result<String>;

    async fn start(&self, container_id: &str) -> Result<()>;

    /// Blocks until the container exits and returns its exit code.
    async fn wait(&self, container_id: &str) -> Result<i64>;

    /// Force-removes the container.
    async fn remove(&self, container_id: &str) -> Result<()>;
}

pub struct DockerDriver {
    docker: Docker,
}

impl DockerDriver {
    pub fn connect(host: &str, version: &str) -> Result<Self> {
        let docker = if host.is_empty() {
            Docker::connect_with_local_defaults()?
        } else {
            let client_version = parse_client_version(version)?;
            if host.starts_with("unix://") {
                Docker::connect_with_socket(host, CONNECT_TIMEOUT_SECS, &client_version)?
            } else {
                Docker::connect_with_http(host, CONNECT_TIMEOUT_SECS, &client_version)?
            }
        };

        Ok(Self { docker })
    }

    pub async fn ping(&self) -> Result<()> {
        tokio::time::timeout(PING_TIMEOUT, self.docker.ping())
            .await
            .map_err(|_| BackupError::Deadline)??;
        Ok(())
    }
}

#[async_trait]
impl ContainerDriver for DockerDriver {
    async fn pull(&self, image: &str) -> Result<()> {
        let options = CreateImageOptions::<String> {
            from_image: image.to_string(),
            ..Default::default()
        };

        // drain the progress stream, the way a pull is awaited to completion
        let mut stream = self.docker.create_image(Some(options), None, None);
        while (stream.try_next().await?).is_some() {}

        Ok(())
    }

    async fn create(
        &self,
        name: &str,
        image: &str,
        command: &[String],
        temp_directory: &str,
    ) -> Result<String> {
        let config = Config::<String> {
            image: Some(image.to_string()),
            cmd: if command.is_empty() {
                None
            } else {
                Some(command.to_vec())
            },
            env: Some(vec![format!("BACKUP_TARGET_DIR={}", BACKUP_TARGET_DIR)]),
            host_config: Some(HostConfig {
                network_mode: Some("host".to_string()),
                mounts: Some(vec![Mount {
                    typ: Some(MountTypeEnum::BIND),
                    source: Some(temp_directory.to_string()),
                    target: Some(BACKUP_TARGET_DIR.to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.to_string(),
                    platform: None,
                }),
                config,
            )
            .await?;

        Ok(created.id)
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn wait(&self, container_id: &str) -> Result<i64> {
        let mut stream = self
            .docker
            .wait_container(container_id, None::<WaitContainerOptions<String>>);

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // a non-zero exit surfaces as an error carrying the code
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(e.into()),
            None => Err(BackupError::Runtime(
                "wait stream ended without a status".into(),
            )),
        }
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        self.docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }
}

fn parse_client_version(version: &str) -> Result<ClientVersion> {
    if version.is_empty() {
        return Ok(ClientVersion {
            major_version: API_DEFAULT_VERSION.major_version,
            minor_version: API_DEFAULT_VERSION.minor_version,
        });
    }

    let (major, minor) = version
        .split_once('.')
        .ok_or_else(|| BackupError::Config(format!("invalid docker API version '{}'", version)))?;

    Ok(ClientVersion {
        major_version: major
            .parse()
            .map_err(|_| BackupError::Config(format!("invalid docker API version '{}'", version)))?,
        minor_version: minor
            .parse()
            .map_err(|_| BackupError::Config(format!("invalid docker API version '{}'", version)))?,
    })
}

/// Normalizes an image reference to its registry-qualified form: bare names
/// gain `docker.io/library/`, user images `docker.io/`, and `:latest` is
/// appended when neither tag nor digest is present.
pub fn normalize_image(image: &str) -> Result<String> {
    let image = image.trim();
    if image.is_empty() || image.chars().any(|c| c.is_whitespace()) {
        return Err(BackupError::InvalidImageRef(image.to_string()));
    }

    let (rest, digest) = match image.split_once('@') {
        Some((r, d)) if !d.is_empty() => (r.to_string(), Some(d.to_string())),
        Some(_) => return Err(BackupError::InvalidImageRef(image.to_string())),
        None => (image.to_string(), None),
    };

    // a colon after the last slash separates the tag; earlier ones belong to
    // a registry host:port
    let (name, tag) = match rest.rfind(':') {
        Some(colon) if rest.rfind('/').map_or(true, |slash| colon > slash) => (
            rest[..colon].to_string(),
            Some(rest[colon + 1..].to_string()),
        ),
        _ => (rest.clone(), None),
    };

    if let Some(tag) = &tag {
        if tag.is_empty() || !tag.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')) {
            return Err(BackupError::InvalidImageRef(image.to_string()));
        }
    }

    let (domain, remainder) = match name.split_once('/') {
        Some((first, path))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            (first.to_string(), path.to_string())
        }
        Some(_) => ("docker.io".to_string(), name.clone()),
        None => ("docker.io".to_string(), format!("library/{}", name)),
    };

    let valid_name = !remainder.is_empty()
        && remainder.split('/').all(|part| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
        });
    if !valid_name {
        return Err(BackupError::InvalidImageRef(image.to_string()));
    }

    let mut normalized = format!("{}/{}", domain, remainder);
    if let Some(tag) = &tag {
        normalized.push(':');
        normalized.push_str(tag);
    }
    match digest {
        Some(digest) => {
            normalized.push('@');
            normalized.push_str(&digest);
        }
        None if tag.is_none() => normalized.push_str(":latest"),
        None => {}
    }

    Ok(normalized)
}
