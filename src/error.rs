//! Error types shared across the orchestrator.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("storage pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("container runtime error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("container runtime error: {0}")]
    Runtime(String),

    #[error("workspace error: {0}")]
    Workspace(#[source] std::io::Error),

    #[error("packing error: {0}")]
    Packing(#[from] zip::result::ZipError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("deadline exceeded")]
    Deadline,

    #[error("requested storage doesn't exist")]
    MountDoesNotExist,

    #[error("status code is not zero")]
    BadStatus(i64),

    #[error("invalid image reference: {0}")]
    InvalidImageRef(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, BackupError>;
