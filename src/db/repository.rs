//! Async facade over the blocking sqlite layer.
//!
//! Every call clones the pool handle and runs the query on the blocking
//! thread pool; each status transition is flushed before the caller takes
//! the next dependent side effect.

use crate::db::connection::DbPool;
use crate::error::{BackupError, Result};
use crate::models::backup::{self, Backup};

#[derive(Clone)]
pub struct BackupRepository {
    pool: DbPool,
}

impl BackupRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, backup: Backup) -> Result<Backup> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            Ok::<_, BackupError>(backup::create(&conn, &backup)?)
        })
        .await?
    }

    pub async fn update(&self, backup: Backup) -> Result<()> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            Ok::<_, BackupError>(backup::update(&conn, &backup)?)
        })
        .await?
    }

    pub async fn find_all_unfinished(&self) -> Result<Vec<Backup>> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            Ok::<_, BackupError>(backup::find_all_unfinished(&conn)?)
        })
        .await?
    }

    pub async fn find_all_successful_not_deleted(&self, rule: &str) -> Result<Vec<Backup>> {
        let pool = self.pool.clone();
        let rule = rule.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            Ok::<_, BackupError>(backup::find_all_successful_not_deleted(&conn, &rule)?)
        })
        .await?
    }

    pub async fn find_last_successful(&self) -> Result<Vec<Backup>> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            Ok::<_, BackupError>(backup::find_last_successful(&conn)?)
        })
        .await?
    }
}
