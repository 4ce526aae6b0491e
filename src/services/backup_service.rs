//! The per-job state machine: Start, Finish, Abort and Delete over one
//! backup record.
//!
//! Every failure after the record has been persisted marks it `Failure`
//! with `finished_at` stamped before the error is returned; the manager
//! logs the error and moves on to the rotation sweep.

use crate::config::Rule;
use crate::db::repository::BackupRepository;
use crate::docker::{normalize_image, ContainerDriver};
use crate::error::{BackupError, Result};
use crate::models::backup::{Backup, ExecStatus};
use crate::services::archive;
use crate::services::workspace::WorkspaceManager;
use crate::transfer::TransferRegistry;
use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const MAX_ERRORS_WHILE_FINISHING: usize = 100;
const REMOVE_TIMEOUT: Duration = Duration::from_secs(10);

pub const BACKUP_ARCHIVE_NAME: &str = "__backup__.zip";

/// State-machine operations the manager drives a job through.
#[async_trait]
pub trait BackupOps: Send + Sync {
    async fn start(&self, rule: &Rule, deadline: Instant) -> Result<Backup>;
    async fn finish(&self, backup: Backup, deadline: Instant) -> Result<Backup>;
    async fn abort(&self, backup: Backup) -> Result<()>;
    async fn delete(&self, backup: Backup) -> Result<()>;
}

pub struct BackupService {
    repo: BackupRepository,
    driver: Arc<dyn ContainerDriver>,
    workspace: WorkspaceManager,
    transfers: Arc<TransferRegistry>,
}

impl BackupService {
    pub fn new(
        repo: BackupRepository,
        driver: Arc<dyn ContainerDriver>,
        workspace: WorkspaceManager,
        transfers: Arc<TransferRegistry>,
    ) -> Self {
        Self {
            repo,
            driver,
            workspace,
            transfers,
        }
    }

    fn container_name(backup: &Backup) -> String {
        format!("backup-{}-{}", backup.rule, backup.id)
    }

    async fn start_inner(&self, backup: &mut Backup, rule: &Rule) -> Result<()> {
        let image = normalize_image(&rule.image)?;

        self.driver.pull(&image).await?;

        let dir = self.workspace.allocate()?;
        backup.temp_directory = dir.to_string_lossy().into_owned();

        // the Created row must exist before the container does
        *backup = self.repo.create(backup.clone()).await?;

        let name = Self::container_name(backup);
        let container_id = self
            .driver
            .create(&name, &image, &rule.command, &backup.temp_directory)
            .await?;

        self.driver.start(&container_id).await?;

        backup.exec_status = ExecStatus::Started;
        backup.container_id = container_id;
        self.repo.update(backup.clone()).await?;

        Ok(())
    }

    async fn finish_inner(&self, backup: &mut Backup, deadline: Instant) -> Result<()> {
        let mut error_counter = 0;
        let status = loop {
            match tokio::time::timeout_at(deadline, self.driver.wait(&backup.container_id)).await {
                Ok(Ok(code)) => break code,
                Err(_) => {
                    self.mark_finished_and_deallocate(backup, ExecStatus::Failure)
                        .await;
                    return Err(BackupError::Deadline);
                }
                Ok(Err(e)) => {
                    error_counter += 1;
                    if error_counter > MAX_ERRORS_WHILE_FINISHING {
                        tracing::warn!(
                            backup_id = backup.id,
                            container_id = %backup.container_id,
                            error = %e,
                            "container wait kept failing, proceeding with last observed status"
                        );
                        break 0;
                    }
                }
            }
        };

        backup.status_code = status;

        if status != 0 {
            self.mark_finished_and_deallocate(backup, ExecStatus::Failure)
                .await;
            return Err(BackupError::BadStatus(status));
        }

        let temp_backup_file = Path::new(&backup.temp_directory).join(BACKUP_ARCHIVE_NAME);
        let outfile = temp_backup_file.clone();
        let dir = PathBuf::from(&backup.temp_directory);
        let packed = tokio::task::spawn_blocking(move || archive::pack(&outfile, &dir)).await?;
        if let Err(e) = packed {
            self.mark_finished_and_deallocate(backup, ExecStatus::Failure)
                .await;
            return Err(e);
        }
        backup.temp_backup_file = temp_backup_file.to_string_lossy().into_owned();

        match std::fs::metadata(&temp_backup_file) {
            Ok(meta) => backup.backup_size = meta.len() as i64,
            Err(e) => tracing::warn!(
                backup_id = backup.id,
                error = %e,
                "unable to calculate backup size in spite of it has finished successfully"
            ),
        }

        match self.transfers.transfer(backup).await {
            Ok(backup_file) => backup.backup_file = backup_file,
            Err(e) => {
                self.mark_finished_and_deallocate(backup, ExecStatus::Failure)
                    .await;
                return Err(e);
            }
        }

        self.mark_finished_and_deallocate(backup, ExecStatus::Success)
            .await;
        Ok(())
    }

    /// Marks the record failed when it has already been persisted; a record
    /// that never reached the repository has nothing to mark.
    async fn mark_start_failed(&self, backup: &mut Backup) {
        if backup.id == 0 {
            return;
        }

        backup.exec_status = ExecStatus::Failure;
        backup.finished_at = Some(Utc::now());

        if let Err(e) = self.repo.update(backup.clone()).await {
            tracing::error!(backup_id = backup.id, error = %e, "unable to mark backup failed");
        }
    }

    async fn mark_finished_and_deallocate(&self, backup: &mut Backup, status: ExecStatus) {
        backup.exec_status = status;
        backup.finished_at = Some(Utc::now());

        if let Err(e) = self.repo.update(backup.clone()).await {
            tracing::error!(backup_id = backup.id, error = %e, "unable to persist backup status");
        }

        if backup.temp_directory.is_empty() {
            return;
        }
        let workspace = self.workspace.clone();
        let dir = PathBuf::from(&backup.temp_directory);
        let released = tokio::task::spawn_blocking(move || workspace.deallocate(&dir)).await;
        match released {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(backup_id = backup.id, error = %e, "unable to release scratch directory")
            }
            Err(e) => {
                tracing::error!(backup_id = backup.id, error = %e, "scratch release task failed")
            }
        }
    }

    /// Container removal runs under its own bound so cleanup proceeds even
    /// after the job deadline has expired.
    async fn remove_container(&self, backup: &Backup) {
        if backup.container_id.is_empty() {
            return;
        }

        let removed = match tokio::time::timeout(
            REMOVE_TIMEOUT,
            self.driver.remove(&backup.container_id),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(BackupError::Deadline),
        };

        if let Err(e) = removed {
            tracing::error!(
                backup_id = backup.id,
                container_id = %backup.container_id,
                error = %e,
                "unable to remove container"
            );
        }
    }
}

#[async_trait]
impl BackupOps for BackupService {
    async fn start(&self, rule: &Rule, deadline: Instant) -> Result<Backup> {
        let mut backup = Backup::descriptor(&rule.name, Utc::now());
        backup.exec_status = ExecStatus::Created;
        backup.storage_name = rule.storage_name.clone();

        match tokio::time::timeout_at(deadline, self.start_inner(&mut backup, rule)).await {
            Ok(Ok(())) => Ok(backup),
            Ok(Err(e)) => {
                self.mark_start_failed(&mut backup).await;
                Err(e)
            }
            Err(_) => {
                self.mark_start_failed(&mut backup).await;
                Err(BackupError::Deadline)
            }
        }
    }

    async fn finish(&self, mut backup: Backup, deadline: Instant) -> Result<Backup> {
        let result = self.finish_inner(&mut backup, deadline).await;
        self.remove_container(&backup).await;
        result.map(|()| backup)
    }

    async fn abort(&self, mut backup: Backup) -> Result<()> {
        self.remove_container(&backup).await;
        self.mark_finished_and_deallocate(&mut backup, ExecStatus::Failure)
            .await;
        Ok(())
    }

    async fn delete(&self, mut backup: Backup) -> Result<()> {
        if backup.deleted_at.is_some() {
            tracing::debug!(backup_id = backup.id, "backup already deleted");
            return Ok(());
        }

        self.transfers.remove(&backup).await?;

        backup.deleted_at = Some(Utc::now());
        self.repo.update(backup).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RotationRule;
    use crate::db::connection::create_pool;
    use crate::db::migrate;
    use crate::transfer::local::LocalMount;
    use crate::transfer::Transport;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockDriver {
        pulls: AtomicUsize,
        creates: Mutex<Vec<String>>,
        starts: AtomicUsize,
        removes: AtomicUsize,
        wait_result: Mutex<Option<i64>>,
        fail_create: bool,
        hang_wait: bool,
    }

    #[async_trait]
    impl ContainerDriver for MockDriver {
        async fn pull(&self, _image: &str) -> Result<()> {
            self.pulls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn create(
            &self,
            name: &str,
            _image: &str,
            _command: &[String],
            _temp_directory: &str,
        ) -> Result<String> {
            if self.fail_create {
                return Err(BackupError::Runtime("create failed".into()));
            }
            self.creates.lock().unwrap().push(name.to_string());
            Ok(format!("container-for-{}", name))
        }

        async fn start(&self, _container_id: &str) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn wait(&self, _container_id: &str) -> Result<i64> {
            if self.hang_wait {
                std::future::pending::<()>().await;
            }
            Ok(self.wait_result.lock().unwrap().unwrap_or(0))
        }

        async fn remove(&self, _container_id: &str) -> Result<()> {
            self.removes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fixture {
        service: BackupService,
        repo: BackupRepository,
        driver: Arc<MockDriver>,
        scratch_base: tempfile::TempDir,
        storage_root: tempfile::TempDir,
        _db_dir: tempfile::TempDir,
    }

    fn fixture(driver: MockDriver) -> Fixture {
        let db_dir = tempfile::tempdir().unwrap();
        let pool = create_pool(db_dir.path().join("test.db").to_str().unwrap(), 4).unwrap();
        migrate::migrate(&pool).unwrap();
        let repo = BackupRepository::new(pool);

        let scratch_base = tempfile::tempdir().unwrap();
        let storage_root = tempfile::tempdir().unwrap();

        let mut mounts: HashMap<String, Box<dyn Transport>> = HashMap::new();
        mounts.insert(
            "primary".to_string(),
            Box::new(LocalMount::new(storage_root.path(), false)),
        );

        let driver = Arc::new(driver);
        let service = BackupService::new(
            repo.clone(),
            driver.clone(),
            WorkspaceManager::new(scratch_base.path()),
            Arc::new(TransferRegistry::with_mounts(mounts)),
        );

        Fixture {
            service,
            repo,
            driver,
            scratch_base,
            storage_root,
            _db_dir: db_dir,
        }
    }

    fn rule() -> Rule {
        Rule {
            name: "db".into(),
            image: "dumper".into(),
            command: vec!["dump".into()],
            timeout: Duration::from_secs(60),
            cron_spec: "* * * * * *".into(),
            storage_name: "primary".into(),
            rotation_rules: vec![RotationRule {
                period: Duration::ZERO,
                preserve_at_most: 3,
            }],
            preserve_at_most: 0,
        }
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[tokio::test]
    async fn start_creates_and_starts_container() {
        let f = fixture(MockDriver::default());

        let backup = f.service.start(&rule(), far_deadline()).await.unwrap();

        assert_eq!(backup.exec_status, ExecStatus::Started);
        assert_eq!(backup.container_id, "container-for-backup-db-1");
        assert!(Path::new(&backup.temp_directory).is_dir());
        assert_eq!(f.driver.pulls.load(Ordering::SeqCst), 1);
        assert_eq!(f.driver.starts.load(Ordering::SeqCst), 1);
        assert_eq!(
            f.driver.creates.lock().unwrap().as_slice(),
            ["backup-db-1".to_string()]
        );

        let unfinished = f.repo.find_all_unfinished().await.unwrap();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].exec_status, ExecStatus::Started);
    }

    #[tokio::test]
    async fn start_failure_after_persist_marks_record_failed() {
        let f = fixture(MockDriver {
            fail_create: true,
            ..MockDriver::default()
        });

        let err = f.service.start(&rule(), far_deadline()).await.unwrap_err();
        assert!(matches!(err, BackupError::Runtime(_)));

        // record persisted as Created, then flipped to Failure with finished_at
        assert!(f.repo.find_all_unfinished().await.unwrap().is_empty());
        let latest = f.repo.find_last_successful().await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].exec_status, ExecStatus::Failure);
        assert!(latest[0].finished_at.is_some());
    }

    #[tokio::test]
    async fn start_failure_on_bad_image_leaves_no_record() {
        let f = fixture(MockDriver::default());
        let mut bad_rule = rule();
        bad_rule.image = "two words".into();

        let err = f.service.start(&bad_rule, far_deadline()).await.unwrap_err();
        assert!(matches!(err, BackupError::InvalidImageRef(_)));

        assert!(f.repo.find_all_unfinished().await.unwrap().is_empty());
        assert!(f.repo.find_last_successful().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn finish_packs_transfers_and_succeeds() {
        let f = fixture(MockDriver::default());

        let backup = f.service.start(&rule(), far_deadline()).await.unwrap();
        std::fs::write(Path::new(&backup.temp_directory).join("dump.sql"), b"data").unwrap();

        let finished = f.service.finish(backup, far_deadline()).await.unwrap();

        assert_eq!(finished.exec_status, ExecStatus::Success);
        assert_eq!(finished.status_code, 0);
        assert!(finished.backup_size > 0);
        assert!(finished.finished_at.is_some());
        assert!(finished.backup_file.starts_with(f.storage_root.path().to_str().unwrap()));
        assert!(Path::new(&finished.backup_file).join("dump.sql").is_file());
        assert!(Path::new(&finished.backup_file).join(BACKUP_ARCHIVE_NAME).is_file());

        // scratch released, container removed
        assert!(!Path::new(&finished.temp_directory).exists());
        assert_eq!(f.driver.removes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn finish_with_nonzero_exit_fails() {
        let f = fixture(MockDriver::default());

        let backup = f.service.start(&rule(), far_deadline()).await.unwrap();
        *f.driver.wait_result.lock().unwrap() = Some(2);

        let err = f.service.finish(backup, far_deadline()).await.unwrap_err();
        assert!(matches!(err, BackupError::BadStatus(2)));

        let latest = f.repo.find_last_successful().await.unwrap();
        assert_eq!(latest[0].exec_status, ExecStatus::Failure);
        assert_eq!(latest[0].status_code, 2);
        assert_eq!(f.driver.removes.load(Ordering::SeqCst), 1);
        // scratch released on failure too
        assert!(std::fs::read_dir(f.scratch_base.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn finish_past_deadline_fails_with_deadline() {
        let f = fixture(MockDriver {
            hang_wait: true,
            ..MockDriver::default()
        });

        let backup = f.service.start(&rule(), far_deadline()).await.unwrap();

        let deadline = Instant::now() + Duration::from_millis(50);
        let err = f.service.finish(backup, deadline).await.unwrap_err();
        assert!(matches!(err, BackupError::Deadline));

        let latest = f.repo.find_last_successful().await.unwrap();
        assert_eq!(latest[0].exec_status, ExecStatus::Failure);
        assert_eq!(f.driver.removes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn finish_with_unregistered_storage_fails() {
        let f = fixture(MockDriver::default());

        let mut bad_rule = rule();
        bad_rule.storage_name = "nowhere".into();
        let backup = f.service.start(&bad_rule, far_deadline()).await.unwrap();

        let err = f.service.finish(backup, far_deadline()).await.unwrap_err();
        assert!(matches!(err, BackupError::MountDoesNotExist));

        let latest = f.repo.find_last_successful().await.unwrap();
        assert_eq!(latest[0].exec_status, ExecStatus::Failure);
    }

    #[tokio::test]
    async fn abort_marks_failure_and_cleans_up() {
        let f = fixture(MockDriver::default());

        let backup = f.service.start(&rule(), far_deadline()).await.unwrap();
        let temp_directory = backup.temp_directory.clone();

        f.service.abort(backup).await.unwrap();

        assert!(f.repo.find_all_unfinished().await.unwrap().is_empty());
        assert!(!Path::new(&temp_directory).exists());
        assert_eq!(f.driver.removes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn delete_stamps_deleted_at_exactly_once() {
        let f = fixture(MockDriver::default());

        let backup = f.service.start(&rule(), far_deadline()).await.unwrap();
        std::fs::write(Path::new(&backup.temp_directory).join("dump.sql"), b"data").unwrap();
        let finished = f.service.finish(backup, far_deadline()).await.unwrap();

        f.service.delete(finished.clone()).await.unwrap();
        assert!(!Path::new(&finished.backup_file).exists());

        let rows = f.repo.find_last_successful().await.unwrap();
        assert!(rows.is_empty(), "deleted record should drop out of the metric query");

        // second delete on the already-stamped record is a no-op
        let mut stamped = finished;
        stamped.deleted_at = Some(Utc::now());
        f.service.delete(stamped).await.unwrap();
    }
}
