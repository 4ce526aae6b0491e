//! The scheduling core: cron fan-in, per-rule serialization, crash-recovery
//! dispatch and the rotation sweep.
//!
//! Each rule owns a single-slot queue. Cron ticks offer a fresh descriptor
//! without blocking and drop it when the slot is occupied, which yields
//! at-most-one-in-flight per rule with coalescing backpressure. One worker
//! per rule drains its queue strictly serially.

use crate::config::Rule;
use crate::db::repository::BackupRepository;
use crate::models::backup::{Backup, ExecStatus};
use crate::services::backup_service::BackupOps;
use crate::services::rotation::{self, RotationAction};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_cron_scheduler::{Job, JobScheduler};

pub struct BackupManager {
    rules: HashMap<String, Rule>,
    service: Arc<dyn BackupOps>,
    repo: BackupRepository,
    scheduler: JobScheduler,
    senders: HashMap<String, mpsc::Sender<Backup>>,
    receivers: HashMap<String, mpsc::Receiver<Backup>>,
}

impl BackupManager {
    pub async fn new(
        rules: Vec<Rule>,
        service: Arc<dyn BackupOps>,
        repo: BackupRepository,
    ) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await?;

        let mut rules_map = HashMap::new();
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for rule in rules {
            let (tx, rx) = mpsc::channel(1);
            senders.insert(rule.name.clone(), tx);
            receivers.insert(rule.name.clone(), rx);
            rules_map.insert(rule.name.clone(), rule);
        }

        Ok(Self {
            rules: rules_map,
            service,
            repo,
            scheduler,
            senders,
            receivers,
        })
    }

    /// Recovers unfinished backups, registers cron handlers and launches one
    /// worker per rule. Invalid cron specs are fatal.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        let unfinished = self.repo.find_all_unfinished().await?;
        if !unfinished.is_empty() {
            tracing::info!(
                total_unfinished_backups = unfinished.len(),
                "trying to continue managing unfinished backups"
            );
        }
        for backup in unfinished {
            let sender = self.senders.get(&backup.rule).cloned();
            let service = self.service.clone();
            tokio::spawn(enqueue_or_abort(sender, service, backup));
        }

        for (name, rule) in &self.rules {
            let tx = self.senders[name].clone();
            let rule_name = name.clone();
            let job = Job::new_async(rule.cron_spec.as_str(), move |_uuid, _lock| {
                let tx = tx.clone();
                let rule_name = rule_name.clone();
                Box::pin(async move {
                    dispatch(&tx, &rule_name);
                })
            })
            .map_err(|e| {
                anyhow::anyhow!("invalid cron spec '{}' for rule '{}': {}", rule.cron_spec, name, e)
            })?;
            self.scheduler.add(job).await?;
            tracing::info!(rule = %name, spec = %rule.cron_spec, "rule scheduled");
        }

        tracing::debug!("starting cron");
        self.scheduler.start().await?;

        for (name, rule) in &self.rules {
            let rx = self
                .receivers
                .remove(name)
                .ok_or_else(|| anyhow::anyhow!("missing queue for rule '{}'", name))?;
            let worker = RuleWorker {
                rule: rule.clone(),
                service: self.service.clone(),
                repo: self.repo.clone(),
            };
            tokio::spawn(worker.run(rx));
        }

        Ok(())
    }

    pub async fn shutdown(&mut self) -> anyhow::Result<()> {
        self.scheduler.shutdown().await?;
        Ok(())
    }
}

/// Non-blocking offer of a fresh descriptor; a full slot drops the tick.
fn dispatch(tx: &mpsc::Sender<Backup>, rule: &str) {
    let backup = Backup::descriptor(rule, Utc::now());
    match tx.try_send(backup) {
        Ok(()) => tracing::info!(rule, "dispatched new backup"),
        Err(mpsc::error::TrySendError::Full(_)) => {
            tracing::warn!(rule, "unable to dispatch new backup")
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            tracing::warn!(rule, "backup queue closed")
        }
    }
}

/// Routes a recovered record to its rule's queue, or aborts it when the rule
/// has disappeared from the configuration. The awaited send is startup-only
/// behavior: the worker is not draining yet and the slot is expected empty.
async fn enqueue_or_abort(
    sender: Option<mpsc::Sender<Backup>>,
    service: Arc<dyn BackupOps>,
    backup: Backup,
) {
    match sender {
        Some(tx) => {
            tracing::debug!(rule = %backup.rule, backup_id = backup.id, "resuming backup");
            if tx.send(backup).await.is_err() {
                tracing::warn!("backup queue closed while resuming");
            }
        }
        None => {
            tracing::warn!(
                rule = %backup.rule,
                backup_id = backup.id,
                container_id = %backup.container_id,
                "aborting backup due to rule became unavailable"
            );
            if let Err(e) = service.abort(backup).await {
                tracing::error!(error = %e, "unable to abort backup");
            }
        }
    }
}

/// Deadline of `created_at + timeout`; for resumed jobs the time already
/// spent counts against the budget.
fn job_deadline(created_at: DateTime<Utc>, timeout: Duration) -> Instant {
    let elapsed = Utc::now()
        .signed_duration_since(created_at)
        .to_std()
        .unwrap_or(Duration::ZERO);
    Instant::now() + timeout.saturating_sub(elapsed)
}

struct RuleWorker {
    rule: Rule,
    service: Arc<dyn BackupOps>,
    repo: BackupRepository,
}

impl RuleWorker {
    async fn run(self, mut rx: mpsc::Receiver<Backup>) {
        tracing::debug!(rule = %self.rule.name, spec = %self.rule.cron_spec, "starting rule handler");
        while let Some(backup) = rx.recv().await {
            self.handle(backup).await;
        }
    }

    async fn handle(&self, backup: Backup) {
        tracing::info!(rule = %self.rule.name, "handling new backup task");

        let started = if backup.exec_status == ExecStatus::New {
            tracing::info!(rule = %self.rule.name, "starting new backup");
            match self
                .service
                .start(&self.rule, Instant::now() + self.rule.timeout)
                .await
            {
                Ok(backup) => Some(backup),
                Err(e) => {
                    tracing::error!(rule = %self.rule.name, error = %e, "unable to start backup");
                    None
                }
            }
        } else {
            Some(backup)
        };

        if let Some(backup) = started {
            let deadline = job_deadline(backup.created_at, self.rule.timeout);
            tracing::info!(
                rule = %self.rule.name,
                backup_id = backup.id,
                container_id = %backup.container_id,
                "awaiting backup to finish"
            );
            match self.service.finish(backup, deadline).await {
                Ok(backup) => tracing::info!(
                    rule = %self.rule.name,
                    backup_id = backup.id,
                    status_code = backup.status_code,
                    "backup finished"
                ),
                Err(e) => {
                    tracing::error!(rule = %self.rule.name, error = %e, "unable to finish backup")
                }
            }
        }

        self.sweep().await;
    }

    async fn sweep(&self) {
        let tiers = self.rule.rotation_tiers();
        if tiers.is_empty() {
            return;
        }

        tracing::info!(rule = %self.rule.name, "sweeping old backups");

        let backups = match self
            .repo
            .find_all_successful_not_deleted(&self.rule.name)
            .await
        {
            Ok(backups) => backups,
            Err(e) => {
                tracing::error!(rule = %self.rule.name, error = %e, "unable to query old backups");
                return;
            }
        };

        let buckets = rotation::bucketize(backups, tiers.len());
        for action in rotation::plan(buckets, &tiers) {
            match action {
                RotationAction::Promote(backup) => {
                    tracing::info!(
                        rule = %self.rule.name,
                        backup_id = backup.id,
                        generation = backup.generation,
                        "promoting backup"
                    );
                    if let Err(e) = self.repo.update(backup).await {
                        tracing::error!(rule = %self.rule.name, error = %e, "unable to promote backup");
                    }
                }
                RotationAction::Discard(backup) => {
                    tracing::info!(
                        rule = %self.rule.name,
                        backup_id = backup.id,
                        generation = backup.generation,
                        "deleting backup"
                    );
                    if let Err(e) = self.service.delete(backup).await {
                        tracing::error!(rule = %self.rule.name, error = %e, "unable to delete backup");
                    }
                }
            }
        }
    }
}
