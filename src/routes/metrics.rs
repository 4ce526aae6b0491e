//! Read-only snapshot of the latest finished backup per rule.

use crate::state::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
pub struct BackupMetric {
    pub rule_name: String,
    pub backup_size: i64,
    pub last_successful_at: DateTime<Utc>,
    pub last_completion_nano_time: i64,
}

pub async fn latest_backups(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<BackupMetric>>, StatusCode> {
    let backups = tokio::time::timeout(QUERY_TIMEOUT, state.repo.find_last_successful())
        .await
        .map_err(|_| {
            tracing::error!("last successful backups query timed out");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|e| {
            tracing::error!(error = %e, "unable to query last successful backups");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    let result = backups
        .into_iter()
        .map(|backup| BackupMetric {
            rule_name: backup.rule,
            backup_size: backup.backup_size,
            last_successful_at: backup.created_at,
            last_completion_nano_time: backup
                .finished_at
                .and_then(|finished_at| {
                    finished_at
                        .signed_duration_since(backup.created_at)
                        .num_nanoseconds()
                })
                .unwrap_or(0),
        })
        .collect();

    Ok(Json(result))
}
