use crate::config::AppConfig;
use crate::db::repository::BackupRepository;

pub struct AppState {
    pub repo: BackupRepository,
    pub config: AppConfig,
}

impl AppState {
    pub fn new(repo: BackupRepository, config: AppConfig) -> Self {
        Self { repo, config }
    }
}
