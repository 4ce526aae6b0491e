use crate::error::BackupError;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::time::Duration;

pub type DbPool = Pool<SqliteConnectionManager>;

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens the backups database. Rule workers persist status transitions
/// concurrently while the metrics endpoint reads, so the database runs in
/// WAL mode with a busy timeout instead of failing fast on a locked file.
/// The pragmas are applied to every pooled connection.
pub fn create_pool(db_path: &str, max_connections: u32) -> Result<DbPool, BackupError> {
    let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )
    });

    let pool = Pool::builder()
        .max_size(max_connections)
        .connection_timeout(CONNECTION_TIMEOUT)
        .build(manager)?;

    Ok(pool)
}

/// Folds the WAL back into the main database file so a clean shutdown
/// leaves a single file behind.
pub fn close_pool(pool: &DbPool) {
    if let Ok(conn) = pool.get() {
        let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE)");
    }
}
