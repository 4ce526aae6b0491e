use crate::db::connection::DbPool;
use crate::error::BackupError;
use rusqlite::Connection;

pub(crate) const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS backups (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  rule TEXT NOT NULL,
  container_id TEXT NOT NULL DEFAULT '',
  temp_directory TEXT NOT NULL DEFAULT '',
  temp_backup_file TEXT NOT NULL DEFAULT '',
  backup_file TEXT NOT NULL DEFAULT '',
  storage_name TEXT NOT NULL DEFAULT '',
  exec_status TEXT NOT NULL DEFAULT 'new' CHECK(exec_status IN ('new','created','started','failure','success')),
  status_code INTEGER NOT NULL DEFAULT 0,
  backup_size INTEGER NOT NULL DEFAULT 0,
  generation INTEGER NOT NULL DEFAULT 0,
  created_at TEXT NOT NULL,
  finished_at TEXT,
  deleted_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_backups_rule_status ON backups(rule, exec_status);
CREATE INDEX IF NOT EXISTS idx_backups_created_at ON backups(created_at);
"#;

pub fn migrate(pool: &DbPool) -> Result<(), BackupError> {
    tracing::info!("starting database migration");

    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;

    // Idempotent migrations for databases created before generational rotation
    if !has_column(&conn, "backups", "generation")? {
        conn.execute_batch("ALTER TABLE backups ADD COLUMN generation INTEGER NOT NULL DEFAULT 0")?;
    }

    tracing::info!("database migration completed");
    Ok(())
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool, BackupError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(columns.iter().any(|c| c == column))
}
