use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, Row};
use serde::Serialize;

/// Execution status of one backup attempt.
///
/// `New` is a freshly dispatched descriptor, `Created` a persisted record
/// whose dumper container is not running yet, `Started` a record with a live
/// container. `Failure` and `Success` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecStatus {
    New,
    Created,
    Started,
    Failure,
    Success,
}

impl ExecStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecStatus::New => "new",
            ExecStatus::Created => "created",
            ExecStatus::Started => "started",
            ExecStatus::Failure => "failure",
            ExecStatus::Success => "success",
        }
    }

    fn from_str(value: &str) -> Option<Self> {
        match value {
            "new" => Some(ExecStatus::New),
            "created" => Some(ExecStatus::Created),
            "started" => Some(ExecStatus::Started),
            "failure" => Some(ExecStatus::Failure),
            "success" => Some(ExecStatus::Success),
            _ => None,
        }
    }

    pub fn is_unfinished(&self) -> bool {
        matches!(self, ExecStatus::New | ExecStatus::Created | ExecStatus::Started)
    }
}

impl ToSql for ExecStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ExecStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        ExecStatus::from_str(text).ok_or(FromSqlError::InvalidType)
    }
}

/// One backup attempt: the unit of work and the unit of persistence.
#[derive(Debug, Clone, Serialize)]
pub struct Backup {
    pub id: i64,
    pub rule: String,
    /// Container handle assigned by the runtime; empty until create.
    pub container_id: String,
    /// Scratch directory bind-mounted into the dumper container.
    pub temp_directory: String,
    /// Packed archive inside the scratch directory.
    pub temp_backup_file: String,
    /// Destination locator returned by the transport.
    pub backup_file: String,
    pub storage_name: String,
    pub exec_status: ExecStatus,
    /// Container exit code; meaningful only after the wait step.
    pub status_code: i64,
    pub backup_size: i64,
    pub generation: i64,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Backup {
    /// Fresh job descriptor for a rule, as enqueued by a cron tick.
    pub fn descriptor(rule: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            rule: rule.to_string(),
            container_id: String::new(),
            temp_directory: String::new(),
            temp_backup_file: String::new(),
            backup_file: String::new(),
            storage_name: String::new(),
            exec_status: ExecStatus::New,
            status_code: 0,
            backup_size: 0,
            generation: 0,
            created_at,
            finished_at: None,
            deleted_at: None,
        }
    }
}

fn row_to_backup(row: &Row) -> rusqlite::Result<Backup> {
    Ok(Backup {
        id: row.get("id")?,
        rule: row.get("rule")?,
        container_id: row.get("container_id")?,
        temp_directory: row.get("temp_directory")?,
        temp_backup_file: row.get("temp_backup_file")?,
        backup_file: row.get("backup_file")?,
        storage_name: row.get("storage_name")?,
        exec_status: row.get("exec_status")?,
        status_code: row.get("status_code")?,
        backup_size: row.get("backup_size")?,
        generation: row.get("generation")?,
        created_at: row.get("created_at")?,
        finished_at: row.get("finished_at")?,
        deleted_at: row.get("deleted_at")?,
    })
}

pub fn create(conn: &Connection, backup: &Backup) -> rusqlite::Result<Backup> {
    conn.execute(
        "INSERT INTO backups (
            rule, container_id,
            temp_directory, temp_backup_file, backup_file, storage_name,
            exec_status, status_code, backup_size, generation,
            created_at, finished_at, deleted_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            backup.rule,
            backup.container_id,
            backup.temp_directory,
            backup.temp_backup_file,
            backup.backup_file,
            backup.storage_name,
            backup.exec_status,
            backup.status_code,
            backup.backup_size,
            backup.generation,
            backup.created_at,
            backup.finished_at,
            backup.deleted_at,
        ],
    )?;

    let mut created = backup.clone();
    created.id = conn.last_insert_rowid();
    Ok(created)
}

/// Full-row update by id; fields are overwritten verbatim.
pub fn update(conn: &Connection, backup: &Backup) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE backups SET
            rule = ?1, container_id = ?2,
            temp_directory = ?3, temp_backup_file = ?4, backup_file = ?5, storage_name = ?6,
            exec_status = ?7, status_code = ?8, backup_size = ?9, generation = ?10,
            created_at = ?11, finished_at = ?12, deleted_at = ?13
         WHERE id = ?14",
        params![
            backup.rule,
            backup.container_id,
            backup.temp_directory,
            backup.temp_backup_file,
            backup.backup_file,
            backup.storage_name,
            backup.exec_status,
            backup.status_code,
            backup.backup_size,
            backup.generation,
            backup.created_at,
            backup.finished_at,
            backup.deleted_at,
            backup.id,
        ],
    )?;
    Ok(())
}

pub fn find_all_unfinished(conn: &Connection) -> rusqlite::Result<Vec<Backup>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM backups
         WHERE exec_status IN ('new', 'created', 'started')
         ORDER BY id ASC",
    )?;
    let rows = stmt.query_map([], row_to_backup)?;
    rows.collect()
}

/// Ascending `created_at` order is load-bearing: the rotation sweep evicts
/// from the oldest end of each generation bucket.
pub fn find_all_successful_not_deleted(conn: &Connection, rule: &str) -> rusqlite::Result<Vec<Backup>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM backups
         WHERE rule = ?1
           AND exec_status = 'success'
           AND deleted_at IS NULL
         ORDER BY created_at ASC",
    )?;
    let rows = stmt.query_map(params![rule], row_to_backup)?;
    rows.collect()
}

/// Per rule, the most recent finished (success or failure) undeleted record.
pub fn find_last_successful(conn: &Connection) -> rusqlite::Result<Vec<Backup>> {
    let mut stmt = conn.prepare(
        "SELECT b.* FROM backups b
         INNER JOIN (
            SELECT rule, MAX(id) AS max_id
            FROM backups
            WHERE exec_status IN ('failure', 'success')
            GROUP BY rule
         ) bb ON b.id = bb.max_id
         WHERE b.deleted_at IS NULL
         ORDER BY b.rule ASC",
    )?;
    let rows = stmt.query_map([], row_to_backup)?;
    rows.collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(crate::db::migrate::SCHEMA).unwrap();
        conn
    }

    fn backup_at(rule: &str, ts: &str, status: ExecStatus) -> Backup {
        let mut b = Backup::descriptor(rule, ts.parse().unwrap());
        b.exec_status = status;
        if !status.is_unfinished() {
            b.finished_at = Some(b.created_at + chrono::Duration::seconds(5));
        }
        b
    }

    #[test]
    fn create_assigns_monotonic_ids() {
        let conn = test_conn();

        let a = create(&conn, &backup_at("db", "2024-01-01T00:00:00Z", ExecStatus::Created)).unwrap();
        let b = create(&conn, &backup_at("db", "2024-01-01T01:00:00Z", ExecStatus::Created)).unwrap();

        assert!(a.id > 0);
        assert!(b.id > a.id);
    }

    #[test]
    fn update_overwrites_fields() {
        let conn = test_conn();

        let mut b = create(&conn, &backup_at("db", "2024-01-01T00:00:00Z", ExecStatus::Created)).unwrap();
        b.exec_status = ExecStatus::Started;
        b.container_id = "c1".into();
        update(&conn, &b).unwrap();

        let unfinished = find_all_unfinished(&conn).unwrap();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].exec_status, ExecStatus::Started);
        assert_eq!(unfinished[0].container_id, "c1");
    }

    #[test]
    fn unfinished_excludes_terminal_statuses() {
        let conn = test_conn();

        create(&conn, &backup_at("a", "2024-01-01T00:00:00Z", ExecStatus::Created)).unwrap();
        create(&conn, &backup_at("a", "2024-01-01T01:00:00Z", ExecStatus::Started)).unwrap();
        create(&conn, &backup_at("a", "2024-01-01T02:00:00Z", ExecStatus::Failure)).unwrap();
        create(&conn, &backup_at("a", "2024-01-01T03:00:00Z", ExecStatus::Success)).unwrap();

        let unfinished = find_all_unfinished(&conn).unwrap();
        assert_eq!(unfinished.len(), 2);
        assert!(unfinished.iter().all(|b| b.exec_status.is_unfinished()));
    }

    #[test]
    fn successful_not_deleted_is_ordered_ascending() {
        let conn = test_conn();

        // inserted out of order on purpose
        create(&conn, &backup_at("db", "2024-01-03T00:00:00Z", ExecStatus::Success)).unwrap();
        create(&conn, &backup_at("db", "2024-01-01T00:00:00Z", ExecStatus::Success)).unwrap();
        create(&conn, &backup_at("db", "2024-01-02T00:00:00Z", ExecStatus::Success)).unwrap();
        create(&conn, &backup_at("other", "2024-01-04T00:00:00Z", ExecStatus::Success)).unwrap();

        let mut deleted = backup_at("db", "2024-01-05T00:00:00Z", ExecStatus::Success);
        deleted.deleted_at = Some(Utc.with_ymd_and_hms(2024, 1, 6, 0, 0, 0).unwrap());
        create(&conn, &deleted).unwrap();

        let found = find_all_successful_not_deleted(&conn, "db").unwrap();
        let stamps: Vec<_> = found.iter().map(|b| b.created_at.to_rfc3339()).collect();
        assert_eq!(
            stamps,
            vec![
                "2024-01-01T00:00:00+00:00",
                "2024-01-02T00:00:00+00:00",
                "2024-01-03T00:00:00+00:00",
            ]
        );
    }

    #[test]
    fn last_successful_picks_latest_finished_per_rule() {
        let conn = test_conn();

        create(&conn, &backup_at("a", "2024-01-01T00:00:00Z", ExecStatus::Success)).unwrap();
        create(&conn, &backup_at("a", "2024-01-02T00:00:00Z", ExecStatus::Failure)).unwrap();
        create(&conn, &backup_at("b", "2024-01-01T00:00:00Z", ExecStatus::Success)).unwrap();
        create(&conn, &backup_at("b", "2024-01-02T00:00:00Z", ExecStatus::Started)).unwrap();

        let latest = find_last_successful(&conn).unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].rule, "a");
        assert_eq!(latest[0].exec_status, ExecStatus::Failure);
        assert_eq!(latest[1].rule, "b");
        assert_eq!(latest[1].exec_status, ExecStatus::Success);
    }
}
