use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params_from_iter, Connection, ErrorCode, OpenFlags};
use serde::{Deserialize, Serialize};
use study_integrity_core::{RawTaskEvent, StudyVariant};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SourceOptions {
    pub busy_timeout: Duration,
    /// Total fetch attempts when the database reports busy or locked.
    pub max_attempts: u32,
    pub retry_backoff: Duration,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_millis(5_000),
            max_attempts: 3,
            retry_backoff: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct TaskLogQuery {
    pub study_extension: Option<String>,
    pub min_participant_id: Option<i64>,
    /// Keep participants flagged as test accounts or admins.
    pub include_test_accounts: bool,
}

impl TaskLogQuery {
    /// Filters the research team used when exporting each study's task log.
    #[must_use]
    pub fn for_variant(variant: StudyVariant) -> Self {
        match variant {
            StudyVariant::Tet | StudyVariant::Gidi => Self {
                study_extension: Some(variant.as_str().to_string()),
                min_participant_id: Some(2_010),
                include_test_accounts: false,
            },
            // The Kaiser database has no study extensions or test flags.
            StudyVariant::Kaiser => Self {
                study_extension: None,
                min_participant_id: Some(34),
                include_test_accounts: true,
            },
            StudyVariant::Spanish => Self {
                study_extension: Some(variant.as_str().to_string()),
                min_participant_id: None,
                include_test_accounts: false,
            },
        }
    }

    fn to_sql(&self) -> (String, Vec<Value>) {
        let participant_filter = if self.include_test_accounts {
            ""
        } else {
            " WHERE test_account = 0 AND admin = 0"
        };
        let mut sql = format!(
            "SELECT A.study_id, B.participant_id, A.date_completed, A.session_name, A.tag,
                    A.task_name
             FROM task_log A
             LEFT JOIN (
               SELECT id AS participant_id, study_id FROM participant{participant_filter}
             ) B ON A.study_id = B.study_id"
        );
        let mut conditions = Vec::new();
        let mut params = Vec::new();

        if let Some(extension) = &self.study_extension {
            sql.push_str("\n             LEFT JOIN study C ON A.study_id = C.id");
            params.push(Value::Text(extension.clone()));
            conditions.push(format!("C.study_extension = ?{}", params.len()));
        }
        if let Some(min_participant_id) = self.min_participant_id {
            params.push(Value::Integer(min_participant_id));
            conditions.push(format!("B.participant_id >= ?{}", params.len()));
        }
        if !conditions.is_empty() {
            sql.push_str("\n             WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str("\n             ORDER BY A.id ASC");
        (sql, params)
    }
}

#[derive(Debug)]
pub struct SqliteEventSource {
    conn: Connection,
    options: SourceOptions,
}

impl SqliteEventSource {
    /// # Errors
    /// Returns an error when the database cannot be opened or configured.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with(path, SourceOptions::default())
    }

    /// # Errors
    /// Returns an error when the database cannot be opened or configured.
    pub fn open_with(path: &Path, options: SourceOptions) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        let busy_timeout_ms = options.busy_timeout.as_millis();
        conn.execute_batch(&format!(
            "PRAGMA busy_timeout = {busy_timeout_ms};
             PRAGMA query_only = ON;"
        ))
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn, options })
    }

    /// Pull every matching task-log row, in `task_log.id` order. Busy or
    /// locked errors are retried up to `max_attempts` times.
    ///
    /// # Errors
    /// Returns an error when the query fails or the database stays busy.
    pub fn fetch_task_log(&self, query: &TaskLogQuery) -> Result<Vec<RawTaskEvent>> {
        let max_attempts = self.options.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.try_fetch(query) {
                Ok(events) => {
                    tracing::info!(rows = events.len(), attempt, "fetched task log");
                    return Ok(events);
                }
                Err(err) if is_busy(&err) && attempt < max_attempts => {
                    tracing::warn!(attempt, max_attempts, error = %err, "task log busy; retrying");
                    thread::sleep(self.options.retry_backoff);
                    attempt += 1;
                }
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("failed to fetch task log after {attempt} attempt(s)")
                    });
                }
            }
        }
    }

    fn try_fetch(&self, query: &TaskLogQuery) -> rusqlite::Result<Vec<RawTaskEvent>> {
        let (sql, params) = query.to_sql();
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(params))?;
        let mut events = Vec::new();

        while let Some(row) = rows.next()? {
            events.push(RawTaskEvent {
                study_id: as_text(row.get_ref(0)?),
                participant_id: as_text(row.get_ref(1)?),
                date_completed: as_text(row.get_ref(2)?),
                session_name: as_text(row.get_ref(3)?),
                tag: as_text(row.get_ref(4)?),
                task_name: as_text(row.get_ref(5)?),
            });
        }

        Ok(events)
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(failure.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

fn as_text(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(number) => Some(number.to_string()),
        ValueRef::Real(number) => Some(number.to_string()),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Some(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}
