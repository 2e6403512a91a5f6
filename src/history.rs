use std::{path::Path, sync::Mutex};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub task_id: String,
    pub kind: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewEntry {
    pub id: i64,
    pub rating: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub struct HistoryStore {
    conn: Mutex<Connection>,
}

impl HistoryStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open history db at {}", path.display()))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS task_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                status TEXT NOT NULL,
                file_name TEXT,
                error TEXT,
                finished_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS reviews (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                rating INTEGER NOT NULL,
                comment TEXT,
                created_at TEXT NOT NULL
            );",
        )
        .context("Failed to initialize history schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("History store lock poisoned"))
    }

    pub fn record_task(&self, entry: &HistoryEntry) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO task_history (task_id, kind, status, file_name, error, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.task_id,
                entry.kind,
                entry.status,
                entry.file_name,
                entry.error,
                entry.finished_at.to_rfc3339(),
            ],
        )
        .context("Failed to insert history entry")?;
        Ok(())
    }

    pub fn recent_tasks(&self, limit: u32) -> Result<Vec<HistoryEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT task_id, kind, status, file_name, error, finished_at
             FROM task_history ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (task_id, kind, status, file_name, error, finished_at) = row?;
            let finished_at = DateTime::parse_from_rfc3339(&finished_at)
                .with_context(|| format!("Invalid timestamp in history row for {task_id}"))?
                .with_timezone(&Utc);
            entries.push(HistoryEntry {
                task_id,
                kind,
                status,
                file_name,
                error,
                finished_at,
            });
        }
        Ok(entries)
    }

    pub fn add_review(&self, rating: u8, comment: Option<&str>) -> Result<ReviewEntry> {
        let created_at = Utc::now();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO reviews (rating, comment, created_at) VALUES (?1, ?2, ?3)",
            params![rating, comment, created_at.to_rfc3339()],
        )
        .context("Failed to insert review")?;
        Ok(ReviewEntry {
            id: conn.last_insert_rowid(),
            rating,
            comment: comment.map(str::to_string),
            created_at,
        })
    }

    pub fn list_reviews(&self, limit: u32) -> Result<Vec<ReviewEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, rating, comment, created_at FROM reviews ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, u8>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, rating, comment, created_at) = row?;
            let created_at = DateTime::parse_from_rfc3339(&created_at)
                .context("Invalid timestamp in review row")?
                .with_timezone(&Utc);
            entries.push(ReviewEntry {
                id,
                rating,
                comment,
                created_at,
            });
        }
        Ok(entries)
    }
}
