//! SQLite run history
//!
//! Every driver run appends one row per stack to `.stackctl/.cache/history.db`.
//! The history is informational; deleting it loses nothing the driver needs.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::domain::{RunId, StackName};

/// One stack's outcome within one run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub run_id: RunId,
    pub environment: String,
    pub stack: StackName,

    /// Outcome label, e.g. `applied`, `unchanged`, `failed`, `blocked`
    pub outcome: String,

    pub generation: Option<u64>,

    /// Failure message or blocking upstream; never contains secret values
    pub detail: Option<String>,

    pub recorded_at: DateTime<Utc>,
}

/// SQLite-backed run history
pub struct HistoryStore {
    db_path: PathBuf,
    conn: Connection,
}

impl HistoryStore {
    /// Schema version - bump when schema changes to force rebuild
    const SCHEMA_VERSION: i32 = 1;

    /// Creates or opens the history database for a project
    pub fn open(project_root: &Path) -> Result<Self> {
        let cache_dir = project_root.join(".stackctl").join(".cache");
        let db_path = cache_dir.join("history.db");

        fs::create_dir_all(&cache_dir).with_context(|| {
            format!("Failed to create cache directory: {}", cache_dir.display())
        })?;

        let conn = Connection::open(&db_path)
            .with_context(|| format!("Failed to open history database: {}", db_path.display()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let mut store = Self { db_path, conn };
        store.ensure_schema()?;

        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        if self.get_schema_version()? != Self::SCHEMA_VERSION {
            self.create_schema()?;
        }
        Ok(())
    }

    fn get_schema_version(&self) -> Result<i32> {
        let result: Option<i32> = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .optional()?;

        Ok(result.unwrap_or(0))
    }

    fn create_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "
            DROP TABLE IF EXISTS stack_runs;

            CREATE TABLE stack_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                environment TEXT NOT NULL,
                stack TEXT NOT NULL,
                outcome TEXT NOT NULL,
                generation INTEGER,
                detail TEXT,
                recorded_at TEXT NOT NULL
            );

            CREATE INDEX idx_stack_runs_stack ON stack_runs(environment, stack);
            CREATE INDEX idx_stack_runs_run ON stack_runs(run_id);
            ",
        )?;

        self.conn
            .execute_batch(&format!("PRAGMA user_version = {}", Self::SCHEMA_VERSION))?;

        Ok(())
    }

    /// Appends the entries of one run in a single transaction
    pub fn record(&mut self, entries: &[HistoryEntry]) -> Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO stack_runs
                    (run_id, environment, stack, outcome, generation, detail, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;

            for entry in entries {
                stmt.execute(params![
                    entry.run_id.to_string(),
                    entry.environment,
                    entry.stack.as_str(),
                    entry.outcome,
                    entry.generation.map(|g| g as i64),
                    entry.detail,
                    entry.recorded_at.to_rfc3339(),
                ])?;
            }
        }
        tx.commit().context("Failed to commit run history")?;
        Ok(())
    }

    /// Most recent entries first, optionally for one stack
    pub fn recent(
        &self,
        environment: &str,
        stack: Option<&StackName>,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, environment, stack, outcome, generation, detail, recorded_at
             FROM stack_runs
             WHERE environment = ?1 AND (?2 IS NULL OR stack = ?2)
             ORDER BY id DESC
             LIMIT ?3",
        )?;

        let rows = stmt.query_map(
            params![environment, stack.map(|s| s.as_str()), limit as i64],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                ))
            },
        )?;

        let mut entries = Vec::new();
        for row in rows {
            let (run_id, environment, stack, outcome, generation, detail, recorded_at) = row?;
            entries.push(HistoryEntry {
                run_id: run_id
                    .parse()
                    .with_context(|| format!("Corrupt run id in history: {}", run_id))?,
                environment,
                stack: StackName::new(stack).context("Corrupt stack name in history")?,
                outcome,
                generation: generation.map(|g| g as u64),
                detail,
                recorded_at: DateTime::parse_from_rfc3339(&recorded_at)
                    .context("Corrupt timestamp in history")?
                    .with_timezone(&Utc),
            });
        }

        Ok(entries)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }
}
