//! JSONL storage for applied stack state
//!
//! Applied state is stored in `.stackctl/state.jsonl` with one JSON object
//! per stack and environment. Uses file locking for concurrent access safety.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::domain::{AppliedState, StackName};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateRecord {
    environment: String,
    #[serde(flatten)]
    state: AppliedState,
}

/// Store for last applied state per stack
pub struct StateStore {
    path: PathBuf,
    environment: String,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>, environment: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            environment: environment.into(),
        }
    }

    /// Creates the default store for a project
    pub fn for_project(project_root: &Path, environment: &str) -> Self {
        Self::new(project_root.join(".stackctl").join("state.jsonl"), environment)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("jsonl.lock")
    }

    fn read_records(&self) -> Result<Vec<StateRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.path)
            .with_context(|| format!("Failed to open state store: {}", self.path.display()))?;

        file.lock_shared()
            .context("Failed to acquire read lock on state store")?;

        let reader = BufReader::new(&file);
        let mut records = Vec::new();

        for (line_num, line) in reader.lines().enumerate() {
            let line = line.with_context(|| format!("Failed to read line {}", line_num + 1))?;

            if line.trim().is_empty() {
                continue;
            }

            let record: StateRecord = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse state at line {}", line_num + 1))?;
            records.push(record);
        }

        Ok(records)
    }

    fn write_records(&self, records: &[StateRecord]) -> Result<()> {
        let temp_path = self.path.with_extension("jsonl.tmp");

        {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)
                .with_context(|| format!("Failed to create temp file: {}", temp_path.display()))?;

            file.lock_exclusive()
                .context("Failed to acquire write lock on state store")?;

            let mut writer = BufWriter::new(&file);

            for record in records {
                let line = serde_json::to_string(record).context("Failed to serialize state")?;
                writeln!(writer, "{}", line).context("Failed to write state")?;
            }

            writer.flush().context("Failed to flush state store")?;
        }

        fs::rename(&temp_path, &self.path).with_context(|| {
            format!(
                "Failed to rename {} to {}",
                temp_path.display(),
                self.path.display()
            )
        })
    }

    /// Runs a read-modify-write cycle under an exclusive lock
    fn update(&self, f: impl FnOnce(&mut Vec<StateRecord>)) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let lock = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.lock_path())
            .context("Failed to open state lock file")?;
        lock.lock_exclusive()
            .context("Failed to acquire state lock")?;

        let mut records = self.read_records()?;
        f(&mut records);

        // Sort for stable diffs
        records.sort_by(|a, b| {
            (a.environment.as_str(), &a.state.stack).cmp(&(b.environment.as_str(), &b.state.stack))
        });

        self.write_records(&records)
    }

    /// Reads the applied state of every stack in this environment
    pub fn read_all(&self) -> Result<BTreeMap<StackName, AppliedState>> {
        Ok(self
            .read_records()?
            .into_iter()
            .filter(|r| r.environment == self.environment)
            .map(|r| (r.state.stack.clone(), r.state))
            .collect())
    }

    pub fn get(&self, stack: &StackName) -> Result<Option<AppliedState>> {
        Ok(self.read_all()?.remove(stack))
    }

    /// Records (or replaces) the applied state of one stack
    pub fn record(&self, state: &AppliedState) -> Result<()> {
        let environment = self.environment.clone();
        self.update(|records| {
            records.retain(|r| !(r.environment == environment && r.state.stack == state.stack));
            records.push(StateRecord {
                environment,
                state: state.clone(),
            });
        })
    }

    /// Forgets a stack's applied state. Returns true if it existed.
    pub fn remove(&self, stack: &StackName) -> Result<bool> {
        let mut removed = false;
        self.update(|records| {
            let before = records.len();
            records.retain(|r| !(r.environment == self.environment && &r.state.stack == stack));
            removed = records.len() != before;
        })?;
        Ok(removed)
    }
}
