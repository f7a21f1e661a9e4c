//! Secret sinks
//!
//! Sensitive outputs are written to a sink and only their [`SecretRef`]
//! travels through the output store, the state file and the terminal.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fs2::FileExt;
use thiserror::Error;
use tracing::debug;

use crate::domain::{Generation, SecretRef, Sensitive, StackName};

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("Secret store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Secret store is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Key-value store for sensitive outputs, addressed by reference
pub trait SecretSink: Send + Sync {
    /// Stores a value for one apply generation and returns the reference
    /// downstream stacks will see
    fn put(
        &self,
        environment: &str,
        stack: &StackName,
        key: &str,
        generation: Generation,
        value: &Sensitive,
    ) -> Result<SecretRef, SecretError>;

    /// Resolves a reference at runtime
    fn get(&self, reference: &SecretRef) -> Result<Option<Sensitive>, SecretError>;
}

/// In-memory sink, for tests and dry runs
#[derive(Default)]
pub struct MemorySecretSink {
    values: Mutex<BTreeMap<SecretRef, Sensitive>>,
}

impl MemorySecretSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SecretSink for MemorySecretSink {
    fn put(
        &self,
        environment: &str,
        stack: &StackName,
        key: &str,
        generation: Generation,
        value: &Sensitive,
    ) -> Result<SecretRef, SecretError> {
        let reference = SecretRef::new(environment, stack, key, generation);
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(reference.clone(), value.clone());
        Ok(reference)
    }

    fn get(&self, reference: &SecretRef) -> Result<Option<Sensitive>, SecretError> {
        Ok(self
            .values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(reference)
            .cloned())
    }
}

/// File-backed sink at `.stackctl/secrets.json`, readable by the owner only
pub struct FileSecretSink {
    path: PathBuf,
}

impl FileSecretSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn for_project(project_root: &Path) -> Self {
        Self::new(project_root.join(".stackctl").join("secrets.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> SecretError {
        SecretError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn open(&self) -> Result<File, SecretError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }

        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true).truncate(false);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        options.open(&self.path).map_err(|e| self.io_error(e))
    }

    fn read_map(&self, file: &mut File) -> Result<BTreeMap<String, String>, SecretError> {
        let mut content = String::new();
        file.read_to_string(&mut content)
            .map_err(|e| self.io_error(e))?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_str(&content)?)
    }
}

impl SecretSink for FileSecretSink {
    fn put(
        &self,
        environment: &str,
        stack: &StackName,
        key: &str,
        generation: Generation,
        value: &Sensitive,
    ) -> Result<SecretRef, SecretError> {
        let reference = SecretRef::new(environment, stack, key, generation);

        let mut file = self.open()?;
        file.lock_exclusive().map_err(|e| self.io_error(e))?;

        let mut map = self.read_map(&mut file)?;
        map.insert(reference.as_str().to_string(), value.expose().to_string());

        let content = serde_json::to_string_pretty(&map)?;
        file.set_len(0)
            .and_then(|_| file.seek(SeekFrom::Start(0)))
            .and_then(|_| file.write_all(content.as_bytes()))
            .and_then(|_| file.flush())
            .map_err(|e| self.io_error(e))?;

        debug!(reference = %reference, "stored secret");
        Ok(reference)
    }

    fn get(&self, reference: &SecretRef) -> Result<Option<Sensitive>, SecretError> {
        if !self.path.exists() {
            return Ok(None);
        }

        let mut file = File::open(&self.path).map_err(|e| self.io_error(e))?;
        file.lock_shared().map_err(|e| self.io_error(e))?;

        let map = self.read_map(&mut file)?;
        Ok(map.get(reference.as_str()).map(Sensitive::new))
    }
}
