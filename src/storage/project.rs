//! Project management
//!
//! Handles project initialization and provides access to stores.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use thiserror::Error;

use super::sample::{SAMPLE_MANIFESTS, SAMPLE_ORDER};
use super::{Config, FileSecretSink, HistoryStore, ManifestStore, StateStore};
use crate::domain::Stack;

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("Not in a stackctl project. Run 'stackctl init' first.")]
    NotInProject,

    #[error("Stack manifests already exist in {0}; refusing to overwrite with the sample")]
    SampleConflict(PathBuf),
}

const DEFAULT_CONFIG: &str = r#"# stackctl configuration

# Environment name, available to manifests as ${env}
environment = "dev"

# Organization, available to manifests as ${org}
# org = "acme"

# Declaration order; stacks not listed follow alphabetically.
# Independent stacks are scheduled in this order.
stacks = []

[engine]
# "simulated" runs locally; "process" runs an external engine executable
kind = "simulated"
# command = "stackctl-engine-pulumi"

[apply]
timeout_secs = 1800
max_parallel = 4
auto_approve = true
"#;

const GITIGNORE: &str = r#"# Run history (informational)
.cache/

# Secret values; only references are safe to commit
secrets.json

# Lock and temp files
*.lock
*.tmp
"#;

/// A stackctl project
pub struct Project {
    root: PathBuf,
    config: Config,
}

impl Project {
    /// Opens an existing project at the given path
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();

        if !root.join(".stackctl").is_dir() {
            return Err(ProjectError::NotInProject.into());
        }

        let config = Config::for_project(&root)?;

        Ok(Self { root, config })
    }

    /// Opens the project at the current directory or a parent
    pub fn open_current() -> Result<Self> {
        let root = Config::find_project_root().ok_or(ProjectError::NotInProject)?;

        Self::open(root)
    }

    /// Initializes a new project at the given path
    ///
    /// With `sample`, also writes the sample stack manifests and their
    /// declaration order.
    pub fn init(root: impl Into<PathBuf>, sample: bool) -> Result<Self> {
        let root = root.into();
        let stackctl_dir = root.join(".stackctl");
        let manifests = ManifestStore::for_project(&root);

        fs::create_dir_all(manifests.dir()).with_context(|| {
            format!("Failed to create stacks directory: {}", manifests.dir().display())
        })?;

        if sample && !manifests.list()?.is_empty() {
            return Err(ProjectError::SampleConflict(manifests.dir().to_path_buf()).into());
        }

        let config_path = stackctl_dir.join("config.toml");
        if !config_path.exists() || sample {
            let content = if sample {
                let order = SAMPLE_ORDER
                    .iter()
                    .map(|s| format!("\"{}\"", s))
                    .collect::<Vec<_>>()
                    .join(", ");
                DEFAULT_CONFIG
                    .replace("stacks = []", &format!("stacks = [{}]", order))
                    .replace("# org = \"acme\"", "org = \"acme\"")
            } else {
                DEFAULT_CONFIG.to_string()
            };
            fs::write(&config_path, content)
                .with_context(|| format!("Failed to write config: {}", config_path.display()))?;
        }

        let gitignore_path = stackctl_dir.join(".gitignore");
        if !gitignore_path.exists() {
            fs::write(&gitignore_path, GITIGNORE).with_context(|| {
                format!("Failed to write .gitignore: {}", gitignore_path.display())
            })?;
        }

        if sample {
            for (name, yaml) in SAMPLE_MANIFESTS {
                let path = manifests.dir().join(format!("{}.yaml", name));
                fs::write(&path, yaml)
                    .with_context(|| format!("Failed to write manifest: {}", path.display()))?;
            }
        }

        Self::open(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the .stackctl directory path
    pub fn stackctl_dir(&self) -> PathBuf {
        self.root.join(".stackctl")
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn environment(&self) -> &str {
        &self.config.project.environment
    }

    pub fn manifest_store(&self) -> ManifestStore {
        ManifestStore::for_project(&self.root)
    }

    /// Reads all stack manifests in declaration order
    pub fn stacks(&self) -> Result<Vec<Stack>> {
        self.manifest_store().read_all(&self.config.project.stacks)
    }

    pub fn state_store(&self) -> StateStore {
        StateStore::for_project(&self.root, self.environment())
    }

    pub fn secret_sink(&self) -> FileSecretSink {
        FileSecretSink::for_project(&self.root)
    }

    /// Opens the run history database
    pub fn history(&self) -> Result<HistoryStore> {
        HistoryStore::open(&self.root)
    }
}
