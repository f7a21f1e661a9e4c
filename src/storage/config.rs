//! Configuration handling for stackctl
//!
//! Configuration is stored in `.stackctl/config.toml` (project) and
//! `~/.config/stackctl/config.toml` (global).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::StackName;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}

/// Which provisioning engine applies stacks
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// Local deterministic engine, no cloud calls
    #[default]
    Simulated,
    /// External executable speaking JSON over stdin/stdout
    Process,
}

impl EngineKind {
    pub fn as_str(&self) -> &str {
        match self {
            EngineKind::Simulated => "simulated",
            EngineKind::Process => "process",
        }
    }
}

/// Configuration for the provisioning engine
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub kind: EngineKind,

    /// Engine executable (process engine only); relative paths resolve against the project root
    pub command: Option<String>,

    pub args: Vec<String>,

    /// Artificial delay per apply (simulated engine only)
    pub latency_ms: u64,

    /// Stacks whose apply always fails (simulated engine only)
    pub fail_stacks: Vec<StackName>,
}

/// Configuration for apply runs
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApplyConfig {
    /// Per-stack apply timeout in seconds; 0 disables the timeout
    pub timeout_secs: u64,

    /// Maximum number of stacks applied concurrently
    pub max_parallel: usize,

    /// Apply without asking for confirmation
    pub auto_approve: bool,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 1800,
            max_parallel: 4,
            auto_approve: true,
        }
    }
}

impl ApplyConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

/// Log line format
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(ConfigError::Invalid(format!("unknown log format '{}'", other))),
        }
    }
}

/// Configuration for diagnostics
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: Option<LogFormat>,

    /// Filter directive, e.g. `stackctl=info`
    pub filter: Option<String>,
}

/// Project-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProjectConfig {
    /// Environment name, substituted for `${env}`
    pub environment: String,

    /// Organization, substituted for `${org}`
    pub org: Option<String>,

    /// Declaration order of stacks; unlisted stacks follow alphabetically
    pub stacks: Vec<StackName>,

    pub engine: EngineConfig,
    pub apply: ApplyConfig,
    pub logging: LoggingConfig,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            environment: "dev".to_string(),
            org: None,
            stacks: Vec::new(),
            engine: EngineConfig::default(),
            apply: ApplyConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ProjectConfig {
    /// Checks values serde cannot
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.environment.trim().is_empty() {
            return Err(ConfigError::Invalid("environment must not be empty".to_string()));
        }
        if self.environment.contains('/') {
            return Err(ConfigError::Invalid(format!(
                "environment '{}' must not contain '/'",
                self.environment
            )));
        }
        if self.apply.max_parallel == 0 {
            return Err(ConfigError::Invalid("apply.max_parallel must be at least 1".to_string()));
        }
        if self.engine.kind == EngineKind::Process && self.engine.command.is_none() {
            return Err(ConfigError::Invalid(
                "engine.command is required when engine.kind = \"process\"".to_string(),
            ));
        }
        Ok(())
    }
}

/// Global user configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GlobalConfig {
    /// Default output format (text or json)
    pub default_format: OutputFormat,

    pub log_format: Option<LogFormat>,
}

/// Output format for commands
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Combined configuration (global + project)
#[derive(Debug, Clone)]
pub struct Config {
    pub project: ProjectConfig,
    pub global: GlobalConfig,
    pub project_root: Option<PathBuf>,
}

impl Config {
    /// Loads configuration from default locations
    pub fn load() -> Result<Self> {
        let global = Self::load_global()?;
        let (project, project_root) = Self::load_project()?;

        Ok(Self {
            project,
            global,
            project_root,
        })
    }

    /// Loads configuration for a specific project
    pub fn for_project(project_root: &Path) -> Result<Self> {
        let global = Self::load_global()?;
        let project = Self::load_project_config(project_root)?;

        Ok(Self {
            project,
            global,
            project_root: Some(project_root.to_path_buf()),
        })
    }

    /// Returns the global config directory
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("dev", "stackctl", "stackctl").map(|dirs| dirs.config_dir().to_path_buf())
    }

    fn load_global() -> Result<GlobalConfig> {
        let config_dir = match Self::global_config_dir() {
            Some(dir) => dir,
            None => return Ok(GlobalConfig::default()),
        };

        let config_path = config_dir.join("config.toml");
        if !config_path.exists() {
            return Ok(GlobalConfig::default());
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read global config: {}", config_path.display()))?;

        toml::from_str(&content)
            .map_err(|e| ConfigError::Parse(e.to_string()))
            .context("Failed to parse global config")
    }

    fn load_project() -> Result<(ProjectConfig, Option<PathBuf>)> {
        match Self::find_project_root() {
            Some(root) => {
                let config = Self::load_project_config(&root)?;
                Ok((config, Some(root)))
            }
            None => Ok((ProjectConfig::default(), None)),
        }
    }

    /// Loads and validates project configuration from a specific root
    pub fn load_project_config(project_root: &Path) -> Result<ProjectConfig> {
        let config_path = project_root.join(".stackctl").join("config.toml");

        if !config_path.exists() {
            return Ok(ProjectConfig::default());
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read project config: {}", config_path.display()))?;

        let config: ProjectConfig = toml::from_str(&content)
            .map_err(|e| ConfigError::Parse(e.to_string()))
            .context("Failed to parse project config")?;

        config
            .validate()
            .with_context(|| format!("Invalid project config: {}", config_path.display()))?;

        Ok(config)
    }

    /// Finds the project root by looking for a `.stackctl/` directory
    pub fn find_project_root() -> Option<PathBuf> {
        let current = std::env::current_dir().ok()?;
        Self::find_project_root_from(&current)
    }

    /// Walks up from `start` looking for a `.stackctl/` directory
    pub fn find_project_root_from(start: &Path) -> Option<PathBuf> {
        let mut current = start.to_path_buf();

        loop {
            if current.join(".stackctl").is_dir() {
                return Some(current);
            }

            if !current.pop() {
                return None;
            }
        }
    }

    pub fn is_in_project(&self) -> bool {
        self.project_root.is_some()
    }

    /// Returns the project root, or an error if not in a project
    pub fn require_project_root(&self) -> Result<&Path> {
        self.project_root
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("Not in a stackctl project. Run 'stackctl init' first."))
    }

    /// Saves the project configuration
    pub fn save_project(&self) -> Result<()> {
        let root = self.require_project_root()?;
        let config_path = root.join(".stackctl").join("config.toml");

        let content =
            toml::to_string_pretty(&self.project).context("Failed to serialize project config")?;

        fs::write(&config_path, content)
            .with_context(|| format!("Failed to write project config: {}", config_path.display()))
    }
}
