//! # Storage Layer
//!
//! Persistence for stackctl with git-friendly file formats.
//!
//! ## Storage Formats
//!
//! | Data | Format | Location |
//! |------|--------|----------|
//! | Stack manifests | YAML | `.stackctl/stacks/{name}.yaml` |
//! | Applied state | JSONL (one stack per line) | `.stackctl/state.jsonl` |
//! | Secret values | JSON, owner-only | `.stackctl/secrets.json` |
//! | Config | TOML | `.stackctl/config.toml` |
//! | Run history | SQLite | `.stackctl/.cache/history.db` |
//!
//! ## Concurrency Safety
//!
//! - [`StateStore`] and [`FileSecretSink`] use file locking (`fs2`)
//! - State and manifest writes are atomic (temp file + rename)
//!
//! ## Project Structure
//!
//! ```text
//! .stackctl/
//! ├── stacks/
//! │   ├── vpc.yaml          # One manifest per stack
//! │   └── aurora.yaml
//! ├── state.jsonl           # Last applied state per stack and environment
//! ├── secrets.json          # Sensitive output values (git-ignored)
//! ├── config.toml           # Project configuration
//! ├── .cache/history.db     # Run history (git-ignored)
//! └── .gitignore
//! ```

mod config;
mod history;
mod manifests;
mod project;
mod sample;
mod secrets;
mod state;

pub use config::{
    ApplyConfig, Config, ConfigError, EngineConfig, EngineKind, GlobalConfig, LogFormat,
    LoggingConfig, OutputFormat, ProjectConfig,
};
pub use history::{HistoryEntry, HistoryStore};
pub use manifests::ManifestStore;
pub use project::{Project, ProjectError};
pub use secrets::{FileSecretSink, MemorySecretSink, SecretError, SecretSink};
pub use state::StateStore;
