//! Identifiers for stacks, apply generations and runs
//!
//! ID Format:
//! - Stack names: lowercase ASCII, digits, `-` and `_`, starting with a letter
//!   or digit, at most 64 characters (e.g., `vpc`, `users-api`, `load_balancer`)
//! - Generations: monotonically increasing counter, displayed as `g{n}`
//! - Run IDs: `r-{7-char-hash}` derived from the run start timestamp

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum IdError {
    #[error("Invalid stack name '{0}': use lowercase letters, digits, '-' or '_' (max 64 chars)")]
    InvalidStackName(String),

    #[error("Invalid generation: {0}")]
    InvalidGeneration(String),

    #[error("Invalid run ID format: expected 'r-{{7-char-hash}}', got '{0}'")]
    InvalidRunId(String),

    #[error("Invalid secret reference: expected 'secret://{{env}}/{{stack}}/{{key}}@g{{n}}', got '{0}'")]
    InvalidSecretRef(String),
}

const MAX_STACK_NAME_LEN: usize = 64;

/// Generates a 7-character hash from a seed and timestamp
fn generate_hash(seed: &str, timestamp: DateTime<Utc>) -> String {
    let input = format!("{}{}", seed, timestamp.timestamp_nanos_opt().unwrap_or(0));
    let hash = blake3::hash(input.as_bytes());
    let hex = hash.to_hex();
    hex[..7].to_string()
}

/// Unique name of a stack within a project
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StackName(String);

impl StackName {
    /// Validates and wraps a stack name
    pub fn new(name: impl Into<String>) -> Result<Self, IdError> {
        let name = name.into();
        let valid = !name.is_empty()
            && name.len() <= MAX_STACK_NAME_LEN
            && name
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
            && name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');

        if valid {
            Ok(Self(name))
        } else {
            Err(IdError::InvalidStackName(name))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StackName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl FromStr for StackName {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.trim())
    }
}

impl TryFrom<String> for StackName {
    type Error = IdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<StackName> for String {
    fn from(name: StackName) -> Self {
        name.0
    }
}

impl AsRef<str> for StackName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Apply generation of a stack's published outputs
///
/// Generation 0 means "never applied". Every successful apply that changes
/// infrastructure publishes under the next generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Generation(u64);

impl Generation {
    pub const NEVER_APPLIED: Generation = Generation(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// Returns the generation that follows this one
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }

    pub fn is_applied(&self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

impl FromStr for Generation {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let digits = s.strip_prefix('g').unwrap_or(s);
        digits
            .parse::<u64>()
            .map(Self)
            .map_err(|_| IdError::InvalidGeneration(s.to_string()))
    }
}

/// Identifier of one driver run, in the format `r-{7-char-hash}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunId {
    hash: String,
}

impl RunId {
    /// Creates a run ID from the environment and start timestamp
    pub fn new(environment: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            hash: generate_hash(environment, started_at),
        }
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r-{}", self.hash)
    }
}

impl FromStr for RunId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let hash = s
            .strip_prefix("r-")
            .ok_or_else(|| IdError::InvalidRunId(s.to_string()))?;

        if hash.len() != 7 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(IdError::InvalidRunId(s.to_string()));
        }

        Ok(Self {
            hash: hash.to_lowercase(),
        })
    }
}

impl TryFrom<String> for RunId {
    type Error = IdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<RunId> for String {
    fn from(id: RunId) -> Self {
        id.to_string()
    }
}
