//! Provisioning engines
//!
//! The engine is the external collaborator that turns a rendered resource
//! graph into real infrastructure. The core never inspects resources; it
//! hands over an [`ApplyRequest`] and receives a map of output values.
//!
//! - [`SimulatedEngine`]: deterministic local engine for dry runs and tests
//! - [`ProcessEngine`]: external executable speaking line-delimited JSON

mod process;
mod protocol;
mod simulated;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{Generation, StackName};
use crate::storage::{EngineConfig, EngineKind};

pub use process::ProcessEngine;
pub use protocol::{
    ApplyRequest, ApplyResponse, EngineManifest, EngineRequest, EngineResponse,
};
pub use simulated::SimulatedEngine;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to start engine '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Engine I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed engine message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Engine protocol error: {0}")]
    Protocol(String),

    /// The engine ran and reported a failure
    #[error("{0}")]
    Failed(String),

    #[error("Engine is not configured: {0}")]
    NotConfigured(String),
}

/// Provisioning engine interface
#[async_trait]
pub trait ProvisioningEngine: Send + Sync {
    /// Engine name (for logging and history)
    fn name(&self) -> &str;

    /// Reconciles one stack and returns its raw outputs.
    ///
    /// May be dropped mid-flight on cancellation or timeout; implementations
    /// must not leave work running once the future is dropped.
    async fn apply(&self, request: ApplyRequest) -> Result<ApplyResponse, EngineError>;

    /// Directive to abandon an in-flight apply
    async fn cancel(&self, _stack: &StackName, _generation: Generation) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Builds the engine described by project configuration
pub fn from_config(
    config: &EngineConfig,
    project_root: &Path,
) -> Result<Arc<dyn ProvisioningEngine>, EngineError> {
    match config.kind {
        EngineKind::Simulated => Ok(Arc::new(
            SimulatedEngine::new()
                .with_latency(Duration::from_millis(config.latency_ms))
                .with_failures(config.fail_stacks.iter().cloned()),
        )),
        EngineKind::Process => {
            let command = config.command.as_deref().ok_or_else(|| {
                EngineError::NotConfigured("engine.command is not set".to_string())
            })?;
            let path = Path::new(command);
            let command = if path.components().count() > 1 && path.is_relative() {
                project_root.join(path)
            } else {
                path.to_path_buf()
            };
            Ok(Arc::new(
                ProcessEngine::new(command)
                    .with_args(config.args.clone())
                    .with_working_dir(project_root),
            ))
        }
    }
}
