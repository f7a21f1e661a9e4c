//! External engine executables
//!
//! Each apply spawns the engine, writes one request line to its stdin and
//! reads one response line from its stdout. The child is killed if the
//! apply future is dropped (cancellation or timeout).

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::protocol::{ApplyRequest, ApplyResponse, EngineManifest, EngineRequest, EngineResponse};
use super::{EngineError, ProvisioningEngine};
use crate::domain::{Generation, StackName};

/// Engine backed by an external executable
pub struct ProcessEngine {
    name: String,
    command: PathBuf,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    manifest: OnceCell<EngineManifest>,
}

impl ProcessEngine {
    pub fn new(command: impl Into<PathBuf>) -> Self {
        let command = command.into();
        let name = command
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("process")
            .to_string();
        Self {
            name,
            command,
            args: Vec::new(),
            working_dir: None,
            manifest: OnceCell::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_working_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.working_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    fn spawn_error(&self, source: std::io::Error) -> EngineError {
        EngineError::Spawn {
            command: self.command.display().to_string(),
            source,
        }
    }

    /// Loads the engine manifest (`<command> --manifest`), once
    pub async fn manifest(&self) -> Result<&EngineManifest, EngineError> {
        self.manifest
            .get_or_try_init(|| async {
                let output = self
                    .command()
                    .arg("--manifest")
                    .stdin(Stdio::null())
                    .kill_on_drop(true)
                    .output()
                    .await
                    .map_err(|e| self.spawn_error(e))?;

                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    return Err(EngineError::Protocol(format!(
                        "'--manifest' exited with {}: {}",
                        output.status,
                        stderr.trim()
                    )));
                }

                Ok::<_, EngineError>(serde_json::from_slice(&output.stdout)?)
            })
            .await
    }

    /// Executes one request and returns the engine's response
    pub async fn execute(&self, request: &EngineRequest) -> Result<EngineResponse, EngineError> {
        let mut child = self
            .command()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.spawn_error(e))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Protocol("engine stdin unavailable".to_string()))?;
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        stdin.write_all(line.as_bytes()).await?;
        drop(stdin);

        let output = child.wait_with_output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        let Some(response_line) = stdout.lines().find(|l| !l.trim().is_empty()) else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::Protocol(format!(
                "no response from engine (exit {}): {}",
                output.status,
                stderr.trim()
            )));
        };

        let response: EngineResponse = serde_json::from_str(response_line)?;
        debug!(engine = %self.name, operation = %request.operation, success = response.success, "engine responded");
        Ok(response)
    }
}

#[async_trait]
impl ProvisioningEngine for ProcessEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply(&self, request: ApplyRequest) -> Result<ApplyResponse, EngineError> {
        let request = EngineRequest::new("apply", serde_json::to_value(&request)?);
        let response = self.execute(&request).await?;

        if !response.success {
            return Err(EngineError::Failed(
                response
                    .error
                    .unwrap_or_else(|| "engine reported failure".to_string()),
            ));
        }

        Ok(serde_json::from_value(response.data.unwrap_or_else(|| json!({})))?)
    }

    async fn cancel(&self, stack: &StackName, generation: Generation) -> Result<(), EngineError> {
        let supported = match self.manifest().await {
            Ok(manifest) => manifest.supports("cancel"),
            Err(e) => {
                warn!(engine = %self.name, error = %e, "could not load engine manifest");
                false
            }
        };
        if !supported {
            return Ok(());
        }

        let request = EngineRequest::new(
            "cancel",
            json!({ "stack": stack, "generation": generation }),
        );
        let response = self.execute(&request).await?;
        if !response.success {
            return Err(EngineError::Failed(
                response.error.unwrap_or_else(|| "cancel rejected".to_string()),
            ));
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::domain::{OutputSchema, ReconciliationPlan};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    const FAKE_ENGINE: &str = r#"
if [ "$1" = "--manifest" ]; then
  echo '{"name":"fake","version":"0.1.0","operations":["apply"]}'
  exit 0
fi
read line
case "$line" in
  *'"stack":"broken"'*) echo '{"success":false,"error":"quota exceeded"}' ;;
  *) echo '{"success":true,"data":{"outputs":{"vpc_id":"vpc-0abc"}}}' ;;
esac
"#;

    fn engine(dir: &TempDir) -> ProcessEngine {
        let script = dir.path().join("engine.sh");
        std::fs::write(&script, FAKE_ENGINE).unwrap();
        ProcessEngine::new("sh")
            .with_args(vec![script.display().to_string()])
            .with_working_dir(dir.path())
    }

    fn request(stack: &str) -> ApplyRequest {
        let plan = ReconciliationPlan::compute(
            StackName::new(stack).unwrap(),
            vec![],
            BTreeMap::new(),
            &OutputSchema::default(),
            None,
        );
        ApplyRequest::from_plan(&plan, stack, "dev", &OutputSchema::default())
    }

    #[tokio::test]
    async fn apply_returns_outputs() {
        let dir = TempDir::new().unwrap();
        let response = engine(&dir).apply(request("vpc")).await.unwrap();
        assert_eq!(response.outputs["vpc_id"], "vpc-0abc");
    }

    #[tokio::test]
    async fn engine_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        let err = engine(&dir).apply(request("broken")).await.unwrap_err();
        assert_eq!(err.to_string(), "quota exceeded");
    }

    #[tokio::test]
    async fn manifest_is_loaded() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let manifest = engine.manifest().await.unwrap();
        assert_eq!(manifest.name, "fake");
        assert!(!manifest.supports("cancel"));
    }

    #[tokio::test]
    async fn cancel_is_noop_when_unsupported() {
        let dir = TempDir::new().unwrap();
        let stack = StackName::new("vpc").unwrap();
        assert!(engine(&dir).cancel(&stack, Generation::new(1)).await.is_ok());
    }

    #[tokio::test]
    async fn missing_executable_fails_to_spawn() {
        let engine = ProcessEngine::new("/nonexistent/stackctl-engine");
        assert!(matches!(
            engine.apply(request("vpc")).await,
            Err(EngineError::Spawn { .. })
        ));
    }
}
