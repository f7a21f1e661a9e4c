//! Simulated engine
//!
//! Publishes the rendered exports and synthesizes stable identifiers for the
//! remaining schema fields. Identifiers depend only on environment, stack and
//! field, so repeated applies publish identical values.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::protocol::{ApplyRequest, ApplyResponse};
use super::{EngineError, ProvisioningEngine};
use crate::domain::{OutputField, OutputKind, StackName};

#[derive(Default)]
pub struct SimulatedEngine {
    latency: Duration,
    fail_stacks: HashSet<StackName>,
    applies: AtomicUsize,
}

impl SimulatedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Stacks whose apply always fails
    pub fn with_failures(mut self, stacks: impl IntoIterator<Item = StackName>) -> Self {
        self.fail_stacks.extend(stacks);
        self
    }

    /// Number of apply calls received
    pub fn apply_count(&self) -> usize {
        self.applies.load(Ordering::SeqCst)
    }

    fn synthesize(request: &ApplyRequest, field: &OutputField) -> Value {
        let seed = format!("{}/{}/{}", request.environment, request.stack, field.name);
        let hash = blake3::hash(seed.as_bytes()).to_hex();
        let id = format!("sim-{}-{}-{}", request.stack, field.name.replace('_', "-"), &hash[..7]);

        match field.kind {
            OutputKind::String => Value::String(id),
            OutputKind::List => Value::Array(vec![
                Value::String(format!("{}-a", id)),
                Value::String(format!("{}-b", id)),
            ]),
            kind => kind.placeholder(),
        }
    }
}

#[async_trait]
impl ProvisioningEngine for SimulatedEngine {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn apply(&self, request: ApplyRequest) -> Result<ApplyResponse, EngineError> {
        self.applies.fetch_add(1, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if self.fail_stacks.contains(&request.stack) {
            return Err(EngineError::Failed(format!(
                "simulated failure applying '{}'",
                request.stack
            )));
        }

        let outputs: BTreeMap<String, Value> = request
            .output_schema
            .fields()
            .iter()
            .map(|field| {
                let value = request
                    .exports
                    .get(&field.name)
                    .cloned()
                    .unwrap_or_else(|| Self::synthesize(&request, field));
                (field.name.clone(), value)
            })
            .collect();

        debug!(stack = %request.stack, generation = %request.generation, resources = request.resources.len(), "simulated apply");
        Ok(ApplyResponse { outputs })
    }
}
