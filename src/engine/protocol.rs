//! Engine protocol types
//!
//! External engines communicate via JSON messages over stdin/stdout, one
//! request and one response per line. Each engine must support the
//! `--manifest` flag to declare its capabilities.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::domain::{
    Generation, OutputSchema, ReconciliationPlan, RenderedResource, ResourceChange, StackName,
};

/// Engine manifest declaring capabilities
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineManifest {
    /// Engine name (e.g., "stackctl-engine-pulumi")
    pub name: String,

    pub version: String,

    #[serde(default)]
    pub description: String,

    /// Supported operations
    pub operations: Vec<String>,
}

impl EngineManifest {
    pub fn supports(&self, operation: &str) -> bool {
        self.operations.iter().any(|op| op == operation)
    }
}

/// Everything an engine needs to reconcile one stack
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyRequest {
    pub stack: StackName,
    pub project: String,
    pub environment: String,

    /// Generation the outputs will be published under
    pub generation: Generation,

    pub changes: Vec<ResourceChange>,
    pub resources: Vec<RenderedResource>,

    /// Rendered export values; sensitive upstream values appear by reference
    pub exports: BTreeMap<String, Value>,

    pub output_schema: OutputSchema,
}

impl ApplyRequest {
    pub fn from_plan(
        plan: &ReconciliationPlan,
        project: impl Into<String>,
        environment: impl Into<String>,
        output_schema: &OutputSchema,
    ) -> Self {
        Self {
            stack: plan.stack.clone(),
            project: project.into(),
            environment: environment.into(),
            generation: plan.target_generation(),
            changes: plan.changes.clone(),
            resources: plan.resources.clone(),
            exports: plan.exports.clone(),
            output_schema: output_schema.clone(),
        }
    }
}

/// Raw outputs returned by an engine, validated by the driver before publish
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplyResponse {
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
}

/// A message sent to an engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineRequest {
    pub operation: String,
    pub params: Value,
}

impl EngineRequest {
    pub fn new(operation: impl Into<String>, params: impl Into<Value>) -> Self {
        Self {
            operation: operation.into(),
            params: params.into(),
        }
    }
}

/// A response from an engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineResponse {
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EngineResponse {
    pub fn success(data: impl Into<Value>) -> Self {
        Self {
            success: true,
            data: Some(data.into()),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn manifest_parses_and_reports_operations() {
        let manifest: EngineManifest = serde_json::from_value(json!({
            "name": "stackctl-engine-test",
            "version": "0.1.0",
            "operations": ["apply", "cancel"]
        }))
        .unwrap();

        assert!(manifest.supports("apply"));
        assert!(!manifest.supports("destroy"));
        assert_eq!(manifest.description, "");
    }

    #[test]
    fn request_wraps_operation_and_params() {
        let request = EngineRequest::new("apply", json!({"stack": "vpc"}));
        let line = serde_json::to_string(&request).unwrap();

        assert_eq!(line, r#"{"operation":"apply","params":{"stack":"vpc"}}"#);
    }

    #[test]
    fn response_error_omits_data() {
        let response = EngineResponse::error("quota exceeded");
        let value = serde_json::to_value(&response).unwrap();

        assert_eq!(value, json!({"success": false, "error": "quota exceeded"}));
    }

    #[test]
    fn apply_response_defaults_to_empty_outputs() {
        let response: ApplyResponse = serde_json::from_value(json!({})).unwrap();
        assert!(response.outputs.is_empty());
    }
}
