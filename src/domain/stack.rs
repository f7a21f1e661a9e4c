//! Stack domain model
//!
//! A stack is a named, independently applied unit of infrastructure
//! declaration. It consumes outputs of upstream stacks through
//! [`StackReference`]s, declares opaque resources, and publishes outputs
//! described by its [`OutputSchema`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use thiserror::Error;

use super::id::StackName;
use super::output::{OutputSchema, SchemaError};

#[derive(Debug, Error, PartialEq)]
pub enum ManifestError {
    #[error("Stack '{stack}' references '{reference}' more than once")]
    DuplicateReference {
        stack: StackName,
        reference: StackName,
    },

    #[error("Stack '{stack}' declares resource '{name}' more than once")]
    DuplicateResource { stack: StackName, name: String },

    #[error("Stack '{stack}' has an invalid output schema: {source}")]
    Schema {
        stack: StackName,
        #[source]
        source: SchemaError,
    },

    #[error("Stack '{stack}' exports '{key}' which is not in its output schema")]
    UndeclaredExport { stack: StackName, key: String },
}

/// Lifecycle status of a stack within one driver run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StackStatus {
    #[default]
    Pending,
    Planned,
    Applying,
    Applied,
    Failed,
}

impl StackStatus {
    /// Returns true if the transition is allowed by the lifecycle
    pub fn can_transition_to(&self, next: StackStatus) -> bool {
        use StackStatus::*;
        matches!(
            (self, next),
            (Pending, Planned)
                | (Pending, Failed)
                | (Planned, Applying)
                | (Planned, Applied)
                | (Planned, Failed)
                | (Planned, Pending)
                | (Applying, Applied)
                | (Applying, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StackStatus::Pending => "pending",
            StackStatus::Planned => "planned",
            StackStatus::Applying => "applying",
            StackStatus::Applied => "applied",
            StackStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for StackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Manifest form of a requirement: either a bare key or a full entry
#[derive(Deserialize)]
#[serde(untagged)]
enum RequirementSpec {
    Key(String),
    Full {
        key: String,
        #[serde(default = "default_required")]
        required: bool,
        #[serde(default)]
        default: Option<Value>,
    },
}

fn default_required() -> bool {
    true
}

/// One output key consumed from an upstream stack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RequirementSpec")]
pub struct OutputRequirement {
    pub key: String,

    /// Required keys fail resolution when absent; optional keys fall back to `default`
    pub required: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl OutputRequirement {
    pub fn required(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            required: true,
            default: None,
        }
    }

    pub fn optional(key: impl Into<String>, default: Option<Value>) -> Self {
        Self {
            key: key.into(),
            required: false,
            default,
        }
    }
}

impl From<RequirementSpec> for OutputRequirement {
    fn from(spec: RequirementSpec) -> Self {
        match spec {
            RequirementSpec::Key(key) => Self::required(key),
            RequirementSpec::Full {
                key,
                required,
                default,
            } => Self {
                key,
                required,
                default,
            },
        }
    }
}

/// Pointer from a consuming stack to a producing stack's outputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackReference {
    pub stack: StackName,

    #[serde(default)]
    pub outputs: Vec<OutputRequirement>,
}

impl StackReference {
    pub fn new(stack: StackName) -> Self {
        Self {
            stack,
            outputs: Vec::new(),
        }
    }

    pub fn require(mut self, key: impl Into<String>) -> Self {
        self.outputs.push(OutputRequirement::required(key));
        self
    }

    pub fn optional(mut self, key: impl Into<String>, default: Option<Value>) -> Self {
        self.outputs.push(OutputRequirement::optional(key, default));
        self
    }

    pub fn requirement(&self, key: &str) -> Option<&OutputRequirement> {
        self.outputs.iter().find(|r| r.key == key)
    }
}

/// An opaque resource declaration handed to the provisioning engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDecl {
    #[serde(rename = "type")]
    pub resource_type: String,

    pub name: String,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub properties: Value,
}

impl ResourceDecl {
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>, properties: Value) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
            properties,
        }
    }
}

/// A stack declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stack {
    pub name: StackName,

    /// Grouping key; defaults to the stack name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    project: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<StackReference>,

    /// Per-stack configuration values, referenced as `${config.key}`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceDecl>,

    /// Values the engine should publish, keyed by output name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub exports: BTreeMap<String, Value>,

    #[serde(default)]
    pub outputs: OutputSchema,
}

impl Stack {
    /// Creates an empty stack declaration
    pub fn new(name: StackName) -> Self {
        Self {
            name,
            project: None,
            description: None,
            inputs: Vec::new(),
            config: BTreeMap::new(),
            resources: Vec::new(),
            exports: BTreeMap::new(),
            outputs: OutputSchema::default(),
        }
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    pub fn with_input(mut self, reference: StackReference) -> Self {
        self.inputs.push(reference);
        self
    }

    pub fn with_resource(mut self, resource: ResourceDecl) -> Self {
        self.resources.push(resource);
        self
    }

    pub fn with_outputs(mut self, outputs: OutputSchema) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    pub fn with_export(mut self, key: impl Into<String>, value: Value) -> Self {
        self.exports.insert(key.into(), value);
        self
    }

    pub fn project(&self) -> &str {
        self.project.as_deref().unwrap_or(self.name.as_str())
    }

    /// Names of the stacks this one reads outputs from, in declaration order
    pub fn dependencies(&self) -> impl Iterator<Item = &StackName> {
        self.inputs.iter().map(|r| &r.stack)
    }

    pub fn reference(&self, upstream: &StackName) -> Option<&StackReference> {
        self.inputs.iter().find(|r| &r.stack == upstream)
    }

    pub fn config_value(&self, key: &str) -> Option<&Value> {
        self.config.get(key)
    }

    /// Checks internal consistency of the declaration
    pub fn validate(&self) -> Result<(), ManifestError> {
        let mut refs = HashSet::new();
        for reference in &self.inputs {
            if !refs.insert(&reference.stack) {
                return Err(ManifestError::DuplicateReference {
                    stack: self.name.clone(),
                    reference: reference.stack.clone(),
                });
            }
        }

        let mut resources = HashSet::new();
        for resource in &self.resources {
            if !resources.insert(resource.name.as_str()) {
                return Err(ManifestError::DuplicateResource {
                    stack: self.name.clone(),
                    name: resource.name.clone(),
                });
            }
        }

        self.outputs.check().map_err(|source| ManifestError::Schema {
            stack: self.name.clone(),
            source,
        })?;

        if let Some(key) = self.exports.keys().find(|k| self.outputs.field(k).is_none()) {
            return Err(ManifestError::UndeclaredExport {
                stack: self.name.clone(),
                key: key.clone(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::output::{OutputField, OutputKind};
    use serde_json::json;

    fn name(s: &str) -> StackName {
        StackName::new(s).unwrap()
    }

    #[test]
    fn parses_manifest_yaml() {
        let yaml = r#"
name: ecs
description: ECS cluster on Fargate
inputs:
  - stack: vpc
    outputs: [vpc_id]
  - stack: aurora
    outputs:
      - key: orangejuicedb_credentials_secret_arn
      - key: reader_endpoint
        required: false
        default: ""
config:
  container_insights: enabled
resources:
  - type: aws:ecs/cluster
    name: ecs-cluster
    properties:
      name: "cluster-${env}"
outputs:
  - name: cluster_arn
"#;
        let stack: Stack = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(stack.name, name("ecs"));
        assert_eq!(stack.project(), "ecs");
        assert_eq!(
            stack.dependencies().cloned().collect::<Vec<_>>(),
            vec![name("vpc"), name("aurora")]
        );

        let aurora = stack.reference(&name("aurora")).unwrap();
        assert!(aurora.requirement("orangejuicedb_credentials_secret_arn").unwrap().required);
        let optional = aurora.requirement("reader_endpoint").unwrap();
        assert!(!optional.required);
        assert_eq!(optional.default, Some(json!("")));

        assert_eq!(stack.config_value("container_insights"), Some(&json!("enabled")));
        assert_eq!(stack.resources[0].resource_type, "aws:ecs/cluster");
        assert!(stack.validate().is_ok());
    }

    #[test]
    fn bare_requirement_is_required() {
        let reference: StackReference =
            serde_yaml::from_str("stack: vpc\noutputs: [vpc_id, cidr_block]").unwrap();
        assert!(reference.outputs.iter().all(|r| r.required));
    }

    #[test]
    fn explicit_project_overrides_name() {
        let stack = Stack::new(name("users-api")).with_project("backend");
        assert_eq!(stack.project(), "backend");
    }

    #[test]
    fn validate_rejects_duplicate_reference() {
        let stack = Stack::new(name("ecs"))
            .with_input(StackReference::new(name("vpc")).require("vpc_id"))
            .with_input(StackReference::new(name("vpc")).require("cidr_block"));

        assert!(matches!(
            stack.validate(),
            Err(ManifestError::DuplicateReference { .. })
        ));
    }

    #[test]
    fn validate_rejects_duplicate_resource() {
        let stack = Stack::new(name("vpc"))
            .with_resource(ResourceDecl::new("aws:ec2/vpc", "vpc", json!({})))
            .with_resource(ResourceDecl::new("aws:ec2/vpc", "vpc", json!({})));

        assert!(matches!(
            stack.validate(),
            Err(ManifestError::DuplicateResource { .. })
        ));
    }

    #[test]
    fn validate_rejects_export_outside_schema() {
        let stack = Stack::new(name("vpc"))
            .with_outputs(OutputSchema::new(vec![OutputField::new("vpc_id", OutputKind::String)]))
            .with_export("cidr_block", json!("10.0.0.0/16"));

        assert_eq!(
            stack.validate(),
            Err(ManifestError::UndeclaredExport {
                stack: name("vpc"),
                key: "cidr_block".to_string()
            })
        );
    }

    #[test]
    fn status_transitions() {
        use StackStatus::*;

        assert!(Pending.can_transition_to(Planned));
        assert!(Planned.can_transition_to(Applying));
        assert!(Planned.can_transition_to(Applied));
        assert!(Applying.can_transition_to(Applied));
        assert!(Applying.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Applied));
        assert!(!Applied.can_transition_to(Applying));
        assert!(!Failed.can_transition_to(Applied));
    }
}
