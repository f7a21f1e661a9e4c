//! Reconciliation plans
//!
//! A plan diffs a stack's rendered resource declarations against the last
//! applied state. Resources are compared by fingerprint: a BLAKE3 hash over
//! the canonical JSON of `(type, name, properties)`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use super::id::{Generation, StackName};
use super::output::{OutputSchema, OutputSet};

/// Writes a JSON value with object keys sorted at every level
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// BLAKE3 fingerprint of a JSON value, independent of key order
pub fn fingerprint(value: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(value, &mut canonical);
    blake3::hash(canonical.as_bytes()).to_hex().to_string()
}

/// A resource declaration with every placeholder resolved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedResource {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub name: String,
    pub properties: Value,
    pub fingerprint: String,
}

impl RenderedResource {
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>, properties: Value) -> Self {
        let resource_type = resource_type.into();
        let name = name.into();
        let fingerprint = fingerprint(&json!({
            "type": resource_type,
            "name": name,
            "properties": properties,
        }));
        Self {
            resource_type,
            name,
            properties,
            fingerprint,
        }
    }
}

/// What is recorded about a resource after a successful apply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceState {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub name: String,
    pub fingerprint: String,
}

impl From<&RenderedResource> for ResourceState {
    fn from(resource: &RenderedResource) -> Self {
        Self {
            resource_type: resource.resource_type.clone(),
            name: resource.name.clone(),
            fingerprint: resource.fingerprint.clone(),
        }
    }
}

/// Last known applied state of one stack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedState {
    pub stack: StackName,
    pub applied_at: DateTime<Utc>,
    pub resources: Vec<ResourceState>,

    /// Fingerprint of the exports and output schema the outputs were produced for
    pub interface: String,

    pub outputs: OutputSet,
}

impl AppliedState {
    pub fn generation(&self) -> Generation {
        self.outputs.generation
    }
}

/// Operation planned for one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceOp {
    Create,
    Update,
    Delete,
    NoOp,
}

impl ResourceOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            ResourceOp::Create => "+",
            ResourceOp::Update => "~",
            ResourceOp::Delete => "-",
            ResourceOp::NoOp => " ",
        }
    }
}

/// One entry of a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceChange {
    pub op: ResourceOp,
    #[serde(rename = "type")]
    pub resource_type: String,
    pub name: String,
}

/// Counts of planned operations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSummary {
    pub create: usize,
    pub update: usize,
    pub delete: usize,
    pub unchanged: usize,
}

impl ChangeSummary {
    pub fn changed(&self) -> usize {
        self.create + self.update + self.delete
    }
}

impl fmt::Display for ChangeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to delete, {} unchanged",
            self.create, self.update, self.delete, self.unchanged
        )
    }
}

/// Ordered resource operations for one stack
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciliationPlan {
    pub stack: StackName,

    /// Generation of the last successful apply
    pub base_generation: Generation,

    pub changes: Vec<ResourceChange>,

    #[serde(skip)]
    pub resources: Vec<RenderedResource>,

    #[serde(skip)]
    pub exports: BTreeMap<String, Value>,

    pub interface: String,

    /// True when exports or the output schema differ from the last apply
    pub interface_changed: bool,
}

impl ReconciliationPlan {
    /// Diffs desired resources against the last applied state
    ///
    /// Creates, updates and no-ops follow declaration order; deletes follow,
    /// in reverse of the order they were first applied.
    pub fn compute(
        stack: StackName,
        resources: Vec<RenderedResource>,
        exports: BTreeMap<String, Value>,
        schema: &OutputSchema,
        applied: Option<&AppliedState>,
    ) -> Self {
        let interface = fingerprint(&json!({
            "exports": exports,
            "outputs": schema,
        }));

        let previous: HashMap<(&str, &str), &ResourceState> = applied
            .map(|a| {
                a.resources
                    .iter()
                    .map(|r| ((r.resource_type.as_str(), r.name.as_str()), r))
                    .collect()
            })
            .unwrap_or_default();

        let mut changes: Vec<ResourceChange> = resources
            .iter()
            .map(|r| {
                let op = match previous.get(&(r.resource_type.as_str(), r.name.as_str())) {
                    None => ResourceOp::Create,
                    Some(prev) if prev.fingerprint == r.fingerprint => ResourceOp::NoOp,
                    Some(_) => ResourceOp::Update,
                };
                ResourceChange {
                    op,
                    resource_type: r.resource_type.clone(),
                    name: r.name.clone(),
                }
            })
            .collect();

        if let Some(applied) = applied {
            for prev in applied.resources.iter().rev() {
                let still_desired = resources
                    .iter()
                    .any(|r| r.resource_type == prev.resource_type && r.name == prev.name);
                if !still_desired {
                    changes.push(ResourceChange {
                        op: ResourceOp::Delete,
                        resource_type: prev.resource_type.clone(),
                        name: prev.name.clone(),
                    });
                }
            }
        }

        let (base_generation, interface_changed) = match applied {
            Some(a) => (a.generation(), a.interface != interface),
            None => (Generation::NEVER_APPLIED, true),
        };

        Self {
            stack,
            base_generation,
            changes,
            resources,
            exports,
            interface,
            interface_changed,
        }
    }

    /// True when applying would change nothing and outputs can be reused
    pub fn is_noop(&self) -> bool {
        self.base_generation.is_applied()
            && !self.interface_changed
            && self.changes.iter().all(|c| c.op == ResourceOp::NoOp)
    }

    /// Generation the outputs will be published under if this plan is applied
    pub fn target_generation(&self) -> Generation {
        self.base_generation.next()
    }

    pub fn summary(&self) -> ChangeSummary {
        let mut summary = ChangeSummary::default();
        for change in &self.changes {
            match change.op {
                ResourceOp::Create => summary.create += 1,
                ResourceOp::Update => summary.update += 1,
                ResourceOp::Delete => summary.delete += 1,
                ResourceOp::NoOp => summary.unchanged += 1,
            }
        }
        summary
    }

    /// Resource states to record once this plan is applied
    pub fn resource_states(&self) -> Vec<ResourceState> {
        self.resources.iter().map(ResourceState::from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::output::{OutputField, OutputKind};

    fn name(s: &str) -> StackName {
        StackName::new(s).unwrap()
    }

    fn schema() -> OutputSchema {
        OutputSchema::new(vec![OutputField::new("vpc_id", OutputKind::String)])
    }

    fn resources() -> Vec<RenderedResource> {
        vec![
            RenderedResource::new("aws:ec2/vpc", "vpc", json!({"cidr_block": "10.0.0.0/16"})),
            RenderedResource::new("aws:ec2/securityGroup", "web-sg", json!({"port": 80})),
        ]
    }

    fn applied_from(plan: &ReconciliationPlan) -> AppliedState {
        AppliedState {
            stack: plan.stack.clone(),
            applied_at: Utc::now(),
            resources: plan.resource_states(),
            interface: plan.interface.clone(),
            outputs: OutputSet::new(plan.target_generation(), BTreeMap::new()),
        }
    }

    #[test]
    fn fingerprint_ignores_key_order() {
        let a: Value = serde_json::from_str(r#"{"a": 1, "b": {"x": [1, 2], "y": null}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"b": {"y": null, "x": [1, 2]}, "a": 1}"#).unwrap();
        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_ne!(fingerprint(&a), fingerprint(&json!({"a": 2})));
    }

    #[test]
    fn first_plan_creates_everything() {
        let plan = ReconciliationPlan::compute(name("vpc"), resources(), BTreeMap::new(), &schema(), None);

        assert_eq!(plan.base_generation, Generation::NEVER_APPLIED);
        assert_eq!(plan.target_generation(), Generation::new(1));
        assert!(plan.changes.iter().all(|c| c.op == ResourceOp::Create));
        assert!(!plan.is_noop());
        assert_eq!(plan.summary().create, 2);
    }

    #[test]
    fn empty_stack_still_applies_once() {
        let plan = ReconciliationPlan::compute(name("github"), vec![], BTreeMap::new(), &schema(), None);
        assert!(plan.changes.is_empty());
        assert!(!plan.is_noop());
    }

    #[test]
    fn unchanged_declarations_are_noop() {
        let first = ReconciliationPlan::compute(name("vpc"), resources(), BTreeMap::new(), &schema(), None);
        let applied = applied_from(&first);

        let second =
            ReconciliationPlan::compute(name("vpc"), resources(), BTreeMap::new(), &schema(), Some(&applied));

        assert!(second.is_noop());
        assert_eq!(second.base_generation, Generation::new(1));
        assert_eq!(second.summary().unchanged, 2);
    }

    #[test]
    fn detects_update_create_and_delete() {
        let first = ReconciliationPlan::compute(name("vpc"), resources(), BTreeMap::new(), &schema(), None);
        let applied = applied_from(&first);

        let desired = vec![
            RenderedResource::new("aws:ec2/vpc", "vpc", json!({"cidr_block": "10.1.0.0/16"})),
            RenderedResource::new("aws:ec2/natGateway", "nat", json!({})),
        ];
        let plan = ReconciliationPlan::compute(name("vpc"), desired, BTreeMap::new(), &schema(), Some(&applied));

        let ops: Vec<_> = plan.changes.iter().map(|c| (c.op, c.name.as_str())).collect();
        assert_eq!(
            ops,
            vec![
                (ResourceOp::Update, "vpc"),
                (ResourceOp::Create, "nat"),
                (ResourceOp::Delete, "web-sg"),
            ]
        );
        assert_eq!(plan.summary().changed(), 3);
        assert!(!plan.is_noop());
    }

    #[test]
    fn export_change_forces_apply() {
        let first = ReconciliationPlan::compute(name("vpc"), resources(), BTreeMap::new(), &schema(), None);
        let applied = applied_from(&first);

        let mut exports = BTreeMap::new();
        exports.insert("vpc_id".to_string(), json!("vpc-2"));
        let plan = ReconciliationPlan::compute(name("vpc"), resources(), exports, &schema(), Some(&applied));

        assert!(plan.interface_changed);
        assert!(!plan.is_noop());
        assert_eq!(plan.summary().changed(), 0);
    }

    #[test]
    fn summary_display() {
        let summary = ChangeSummary {
            create: 1,
            update: 2,
            delete: 0,
            unchanged: 3,
        };
        assert_eq!(
            summary.to_string(),
            "1 to create, 2 to update, 0 to delete, 3 unchanged"
        );
    }
}
