//! Placeholder rendering for resource declarations
//!
//! Resource properties and exports may reference values with `${...}`:
//!
//! | Placeholder | Resolves to |
//! |-------------|-------------|
//! | `${env}` | environment name (e.g. `dev`) |
//! | `${stack}` / `${project}` | the stack's name / project |
//! | `${org}` | organization, if configured |
//! | `${config.KEY}` | the stack's own config value |
//! | `${STACK.KEY}` | an upstream output declared in `inputs` |
//!
//! A string that is exactly one placeholder takes the referenced value with
//! its JSON type. Placeholders embedded in longer strings interpolate as
//! text. `$${` escapes a literal `${`.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

use super::id::StackName;
use super::stack::Stack;

#[derive(Debug, Error, PartialEq)]
pub enum RenderError {
    #[error("Unterminated placeholder in '{0}'")]
    Unterminated(String),

    #[error("Unknown placeholder '${{{0}}}'")]
    UnknownPlaceholder(String),

    #[error("Stack '{stack}' has no config value '{key}'")]
    MissingConfig { stack: StackName, key: String },

    #[error("Stack '{stack}' references '{reference}' which is not declared in its inputs")]
    UndeclaredInput { stack: StackName, reference: String },

    #[error("No organization configured for '${{org}}'")]
    MissingOrg,
}

/// Snapshot of upstream outputs resolved for one consuming stack
///
/// Secret outputs appear by reference only.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedInputs {
    values: BTreeMap<StackName, BTreeMap<String, Value>>,
}

impl ResolvedInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, stack: StackName, key: impl Into<String>, value: Value) {
        self.values.entry(stack).or_default().insert(key.into(), value);
    }

    pub fn get(&self, stack: &str, key: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(name, _)| name.as_str() == stack)
            .and_then(|(_, keys)| keys.get(key))
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Everything a stack's declarations may reference
pub struct RenderContext<'a> {
    pub environment: &'a str,
    pub org: Option<&'a str>,
    pub stack: &'a Stack,
    pub inputs: &'a ResolvedInputs,
}

impl<'a> RenderContext<'a> {
    pub fn new(environment: &'a str, stack: &'a Stack, inputs: &'a ResolvedInputs) -> Self {
        Self {
            environment,
            org: None,
            stack,
            inputs,
        }
    }

    pub fn with_org(mut self, org: Option<&'a str>) -> Self {
        self.org = org;
        self
    }

    /// Renders every placeholder in a JSON value
    pub fn render(&self, value: &Value) -> Result<Value, RenderError> {
        match value {
            Value::String(s) => self.render_str(s),
            Value::Array(items) => items
                .iter()
                .map(|v| self.render(v))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut rendered = Map::new();
                for (k, v) in map {
                    rendered.insert(k.clone(), self.render(v)?);
                }
                Ok(Value::Object(rendered))
            }
            other => Ok(other.clone()),
        }
    }

    /// Renders a map of values (e.g. exports)
    pub fn render_map(&self, map: &BTreeMap<String, Value>) -> Result<BTreeMap<String, Value>, RenderError> {
        map.iter()
            .map(|(k, v)| Ok((k.clone(), self.render(v)?)))
            .collect()
    }

    fn render_str(&self, s: &str) -> Result<Value, RenderError> {
        // Whole-string placeholder keeps the value's type
        if let Some(expr) = s.strip_prefix("${").and_then(|rest| rest.strip_suffix('}')) {
            if !expr.contains('{') && !expr.contains('}') {
                return self.lookup(expr.trim());
            }
        }

        let mut out = String::with_capacity(s.len());
        let mut rest = s;

        while let Some(pos) = rest.find('$') {
            out.push_str(&rest[..pos]);
            let tail = &rest[pos..];

            if let Some(after) = tail.strip_prefix("$${") {
                out.push_str("${");
                rest = after;
            } else if let Some(after) = tail.strip_prefix("${") {
                let end = after
                    .find('}')
                    .ok_or_else(|| RenderError::Unterminated(s.to_string()))?;
                match self.lookup(after[..end].trim())? {
                    Value::String(v) => out.push_str(&v),
                    other => out.push_str(&other.to_string()),
                }
                rest = &after[end + 1..];
            } else {
                out.push('$');
                rest = &tail[1..];
            }
        }
        out.push_str(rest);

        Ok(Value::String(out))
    }

    fn lookup(&self, expr: &str) -> Result<Value, RenderError> {
        match expr {
            "env" => return Ok(Value::String(self.environment.to_string())),
            "stack" => return Ok(Value::String(self.stack.name.to_string())),
            "project" => return Ok(Value::String(self.stack.project().to_string())),
            "org" => {
                return self
                    .org
                    .map(|o| Value::String(o.to_string()))
                    .ok_or(RenderError::MissingOrg)
            }
            _ => {}
        }

        let (head, key) = expr
            .split_once('.')
            .ok_or_else(|| RenderError::UnknownPlaceholder(expr.to_string()))?;

        if head == "config" {
            return self
                .stack
                .config_value(key)
                .cloned()
                .ok_or_else(|| RenderError::MissingConfig {
                    stack: self.stack.name.clone(),
                    key: key.to_string(),
                });
        }

        let declared = self
            .stack
            .inputs
            .iter()
            .any(|r| r.stack.as_str() == head && r.requirement(key).is_some());
        if !declared {
            return Err(RenderError::UndeclaredInput {
                stack: self.stack.name.clone(),
                reference: expr.to_string(),
            });
        }

        // Optional inputs without a default resolve to null
        Ok(self.inputs.get(head, key).cloned().unwrap_or(Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::stack::StackReference;
    use serde_json::json;

    fn name(s: &str) -> StackName {
        StackName::new(s).unwrap()
    }

    fn ecs_stack() -> Stack {
        Stack::new(name("ecs"))
            .with_input(
                StackReference::new(name("vpc"))
                    .require("vpc_id")
                    .require("public_subnet_ids")
                    .optional("flow_logs", None),
            )
            .with_config("fargate_base", json!(1))
            .with_config("container_insights", json!("enabled"))
    }

    fn inputs() -> ResolvedInputs {
        let mut inputs = ResolvedInputs::new();
        inputs.insert(name("vpc"), "vpc_id", json!("vpc-0abc"));
        inputs.insert(name("vpc"), "public_subnet_ids", json!(["subnet-a", "subnet-b"]));
        inputs
    }

    #[test]
    fn whole_placeholder_keeps_type() {
        let stack = ecs_stack();
        let inputs = inputs();
        let ctx = RenderContext::new("dev", &stack, &inputs);

        assert_eq!(
            ctx.render(&json!("${vpc.public_subnet_ids}")).unwrap(),
            json!(["subnet-a", "subnet-b"])
        );
        assert_eq!(ctx.render(&json!("${config.fargate_base}")).unwrap(), json!(1));
    }

    #[test]
    fn embedded_placeholders_interpolate() {
        let stack = ecs_stack();
        let inputs = inputs();
        let ctx = RenderContext::new("dev", &stack, &inputs).with_org(Some("acme"));

        assert_eq!(
            ctx.render(&json!("cluster-${env}-${stack}")).unwrap(),
            json!("cluster-dev-ecs")
        );
        assert_eq!(
            ctx.render(&json!("${org}/vpc/${env}")).unwrap(),
            json!("acme/vpc/dev")
        );
        assert_eq!(
            ctx.render(&json!("base=${config.fargate_base}")).unwrap(),
            json!("base=1")
        );
    }

    #[test]
    fn renders_nested_structures() {
        let stack = ecs_stack();
        let inputs = inputs();
        let ctx = RenderContext::new("dev", &stack, &inputs);

        let rendered = ctx
            .render(&json!({
                "vpc": "${vpc.vpc_id}",
                "settings": [{"name": "containerInsights", "value": "${config.container_insights}"}],
                "port": 80
            }))
            .unwrap();

        assert_eq!(
            rendered,
            json!({
                "vpc": "vpc-0abc",
                "settings": [{"name": "containerInsights", "value": "enabled"}],
                "port": 80
            })
        );
    }

    #[test]
    fn escape_produces_literal() {
        let stack = ecs_stack();
        let inputs = inputs();
        let ctx = RenderContext::new("dev", &stack, &inputs);

        assert_eq!(ctx.render(&json!("cost: $5 $${env}")).unwrap(), json!("cost: $5 ${env}"));
    }

    #[test]
    fn optional_input_without_value_is_null() {
        let stack = ecs_stack();
        let inputs = inputs();
        let ctx = RenderContext::new("dev", &stack, &inputs);

        assert_eq!(ctx.render(&json!("${vpc.flow_logs}")).unwrap(), Value::Null);
    }

    #[test]
    fn undeclared_input_fails() {
        let stack = ecs_stack();
        let inputs = inputs();
        let ctx = RenderContext::new("dev", &stack, &inputs);

        assert!(matches!(
            ctx.render(&json!("${vpc.cidr_block}")),
            Err(RenderError::UndeclaredInput { .. })
        ));
        assert!(matches!(
            ctx.render(&json!("${aurora.secret}")),
            Err(RenderError::UndeclaredInput { .. })
        ));
    }

    #[test]
    fn missing_config_and_bad_syntax_fail() {
        let stack = ecs_stack();
        let inputs = inputs();
        let ctx = RenderContext::new("dev", &stack, &inputs);

        assert_eq!(
            ctx.render(&json!("${config.nope}")),
            Err(RenderError::MissingConfig {
                stack: name("ecs"),
                key: "nope".to_string()
            })
        );
        assert!(matches!(
            ctx.render(&json!("x-${env")),
            Err(RenderError::Unterminated(_))
        ));
        assert!(matches!(
            ctx.render(&json!("${whatever}")),
            Err(RenderError::UnknownPlaceholder(_))
        ));
        assert_eq!(ctx.render(&json!("${org}")), Err(RenderError::MissingOrg));
    }
}
