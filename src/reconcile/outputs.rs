//! Shared output store
//!
//! Holds the last published [`OutputSet`] of every stack in a run. Each stack
//! has its own slot guarded by a mutex: readers take a cheap `Arc` clone of
//! the current set, and a publish swaps the whole set at once so a reader
//! never observes a half-written generation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::domain::{
    Generation, OutputSchema, OutputSet, OutputValue, ResolvedInputs, SchemaError, Stack,
    StackName,
};

#[derive(Debug, Error, PartialEq)]
pub enum OutputError {
    #[error("Stack '{stack}' has not published required output '{key}'")]
    MissingRequiredOutput { stack: StackName, key: String },

    #[error("Stack '{stack}' already published generation {generation} or later")]
    DuplicatePublish {
        stack: StackName,
        generation: Generation,
    },

    #[error("Another publish for stack '{0}' is in progress")]
    ConcurrentPublish(StackName),

    #[error("Outputs of stack '{stack}' do not match its schema: {source}")]
    Schema {
        stack: StackName,
        #[source]
        source: SchemaError,
    },

    #[error("Stack '{0}' is not part of this run")]
    UnknownStack(StackName),
}

struct Slot {
    schema: OutputSchema,
    current: Mutex<Option<Arc<OutputSet>>>,
}

impl Slot {
    fn lock(&self) -> MutexGuard<'_, Option<Arc<OutputSet>>> {
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Checks a candidate set against the current one and the schema
    fn admit(&self, stack: &StackName, current: Option<&OutputSet>, outputs: &OutputSet) -> Result<(), OutputError> {
        if let Some(existing) = current {
            if outputs.generation <= existing.generation {
                return Err(OutputError::DuplicatePublish {
                    stack: stack.clone(),
                    generation: outputs.generation,
                });
            }
        }

        self.schema
            .validate_published(&outputs.values)
            .map_err(|source| OutputError::Schema {
                stack: stack.clone(),
                source,
            })
    }
}

/// Published outputs for every stack of a run
pub struct OutputStore {
    slots: HashMap<StackName, Slot>,
}

impl OutputStore {
    /// Creates empty slots for the given stacks
    pub fn for_stacks<'a>(stacks: impl IntoIterator<Item = &'a Stack>) -> Self {
        let slots = stacks
            .into_iter()
            .map(|stack| {
                (
                    stack.name.clone(),
                    Slot {
                        schema: stack.outputs.clone(),
                        current: Mutex::new(None),
                    },
                )
            })
            .collect();

        Self { slots }
    }

    fn slot(&self, stack: &StackName) -> Result<&Slot, OutputError> {
        self.slots
            .get(stack)
            .ok_or_else(|| OutputError::UnknownStack(stack.clone()))
    }

    /// Publishes a complete output set, replacing the previous generation
    ///
    /// The set must match the stack's schema with sensitive values held by
    /// reference, and its generation must be newer than the current one.
    pub fn publish(&self, stack: &StackName, outputs: OutputSet) -> Result<Arc<OutputSet>, OutputError> {
        let slot = self.slot(stack)?;

        let mut current = match slot.current.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                return Err(OutputError::ConcurrentPublish(stack.clone()));
            }
        };

        slot.admit(stack, current.as_deref(), &outputs)?;

        debug!(stack = %stack, generation = %outputs.generation, keys = outputs.len(), "published outputs");

        let published = Arc::new(outputs);
        *current = Some(Arc::clone(&published));
        Ok(published)
    }

    /// Runs the checks [`publish`](Self::publish) would, without publishing
    pub fn check(&self, stack: &StackName, outputs: &OutputSet) -> Result<(), OutputError> {
        let slot = self.slot(stack)?;
        let current = slot.lock().clone();
        slot.admit(stack, current.as_deref(), outputs)
    }

    /// Seeds a slot with outputs persisted by an earlier run
    ///
    /// Unlike [`publish`](Self::publish) this skips schema checks: a schema
    /// edited since that apply makes the next plan re-apply the stack anyway.
    pub fn restore(&self, stack: &StackName, outputs: OutputSet) -> Result<(), OutputError> {
        let slot = self.slot(stack)?;
        *slot.lock() = Some(Arc::new(outputs));
        Ok(())
    }

    /// Current output set of a stack, if it has published one
    pub fn snapshot(&self, stack: &StackName) -> Option<Arc<OutputSet>> {
        self.slots.get(stack).and_then(|slot| slot.lock().clone())
    }

    /// Generation of the current output set
    pub fn generation(&self, stack: &StackName) -> Generation {
        self.snapshot(stack)
            .map(|set| set.generation)
            .unwrap_or(Generation::NEVER_APPLIED)
    }

    /// Returns a published value, failing if it is absent
    pub fn require(&self, stack: &StackName, key: &str) -> Result<OutputValue, OutputError> {
        self.slot(stack)?;

        self.snapshot(stack)
            .and_then(|set| set.get(key).cloned())
            .ok_or_else(|| OutputError::MissingRequiredOutput {
                stack: stack.clone(),
                key: key.to_string(),
            })
    }

    /// Returns a published value or the given default; never fails
    pub fn optional(&self, stack: &StackName, key: &str, default: impl Into<OutputValue>) -> OutputValue {
        self.snapshot(stack)
            .and_then(|set| set.get(key).cloned())
            .unwrap_or_else(|| default.into())
    }

    /// Resolves every upstream value a stack declares
    ///
    /// Optional keys without a default resolve to nothing and render as null.
    pub fn resolve_inputs(&self, stack: &Stack) -> Result<ResolvedInputs, OutputError> {
        let mut inputs = ResolvedInputs::new();

        for reference in &stack.inputs {
            for requirement in &reference.outputs {
                let value = if requirement.required {
                    Some(self.require(&reference.stack, &requirement.key)?)
                } else {
                    match &requirement.default {
                        Some(default) => Some(self.optional(
                            &reference.stack,
                            &requirement.key,
                            default.clone(),
                        )),
                        None => self
                            .snapshot(&reference.stack)
                            .and_then(|set| set.get(&requirement.key).cloned()),
                    }
                };

                inputs.insert(
                    reference.stack.clone(),
                    requirement.key.clone(),
                    value.map(|v| v.to_json()).unwrap_or(Value::Null),
                );
            }
        }

        Ok(inputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OutputField, OutputKind, SecretRef, StackReference};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn name(s: &str) -> StackName {
        StackName::new(s).unwrap()
    }

    fn vpc() -> Stack {
        Stack::new(name("vpc")).with_outputs(OutputSchema::new(vec![
            OutputField::new("vpc_id", OutputKind::String),
            OutputField::new("public_subnet_ids", OutputKind::List),
        ]))
    }

    fn aurora() -> Stack {
        Stack::new(name("aurora"))
            .with_input(
                StackReference::new(name("vpc"))
                    .require("vpc_id")
                    .optional("nat_gateway_id", Some(json!("none"))),
            )
            .with_outputs(OutputSchema::new(vec![
                OutputField::new("db_secret_arn", OutputKind::String).sensitive(),
            ]))
    }

    fn vpc_outputs(generation: u64) -> OutputSet {
        let mut values = BTreeMap::new();
        values.insert("vpc_id".to_string(), OutputValue::from(json!("vpc-123")));
        values.insert(
            "public_subnet_ids".to_string(),
            OutputValue::from(json!(["subnet-a", "subnet-b"])),
        );
        OutputSet::new(Generation::new(generation), values)
    }

    #[test]
    fn publish_then_require() {
        let store = OutputStore::for_stacks(&[vpc(), aurora()]);
        store.publish(&name("vpc"), vpc_outputs(1)).unwrap();

        let value = store.require(&name("vpc"), "vpc_id").unwrap();
        assert_eq!(value.as_str(), Some("vpc-123"));
        assert_eq!(store.generation(&name("vpc")), Generation::new(1));
    }

    #[test]
    fn require_before_publish_fails() {
        let store = OutputStore::for_stacks(&[vpc()]);

        assert_eq!(
            store.require(&name("vpc"), "vpc_id"),
            Err(OutputError::MissingRequiredOutput {
                stack: name("vpc"),
                key: "vpc_id".to_string()
            })
        );
    }

    #[test]
    fn optional_falls_back_to_default() {
        let store = OutputStore::for_stacks(&[vpc()]);

        let value = store.optional(&name("vpc"), "nat_gateway_id", json!("none"));
        assert_eq!(value.as_str(), Some("none"));

        let unknown = store.optional(&name("dns"), "zone_id", json!(null));
        assert_eq!(unknown.to_json(), json!(null));
    }

    #[test]
    fn stale_generation_is_rejected() {
        let store = OutputStore::for_stacks(&[vpc()]);
        store.publish(&name("vpc"), vpc_outputs(2)).unwrap();

        for generation in [1, 2] {
            assert_eq!(
                store.publish(&name("vpc"), vpc_outputs(generation)).unwrap_err(),
                OutputError::DuplicatePublish {
                    stack: name("vpc"),
                    generation: Generation::new(generation)
                }
            );
        }
        store.publish(&name("vpc"), vpc_outputs(3)).unwrap();
    }

    #[test]
    fn check_leaves_the_slot_alone() {
        let store = OutputStore::for_stacks(&[vpc()]);
        store.publish(&name("vpc"), vpc_outputs(1)).unwrap();

        store.check(&name("vpc"), &vpc_outputs(2)).unwrap();
        assert_eq!(store.generation(&name("vpc")), Generation::new(1));
        assert!(matches!(
            store.check(&name("vpc"), &vpc_outputs(1)),
            Err(OutputError::DuplicatePublish { .. })
        ));

        store.publish(&name("vpc"), vpc_outputs(2)).unwrap();
    }

    #[test]
    fn publish_while_slot_is_held_fails() {
        let store = OutputStore::for_stacks(&[vpc()]);
        let slot = store.slot(&name("vpc")).unwrap();
        let _held = slot.lock();

        assert_eq!(
            store.publish(&name("vpc"), vpc_outputs(1)).unwrap_err(),
            OutputError::ConcurrentPublish(name("vpc"))
        );
    }

    #[test]
    fn incomplete_set_is_rejected() {
        let store = OutputStore::for_stacks(&[vpc()]);
        let mut values = BTreeMap::new();
        values.insert("vpc_id".to_string(), OutputValue::from(json!("vpc-123")));

        let err = store
            .publish(&name("vpc"), OutputSet::new(Generation::new(1), values))
            .unwrap_err();
        assert!(matches!(err, OutputError::Schema { .. }));
        assert!(store.snapshot(&name("vpc")).is_none());
    }

    #[test]
    fn readers_keep_their_snapshot_across_publish() {
        let store = OutputStore::for_stacks(&[vpc()]);
        store.publish(&name("vpc"), vpc_outputs(1)).unwrap();

        let before = store.snapshot(&name("vpc")).unwrap();
        store.publish(&name("vpc"), vpc_outputs(2)).unwrap();

        assert_eq!(before.generation, Generation::new(1));
        assert_eq!(store.generation(&name("vpc")), Generation::new(2));
    }

    #[test]
    fn resolve_inputs_uses_defaults_for_optional_keys() {
        let store = OutputStore::for_stacks(&[vpc(), aurora()]);
        store.publish(&name("vpc"), vpc_outputs(1)).unwrap();

        let inputs = store.resolve_inputs(&aurora()).unwrap();
        assert_eq!(inputs.get("vpc", "vpc_id"), Some(&json!("vpc-123")));
        assert_eq!(inputs.get("vpc", "nat_gateway_id"), Some(&json!("none")));
    }

    #[test]
    fn resolve_inputs_reports_missing_upstream() {
        let store = OutputStore::for_stacks(&[vpc(), aurora()]);

        let err = store.resolve_inputs(&aurora()).unwrap_err();
        assert_eq!(
            err,
            OutputError::MissingRequiredOutput {
                stack: name("vpc"),
                key: "vpc_id".to_string()
            }
        );
    }

    #[test]
    fn secrets_resolve_to_references() {
        let ecs = Stack::new(name("ecs"))
            .with_input(StackReference::new(name("aurora")).require("db_secret_arn"));
        let store = OutputStore::for_stacks(&[vpc(), aurora(), ecs.clone()]);

        let reference = SecretRef::new("dev", &name("aurora"), "db_secret_arn", Generation::new(1));
        let mut values = BTreeMap::new();
        values.insert("db_secret_arn".to_string(), OutputValue::Secret(reference.clone()));
        store
            .publish(&name("aurora"), OutputSet::new(Generation::new(1), values))
            .unwrap();

        let inputs = store.resolve_inputs(&ecs).unwrap();
        assert_eq!(
            inputs.get("aurora", "db_secret_arn"),
            Some(&json!(reference.as_str()))
        );
    }
}
