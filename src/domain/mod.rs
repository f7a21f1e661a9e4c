//! Domain models for stackctl
//!
//! Stacks, their dependency graph, output schemas and reconciliation plans.
//! Contains no I/O.

mod graph;
mod id;
mod output;
mod plan;
mod render;
mod stack;

pub use graph::{DependencyGraph, GraphError};
pub use id::{Generation, IdError, RunId, StackName};
pub use output::{
    OutputField, OutputKind, OutputSchema, OutputSet, OutputValue, SchemaError, SecretRef,
    Sensitive,
};
pub use plan::{
    fingerprint, AppliedState, ChangeSummary, ReconciliationPlan, RenderedResource, ResourceChange,
    ResourceOp, ResourceState,
};
pub use render::{RenderContext, RenderError, ResolvedInputs};
pub use stack::{
    ManifestError, OutputRequirement, ResourceDecl, Stack, StackReference, StackStatus,
};
