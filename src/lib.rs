//! stackctl - dependency-ordered infrastructure stacks
//!
//! Stacks are units of infrastructure that publish typed outputs and read
//! the outputs of other stacks. stackctl builds the dependency graph those
//! references imply, applies stacks in a valid order (independent branches
//! in parallel), and hands each stack the published outputs of its
//! upstreams. Sensitive outputs travel only as `secret://` references.

pub mod cli;
pub mod domain;
pub mod engine;
pub mod reconcile;
pub mod storage;

pub use domain::{DependencyGraph, Generation, Stack, StackName, StackStatus};
pub use reconcile::{Driver, DriverOptions, OutputStore, RunReport};
