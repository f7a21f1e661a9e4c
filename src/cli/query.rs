//! Read-only commands (stacks, graph, outputs, status, history)

use anyhow::{bail, Result};
use serde_json::json;

use super::app::open_project;
use super::apply::driver_for;
use super::output::Output;
use crate::domain::{DependencyGraph, StackName};

/// List declared stacks
pub fn stacks(output: &Output, env: Option<&str>) -> Result<()> {
    let project = open_project(env)?;
    let stacks = project.stacks()?;

    if output.is_json() {
        let items: Vec<_> = stacks
            .iter()
            .map(|s| {
                json!({
                    "name": s.name,
                    "project": s.project(),
                    "description": s.description,
                    "dependencies": s.dependencies().collect::<Vec<_>>(),
                    "resources": s.resources.len(),
                    "outputs": s.outputs.fields().iter().map(|f| &f.name).collect::<Vec<_>>(),
                })
            })
            .collect();
        output.data(&items);
        return Ok(());
    }

    if stacks.is_empty() {
        println!("No stacks declared. Add manifests to .stackctl/stacks/ or run 'stackctl init --sample'.");
        return Ok(());
    }

    output.header(&format!("{:<16} {:<12} {:<9} DEPENDS ON", "STACK", "PROJECT", "RESOURCES"), 70);
    for stack in &stacks {
        let deps: Vec<_> = stack.dependencies().map(StackName::as_str).collect();
        println!(
            "{:<16} {:<12} {:<9} {}",
            stack.name,
            stack.project(),
            stack.resources.len(),
            if deps.is_empty() { "-".to_string() } else { deps.join(", ") }
        );
    }

    Ok(())
}

/// Show the dependency graph in execution order
pub fn graph(output: &Output, env: Option<&str>) -> Result<()> {
    let project = open_project(env)?;
    let stacks = project.stacks()?;
    let graph = DependencyGraph::from_stacks(&stacks)?;
    let order = graph.execution_order()?;

    if output.is_json() {
        let items: Vec<_> = order
            .iter()
            .map(|name| {
                json!({
                    "stack": name,
                    "dependencies": graph.dependencies(name),
                    "dependents": graph.dependents(name),
                })
            })
            .collect();
        output.data(&json!({ "order": order, "stacks": items }));
        return Ok(());
    }

    println!("Execution order ({} stacks):", order.len());
    for (i, name) in order.iter().enumerate() {
        let deps = graph.dependencies(name);
        if deps.is_empty() {
            println!("{:>3}. {}", i + 1, name);
        } else {
            let deps: Vec<_> = deps.iter().map(StackName::as_str).collect();
            println!("{:>3}. {:<16} <- {}", i + 1, name, deps.join(", "));
        }
    }

    Ok(())
}

/// Show the published outputs of a stack
///
/// Sensitive values appear only as their `secret://` reference.
pub fn outputs(output: &Output, env: Option<&str>, stack: &StackName) -> Result<()> {
    let project = open_project(env)?;
    let declared = project.manifest_store().exists(stack);

    let Some(state) = project.state_store().get(stack)? else {
        if declared {
            bail!(
                "Stack '{}' has not been applied in environment '{}'",
                stack,
                project.environment()
            );
        }
        bail!("Stack '{}' is not declared", stack);
    };

    if output.is_json() {
        let values: serde_json::Map<_, _> = state
            .outputs
            .values
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        output.data(&json!({
            "stack": stack,
            "environment": project.environment(),
            "generation": state.generation(),
            "published_at": state.outputs.published_at,
            "outputs": values,
        }));
        return Ok(());
    }

    println!("{} ({}, {})", stack, project.environment(), state.generation());
    for (key, value) in &state.outputs.values {
        println!("  {:<40} {}", key, value);
    }

    Ok(())
}

/// Show applied generation and drift for every stack
pub fn status(output: &Output, env: Option<&str>) -> Result<()> {
    let project = open_project(env)?;
    let apply = &project.config().project.apply;
    let driver = driver_for(&project, apply.timeout(), apply.max_parallel)?;
    let order = driver.graph().execution_order()?;

    let rows: Vec<_> = order
        .iter()
        .map(|name| {
            let applied = driver.applied(name);
            let state = match driver.plan_stack(name) {
                Ok(plan) if plan.is_noop() => "in sync".to_string(),
                Ok(plan) if !plan.base_generation.is_applied() => "not applied".to_string(),
                Ok(plan) => format!("drifted: {}", plan.summary()),
                Err(e) => format!("waiting: {}", e),
            };
            (name, applied, state)
        })
        .collect();

    if output.is_json() {
        let items: Vec<_> = rows
            .iter()
            .map(|(name, applied, state)| {
                json!({
                    "stack": name,
                    "generation": applied.map(|a| a.generation()),
                    "applied_at": applied.map(|a| a.applied_at),
                    "state": state,
                })
            })
            .collect();
        output.data(&json!({
            "environment": project.environment(),
            "stacks": items,
        }));
        return Ok(());
    }

    println!("Environment: {}", project.environment());
    println!();
    output.header(&format!("{:<16} {:<5} {:<20} STATE", "STACK", "GEN", "APPLIED AT"), 70);
    for (name, applied, state) in rows {
        let (generation, applied_at) = match applied {
            Some(a) => (
                a.generation().to_string(),
                a.applied_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            ),
            None => ("-".to_string(), "-".to_string()),
        };
        println!("{:<16} {:<5} {:<20} {}", name, generation, applied_at, state);
    }

    Ok(())
}

/// Show recorded run outcomes
pub fn history(output: &Output, env: Option<&str>, stack: Option<&StackName>, limit: usize) -> Result<()> {
    let project = open_project(env)?;
    let entries = project.history()?.recent(project.environment(), stack, limit)?;

    if output.is_json() {
        output.data(&entries);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No runs recorded for environment '{}'.", project.environment());
        return Ok(());
    }

    output.header(
        &format!("{:<10} {:<20} {:<16} {:<10} {:<5} DETAIL", "RUN", "WHEN", "STACK", "OUTCOME", "GEN"),
        90,
    );
    for entry in &entries {
        println!(
            "{:<10} {:<20} {:<16} {:<10} {:<5} {}",
            entry.run_id.to_string(),
            entry.recorded_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            entry.stack.to_string(),
            entry.outcome,
            entry.generation.map(|g| format!("g{}", g)).unwrap_or_default(),
            entry.detail.as_deref().unwrap_or("")
        );
    }

    Ok(())
}
