//! Plan and apply commands

use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::warn;

use super::app::open_project;
use super::output::Output;
use crate::domain::{ReconciliationPlan, ResourceOp, StackName};
use crate::engine;
use crate::reconcile::{
    Approver, CancelSignal, Driver, DriverOptions, RunReport, Selection, StackOutcome,
};
use crate::storage::Project;

pub struct ApplyArgs {
    pub stacks: Vec<StackName>,
    pub all: bool,
    pub yes: bool,
    pub timeout: Option<u64>,
    pub max_parallel: Option<usize>,
}

/// Builds a driver over the project's stacks, seeded with recorded state
pub(super) fn driver_for(project: &Project, timeout: Option<Duration>, max_parallel: usize) -> Result<Driver> {
    let config = &project.config().project;
    let stacks = project.stacks()?;
    let engine = engine::from_config(&config.engine, project.root())?;
    let applied = project
        .state_store()
        .read_all()
        .context("Failed to read applied state")?;

    let options = DriverOptions {
        environment: project.environment().to_string(),
        org: config.org.clone(),
        timeout,
        max_parallel,
    };

    let driver = Driver::new(stacks, engine, Arc::new(project.secret_sink()), options)?
        .with_applied(applied.into_values())
        .with_state_store(project.state_store());

    Ok(driver)
}

fn print_changes(plan: &ReconciliationPlan, mut line: impl FnMut(String)) {
    for change in plan.changes.iter().filter(|c| c.op != ResourceOp::NoOp) {
        line(format!("  {} {} {}", change.op.symbol(), change.resource_type, change.name));
    }
    if plan.interface_changed && plan.base_generation.is_applied() {
        line("  ~ exports or output schema".to_string());
    }
}

/// Show what applying a stack would change
pub fn plan(output: &Output, env: Option<&str>, stack: &StackName) -> Result<()> {
    let project = open_project(env)?;
    let apply = &project.config().project.apply;
    let driver = driver_for(&project, apply.timeout(), apply.max_parallel)?;

    if driver.stack(stack).is_none() {
        bail!("Stack '{}' is not declared", stack);
    }

    let plan = driver
        .plan_stack(stack)
        .with_context(|| format!("Failed to plan stack '{}'", stack))?;

    if output.is_json() {
        output.data(&serde_json::json!({
            "plan": plan,
            "summary": plan.summary(),
            "noop": plan.is_noop(),
        }));
        return Ok(());
    }

    if plan.is_noop() {
        println!(
            "{} ({}) is up to date: {}",
            stack,
            plan.base_generation,
            plan.summary()
        );
        return Ok(());
    }

    println!(
        "Plan for {} ({} -> {}):",
        stack,
        plan.base_generation,
        plan.target_generation()
    );
    print_changes(&plan, |line| println!("{}", line));
    println!();
    println!("{}", plan.summary());

    Ok(())
}

/// Asks on stderr before each apply
///
/// The answer is read on a blocking thread so an interrupt can abandon the
/// prompt without waiting for Enter.
struct PromptApprover {
    cancel: CancelSignal,
}

impl PromptApprover {
    fn new(cancel: CancelSignal) -> Self {
        Self { cancel }
    }
}

#[async_trait]
impl Approver for PromptApprover {
    async fn approve(&mut self, plan: &ReconciliationPlan) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }

        eprintln!(
            "{} ({} -> {}): {}",
            plan.stack,
            plan.base_generation,
            plan.target_generation(),
            plan.summary()
        );
        print_changes(plan, |line| eprintln!("{}", line));
        eprint!("Apply {}? [y/N] ", plan.stack);
        let _ = io::stderr().flush();

        let read = tokio::task::spawn_blocking(|| {
            let mut answer = String::new();
            io::stdin().lock().read_line(&mut answer).map(|_| answer)
        });

        tokio::select! {
            answer = read => match answer {
                Ok(Ok(answer)) => matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
                _ => false,
            },
            _ = self.cancel.cancelled() => {
                eprintln!();
                false
            }
        }
    }
}

/// Apply stacks in dependency order
pub fn apply(output: &Output, env: Option<&str>, args: ApplyArgs) -> Result<()> {
    let project = open_project(env)?;
    let apply = &project.config().project.apply;

    let timeout = match args.timeout {
        Some(0) => None,
        Some(secs) => Some(Duration::from_secs(secs)),
        None => apply.timeout(),
    };
    let max_parallel = args.max_parallel.unwrap_or(apply.max_parallel);

    let (handle, signal) = CancelSignal::pair();
    let mut driver = driver_for(&project, timeout, max_parallel)?;
    if !(args.yes || apply.auto_approve) {
        driver = driver.with_approver(Box::new(PromptApprover::new(signal.clone())));
    }

    let selection = if args.all {
        Selection::All
    } else {
        Selection::Only(args.stacks)
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    let result = runtime.block_on(async {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, cancelling in-flight applies");
                handle.cancel();
            }
        });
        driver.run(selection, signal).await
    });
    // An abandoned prompt may still be blocked on stdin
    runtime.shutdown_background();
    let report = result?;

    match project.history() {
        Ok(mut history) => {
            if let Err(e) = history.record(&report.history_entries()) {
                warn!(error = %format!("{:#}", e), "failed to record run history");
            }
        }
        Err(e) => warn!(error = %format!("{:#}", e), "failed to open run history"),
    }

    print_report(output, &report);
    check_report(&report)
}

fn print_report(output: &Output, report: &RunReport) {
    if output.is_json() {
        output.data(report);
        return;
    }

    for stack in &report.stacks {
        let generation = stack
            .outcome
            .generation()
            .map(|g| g.to_string())
            .unwrap_or_default();
        let detail = stack.outcome.detail().unwrap_or_default();
        println!(
            "{:<16} {:<10} {:<4} {}",
            stack.stack,
            stack.outcome.label(),
            generation,
            detail
        );
    }

    let count = |label: &str| {
        report
            .stacks
            .iter()
            .filter(|s| s.outcome.label() == label)
            .count()
    };
    println!();
    println!(
        "Run {} ({}): {} applied, {} unchanged, {} failed, {} blocked",
        report.run_id,
        report.environment,
        count("applied"),
        count("unchanged"),
        count("failed"),
        count("blocked")
    );
}

/// Turns failed or cancelled runs into an error naming the stacks
fn check_report(report: &RunReport) -> Result<()> {
    let failed: Vec<String> = report
        .failures()
        .map(|(stack, error)| format!("{}: {}", stack, error))
        .collect();

    if !failed.is_empty() {
        bail!(
            "{} stack(s) failed in run {}\n  {}",
            failed.len(),
            report.run_id,
            failed.join("\n  ")
        );
    }

    let skipped: Vec<&str> = report
        .stacks
        .iter()
        .filter(|s| matches!(s.outcome, StackOutcome::Skipped))
        .map(|s| s.stack.as_str())
        .collect();
    if !skipped.is_empty() {
        bail!("Run {} was cancelled before applying: {}", report.run_id, skipped.join(", "));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OutputSchema;
    use std::collections::BTreeMap;

    fn plan() -> ReconciliationPlan {
        ReconciliationPlan::compute(
            StackName::new("vpc").unwrap(),
            Vec::new(),
            BTreeMap::new(),
            &OutputSchema::default(),
            None,
        )
    }

    #[tokio::test]
    async fn prompt_is_skipped_once_cancelled() {
        let (handle, signal) = CancelSignal::pair();
        handle.cancel();

        let mut approver = PromptApprover::new(signal);
        assert!(!approver.approve(&plan()).await);
    }
}
