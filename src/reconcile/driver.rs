//! Reconciliation driver
//!
//! Walks the dependency graph and applies every stack whose dependencies are
//! applied. Independent stacks run concurrently up to `max_parallel`; a stack
//! starts only after each upstream it reads has published outputs in this
//! run (or in an earlier one, when the upstream is outside the selection).
//!
//! Per stack the lifecycle is
//!
//! ```text
//! PENDING -> PLANNED -> APPLYING -> APPLIED
//!               |           |
//!               |           +----> FAILED
//!               +-> APPLIED (no-op, outputs reused)
//! ```
//!
//! A failed stack blocks its transitive dependents, which stay PENDING.
//! Unrelated branches keep going.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{Id, JoinSet};
use tracing::{debug, info, warn};

use super::outputs::{OutputError, OutputStore};
use super::report::{RunReport, StackOutcome, StackReport};
use crate::domain::{
    AppliedState, DependencyGraph, Generation, GraphError, OutputSet, OutputValue,
    ReconciliationPlan, RenderContext, RenderError, RenderedResource, RunId, SchemaError,
    Sensitive, Stack, StackName, StackStatus,
};
use crate::engine::{ApplyRequest, ApplyResponse, EngineError, ProvisioningEngine};
use crate::storage::{SecretError, SecretSink, StateStore};

/// Why a stack could not be planned
#[derive(Debug, Error)]
pub enum PlanError {
    #[error(transparent)]
    Output(#[from] OutputError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("Stack not found: {0}")]
    UnknownStack(StackName),
}

/// Why a stack did not reach APPLIED
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("Planning stack '{stack}' failed: {source}")]
    Plan {
        stack: StackName,
        #[source]
        source: PlanError,
    },

    #[error("Applying stack '{stack}' ({generation}) failed: {cause}")]
    ApplyFailed {
        stack: StackName,
        generation: Generation,
        #[source]
        cause: EngineError,
    },

    #[error("Apply of stack '{0}' was cancelled")]
    Cancelled(StackName),

    #[error("Apply of stack '{stack}' timed out after {}s", .after.as_secs())]
    Timeout { stack: StackName, after: Duration },

    #[error("Stack '{stack}' is blocked by failed dependency '{upstream}'")]
    BlockedByDependency {
        stack: StackName,
        upstream: StackName,
    },

    #[error("Stack '{stack}' returned invalid outputs: {source}")]
    InvalidOutputs {
        stack: StackName,
        #[source]
        source: SchemaError,
    },

    #[error("Publishing outputs of stack '{stack}' failed: {source}")]
    Publish {
        stack: StackName,
        #[source]
        source: OutputError,
    },

    #[error("Storing secret outputs of stack '{stack}' failed: {source}")]
    Secret {
        stack: StackName,
        #[source]
        source: SecretError,
    },

    #[error("Recording state of stack '{stack}' failed: {cause:#}")]
    State {
        stack: StackName,
        cause: anyhow::Error,
    },
}

impl ApplyError {
    pub fn stack(&self) -> &StackName {
        match self {
            ApplyError::Plan { stack, .. }
            | ApplyError::ApplyFailed { stack, .. }
            | ApplyError::Cancelled(stack)
            | ApplyError::Timeout { stack, .. }
            | ApplyError::BlockedByDependency { stack, .. }
            | ApplyError::InvalidOutputs { stack, .. }
            | ApplyError::Publish { stack, .. }
            | ApplyError::Secret { stack, .. }
            | ApplyError::State { stack, .. } => stack,
        }
    }
}

/// Errors that prevent a run from starting
#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("Unknown stack '{0}'")]
    UnknownStack(StackName),
}

/// Settings for one driver
#[derive(Debug, Clone)]
pub struct DriverOptions {
    pub environment: String,
    pub org: Option<String>,

    /// Per-stack apply timeout; `None` waits indefinitely
    pub timeout: Option<Duration>,

    pub max_parallel: usize,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            environment: "dev".to_string(),
            org: None,
            timeout: None,
            max_parallel: 4,
        }
    }
}

/// Which stacks a run covers
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    All,
    Only(Vec<StackName>),
}

/// Requests cancellation of a run
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Observes cancellation; cloned into every in-flight apply
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn pair() -> (CancelHandle, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx: Arc::new(tx) }, CancelSignal { rx })
    }

    /// A signal that never fires
    pub fn never() -> Self {
        let (_, rx) = watch::channel(false);
        CancelSignal { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes once cancellation is requested
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Sender gone without cancelling
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Decides whether a computed plan may be applied
#[async_trait]
pub trait Approver: Send {
    async fn approve(&mut self, plan: &ReconciliationPlan) -> bool;
}

/// Approves every plan
pub struct AutoApprove;

#[async_trait]
impl Approver for AutoApprove {
    async fn approve(&mut self, _plan: &ReconciliationPlan) -> bool {
        true
    }
}

enum Interrupted {
    Engine(EngineError),
    Timeout(Duration),
    Cancelled,
}

type TaskResult = Result<ApplyResponse, Interrupted>;

struct InFlight {
    plan: ReconciliationPlan,
}

/// Drives stacks to their declared state
pub struct Driver {
    stacks: Vec<Stack>,
    graph: DependencyGraph,
    outputs: OutputStore,
    applied: HashMap<StackName, AppliedState>,
    engine: Arc<dyn ProvisioningEngine>,
    secrets: Arc<dyn SecretSink>,
    state: Option<StateStore>,
    approver: Box<dyn Approver>,
    options: DriverOptions,
}

impl Driver {
    /// Builds the driver, rejecting cyclic or dangling stack references
    pub fn new(
        stacks: Vec<Stack>,
        engine: Arc<dyn ProvisioningEngine>,
        secrets: Arc<dyn SecretSink>,
        options: DriverOptions,
    ) -> Result<Self, DriverError> {
        let graph = DependencyGraph::from_stacks(&stacks)?;
        let outputs = OutputStore::for_stacks(&stacks);

        Ok(Self {
            stacks,
            graph,
            outputs,
            applied: HashMap::new(),
            engine,
            secrets,
            state: None,
            approver: Box::new(AutoApprove),
            options,
        })
    }

    /// Seeds the driver with state recorded by earlier runs
    ///
    /// States of stacks that are no longer declared are ignored.
    pub fn with_applied(mut self, applied: impl IntoIterator<Item = AppliedState>) -> Self {
        for state in applied {
            if self.outputs.restore(&state.stack, state.outputs.clone()).is_ok() {
                self.applied.insert(state.stack.clone(), state);
            }
        }
        self
    }

    /// Persists applied state after every successful apply
    pub fn with_state_store(mut self, store: StateStore) -> Self {
        self.state = Some(store);
        self
    }

    pub fn with_approver(mut self, approver: Box<dyn Approver>) -> Self {
        self.approver = approver;
        self
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn outputs(&self) -> &OutputStore {
        &self.outputs
    }

    pub fn stack(&self, name: &StackName) -> Option<&Stack> {
        self.stacks.iter().find(|s| &s.name == name)
    }

    pub fn applied(&self, name: &StackName) -> Option<&AppliedState> {
        self.applied.get(name)
    }

    /// Renders a stack against current upstream outputs and diffs it
    pub fn plan_stack(&self, name: &StackName) -> Result<ReconciliationPlan, PlanError> {
        let stack = self
            .stack(name)
            .ok_or_else(|| PlanError::UnknownStack(name.clone()))?;

        let inputs = self.outputs.resolve_inputs(stack)?;
        let ctx = RenderContext::new(&self.options.environment, stack, &inputs)
            .with_org(self.options.org.as_deref());

        let resources = stack
            .resources
            .iter()
            .map(|decl| {
                let name = match ctx.render(&Value::String(decl.name.clone()))? {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                let properties = ctx.render(&decl.properties)?;
                Ok(RenderedResource::new(decl.resource_type.clone(), name, properties))
            })
            .collect::<Result<Vec<_>, RenderError>>()?;

        let exports = ctx.render_map(&stack.exports)?;

        Ok(ReconciliationPlan::compute(
            name.clone(),
            resources,
            exports,
            &stack.outputs,
            self.applied.get(name),
        ))
    }

    fn targets(&self, selection: &Selection) -> Result<Vec<StackName>, DriverError> {
        let order = self.graph.execution_order()?;

        match selection {
            Selection::All => Ok(order),
            Selection::Only(names) => {
                if let Some(unknown) = names.iter().find(|n| !self.graph.contains(n)) {
                    return Err(DriverError::UnknownStack(unknown.clone()));
                }
                Ok(order.into_iter().filter(|n| names.contains(n)).collect())
            }
        }
    }

    /// Runs the selected stacks to completion, failure or cancellation
    ///
    /// Individual stack failures are reported in the [`RunReport`]; only
    /// problems that stop the run from starting are returned as errors.
    pub async fn run(&mut self, selection: Selection, cancel: CancelSignal) -> Result<RunReport, DriverError> {
        let started_at = Utc::now();
        let run_id = RunId::new(&self.options.environment, started_at);
        let targets = self.targets(&selection)?;
        let max_parallel = self.options.max_parallel.max(1);

        info!(run = %run_id, environment = %self.options.environment, stacks = targets.len(), "starting run");

        let mut run = RunState::new(&targets);
        let mut tasks: JoinSet<TaskResult> = JoinSet::new();
        let mut in_flight: HashMap<Id, (StackName, InFlight)> = HashMap::new();

        loop {
            // Start everything that is ready, re-checking after each stack
            // that settles without an engine call
            let mut rescan = true;
            while rescan && !cancel.is_cancelled() {
                rescan = false;
                for name in self.graph.ready_stacks(&run.statuses) {
                    if run.settled.contains(&name) {
                        continue;
                    }
                    if tasks.len() >= max_parallel {
                        break;
                    }

                    match self.prepare(&name, &mut run, &cancel).await {
                        Some(plan) => {
                            let request = self.request(&plan);
                            let id = tasks
                                .spawn(apply_with_limits(
                                    Arc::clone(&self.engine),
                                    request,
                                    self.options.timeout,
                                    cancel.clone(),
                                ))
                                .id();
                            run.transition(&name, StackStatus::Applying);
                            info!(stack = %name, generation = %plan.target_generation(), "applying");
                            in_flight.insert(id, (name, InFlight { plan }));
                        }
                        None => {
                            rescan = true;
                            break;
                        }
                    }
                }
            }

            let Some(joined) = tasks.join_next_with_id().await else {
                break;
            };

            let (id, result) = match joined {
                Ok((id, result)) => (id, result),
                Err(join_error) => {
                    let id = join_error.id();
                    warn!(error = %join_error, "apply task did not complete");
                    (id, Err(Interrupted::Cancelled))
                }
            };

            let Some((name, InFlight { plan })) = in_flight.remove(&id) else {
                continue;
            };

            let outcome = match result {
                Ok(response) => self.complete(&plan, response),
                Err(Interrupted::Engine(cause)) => Err(ApplyError::ApplyFailed {
                    stack: name.clone(),
                    generation: plan.target_generation(),
                    cause,
                }),
                Err(Interrupted::Timeout(after)) => Err(ApplyError::Timeout {
                    stack: name.clone(),
                    after,
                }),
                Err(Interrupted::Cancelled) => Err(ApplyError::Cancelled(name.clone())),
            };

            match outcome {
                Ok(generation) => {
                    info!(stack = %name, generation = %generation, "applied");
                    run.transition(&name, StackStatus::Applied);
                    run.settle(
                        &name,
                        StackOutcome::Applied {
                            generation,
                            summary: plan.summary(),
                        },
                    );
                }
                Err(error) => self.fail(&name, error, &mut run),
            }
        }

        for name in &targets {
            if !run.settled.contains(name) {
                run.settle(name, StackOutcome::Skipped);
            }
        }

        let report = run.into_report(run_id, &self.options.environment, started_at, &targets);
        info!(
            run = %report.run_id,
            applied = report.applied_count(),
            succeeded = report.succeeded(),
            "run finished"
        );
        Ok(report)
    }

    /// Plans a ready stack; returns the plan if it needs the engine
    async fn prepare(
        &mut self,
        name: &StackName,
        run: &mut RunState,
        cancel: &CancelSignal,
    ) -> Option<ReconciliationPlan> {
        let plan = match self.plan_stack(name) {
            Ok(plan) => plan,
            Err(source) => {
                self.fail(
                    name,
                    ApplyError::Plan {
                        stack: name.clone(),
                        source,
                    },
                    run,
                );
                return None;
            }
        };
        run.transition(name, StackStatus::Planned);

        if plan.is_noop() {
            debug!(stack = %name, generation = %plan.base_generation, "no changes");
            run.transition(name, StackStatus::Applied);
            run.settle(
                name,
                StackOutcome::Unchanged {
                    generation: plan.base_generation,
                },
            );
            return None;
        }

        if !self.approver.approve(&plan).await {
            run.transition(name, StackStatus::Pending);
            if cancel.is_cancelled() {
                // Left unsettled; reported as skipped
                return None;
            }
            info!(stack = %name, "plan declined");
            run.settle(name, StackOutcome::Declined);
            self.block_dependents(name, run);
            return None;
        }

        Some(plan)
    }

    fn request(&self, plan: &ReconciliationPlan) -> ApplyRequest {
        let (project, schema) = match self.stack(&plan.stack) {
            Some(stack) => (stack.project().to_string(), stack.outputs.clone()),
            None => (plan.stack.to_string(), Default::default()),
        };
        ApplyRequest::from_plan(plan, project, self.options.environment.clone(), &schema)
    }

    /// Validates, stores secrets, persists and publishes a successful apply
    ///
    /// Secrets are written under the target generation, so a failure here
    /// leaves the values behind already-recorded references untouched.
    fn complete(&mut self, plan: &ReconciliationPlan, response: ApplyResponse) -> Result<Generation, ApplyError> {
        let name = &plan.stack;
        let schema = self
            .stack(name)
            .map(|s| s.outputs.clone())
            .unwrap_or_default();

        schema
            .validate(&response.outputs)
            .map_err(|source| ApplyError::InvalidOutputs {
                stack: name.clone(),
                source,
            })?;

        let generation = plan.target_generation();
        let mut values = BTreeMap::new();
        for (key, value) in response.outputs {
            let sensitive = schema.field(&key).is_some_and(|f| f.sensitive);
            let value = if sensitive {
                let reference = self
                    .secrets
                    .put(
                        &self.options.environment,
                        name,
                        &key,
                        generation,
                        &Sensitive::from_json(&value),
                    )
                    .map_err(|source| ApplyError::Secret {
                        stack: name.clone(),
                        source,
                    })?;
                debug!(stack = %name, key = %key, reference = %reference, "stored secret output");
                OutputValue::Secret(reference)
            } else {
                OutputValue::Plain(value)
            };
            values.insert(key, value);
        }

        // Nothing becomes visible until the new state is on disk: a stack
        // that fails past this point stays at its previous generation.
        let outputs = OutputSet::new(generation, values);
        let publish_error = |source| ApplyError::Publish {
            stack: name.clone(),
            source,
        };
        self.outputs.check(name, &outputs).map_err(publish_error)?;

        let applied = AppliedState {
            stack: name.clone(),
            applied_at: outputs.published_at,
            resources: plan.resource_states(),
            interface: plan.interface.clone(),
            outputs: outputs.clone(),
        };

        if let Some(store) = &self.state {
            store.record(&applied).map_err(|cause| ApplyError::State {
                stack: name.clone(),
                cause,
            })?;
        }

        if let Err(source) = self.outputs.publish(name, outputs) {
            self.restore_recorded(name);
            return Err(publish_error(source));
        }
        self.applied.insert(name.clone(), applied);

        Ok(generation)
    }

    /// Puts the recorded state of a stack back to what this driver last applied
    fn restore_recorded(&self, name: &StackName) {
        let Some(store) = &self.state else {
            return;
        };
        let restored = match self.applied.get(name) {
            Some(previous) => store.record(previous),
            None => store.remove(name).map(|_| ()),
        };
        if let Err(e) = restored {
            warn!(stack = %name, error = %format!("{:#}", e), "failed to roll back recorded state");
        }
    }

    fn fail(&self, name: &StackName, error: ApplyError, run: &mut RunState) {
        warn!(stack = %name, error = %error, "stack failed");
        run.transition(name, StackStatus::Failed);
        run.settle(name, StackOutcome::Failed { error });
        self.block_dependents(name, run);
    }

    fn block_dependents(&self, upstream: &StackName, run: &mut RunState) {
        for dependent in self.graph.transitive_dependents(upstream) {
            if run.statuses.contains_key(&dependent) && !run.settled.contains(&dependent) {
                let error = ApplyError::BlockedByDependency {
                    stack: dependent.clone(),
                    upstream: upstream.clone(),
                };
                info!(stack = %dependent, reason = %error, "blocked");
                run.settle(
                    &dependent,
                    StackOutcome::Blocked {
                        upstream: upstream.clone(),
                    },
                );
            }
        }
    }
}

/// Applies one stack, bounded by the timeout and the cancel signal
///
/// On timeout or cancellation the in-flight engine call is dropped and the
/// engine is told to abandon the generation.
async fn apply_with_limits(
    engine: Arc<dyn ProvisioningEngine>,
    request: ApplyRequest,
    timeout: Option<Duration>,
    mut cancel: CancelSignal,
) -> TaskResult {
    let stack = request.stack.clone();
    let generation = request.generation;

    let bounded = async {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, engine.apply(request)).await {
                Ok(result) => result.map_err(Interrupted::Engine),
                Err(_) => Err(Interrupted::Timeout(limit)),
            },
            None => engine.apply(request).await.map_err(Interrupted::Engine),
        }
    };

    let result = tokio::select! {
        result = bounded => result,
        _ = cancel.cancelled() => Err(Interrupted::Cancelled),
    };

    if matches!(result, Err(Interrupted::Timeout(_)) | Err(Interrupted::Cancelled)) {
        if let Err(e) = engine.cancel(&stack, generation).await {
            warn!(stack = %stack, generation = %generation, error = %e, "engine cancel failed");
        }
    }

    result
}

/// Bookkeeping for one run
struct RunState {
    statuses: HashMap<StackName, StackStatus>,
    settled: HashSet<StackName>,
    outcomes: HashMap<StackName, StackOutcome>,
}

impl RunState {
    fn new(targets: &[StackName]) -> Self {
        Self {
            statuses: targets
                .iter()
                .map(|n| (n.clone(), StackStatus::Pending))
                .collect(),
            settled: HashSet::new(),
            outcomes: HashMap::new(),
        }
    }

    fn transition(&mut self, name: &StackName, next: StackStatus) {
        if let Some(status) = self.statuses.get_mut(name) {
            debug_assert!(
                status.can_transition_to(next),
                "illegal transition {} -> {} for {}",
                status,
                next,
                name
            );
            *status = next;
        }
    }

    fn settle(&mut self, name: &StackName, outcome: StackOutcome) {
        self.settled.insert(name.clone());
        self.outcomes.insert(name.clone(), outcome);
    }

    fn into_report(
        mut self,
        run_id: RunId,
        environment: &str,
        started_at: chrono::DateTime<Utc>,
        targets: &[StackName],
    ) -> RunReport {
        let stacks = targets
            .iter()
            .filter_map(|name| {
                let outcome = self.outcomes.remove(name)?;
                let status = self.statuses.get(name).copied().unwrap_or_default();
                Some(StackReport {
                    stack: name.clone(),
                    status,
                    outcome,
                })
            })
            .collect();

        RunReport {
            run_id,
            environment: environment.to_string(),
            started_at,
            finished_at: Utc::now(),
            stacks,
        }
    }
}
