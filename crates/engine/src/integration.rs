//! Running integrations.
//!
//! `Integration` is the central orchestrator:
//! 1. Binds its endpoint steps to applications on `init`, registers its
//!    schedule on `start`.
//! 2. Drives transactions from step to step, dispatching processor and
//!    endpoint steps to the collaborators in [`Services`].
//! 3. Fans a forEach step out into one child transaction per item and joins
//!    them back at the paired collect step, in item order.
//! 4. Diverts failed steps to the `exception` step when the graph has one,
//!    and ends the transaction otherwise. Step failures never escape
//!    `run_instance`.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use processors::{Processor, ProcessorError, ScriptRuntime};
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn, Instrument};
use workflow::{
    Context, Direction, EndpointStep, ExecStatus, FlowError, Graph, ProcessorRef, Step, StepKind,
    Transaction, TransactionSnapshot, EXCEPTION_PROPERTY, EXCEPTION_STEP_ID,
};

use crate::definition::IntegrationDefinition;
use crate::services::{ScheduledTask, Services};

/// Failure detail of a step; becomes the transaction's exception property.
type StepResult = Result<(), String>;

/// A named, configured instance of a workflow graph.
///
/// Cheap to clone; clones share state. Safe to use from many tasks at once:
/// every transaction is owned by the caller driving it.
#[derive(Clone)]
pub struct Integration {
    inner: Arc<Inner>,
}

struct Inner {
    id: String,
    client_id: Option<String>,
    /// Replaced wholesale on update, never mutated in place.
    definition: RwLock<Arc<IntegrationDefinition>>,
    config: RwLock<Arc<Value>>,
    status: RwLock<ExecStatus>,
    services: Services,
}

impl fmt::Debug for Integration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Integration")
            .field("id", &self.inner.id)
            .field("client_id", &self.inner.client_id)
            .field("status", &self.status())
            .finish()
    }
}

impl Integration {
    pub fn new(
        id: impl Into<String>,
        client_id: Option<String>,
        definition: IntegrationDefinition,
        services: Services,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: id.into(),
                client_id,
                definition: RwLock::new(Arc::new(definition)),
                config: RwLock::new(Arc::new(Value::Object(Map::new()))),
                status: RwLock::new(ExecStatus::None),
                services,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn client_id(&self) -> Option<&str> {
        self.inner.client_id.as_deref()
    }

    pub fn status(&self) -> ExecStatus {
        *self.inner.status.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, status: ExecStatus) {
        *self.inner.status.write().unwrap_or_else(PoisonError::into_inner) = status;
    }

    pub fn definition(&self) -> Arc<IntegrationDefinition> {
        self.inner
            .definition
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn graph(&self) -> Arc<Graph> {
        self.definition().graph().clone()
    }

    /// The current integration configuration.
    pub fn config(&self) -> Arc<Value> {
        self.inner
            .config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn services(&self) -> &Services {
        &self.inner.services
    }

    /// `ctx` extended with this integration's id.
    fn flow_context(&self, mut ctx: Context) -> Context {
        ctx.set_info("integrationId", self.id());
        ctx
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Set the configuration and bind every endpoint step to its application.
    ///
    /// Either every endpoint is bound or none is.
    #[instrument(skip_all, fields(integration_id = %self.id()))]
    pub fn init(&self, config: Value, ctx: &Context) -> Result<(), FlowError> {
        *self.inner.config.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(config);

        let graph = self.graph();
        let endpoints: Vec<&EndpointStep> = graph.steps().iter().filter_map(Step::endpoint).collect();

        if let Some(first) = endpoints.first() {
            let directory = self.inner.services.endpoints.as_ref().ok_or_else(|| {
                FlowError::UnknownApplication(first.application_id.clone()).in_context(ctx)
            })?;
            for (bound, endpoint) in endpoints.iter().enumerate() {
                if let Err(e) = directory.bind_endpoint(self.id(), endpoint) {
                    for endpoint in &endpoints[..bound] {
                        if let Err(e) = directory.unbind_endpoint(self.id(), endpoint) {
                            warn!(endpoint_id = %endpoint.endpoint_id, error = %e, "failed to unbind endpoint");
                        }
                    }
                    return Err(e.in_context(ctx));
                }
            }
        }

        self.set_status(ExecStatus::Stopped);
        info!(steps = graph.len(), endpoints = endpoints.len(), "integration initialised");
        Ok(())
    }

    /// Mark the integration running and register its schedule, if any.
    #[instrument(skip_all, fields(integration_id = %self.id()))]
    pub fn start(&self, ctx: &Context) -> Result<(), FlowError> {
        if self.status() == ExecStatus::Running {
            return Ok(());
        }

        if let Some(schedule) = self.definition().schedule() {
            let scheduler = self.inner.services.scheduler.as_ref().ok_or_else(|| {
                FlowError::InvalidSchedule("no scheduler is configured".into()).in_context(ctx)
            })?;
            let task = Arc::new(IntegrationTask {
                inner: Arc::downgrade(&self.inner),
            });
            scheduler
                .schedule_task(self.id(), schedule, task, ctx)
                .map_err(|e| e.in_context(ctx))?;
        }

        self.set_status(ExecStatus::Running);
        info!("integration started");
        Ok(())
    }

    #[instrument(skip_all, fields(integration_id = %self.id()))]
    pub fn stop(&self, ctx: &Context) -> Result<(), FlowError> {
        if self.definition().schedule().is_some() {
            if let Some(scheduler) = &self.inner.services.scheduler {
                scheduler
                    .remove_scheduled_task(self.id(), ctx)
                    .map_err(|e| e.in_context(ctx))?;
            }
        }

        if self.status() != ExecStatus::None {
            self.set_status(ExecStatus::Stopped);
        }
        info!("integration stopped");
        Ok(())
    }

    /// Stop, then release every endpoint binding.
    #[instrument(skip_all, fields(integration_id = %self.id()))]
    pub fn destroy(&self, ctx: &Context) -> Result<(), FlowError> {
        self.stop(ctx)?;

        if let Some(directory) = &self.inner.services.endpoints {
            let graph = self.graph();
            for endpoint in graph.steps().iter().filter_map(Step::endpoint) {
                if let Err(e) = directory.unbind_endpoint(self.id(), endpoint) {
                    warn!(endpoint_id = %endpoint.endpoint_id, error = %e, "failed to unbind endpoint");
                }
            }
        }

        self.set_status(ExecStatus::None);
        info!("integration destroyed");
        Ok(())
    }

    /// Whether `message` and the configuration match the start condition.
    ///
    /// Integrations without a start condition always match.
    pub fn can_start(&self, message: Option<&Value>) -> Result<bool, FlowError> {
        let definition = self.definition();
        match definition.start_condition() {
            None => Ok(true),
            Some(condition) => {
                self.inner
                    .services
                    .conditions
                    .evaluate(condition, message, &self.config())
            }
        }
    }

    /// Replace the configuration seen by transactions created from now on.
    pub fn update_config(&self, config: Value, ctx: &Context) {
        *self.inner.config.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(config);
        info!(integration_id = %self.id(), ctx = ctx.id().unwrap_or("-"), "configuration updated");
    }

    /// Replace the fixed message of direct step `step_id`.
    pub fn update_step_message(&self, step_id: &str, message: Value, ctx: &Context) -> Result<(), FlowError> {
        let mut definition = self
            .inner
            .definition
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        let graph = definition
            .graph()
            .with_direct_message(step_id, message)
            .map_err(|e| e.in_context(ctx))?;
        *definition = Arc::new((**definition).clone().with_graph(graph));

        info!(integration_id = %self.id(), step = step_id, "step message updated");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    fn new_transaction(&self, step: Option<String>, ctx: Context) -> Transaction {
        let trx = Transaction::new(self.id(), step)
            .with_config(Some(self.config().as_ref().clone()))
            .with_context(self.flow_context(ctx));
        match self.client_id() {
            Some(client_id) => trx.with_client_id(client_id),
            None => trx,
        }
    }

    /// A transaction positioned at the first step.
    pub fn create_instance(&self, message: Option<Value>, ctx: Context) -> Transaction {
        let first = self.graph().first_step().map(|s| s.id.clone());
        self.new_transaction(first, ctx).with_message(message)
    }

    /// A transaction positioned at an arbitrary step.
    pub fn create_instance_at(
        &self,
        message: Option<Value>,
        step: &str,
        previous_step: Option<String>,
        failed: bool,
        properties: Map<String, Value>,
        ctx: Context,
    ) -> Result<Transaction, FlowError> {
        if self.graph().step(step).is_none() {
            return Err(FlowError::UnknownStep(step.to_owned()).in_context(&ctx));
        }

        Ok(self
            .new_transaction(Some(step.to_owned()), ctx)
            .with_message(message)
            .with_previous_step(previous_step)
            .with_failed(failed)
            .with_properties(properties))
    }

    /// Run a fresh transaction from the first step to the end.
    ///
    /// # Errors
    /// `IT_STOP` unless the integration is running. Step failures do not
    /// surface here; inspect the returned transaction instead.
    #[instrument(skip_all, fields(integration_id = %self.id()))]
    pub async fn execute(&self, message: Option<Value>, ctx: Context) -> Result<Transaction, FlowError> {
        if self.status() != ExecStatus::Running {
            return Err(FlowError::IntegrationStopped(self.id().to_owned()).in_context(&ctx));
        }

        let mut trx = self.create_instance(message, ctx);
        self.run_instance(&mut trx).await;
        Ok(trx)
    }

    /// Rebuild a transaction from `snapshot` and run it to the end.
    pub async fn resume(&self, mut snapshot: TransactionSnapshot, ctx: Context) -> Result<Transaction, FlowError> {
        if self.status() != ExecStatus::Running {
            return Err(FlowError::IntegrationStopped(self.id().to_owned()).in_context(&ctx));
        }

        snapshot.integration_id = Some(self.id().to_owned());
        let mut trx = Transaction::from_snapshot(snapshot, self.flow_context(ctx));
        self.run_instance(&mut trx).await;
        Ok(trx)
    }

    /// Drive `trx` from its current step until it is finished, inside the
    /// span of the transaction's context.
    pub async fn run_instance(&self, trx: &mut Transaction) {
        let span = trx.context().span();
        self.drive(trx).instrument(span).await;
    }

    #[instrument(skip_all, fields(integration_id = %self.id(), transaction_id = %trx.id()))]
    async fn drive(&self, trx: &mut Transaction) {
        let graph = self.graph();
        let max_hops = self.inner.services.config.max_hops;
        let mut hops = 0usize;

        while !trx.is_finished() {
            if hops >= max_hops {
                warn!(max_hops, "transaction exceeded the step limit");
                trx.move_to_exception(format!("exceeded the limit of {max_hops} steps"));
                trx.move_to_end();
                break;
            }
            hops += 1;
            self.hop(&graph, trx).await;
        }

        info!(hops, failed = trx.is_failed(), "transaction finished");
        self.save_snapshot(trx).await;
    }

    /// Run only the current step (`move_on == false`) or the rest of the
    /// transaction. Works whatever the integration's status.
    #[instrument(skip_all, fields(integration_id = %self.id(), transaction_id = %trx.id()))]
    pub async fn probe(&self, trx: &mut Transaction, move_on: bool) {
        if move_on {
            self.run_instance(trx).await;
        } else if !trx.is_finished() {
            let graph = self.graph();
            self.hop(&graph, trx).await;
        }
    }

    async fn save_snapshot(&self, trx: &Transaction) {
        if let Some(store) = &self.inner.services.snapshots {
            if let Err(e) = store.save(&trx.snapshot()).await {
                warn!(transaction_id = %trx.id(), error = %e, "failed to save transaction snapshot");
            }
        }
    }

    // ------------------------------------------------------------------
    // Steps
    // ------------------------------------------------------------------

    /// Execute the current step and move the cursor on, or into the
    /// exception path.
    async fn hop(&self, graph: &Arc<Graph>, trx: &mut Transaction) {
        let Some(step_id) = trx.current_step().map(str::to_owned) else {
            return;
        };

        let result = match graph.step(&step_id) {
            Some(step) => match self.execute_step(graph, step, trx).await {
                Ok(()) => advance(graph, &step_id, trx),
                Err(detail) => Err(detail),
            },
            None => Err(format!("step '{step_id}' is not part of the workflow")),
        };

        debug!(step = %step_id, elapsed_ms = trx.elapsed_millis() as u64, "step done");

        if let Err(detail) = result {
            fail(graph, &step_id, trx, detail);
        }
    }

    async fn execute_step(&self, graph: &Arc<Graph>, step: &Step, trx: &mut Transaction) -> StepResult {
        match &step.kind {
            StepKind::Direct { message } => {
                trx.set_message(message.clone());
                Ok(())
            }
            StepKind::Processor(ProcessorRef::Script { script_id, is_async }) => {
                self.run_script(&step.id, script_id, *is_async, trx).await
            }
            StepKind::Processor(ProcessorRef::Native { module_id, class_name }) => {
                let processor = self
                    .inner
                    .services
                    .processors
                    .get(module_id, class_name)
                    .map_err(|e| e.to_string())?;
                self.process_with_retry(&step.id, Handler::Native(processor.as_ref()), trx)
                    .await
            }
            StepKind::Endpoint(endpoint) => match endpoint.direction {
                Direction::In => Ok(()),
                Direction::Out => self.call_endpoint(endpoint, trx).await,
            },
            StepKind::ForEach => self.fan_out(graph, step, trx).await,
            StepKind::Collect => Ok(()),
        }
    }

    async fn run_script(&self, step_id: &str, script_id: &str, is_async: bool, trx: &mut Transaction) -> StepResult {
        let runtime = self
            .inner
            .services
            .scripts
            .clone()
            .ok_or_else(|| format!("no script runtime to run '{script_id}'"))?;

        if is_async {
            let mut detached = trx.clone();
            let script_id = script_id.to_owned();
            tokio::spawn(async move {
                if let Err(e) = runtime.run(&script_id, &mut detached).await {
                    warn!(script_id, transaction_id = %detached.id(), error = %e, "asynchronous script failed");
                }
            });
            return Ok(());
        }

        self.process_with_retry(step_id, Handler::Script(runtime.as_ref(), script_id), trx)
            .await
    }

    async fn process_with_retry(&self, step_id: &str, handler: Handler<'_>, trx: &mut Transaction) -> StepResult {
        let config = &self.inner.services.config;
        let mut attempts = 0u32;

        loop {
            match handler.call(trx).await {
                Ok(()) => return Ok(()),

                Err(e) if e.is_retryable() => {
                    attempts += 1;
                    if attempts > config.max_retries {
                        return Err(format!("{e} (gave up after {} retries)", config.max_retries));
                    }

                    let delay = config.retry_delay(attempts);
                    warn!(
                        step = step_id,
                        attempt = attempts,
                        max_retries = config.max_retries,
                        ?delay,
                        error = %e,
                        "retryable processor error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }

                Err(e) => return Err(e.to_string()),
            }
        }
    }

    async fn call_endpoint(&self, endpoint: &EndpointStep, trx: &mut Transaction) -> StepResult {
        let directory = self.inner.services.endpoints.as_ref().ok_or_else(|| {
            format!("no application directory to reach '{}'", endpoint.application_id)
        })?;

        let message = trx.message().cloned().unwrap_or(Value::Null);
        let ctx = trx
            .context()
            .clone()
            .with_info("applicationId", endpoint.application_id.as_str())
            .with_info("endpointId", endpoint.endpoint_id.as_str());

        let reply = directory
            .call_outbound_endpoint(
                &endpoint.application_id,
                &endpoint.endpoint_id,
                self.id(),
                message,
                &ctx,
            )
            .await
            .map_err(|e| format!("[{}] {e}", e.code()))?;

        if let Some(reply) = reply {
            trx.set_message(reply);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // forEach / collect
    // ------------------------------------------------------------------

    /// Run the region after `step` once per item of the message and gather
    /// the results, in item order, on the parent at the collect step.
    async fn fan_out(&self, graph: &Arc<Graph>, step: &Step, trx: &mut Transaction) -> StepResult {
        let collect = graph
            .next_collect_step(&step.id)
            .ok_or_else(|| format!("forEach '{}' has no collect step", step.id))?;
        let entry = graph
            .next_steps(&step.id)
            .first()
            .map(|s| s.id.clone())
            .ok_or_else(|| format!("forEach '{}' has no successor", step.id))?;
        let Some(Value::Array(items)) = trx.message() else {
            return Err(format!("forEach '{}' needs an array message", step.id));
        };
        let items = items.clone();
        let total = items.len();

        info!(step = %step.id, branches = total, "fanning out");

        let permits = Arc::new(Semaphore::new(
            self.inner.services.config.max_parallel_branches.max(1),
        ));
        let mut branches = JoinSet::new();

        for (index, item) in items.into_iter().enumerate() {
            let child = trx.branch(index, item, &entry);
            let integration = self.clone();
            let graph = Arc::clone(graph);
            let collect_id = collect.id.clone();
            let permits = Arc::clone(&permits);

            branches.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                (index, integration.run_branch(graph, child, collect_id).await)
            });
        }

        let mut results: Vec<Option<Result<Value, String>>> = (0..total).map(|_| None).collect();
        while let Some(joined) = branches.join_next().await {
            match joined {
                Ok((index, outcome)) => results[index] = Some(outcome),
                Err(e) => warn!(step = %step.id, error = %e, "forEach branch aborted"),
            }
        }

        let mut collected = Vec::with_capacity(total);
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Some(Ok(message)) => collected.push(message),
                Some(Err(detail)) => {
                    return Err(format!("forEach '{}' item {index} failed: {detail}", step.id))
                }
                None => return Err(format!("forEach '{}' item {index} did not complete", step.id)),
            }
        }

        debug!(step = %step.id, collect = %collect.id, "branches joined");
        trx.set_message(Value::Array(collected));
        trx.move_to_step(collect.id.clone());
        Ok(())
    }

    /// Drive one fan-out child until it reaches `collect_id`; yields the
    /// child's final message.
    ///
    /// A child that diverts to the exception step or ends early fails.
    fn run_branch(
        self,
        graph: Arc<Graph>,
        mut trx: Transaction,
        collect_id: String,
    ) -> BoxFuture<'static, Result<Value, String>> {
        async move {
            let max_hops = self.inner.services.config.max_hops;
            let mut hops = 0usize;

            loop {
                let step_id = match trx.current_step() {
                    Some(id) if id == collect_id => break,
                    Some(EXCEPTION_STEP_ID) | None => {
                        let detail = trx
                            .property(EXCEPTION_PROPERTY)
                            .and_then(Value::as_str)
                            .unwrap_or("the branch ended before reaching the collect step");
                        return Err(detail.to_owned());
                    }
                    Some(id) => id.to_owned(),
                };

                hops += 1;
                if hops > max_hops {
                    return Err(format!("exceeded the limit of {max_hops} steps"));
                }

                let step = graph
                    .step(&step_id)
                    .ok_or_else(|| format!("step '{step_id}' is not part of the workflow"))?;
                self.execute_step(&graph, step, &mut trx).await?;
                advance(&graph, &step_id, &mut trx)?;
            }

            Ok(trx.take_message().unwrap_or(Value::Null))
        }
        .boxed()
    }
}

// ---------------------------------------------------------------------------
// Cursor movement
// ---------------------------------------------------------------------------

/// Move past `step_id`, unless the step already moved the cursor itself.
///
/// No successor ends the transaction; more than one is ambiguous.
fn advance(graph: &Graph, step_id: &str, trx: &mut Transaction) -> StepResult {
    if trx.current_step() != Some(step_id) {
        return Ok(());
    }

    match graph.next_steps(step_id).as_slice() {
        [] => trx.move_to_end(),
        [next] => trx.move_to_step(next.id.clone()),
        many => {
            return Err(format!(
                "step '{step_id}' has {} successors and none was chosen",
                many.len()
            ))
        }
    }
    Ok(())
}

/// Divert to the exception step, or end when there is none to go to.
fn fail(graph: &Graph, step_id: &str, trx: &mut Transaction, detail: String) {
    warn!(step = step_id, transaction_id = %trx.id(), detail = %detail, "step failed");

    let handled = step_id != EXCEPTION_STEP_ID && graph.exception_step().is_some();
    trx.move_to_exception(detail);
    if !handled {
        trx.move_to_end();
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

enum Handler<'a> {
    Native(&'a dyn Processor),
    Script(&'a dyn ScriptRuntime, &'a str),
}

impl Handler<'_> {
    async fn call(&self, trx: &mut Transaction) -> Result<(), ProcessorError> {
        match self {
            Self::Native(processor) => processor.process(trx).await,
            Self::Script(runtime, script_id) => runtime.run(script_id, trx).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduled runs
// ---------------------------------------------------------------------------

/// Executes the integration on every tick. Holds the integration weakly so
/// a forgotten schedule does not keep it alive.
struct IntegrationTask {
    inner: Weak<Inner>,
}

#[async_trait]
impl ScheduledTask for IntegrationTask {
    async fn run(&self, task_id: &str, ctx: Context) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let integration = Integration { inner };

        match integration.execute(None, ctx).await {
            Ok(trx) => debug!(task_id, transaction_id = %trx.id(), failed = trx.is_failed(), "scheduled run finished"),
            Err(e) => warn!(task_id, error = %e, "scheduled run skipped"),
        }
    }
}
