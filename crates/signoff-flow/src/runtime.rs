//! The service container: constructs, wires, and runs the kernel.
//!
//! There are no global singletons. [`Orchestrator`] owns the event bus,
//! state machine, approval service, executor, and timeout manager, wires
//! the executor's bus subscriptions, and ties their start/stop lifecycle
//! to the process. It also exposes the workflow facade: creation (with
//! idempotency keys), reads, and dead-letter administration.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use signoff_core::{ApprovalId, DeadLetterId, WorkflowId};

use crate::adapters::ApprovalNotifier;
use crate::approval::{Approval, UiSchema};
use crate::approvals::ApprovalService;
use crate::bus::{EventBus, EventHandler};
use crate::callbacks::DecisionIntake;
use crate::config::FlowConfig;
use crate::dlq::DeadLetter;
use crate::error::{Error, Result};
use crate::events::{EventKind, FlowEvent, FlowEventData, WorkflowEventRecord};
use crate::executor::{StepExecutor, CTX_APPROVAL_SCHEMA, CTX_APPROVAL_TIMEOUT};
use crate::machine::{record, StateMachine};
use crate::outbox::Outbox;
use crate::registry::TaskRegistry;
use crate::step::{Step, StepSpec};
use crate::store::Store;
use crate::timeout::TimeoutManager;
use crate::workflow::{Workflow, WorkflowState};

/// Workflow creation request.
///
/// Single-step shape: an optional inline `approval_schema` (plus
/// timeout) that becomes the workflow's one human gate. Multi-step
/// shape: an explicit `steps` pipeline. The `idempotency_key` dedupes
/// creation within a `workflow_type`.
#[derive(Debug, Clone)]
pub struct CreateWorkflowRequest {
    /// Caller-supplied classification.
    pub workflow_type: String,
    /// Arbitrary JSON context.
    pub context: JsonValue,
    /// Inline approval schema (single-step workflows).
    pub approval_schema: Option<UiSchema>,
    /// Expiry for the inline approval.
    pub approval_timeout_seconds: Option<u64>,
    /// Explicit pipeline (multi-step workflows).
    pub steps: Vec<StepSpec>,
    /// Deduplication key, unique within `workflow_type`.
    pub idempotency_key: Option<String>,
    /// Retry budget override.
    pub max_retries: Option<u32>,
}

impl CreateWorkflowRequest {
    /// Creates a request with an empty context.
    #[must_use]
    pub fn new(workflow_type: impl Into<String>) -> Self {
        Self {
            workflow_type: workflow_type.into(),
            context: JsonValue::Object(serde_json::Map::new()),
            approval_schema: None,
            approval_timeout_seconds: None,
            steps: Vec::new(),
            idempotency_key: None,
            max_retries: None,
        }
    }

    /// Sets the context.
    #[must_use]
    pub fn with_context(mut self, context: JsonValue) -> Self {
        self.context = context;
        self
    }

    /// Attaches an inline approval schema.
    #[must_use]
    pub fn with_approval_schema(mut self, schema: UiSchema) -> Self {
        self.approval_schema = Some(schema);
        self
    }

    /// Sets the inline approval timeout.
    #[must_use]
    pub fn with_approval_timeout(mut self, seconds: u64) -> Self {
        self.approval_timeout_seconds = Some(seconds);
        self
    }

    /// Sets the explicit pipeline.
    #[must_use]
    pub fn with_steps(mut self, steps: Vec<StepSpec>) -> Self {
        self.steps = steps;
        self
    }

    /// Sets the idempotency key.
    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Overrides the retry budget.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Owns and wires the kernel's services.
pub struct Orchestrator {
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    machine: Arc<StateMachine>,
    approvals: Arc<ApprovalService>,
    executor: Arc<StepExecutor>,
    timeout_manager: Arc<TimeoutManager>,
    config: FlowConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Constructs the kernel over a store and a task registry, wiring
    /// the executor's subscriptions. Call [`Orchestrator::start`] to run
    /// the bus and the timeout manager.
    #[must_use]
    pub fn new(config: FlowConfig, store: Arc<dyn Store>, registry: TaskRegistry) -> Self {
        let bus = Arc::new(EventBus::new(config.bus.clone(), Arc::clone(&store)));
        let machine = Arc::new(StateMachine::new(Arc::clone(&store), Arc::clone(&bus)));
        let approvals = Arc::new(ApprovalService::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::clone(&machine),
            config.signing.clone(),
        ));
        let executor = Arc::new(StepExecutor::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::clone(&machine),
            Arc::clone(&approvals),
            Arc::new(registry),
            config.default_approval_timeout.0,
        ));
        let timeout_manager = Arc::new(TimeoutManager::new(
            Arc::clone(&store),
            Arc::clone(&machine),
            Arc::clone(&approvals),
            Arc::clone(&executor),
            config.timeout.clone(),
            config.retry.clone(),
        ));

        bus.subscribe(
            EventKind::WorkflowCreated,
            Arc::new(ExecutorEventHandler {
                executor: Arc::clone(&executor),
            }),
        );
        bus.subscribe(
            EventKind::ApprovalReceived,
            Arc::new(ExecutorEventHandler {
                executor: Arc::clone(&executor),
            }),
        );
        bus.subscribe(
            EventKind::WorkflowRollbackRequested,
            Arc::new(ExecutorEventHandler {
                executor: Arc::clone(&executor),
            }),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            store,
            bus,
            machine,
            approvals,
            executor,
            timeout_manager,
            config,
            shutdown_tx,
            shutdown_rx,
            background: Mutex::new(Vec::new()),
        }
    }

    /// Subscribes an outbound notifier to the approval lifecycle events.
    /// Must run before [`Orchestrator::start`].
    pub fn attach_notifier(&self, notifier: Arc<dyn ApprovalNotifier>) {
        let handler = Arc::new(NotifierEventHandler {
            store: Arc::clone(&self.store),
            notifier,
        });
        self.bus
            .subscribe(EventKind::ApprovalRequested, Arc::clone(&handler) as _);
        self.bus
            .subscribe(EventKind::ApprovalReceived, Arc::clone(&handler) as _);
        self.bus.subscribe(EventKind::ApprovalTimeout, handler);
    }

    /// Starts the event bus and the timeout manager.
    pub fn start(&self) {
        self.bus.start();
        let handle = Arc::clone(&self.timeout_manager).spawn(self.shutdown_rx.clone());
        self.background
            .lock()
            .expect("background task lock poisoned")
            .push(handle);
        tracing::info!("orchestrator started");
    }

    /// Stops background tasks cooperatively: the timeout manager
    /// finishes its in-flight tick, then the bus drains and joins.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self
                .background
                .lock()
                .expect("background task lock poisoned"),
        );
        for handle in handles {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "background task join failed");
            }
        }
        self.bus.shutdown().await;
        tracing::info!("orchestrator stopped");
    }

    /// Creates a workflow.
    ///
    /// Repeated creation with the same `(workflow_type, idempotency_key)`
    /// returns the existing workflow and appends no events. The
    /// `workflow.created` event is published after commit; the executor
    /// reacts to it and starts the run.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] for malformed requests; storage errors.
    pub async fn create_workflow(&self, request: CreateWorkflowRequest) -> Result<Workflow> {
        if request.workflow_type.trim().is_empty() {
            return Err(Error::validation("workflow_type must not be empty"));
        }

        if let Some(key) = request.idempotency_key.as_deref() {
            if let Some(existing) = self
                .store
                .workflow_by_idempotency_key(&request.workflow_type, key)
                .await?
            {
                tracing::info!(
                    workflow_id = %existing.id,
                    idempotency_key = key,
                    "workflow creation deduplicated"
                );
                return Ok(existing);
            }
        }

        let mut context = request.context;
        if let Some(schema) = &request.approval_schema {
            let JsonValue::Object(map) = &mut context else {
                return Err(Error::validation(
                    "context must be a JSON object when approval_schema is set",
                ));
            };
            map.insert(
                CTX_APPROVAL_SCHEMA.to_string(),
                serde_json::to_value(schema)
                    .map_err(|e| Error::serialization(format!("approval schema: {e}")))?,
            );
            if let Some(timeout) = request.approval_timeout_seconds {
                map.insert(CTX_APPROVAL_TIMEOUT.to_string(), JsonValue::from(timeout));
            }
        }

        let mut workflow = Workflow::new(request.workflow_type, context);
        workflow.max_retries = request.max_retries.unwrap_or(self.config.default_max_retries);
        workflow.is_multi_step = !request.steps.is_empty();
        workflow.idempotency_key = request.idempotency_key.clone();

        let mut uow = self.store.begin().await?;
        let mut outbox = Outbox::new();

        // Re-check under the transaction so a concurrent duplicate loses
        // to the unique index instead of creating a second workflow.
        if let Some(key) = request.idempotency_key.as_deref() {
            if let Some(existing) = uow
                .workflow_by_idempotency_key(&workflow.workflow_type, key)
                .await?
            {
                return Ok(existing);
            }
        }

        uow.insert_workflow(&workflow).await?;
        for (index, spec) in request.steps.iter().enumerate() {
            let index = u32::try_from(index)
                .map_err(|_| Error::validation("too many steps"))?;
            let step = Step::from_spec(workflow.id, index, spec);
            uow.insert_step(&step).await?;
        }

        record(
            uow.as_mut(),
            &mut outbox,
            FlowEventData::WorkflowCreated {
                workflow_id: workflow.id,
                workflow_type: workflow.workflow_type.clone(),
                is_multi_step: workflow.is_multi_step,
            },
        )
        .await?;

        uow.commit().await?;
        self.bus.publish_all(outbox.drain()).await?;

        tracing::info!(
            workflow_id = %workflow.id,
            workflow_type = %workflow.workflow_type,
            is_multi_step = workflow.is_multi_step,
            "workflow created"
        );
        Ok(workflow)
    }

    /// Reads a workflow.
    ///
    /// # Errors
    ///
    /// [`Error::WorkflowNotFound`] for unknown IDs.
    pub async fn workflow(&self, workflow_id: WorkflowId) -> Result<Workflow> {
        self.store
            .workflow(workflow_id)
            .await?
            .ok_or(Error::WorkflowNotFound { workflow_id })
    }

    /// Reads a workflow's audit history ordered by sequence.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub async fn workflow_events(
        &self,
        workflow_id: WorkflowId,
    ) -> Result<Vec<WorkflowEventRecord>> {
        self.store.events(workflow_id).await
    }

    /// Reads a workflow's steps ordered by index.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub async fn workflow_steps(&self, workflow_id: WorkflowId) -> Result<Vec<Step>> {
        self.store.steps(workflow_id).await
    }

    /// Lists workflows, optionally filtered by state.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub async fn list_workflows(
        &self,
        state: Option<WorkflowState>,
        limit: usize,
    ) -> Result<Vec<Workflow>> {
        self.store.list_workflows(state, limit).await
    }

    /// Reads an approval (the read surface omits nothing; facades strip
    /// the raw token before responding).
    ///
    /// # Errors
    ///
    /// [`Error::ApprovalNotFound`] for unknown IDs.
    pub async fn approval(&self, approval_id: ApprovalId) -> Result<Approval> {
        self.store
            .approval(approval_id)
            .await?
            .ok_or(Error::ApprovalNotFound { approval_id })
    }

    /// Lists dead letters, newest first.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        self.store.dead_letters(limit).await
    }

    /// Deletes a dead letter, returning whether it existed.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub async fn delete_dead_letter(&self, id: DeadLetterId) -> Result<bool> {
        self.store.delete_dead_letter(id).await
    }

    /// Re-publishes a dead-lettered event onto the bus and deletes the
    /// entry. Only entries holding a replayable event payload qualify.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] when the payload is not a bus event.
    pub async fn requeue_dead_letter(&self, id: DeadLetterId) -> Result<()> {
        let entries = self.store.dead_letters(10_000).await?;
        let Some(entry) = entries.into_iter().find(|entry| entry.id == id) else {
            return Err(Error::validation(format!("dead letter not found: {id}")));
        };

        let event: FlowEvent = serde_json::from_value(entry.payload.clone())
            .map_err(|e| Error::validation(format!("dead letter is not replayable: {e}")))?;

        self.bus.publish(event).await?;
        self.store.delete_dead_letter(id).await?;
        tracing::info!(dead_letter_id = %id, "dead letter requeued");
        Ok(())
    }

    /// The approval service.
    #[must_use]
    pub fn approvals(&self) -> Arc<ApprovalService> {
        Arc::clone(&self.approvals)
    }

    /// The state machine.
    #[must_use]
    pub fn machine(&self) -> Arc<StateMachine> {
        Arc::clone(&self.machine)
    }

    /// The step executor.
    #[must_use]
    pub fn executor(&self) -> Arc<StepExecutor> {
        Arc::clone(&self.executor)
    }

    /// The timeout manager (exposed so embedders and tests can tick it
    /// manually).
    #[must_use]
    pub fn timeout_manager(&self) -> Arc<TimeoutManager> {
        Arc::clone(&self.timeout_manager)
    }

    /// The callback intake for the HTTP facade.
    #[must_use]
    pub fn intake(&self) -> DecisionIntake {
        DecisionIntake::new(Arc::clone(&self.approvals))
    }

    /// The event bus.
    #[must_use]
    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }
}

/// Routes executor-relevant bus events into the executor.
struct ExecutorEventHandler {
    executor: Arc<StepExecutor>,
}

#[async_trait]
impl EventHandler for ExecutorEventHandler {
    fn name(&self) -> &str {
        "executor"
    }

    async fn handle(&self, event: &FlowEvent) -> Result<()> {
        match &event.data {
            FlowEventData::WorkflowCreated { workflow_id, .. } => {
                self.executor.on_created(*workflow_id).await
            }
            FlowEventData::ApprovalReceived {
                approval_id,
                decision,
                response_data,
                ..
            } => {
                self.executor
                    .on_decision(*approval_id, *decision, response_data.clone())
                    .await
            }
            FlowEventData::WorkflowRollbackRequested { workflow_id, .. } => {
                self.executor.on_rollback(*workflow_id).await
            }
            _ => Ok(()),
        }
    }
}

/// Bridges approval lifecycle events to an outbound notifier.
struct NotifierEventHandler {
    store: Arc<dyn Store>,
    notifier: Arc<dyn ApprovalNotifier>,
}

#[async_trait]
impl EventHandler for NotifierEventHandler {
    fn name(&self) -> &str {
        "notifier"
    }

    async fn handle(&self, event: &FlowEvent) -> Result<()> {
        match &event.data {
            FlowEventData::ApprovalRequested { approval_id, .. } => {
                let approval = self.load(*approval_id).await?;
                self.notifier
                    .approval_requested(&approval, &approval.callback_token)
                    .await
            }
            FlowEventData::ApprovalReceived {
                approval_id,
                decision,
                ..
            } => {
                let approval = self.load(*approval_id).await?;
                self.notifier.approval_decided(&approval, *decision).await
            }
            FlowEventData::ApprovalTimeout { approval_id, .. } => {
                let approval = self.load(*approval_id).await?;
                self.notifier.approval_timed_out(&approval).await
            }
            _ => Ok(()),
        }
    }
}

impl NotifierEventHandler {
    async fn load(&self, approval_id: ApprovalId) -> Result<Approval> {
        self.store
            .approval(approval_id)
            .await?
            .ok_or(Error::ApprovalNotFound { approval_id })
    }
}
