//! End-to-end orchestration scenarios against the in-memory store.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value as JsonValue};

use signoff_core::signing::SigningConfig;
use signoff_core::ApprovalId;
use signoff_flow::approval::{ApprovalStatus, UiSchema};
use signoff_flow::callbacks::DecisionRequest;
use signoff_flow::config::{BusConfig, DurationSecs, FlowConfig, RetryPolicy, TimeoutConfig};
use signoff_flow::dlq::WORKFLOW_ABANDONED;
use signoff_flow::error::Result;
use signoff_flow::registry::{task_fn, TaskRegistry};
use signoff_flow::runtime::{CreateWorkflowRequest, Orchestrator};
use signoff_flow::step::{StepSpec, StepStatus};
use signoff_flow::store::memory::MemoryStore;
use signoff_flow::workflow::WorkflowState;

fn test_config() -> FlowConfig {
    FlowConfig {
        signing: SigningConfig::new("integration-test-key"),
        database_url: None,
        default_approval_timeout: DurationSecs(3600),
        default_max_retries: 3,
        bus: BusConfig {
            queue_size: 64,
            max_attempts: 3,
            backoff_initial: Duration::from_millis(10),
            backoff_multiplier: 2.0,
        },
        timeout: TimeoutConfig {
            scan_interval: Duration::from_millis(100),
            scan_batch_size: 100,
            retry_failed_workflows: true,
        },
        retry: RetryPolicy {
            initial: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_secs(1),
        },
    }
}

fn orchestrator_with(registry: TaskRegistry) -> Orchestrator {
    let store = Arc::new(MemoryStore::new());
    let orchestrator = Orchestrator::new(test_config(), store, registry);
    orchestrator.start();
    orchestrator
}

fn orchestrator() -> Orchestrator {
    orchestrator_with(TaskRegistry::new())
}

/// Polls until `probe` reports true or the deadline passes.
async fn eventually<F, Fut>(what: &str, mut probe: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if probe().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Extracts the newest approval ID from the workflow's audit history.
async fn latest_approval_id(
    orchestrator: &Orchestrator,
    workflow_id: signoff_core::WorkflowId,
) -> Result<ApprovalId> {
    let events = orchestrator.workflow_events(workflow_id).await?;
    let id = events
        .iter()
        .rev()
        .find(|ev| ev.event_type.as_str() == "approval.requested")
        .and_then(|ev| ev.payload.get("approvalId"))
        .and_then(JsonValue::as_str)
        .expect("approval.requested event present");
    Ok(id.parse().expect("approval id parses"))
}

fn state_changes(events: &[signoff_flow::events::WorkflowEventRecord]) -> Vec<(String, String)> {
    events
        .iter()
        .filter(|ev| ev.event_type.as_str() == "workflow.state_changed")
        .map(|ev| {
            (
                ev.payload["from"].as_str().unwrap_or_default().to_string(),
                ev.payload["to"].as_str().unwrap_or_default().to_string(),
            )
        })
        .collect()
}

#[tokio::test]
async fn single_step_approval_approved() -> Result<()> {
    let orchestrator = orchestrator();

    let workflow = orchestrator
        .create_workflow(
            CreateWorkflowRequest::new("deployment")
                .with_context(json!({"env": "prod", "version": "v2.5.0"}))
                .with_approval_schema(UiSchema::titled("Deploy?"))
                .with_approval_timeout(3600),
        )
        .await?;

    eventually("workflow waits for approval", || async {
        orchestrator
            .workflow(workflow.id)
            .await
            .is_ok_and(|wf| wf.state == WorkflowState::WaitingApproval)
    })
    .await;

    let events = orchestrator.workflow_events(workflow.id).await?;
    assert!(events
        .iter()
        .any(|ev| ev.event_type.as_str() == "approval.requested"));

    let approval_id = latest_approval_id(&orchestrator, workflow.id).await?;
    let approval = orchestrator.approval(approval_id).await?;

    let result = orchestrator
        .intake()
        .submit(
            &approval.callback_token,
            DecisionRequest {
                decision: "approve".to_string(),
                response_data: json!({"reviewer_name": "alice"}),
            },
        )
        .await;
    assert_eq!(result.status_code(), 200);

    eventually("workflow completes", || async {
        orchestrator
            .workflow(workflow.id)
            .await
            .is_ok_and(|wf| wf.state == WorkflowState::Completed)
    })
    .await;

    let events = orchestrator.workflow_events(workflow.id).await?;
    let changes = state_changes(&events);
    let tail: Vec<(String, String)> = changes.iter().rev().take(3).rev().cloned().collect();
    assert_eq!(
        tail,
        vec![
            ("RUNNING".to_string(), "WAITING_APPROVAL".to_string()),
            ("WAITING_APPROVAL".to_string(), "APPROVED".to_string()),
            ("APPROVED".to_string(), "COMPLETED".to_string()),
        ]
    );

    let received = events
        .iter()
        .find(|ev| ev.event_type.as_str() == "approval.received")
        .expect("approval.received event");
    assert_eq!(received.payload["decision"], "approve");
    assert_eq!(received.payload["responseData"]["reviewer_name"], "alice");

    // Version history is strictly increasing by construction; final
    // version reflects one bump per persisted mutation.
    let workflow = orchestrator.workflow(workflow.id).await?;
    assert_eq!(workflow.version, 1 + u64::try_from(changes.len()).unwrap());

    orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn rejected_then_rolled_back_then_approved() -> Result<()> {
    let orchestrator = orchestrator();

    let workflow = orchestrator
        .create_workflow(
            CreateWorkflowRequest::new("deployment")
                .with_context(json!({"env": "prod"}))
                .with_approval_schema(UiSchema::titled("Deploy?"))
                .with_approval_timeout(3600),
        )
        .await?;

    eventually("workflow waits for approval", || async {
        orchestrator
            .workflow(workflow.id)
            .await
            .is_ok_and(|wf| wf.state == WorkflowState::WaitingApproval)
    })
    .await;

    let approval_id = latest_approval_id(&orchestrator, workflow.id).await?;
    let approval = orchestrator.approval(approval_id).await?;

    let result = orchestrator
        .intake()
        .submit(
            &approval.callback_token,
            DecisionRequest {
                decision: "reject".to_string(),
                response_data: json!({"rejection_reason": "blocked"}),
            },
        )
        .await;
    assert_eq!(result.status_code(), 200);

    eventually("workflow rejected", || async {
        orchestrator
            .workflow(workflow.id)
            .await
            .is_ok_and(|wf| wf.state == WorkflowState::Rejected)
    })
    .await;

    orchestrator.approvals().rollback(approval_id).await?;

    let reopened = orchestrator.approval(approval_id).await?;
    assert_eq!(reopened.status, ApprovalStatus::Pending);
    assert!(reopened.decision.is_none());

    let workflow_now = orchestrator.workflow(workflow.id).await?;
    assert!(matches!(
        workflow_now.state,
        WorkflowState::Running | WorkflowState::WaitingApproval
    ));

    // The executor re-enters the wait on the same approval; no duplicate
    // is minted.
    eventually("workflow waits again", || async {
        orchestrator
            .workflow(workflow.id)
            .await
            .is_ok_and(|wf| wf.state == WorkflowState::WaitingApproval)
    })
    .await;

    let result = orchestrator
        .intake()
        .submit(
            &reopened.callback_token,
            DecisionRequest {
                decision: "approve".to_string(),
                response_data: json!({"reviewer_name": "bob"}),
            },
        )
        .await;
    assert_eq!(result.status_code(), 200);

    eventually("workflow completes after rollback", || async {
        orchestrator
            .workflow(workflow.id)
            .await
            .is_ok_and(|wf| wf.state == WorkflowState::Completed)
    })
    .await;

    orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn expired_before_decision_times_out_and_late_post_is_gone() -> Result<()> {
    let orchestrator = orchestrator();

    let workflow = orchestrator
        .create_workflow(
            CreateWorkflowRequest::new("deployment")
                .with_context(json!({"env": "prod"}))
                .with_approval_schema(UiSchema::titled("Deploy?"))
                .with_approval_timeout(1)
                .with_max_retries(0),
        )
        .await?;

    eventually("workflow waits for approval", || async {
        orchestrator
            .workflow(workflow.id)
            .await
            .is_ok_and(|wf| wf.state == WorkflowState::WaitingApproval)
    })
    .await;
    let approval_id = latest_approval_id(&orchestrator, workflow.id).await?;
    let token = orchestrator.approval(approval_id).await?.callback_token;

    eventually("timeout manager expires the approval", || async {
        orchestrator
            .workflow(workflow.id)
            .await
            .is_ok_and(|wf| wf.state == WorkflowState::Timeout)
    })
    .await;

    let approval = orchestrator.approval(approval_id).await?;
    assert_eq!(approval.status, ApprovalStatus::Timeout);
    assert!(approval.responded_at.expect("responded_at set") >= approval.expires_at);

    let events = orchestrator.workflow_events(workflow.id).await?;
    assert!(events
        .iter()
        .any(|ev| ev.event_type.as_str() == "approval.timeout"));

    // Late decision: 410, always, even though the body is well-formed.
    let result = orchestrator
        .intake()
        .submit(
            &token,
            DecisionRequest {
                decision: "approve".to_string(),
                response_data: json!({}),
            },
        )
        .await;
    assert_eq!(result.status_code(), 410);

    // Zero retry budget: the workflow is abandoned with a dead letter.
    eventually("workflow abandoned to the DLQ", || async {
        orchestrator
            .dead_letters(10)
            .await
            .is_ok_and(|entries| entries.iter().any(|e| e.event_type == WORKFLOW_ABANDONED))
    })
    .await;

    orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn multi_step_pipeline_runs_tasks_and_approvals_in_order() -> Result<()> {
    let invocations: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let mut registry = TaskRegistry::new();
    for name in ["validate", "deploy"] {
        let log = Arc::clone(&invocations);
        registry.register(name, task_fn(move |input: JsonValue| {
            let log = Arc::clone(&log);
            async move {
                let me = input["handler"].as_str().unwrap_or("unknown").to_string();
                log.lock().expect("log lock").push(me.clone());
                Ok(json!({"ran": me}))
            }
        }));
    }

    let orchestrator = orchestrator_with(registry);

    let workflow = orchestrator
        .create_workflow(
            CreateWorkflowRequest::new("release").with_steps(vec![
                StepSpec::task("validate", json!({"handler": "validate"})),
                StepSpec::approval(json!({
                    "ui_schema": {"title": "Security review"},
                    "timeout_seconds": 3600,
                })),
                StepSpec::task("deploy", json!({"handler": "deploy"})),
                StepSpec::approval(json!({
                    "ui_schema": {"title": "Verify"},
                    "timeout_seconds": 3600,
                })),
            ]),
        )
        .await?;

    eventually("first approval gate reached", || async {
        orchestrator
            .workflow(workflow.id)
            .await
            .is_ok_and(|wf| wf.state == WorkflowState::WaitingApproval)
    })
    .await;

    let steps = orchestrator.workflow_steps(workflow.id).await?;
    assert_eq!(steps[0].status, StepStatus::Completed);
    assert_eq!(steps[1].status, StepStatus::Running);
    assert_eq!(steps[2].status, StepStatus::Pending);
    assert_eq!(*invocations.lock().expect("log lock"), vec!["validate"]);

    let first_gate = latest_approval_id(&orchestrator, workflow.id).await?;
    let token = orchestrator.approval(first_gate).await?.callback_token;
    let result = orchestrator
        .intake()
        .submit(
            &token,
            DecisionRequest {
                decision: "approve".to_string(),
                response_data: json!({"reviewer_name": "security"}),
            },
        )
        .await;
    assert_eq!(result.status_code(), 200);

    eventually("second approval gate reached", || async {
        let Ok(steps) = orchestrator.workflow_steps(workflow.id).await else {
            return false;
        };
        steps[3].status == StepStatus::Running
    })
    .await;

    let steps = orchestrator.workflow_steps(workflow.id).await?;
    assert_eq!(steps[1].status, StepStatus::Completed);
    assert_eq!(steps[2].status, StepStatus::Completed);
    assert_eq!(
        *invocations.lock().expect("log lock"),
        vec!["validate", "deploy"]
    );

    let second_gate = latest_approval_id(&orchestrator, workflow.id).await?;
    assert_ne!(second_gate, first_gate);
    let token = orchestrator.approval(second_gate).await?.callback_token;
    let result = orchestrator
        .intake()
        .submit(
            &token,
            DecisionRequest {
                decision: "approve".to_string(),
                response_data: json!({"reviewer_name": "release"}),
            },
        )
        .await;
    assert_eq!(result.status_code(), 200);

    eventually("pipeline completes", || async {
        orchestrator
            .workflow(workflow.id)
            .await
            .is_ok_and(|wf| wf.state == WorkflowState::Completed)
    })
    .await;

    let steps = orchestrator.workflow_steps(workflow.id).await?;
    assert!(steps.iter().all(|s| s.status == StepStatus::Completed));

    orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn missing_signing_key_rejects_every_callback() {
    let mut config = test_config();
    config.signing = SigningConfig::disabled();
    let store = Arc::new(MemoryStore::new());
    let orchestrator = Orchestrator::new(config, store, TaskRegistry::new());
    orchestrator.start();

    for body in [
        DecisionRequest {
            decision: "approve".to_string(),
            response_data: json!({}),
        },
        DecisionRequest {
            decision: "reject".to_string(),
            response_data: json!({"reason": "nope"}),
        },
        DecisionRequest {
            decision: "not-a-decision".to_string(),
            response_data: json!({}),
        },
    ] {
        let result = orchestrator.intake().submit("any-token-at-all", body).await;
        assert_eq!(result.status_code(), 401);
    }

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn idempotent_creation_returns_the_same_workflow() -> Result<()> {
    let orchestrator = orchestrator();

    let request = CreateWorkflowRequest::new("deployment")
        .with_context(json!({"env": "prod"}))
        .with_idempotency_key("deploy-2024-42");

    let first = orchestrator.create_workflow(request.clone()).await?;
    eventually("first creation settles", || async {
        orchestrator
            .workflow(first.id)
            .await
            .is_ok_and(|wf| wf.state.is_terminal() || wf.state == WorkflowState::WaitingApproval)
    })
    .await;

    let second = orchestrator.create_workflow(request).await?;
    assert_eq!(first.id, second.id);

    let events = orchestrator.workflow_events(first.id).await?;
    let created: Vec<_> = events
        .iter()
        .filter(|ev| ev.event_type.as_str() == "workflow.created")
        .collect();
    assert_eq!(created.len(), 1);

    orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn rejected_pipeline_keeps_completed_steps_and_compensates() -> Result<()> {
    let compensated: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    struct Undo {
        log: Arc<Mutex<Vec<String>>>,
        name: &'static str,
    }

    #[async_trait::async_trait]
    impl signoff_flow::registry::CompensationHandler for Undo {
        async fn compensate(&self, _output: &JsonValue) -> Result<()> {
            self.log
                .lock()
                .expect("log lock")
                .push(self.name.to_string());
            Ok(())
        }
    }

    let mut registry = TaskRegistry::new();
    for name in ["provision", "configure"] {
        registry.register_with_compensation(
            name,
            task_fn(move |_input: JsonValue| async move { Ok(json!({"done": true})) }),
            Arc::new(Undo {
                log: Arc::clone(&compensated),
                name: if name == "provision" {
                    "provision"
                } else {
                    "configure"
                },
            }),
        );
    }

    let orchestrator = orchestrator_with(registry);
    let workflow = orchestrator
        .create_workflow(CreateWorkflowRequest::new("provisioning").with_steps(vec![
            StepSpec::task("provision", json!({})),
            StepSpec::task("configure", json!({})),
            StepSpec::approval(json!({"ui_schema": {"title": "Go live?"}})),
        ]))
        .await?;

    eventually("approval gate reached", || async {
        orchestrator
            .workflow(workflow.id)
            .await
            .is_ok_and(|wf| wf.state == WorkflowState::WaitingApproval)
    })
    .await;

    let gate = latest_approval_id(&orchestrator, workflow.id).await?;
    let token = orchestrator.approval(gate).await?.callback_token;
    let result = orchestrator
        .intake()
        .submit(
            &token,
            DecisionRequest {
                decision: "reject".to_string(),
                response_data: json!({"rejection_reason": "failed audit"}),
            },
        )
        .await;
    assert_eq!(result.status_code(), 200);

    eventually("compensation ran in reverse order", || async {
        *compensated.lock().expect("log lock") == vec!["configure", "provision"]
    })
    .await;

    // Statuses survive rejection; only external effects were undone.
    let workflow_now = orchestrator.workflow(workflow.id).await?;
    assert_eq!(workflow_now.state, WorkflowState::Rejected);
    let steps = orchestrator.workflow_steps(workflow.id).await?;
    assert_eq!(steps[0].status, StepStatus::Completed);
    assert_eq!(steps[1].status, StepStatus::Completed);
    assert_eq!(steps[2].status, StepStatus::Failed);

    orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn notifier_adapter_sees_the_approval_lifecycle() -> Result<()> {
    use signoff_flow::adapters::{MemoryNotifier, NotifierCall};

    let store = Arc::new(MemoryStore::new());
    let orchestrator = Orchestrator::new(test_config(), store, TaskRegistry::new());
    let notifier = Arc::new(MemoryNotifier::new());
    orchestrator.attach_notifier(Arc::clone(&notifier) as _);
    orchestrator.start();

    let workflow = orchestrator
        .create_workflow(
            CreateWorkflowRequest::new("deployment")
                .with_context(json!({"env": "prod"}))
                .with_approval_schema(UiSchema::titled("Deploy?")),
        )
        .await?;

    eventually("workflow waits for approval", || async {
        orchestrator
            .workflow(workflow.id)
            .await
            .is_ok_and(|wf| wf.state == WorkflowState::WaitingApproval)
    })
    .await;

    let approval_id = latest_approval_id(&orchestrator, workflow.id).await?;
    eventually("notifier saw the request", || async {
        notifier
            .calls()
            .iter()
            .any(|call| matches!(call, NotifierCall::Requested { approval_id: id } if *id == approval_id.to_string()))
    })
    .await;

    let token = orchestrator.approval(approval_id).await?.callback_token;
    orchestrator
        .intake()
        .submit(
            &token,
            DecisionRequest {
                decision: "approve".to_string(),
                response_data: json!({}),
            },
        )
        .await;

    eventually("notifier saw the decision", || async {
        notifier
            .calls()
            .iter()
            .any(|call| matches!(call, NotifierCall::Decided { .. }))
    })
    .await;

    orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn timed_out_workflow_retries_and_can_complete() -> Result<()> {
    let orchestrator = orchestrator();

    let workflow = orchestrator
        .create_workflow(
            CreateWorkflowRequest::new("deployment")
                .with_context(json!({"env": "staging"}))
                .with_approval_schema(UiSchema::titled("Deploy?"))
                .with_approval_timeout(2)
                .with_max_retries(2),
        )
        .await?;

    eventually("workflow waits for approval", || async {
        orchestrator
            .workflow(workflow.id)
            .await
            .is_ok_and(|wf| wf.state == WorkflowState::WaitingApproval)
    })
    .await;
    let first_approval = latest_approval_id(&orchestrator, workflow.id).await?;

    // Expiry, then an automatic retry that mints a fresh approval.
    eventually("retry re-requests the approval", || async {
        let Ok(wf) = orchestrator.workflow(workflow.id).await else {
            return false;
        };
        wf.state == WorkflowState::WaitingApproval && wf.retry_count == 1
    })
    .await;

    let second_approval = latest_approval_id(&orchestrator, workflow.id).await?;
    assert_ne!(second_approval, first_approval);

    let token = orchestrator.approval(second_approval).await?.callback_token;
    let result = orchestrator
        .intake()
        .submit(
            &token,
            DecisionRequest {
                decision: "approve".to_string(),
                response_data: json!({"reviewer_name": "carol"}),
            },
        )
        .await;
    assert_eq!(result.status_code(), 200);

    eventually("workflow completes after retry", || async {
        orchestrator
            .workflow(workflow.id)
            .await
            .is_ok_and(|wf| wf.state == WorkflowState::Completed)
    })
    .await;

    orchestrator.shutdown().await;
    Ok(())
}
