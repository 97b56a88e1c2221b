//! Concurrency scenarios: decision races, timeout races, and
//! double-advance protection.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value as JsonValue};

use signoff_core::signing::SigningConfig;
use signoff_core::ApprovalId;
use signoff_flow::approval::{ApprovalStatus, Decision, UiSchema};
use signoff_flow::config::{BusConfig, DurationSecs, FlowConfig, RetryPolicy, TimeoutConfig};
use signoff_flow::error::{Error, Result};
use signoff_flow::registry::{task_fn, TaskRegistry};
use signoff_flow::runtime::{CreateWorkflowRequest, Orchestrator};
use signoff_flow::step::StepSpec;
use signoff_flow::store::memory::MemoryStore;
use signoff_flow::workflow::WorkflowState;

/// Config whose timeout manager never ticks on its own, so tests control
/// the race timing themselves.
fn manual_config() -> FlowConfig {
    FlowConfig {
        signing: SigningConfig::new("concurrency-test-key"),
        database_url: None,
        default_approval_timeout: DurationSecs(3600),
        default_max_retries: 3,
        bus: BusConfig {
            queue_size: 64,
            max_attempts: 2,
            backoff_initial: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        },
        timeout: TimeoutConfig {
            scan_interval: Duration::from_secs(3600),
            scan_batch_size: 100,
            retry_failed_workflows: true,
        },
        retry: RetryPolicy {
            initial: Duration::from_millis(50),
            multiplier: 2.0,
            max: Duration::from_secs(1),
        },
    }
}

fn orchestrator() -> Orchestrator {
    let store = Arc::new(MemoryStore::new());
    let orchestrator = Orchestrator::new(manual_config(), store, TaskRegistry::new());
    orchestrator.start();
    orchestrator
}

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

async fn waiting_approval(
    orchestrator: &Orchestrator,
    timeout_seconds: u64,
) -> Result<(signoff_core::WorkflowId, ApprovalId, String)> {
    let workflow = orchestrator
        .create_workflow(
            CreateWorkflowRequest::new("deployment")
                .with_context(json!({"env": "prod"}))
                .with_approval_schema(UiSchema::titled("Deploy?"))
                .with_approval_timeout(timeout_seconds),
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
    let approval_id: ApprovalId = events
        .iter()
        .rev()
        .find(|ev| ev.event_type.as_str() == "approval.requested")
        .and_then(|ev| ev.payload.get("approvalId"))
        .and_then(JsonValue::as_str)
        .expect("approval.requested present")
        .parse()
        .expect("approval id parses");
    let token = orchestrator.approval(approval_id).await?.callback_token;
    Ok((workflow.id, approval_id, token))
}

#[tokio::test]
async fn concurrent_submits_one_wins_one_conflicts() -> Result<()> {
    let orchestrator = orchestrator();
    let (_workflow_id, approval_id, token) = waiting_approval(&orchestrator, 3600).await?;

    let approvals = orchestrator.approvals();
    let (first, second) = tokio::join!(
        approvals.submit(&token, Decision::Approve, json!({"reviewer_name": "alice"})),
        approvals.submit(&token, Decision::Reject, json!({"rejection_reason": "no"})),
    );

    let successes = [&first, &second].iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1, "exactly one submit must win");

    let loser = if first.is_ok() { second } else { first };
    assert!(
        matches!(loser, Err(Error::AlreadyDecided { .. })),
        "the loser observes AlreadyDecided"
    );

    // The recorded decision is the winner's, reached exactly once.
    let approval = orchestrator.approval(approval_id).await?;
    assert!(approval.is_terminal());
    assert!(approval.responded_at.is_some());

    orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn duplicate_submit_is_idempotent_conflict() -> Result<()> {
    let orchestrator = orchestrator();
    let (_workflow_id, approval_id, token) = waiting_approval(&orchestrator, 3600).await?;

    let approvals = orchestrator.approvals();
    approvals
        .submit(&token, Decision::Approve, json!({"reviewer_name": "alice"}))
        .await?;

    let err = approvals
        .submit(&token, Decision::Approve, json!({"reviewer_name": "alice"}))
        .await
        .expect_err("second submit must conflict");
    assert!(matches!(
        err,
        Error::AlreadyDecided {
            status: ApprovalStatus::Approved,
            ..
        }
    ));

    let approval = orchestrator.approval(approval_id).await?;
    assert_eq!(approval.status, ApprovalStatus::Approved);

    orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn submit_racing_timeout_tick_serializes_on_the_row_lock() -> Result<()> {
    let orchestrator = orchestrator();
    let (workflow_id, approval_id, token) = waiting_approval(&orchestrator, 1).await?;

    // Let the deadline pass while both contenders still see PENDING.
    tokio::time::sleep(Duration::from_millis(1100)).await;

    let approvals = orchestrator.approvals();
    let (submitted, timed_out) = tokio::join!(
        approvals.submit(&token, Decision::Approve, json!({})),
        approvals.timeout(approval_id),
    );

    // The submit can never sneak past an elapsed deadline: expiry is
    // checked before status, so it loses no matter who locked first.
    assert!(matches!(submitted, Err(Error::ApprovalExpired { .. })));

    // The timeout side either marked it or found it already terminal.
    match timed_out {
        Ok(Some(approval)) => assert_eq!(approval.status, ApprovalStatus::Timeout),
        Ok(None) | Err(_) => {}
    }

    eventually("workflow reaches TIMEOUT", || async {
        orchestrator
            .workflow(workflow_id)
            .await
            .is_ok_and(|wf| wf.state == WorkflowState::Timeout)
    })
    .await;

    orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn just_expired_approval_rejects_submit_even_while_pending() -> Result<()> {
    let orchestrator = orchestrator();
    let (_workflow_id, approval_id, token) = waiting_approval(&orchestrator, 1).await?;

    tokio::time::sleep(Duration::from_millis(1100)).await;

    // The scanner has not ticked (manual config): status is still
    // PENDING, yet the decision must be refused.
    let approval = orchestrator.approval(approval_id).await?;
    assert_eq!(approval.status, ApprovalStatus::Pending);

    let err = orchestrator
        .approvals()
        .submit(&token, Decision::Approve, json!({}))
        .await
        .expect_err("expired approval must refuse decisions");
    assert!(matches!(err, Error::ApprovalExpired { .. }));

    orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn double_advance_is_prevented_by_the_version_guard() -> Result<()> {
    let mut registry = TaskRegistry::new();
    registry.register("work", task_fn(|_input: JsonValue| async move {
        Ok(json!({"ok": true}))
    }));

    let store = Arc::new(MemoryStore::new());
    let orchestrator = Orchestrator::new(manual_config(), store, registry);
    orchestrator.start();

    let workflow = orchestrator
        .create_workflow(CreateWorkflowRequest::new("batch").with_steps(vec![
            StepSpec::task("work", json!({})),
            StepSpec::task("work", json!({})),
            StepSpec::task("work", json!({})),
        ]))
        .await?;

    eventually("pipeline completes", || async {
        orchestrator
            .workflow(workflow.id)
            .await
            .is_ok_and(|wf| wf.state == WorkflowState::Completed)
    })
    .await;

    // A second executor instance racing the same workflow exits cleanly.
    let executor = orchestrator.executor();
    let (a, b) = tokio::join!(executor.advance(workflow.id), executor.advance(workflow.id));
    a?;
    b?;

    // Each step started exactly once despite the racing instances.
    let events = orchestrator.workflow_events(workflow.id).await?;
    let started = events
        .iter()
        .filter(|ev| ev.event_type.as_str() == "step.started")
        .count();
    assert_eq!(started, 3);
    let completed_steps = events
        .iter()
        .filter(|ev| ev.event_type.as_str() == "step.completed")
        .count();
    assert_eq!(completed_steps, 3);

    orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn tampered_token_is_rejected_while_the_original_works() -> Result<()> {
    let orchestrator = orchestrator();
    let (_workflow_id, _approval_id, token) = waiting_approval(&orchestrator, 3600).await?;

    // Flip the leading character of the claims segment; the embedded
    // approval ID no longer matches the MAC.
    let claims_start = token.find('.').expect("token has segments") + 1;
    let mut tampered = token.clone().into_bytes();
    tampered[claims_start] = if tampered[claims_start] == b'A' {
        b'B'
    } else {
        b'A'
    };
    let tampered = String::from_utf8(tampered).expect("still utf8");

    let err = orchestrator
        .approvals()
        .submit(&tampered, Decision::Approve, json!({}))
        .await
        .expect_err("tampered token must be rejected");
    assert!(matches!(err, Error::TokenInvalid { .. }));

    orchestrator
        .approvals()
        .submit(&token, Decision::Approve, json!({}))
        .await?;

    orchestrator.shutdown().await;
    Ok(())
}
