//! Background scanner for expired approvals and stalled workflows.
//!
//! A single task woken on a fixed interval. Each tick:
//!
//! 1. **Expiry scan**: pending approvals whose `expires_at` has passed go
//!    through the approval service's timeout path (row lock, PENDING
//!    re-check, workflow transition, `approval.timeout` publication). A
//!    concurrent submit that won the row lock first is simply skipped.
//! 2. **Retry scan**: workflows in `TIMEOUT`/`FAILED` with budget left
//!    are retried once their exponential backoff (with jitter) has
//!    elapsed; the executor then resumes them. Workflows out of budget
//!    are abandoned exactly once with a dead-letter entry recording the
//!    final state and last known error.
//!
//! Shutdown finishes the in-flight tick and exits; no orphan
//! transactions are left behind.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::histogram;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::approvals::ApprovalService;
use crate::config::{RetryPolicy, TimeoutConfig};
use crate::dlq::{DeadLetter, WORKFLOW_ABANDONED};
use crate::error::Result;
use crate::executor::StepExecutor;
use crate::machine::StateMachine;
use crate::metrics::{names, TimingGuard};
use crate::store::Store;
use crate::workflow::{Workflow, WorkflowState};

/// Periodic scanner that expires approvals and retries stalled workflows.
pub struct TimeoutManager {
    store: Arc<dyn Store>,
    machine: Arc<StateMachine>,
    approvals: Arc<ApprovalService>,
    executor: Arc<StepExecutor>,
    config: TimeoutConfig,
    retry_policy: RetryPolicy,
}

impl TimeoutManager {
    /// Creates a timeout manager.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        machine: Arc<StateMachine>,
        approvals: Arc<ApprovalService>,
        executor: Arc<StepExecutor>,
        config: TimeoutConfig,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            machine,
            approvals,
            executor,
            config,
            retry_policy,
        }
    }

    /// Spawns the scan loop. It runs until `shutdown` flips to `true`,
    /// always finishing the tick in flight.
    #[must_use]
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let interval = self.config.scan_interval;
        tokio::spawn(async move {
            tracing::info!(interval_secs = interval.as_secs(), "timeout manager started");
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.tick().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("timeout manager stopped");
        })
    }

    /// Runs one scan. Public so tests and embedders can tick manually.
    pub async fn tick(&self) {
        let _timing = TimingGuard::new(|duration| {
            histogram!(names::TIMEOUT_SCAN_SECONDS).record(duration.as_secs_f64());
        });

        if let Err(err) = self.expire_pending().await {
            tracing::error!(error = %err, "expiry scan failed");
        }
        if let Err(err) = self.process_stalled().await {
            tracing::error!(error = %err, "retry scan failed");
        }
    }

    /// Expires pending approvals whose deadline passed.
    async fn expire_pending(&self) -> Result<()> {
        let expired = self
            .store
            .expired_approvals(Utc::now(), self.config.scan_batch_size)
            .await?;
        if expired.is_empty() {
            return Ok(());
        }

        tracing::info!(count = expired.len(), "expired approvals found");
        for approval in expired {
            // A failure on one candidate must not starve the rest of the
            // batch; skip to the next.
            match self.approvals.timeout(approval.id).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    tracing::debug!(
                        approval_id = %approval.id,
                        "expiry skipped: decision landed first"
                    );
                }
                Err(err) if err.is_concurrent_modification() => {
                    tracing::debug!(
                        approval_id = %approval.id,
                        "expiry skipped: lost workflow version race"
                    );
                }
                Err(err) => {
                    tracing::error!(
                        approval_id = %approval.id,
                        error = %err,
                        "expiry processing failed"
                    );
                }
            }
        }
        Ok(())
    }

    /// Retries or abandons workflows sitting in `TIMEOUT`/`FAILED`.
    async fn process_stalled(&self) -> Result<()> {
        let stalled = self
            .store
            .stalled_workflows(self.config.scan_batch_size)
            .await?;

        for workflow in stalled {
            if workflow.state == WorkflowState::Failed && !self.config.retry_failed_workflows {
                continue;
            }

            if workflow.has_retry_budget() {
                if !self.backoff_elapsed(&workflow) {
                    continue;
                }
                match self.machine.retry(workflow.id).await {
                    Ok(_) => {
                        if let Err(err) = self.executor.resume(workflow.id).await {
                            tracing::error!(
                                workflow_id = %workflow.id,
                                error = %err,
                                "resume after retry failed"
                            );
                        }
                    }
                    Err(err) if err.is_concurrent_modification() => {
                        tracing::debug!(
                            workflow_id = %workflow.id,
                            "retry skipped: lost version race"
                        );
                    }
                    Err(err) => {
                        tracing::error!(
                            workflow_id = %workflow.id,
                            error = %err,
                            "retry failed"
                        );
                    }
                }
            } else if let Err(err) = self.abandon(&workflow).await {
                tracing::error!(
                    workflow_id = %workflow.id,
                    error = %err,
                    "abandon failed"
                );
            }
        }
        Ok(())
    }

    /// Returns true once the workflow's backoff delay has elapsed since
    /// it entered its stalled state.
    fn backoff_elapsed(&self, workflow: &Workflow) -> bool {
        let delay = jittered(self.retry_policy.delay_for(workflow.retry_count));
        let eligible_at = workflow.updated_at
            + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        Utc::now() >= eligible_at
    }

    /// Writes the one-time dead-letter entry for a workflow whose retry
    /// budget is spent. No further action is ever taken for it.
    async fn abandon(&self, workflow: &Workflow) -> Result<()> {
        if self
            .store
            .dead_letter_exists(workflow.id, WORKFLOW_ABANDONED)
            .await?
        {
            return Ok(());
        }

        let last_error = self
            .store
            .events(workflow.id)
            .await?
            .iter()
            .rev()
            .find_map(|ev| {
                ev.payload
                    .get("error")
                    .and_then(serde_json::Value::as_str)
                    .map(ToString::to_string)
            })
            .unwrap_or_else(|| format!("workflow stalled in {}", workflow.state));

        let entry = DeadLetter::new(
            WORKFLOW_ABANDONED,
            serde_json::json!({
                "workflowId": workflow.id.to_string(),
                "workflowType": workflow.workflow_type,
                "state": workflow.state,
                "retryCount": workflow.retry_count,
                "maxRetries": workflow.max_retries,
                "context": workflow.context,
            }),
            format!(
                "retry budget exhausted ({}/{}): {last_error}",
                workflow.retry_count, workflow.max_retries
            ),
            workflow.retry_count,
            Some(workflow.id),
        );
        self.store.insert_dead_letter(&entry).await?;

        tracing::warn!(
            workflow_id = %workflow.id,
            state = %workflow.state,
            retry_count = workflow.retry_count,
            "workflow abandoned to dead-letter queue"
        );
        Ok(())
    }
}

/// Applies +/-20% jitter so synchronized retries spread out.
fn jittered(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8..1.2);
    delay.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let base = Duration::from_secs(10);
        for _ in 0..100 {
            let jittered = jittered(base);
            assert!(jittered >= Duration::from_secs(8));
            assert!(jittered <= Duration::from_secs(12));
        }
    }
}
