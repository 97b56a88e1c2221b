//! Contracts for out-of-core messaging adapters.
//!
//! Rendering an approval per channel (chat blocks, email, dashboard) is
//! an adapter concern; the kernel only defines the notification trait it
//! calls through the event bus and the signature validation adapters use
//! for inbound payloads (see [`signoff_core::signing`]).

use std::sync::Mutex;

use async_trait::async_trait;

use crate::approval::{Approval, Decision};
use crate::error::Result;

/// Outbound notifications about approval lifecycle changes.
///
/// Implementations deliver to their channel (Slack, email, ...). Errors
/// propagate into the event bus's retry/dead-letter handling, so a flaky
/// channel never blocks orchestration.
#[async_trait]
pub trait ApprovalNotifier: Send + Sync {
    /// A new approval awaits a decision. `callback_token` is the signed
    /// token the channel must embed in its action targets.
    async fn approval_requested(&self, approval: &Approval, callback_token: &str) -> Result<()>;

    /// A decision was recorded.
    async fn approval_decided(&self, approval: &Approval, decision: Decision) -> Result<()>;

    /// The approval expired undecided.
    async fn approval_timed_out(&self, approval: &Approval) -> Result<()>;
}

/// A recorded notifier call, for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifierCall {
    /// `approval_requested` was invoked.
    Requested {
        /// The approval ID.
        approval_id: String,
    },
    /// `approval_decided` was invoked.
    Decided {
        /// The approval ID.
        approval_id: String,
        /// The decision.
        decision: Decision,
    },
    /// `approval_timed_out` was invoked.
    TimedOut {
        /// The approval ID.
        approval_id: String,
    },
}

/// In-memory notifier for testing.
///
/// Records every call; not suitable for production.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    calls: Mutex<Vec<NotifierCall>>,
}

impl MemoryNotifier {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the calls recorded so far.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock is poisoned.
    #[must_use]
    pub fn calls(&self) -> Vec<NotifierCall> {
        self.calls.lock().expect("notifier lock poisoned").clone()
    }
}

#[async_trait]
impl ApprovalNotifier for MemoryNotifier {
    async fn approval_requested(&self, approval: &Approval, _callback_token: &str) -> Result<()> {
        self.calls
            .lock()
            .expect("notifier lock poisoned")
            .push(NotifierCall::Requested {
                approval_id: approval.id.to_string(),
            });
        Ok(())
    }

    async fn approval_decided(&self, approval: &Approval, decision: Decision) -> Result<()> {
        self.calls
            .lock()
            .expect("notifier lock poisoned")
            .push(NotifierCall::Decided {
                approval_id: approval.id.to_string(),
                decision,
            });
        Ok(())
    }

    async fn approval_timed_out(&self, approval: &Approval) -> Result<()> {
        self.calls
            .lock()
            .expect("notifier lock poisoned")
            .push(NotifierCall::TimedOut {
                approval_id: approval.id.to_string(),
            });
        Ok(())
    }
}
