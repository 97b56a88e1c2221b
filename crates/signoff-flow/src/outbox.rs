//! Outbox for events produced inside a transaction.
//!
//! Operations must publish bus events only AFTER their transaction
//! commits; publishing mid-transaction would let subscribers observe
//! state that may still roll back. Mutating code therefore pushes
//! envelopes into an outbox while the unit of work is open, and the
//! caller drains the outbox into the bus post-commit.
//!
//! The sink is intentionally synchronous: state-machine and service code
//! stays deterministic and side-effect free, while callers decide when
//! events actually leave the process.

use crate::events::FlowEvent;

/// A sink for events emitted by orchestration operations.
pub trait EventSink {
    /// Records an event for publication after commit.
    fn push(&mut self, event: FlowEvent);
}

/// In-memory outbox collecting events in emission order.
#[derive(Debug, Default)]
pub struct Outbox {
    events: Vec<FlowEvent>,
}

impl Outbox {
    /// Creates a new empty outbox.
    #[must_use]
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> &[FlowEvent] {
        &self.events
    }

    /// Returns true when nothing was emitted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Drains the outbox, returning all events in emission order.
    pub fn drain(&mut self) -> Vec<FlowEvent> {
        std::mem::take(&mut self.events)
    }
}

impl EventSink for Outbox {
    fn push(&mut self, event: FlowEvent) {
        self.events.push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::FlowEventData;
    use signoff_core::WorkflowId;

    #[test]
    fn drain_preserves_emission_order_and_empties() {
        let mut outbox = Outbox::new();
        let workflow_id = WorkflowId::generate();

        outbox.push(FlowEvent::new(FlowEventData::WorkflowCreated {
            workflow_id,
            workflow_type: "deployment".to_string(),
            is_multi_step: false,
        }));
        outbox.push(FlowEvent::new(FlowEventData::WorkflowCompleted {
            workflow_id,
            result: serde_json::json!({}),
        }));

        let drained = outbox.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].kind.as_str(), "workflow.created");
        assert_eq!(drained[1].kind.as_str(), "workflow.completed");
        assert!(outbox.is_empty());
    }
}
