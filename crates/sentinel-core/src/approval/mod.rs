//! Human-in-the-loop approvals: the record state machine and its
//! coordinator.

mod coordinator;
mod record;

pub use coordinator::{
    ApprovalCoordinator, ApprovalError, WebhookPayload, WEBHOOK_ATTEMPT_TIMEOUT,
    WEBHOOK_TOTAL_DEADLINE,
};
pub use record::{
    ApprovalRecord, ApprovalState, Transition, TransitionConflict, TransitionOutcome,
};
