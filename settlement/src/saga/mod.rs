//! Saga orchestration
//!
//! A saga is an ordered plan of named operations. Each step is executed by a
//! [`Step`] handler looked up in the [`StepRegistry`]; when a step fails the
//! orchestrator runs the compensation of every completed step in reverse
//! order. A failed compensation parks the saga for an operator.
//!
//! - `registry` - the `Step` trait, step context and handler registry
//! - `orchestrator` - persistent execution, compensation and recovery
//! - `steps` - settlement step handlers

pub mod orchestrator;
pub mod registry;
pub mod steps;

pub use orchestrator::SagaOrchestrator;
pub use registry::{Step, StepContext, StepRegistry};

use chrono::{DateTime, Utc};
use ledger_core::storage::compose_key;
use ledger_core::SagaId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Saga lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SagaStatus {
    /// Created, no step run yet
    Initiated,
    /// At least one step completed
    Executing,
    /// Every step completed
    Completed,
    /// A step failed; compensation incomplete
    Failed,
    /// Every completed step was compensated
    Compensated,
    /// Closed by an operator after a failed compensation
    ManuallyResolved,
}

impl SagaStatus {
    /// No further automatic processing
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaStatus::Completed | SagaStatus::Compensated | SagaStatus::ManuallyResolved
        )
    }
}

/// Outcome of a step's forward action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    /// Forward action succeeded
    Completed,
    /// Forward action failed or timed out
    Failed,
}

/// Compensation state of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompensationStatus {
    /// Not compensated
    NotCompensated,
    /// Compensation succeeded
    Compensated,
    /// Compensation failed
    CompensationFailed,
}

/// Persistent saga state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaExecution {
    /// Saga id
    pub saga_id: SagaId,
    /// Saga type (e.g. `payment.share_purchase`)
    pub saga_type: String,
    /// Status
    pub status: SagaStatus,
    /// Step inputs
    pub metadata: BTreeMap<String, String>,
    /// Operation keys, in execution order
    pub plan: Vec<String>,
    /// Number of steps in the plan
    pub steps_total: u32,
    /// Steps completed and not compensated
    pub steps_completed: u32,
    /// Step that failed
    pub failure_step: Option<u32>,
    /// Why it failed
    pub failure_reason: Option<String>,
    /// A compensation failed; an operator must close the saga
    pub requires_manual_resolution: bool,
    /// Operator who closed the saga
    pub resolved_by: Option<String>,
    /// Operator note
    pub resolution_note: Option<String>,
    /// Deduplication key
    pub idempotency_key: Option<String>,
    /// Created at
    pub created_at: DateTime<Utc>,
    /// Last change
    pub updated_at: DateTime<Utc>,
    /// Completed, compensated or resolved at
    pub completed_at: Option<DateTime<Utc>>,
}

impl SagaExecution {
    /// No further automatic processing
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Operation key of a 1-based step
    pub fn operation(&self, step_number: u32) -> Option<&str> {
        step_number
            .checked_sub(1)
            .and_then(|i| self.plan.get(i as usize))
            .map(String::as_str)
    }
}

/// Persistent record of one step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaStep {
    /// Owning saga
    pub saga_id: SagaId,
    /// 1-based position in the plan
    pub step_number: u32,
    /// Operation key
    pub operation: String,
    /// Forward status
    pub status: StepStatus,
    /// Compensation status
    pub compensation_status: CompensationStatus,
    /// Handler output as JSON text
    pub result_data: Option<String>,
    /// Failure or compensation error
    pub error: Option<String>,
    /// Started at
    pub started_at: DateTime<Utc>,
    /// Finished at
    pub completed_at: Option<DateTime<Utc>>,
    /// Compensated at
    pub compensated_at: Option<DateTime<Utc>>,
}

pub(crate) fn step_key(saga_id: &SagaId, step_number: u32) -> Vec<u8> {
    compose_key(&[saga_id.as_bytes(), &step_number.to_be_bytes()])
}
