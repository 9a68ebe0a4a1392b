//! Saga orchestrator
//!
//! Drives a saga's plan one step at a time. Saga and step rows are persisted
//! after every transition so that `recover` can pick up where a crashed
//! process stopped. Steps are re-run with the same correlation id and must be
//! idempotent.
//!
//! Compensation runs synchronously, in reverse step order, as soon as a step
//! fails. It stops at the first compensation that fails and flags the saga
//! for manual resolution; nothing retries it automatically.

use super::{
    registry::{Step, StepContext, StepRegistry},
    step_key, CompensationStatus, SagaExecution, SagaStatus, SagaStep, StepStatus,
};
use crate::{config::SagaConfig, metrics::SettlementMetrics, tables, Error, Result};
use chrono::Utc;
use ledger_core::{RowLocks, SagaId, Storage, WriteSet};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn saga_row_key(saga_id: &SagaId) -> String {
    RowLocks::key("saga", saga_id)
}

/// Persistent saga orchestrator
#[derive(Debug)]
pub struct SagaOrchestrator {
    storage: Arc<Storage>,
    locks: Arc<RowLocks>,
    registry: StepRegistry,
    metrics: SettlementMetrics,
    config: SagaConfig,
}

impl SagaOrchestrator {
    /// Create over the shared store and lock table
    pub fn new(
        storage: Arc<Storage>,
        locks: Arc<RowLocks>,
        registry: StepRegistry,
        metrics: SettlementMetrics,
        config: SagaConfig,
    ) -> Self {
        Self {
            storage,
            locks,
            registry,
            metrics,
            config,
        }
    }

    /// Registered step handlers
    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    /// Create a saga in `Initiated`
    pub fn begin(
        &self,
        saga_type: &str,
        metadata: BTreeMap<String, String>,
        plan: Vec<String>,
    ) -> Result<SagaExecution> {
        self.create(saga_type, metadata, plan, None)
    }

    /// Create a saga unless one already exists for `key`
    ///
    /// Returns the saga and whether it was created by this call.
    pub async fn begin_with_key(
        &self,
        key: &str,
        saga_type: &str,
        metadata: BTreeMap<String, String>,
        plan: Vec<String>,
    ) -> Result<(SagaExecution, bool)> {
        let _guard = self.locks.lock(RowLocks::key("saga_key", key)).await?;

        if let Some(saga_id) = self
            .storage
            .get::<SagaId>(tables::SAGA_KEYS, key.as_bytes())?
        {
            tracing::debug!(saga_id = %saga_id, key = key, "Saga key replayed");
            return Ok((self.saga(saga_id)?, false));
        }

        let saga = self.create(saga_type, metadata, plan, Some(key.to_string()))?;
        Ok((saga, true))
    }

    fn create(
        &self,
        saga_type: &str,
        metadata: BTreeMap<String, String>,
        plan: Vec<String>,
        idempotency_key: Option<String>,
    ) -> Result<SagaExecution> {
        if plan.is_empty() {
            return Err(Error::InvalidSagaState(format!("{} has an empty plan", saga_type)));
        }
        for operation in &plan {
            self.registry.get(operation)?;
        }

        let now = Utc::now();
        let saga = SagaExecution {
            saga_id: SagaId::new(),
            saga_type: saga_type.to_string(),
            status: SagaStatus::Initiated,
            metadata,
            steps_total: plan.len() as u32,
            plan,
            steps_completed: 0,
            failure_step: None,
            failure_reason: None,
            requires_manual_resolution: false,
            resolved_by: None,
            resolution_note: None,
            idempotency_key,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };

        let mut writes = WriteSet::new();
        writes.insert(tables::SAGAS, saga.saga_id.as_bytes(), &saga)?;
        if let Some(key) = &saga.idempotency_key {
            writes.insert(tables::SAGA_KEYS, key.as_bytes(), &saga.saga_id)?;
        }
        self.storage.commit(writes)?;

        self.metrics.sagas_started.inc();
        tracing::info!(
            saga_id = %saga.saga_id,
            saga_type = saga_type,
            steps = saga.steps_total,
            "Saga initiated"
        );
        Ok(saga)
    }

    /// Execute one step
    ///
    /// `step_number` must be the next step of the plan. On failure every
    /// completed step is compensated before `SagaStepFailure` is returned.
    pub async fn execute_step(&self, saga_id: SagaId, step_number: u32) -> Result<SagaExecution> {
        let _guard = self.locks.lock(saga_row_key(&saga_id)).await?;
        let saga = self.saga(saga_id)?;
        self.execute_locked(saga, step_number).await
    }

    async fn execute_locked(&self, mut saga: SagaExecution, step_number: u32) -> Result<SagaExecution> {
        if saga.is_terminal() || saga.status == SagaStatus::Failed {
            return Err(Error::InvalidSagaState(format!(
                "saga {} is {:?}",
                saga.saga_id, saga.status
            )));
        }
        if step_number != saga.steps_completed + 1 {
            return Err(Error::InvalidSagaState(format!(
                "saga {} expects step {}, got {}",
                saga.saga_id,
                saga.steps_completed + 1,
                step_number
            )));
        }
        let operation = saga
            .operation(step_number)
            .ok_or_else(|| {
                Error::InvalidSagaState(format!("saga {} has no step {}", saga.saga_id, step_number))
            })?
            .to_string();
        let handler = self.registry.get(&operation)?;
        let ctx = StepContext::new(&saga, step_number, &operation, self.outputs(&saga, step_number)?);

        let started_at = Utc::now();
        let start = Instant::now();
        let outcome = self.bounded(&operation, handler.execute(&ctx)).await;
        self.metrics.record_step_duration(start.elapsed().as_secs_f64());

        let now = Utc::now();
        match outcome {
            Ok(output) => {
                let step = SagaStep {
                    saga_id: saga.saga_id,
                    step_number,
                    operation: operation.clone(),
                    status: StepStatus::Completed,
                    compensation_status: CompensationStatus::NotCompensated,
                    result_data: Some(serde_json::to_string(&output)?),
                    error: None,
                    started_at,
                    completed_at: Some(now),
                    compensated_at: None,
                };

                saga.steps_completed = step_number;
                saga.updated_at = now;
                if step_number == saga.steps_total {
                    saga.status = SagaStatus::Completed;
                    saga.completed_at = Some(now);
                } else {
                    saga.status = SagaStatus::Executing;
                }
                self.persist(&saga, Some(&step))?;

                tracing::info!(
                    saga_id = %saga.saga_id,
                    step = step_number,
                    operation = %operation,
                    "Saga step completed"
                );
                if saga.status == SagaStatus::Completed {
                    self.metrics.sagas_completed.inc();
                    tracing::info!(saga_id = %saga.saga_id, saga_type = %saga.saga_type, "Saga completed");
                }
                Ok(saga)
            }
            Err(error) => {
                let reason = error.to_string();
                if error.is_structural() {
                    tracing::error!(saga_id = %saga.saga_id, step = step_number, operation = %operation, error = %reason, "Saga step failed");
                } else {
                    tracing::warn!(saga_id = %saga.saga_id, step = step_number, operation = %operation, reason = %reason, "Saga step failed");
                }

                let step = SagaStep {
                    saga_id: saga.saga_id,
                    step_number,
                    operation: operation.clone(),
                    status: StepStatus::Failed,
                    compensation_status: CompensationStatus::NotCompensated,
                    result_data: None,
                    error: Some(reason.clone()),
                    started_at,
                    completed_at: Some(now),
                    compensated_at: None,
                };
                saga.status = SagaStatus::Failed;
                saga.failure_step = Some(step_number);
                saga.failure_reason = Some(reason.clone());
                saga.updated_at = now;
                self.persist(&saga, Some(&step))?;

                self.compensate_all(saga).await?;
                Err(Error::SagaStepFailure {
                    step: step_number,
                    operation,
                    reason,
                })
            }
        }
    }

    async fn bounded<T>(&self, operation: &str, work: impl Future<Output = Result<T>>) -> Result<T> {
        let timeout_ms = self.config.step_timeout_ms;
        match tokio::time::timeout(Duration::from_millis(timeout_ms), work).await {
            Ok(result) => result,
            Err(_) => Err(Error::StepTimeout {
                operation: operation.to_string(),
                timeout_ms,
            }),
        }
    }

    // Compensates completed steps newest first; stops at the first failure
    async fn compensate_all(&self, mut saga: SagaExecution) -> Result<SagaExecution> {
        while saga.steps_completed > 0 {
            let step_number = saga.steps_completed;
            match self.compensate_step(&mut saga, step_number).await {
                Ok(()) => {}
                Err(Error::CompensationFailure { .. }) => return Ok(saga),
                Err(e) => return Err(e),
            }
        }

        let now = Utc::now();
        saga.status = SagaStatus::Compensated;
        saga.requires_manual_resolution = false;
        saga.updated_at = now;
        saga.completed_at = Some(now);
        self.persist(&saga, None)?;

        self.metrics.sagas_compensated.inc();
        tracing::info!(
            saga_id = %saga.saga_id,
            failure_step = ?saga.failure_step,
            "Saga compensated"
        );
        Ok(saga)
    }

    async fn compensate_step(&self, saga: &mut SagaExecution, step_number: u32) -> Result<()> {
        let mut step: SagaStep = self
            .storage
            .get(tables::SAGA_STEPS, &step_key(&saga.saga_id, step_number))?
            .ok_or_else(|| {
                Error::InvalidSagaState(format!(
                    "saga {} has no record of step {}",
                    saga.saga_id, step_number
                ))
            })?;

        if step.compensation_status == CompensationStatus::Compensated {
            saga.steps_completed = step_number - 1;
            self.persist(saga, None)?;
            return Ok(());
        }
        if step.status != StepStatus::Completed {
            return Err(Error::InvalidSagaState(format!(
                "step {} of saga {} did not complete",
                step_number, saga.saga_id
            )));
        }

        let handler = self.registry.get(&step.operation)?;
        let output: Value = match &step.result_data {
            Some(text) => serde_json::from_str(text)?,
            None => Value::Null,
        };
        let ctx = StepContext::new(saga, step_number, &step.operation, self.outputs(saga, step_number)?);

        let outcome = match self.bounded(&step.operation, handler.compensate(&ctx, &output)).await {
            // Undone by an earlier attempt that crashed before recording it
            Err(Error::Ledger(ledger_core::Error::AlreadyReversed(_))) => Ok(()),
            other => other,
        };

        let now = Utc::now();
        saga.updated_at = now;
        match outcome {
            Ok(()) => {
                step.compensation_status = CompensationStatus::Compensated;
                step.compensated_at = Some(now);
                saga.steps_completed = step_number - 1;
                self.persist(saga, Some(&step))?;

                tracing::info!(
                    saga_id = %saga.saga_id,
                    step = step_number,
                    operation = %step.operation,
                    "Saga step compensated"
                );
                Ok(())
            }
            Err(error) => {
                let reason = error.to_string();
                step.compensation_status = CompensationStatus::CompensationFailed;
                step.error = Some(reason.clone());
                saga.status = SagaStatus::Failed;
                saga.requires_manual_resolution = true;
                self.persist(saga, Some(&step))?;

                self.metrics.sagas_manual.inc();
                tracing::error!(
                    saga_id = %saga.saga_id,
                    step = step_number,
                    operation = %step.operation,
                    error = %reason,
                    "Compensation failed; saga requires manual resolution"
                );
                Err(Error::CompensationFailure {
                    step: step_number,
                    operation: step.operation,
                    reason,
                })
            }
        }
    }

    /// Compensate the most recent completed step of a failed saga
    ///
    /// The operator path after a failed compensation has been fixed. When the
    /// last step is undone the saga becomes `Compensated`.
    pub async fn compensate(&self, saga_id: SagaId, step_number: u32) -> Result<SagaExecution> {
        let _guard = self.locks.lock(saga_row_key(&saga_id)).await?;
        let mut saga = self.saga(saga_id)?;

        if saga.status != SagaStatus::Failed {
            return Err(Error::InvalidSagaState(format!(
                "saga {} is {:?}; only failed sagas are compensated",
                saga_id, saga.status
            )));
        }
        if step_number == 0 || step_number != saga.steps_completed {
            return Err(Error::InvalidSagaState(format!(
                "saga {} must compensate step {} first",
                saga_id, saga.steps_completed
            )));
        }

        self.compensate_step(&mut saga, step_number).await?;
        if saga.steps_completed == 0 {
            return self.compensate_all(saga).await;
        }
        Ok(saga)
    }

    /// Run the remaining steps of a saga
    ///
    /// Returns the final saga state; a step failure that was compensated is a
    /// `Compensated` saga, not an error. A failed saga that is not waiting
    /// for an operator resumes its compensation.
    pub async fn run(&self, saga_id: SagaId) -> Result<SagaExecution> {
        let _guard = self.locks.lock(saga_row_key(&saga_id)).await?;
        let mut saga = self.saga(saga_id)?;

        if saga.status == SagaStatus::Failed {
            if saga.requires_manual_resolution {
                return Ok(saga);
            }
            return self.compensate_all(saga).await;
        }

        while !saga.is_terminal() && saga.steps_completed < saga.steps_total {
            let next = saga.steps_completed + 1;
            match self.execute_locked(saga, next).await {
                Ok(updated) => saga = updated,
                Err(Error::SagaStepFailure { .. }) => return self.saga(saga_id),
                Err(e) => return Err(e),
            }
        }
        Ok(saga)
    }

    /// Sagas that still need automatic processing
    pub fn pending(&self) -> Result<Vec<SagaExecution>> {
        Ok(self
            .sagas()?
            .into_iter()
            .filter(|saga| match saga.status {
                SagaStatus::Initiated | SagaStatus::Executing => true,
                SagaStatus::Failed => !saga.requires_manual_resolution,
                _ => false,
            })
            .collect())
    }

    /// Resume every unfinished saga
    pub async fn recover(&self) -> Result<Vec<SagaExecution>> {
        let pending = self.pending()?;
        if pending.is_empty() {
            return Ok(Vec::new());
        }
        tracing::info!(count = pending.len(), "Recovering sagas");

        let mut recovered = Vec::with_capacity(pending.len());
        for saga in pending {
            match self.run(saga.saga_id).await {
                Ok(saga) => recovered.push(saga),
                Err(e) => {
                    tracing::error!(saga_id = %saga.saga_id, error = %e, "Saga recovery failed");
                }
            }
        }
        Ok(recovered)
    }

    /// Failed sagas waiting for an operator
    pub fn manual_resolution_queue(&self) -> Result<Vec<SagaExecution>> {
        Ok(self
            .sagas()?
            .into_iter()
            .filter(|saga| saga.status == SagaStatus::Failed && saga.requires_manual_resolution)
            .collect())
    }

    /// Close a saga parked for manual resolution
    pub async fn resolve_manually(&self, saga_id: SagaId, admin: &str, note: &str) -> Result<SagaExecution> {
        let _guard = self.locks.lock(saga_row_key(&saga_id)).await?;
        let mut saga = self.saga(saga_id)?;
        if saga.status != SagaStatus::Failed || !saga.requires_manual_resolution {
            return Err(Error::InvalidSagaState(format!(
                "saga {} is not awaiting manual resolution",
                saga_id
            )));
        }

        let now = Utc::now();
        saga.status = SagaStatus::ManuallyResolved;
        saga.resolved_by = Some(admin.to_string());
        saga.resolution_note = Some(note.to_string());
        saga.updated_at = now;
        saga.completed_at = Some(now);
        self.persist(&saga, None)?;

        tracing::warn!(saga_id = %saga_id, admin = admin, note = note, "Saga manually resolved");
        Ok(saga)
    }

    fn persist(&self, saga: &SagaExecution, step: Option<&SagaStep>) -> Result<()> {
        let mut writes = WriteSet::new();
        writes.upsert(tables::SAGAS, saga.saga_id.as_bytes(), saga)?;
        if let Some(step) = step {
            writes.upsert(
                tables::SAGA_STEPS,
                step_key(&step.saga_id, step.step_number),
                step,
            )?;
        }
        self.storage.commit(writes)?;
        Ok(())
    }

    // Outputs of live completed steps before `step_number`
    fn outputs(&self, saga: &SagaExecution, step_number: u32) -> Result<BTreeMap<String, Value>> {
        let mut outputs = BTreeMap::new();
        for step in self.steps(saga.saga_id)? {
            let live = step.step_number < step_number
                && step.status == StepStatus::Completed
                && step.compensation_status == CompensationStatus::NotCompensated;
            if let (true, Some(text)) = (live, &step.result_data) {
                outputs.insert(step.operation.clone(), serde_json::from_str(text)?);
            }
        }
        Ok(outputs)
    }

    // ===== Reads =====

    /// Load a saga
    pub fn saga(&self, saga_id: SagaId) -> Result<SagaExecution> {
        self.storage
            .get(tables::SAGAS, saga_id.as_bytes())?
            .ok_or_else(|| Error::not_found("saga", saga_id))
    }

    /// Step records of a saga, in step order
    pub fn steps(&self, saga_id: SagaId) -> Result<Vec<SagaStep>> {
        Ok(self
            .storage
            .scan_prefix::<SagaStep>(tables::SAGA_STEPS, saga_id.as_bytes())?
            .into_iter()
            .map(|(_, step)| step)
            .collect())
    }

    /// Every saga
    pub fn sagas(&self) -> Result<Vec<SagaExecution>> {
        Ok(self
            .storage
            .scan_all::<SagaExecution>(tables::SAGAS)?
            .into_iter()
            .map(|(_, saga)| saga)
            .collect())
    }
}
