//! Step handlers and their registry
//!
//! Handlers are registered under a stable, versioned operation key
//! (`inventory.allocate.v1`). A saga's plan names keys, not code, so a
//! persisted saga can be resumed by a later build as long as the keys stay
//! registered.

use super::SagaExecution;
use crate::{Error, Result};
use async_trait::async_trait;
use ledger_core::{Paise, SagaId};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

/// A saga step: forward action plus its inverse
#[async_trait]
pub trait Step: Send + Sync {
    /// Operation key the step is registered under
    fn operation(&self) -> &'static str;

    /// Run the forward action; the returned value is persisted with the step
    async fn execute(&self, ctx: &StepContext) -> Result<Value>;

    /// Undo a completed forward action given its persisted output
    async fn compensate(&self, ctx: &StepContext, output: &Value) -> Result<()>;
}

/// Inputs available to a step
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Saga id
    pub saga_id: SagaId,
    /// Saga type
    pub saga_type: String,
    /// 1-based step number
    pub step_number: u32,
    /// Operation key
    pub operation: String,
    /// Saga metadata
    pub metadata: BTreeMap<String, String>,
    /// Outputs of earlier completed steps, by operation key
    pub outputs: BTreeMap<String, Value>,
}

impl StepContext {
    pub(crate) fn new(
        saga: &SagaExecution,
        step_number: u32,
        operation: &str,
        outputs: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            saga_id: saga.saga_id,
            saga_type: saga.saga_type.clone(),
            step_number,
            operation: operation.to_string(),
            metadata: saga.metadata.clone(),
            outputs,
        }
    }

    /// Deterministic id of this step of this saga
    ///
    /// Used as transaction id or idempotency key so a replayed step finds the
    /// rows written by its first run.
    pub fn correlation_id(&self) -> Uuid {
        Uuid::new_v5(
            &self.saga_id.as_uuid(),
            format!("{}:{}", self.step_number, self.operation).as_bytes(),
        )
    }

    /// Deterministic id derived from the correlation id
    pub fn derived_id(&self, label: &str) -> Uuid {
        crate::types::derived_id(self.correlation_id(), label)
    }

    /// Required metadata value
    pub fn param<T: FromStr>(&self, key: &str) -> Result<T> {
        self.optional_param(key)?
            .ok_or_else(|| Error::InvalidInput(format!("{}: missing `{}`", self.operation, key)))
    }

    /// Optional metadata value
    pub fn optional_param<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        match self.metadata.get(key) {
            None => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|_| {
                Error::InvalidInput(format!("{}: malformed `{}` = {:?}", self.operation, key, raw))
            }),
        }
    }

    /// Required UUID metadata value
    pub fn uuid_param(&self, key: &str) -> Result<Uuid> {
        self.param(key)
    }

    /// Required amount metadata value (integer paise)
    pub fn paise_param(&self, key: &str) -> Result<Paise> {
        Ok(Paise::new(self.param::<i64>(key)?))
    }

    /// Output of an earlier step
    pub fn output(&self, operation: &str) -> Result<&Value> {
        self.outputs.get(operation).ok_or_else(|| {
            Error::InvalidInput(format!(
                "{}: no output from `{}`",
                self.operation, operation
            ))
        })
    }
}

/// Handlers by operation key
#[derive(Default, Clone)]
pub struct StepRegistry {
    steps: HashMap<String, Arc<dyn Step>>,
}

impl StepRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its operation key, replacing any previous one
    pub fn register(&mut self, step: Arc<dyn Step>) {
        self.steps.insert(step.operation().to_string(), step);
    }

    /// Handler for `operation`
    pub fn get(&self, operation: &str) -> Result<Arc<dyn Step>> {
        self.steps
            .get(operation)
            .cloned()
            .ok_or_else(|| Error::UnknownOperation(operation.to_string()))
    }

    /// Whether `operation` is registered
    pub fn contains(&self, operation: &str) -> bool {
        self.steps.contains_key(operation)
    }

    /// Registered keys, sorted
    pub fn operations(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.steps.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRegistry")
            .field("operations", &self.operations())
            .finish()
    }
}

/// Read a typed field out of a step output
pub fn output_field<T: FromStr>(output: &Value, field: &str) -> Result<T> {
    output
        .get(field)
        .and_then(Value::as_str)
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| Error::InvalidInput(format!("step output has no valid `{}`", field)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    struct Noop;

    #[async_trait]
    impl Step for Noop {
        fn operation(&self) -> &'static str {
            "test.noop.v1"
        }

        async fn execute(&self, _ctx: &StepContext) -> Result<Value> {
            Ok(Value::Null)
        }

        async fn compensate(&self, _ctx: &StepContext, _output: &Value) -> Result<()> {
            Ok(())
        }
    }

    fn saga(metadata: BTreeMap<String, String>) -> SagaExecution {
        SagaExecution {
            saga_id: SagaId::new(),
            saga_type: "test".into(),
            status: super::super::SagaStatus::Initiated,
            metadata,
            plan: vec!["test.noop.v1".into()],
            steps_total: 1,
            steps_completed: 0,
            failure_step: None,
            failure_reason: None,
            requires_manual_resolution: false,
            resolved_by: None,
            resolution_note: None,
            idempotency_key: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            completed_at: None,
        }
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = StepRegistry::new();
        registry.register(Arc::new(Noop));
        assert!(registry.contains("test.noop.v1"));
        assert!(registry.get("test.noop.v1").is_ok());
        assert!(matches!(
            registry.get("test.missing.v1"),
            Err(Error::UnknownOperation(_))
        ));
    }

    #[test]
    fn test_correlation_id_is_stable_per_step() {
        let saga = saga(BTreeMap::new());
        let a = StepContext::new(&saga, 1, "test.noop.v1", BTreeMap::new());
        let b = StepContext::new(&saga, 1, "test.noop.v1", BTreeMap::new());
        let c = StepContext::new(&saga, 2, "test.noop.v1", BTreeMap::new());
        assert_eq!(a.correlation_id(), b.correlation_id());
        assert_ne!(a.correlation_id(), c.correlation_id());
    }

    #[test]
    fn test_params() {
        let mut metadata = BTreeMap::new();
        metadata.insert("amount".to_string(), "1500".to_string());
        metadata.insert("bad".to_string(), "x".to_string());
        let ctx = StepContext::new(&saga(metadata), 1, "test.noop.v1", BTreeMap::new());

        assert_eq!(ctx.paise_param("amount").unwrap(), Paise::new(1_500));
        assert!(ctx.paise_param("bad").is_err());
        assert!(ctx.param::<i64>("missing").is_err());
        assert_eq!(ctx.optional_param::<i64>("missing").unwrap(), None);
    }

    #[test]
    fn test_output_field() {
        let output = json!({ "entry_id": "42" });
        assert_eq!(output_field::<i64>(&output, "entry_id").unwrap(), 42);
        assert!(output_field::<i64>(&output, "other").is_err());
    }
}
