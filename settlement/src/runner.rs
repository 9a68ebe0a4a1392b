//! Saga runner
//!
//! A bounded mailbox of saga ids drained by a fixed pool of worker tasks.
//! Callers enqueue and return immediately, or enqueue and await the final
//! saga state through a oneshot reply.
//!
//! ```text
//!  submit / run_and_wait
//!          │
//!          │ mpsc::channel (bounded)
//!          ▼
//!  ┌──────────────┐   ┌──────────────┐
//!  │   worker 0   │ … │   worker N   │   SagaOrchestrator::run
//!  └──────────────┘   └──────────────┘
//! ```

use crate::{
    saga::{SagaExecution, SagaOrchestrator},
    Error, Result,
};
use ledger_core::SagaId;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;

/// Message sent to the runner mailbox
#[derive(Debug)]
pub enum RunnerMessage {
    /// Drive a saga to a final state
    Run {
        /// Saga to run
        saga_id: SagaId,
        /// Reply with the final state
        response: Option<oneshot::Sender<Result<SagaExecution>>>,
    },
}

/// Worker pool running sagas
#[derive(Debug)]
pub struct SagaRunner {
    sender: RwLock<Option<mpsc::Sender<RunnerMessage>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SagaRunner {
    /// Spawn `workers` tasks over a mailbox of `capacity` messages
    pub fn start(orchestrator: Arc<SagaOrchestrator>, workers: usize, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let handles = (0..workers.max(1))
            .map(|worker| {
                let orchestrator = orchestrator.clone();
                let receiver = receiver.clone();
                tokio::spawn(async move {
                    worker_loop(worker, orchestrator, receiver).await;
                })
            })
            .collect();

        tracing::info!(workers = workers.max(1), capacity = capacity, "Saga runner started");

        Self {
            sender: RwLock::new(Some(sender)),
            workers: Mutex::new(handles),
        }
    }

    /// Enqueue a saga
    pub async fn submit(&self, saga_id: SagaId) -> Result<()> {
        self.send(RunnerMessage::Run {
            saga_id,
            response: None,
        })
        .await
    }

    /// Enqueue a saga and wait for its final state
    pub async fn run_and_wait(&self, saga_id: SagaId) -> Result<SagaExecution> {
        let (tx, rx) = oneshot::channel();
        self.send(RunnerMessage::Run {
            saga_id,
            response: Some(tx),
        })
        .await?;

        rx.await
            .map_err(|_| Error::RunnerUnavailable("worker dropped the reply".into()))?
    }

    async fn send(&self, message: RunnerMessage) -> Result<()> {
        let sender = self
            .sender
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::RunnerUnavailable("runner is shut down".into()))?;

        sender
            .send(message)
            .await
            .map_err(|_| Error::RunnerUnavailable("mailbox closed".into()))
    }

    /// Stop accepting work, drain the mailbox and wait for the workers
    pub async fn shutdown(&self) {
        self.sender.write().await.take();

        let handles: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Saga worker panicked");
            }
        }
        tracing::info!("Saga runner stopped");
    }
}

async fn worker_loop(
    worker: usize,
    orchestrator: Arc<SagaOrchestrator>,
    receiver: Arc<Mutex<mpsc::Receiver<RunnerMessage>>>,
) {
    loop {
        let message = {
            let mut mailbox = receiver.lock().await;
            mailbox.recv().await
        };

        let Some(RunnerMessage::Run { saga_id, response }) = message else {
            break;
        };

        let result = orchestrator.run(saga_id).await;
        match &result {
            Ok(saga) => tracing::debug!(
                worker = worker,
                saga_id = %saga_id,
                status = ?saga.status,
                "Saga run finished"
            ),
            Err(e) => tracing::error!(worker = worker, saga_id = %saga_id, error = %e, "Saga run failed"),
        }

        if let Some(response) = response {
            let _ = response.send(result);
        }
    }
}
