//! In-process job queue and its workers

use log::{debug, info};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;

use super::orchestrator::Orchestrator;
use crate::error::IngestError;
use crate::models::{AccountId, JobId};

/// A job admitted by the gate, waiting for a worker
#[derive(Debug, Clone, PartialEq)]
pub struct SyncTask {
    pub job_id: JobId,
    pub account_id: AccountId,
    pub idempotency_key: Option<String>,
}

/// FIFO of sync tasks. Each task is received by exactly one worker.
pub struct JobQueue {
    sender: Mutex<Option<mpsc::UnboundedSender<SyncTask>>>,
    receiver: Arc<AsyncMutex<mpsc::UnboundedReceiver<SyncTask>>>,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender: Mutex::new(Some(sender)),
            receiver: Arc::new(AsyncMutex::new(receiver)),
        }
    }

    pub fn enqueue(&self, task: SyncTask) -> Result<(), IngestError> {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = sender.as_ref().ok_or(IngestError::QueueClosed)?;
        debug!("Enqueueing sync job {}", task.job_id);
        sender.send(task).map_err(|_| IngestError::QueueClosed)
    }

    /// Start `count` workers running tasks through `orchestrator`.
    ///
    /// Workers exit once the queue is shut down and drained.
    pub fn spawn_workers(&self, count: usize, orchestrator: Arc<Orchestrator>) -> Vec<JoinHandle<()>> {
        (0..count.max(1))
            .map(|worker| {
                let receiver = Arc::clone(&self.receiver);
                let orchestrator = Arc::clone(&orchestrator);
                tokio::spawn(async move {
                    loop {
                        // Release the receiver before running the task
                        let task = receiver.lock().await.recv().await;
                        let Some(task) = task else { break };

                        debug!("Worker {} picked up sync job {}", worker, task.job_id);
                        let outcome = orchestrator
                            .run(&task.job_id, &task.account_id, task.idempotency_key.as_deref())
                            .await;
                        debug!("Worker {} finished sync job {}: {:?}", worker, task.job_id, outcome);
                    }
                    info!("Sync worker {} stopped", worker);
                })
            })
            .collect()
    }

    /// Stop accepting tasks. Queued tasks are still delivered.
    pub fn shutdown(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn is_closed(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}
