//! In-process staging job queue.
//!
//! Jobs are handed to a dispatcher that runs each one on its own task, with a
//! semaphore capping how many run at once. There is no ordering guarantee
//! between jobs, and a job may be delivered again later (files waiting on a
//! tape recall are re-enqueued), so handlers must tolerate repeats.

use crate::services::{cart_store::NewFile, staging::StagingOrchestrator};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    sync::{Semaphore, mpsc},
    task::JoinHandle,
};
use tracing::{debug, error};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagingJob {
    /// A new staging request: create the cart and work through its files.
    Stage { cart_uid: String, files: Vec<NewFile> },
    /// Retry one file of an existing cart.
    Pull { cart_id: i64, file_id: i64 },
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("staging queue is closed")]
    Closed,
}

/// Sending half of the queue. Cheap to clone.
#[derive(Clone, Debug)]
pub struct StagingQueue {
    tx: mpsc::UnboundedSender<StagingJob>,
}

impl StagingQueue {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StagingJob>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn enqueue(&self, job: StagingJob) -> Result<(), QueueError> {
        self.tx.send(job).map_err(|_| QueueError::Closed)
    }

    /// Enqueue `job` once `delay` has passed.
    pub fn enqueue_after(&self, job: StagingJob, delay: Duration) {
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = queue.enqueue(job) {
                error!("dropping delayed staging job: {}", err);
            }
        });
    }
}

/// Drain `rx`, running every job on the orchestrator with at most `workers`
/// jobs in flight.
pub fn spawn_dispatcher(
    mut rx: mpsc::UnboundedReceiver<StagingJob>,
    orchestrator: Arc<StagingOrchestrator>,
    workers: usize,
) -> JoinHandle<()> {
    let limit = Arc::new(Semaphore::new(workers.max(1)));
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            let permit = match limit.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                debug!(?job, "running staging job");
                orchestrator.run(job).await;
                drop(permit);
            });
        }
        debug!("staging queue closed, dispatcher exiting");
    })
}
