use std::sync::Arc;
use tokio::sync::Semaphore;
use async_channel::Receiver;
use log::{debug, info};
use uuid::Uuid;

use crate::download::pipeline::Pipeline;

/// Immutable unit of work on the shared queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    Prepare(Uuid),
    Chunk { transfer: Uuid, index: usize },
    Assemble(Uuid),
    Preview(Uuid),
}

pub struct Scheduler {
    pipeline: Arc<Pipeline>,
    semaphore: Arc<Semaphore>,
    job_receiver: Receiver<Job>,
}

impl Scheduler {
    pub fn new(
        pipeline: Arc<Pipeline>,
        semaphore: Arc<Semaphore>,
        job_receiver: Receiver<Job>,
    ) -> Self {
        Self {
            pipeline,
            semaphore,
            job_receiver,
        }
    }

    /// Start scheduler, returns once every sender is gone
    pub async fn run(&self) {
        info!("Scheduler started with {} workers", self.semaphore.available_permits());

        loop {
            // Wait for a job to become available
            let job = match self.job_receiver.recv().await {
                Ok(job) => job,
                Err(_) => break,
            };

            // Wait for a free worker
            let permit = match self.semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            debug!("Dispatching {:?}", job);
            let pipeline = self.pipeline.clone();
            tokio::spawn(async move {
                pipeline.handle(job).await;

                // Release
                drop(permit);
            });
        }

        info!("Scheduler stopped");
    }
}
