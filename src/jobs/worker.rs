//! Worker loop: claim jobs, dispatch to handlers, report outcomes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::payload::JobKind;
use super::store::JobStore;
use crate::config::WorkerConfig;
use crate::db::models::DbJob;
use crate::error::IngestError;

/// A job handler. One implementation per [`JobKind`], registered in a flat
/// map; the worker multiplexes over it.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &DbJob) -> Result<(), IngestError>;
}

pub type HandlerMap = HashMap<JobKind, Arc<dyn JobHandler>>;

/// One claim-and-run loop. A process runs several of these concurrently;
/// they coordinate purely through the job table.
pub struct Worker {
    store: JobStore,
    org_id: Uuid,
    worker_id: String,
    handlers: Arc<HandlerMap>,
    claim_batch: i64,
    lease: Duration,
    poll_interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    pub fn new(
        store: JobStore,
        org_id: Uuid,
        worker_id: String,
        handlers: Arc<HandlerMap>,
        config: &WorkerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            org_id,
            worker_id,
            handlers,
            claim_batch: config.claim_batch,
            lease: Duration::from_secs(config.lease_secs),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            shutdown,
        }
    }

    pub async fn run(mut self) {
        info!(worker = %self.worker_id, "worker started");
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let jobs = match self
                .store
                .claim(self.org_id, &self.worker_id, self.claim_batch, self.lease)
                .await
            {
                Ok(jobs) => jobs,
                Err(e) => {
                    warn!(worker = %self.worker_id, error = %e, "claim failed");
                    tokio::time::sleep(self.poll_interval).await;
                    continue;
                }
            };

            if jobs.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    _ = self.shutdown.changed() => {}
                }
                continue;
            }

            for job in &jobs {
                // On shutdown, stop before the next job; anything claimed but
                // not run is reclaimed after its lease expires.
                if *self.shutdown.borrow() {
                    break;
                }
                self.dispatch(job).await;
            }
        }
        info!(worker = %self.worker_id, "worker stopped");
    }

    async fn dispatch(&self, job: &DbJob) {
        let started = std::time::Instant::now();
        match self.run_handler(job).await {
            Ok(()) => {
                if let Err(e) = self.store.complete(job.id).await {
                    warn!(job_id = job.id, error = %e, "failed to mark job succeeded");
                }
                debug!(
                    job_id = job.id,
                    kind = %job.kind,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "job succeeded"
                );
            }
            Err(err) if err.is_terminal() => {
                error!(job_id = job.id, kind = %job.kind, error = %err, "job failed permanently");
                if let Err(e) = self.store.fail_fast(job.id, &err.to_string()).await {
                    warn!(job_id = job.id, error = %e, "failed to record terminal failure");
                }
            }
            Err(err) => {
                warn!(
                    job_id = job.id,
                    kind = %job.kind,
                    attempt = job.attempts,
                    error = %err,
                    "job failed, backing off"
                );
                if let Err(e) = self.store.fail(job.id, &err.to_string()).await {
                    warn!(job_id = job.id, error = %e, "failed to record failure");
                }
            }
        }
    }

    async fn run_handler(&self, job: &DbJob) -> Result<(), IngestError> {
        let kind = JobKind::parse(&job.kind)
            .ok_or_else(|| IngestError::UnknownJobKind(job.kind.clone()))?;
        let handler = self
            .handlers
            .get(&kind)
            .ok_or_else(|| IngestError::UnknownJobKind(job.kind.clone()))?;
        handler.handle(job).await
    }
}
