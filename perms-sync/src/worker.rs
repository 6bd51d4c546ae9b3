//! Runs durable sync jobs through the dispatcher's lanes.

use crate::dispatcher::Dispatcher;
use crate::error::{SyncFailure, SyncOutcome};
use crate::jobs::{JobState, PermissionSyncJob, SyncJobQueue, SyncJobResult};
use crate::queue::SyncRequest;
use crate::telemetry::Telemetry;
use config::WorkerConfig;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Translates job rows into sync requests.
pub struct SyncJobHandler {
    dispatcher: Arc<Dispatcher>
}

impl SyncJobHandler {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    pub async fn handle(&self, job: &PermissionSyncJob) -> Result<SyncJobResult, SyncFailure> {
        let meta = job
            .to_request()
            .map_err(|e| SyncFailure::new(e, Default::default()))?;
        let request = SyncRequest {
            meta,
            acquired: true
        };

        debug!(
            job_id = job.id,
            request_type = %request.meta.request_type,
            id = request.meta.id,
            "Handling permission sync job"
        );
        let SyncOutcome {
            result,
            provider_states
        } = self.dispatcher.execute(&request).await?;

        // Partial means some providers answered and some did not.
        let (_, succeeded, failed) = provider_states.count_statuses();
        Ok(SyncJobResult {
            result: result.unwrap_or_default(),
            partial_success: succeeded > 0 && failed > 0,
            provider_states
        })
    }
}

pub struct SyncJobWorker {
    jobs: Arc<dyn SyncJobQueue>,
    handler: Arc<SyncJobHandler>,
    config: WorkerConfig,
    hostname: String,
    permits: Arc<Semaphore>,
    in_flight: Mutex<HashSet<i64>>
}

impl SyncJobWorker {
    pub fn new(
        jobs: Arc<dyn SyncJobQueue>,
        handler: Arc<SyncJobHandler>,
        config: WorkerConfig,
        hostname: impl Into<String>
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            jobs,
            handler,
            config,
            hostname: hostname.into(),
            permits,
            in_flight: Mutex::new(HashSet::new())
        }
    }

    /// IDs of jobs currently being processed by this worker.
    pub fn in_flight(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.in_flight.lock().iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Dequeues jobs while permits are free and spawns them. Returns the
    /// number of jobs started.
    pub async fn poll(self: &Arc<Self>) -> usize {
        let mut started = 0;
        while let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() {
            let job = match self.jobs.dequeue(&self.hostname).await {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "Failed to dequeue permission sync job");
                    break;
                }
            };

            self.in_flight.lock().insert(job.id);
            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.process(job, permit).await;
            });
            started += 1;
        }
        started
    }

    async fn process(&self, job: PermissionSyncJob, _permit: OwnedSemaphorePermit) {
        let job_id = job.id;
        match self.handler.handle(&job).await {
            Ok(result) => {
                if let Err(e) = self.jobs.mark_completed(job_id, &result).await {
                    error!(job_id, error = %e, "Failed to mark job completed");
                }
                Telemetry::record_job_outcome(JobState::Completed.as_str());
            }
            Err(failure) => {
                let message = failure.to_string();
                warn!(job_id, error = %message, "Permission sync job failed");
                match self
                    .jobs
                    .mark_errored(
                        job_id,
                        &message,
                        &failure.provider_states,
                        self.config.max_num_failures
                    )
                    .await
                {
                    Ok(state) => Telemetry::record_job_outcome(state.as_str()),
                    Err(e) => error!(job_id, error = %e, "Failed to mark job errored")
                }
            }
        }
        self.in_flight.lock().remove(&job_id);
    }

    async fn heartbeat(&self) {
        let ids = self.in_flight();
        if ids.is_empty() {
            return;
        }
        if let Err(e) = self.jobs.heartbeat(&ids).await {
            warn!(error = %e, "Failed to heartbeat permission sync jobs");
        }
    }

    async fn reset_stalled(&self) {
        match self
            .jobs
            .reset_stalled(self.config.stalled_after(), self.config.max_num_resets)
            .await
        {
            Ok(stats) if stats.reset > 0 || stats.failed > 0 => {
                info!(reset = stats.reset, failed = stats.failed, "Reset stalled permission sync jobs");
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Failed to reset stalled permission sync jobs")
        }
    }

    /// Polls, heartbeats and resets stalled jobs until shutdown. In-flight
    /// jobs are abandoned on shutdown and picked up again by the stall reset.
    pub fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut poll = tokio::time::interval(self.config.poll_interval());
            let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
            loop {
                tokio::select! {
                    _ = poll.tick() => {
                        self.poll().await;
                    }
                    _ = heartbeat.tick() => {
                        self.heartbeat().await;
                        self.reset_stalled().await;
                    }
                    res = shutdown.changed() => {
                        if res.is_err() || *shutdown.borrow() {
                            info!("Permission sync job worker shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }
}
