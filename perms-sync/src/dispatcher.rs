//! Pulls requests off the queue and runs them in per-type lanes.
//!
//! Each lane is a semaphore: users get `users_max_concurrency` permits and
//! repos exactly one, since repository syncs against one code host share a
//! rate-limited token. The loop only blocks when the lane it needs is full.

use crate::error::{PermsSyncError, SyncFailure, SyncResult};
use crate::queue::{RequestQueue, SyncRequest};
use crate::store::{SyncRecord, SyncRecordsStore};
use crate::syncer::PermsSync;
use crate::telemetry::ConcurrentSyncGuard;
use crate::types::{Clock, RequestType};
use chrono::{DateTime, Utc};
use config::PermsSyncConfig;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const REPOS_MAX_CONCURRENCY: usize = 1;

pub struct Dispatcher {
    queue: Arc<RequestQueue>,
    syncer: Arc<dyn PermsSync>,
    records: Arc<dyn SyncRecordsStore>,
    clock: Clock,
    users: Arc<Semaphore>,
    repos: Arc<Semaphore>,
    dequeued: Notify,
    nudge: Duration,
    // Earliest pending wake-up for a request that was not yet due.
    armed: Mutex<Option<DateTime<Utc>>>
}

impl Dispatcher {
    pub fn new(
        queue: Arc<RequestQueue>,
        syncer: Arc<dyn PermsSync>,
        records: Arc<dyn SyncRecordsStore>,
        clock: Clock,
        config: &PermsSyncConfig
    ) -> Self {
        Self {
            queue,
            syncer,
            records,
            clock,
            users: Arc::new(Semaphore::new(config.users_max_concurrency.max(1))),
            repos: Arc::new(Semaphore::new(REPOS_MAX_CONCURRENCY)),
            dequeued: Notify::new(),
            nudge: config.dispatch_nudge(),
            armed: Mutex::new(None)
        }
    }

    pub fn queue(&self) -> &Arc<RequestQueue> {
        &self.queue
    }

    fn lane(&self, request_type: RequestType) -> &Arc<Semaphore> {
        match request_type {
            RequestType::User => &self.users,
            RequestType::Repo => &self.repos
        }
    }

    /// Free permits in the lane for `request_type`.
    pub fn available(&self, request_type: RequestType) -> usize {
        self.lane(request_type).available_permits()
    }

    /// Runs one request through its lane, waiting for a permit if the lane
    /// is full, and records the outcome. The queue is not touched.
    pub async fn execute(&self, request: &SyncRequest) -> SyncResult {
        let permit = match Arc::clone(self.lane(request.meta.request_type))
            .acquire_owned()
            .await
        {
            Ok(permit) => permit,
            Err(e) => {
                return Err(SyncFailure::new(
                    PermsSyncError::TaskAborted(e.to_string()),
                    Default::default()
                ));
            }
        };
        self.sync_and_record(request, permit).await
    }

    async fn sync_and_record(&self, request: &SyncRequest, _permit: OwnedSemaphorePermit) -> SyncResult {
        let _running = ConcurrentSyncGuard::new(request.meta.request_type);
        let meta = &request.meta;
        let started_at = (self.clock)();

        let outcome = match meta.request_type {
            RequestType::User => {
                self.syncer
                    .sync_user_perms(meta.id, meta.no_perms, meta.options)
                    .await
            }
            RequestType::Repo => {
                self.syncer
                    .sync_repo_perms(meta.id, meta.no_perms, meta.options)
                    .await
            }
        };

        let (result, provider_states, failure_message) = match &outcome {
            Ok(o) => (o.result, o.provider_states.clone(), None),
            Err(f) => (None, f.provider_states.clone(), Some(f.error.to_string()))
        };
        if let Some(message) = &failure_message {
            warn!(
                request_type = %meta.request_type,
                id = meta.id,
                error = %message,
                "Failed to sync permissions"
            );
        }

        let record = SyncRecord {
            request_type: meta.request_type,
            id: meta.id,
            priority: meta.priority,
            no_perms: meta.no_perms,
            invalidate_caches: meta.options.invalidate_caches,
            started_at,
            finished_at: (self.clock)(),
            result,
            provider_states,
            failure_message
        };
        if let Err(e) = self.records.record(&record).await {
            warn!(
                request_type = %meta.request_type,
                id = meta.id,
                error = %e,
                "Failed to record sync outcome"
            );
        }

        outcome
    }

    /// Acquires and dispatches requests until the queue has nothing due.
    /// Returns the number of requests handed to a lane. Waiting on a full
    /// lane gives up as soon as `shutdown` turns true, leaving the request
    /// queued.
    pub async fn dispatch_ready(self: &Arc<Self>, shutdown: &mut watch::Receiver<bool>) -> usize {
        let mut dispatched = 0;
        while let Some(request) = self.queue.acquire_next() {
            let now = (self.clock)();
            if let Some(at) = request.meta.next_sync_at.filter(|at| *at > now) {
                self.queue.release(request.meta.request_type, request.meta.id);
                self.arm(at, now);
                break;
            }

            let lane = Arc::clone(self.lane(request.meta.request_type));
            let permit = tokio::select! {
                permit = lane.acquire_owned() => permit.ok(),
                _ = stopped(shutdown) => None
            };
            let Some(permit) = permit else {
                self.queue.release(request.meta.request_type, request.meta.id);
                break;
            };

            let this = Arc::clone(self);
            tokio::spawn(async move {
                let (request_type, id) = request.key();
                let _ = this.sync_and_record(&request, permit).await;
                this.queue.remove(request_type, id, true);
                this.dequeued.notify_one();
            });
            dispatched += 1;
        }
        dispatched
    }

    /// Schedules a queue notification for when the head becomes due.
    fn arm(&self, at: DateTime<Utc>, now: DateTime<Utc>) {
        {
            let mut armed = self.armed.lock();
            if matches!(*armed, Some(current) if current > now && current <= at) {
                return;
            }
            *armed = Some(at);
        }

        let wait = (at - now).to_std().unwrap_or_default();
        debug!(wait_ms = wait.as_millis() as u64, "Head of queue not due yet");
        let queue = Arc::clone(&self.queue);
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            queue.notify();
        });
    }

    pub fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut nudge = tokio::time::interval(self.nudge);
            loop {
                tokio::select! {
                    _ = self.queue.notified() => {}
                    _ = self.dequeued.notified() => {}
                    _ = nudge.tick() => {}
                    res = shutdown.changed() => {
                        if res.is_err() || *shutdown.borrow() {
                            info!("Permissions sync dispatcher shutting down");
                            break;
                        }
                        continue;
                    }
                }
                self.dispatch_ready(&mut shutdown).await;
                if *shutdown.borrow() {
                    info!("Permissions sync dispatcher shutting down");
                    break;
                }
            }
        })
    }
}

/// Resolves once shutdown is requested or the sender is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
