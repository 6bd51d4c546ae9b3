//! Wires the queue, scheduler, dispatcher and metrics collector together
//! and exposes the external trigger API.

use crate::dispatcher::Dispatcher;
use crate::error::{PermsSyncResult, StoreContext};
use crate::provider::{ProviderRegistry, ProviderSource};
use crate::queue::{RequestMeta, RequestQueue, SyncRequest};
use crate::scheduler::{Scheduler, SyncGate};
use crate::store::Stores;
use crate::syncer::{PermsSync, PermsSyncer};
use crate::telemetry::Telemetry;
use crate::types::{FetchPermsOptions, Priority, RepoId, UserId};
use crate::worker::SyncJobHandler;
use config::PermsSyncConfig;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Age after which permissions count as stale.
pub const STALE_PERMS_AGE: Duration = Duration::from_secs(3 * 24 * 60 * 60);

/// Tighter staleness window for the strict gauges.
pub const STRICT_STALE_PERMS_AGE: Duration = Duration::from_secs(60 * 60);

/// Queue contents as reported by the debug endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct DebugDump {
    pub name: &'static str,
    pub size: usize,
    pub queue: Vec<SyncRequest>
}

pub struct PermsSyncService {
    config: PermsSyncConfig,
    stores: Stores,
    registry: Arc<ProviderRegistry>,
    gate: Arc<dyn SyncGate>,
    queue: Arc<RequestQueue>,
    syncer: Arc<PermsSyncer>,
    scheduler: Arc<Scheduler>,
    dispatcher: Arc<Dispatcher>
}

impl PermsSyncService {
    pub fn new(
        config: PermsSyncConfig,
        registry: Arc<ProviderRegistry>,
        stores: Stores,
        gate: Arc<dyn SyncGate>
    ) -> Self {
        let queue = Arc::new(RequestQueue::new());
        let syncer = Arc::new(PermsSyncer::new(Arc::clone(&registry), stores.clone()));
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&queue),
            Arc::clone(&stores.perms),
            Arc::clone(&gate),
            config.clone()
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&queue),
            Arc::clone(&syncer) as Arc<dyn PermsSync>,
            Arc::clone(&stores.sync_records),
            stores.clock.clone(),
            &config
        ));

        Self {
            config,
            stores,
            registry,
            gate,
            queue,
            syncer,
            scheduler,
            dispatcher
        }
    }

    pub fn queue(&self) -> &Arc<RequestQueue> {
        &self.queue
    }

    pub fn syncer(&self) -> &Arc<PermsSyncer> {
        &self.syncer
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Handler for durable jobs sharing this service's lanes.
    pub fn job_handler(&self) -> SyncJobHandler {
        SyncJobHandler::new(Arc::clone(&self.dispatcher))
    }

    /// Queues high-priority syncs for the given users. Does nothing when
    /// background syncing is disabled.
    pub fn schedule_users(&self, options: FetchPermsOptions, user_ids: &[UserId]) {
        if user_ids.is_empty() || self.gate.is_disabled() {
            return;
        }
        for &id in user_ids {
            self.queue
                .enqueue(RequestMeta::user(id, Priority::High).with_options(options));
        }
        debug!(count = user_ids.len(), "Scheduled user permissions syncs");
    }

    pub fn schedule_repos(&self, repo_ids: &[RepoId]) {
        if repo_ids.is_empty() || self.gate.is_disabled() {
            return;
        }
        for &id in repo_ids {
            self.queue.enqueue(RequestMeta::repo(id, Priority::High));
        }
        debug!(count = repo_ids.len(), "Scheduled repository permissions syncs");
    }

    pub fn debug_dump(&self) -> DebugDump {
        let queue = self.queue.snapshot();
        DebugDump {
            name: "permissions",
            size: queue.len(),
            queue
        }
    }

    /// Publishes queue size and permission staleness gauges.
    pub async fn collect_metrics(&self) -> PermsSyncResult<()> {
        Telemetry::set_queue_size(self.queue.len());

        let loose = self
            .stores
            .perms
            .metrics(STALE_PERMS_AGE)
            .await
            .context("load permissions metrics")?;
        let strict = self
            .stores
            .perms
            .metrics(STRICT_STALE_PERMS_AGE)
            .await
            .context("load strict permissions metrics")?;
        Telemetry::set_stale_perms(&loose, &strict);
        Ok(())
    }

    fn run_metrics(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.metrics_interval());
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.collect_metrics().await {
                            warn!(error = %e, "Failed to collect permissions metrics");
                        }
                    }
                    res = shutdown.changed() => {
                        if res.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Starts every background loop. The provider refresh loop only runs
    /// when a source is given.
    pub fn run(
        self: Arc<Self>,
        source: Option<Arc<dyn ProviderSource>>,
        shutdown: watch::Receiver<bool>
    ) -> Vec<JoinHandle<()>> {
        info!(
            schedule_interval_seconds = self.config.schedule_interval_seconds,
            users_max_concurrency = self.config.users_max_concurrency,
            "Starting permissions sync service"
        );

        let mut handles = Vec::with_capacity(4);
        if let Some(source) = source {
            handles.push(Arc::clone(&self.registry).run_refresh(
                source,
                self.config.provider_refresh_interval(),
                shutdown.clone()
            ));
        }
        handles.push(Arc::clone(&self.scheduler).run(shutdown.clone()));
        handles.push(Arc::clone(&self.dispatcher).run(shutdown.clone()));
        handles.push(self.run_metrics(shutdown));
        handles
    }
}
