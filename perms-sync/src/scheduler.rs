//! Periodic discovery of entities whose permissions need syncing.

use crate::error::{PermsSyncResult, StoreContext};
use crate::queue::{RequestMeta, RequestQueue};
use crate::store::PermsStore;
use crate::telemetry::Telemetry;
use crate::types::{Priority, RequestType};
use config::{PermsSyncConfig, SiteConfig};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Administrative switches that turn background syncing off.
pub trait SyncGate: Send + Sync {
    /// Explicit user mapping replaces code host permissions entirely.
    fn permissions_user_mapping_enabled(&self) -> bool;

    fn acls_licensed(&self) -> bool;

    fn disable_auto_code_host_syncs(&self) -> bool;

    fn is_disabled(&self) -> bool {
        self.permissions_user_mapping_enabled()
            || !self.acls_licensed()
            || self.disable_auto_code_host_syncs()
    }
}

/// Gate backed by the site configuration. Replaced in place when the
/// configuration changes.
pub struct SiteGate {
    site: RwLock<SiteConfig>
}

impl SiteGate {
    pub fn new(site: SiteConfig) -> Self {
        Self {
            site: RwLock::new(site)
        }
    }

    pub fn update(&self, site: SiteConfig) {
        *self.site.write() = site;
    }
}

impl SyncGate for SiteGate {
    fn permissions_user_mapping_enabled(&self) -> bool {
        self.site.read().permissions_user_mapping_enabled
    }

    fn acls_licensed(&self) -> bool {
        self.site.read().acls_licensed
    }

    fn disable_auto_code_host_syncs(&self) -> bool {
        self.site.read().disable_auto_code_host_syncs
    }
}

pub struct Scheduler {
    queue: Arc<RequestQueue>,
    perms: Arc<dyn PermsStore>,
    gate: Arc<dyn SyncGate>,
    config: PermsSyncConfig
}

impl Scheduler {
    pub fn new(
        queue: Arc<RequestQueue>,
        perms: Arc<dyn PermsStore>,
        gate: Arc<dyn SyncGate>,
        config: PermsSyncConfig
    ) -> Self {
        Self {
            queue,
            perms,
            gate,
            config
        }
    }

    /// Computes the next batch of low-priority requests. Never-synced users
    /// come first, then never-synced private repos, then the stalest users
    /// and repos.
    pub async fn schedule(&self) -> PermsSyncResult<Vec<RequestMeta>> {
        let mut schedule = Vec::new();

        let users = self
            .perms
            .user_ids_with_no_perms()
            .await
            .context("load users with no permissions")?;
        Telemetry::set_no_perms(RequestType::User, users.len());
        schedule.extend(
            users
                .into_iter()
                .map(|id| RequestMeta::user(id, Priority::Low).with_no_perms(true))
        );

        let repos = self
            .perms
            .repo_ids_with_no_perms()
            .await
            .context("load repositories with no permissions")?;
        Telemetry::set_no_perms(RequestType::Repo, repos.len());
        schedule.extend(
            repos
                .into_iter()
                .map(|id| RequestMeta::repo(id, Priority::Low).with_no_perms(true))
        );

        let users = self
            .perms
            .user_ids_with_oldest_perms(
                self.config.user_oldest_limit as usize,
                self.config.user_backoff()
            )
            .await
            .context("load users with oldest permissions")?;
        schedule.extend(
            users
                .into_iter()
                .map(|(id, at)| RequestMeta::user(id, Priority::Low).with_next_sync_at(at))
        );

        let repos = self
            .perms
            .repo_ids_with_oldest_perms(
                self.config.repo_oldest_limit as usize,
                self.config.repo_backoff()
            )
            .await
            .context("load repositories with oldest permissions")?;
        schedule.extend(
            repos
                .into_iter()
                .map(|(id, at)| RequestMeta::repo(id, Priority::Low).with_next_sync_at(at))
        );

        Ok(schedule)
    }

    /// Runs one scheduling pass and returns how many requests were enqueued.
    pub async fn tick(&self) -> usize {
        if self.gate.is_disabled() {
            debug!("Background permissions syncing disabled, skipping schedule");
            return 0;
        }

        let schedule = match self.schedule().await {
            Ok(schedule) => schedule,
            Err(e) => {
                Telemetry::record_schedule_error();
                error!(error = %e, "Failed to compute schedule");
                return 0;
            }
        };

        let users = schedule
            .iter()
            .filter(|m| m.request_type == RequestType::User)
            .count();
        debug!(users, repos = schedule.len() - users, "Scheduling permissions syncs");

        let count = schedule.len();
        for meta in schedule {
            self.queue.enqueue(meta);
        }
        count
    }

    pub fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.schedule_interval());
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.tick().await;
                    }
                    res = shutdown.changed() => {
                        if res.is_err() || *shutdown.borrow() {
                            info!("Permissions sync scheduler shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }
}
