pub mod dispatcher;
pub mod error;
pub mod jobs;
pub mod provider;
pub mod queue;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod syncer;
pub mod telemetry;
pub mod types;
pub mod worker;

pub use dispatcher::Dispatcher;
pub use error::{PermsSyncError, PermsSyncResult, SyncFailure, SyncOutcome, SyncResult};
pub use jobs::{
    JobPriority, JobState, NewSyncJob, PermissionSyncJob, SyncJobQueue, SyncJobReason,
    SyncJobResult
};
pub use provider::{AuthzProvider, FetchFailure, FetchResult, ProviderRegistry, ProviderSource};
pub use queue::{RequestMeta, RequestQueue, SyncRequest};
pub use scheduler::{Scheduler, SiteGate, SyncGate};
pub use service::{DebugDump, PermsSyncService};
pub use store::Stores;
pub use syncer::{PermsSync, PermsSyncer};
pub use worker::{SyncJobHandler, SyncJobWorker};
