//! # Configuration Structures
//!
//! This module defines all configuration structures for the permissions sync
//! engine.
//!
//! All configuration structures:
//! - Use `serde` for serialization/deserialization
//! - Use `validator` for input validation
//! - Include comprehensive M-CANONICAL-DOCS

use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

/// Main configuration structure for the permissions sync engine.
///
/// # M-CANONICAL-DOCS
///
/// ## Purpose
/// Aggregates the scheduling, worker, site and database settings read at
/// startup.
///
/// ## Usage
/// ```rust,no_run
/// use config::Config;
///
/// let config = Config::default();
/// println!("schedule interval: {}s", config.perms_sync.schedule_interval_seconds);
/// ```
///
/// ## Fields
/// - `perms_sync`: Scheduler and dispatcher tuning
/// - `worker`: Durable job worker tuning
/// - `site`: Administrative switches that gate background syncing
/// - `postgres`: Connection settings for the durable job table
///
/// ## Validation
/// All nested configurations must pass their own validation rules.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default, PartialEq)]
pub struct Config {
    /// Scheduler and dispatcher tuning
    #[serde(default)]
    #[validate(nested)]
    pub perms_sync: PermsSyncConfig,

    /// Durable job worker tuning
    #[serde(default)]
    #[validate(nested)]
    pub worker: WorkerConfig,

    /// Administrative switches
    #[serde(default)]
    pub site: SiteConfig,

    /// PostgreSQL connection configuration
    #[serde(default)]
    #[validate(nested)]
    pub postgres: PostgresConfig
}

/// Scheduler and dispatcher configuration.
///
/// # M-CANONICAL-DOCS
///
/// ## Purpose
/// Controls how often the scheduler looks for stale permissions, how many
/// stale entities it picks per pass, and how many syncs run at once.
///
/// ## Fields
/// - `schedule_interval_seconds`: Scheduler tick (default: 15, range: 1-3600)
/// - `user_oldest_limit`: Oldest users picked per tick (default: 10)
/// - `repo_oldest_limit`: Oldest repos picked per tick (default: 10)
/// - `user_backoff_seconds`: Minimum age of a user's last sync (default: 60)
/// - `repo_backoff_seconds`: Minimum age of a repo's last sync (default: 60)
/// - `users_max_concurrency`: Parallel user syncs (default: 1, range: 1-64)
/// - `provider_refresh_seconds`: Provider registry reload (default: 60)
/// - `metrics_interval_seconds`: Stale-perms gauge refresh (default: 60)
/// - `dispatch_nudge_millis`: Dispatcher wake-up without notification
///   (default: 1000)
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct PermsSyncConfig {
    #[serde(default = "default_schedule_interval")]
    #[validate(range(min = 1, max = 3600))]
    pub schedule_interval_seconds: u64,

    #[serde(default = "default_oldest_limit")]
    #[validate(range(max = 10000))]
    pub user_oldest_limit: u32,

    #[serde(default = "default_oldest_limit")]
    #[validate(range(max = 10000))]
    pub repo_oldest_limit: u32,

    #[serde(default = "default_backoff")]
    #[validate(range(max = 604800))]
    pub user_backoff_seconds: u64,

    #[serde(default = "default_backoff")]
    #[validate(range(max = 604800))]
    pub repo_backoff_seconds: u64,

    #[serde(default = "default_users_max_concurrency")]
    #[validate(range(min = 1, max = 64))]
    pub users_max_concurrency: usize,

    #[serde(default = "default_provider_refresh")]
    #[validate(range(min = 1, max = 86400))]
    pub provider_refresh_seconds: u64,

    #[serde(default = "default_metrics_interval")]
    #[validate(range(min = 1, max = 3600))]
    pub metrics_interval_seconds: u64,

    #[serde(default = "default_dispatch_nudge")]
    #[validate(range(min = 10, max = 60000))]
    pub dispatch_nudge_millis: u64
}

fn default_schedule_interval() -> u64 {
    15
}

fn default_oldest_limit() -> u32 {
    10
}

fn default_backoff() -> u64 {
    60
}

fn default_users_max_concurrency() -> usize {
    1
}

fn default_provider_refresh() -> u64 {
    60
}

fn default_metrics_interval() -> u64 {
    60
}

fn default_dispatch_nudge() -> u64 {
    1000
}

impl Default for PermsSyncConfig {
    fn default() -> Self {
        Self {
            schedule_interval_seconds: default_schedule_interval(),
            user_oldest_limit: default_oldest_limit(),
            repo_oldest_limit: default_oldest_limit(),
            user_backoff_seconds: default_backoff(),
            repo_backoff_seconds: default_backoff(),
            users_max_concurrency: default_users_max_concurrency(),
            provider_refresh_seconds: default_provider_refresh(),
            metrics_interval_seconds: default_metrics_interval(),
            dispatch_nudge_millis: default_dispatch_nudge()
        }
    }
}

impl PermsSyncConfig {
    pub fn schedule_interval(&self) -> Duration {
        Duration::from_secs(self.schedule_interval_seconds)
    }

    pub fn user_backoff(&self) -> Duration {
        Duration::from_secs(self.user_backoff_seconds)
    }

    pub fn repo_backoff(&self) -> Duration {
        Duration::from_secs(self.repo_backoff_seconds)
    }

    pub fn provider_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.provider_refresh_seconds)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_seconds)
    }

    pub fn dispatch_nudge(&self) -> Duration {
        Duration::from_millis(self.dispatch_nudge_millis)
    }
}

/// Durable job worker configuration.
///
/// # M-CANONICAL-DOCS
///
/// ## Purpose
/// Tunes the poll loop that drains the `permission_sync_jobs` table.
///
/// ## Fields
/// - `enabled`: Run the worker (default: true)
/// - `concurrency`: Jobs processed at once (default: 1, range: 1-64)
/// - `poll_interval_millis`: Idle poll delay (default: 1000)
/// - `heartbeat_interval_seconds`: Heartbeat period for running jobs
///   (default: 5)
/// - `stalled_after_seconds`: Heartbeat age after which a job is reset
///   (default: 30)
/// - `max_num_resets`: Resets before a stalled job fails (default: 5)
/// - `max_num_failures`: Errors before a job fails for good (default: 1)
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_enabled")]
    pub enabled: bool,

    #[serde(default = "default_worker_concurrency")]
    #[validate(range(min = 1, max = 64))]
    pub concurrency: usize,

    #[serde(default = "default_worker_poll_interval")]
    #[validate(range(min = 10, max = 60000))]
    pub poll_interval_millis: u64,

    #[serde(default = "default_worker_heartbeat")]
    #[validate(range(min = 1, max = 600))]
    pub heartbeat_interval_seconds: u64,

    #[serde(default = "default_worker_stalled_after")]
    #[validate(range(min = 1, max = 3600))]
    pub stalled_after_seconds: u64,

    #[serde(default = "default_worker_max_resets")]
    #[validate(range(max = 100))]
    pub max_num_resets: i32,

    #[serde(default = "default_worker_max_failures")]
    #[validate(range(min = 1, max = 100))]
    pub max_num_failures: i32
}

fn default_worker_enabled() -> bool {
    true
}

fn default_worker_concurrency() -> usize {
    1
}

fn default_worker_poll_interval() -> u64 {
    1000
}

fn default_worker_heartbeat() -> u64 {
    5
}

fn default_worker_stalled_after() -> u64 {
    30
}

fn default_worker_max_resets() -> i32 {
    5
}

fn default_worker_max_failures() -> i32 {
    1
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: default_worker_enabled(),
            concurrency: default_worker_concurrency(),
            poll_interval_millis: default_worker_poll_interval(),
            heartbeat_interval_seconds: default_worker_heartbeat(),
            stalled_after_seconds: default_worker_stalled_after(),
            max_num_resets: default_worker_max_resets(),
            max_num_failures: default_worker_max_failures()
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_millis)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn stalled_after(&self) -> Duration {
        Duration::from_secs(self.stalled_after_seconds)
    }
}

/// Site-level switches.
///
/// Background syncing is disabled when explicit user mapping is on, when the
/// ACL feature is not licensed, or when auto code host syncs are turned off.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SiteConfig {
    #[serde(default)]
    pub permissions_user_mapping_enabled: bool,

    #[serde(default = "default_acls_licensed")]
    pub acls_licensed: bool,

    #[serde(default)]
    pub disable_auto_code_host_syncs: bool
}

fn default_acls_licensed() -> bool {
    true
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            permissions_user_mapping_enabled: false,
            acls_licensed: default_acls_licensed(),
            disable_auto_code_host_syncs: false
        }
    }
}

/// PostgreSQL configuration.
///
/// # M-CANONICAL-DOCS
///
/// ## Purpose
/// Connection settings for the database holding the durable job table.
///
/// ## Fields
/// - `host`: Database server hostname (default: "localhost")
/// - `port`: Database server port (default: 5432)
/// - `database`: Database name (default: "perms_sync")
/// - `username`: Database user (default: "postgres")
/// - `password`: Database password (should use environment variable)
/// - `pool_size`: Maximum connections in pool (default: 10, range: 1-100)
/// - `timeout_seconds`: Connection timeout (default: 30, range: 1-300)
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct PostgresConfig {
    /// Database server hostname
    #[serde(default = "default_postgres_host")]
    #[validate(length(min = 1, max = 255))]
    pub host: String,

    /// Database server port
    #[serde(default = "default_postgres_port")]
    #[validate(range(min = 1, max = 65535))]
    pub port: u16,

    /// Database name
    #[serde(default = "default_postgres_database")]
    #[validate(length(min = 1, max = 63))]
    pub database: String,

    /// Database username
    #[serde(default = "default_postgres_username")]
    #[validate(length(min = 1, max = 63))]
    pub username: String,

    /// Database password
    #[serde(default)]
    pub password: String,

    /// Maximum connections in pool
    #[serde(default = "default_postgres_pool_size")]
    #[validate(range(min = 1, max = 100))]
    pub pool_size: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_postgres_timeout")]
    #[validate(range(min = 1, max = 300))]
    pub timeout_seconds: u64
}

fn default_postgres_host() -> String {
    "localhost".to_string()
}

fn default_postgres_port() -> u16 {
    5432
}

fn default_postgres_database() -> String {
    "perms_sync".to_string()
}

fn default_postgres_username() -> String {
    "postgres".to_string()
}

fn default_postgres_pool_size() -> u32 {
    10
}

fn default_postgres_timeout() -> u64 {
    30
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: default_postgres_host(),
            port: default_postgres_port(),
            database: default_postgres_database(),
            username: default_postgres_username(),
            password: String::new(),
            pool_size: default_postgres_pool_size(),
            timeout_seconds: default_postgres_timeout()
        }
    }
}

impl PostgresConfig {
    pub fn connection_url(&self) -> String {
        if self.password.is_empty() {
            format!(
                "postgres://{}@{}:{}/{}",
                self.username, self.host, self.port, self.database
            )
        } else {
            format!(
                "postgres://{}:{}@{}:{}/{}",
                self.username, self.password, self.host, self.port, self.database
            )
        }
    }
}
