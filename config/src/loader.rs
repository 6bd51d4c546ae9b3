//! # Environment Variable Loader
//!
//! Loads configuration from environment variables following 12-factor app
//! principles.
//!
//! # Naming Convention
//! - `PS_*`: Scheduler and dispatcher settings
//! - `WK_*`: Durable worker settings
//! - `SITE_*`: Administrative switches
//! - `PG_*`: PostgreSQL settings

use crate::config::{Config, PermsSyncConfig, PostgresConfig, SiteConfig, WorkerConfig};
use std::env;

/// Load configuration from environment variables.
///
/// # M-CANONICAL-DOCS
///
/// ## Purpose
/// Builds a [`Config`] where every unset or unparsable variable falls back to
/// its default.
///
/// ## Usage
/// ```rust,no_run
/// use config::load_from_env;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = load_from_env()?;
///     println!("user lanes: {}", config.perms_sync.users_max_concurrency);
///     Ok(())
/// }
/// ```
///
/// ## Environment Variables
/// ### Scheduler Settings (`PS_*`)
/// - `PS_SCHEDULE_INTERVAL_SECONDS` (default: 15)
/// - `PS_USER_OLDEST_LIMIT`, `PS_REPO_OLDEST_LIMIT` (default: 10)
/// - `PS_USER_BACKOFF_SECONDS`, `PS_REPO_BACKOFF_SECONDS` (default: 60)
/// - `PS_USERS_MAX_CONCURRENCY` (default: 1)
/// - `PS_PROVIDER_REFRESH_SECONDS` (default: 60)
/// - `PS_METRICS_INTERVAL_SECONDS` (default: 60)
/// - `PS_DISPATCH_NUDGE_MILLIS` (default: 1000)
///
/// ### Worker Settings (`WK_*`)
/// - `WK_ENABLED` (default: true)
/// - `WK_CONCURRENCY` (default: 1)
/// - `WK_POLL_INTERVAL_MILLIS` (default: 1000)
/// - `WK_HEARTBEAT_INTERVAL_SECONDS` (default: 5)
/// - `WK_STALLED_AFTER_SECONDS` (default: 30)
/// - `WK_MAX_NUM_RESETS` (default: 5)
/// - `WK_MAX_NUM_FAILURES` (default: 1)
///
/// ### Site Settings (`SITE_*`)
/// - `SITE_PERMISSIONS_USER_MAPPING_ENABLED` (default: false)
/// - `SITE_ACLS_LICENSED` (default: true)
/// - `SITE_DISABLE_AUTO_CODE_HOST_SYNCS` (default: false)
///
/// ### PostgreSQL Settings (`PG_*`)
/// - `PG_HOST`, `PG_PORT`, `PG_DATABASE`, `PG_USERNAME`, `PG_PASSWORD`,
///   `PG_POOL_SIZE`, `PG_TIMEOUT_SECONDS`
pub fn load_from_env() -> Result<Config, Box<dyn std::error::Error>> {
    let config = Config {
        perms_sync: load_perms_sync_from_env()?,
        worker: load_worker_from_env()?,
        site: load_site_from_env()?,
        postgres: load_postgres_from_env()?,
    };

    Ok(config)
}

fn load_perms_sync_from_env() -> Result<PermsSyncConfig, Box<dyn std::error::Error>> {
    let defaults = PermsSyncConfig::default();
    Ok(PermsSyncConfig {
        schedule_interval_seconds: parse_env("PS_SCHEDULE_INTERVAL_SECONDS")
            .unwrap_or(defaults.schedule_interval_seconds),
        user_oldest_limit: parse_env("PS_USER_OLDEST_LIMIT").unwrap_or(defaults.user_oldest_limit),
        repo_oldest_limit: parse_env("PS_REPO_OLDEST_LIMIT").unwrap_or(defaults.repo_oldest_limit),
        user_backoff_seconds: parse_env("PS_USER_BACKOFF_SECONDS")
            .unwrap_or(defaults.user_backoff_seconds),
        repo_backoff_seconds: parse_env("PS_REPO_BACKOFF_SECONDS")
            .unwrap_or(defaults.repo_backoff_seconds),
        users_max_concurrency: parse_env("PS_USERS_MAX_CONCURRENCY")
            .unwrap_or(defaults.users_max_concurrency),
        provider_refresh_seconds: parse_env("PS_PROVIDER_REFRESH_SECONDS")
            .unwrap_or(defaults.provider_refresh_seconds),
        metrics_interval_seconds: parse_env("PS_METRICS_INTERVAL_SECONDS")
            .unwrap_or(defaults.metrics_interval_seconds),
        dispatch_nudge_millis: parse_env("PS_DISPATCH_NUDGE_MILLIS")
            .unwrap_or(defaults.dispatch_nudge_millis),
    })
}

fn load_worker_from_env() -> Result<WorkerConfig, Box<dyn std::error::Error>> {
    let defaults = WorkerConfig::default();
    Ok(WorkerConfig {
        enabled: parse_bool_env("WK_ENABLED").unwrap_or(defaults.enabled),
        concurrency: parse_env("WK_CONCURRENCY").unwrap_or(defaults.concurrency),
        poll_interval_millis: parse_env("WK_POLL_INTERVAL_MILLIS")
            .unwrap_or(defaults.poll_interval_millis),
        heartbeat_interval_seconds: parse_env("WK_HEARTBEAT_INTERVAL_SECONDS")
            .unwrap_or(defaults.heartbeat_interval_seconds),
        stalled_after_seconds: parse_env("WK_STALLED_AFTER_SECONDS")
            .unwrap_or(defaults.stalled_after_seconds),
        max_num_resets: parse_env("WK_MAX_NUM_RESETS").unwrap_or(defaults.max_num_resets),
        max_num_failures: parse_env("WK_MAX_NUM_FAILURES").unwrap_or(defaults.max_num_failures),
    })
}

fn load_site_from_env() -> Result<SiteConfig, Box<dyn std::error::Error>> {
    let defaults = SiteConfig::default();
    Ok(SiteConfig {
        permissions_user_mapping_enabled: parse_bool_env("SITE_PERMISSIONS_USER_MAPPING_ENABLED")
            .unwrap_or(defaults.permissions_user_mapping_enabled),
        acls_licensed: parse_bool_env("SITE_ACLS_LICENSED").unwrap_or(defaults.acls_licensed),
        disable_auto_code_host_syncs: parse_bool_env("SITE_DISABLE_AUTO_CODE_HOST_SYNCS")
            .unwrap_or(defaults.disable_auto_code_host_syncs),
    })
}

fn load_postgres_from_env() -> Result<PostgresConfig, Box<dyn std::error::Error>> {
    Ok(PostgresConfig {
        host: env::var("PG_HOST").unwrap_or_else(|_| "localhost".to_string()),
        port: parse_env("PG_PORT").unwrap_or(5432),
        database: env::var("PG_DATABASE").unwrap_or_else(|_| "perms_sync".to_string()),
        username: env::var("PG_USERNAME").unwrap_or_else(|_| "postgres".to_string()),
        password: env::var("PG_PASSWORD").unwrap_or_default(),
        pool_size: parse_env("PG_POOL_SIZE").unwrap_or(10),
        timeout_seconds: parse_env("PG_TIMEOUT_SECONDS").unwrap_or(30),
    })
}

fn parse_env<T>(key: &str) -> Result<T, Box<dyn std::error::Error>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(s) => s
            .parse::<T>()
            .map_err(|e| Box::new(e) as Box<dyn std::error::Error>),
        Err(e) => Err(Box::new(e) as Box<dyn std::error::Error>),
    }
}

fn parse_bool_env(key: &str) -> Option<bool> {
    env::var(key)
        .ok()
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_load_from_env_defaults() {
        let config = load_from_env().unwrap();
        assert_eq!(config.perms_sync, PermsSyncConfig::default());
        assert_eq!(config.worker, WorkerConfig::default());
    }

    #[test]
    #[serial]
    fn test_parse_env_valid_number() {
        unsafe {
            env::set_var("TEST_VAR", "123");
        }
        let result: Result<u32, _> = parse_env("TEST_VAR");
        assert_eq!(result.unwrap(), 123);
        unsafe {
            env::remove_var("TEST_VAR");
        }
    }

    #[test]
    #[serial]
    fn test_parse_env_invalid_number() {
        unsafe {
            env::set_var("TEST_VAR", "not_a_number");
        }
        let result: Result<u32, _> = parse_env("TEST_VAR");
        assert!(result.is_err());
        unsafe {
            env::remove_var("TEST_VAR");
        }
    }

    #[test]
    #[serial]
    fn test_load_perms_sync_from_env() {
        unsafe {
            env::set_var("PS_SCHEDULE_INTERVAL_SECONDS", "30");
            env::set_var("PS_USER_OLDEST_LIMIT", "25");
            env::set_var("PS_REPO_BACKOFF_SECONDS", "120");
            env::set_var("PS_USERS_MAX_CONCURRENCY", "4");
            env::set_var("PS_REPO_OLDEST_LIMIT", "garbage");
        }

        let perms_sync = load_perms_sync_from_env().unwrap();

        unsafe {
            env::remove_var("PS_SCHEDULE_INTERVAL_SECONDS");
            env::remove_var("PS_USER_OLDEST_LIMIT");
            env::remove_var("PS_REPO_BACKOFF_SECONDS");
            env::remove_var("PS_USERS_MAX_CONCURRENCY");
            env::remove_var("PS_REPO_OLDEST_LIMIT");
        }

        assert_eq!(perms_sync.schedule_interval_seconds, 30);
        assert_eq!(perms_sync.user_oldest_limit, 25);
        assert_eq!(perms_sync.repo_oldest_limit, 10);
        assert_eq!(perms_sync.repo_backoff_seconds, 120);
        assert_eq!(perms_sync.user_backoff_seconds, 60);
        assert_eq!(perms_sync.users_max_concurrency, 4);
    }

    #[test]
    #[serial]
    fn test_load_site_from_env() {
        unsafe {
            env::set_var("SITE_PERMISSIONS_USER_MAPPING_ENABLED", "TRUE");
            env::set_var("SITE_ACLS_LICENSED", "0");
        }

        let site = load_site_from_env().unwrap();

        unsafe {
            env::remove_var("SITE_PERMISSIONS_USER_MAPPING_ENABLED");
            env::remove_var("SITE_ACLS_LICENSED");
        }

        assert!(site.permissions_user_mapping_enabled);
        assert!(!site.acls_licensed);
        assert!(!site.disable_auto_code_host_syncs);
    }

    #[test]
    #[serial]
    fn test_load_worker_from_env() {
        unsafe {
            env::set_var("WK_ENABLED", "false");
            env::set_var("WK_CONCURRENCY", "3");
            env::set_var("WK_STALLED_AFTER_SECONDS", "90");
        }

        let worker = load_worker_from_env().unwrap();

        unsafe {
            env::remove_var("WK_ENABLED");
            env::remove_var("WK_CONCURRENCY");
            env::remove_var("WK_STALLED_AFTER_SECONDS");
        }

        assert!(!worker.enabled);
        assert_eq!(worker.concurrency, 3);
        assert_eq!(worker.stalled_after_seconds, 90);
        assert_eq!(worker.max_num_resets, 5);
    }

    #[test]
    #[serial]
    fn test_load_postgres_from_env() {
        unsafe {
            env::set_var("PG_HOST", "customhost");
            env::set_var("PG_PORT", "5433");
            env::set_var("PG_DATABASE", "testdb");
            env::set_var("PG_USERNAME", "testuser");
            env::set_var("PG_PASSWORD", "testpass");
            env::set_var("PG_POOL_SIZE", "20");
            env::set_var("PG_TIMEOUT_SECONDS", "60");
        }

        let postgres = load_postgres_from_env().unwrap();

        unsafe {
            env::remove_var("PG_HOST");
            env::remove_var("PG_PORT");
            env::remove_var("PG_DATABASE");
            env::remove_var("PG_USERNAME");
            env::remove_var("PG_PASSWORD");
            env::remove_var("PG_POOL_SIZE");
            env::remove_var("PG_TIMEOUT_SECONDS");
        }

        assert_eq!(postgres.host, "customhost");
        assert_eq!(postgres.port, 5433);
        assert_eq!(postgres.database, "testdb");
        assert_eq!(postgres.username, "testuser");
        assert_eq!(postgres.password, "testpass");
        assert_eq!(postgres.pool_size, 20);
        assert_eq!(postgres.timeout_seconds, 60);
    }
}
