//! # Configuration Validation
//!
//! Provides validation for all configuration structures using the `validator` crate.

use crate::config::Config;
use validator::Validate;

/// Validate configuration structure.
///
/// # M-CANONICAL-DOCS
///
/// ## Purpose
/// Validates all configuration fields using the `validator` crate, including
/// nested sections.
///
/// ## Usage
/// ```rust,no_run
/// use config::{Config, validate};
///
/// let config = Config::default();
/// match validate(&config) {
///     Ok(()) => println!("Configuration is valid"),
///     Err(errors) => println!("Validation errors: {:?}", errors),
/// }
/// ```
///
/// ## Validation Rules
/// ### Scheduler
/// - `schedule_interval_seconds`: 1-3600
/// - `user_oldest_limit` / `repo_oldest_limit`: at most 10000
/// - `users_max_concurrency`: 1-64
///
/// ### Worker
/// - `concurrency`: 1-64
/// - `stalled_after_seconds`: 1-3600
/// - `max_num_failures`: 1-100
///
/// ### PostgreSQL
/// - `host`: 1-255 characters
/// - `port`: 1-65535
/// - `pool_size`: 1-100
pub fn validate(config: &Config) -> Result<(), validator::ValidationErrors> {
    config.validate()
}
