//! # Configuration System
//!
//! Centralized configuration management for the permissions sync engine.
//!
//! This crate provides:
//! - Configuration structures for the scheduler, dispatcher and worker
//! - Environment variable loading (12-factor app principles)
//! - Configuration file loading (TOML/YAML)
//! - Configuration validation

pub mod config;
pub mod file_loader;
pub mod loader;
pub mod validation;

pub use config::{Config, PermsSyncConfig, PostgresConfig, SiteConfig, WorkerConfig};
pub use file_loader::{ConfigFileError, load_from_file, load_from_toml, load_from_yaml};
pub use loader::load_from_env;
pub use validation::validate;
pub use ::validator::Validate;
