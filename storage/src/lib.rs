//! # Storage Layer
//!
//! Postgres persistence for durable permission sync jobs and sync records.

pub mod sync_jobs;

pub use sync_jobs::PgSyncJobStore;
