//! Shared test fixtures for the permissions sync workspace.
//!
//! The PostgreSQL container is started lazily once per test process and
//! shared by every test in it. Callers get `None` when Docker is missing
//! and are expected to skip.

mod fixtures;

pub use fixtures::*;
