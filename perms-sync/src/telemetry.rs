use crate::store::PermsMetrics;
use crate::types::RequestType;
use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

pub struct Telemetry;

impl Telemetry {
    pub fn record_sync(request_type: RequestType, duration: Duration, success: bool) {
        histogram!(
            "perms_syncer_sync_duration_seconds",
            "type" => request_type.as_str(),
            "success" => success.to_string()
        )
        .record(duration.as_secs_f64());
        if !success {
            counter!("perms_syncer_sync_errors_total", "type" => request_type.as_str()).increment(1);
        }
    }

    pub fn record_success(request_type: RequestType) {
        counter!("perms_syncer_success_syncs_total", "type" => request_type.as_str()).increment(1);
    }

    pub fn record_first_sync(request_type: RequestType, delay: chrono::Duration) {
        counter!("perms_syncer_initial_syncs_total", "type" => request_type.as_str()).increment(1);
        gauge!("perms_syncer_perms_first_sync_delay_seconds", "type" => request_type.as_str())
            .set(delay.num_milliseconds() as f64 / 1000.0);
    }

    pub fn record_consecutive_sync(request_type: RequestType, delay: chrono::Duration) {
        gauge!(
            "perms_syncer_perms_consecutive_sync_delay_seconds",
            "type" => request_type.as_str()
        )
        .set(delay.num_milliseconds() as f64 / 1000.0);
    }

    pub fn set_no_perms(request_type: RequestType, count: usize) {
        gauge!("perms_syncer_no_perms", "type" => request_type.as_str()).set(count as f64);
    }

    pub fn record_schedule_error() {
        counter!("perms_syncer_schedule_errors_total").increment(1);
    }

    pub fn record_provider_refresh_error() {
        counter!("perms_syncer_provider_refresh_errors_total").increment(1);
    }

    pub fn set_queue_size(size: usize) {
        gauge!("perms_syncer_queue_size").set(size as f64);
    }

    /// Publishes staleness gauges. `strict` is computed with a shorter age.
    pub fn set_stale_perms(loose: &PermsMetrics, strict: &PermsMetrics) {
        for (label, stale, strict_stale, gap) in [
            (
                "user",
                loose.users_with_stale_perms,
                strict.users_with_stale_perms,
                loose.users_perms_gap_seconds
            ),
            (
                "repo",
                loose.repos_with_stale_perms,
                strict.repos_with_stale_perms,
                loose.repos_perms_gap_seconds
            ),
            (
                "sub-repo",
                loose.sub_repos_with_stale_perms,
                strict.sub_repos_with_stale_perms,
                loose.sub_repos_perms_gap_seconds
            )
        ] {
            gauge!("perms_syncer_stale_perms", "type" => label).set(stale as f64);
            gauge!("perms_syncer_strict_stale_perms", "type" => label).set(strict_stale as f64);
            gauge!("perms_syncer_perms_gap_seconds", "type" => label).set(gap);
        }
    }

    pub fn record_job_outcome(outcome: &'static str) {
        counter!("perms_sync_jobs_processed_total", "outcome" => outcome).increment(1);
    }
}

/// Tracks one running sync in the per-lane concurrency gauge.
pub struct ConcurrentSyncGuard {
    request_type: RequestType
}

impl ConcurrentSyncGuard {
    pub fn new(request_type: RequestType) -> Self {
        gauge!("perms_syncer_concurrent_syncs", "type" => request_type.as_str()).increment(1.0);
        Self { request_type }
    }
}

impl Drop for ConcurrentSyncGuard {
    fn drop(&mut self) {
        gauge!("perms_syncer_concurrent_syncs", "type" => self.request_type.as_str())
            .decrement(1.0);
    }
}

pub struct SyncTimer {
    start: Instant,
    request_type: RequestType
}

impl SyncTimer {
    pub fn new(request_type: RequestType) -> Self {
        Self {
            start: Instant::now(),
            request_type
        }
    }

    pub fn finish(self, success: bool) {
        Telemetry::record_sync(self.request_type, self.start.elapsed(), success);
    }
}
