//! Metric names and helpers
//!
//! Uses the `metrics` crate facade; the Prometheus recorder is installed by
//! the daemon and rendered on its `/metrics` route. Naming convention:
//! `wharf_{name}_{unit}`.

/// Cluster-wide task completion rate.
pub const THROUGHPUT: &str = "wharf_throughput_tasks_per_second";

/// Number of connected providers.
pub const PROVIDERS_CONNECTED: &str = "wharf_providers_connected";

/// Sum of all providers' concurrency limits.
pub const WORKERS_TOTAL: &str = "wharf_workers_total";

pub fn set_throughput(tps: f64) {
    metrics::gauge!(THROUGHPUT).set(tps);
}

pub fn set_providers_connected(n: usize) {
    metrics::gauge!(PROVIDERS_CONNECTED).set(n as f64);
}

pub fn set_workers_total(n: usize) {
    metrics::gauge!(WORKERS_TOTAL).set(n as f64);
}
