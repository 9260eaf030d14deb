//! Metrics emitted by the state layer through the `metrics` facade.
//!
//! ## Metric Naming Conventions
//!
//! All metrics follow the pattern: `keel_{subsystem}_{name}_{unit}`
//!
//! - Counters: `_total` suffix
//! - Histograms: `_seconds` suffix
//! - Gauges: no suffix
//!
//! No recorder is installed here; the embedding process chooses one.

use metrics::{counter, gauge, histogram};

// =============================================================================
// Metric Names (constants for consistency)
// =============================================================================

// Transaction runner metrics
const TXN_ATTEMPTS_TOTAL: &str = "keel_txn_attempts_total";
const TXN_ABORTS_TOTAL: &str = "keel_txn_aborts_total";
const TXN_CONTENTION_TOTAL: &str = "keel_txn_contention_total";
const TXN_COMMIT_LATENCY: &str = "keel_txn_commit_latency_seconds";

// Lease metrics
const LEASE_CLAIMS_TOTAL: &str = "keel_lease_claims_total";
const LEASE_EXPIRED_TOTAL: &str = "keel_lease_expired_total";

// Watcher metrics
const WATCHERS_ACTIVE: &str = "keel_watchers_active";
const WATCHER_RESYNCS_TOTAL: &str = "keel_watcher_resyncs_total";

// Cleanup metrics
const CLEANUPS_TOTAL: &str = "keel_cleanups_total";

// =============================================================================
// Transaction Runner
// =============================================================================

/// Records one commit attempt and its latency.
#[inline]
pub fn record_txn_attempt(committed: bool, latency_secs: f64) {
    let status = if committed { "committed" } else { "aborted" };
    counter!(TXN_ATTEMPTS_TOTAL, "status" => status).increment(1);
    histogram!(TXN_COMMIT_LATENCY, "status" => status).record(latency_secs);
    if !committed {
        counter!(TXN_ABORTS_TOTAL).increment(1);
    }
}

/// Records an operation that gave up after exhausting its retry budget.
#[inline]
pub fn record_txn_contention() {
    counter!(TXN_CONTENTION_TOTAL).increment(1);
}

// =============================================================================
// Leases
// =============================================================================

/// Records a lease claim outcome (`granted`, `denied`, `invalid`).
#[inline]
pub fn record_lease_claim(namespace: &str, outcome: &'static str) {
    counter!(LEASE_CLAIMS_TOTAL, "namespace" => namespace.to_string(), "outcome" => outcome)
        .increment(1);
}

/// Records leases removed by the expiry collector.
#[inline]
pub fn record_leases_expired(count: usize) {
    counter!(LEASE_EXPIRED_TOTAL).increment(count as u64);
}

// =============================================================================
// Watchers
// =============================================================================

/// Adjusts the number of running watcher tasks.
#[inline]
pub fn watcher_started() {
    gauge!(WATCHERS_ACTIVE).increment(1.0);
}

/// Adjusts the number of running watcher tasks.
#[inline]
pub fn watcher_stopped() {
    gauge!(WATCHERS_ACTIVE).decrement(1.0);
}

/// Records a watcher that fell behind the change stream and recomputed.
#[inline]
pub fn record_watcher_resync() {
    counter!(WATCHER_RESYNCS_TOTAL).increment(1);
}

// =============================================================================
// Cleanups
// =============================================================================

/// Records a processed cleanup job.
#[inline]
pub fn record_cleanup(kind: &'static str, success: bool) {
    let status = if success { "success" } else { "error" };
    counter!(CLEANUPS_TOTAL, "kind" => kind, "status" => status).increment(1);
}
