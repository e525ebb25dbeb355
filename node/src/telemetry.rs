// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use std::sync::OnceLock;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::metrics::{exported_name, names};

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("failed to install log subscriber: {0}")]
    Subscriber(String),

    #[error("failed to install Prometheus recorder: {0}")]
    Recorder(String),
}

/// Install logging and the Prometheus recorder.
///
/// `RUST_LOG` wins over `default_filter`. The recorder is installed once;
/// a second call fails because the subscriber is already set.
pub fn init_telemetry(default_filter: &str) -> Result<(), TelemetryError> {
    if PROM_HANDLE.get().is_none() {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| TelemetryError::Recorder(e.to_string()))?;
        if PROM_HANDLE.set(handle).is_ok() {
            describe_metrics();
        }
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| TelemetryError::Subscriber(e.to_string()))
}

fn describe_metrics() {
    let counters = [
        (names::RELAYS_PROCESSED, "Relays applied to a session tree"),
        (names::RELAYS_DEDUPLICATED, "Relays dropped as duplicates"),
        (names::RELAYS_REJECTED, "Relays rejected before the WAL"),
        (names::SESSION_TRANSITIONS, "Session state transitions"),
        (names::SESSIONS_CREATED, "Sessions created on first relay"),
        (names::SESSIONS_SETTLED, "Sessions that reached Settled"),
        (names::SESSIONS_FAILED, "Sessions that expired unsettled"),
        (names::SESSIONS_SKIPPED_AT_STARTUP, "Session snapshots skipped during recovery"),
        (names::SESSION_STORE_ERRORS, "Session store failures"),
        (names::TRANSITIONS_DEFERRED, "Transitions deferred for lack of a permit"),
        (names::CLAIMS_SUBMITTED, "Claims accepted by the chain"),
        (names::CLAIM_ERRORS, "Failed claim attempts"),
        (names::PROOFS_SUBMITTED, "Proofs accepted by the chain"),
        (names::PROOF_ERRORS, "Failed proof attempts"),
        (names::DEDUP_LOCAL_HITS, "Duplicates found in the local cache"),
        (names::DEDUP_SHARED_HITS, "Duplicates found in the shared set"),
        (names::DEDUP_MISSES, "Relays seen for the first time"),
        (names::DEDUP_MARKED, "Relay digests marked processed"),
        (names::DEDUP_ERRORS, "Deduplicator store failures"),
        (names::LEADER_ACQUISITIONS, "Leases acquired"),
        (names::LEADER_LOSSES, "Leases lost or released"),
        (names::LEADER_HEARTBEATS, "Lease renewals"),
        (names::WAL_APPENDS, "WAL entries appended"),
        (names::WAL_REPLAYS, "WAL entries read back for replay"),
        (names::WAL_CHECKPOINTS, "WAL checkpoints written"),
        (names::WAL_CORRUPT, "Corrupt WAL records skipped"),
        (names::TREE_FLUSHES, "Session trees flushed"),
        (names::TREE_ERRORS, "Session tree failures"),
        (names::RECOVERIES, "Sessions recovered"),
        (names::REGISTRY_UPDATES, "Tenant registry updates"),
    ];
    for (name, description) in counters {
        metrics::describe_counter!(exported_name(name), description);
    }

    let gauges = [
        (names::SESSIONS_BY_STATE, "Tracked sessions per state"),
        (names::CLAIM_SCHEDULED_HEIGHT, "Height a claim is scheduled for"),
        (names::PROOF_SCHEDULED_HEIGHT, "Height a proof is scheduled for"),
        (names::LEADER_STATUS, "1 while this instance holds the lease"),
        (names::WAL_SIZE, "Entries in a session WAL"),
        (names::TREES_ACTIVE, "Session trees held in memory"),
        (names::TENANTS_ACTIVE, "Tenants managed by this instance"),
    ];
    for (name, description) in gauges {
        metrics::describe_gauge!(exported_name(name), description);
    }

    metrics::describe_histogram!(
        exported_name(names::RECOVERY_LATENCY),
        metrics::Unit::Seconds,
        "Time to recover a tenant's sessions"
    );
    metrics::describe_histogram!(
        exported_name(names::SUBMISSION_BATCH_SIZE),
        "Messages per submitted batch"
    );
}

/// Prometheus exposition text.
pub fn render_metrics() -> String {
    match PROM_HANDLE.get() {
        Some(handle) => handle.render(),
        None => "# metrics not initialized".to_string(),
    }
}
