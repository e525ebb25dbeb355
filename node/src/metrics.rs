// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Metrics sink.
//!
//! Components never touch a global recorder directly; they are handed an
//! `Arc<dyn MetricsSink>` at construction. Production wiring uses
//! [`PrometheusSink`], tests use [`InMemoryMetrics`] to assert on counts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use metrics::{Key, Label};

pub type Labels<'a> = &'a [(&'static str, &'a str)];

pub trait MetricsSink: Send + Sync {
    fn increment_counter(&self, name: &'static str, value: u64, labels: Labels<'_>);
    fn set_gauge(&self, name: &'static str, value: f64, labels: Labels<'_>);
    fn record_histogram(&self, name: &'static str, value: f64, labels: Labels<'_>);
}

pub type SharedMetrics = Arc<dyn MetricsSink>;

/// Metric names. Label dimensions are listed next to each.
pub mod names {
    // relays {tenant, service_id} / {tenant, reason}
    pub const RELAYS_PROCESSED: &str = "relays_processed_total";
    pub const RELAYS_DEDUPLICATED: &str = "relays_deduplicated_total";
    pub const RELAYS_REJECTED: &str = "relays_rejected_total";

    // sessions
    pub const SESSIONS_BY_STATE: &str = "sessions_by_state";
    pub const SESSION_TRANSITIONS: &str = "session_state_transitions_total";
    pub const SESSIONS_CREATED: &str = "sessions_created_total";
    pub const SESSIONS_SETTLED: &str = "sessions_settled_total";
    pub const SESSIONS_FAILED: &str = "sessions_failed_total";
    pub const SESSIONS_SKIPPED_AT_STARTUP: &str = "session_snapshots_skipped_at_startup_total";
    pub const SESSION_STORE_ERRORS: &str = "session_store_errors_total";
    pub const TRANSITIONS_DEFERRED: &str = "session_transitions_deferred_total";

    // claims / proofs {tenant} / {tenant, reason} / {tenant, session_id}
    pub const CLAIMS_SUBMITTED: &str = "claims_submitted_total";
    pub const CLAIM_ERRORS: &str = "claim_errors_total";
    pub const CLAIM_SCHEDULED_HEIGHT: &str = "claim_scheduled_height";
    pub const PROOFS_SUBMITTED: &str = "proofs_submitted_total";
    pub const PROOF_ERRORS: &str = "proof_errors_total";
    pub const PROOF_SCHEDULED_HEIGHT: &str = "proof_scheduled_height";
    pub const SUBMISSION_BATCH_SIZE: &str = "submission_batch_size";

    // dedup {session_id} / {session_id, operation}
    pub const DEDUP_LOCAL_HITS: &str = "dedup_local_hits_total";
    pub const DEDUP_SHARED_HITS: &str = "dedup_shared_hits_total";
    pub const DEDUP_MISSES: &str = "dedup_misses_total";
    pub const DEDUP_MARKED: &str = "dedup_marked_total";
    pub const DEDUP_ERRORS: &str = "dedup_errors_total";

    // leader {tenant, instance} / {tenant}
    pub const LEADER_STATUS: &str = "leader_status";
    pub const LEADER_ACQUISITIONS: &str = "leader_acquisitions_total";
    pub const LEADER_LOSSES: &str = "leader_losses_total";
    pub const LEADER_HEARTBEATS: &str = "leader_heartbeats_total";

    // wal {tenant, session_id}
    pub const WAL_APPENDS: &str = "wal_appends_total";
    pub const WAL_REPLAYS: &str = "wal_replays_total";
    pub const WAL_CHECKPOINTS: &str = "wal_checkpoints_total";
    pub const WAL_SIZE: &str = "wal_size_entries";
    pub const WAL_CORRUPT: &str = "wal_corrupt_entries_total";

    // accumulator / recovery {tenant}
    pub const TREES_ACTIVE: &str = "session_trees_active";
    pub const TREE_FLUSHES: &str = "session_tree_flushes_total";
    pub const TREE_ERRORS: &str = "session_tree_errors_total";
    pub const RECOVERIES: &str = "session_recoveries_total";
    pub const RECOVERY_LATENCY: &str = "session_recovery_latency_seconds";

    // tenants
    pub const TENANTS_ACTIVE: &str = "tenants_active";
    pub const REGISTRY_UPDATES: &str = "tenant_registry_updates_total";
}

const PREFIX: &str = "relaymint_";

/// Exported name of a metric.
pub fn exported_name(name: &str) -> String {
    format!("{PREFIX}{name}")
}

fn key(name: &'static str, labels: Labels<'_>) -> Key {
    let labels: Vec<Label> = labels
        .iter()
        .map(|(k, v)| Label::new(*k, v.to_string()))
        .collect();
    Key::from_parts(exported_name(name), labels)
}

/// Forwards to whatever recorder is installed for the `metrics` facade
/// (see [`crate::telemetry::init_telemetry`]).
#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusSink;

impl MetricsSink for PrometheusSink {
    fn increment_counter(&self, name: &'static str, value: u64, labels: Labels<'_>) {
        metrics::recorder()
            .register_counter(&key(name, labels))
            .increment(value);
    }

    fn set_gauge(&self, name: &'static str, value: f64, labels: Labels<'_>) {
        metrics::recorder().register_gauge(&key(name, labels)).set(value);
    }

    fn record_histogram(&self, name: &'static str, value: f64, labels: Labels<'_>) {
        metrics::recorder()
            .register_histogram(&key(name, labels))
            .record(value);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment_counter(&self, _: &'static str, _: u64, _: Labels<'_>) {}
    fn set_gauge(&self, _: &'static str, _: f64, _: Labels<'_>) {}
    fn record_histogram(&self, _: &'static str, _: f64, _: Labels<'_>) {}
}

pub fn noop() -> SharedMetrics {
    Arc::new(NoopMetrics)
}

/// Records everything in memory, keyed by `name{k=v,...}` with labels sorted.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: Mutex<HashMap<String, u64>>,
    gauges: Mutex<HashMap<String, f64>>,
    histograms: Mutex<HashMap<String, Vec<f64>>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn render_key(name: &str, labels: Labels<'_>) -> String {
        let mut pairs: Vec<String> = labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
        pairs.sort();
        format!("{name}{{{}}}", pairs.join(","))
    }

    pub fn counter(&self, name: &str, labels: Labels<'_>) -> u64 {
        let key = Self::render_key(name, labels);
        self.counters
            .lock()
            .map(|c| c.get(&key).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Sum of a counter across every label combination.
    pub fn counter_total(&self, name: &str) -> u64 {
        let prefix = format!("{name}{{");
        self.counters
            .lock()
            .map(|c| {
                c.iter()
                    .filter(|(k, _)| k.starts_with(&prefix))
                    .map(|(_, v)| *v)
                    .sum()
            })
            .unwrap_or(0)
    }

    pub fn gauge(&self, name: &str, labels: Labels<'_>) -> Option<f64> {
        let key = Self::render_key(name, labels);
        self.gauges.lock().ok().and_then(|g| g.get(&key).copied())
    }

    pub fn histogram_samples(&self, name: &str, labels: Labels<'_>) -> Vec<f64> {
        let key = Self::render_key(name, labels);
        self.histograms
            .lock()
            .ok()
            .and_then(|h| h.get(&key).cloned())
            .unwrap_or_default()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment_counter(&self, name: &'static str, value: u64, labels: Labels<'_>) {
        if let Ok(mut counters) = self.counters.lock() {
            *counters.entry(Self::render_key(name, labels)).or_insert(0) += value;
        }
    }

    fn set_gauge(&self, name: &'static str, value: f64, labels: Labels<'_>) {
        if let Ok(mut gauges) = self.gauges.lock() {
            gauges.insert(Self::render_key(name, labels), value);
        }
    }

    fn record_histogram(&self, name: &'static str, value: f64, labels: Labels<'_>) {
        if let Ok(mut histograms) = self.histograms.lock() {
            histograms
                .entry(Self::render_key(name, labels))
                .or_default()
                .push(value);
        }
    }
}
