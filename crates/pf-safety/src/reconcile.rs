//! Deterministic reconciliation between derived local positions and venue
//! positions.
//!
//! # Invariants
//!
//! - **Union comparison**: every symbol present on either side is examined.
//! - **Zero-filter**: a side holding an (effectively) zero quantity does not
//!   count as "present" — flat books never read as one-sided.
//! - **Stable output**: drifts and missing-symbol sets are ordered, so equal
//!   inputs produce byte-equal reports.
//! - **Stale beats content**: a stale snapshot is never content-compared; it
//!   could mask real drift by presenting outdated venue state.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use pf_schemas::Baseline;

/// Quantities below this are treated as flat.
const ZERO_EPS: f64 = 1e-9;

/// Venue position snapshot plus the time it was captured.
#[derive(Debug, Clone, PartialEq)]
pub struct VenuePositions {
    pub positions: BTreeMap<String, f64>,
    pub fetched_at_ms: i64,
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Per-symbol drift that logs a warning.
    pub warn_threshold: f64,
    /// Per-symbol drift that halts.
    pub critical_threshold: f64,
    pub snapshot_max_stale_ms: i64,
}

/// What the decision table concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconcileOutcome {
    Clean,
    /// Drift at or above warn but below critical. Mode keeps.
    Warn,
    /// Snapshot older than the staleness bound — content not compared.
    SnapshotStale,
    /// One-sided symbol or drift at/above critical.
    Critical,
}

/// Full evaluation evidence, serialized into audit metadata on transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub outcome: ReconcileOutcome,
    pub max_drift: f64,
    /// Per-symbol |local − venue| for symbols present on both sides.
    pub drifts: BTreeMap<String, f64>,
    /// Symbols with local exposure the venue does not show.
    pub missing_on_venue: Vec<String>,
    /// Symbols with venue exposure we cannot account for locally.
    pub missing_locally: Vec<String>,
    pub snapshot_age_ms: i64,
}

impl ReconcileReport {
    pub fn is_critical(&self) -> bool {
        self.outcome == ReconcileOutcome::Critical
    }

    /// Human-readable summary for reason messages.
    pub fn summary(&self) -> String {
        match self.outcome {
            ReconcileOutcome::Clean => "reconcile clean".to_string(),
            ReconcileOutcome::Warn => format!("reconcile drift warning: max_drift={}", self.max_drift),
            ReconcileOutcome::SnapshotStale => {
                format!("venue snapshot stale: age_ms={}", self.snapshot_age_ms)
            }
            ReconcileOutcome::Critical => {
                if !self.missing_on_venue.is_empty() || !self.missing_locally.is_empty() {
                    format!(
                        "reconcile critical: missing_on_venue={:?} missing_locally={:?}",
                        self.missing_on_venue, self.missing_locally
                    )
                } else {
                    format!("reconcile critical: max_drift={}", self.max_drift)
                }
            }
        }
    }
}

/// Evaluate one reconciliation pass.
///
/// The active baseline's per-symbol qty is added to the local side so
/// operator-approved external positions do not read as drift.
pub fn evaluate(
    local: &BTreeMap<String, f64>,
    venue: &VenuePositions,
    baselines: &[Baseline],
    now_ms: i64,
    cfg: &ReconcileConfig,
) -> ReconcileReport {
    let snapshot_age_ms = now_ms.saturating_sub(venue.fetched_at_ms);
    if snapshot_age_ms > cfg.snapshot_max_stale_ms {
        return ReconcileReport {
            outcome: ReconcileOutcome::SnapshotStale,
            max_drift: 0.0,
            drifts: BTreeMap::new(),
            missing_on_venue: Vec::new(),
            missing_locally: Vec::new(),
            snapshot_age_ms,
        };
    }

    let mut adjusted_local = local.clone();
    for b in baselines {
        if b.active {
            *adjusted_local.entry(b.symbol.clone()).or_insert(0.0) += b.qty;
        }
    }

    let mut symbols: Vec<&String> = adjusted_local.keys().chain(venue.positions.keys()).collect();
    symbols.sort();
    symbols.dedup();

    let mut drifts = BTreeMap::new();
    let mut missing_on_venue = Vec::new();
    let mut missing_locally = Vec::new();
    let mut max_drift: f64 = 0.0;

    for sym in symbols {
        let lq = adjusted_local.get(sym).copied().unwrap_or(0.0);
        let vq = venue.positions.get(sym).copied().unwrap_or(0.0);
        let local_present = lq.abs() > ZERO_EPS;
        let venue_present = vq.abs() > ZERO_EPS;

        match (local_present, venue_present) {
            (true, false) => missing_on_venue.push(sym.clone()),
            (false, true) => missing_locally.push(sym.clone()),
            (false, false) => {}
            (true, true) => {
                let drift = (lq - vq).abs();
                max_drift = max_drift.max(drift);
                drifts.insert(sym.clone(), drift);
            }
        }
    }

    let outcome = if !missing_on_venue.is_empty() || !missing_locally.is_empty() {
        ReconcileOutcome::Critical
    } else if max_drift >= cfg.critical_threshold {
        ReconcileOutcome::Critical
    } else if max_drift >= cfg.warn_threshold {
        ReconcileOutcome::Warn
    } else {
        ReconcileOutcome::Clean
    };

    ReconcileReport {
        outcome,
        max_drift,
        drifts,
        missing_on_venue,
        missing_locally,
        snapshot_age_ms,
    }
}
