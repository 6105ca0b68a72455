//! Cursor, dedup, audit, baseline, and run-mode types backed by the store.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::EventKey;
use crate::safety::ReasonCode;

// ---------------------------------------------------------------------------
// Cursor
// ---------------------------------------------------------------------------

/// Ingest progress singleton.
///
/// Two clocks, deliberately separate: `last_ingest_success_ms` tracks
/// *liveness* (any successful source response, even empty) while
/// `last_processed_timestamp_ms` tracks *progress* (an event was persisted).
/// A quiet leader advances the first but not the second.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub last_processed_timestamp_ms: i64,
    pub last_processed_event_key: Option<EventKey>,
    pub last_ingest_success_ms: i64,
}

impl Cursor {
    pub fn empty() -> Self {
        Self {
            last_processed_timestamp_ms: 0,
            last_processed_event_key: None,
            last_ingest_success_ms: 0,
        }
    }

    /// Advance to a newly persisted event. The composite key must be
    /// non-decreasing; callers enforce ordering before persisting.
    pub fn advanced_to(&self, key: &EventKey, now_ms: i64) -> Self {
        Self {
            last_processed_timestamp_ms: key.timestamp_ms,
            last_processed_event_key: Some(key.clone()),
            last_ingest_success_ms: now_ms,
        }
    }
}

// ---------------------------------------------------------------------------
// Dedup
// ---------------------------------------------------------------------------

/// Primary key of the dedup table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DedupKey {
    pub tx_hash: String,
    pub event_index: u64,
    pub symbol: String,
}

/// One processed-event marker, inserted atomically with the cursor advance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupRecord {
    pub key: DedupKey,
    pub timestamp_ms: i64,
    pub is_replay: bool,
    pub created_at_ms: i64,
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

/// Append-only audit row. Every externally visible state change writes one
/// of these before the change itself commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub category: String,
    pub entity_id: String,
    pub from_state: String,
    pub to_state: String,
    pub reason_code: ReasonCode,
    pub reason_message: String,
    pub timestamp_ms: i64,
    pub metadata: Value,
}

impl AuditRecord {
    pub fn new(
        category: impl Into<String>,
        entity_id: impl Into<String>,
        from_state: impl Into<String>,
        to_state: impl Into<String>,
        reason_code: ReasonCode,
        reason_message: impl Into<String>,
        timestamp_ms: i64,
    ) -> Self {
        Self {
            category: category.into(),
            entity_id: entity_id.into(),
            from_state: from_state.into(),
            to_state: to_state.into(),
            reason_code,
            reason_message: reason_message.into(),
            timestamp_ms,
            metadata: Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

// ---------------------------------------------------------------------------
// Baseline
// ---------------------------------------------------------------------------

/// Operator-installed reference position used during reconciliation.
///
/// The active baseline's per-symbol qty is added to the derived local qty so
/// approved manual/external positions do not read as drift.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub baseline_id: String,
    pub symbol: String,
    pub qty: f64,
    pub active: bool,
}

// ---------------------------------------------------------------------------
// RunMode
// ---------------------------------------------------------------------------

/// Operator-selected process mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    /// Real venue writes.
    Live,
    /// No outbound order writes; all other paths active.
    DryRun,
    /// Cursor advances without placing orders.
    BackfillOnly,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Live => "live",
            RunMode::DryRun => "dry-run",
            RunMode::BackfillOnly => "backfill-only",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "live" => Some(RunMode::Live),
            "dry-run" => Some(RunMode::DryRun),
            "backfill-only" => Some(RunMode::BackfillOnly),
            _ => None,
        }
    }

    /// `true` when order writes actually leave the process.
    pub fn writes_to_venue(&self) -> bool {
        matches!(self, RunMode::Live)
    }

    /// `true` when the decision/execution path runs at all.
    pub fn places_orders(&self) -> bool {
        !matches!(self, RunMode::BackfillOnly)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_advance_tracks_both_clocks() {
        let key = EventKey {
            timestamp_ms: 1000,
            event_index: 1,
            tx_hash: "0xabc".to_string(),
            symbol: "BTCUSDT".to_string(),
        };
        let c = Cursor::empty().advanced_to(&key, 2000);
        assert_eq!(c.last_processed_timestamp_ms, 1000);
        assert_eq!(c.last_ingest_success_ms, 2000);
        assert_eq!(c.last_processed_event_key, Some(key));
    }

    #[test]
    fn run_mode_round_trip() {
        for m in [RunMode::Live, RunMode::DryRun, RunMode::BackfillOnly] {
            assert_eq!(RunMode::parse(m.as_str()), Some(m));
        }
        assert_eq!(RunMode::parse("paper"), None);
    }

    #[test]
    fn mode_capabilities() {
        assert!(RunMode::Live.writes_to_venue());
        assert!(!RunMode::DryRun.writes_to_venue());
        assert!(RunMode::DryRun.places_orders());
        assert!(!RunMode::BackfillOnly.places_orders());
    }
}
