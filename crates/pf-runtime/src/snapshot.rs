//! Provider snapshots: the decision pipeline is pure, so the runtime
//! captures venue readings once per ingest tick and hands the frozen maps to
//! `decide`. Filters are cached with a TTL — they change on venue
//! maintenance windows, not per order.

use std::collections::BTreeMap;

use pf_decision::{
    decide, DecisionContext, DecisionSettings, FiltersProvider, LocalPositionProvider,
    ReferencePriceProvider,
};
use pf_ingest::DecisionSink;
use pf_schemas::{OrderIntent, PositionDeltaEvent, PricePoint, SafetyMode, SymbolFilters};

/// Frozen provider readings for one decision batch.
#[derive(Debug, Clone, Default)]
pub struct ProviderSnapshot {
    pub marks: BTreeMap<String, PricePoint>,
    pub filters: BTreeMap<String, SymbolFilters>,
    pub positions: BTreeMap<String, f64>,
}

impl ReferencePriceProvider for ProviderSnapshot {
    fn mark_price(&self, symbol: &str) -> Option<PricePoint> {
        self.marks.get(symbol).copied()
    }
}

impl FiltersProvider for ProviderSnapshot {
    fn filters(&self, symbol: &str) -> Option<SymbolFilters> {
        self.filters.get(symbol).copied()
    }
}

impl LocalPositionProvider for ProviderSnapshot {
    fn position(&self, symbol: &str) -> f64 {
        self.positions.get(symbol).copied().unwrap_or(0.0)
    }
}

/// Bridges the ingest engine to the decision pipeline for one batch.
///
/// Rejections are collected for audit after the batch commits; intents are
/// returned to the engine so they persist atomically with their event.
pub struct BatchSink {
    pub settings: DecisionSettings,
    pub snapshot: ProviderSnapshot,
    pub safety_mode: SafetyMode,
    pub now_ms: i64,
    pub rejections: Vec<(PositionDeltaEvent, pf_decision::Rejection)>,
}

impl BatchSink {
    pub fn new(
        settings: DecisionSettings,
        snapshot: ProviderSnapshot,
        safety_mode: SafetyMode,
        now_ms: i64,
    ) -> Self {
        Self {
            settings,
            snapshot,
            safety_mode,
            now_ms,
            rejections: Vec::new(),
        }
    }
}

impl DecisionSink for BatchSink {
    fn decide(&mut self, event: &PositionDeltaEvent) -> Vec<OrderIntent> {
        let ctx = DecisionContext {
            now_ms: self.now_ms,
            safety_mode: self.safety_mode,
            settings: &self.settings,
            prices: &self.snapshot,
            filters: &self.snapshot,
            positions: &self.snapshot,
        };
        let outcome = decide(event, &ctx);
        for rejection in outcome.rejections {
            tracing::info!(
                key = %event.key,
                reason = rejection.reason.as_str(),
                detail = %rejection.detail,
                "decision rejection"
            );
            self.rejections.push((event.clone(), rejection));
        }
        outcome.intents
    }
}
