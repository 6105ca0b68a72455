//! Capability boundaries consumed by the decision pipeline.
//!
//! Each seam is a small single-method trait so tests and the runtime can
//! inject readings without dragging venue clients into this crate. The
//! pipeline itself never performs IO: callers snapshot whatever these
//! providers return and the decision is a pure function of those readings.

pub use pf_schemas::{PricePoint, SymbolFilters};

/// Mark/reference price source (execution venue side).
pub trait ReferencePriceProvider {
    fn mark_price(&self, symbol: &str) -> Option<PricePoint>;
}

/// Venue filter source. `None` means the symbol's filters are unknown, which
/// rejects the intent — guessing a step size trades the wrong quantity.
pub trait FiltersProvider {
    fn filters(&self, symbol: &str) -> Option<SymbolFilters>;
}

/// Derived local signed position, used to cap reduce-only quantities.
pub trait LocalPositionProvider {
    fn position(&self, symbol: &str) -> f64;
}

// ---------------------------------------------------------------------------
// Map-backed implementations for tests and the runtime snapshot path
// ---------------------------------------------------------------------------

use std::collections::BTreeMap;

impl ReferencePriceProvider for BTreeMap<String, PricePoint> {
    fn mark_price(&self, symbol: &str) -> Option<PricePoint> {
        self.get(symbol).copied()
    }
}

impl FiltersProvider for BTreeMap<String, SymbolFilters> {
    fn filters(&self, symbol: &str) -> Option<SymbolFilters> {
        self.get(symbol).copied()
    }
}

impl LocalPositionProvider for BTreeMap<String, f64> {
    fn position(&self, symbol: &str) -> f64 {
        self.get(symbol).copied().unwrap_or(0.0)
    }
}
