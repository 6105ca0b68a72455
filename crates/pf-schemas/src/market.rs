//! Market reference values shared by the decision and execution boundaries.

use serde::{Deserialize, Serialize};

/// A price reading with its capture time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub price: f64,
    pub timestamp_ms: i64,
}

/// Per-symbol venue trading filters.
///
/// Consumers check exact multiples against these; nothing in the pipeline
/// rounds toward them. A step or tick of 0 disables that check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SymbolFilters {
    pub min_qty: f64,
    pub step_size: f64,
    pub min_notional: f64,
    pub tick_size: f64,
}
