//! Deterministic decision engine: one position-delta event in, zero or more
//! order intents out, under the strict gate order described in [`pipeline`].

mod pipeline;
mod providers;
mod sizing;

pub use pipeline::{
    decide, DecisionContext, DecisionOutcome, DecisionSettings, RejectReason, Rejection,
};
pub use providers::{
    FiltersProvider, LocalPositionProvider, PricePoint, ReferencePriceProvider, SymbolFilters,
};
pub use sizing::{close_ratio, size_open, SizingFailure};
