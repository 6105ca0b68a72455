//! Leader-fill ingestion: source boundary, fill aggregation, and the
//! cursor/backfill/gap discipline that keeps event delivery ordered and
//! exactly-once.

mod aggregate;
mod engine;
mod hyperliquid;
mod source;

pub use aggregate::{aggregate_fills, Aggregation};
pub use engine::{
    run_fill_stream, DecisionSink, GapStatus, IngestEngine, IngestSettings, ProcessedBatch,
    ProcessedEvent,
};
pub use hyperliquid::HyperliquidSource;
pub use source::{FillStream, LeaderSource, SourceError};
