//! Safety mode management and position reconciliation.
//!
//! All logic in this crate is pure and deterministic — no IO, no clock, no
//! randomness. The runtime feeds in snapshots and timestamps and persists
//! whatever transition comes back; the store guarantees the audit row lands
//! before the mode changes.

mod controller;
mod reconcile;

pub use controller::{ExecutionHealth, SafetyController, Transition};
pub use reconcile::{
    evaluate, ReconcileConfig, ReconcileOutcome, ReconcileReport, VenuePositions,
};
