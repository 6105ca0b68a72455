//! Shared domain types for the pilotfish copy-trading core.
//!
//! This crate is a plain data-model crate: serde DTOs, deterministic id
//! derivation, and the contract-version guard. No IO, no clock, no logic
//! that belongs to a pipeline stage.

pub mod event;
pub mod ids;
pub mod market;
pub mod order;
pub mod safety;
pub mod state;

pub use event::{EventKey, Fill, FillSide, PositionAction, PositionDeltaEvent};
pub use ids::{correlation_id, normalize_symbol, venue_client_id, IntentRole, VENUE_CLIENT_ID_MAX};
pub use market::{PricePoint, SymbolFilters};
pub use order::{
    OrderIntent, OrderResult, OrderStatus, OrderType, Side, TimeInForce,
};
pub use safety::{ReasonCode, SafetyMode, SafetyState};
pub use state::{AuditRecord, Baseline, Cursor, DedupKey, DedupRecord, RunMode};

// ---------------------------------------------------------------------------
// Contract version
// ---------------------------------------------------------------------------

/// Version of the event/intent/result wire contract carried by every
/// [`PositionDeltaEvent`] and [`OrderResult`].
///
/// Compatibility rule: a consumer rejects input whose major differs from its
/// own, or whose minor exceeds its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ContractVersion {
    pub major: u16,
    pub minor: u16,
}

/// The contract version this build speaks.
pub const CONTRACT_VERSION: ContractVersion = ContractVersion { major: 1, minor: 0 };

impl ContractVersion {
    /// `true` if this consumer may process input stamped with `input`.
    pub fn accepts(&self, input: ContractVersion) -> bool {
        input.major == self.major && input.minor <= self.minor
    }
}

impl std::fmt::Display for ContractVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}
