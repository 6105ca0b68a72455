//! Order intents and results.

use serde::{Deserialize, Serialize};

use crate::ContractVersion;

// ---------------------------------------------------------------------------
// Sides / types / TIF
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn sign(&self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }

    /// The side that reduces a signed position of the given sign.
    pub fn reducing(position: f64) -> Self {
        if position > 0.0 {
            Side::Sell
        } else {
            Side::Buy
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Limit,
    Market,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeInForce {
    Gtc,
    Ioc,
}

// ---------------------------------------------------------------------------
// OrderIntent
// ---------------------------------------------------------------------------

/// What the decision engine wants executed.
///
/// Immutable once stored: the store inserts by `correlation_id` with
/// insert-or-ignore semantics and never updates the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub correlation_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    /// Base-asset quantity. Always > 0; direction lives in `side`.
    pub qty: f64,
    /// Limit price; `None` for market orders.
    pub price: Option<f64>,
    pub reduce_only: bool,
    pub tif: TimeInForce,
    pub is_replay: bool,
    pub strategy_version: String,
    /// Accumulated risk notes (e.g. price-fallback usage) for the audit trail.
    pub risk_notes: Vec<String>,
}

// ---------------------------------------------------------------------------
// OrderStatus / OrderResult
// ---------------------------------------------------------------------------

/// Lifecycle states of an order on the execution venue.
///
/// ```text
/// PENDING → SUBMITTED → PARTIALLY_FILLED → FILLED
///                                       → CANCELED
///                                       → EXPIRED
///                                       → REJECTED
///                     → UNKNOWN
/// ```
///
/// `Unknown` is transient: it resolves to a terminal state or exhausts its
/// retry budget. The transition table itself lives in the execution crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Submitted,
    PartiallyFilled,
    Filled,
    Canceled,
    Expired,
    Rejected,
    Unknown,
}

impl OrderStatus {
    /// `true` if no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Expired | OrderStatus::Rejected
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Submitted => "SUBMITTED",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Canceled => "CANCELED",
            OrderStatus::Expired => "EXPIRED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(OrderStatus::Pending),
            "SUBMITTED" => Some(OrderStatus::Submitted),
            "PARTIALLY_FILLED" => Some(OrderStatus::PartiallyFilled),
            "FILLED" => Some(OrderStatus::Filled),
            "CANCELED" => Some(OrderStatus::Canceled),
            "EXPIRED" => Some(OrderStatus::Expired),
            "REJECTED" => Some(OrderStatus::Rejected),
            "UNKNOWN" => Some(OrderStatus::Unknown),
            _ => None,
        }
    }
}

/// Mutable execution outcome for one intent, updated by the execution FSM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub correlation_id: String,
    pub exchange_order_id: Option<String>,
    pub status: OrderStatus,
    pub filled_qty: f64,
    /// Volume-weighted average fill price across the original order and any
    /// market-fallback remainder.
    pub avg_price: Option<f64>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub contract: ContractVersion,
    pub updated_at_ms: i64,
}

impl OrderResult {
    /// A fresh PENDING result for a newly accepted intent.
    pub fn pending(correlation_id: impl Into<String>, now_ms: i64) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            exchange_order_id: None,
            status: OrderStatus::Pending,
            filled_qty: 0.0,
            avg_price: None,
            error_code: None,
            error_message: None,
            contract: crate::CONTRACT_VERSION,
            updated_at_ms: now_ms,
        }
    }
}
