//! Execution-venue boundary.
//!
//! The trait is the contract; this crate ships no HTTP client. The paper
//! venue next door implements it deterministically for dry-run and tests,
//! and a live adapter plugs in behind the same seam.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use pf_schemas::{OrderStatus, OrderType, PricePoint, Side, SymbolFilters, TimeInForce};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Venue error taxonomy. The executor maps these to result states:
/// rate limits suspend submit + poll, timeouts become UNKNOWN and count
/// against the retry budget, API rejections are permanent.
#[derive(Debug)]
pub enum VenueError {
    /// HTTP 429 or equivalent. Shared cooldown across submit and poll.
    RateLimited { retry_after_ms: Option<u64> },
    /// Network timeout: the request MAY have been applied.
    Timeout,
    /// Transport-level failure before the request left.
    Transport(String),
    /// Application-level error with the venue's code.
    Api { code: Option<i64>, message: String },
}

impl fmt::Display for VenueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VenueError::RateLimited { retry_after_ms } => {
                write!(f, "rate limited (retry_after_ms={retry_after_ms:?})")
            }
            VenueError::Timeout => write!(f, "venue request timed out"),
            VenueError::Transport(msg) => write!(f, "transport error: {msg}"),
            VenueError::Api {
                code: Some(c),
                message,
            } => write!(f, "venue api error code={c}: {message}"),
            VenueError::Api {
                code: None,
                message,
            } => write!(f, "venue api error: {message}"),
        }
    }
}

impl std::error::Error for VenueError {}

// ---------------------------------------------------------------------------
// Requests / responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct SubmitRequest {
    /// Normalized correlation id; the venue's duplicate check on this id is
    /// the idempotency backstop.
    pub client_id: String,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub qty: f64,
    pub price: Option<f64>,
    pub tif: TimeInForce,
    pub reduce_only: bool,
}

/// Submit outcomes the executor distinguishes.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Submitted { exchange_order_id: String },
    /// The client id already exists: not an error — query and adopt.
    DuplicateClientId,
    /// Permanent rejection (insufficient balance, filter violation, ...).
    Rejected { code: String, message: String },
}

/// The venue's view of one order.
#[derive(Debug, Clone, PartialEq)]
pub struct VenueOrder {
    pub exchange_order_id: Option<String>,
    pub status: OrderStatus,
    pub filled_qty: f64,
    pub avg_price: Option<f64>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Ok,
    NotFound,
}

/// Position snapshot with its capture timestamp (for the staleness check).
#[derive(Debug, Clone, PartialEq)]
pub struct PositionsSnapshot {
    pub positions: BTreeMap<String, f64>,
    pub fetched_at_ms: i64,
}

// ---------------------------------------------------------------------------
// Adapter trait
// ---------------------------------------------------------------------------

/// Everything the core needs from the execution venue.
#[async_trait]
pub trait VenueAdapter: Send + Sync {
    async fn submit_order(&self, req: SubmitRequest) -> Result<SubmitOutcome, VenueError>;

    /// Query by client id. `None` = the venue has never seen this id.
    async fn query_order(&self, client_id: &str) -> Result<Option<VenueOrder>, VenueError>;

    async fn cancel_order(&self, client_id: &str) -> Result<CancelOutcome, VenueError>;

    async fn fetch_positions(&self, symbols: &[String]) -> Result<PositionsSnapshot, VenueError>;

    async fn fetch_mark_price(&self, symbol: &str) -> Result<PricePoint, VenueError>;

    async fn fetch_filters(&self, symbol: &str) -> Result<SymbolFilters, VenueError>;

    /// Venue clock, used to maintain the signing time offset.
    async fn server_time(&self) -> Result<i64, VenueError>;
}
