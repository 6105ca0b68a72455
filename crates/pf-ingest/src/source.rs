//! Leader-source boundary.
//!
//! This module defines only the source trait and its error taxonomy. No
//! transport code, no aggregation, no cursor logic belongs here; concrete
//! adapters live next door and the engine consumes the trait.

use std::fmt;

use futures_util::stream::BoxStream;
use pf_schemas::Fill;

/// Errors a [`LeaderSource`] implementation may return.
#[derive(Debug)]
pub enum SourceError {
    /// Network or transport failure (retryable).
    Transport(String),
    /// The upstream API returned an application-level error.
    Api { code: Option<i64>, message: String },
    /// A response payload could not be decoded.
    Decode(String),
    /// A required configuration value (e.g. wallet address) is missing.
    Config(String),
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::Transport(msg) => write!(f, "transport error: {msg}"),
            SourceError::Api {
                code: Some(c),
                message,
            } => write!(f, "leader api error code={c}: {message}"),
            SourceError::Api {
                code: None,
                message,
            } => write!(f, "leader api error: {message}"),
            SourceError::Decode(msg) => write!(f, "decode error: {msg}"),
            SourceError::Config(msg) => write!(f, "config error: {msg}"),
        }
    }
}

impl std::error::Error for SourceError {}

impl SourceError {
    /// `true` for failures worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::Transport(_) | SourceError::Api { .. })
    }
}

/// Live stream of fills; errors terminate the stream and the caller
/// reconnects with backoff.
pub type FillStream = BoxStream<'static, Result<Fill, SourceError>>;

/// Upstream leader-venue contract: pull-based backfill plus a push stream.
///
/// Implementations must be `Send + Sync` and object-safe so the engine can
/// hold a `Box<dyn LeaderSource>`.
#[async_trait::async_trait]
pub trait LeaderSource: Send + Sync {
    /// Human-readable name identifying this source (e.g. `"hyperliquid"`).
    fn name(&self) -> &'static str;

    /// Fetch the leader's fills in the half-open window `[since_ms, until_ms)`.
    ///
    /// Returns fills in upstream order; the aggregation layer sorts and
    /// deduplicates.
    async fn fetch_fills(&self, since_ms: i64, until_ms: i64) -> Result<Vec<Fill>, SourceError>;

    /// Open the live fill subscription.
    async fn subscribe(&self) -> Result<FillStream, SourceError>;
}
