//! Leader fills and the position-delta events derived from them.

use serde::{Deserialize, Serialize};

use crate::ContractVersion;

// ---------------------------------------------------------------------------
// Fill
// ---------------------------------------------------------------------------

/// Taker direction of a single leader fill as reported by the leader venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FillSide {
    /// Bid / buy — contributes `+size` to the leader's net position.
    Buy,
    /// Ask / sell — contributes `-size`.
    Sell,
}

impl FillSide {
    /// Parse the leader venue's one-letter side code.
    ///
    /// Returns `None` for anything other than `"B"` / `"A"`; callers log and
    /// exclude such fills rather than guessing a direction.
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "B" => Some(FillSide::Buy),
            "A" => Some(FillSide::Sell),
            _ => None,
        }
    }

    pub fn sign(&self) -> f64 {
        match self {
            FillSide::Buy => 1.0,
            FillSide::Sell => -1.0,
        }
    }
}

/// A single atomic match reported by the leader venue.
///
/// Multiple fills sharing one `tx_hash` belong to one leader order and are
/// aggregated before any decision is taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    /// Transaction hash of the leader order. Shared across split fills.
    pub tx_hash: String,
    /// Per-transaction fill index, unique within `tx_hash`.
    pub tid: u64,
    /// Leader-venue coin (e.g. `"BTC"`). Mapped to an execution symbol later.
    pub coin: String,
    pub side: FillSide,
    /// Base-asset quantity of this fill. Always positive.
    pub size: f64,
    /// Leader's net position immediately *before* this fill, if reported.
    pub start_position: Option<f64>,
    /// Fill time in Unix milliseconds.
    pub time_ms: i64,
    /// Fill price, if reported. Used as the expected price for slippage checks.
    pub px: Option<f64>,
}

// ---------------------------------------------------------------------------
// EventKey
// ---------------------------------------------------------------------------

/// Composite ordering key for position-delta events.
///
/// The cursor is monotone non-decreasing under this key; field order here IS
/// the lexicographic precedence, so the derived `Ord` is the contract.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventKey {
    pub timestamp_ms: i64,
    pub event_index: u64,
    pub tx_hash: String,
    pub symbol: String,
}

impl EventKey {
    /// Stable single-string encoding for the cursor row and operator surface.
    pub fn encode(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.timestamp_ms, self.event_index, self.tx_hash, self.symbol
        )
    }

    /// Inverse of [`encode`][Self::encode]. Returns `None` on malformed input.
    pub fn decode(s: &str) -> Option<Self> {
        let mut parts = s.splitn(4, ':');
        let timestamp_ms = parts.next()?.parse().ok()?;
        let event_index = parts.next()?.parse().ok()?;
        let tx_hash = parts.next()?.to_string();
        let symbol = parts.next()?.to_string();
        Some(Self {
            timestamp_ms,
            event_index,
            tx_hash,
            symbol,
        })
    }
}

impl std::fmt::Display for EventKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.encode())
    }
}

// ---------------------------------------------------------------------------
// PositionDeltaEvent
// ---------------------------------------------------------------------------

/// What an aggregated fill group did to the leader's net position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionAction {
    /// |next| > |prev| with unchanged sign (or prev was flat).
    Increase,
    /// |next| < |prev| with unchanged sign.
    Decrease,
    /// Sign crossed zero; carries close and open components.
    Flip,
}

/// One net position change of the leader for one symbol, produced by ingest
/// aggregation and consumed exactly once by the decision engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionDeltaEvent {
    pub key: EventKey,
    /// Leader net position before the group.
    pub prev_net: f64,
    /// Leader net position after the group.
    pub next_net: f64,
    /// Signed sum of the group's fills.
    pub delta: f64,
    pub action: PositionAction,
    /// `|prev_net|` for FLIP events; `None` otherwise.
    pub close_component: Option<f64>,
    /// `|next_net|` for FLIP events; `None` otherwise.
    pub open_component: Option<f64>,
    /// `true` when produced from backfill rather than the live stream.
    pub is_replay: bool,
    /// Leader-side reference price for slippage checks, when known.
    pub expected_price: Option<f64>,
    pub contract: ContractVersion,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(ts: i64, idx: u64, tx: &str, sym: &str) -> EventKey {
        EventKey {
            timestamp_ms: ts,
            event_index: idx,
            tx_hash: tx.to_string(),
            symbol: sym.to_string(),
        }
    }

    #[test]
    fn side_codes() {
        assert_eq!(FillSide::from_code("B"), Some(FillSide::Buy));
        assert_eq!(FillSide::from_code("A"), Some(FillSide::Sell));
        assert_eq!(FillSide::from_code("X"), None);
        assert_eq!(FillSide::from_code(""), None);
    }

    #[test]
    fn event_key_ordering_is_lexicographic() {
        let a = key(1, 5, "0xzz", "ZZZ");
        let b = key(2, 0, "0xaa", "AAA");
        assert!(a < b, "timestamp dominates");

        let c = key(2, 0, "0xaa", "AAA");
        let d = key(2, 1, "0xaa", "AAA");
        assert!(c < d, "event_index breaks timestamp ties");

        let e = key(2, 1, "0xaa", "BBB");
        assert!(d < e, "symbol is the last tiebreak");
    }

    #[test]
    fn event_key_encode_decode_round_trip() {
        let k = key(1_700_000_000_123, 4, "0xabc", "BTCUSDT");
        assert_eq!(EventKey::decode(&k.encode()), Some(k));
    }

    #[test]
    fn event_key_decode_rejects_garbage() {
        assert_eq!(EventKey::decode(""), None);
        assert_eq!(EventKey::decode("notanumber:0:0xabc:BTC"), None);
        assert_eq!(EventKey::decode("1:2"), None);
    }
}
