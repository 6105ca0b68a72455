//! Sizing: map a leader-side component to a local base-asset quantity.

use pf_config::{SizingConfig, SizingMode};

/// Why sizing could not produce a quantity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SizingFailure {
    /// The mode needs a reference price and none was available.
    NeedsPrice,
    /// Kelly produced a non-positive fraction (no edge at these parameters).
    NoEdge,
}

/// Size an exposure-opening component.
///
/// `leader_qty` is the leader's base quantity for this component;
/// `reference_price` is the venue mark (or accepted fallback), if any.
pub fn size_open(
    cfg: &SizingConfig,
    leader_qty: f64,
    reference_price: Option<f64>,
) -> Result<f64, SizingFailure> {
    match cfg.mode {
        SizingMode::Proportional => Ok(leader_qty * cfg.ratio),
        SizingMode::FixedNotional => {
            let price = reference_price.ok_or(SizingFailure::NeedsPrice)?;
            Ok(cfg.fixed_notional_usd / price)
        }
        SizingMode::Kelly => {
            let k = cfg.kelly.as_ref().expect("validated: kelly section present");
            let price = reference_price.ok_or(SizingFailure::NeedsPrice)?;
            let b = k.payoff_ratio;
            let fraction = (k.win_prob * (b + 1.0) - 1.0) / b;
            if fraction <= 0.0 {
                return Err(SizingFailure::NoEdge);
            }
            let applied = fraction.min(k.fraction_cap);
            Ok(applied * k.bankroll_usd / price)
        }
    }
}

/// Reduce-only close ratio: `min(1, |delta| / |prev|)`, 0 when prev is flat.
pub fn close_ratio(delta: f64, prev_net: f64) -> f64 {
    if prev_net.abs() <= f64::EPSILON {
        return 0.0;
    }
    (delta.abs() / prev_net.abs()).min(1.0)
}
