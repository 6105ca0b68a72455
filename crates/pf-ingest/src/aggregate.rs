//! Fill aggregation: many venue fills → at most one position-delta event per
//! `(tx_hash, coin)` group.
//!
//! The leader venue splits one order into many fills sharing a tx hash.
//! Acting per-fill produces dust quantities the execution venue's filters
//! reject, so the follower would never act. Aggregation is therefore the
//! first mandatory stage of the pipeline.
//!
//! # Invariants
//!
//! - Within a group, fills are sorted `(time_ms, tid)` ascending before any
//!   computation; input permutations cannot change the output.
//! - `next_net` prefers the venue's own post-fill snapshot (last fill's
//!   `startPosition + signed size`) and falls back to `prev_net + Σ`.
//! - Unmapped coins and `@`-prefixed spot symbols are dropped (counted, never
//!   traded); fills with invalid sides never reach this layer — the adapter
//!   excludes them at decode time.
//! - Output events are sorted by their composite key.

use std::collections::BTreeMap;

use pf_schemas::{
    EventKey, Fill, PositionAction, PositionDeltaEvent, CONTRACT_VERSION,
};

/// Sign changes below this are treated as "still flat".
const FLAT_EPS: f64 = 1e-9;

/// Aggregation result plus drop counters for observability.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
    /// Events sorted by composite key.
    pub events: Vec<PositionDeltaEvent>,
    pub dropped_unmapped: u32,
    pub dropped_zero_delta: u32,
}

/// Aggregate a batch of fills into position-delta events.
///
/// `map_symbol` maps a leader coin to the execution-venue symbol; `None`
/// drops the group (unmapped or spot-style coin).
pub fn aggregate_fills(
    fills: &[Fill],
    map_symbol: impl Fn(&str) -> Option<String>,
    is_replay: bool,
) -> Aggregation {
    let mut dropped_unmapped = 0u32;
    let mut dropped_zero_delta = 0u32;

    // Group by (tx_hash, coin). BTreeMap keeps group order deterministic.
    let mut groups: BTreeMap<(String, String), Vec<&Fill>> = BTreeMap::new();
    for f in fills {
        groups
            .entry((f.tx_hash.clone(), f.coin.clone()))
            .or_default()
            .push(f);
    }

    let mut events = Vec::new();

    for ((tx_hash, coin), mut group) in groups {
        let Some(symbol) = map_symbol(&coin) else {
            tracing::warn!(coin = %coin, "dropping fills for unmapped coin");
            dropped_unmapped += 1;
            continue;
        };

        group.sort_by_key(|f| (f.time_ms, f.tid));

        // Sides were validated at decode time; every fill here is signed.
        let total_delta: f64 = group.iter().map(|f| f.size * f.side.sign()).sum();

        let prev_net = group
            .iter()
            .find_map(|f| f.start_position)
            .unwrap_or(0.0);

        // Venue's own post-fill snapshot wins when available.
        let next_net = group
            .iter()
            .rev()
            .find(|f| f.start_position.is_some())
            .map(|last| last.start_position.unwrap() + last.size * last.side.sign())
            .unwrap_or(prev_net + total_delta);

        if (next_net - prev_net).abs() <= FLAT_EPS {
            tracing::debug!(tx_hash = %tx_hash, coin = %coin, "zero-delta group skipped");
            dropped_zero_delta += 1;
            continue;
        }

        let action = classify(prev_net, next_net);
        let (close_component, open_component) = match action {
            PositionAction::Flip => (Some(prev_net.abs()), Some(next_net.abs())),
            _ => (None, None),
        };

        // Size-weighted average price across priced fills.
        let (px_notional, px_size) = group
            .iter()
            .filter_map(|f| f.px.map(|p| (p * f.size, f.size)))
            .fold((0.0, 0.0), |(n, s), (pn, ps)| (n + pn, s + ps));
        let expected_price = if px_size > 0.0 {
            Some(px_notional / px_size)
        } else {
            None
        };

        let first = group.first().expect("group is non-empty");
        let last = group.last().expect("group is non-empty");

        events.push(PositionDeltaEvent {
            key: EventKey {
                timestamp_ms: last.time_ms,
                event_index: first.tid,
                tx_hash,
                symbol,
            },
            prev_net,
            next_net,
            delta: total_delta,
            action,
            close_component,
            open_component,
            is_replay,
            expected_price,
            contract: CONTRACT_VERSION,
        });
    }

    events.sort_by(|a, b| a.key.cmp(&b.key));

    Aggregation {
        events,
        dropped_unmapped,
        dropped_zero_delta,
    }
}

/// INCREASE / DECREASE / FLIP classification.
fn classify(prev_net: f64, next_net: f64) -> PositionAction {
    let prev_flat = prev_net.abs() <= FLAT_EPS;
    let next_flat = next_net.abs() <= FLAT_EPS;

    if prev_flat {
        return PositionAction::Increase;
    }
    if next_flat {
        return PositionAction::Decrease;
    }
    if prev_net.signum() != next_net.signum() {
        return PositionAction::Flip;
    }
    if next_net.abs() > prev_net.abs() {
        PositionAction::Increase
    } else {
        PositionAction::Decrease
    }
}
