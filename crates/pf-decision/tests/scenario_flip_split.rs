//! Scenario: a FLIP event splits into a close intent followed by an open.
//!
//! # Invariants under test
//!
//! 1. prev=+5.0 → next=−3.0 yields two intents whose correlation ids end in
//!    `-close` and `-open`, close first.
//! 2. The close intent is reduce-only with qty = closable (5.0); the open
//!    intent sizes against open_component = 3.0 and is not reduce-only.
//! 3. Under ARMED_SAFE only the close intent survives; the open component is
//!    rejected with `safety_reduce_only`.
//! 4. With no local position the close is skipped with `zero_closable` while
//!    the open half still proceeds.

use std::collections::BTreeMap;

use pf_config::{PriceFailurePolicy, ReplayPolicy, RiskConfig, SizingConfig, SizingMode};
use pf_decision::{decide, DecisionContext, DecisionSettings, PricePoint, RejectReason, SymbolFilters};
use pf_schemas::{
    EventKey, IntentRole, PositionAction, PositionDeltaEvent, SafetyMode, Side, CONTRACT_VERSION,
};

fn settings() -> DecisionSettings {
    DecisionSettings {
        sizing: SizingConfig {
            mode: SizingMode::Proportional,
            fixed_notional_usd: 0.0,
            ratio: 1.0,
            kelly: None,
        },
        risk: RiskConfig {
            max_stale_ms: 3_600_000,
            max_future_ms: 5_000,
            slippage_cap_pct: 0.0,
            price_failure_policy: PriceFailurePolicy::Reject,
            price_fallback_enabled: true,
            price_fallback_max_age_ms: 3_600_000,
            mark_price_max_age_ms: 10_000,
        },
        replay_policy: ReplayPolicy::CloseOnly,
        strategy_version: "copy-1".to_string(),
    }
}

fn flip_event() -> PositionDeltaEvent {
    PositionDeltaEvent {
        key: EventKey {
            timestamp_ms: 999_500,
            event_index: 4,
            tx_hash: "0xf11p".to_string(),
            symbol: "ETHUSDT".to_string(),
        },
        prev_net: 5.0,
        next_net: -3.0,
        delta: -8.0,
        action: PositionAction::Flip,
        close_component: Some(5.0),
        open_component: Some(3.0),
        is_replay: false,
        expected_price: Some(3_000.0),
        contract: CONTRACT_VERSION,
    }
}

struct Fixture {
    prices: BTreeMap<String, PricePoint>,
    filters: BTreeMap<String, SymbolFilters>,
    positions: BTreeMap<String, f64>,
}

impl Fixture {
    fn with_position(position: f64) -> Self {
        Self {
            prices: BTreeMap::from([(
                "ETHUSDT".to_string(),
                PricePoint {
                    price: 3_000.0,
                    timestamp_ms: 999_900,
                },
            )]),
            filters: BTreeMap::from([(
                "ETHUSDT".to_string(),
                SymbolFilters {
                    min_qty: 0.001,
                    step_size: 0.0,
                    min_notional: 0.0,
                    tick_size: 0.0,
                },
            )]),
            positions: BTreeMap::from([("ETHUSDT".to_string(), position)]),
        }
    }

    fn ctx<'a>(&'a self, settings: &'a DecisionSettings, mode: SafetyMode) -> DecisionContext<'a> {
        DecisionContext {
            now_ms: 1_000_000,
            safety_mode: mode,
            settings,
            prices: &self.prices,
            filters: &self.filters,
            positions: &self.positions,
        }
    }
}

#[test]
fn flip_yields_close_then_open() {
    let fixture = Fixture::with_position(5.0);
    let settings = settings();
    let outcome = decide(&flip_event(), &fixture.ctx(&settings, SafetyMode::ArmedLive));

    assert_eq!(outcome.intents.len(), 2, "rejections: {:?}", outcome.rejections);

    let close = &outcome.intents[0];
    assert!(close.correlation_id.ends_with("-close"));
    assert!(close.reduce_only);
    assert_eq!(close.side, Side::Sell, "closing a long sells");
    assert!((close.qty - 5.0).abs() < 1e-9);

    let open = &outcome.intents[1];
    assert!(open.correlation_id.ends_with("-open"));
    assert!(!open.reduce_only);
    assert_eq!(open.side, Side::Sell, "the new position is short");
    assert!((open.qty - 3.0).abs() < 1e-9, "sized from open_component");

    // Shared prefix, distinct roles.
    let base = close.correlation_id.trim_end_matches("-close");
    assert_eq!(open.correlation_id.trim_end_matches("-open"), base);
}

#[test]
fn armed_safe_keeps_only_the_close_half() {
    let fixture = Fixture::with_position(5.0);
    let settings = settings();
    let outcome = decide(&flip_event(), &fixture.ctx(&settings, SafetyMode::ArmedSafe));

    assert_eq!(outcome.intents.len(), 1);
    assert!(outcome.intents[0].reduce_only);
    assert_eq!(outcome.rejections.len(), 1);
    assert_eq!(outcome.rejections[0].reason, RejectReason::SafetyReduceOnly);
    assert_eq!(outcome.rejections[0].role, Some(IntentRole::Open));
}

#[test]
fn zero_closable_skips_close_but_not_open() {
    let fixture = Fixture::with_position(0.0);
    let settings = settings();
    let outcome = decide(&flip_event(), &fixture.ctx(&settings, SafetyMode::ArmedLive));

    assert_eq!(outcome.intents.len(), 1);
    assert!(outcome.intents[0].correlation_id.ends_with("-open"));
    assert_eq!(outcome.rejections.len(), 1);
    assert_eq!(outcome.rejections[0].reason, RejectReason::ZeroClosable);
    assert_eq!(outcome.rejections[0].role, Some(IntentRole::Close));
}

#[test]
fn halt_drops_both_halves() {
    let fixture = Fixture::with_position(5.0);
    let settings = settings();
    let outcome = decide(&flip_event(), &fixture.ctx(&settings, SafetyMode::Halt));

    assert!(outcome.intents.is_empty());
    assert_eq!(outcome.rejections[0].reason, RejectReason::SafetyHalt);
}
