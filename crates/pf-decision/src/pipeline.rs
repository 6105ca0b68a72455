//! The strict decision pipeline: event → zero or more intents.
//!
//! Stage order is load-bearing and mirrors the gating contract:
//!
//! 1. contract + freshness
//! 2. replay gate
//! 3. safety gate
//! 4. hard risk checks (price staleness, slippage, venue filters — exact
//!    multiples, never rounded)
//! 5. sizing
//! 6. intent assembly (FLIP: close precedes open)
//!
//! The whole pipeline is a pure function of the event and the provider
//! readings in the context; equal inputs produce byte-identical output.

use pf_config::{PriceFailurePolicy, ReplayPolicy, RiskConfig, SizingConfig};
use pf_schemas::{
    correlation_id, IntentRole, OrderIntent, OrderType, PositionAction, PositionDeltaEvent, Side,
    SafetyMode, TimeInForce, CONTRACT_VERSION,
};

use crate::providers::{FiltersProvider, LocalPositionProvider, ReferencePriceProvider};
use crate::sizing::{close_ratio, size_open, SizingFailure};

/// Divide-by-zero guard for degenerate reference prices.
const PRICE_EPS: f64 = 1e-9;
/// Tolerance for exact-multiple checks (on the quotient, not the value).
const MULTIPLE_EPS: f64 = 1e-9;

// ---------------------------------------------------------------------------
// Settings + context
// ---------------------------------------------------------------------------

/// The configuration slice the pipeline needs.
#[derive(Debug, Clone)]
pub struct DecisionSettings {
    pub sizing: SizingConfig,
    pub risk: RiskConfig,
    pub replay_policy: ReplayPolicy,
    pub strategy_version: String,
}

/// Everything `decide` reads besides the event itself.
pub struct DecisionContext<'a> {
    pub now_ms: i64,
    pub safety_mode: SafetyMode,
    pub settings: &'a DecisionSettings,
    pub prices: &'a dyn ReferencePriceProvider,
    pub filters: &'a dyn FiltersProvider,
    pub positions: &'a dyn LocalPositionProvider,
}

// ---------------------------------------------------------------------------
// Rejections
// ---------------------------------------------------------------------------

/// Closed vocabulary of decision rejection reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    ContractVersionIncompatible,
    EventStale,
    EventAheadOfClock,
    ReplayPolicyDrop,
    ReplayPolicyIncreaseBlocked,
    SafetyHalt,
    SafetyReduceOnly,
    PriceUnavailable,
    PriceStale,
    SlippageExceeded,
    FilterUnavailable,
    FilterMinQty,
    FilterStepSize,
    FilterMinNotional,
    FilterTickSize,
    ZeroClosable,
    NoEdge,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::ContractVersionIncompatible => "contract_version_incompatible",
            RejectReason::EventStale => "event_stale",
            RejectReason::EventAheadOfClock => "event_ahead_of_clock",
            RejectReason::ReplayPolicyDrop => "replay_policy_drop",
            RejectReason::ReplayPolicyIncreaseBlocked => "replay_policy_increase_blocked",
            RejectReason::SafetyHalt => "safety_halt",
            RejectReason::SafetyReduceOnly => "safety_reduce_only",
            RejectReason::PriceUnavailable => "price_unavailable",
            RejectReason::PriceStale => "price_stale",
            RejectReason::SlippageExceeded => "slippage_exceeded",
            RejectReason::FilterUnavailable => "filter_unavailable",
            RejectReason::FilterMinQty => "filter_min_qty",
            RejectReason::FilterStepSize => "filter_step_size",
            RejectReason::FilterMinNotional => "filter_min_notional",
            RejectReason::FilterTickSize => "filter_tick_size",
            RejectReason::ZeroClosable => "zero_closable",
            RejectReason::NoEdge => "no_edge",
        }
    }
}

/// A component (or whole event) the pipeline declined, with evidence.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub reason: RejectReason,
    pub detail: String,
    /// Which FLIP component was rejected, when applicable.
    pub role: Option<IntentRole>,
}

/// Ordered intents plus the rejections that explain everything missing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecisionOutcome {
    pub intents: Vec<OrderIntent>,
    pub rejections: Vec<Rejection>,
}

impl DecisionOutcome {
    fn reject(reason: RejectReason, detail: impl Into<String>) -> Self {
        Self {
            intents: Vec::new(),
            rejections: vec![Rejection {
                reason,
                detail: detail.into(),
                role: None,
            }],
        }
    }
}

// ---------------------------------------------------------------------------
// Internal component plan
// ---------------------------------------------------------------------------

enum Component {
    /// Exposure-opening: leader base quantity to mirror.
    Open { leader_qty: f64, role: Option<IntentRole> },
    /// Reduce-only: fraction of the local position to close.
    Close { ratio: f64, role: Option<IntentRole> },
}

impl Component {
    fn role(&self) -> Option<IntentRole> {
        match self {
            Component::Open { role, .. } | Component::Close { role, .. } => *role,
        }
    }

    fn is_open(&self) -> bool {
        matches!(self, Component::Open { .. })
    }
}

fn plan_components(event: &PositionDeltaEvent) -> Vec<Component> {
    match event.action {
        PositionAction::Increase => vec![Component::Open {
            leader_qty: event.delta.abs(),
            role: None,
        }],
        PositionAction::Decrease => vec![Component::Close {
            ratio: close_ratio(event.delta, event.prev_net),
            role: None,
        }],
        // Close precedes open; both are pinned to their roles for ids.
        PositionAction::Flip => vec![
            Component::Close {
                ratio: 1.0,
                role: Some(IntentRole::Close),
            },
            Component::Open {
                leader_qty: event.open_component.unwrap_or(event.next_net.abs()),
                role: Some(IntentRole::Open),
            },
        ],
    }
}

// ---------------------------------------------------------------------------
// Price assessment
// ---------------------------------------------------------------------------

struct PriceAssessment {
    /// Usable reference price, if any.
    reference: Option<f64>,
    risk_notes: Vec<String>,
    /// A hard rejection that applies to the whole event.
    rejection: Option<Rejection>,
}

fn assess_price(event: &PositionDeltaEvent, ctx: &DecisionContext) -> PriceAssessment {
    let risk = &ctx.settings.risk;
    let mut notes = Vec::new();

    let mark = ctx.prices.mark_price(&event.key.symbol);
    let mark_fresh = mark.filter(|p| ctx.now_ms.saturating_sub(p.timestamp_ms) <= risk.mark_price_max_age_ms);
    let mark_was_stale = mark.is_some() && mark_fresh.is_none();

    let reference = match mark_fresh {
        Some(p) => Some(p.price),
        None => {
            // Fallback to the ingest-supplied price under its stricter bound.
            let event_age = ctx.now_ms.saturating_sub(event.key.timestamp_ms);
            if risk.price_fallback_enabled
                && event_age <= risk.price_fallback_max_age_ms
                && event.expected_price.is_some()
            {
                notes.push("reference price from ingest fallback".to_string());
                event.expected_price
            } else {
                None
            }
        }
    };

    // Slippage needs both sides of the comparison.
    match (reference, event.expected_price) {
        (Some(r), Some(e)) => {
            let slippage = (r - e).abs() / e.max(PRICE_EPS);
            if risk.slippage_cap_pct > 0.0 && slippage > risk.slippage_cap_pct / 100.0 {
                return PriceAssessment {
                    reference,
                    risk_notes: notes,
                    rejection: Some(Rejection {
                        reason: RejectReason::SlippageExceeded,
                        detail: format!(
                            "slippage {:.4}% exceeds cap {:.4}%",
                            slippage * 100.0,
                            risk.slippage_cap_pct
                        ),
                        role: None,
                    }),
                };
            }
        }
        _ => match risk.price_failure_policy {
            PriceFailurePolicy::Reject => {
                let reason = if mark_was_stale {
                    RejectReason::PriceStale
                } else {
                    RejectReason::PriceUnavailable
                };
                return PriceAssessment {
                    reference,
                    risk_notes: notes,
                    rejection: Some(Rejection {
                        reason,
                        detail: "reference or expected price missing".to_string(),
                        role: None,
                    }),
                };
            }
            PriceFailurePolicy::AllowWithoutPrice => {
                notes.push("slippage unchecked: price missing".to_string());
            }
        },
    }

    PriceAssessment {
        reference,
        risk_notes: notes,
        rejection: None,
    }
}

// ---------------------------------------------------------------------------
// Filter checks
// ---------------------------------------------------------------------------

fn is_multiple_of(value: f64, step: f64) -> bool {
    if step <= 0.0 {
        return true;
    }
    let quotient = value / step;
    (quotient - quotient.round()).abs() <= MULTIPLE_EPS * quotient.abs().max(1.0)
}

/// Exact-multiple venue filter checks. No rounding, ever: a quantity that is
/// off by one step fails here and the rejection says which filter.
fn check_filters(
    filters: &crate::providers::SymbolFilters,
    qty: f64,
    price: Option<f64>,
    notes: &mut Vec<String>,
) -> Option<RejectReason> {
    if qty < filters.min_qty {
        return Some(RejectReason::FilterMinQty);
    }
    if !is_multiple_of(qty, filters.step_size) {
        return Some(RejectReason::FilterStepSize);
    }
    match price {
        Some(p) => {
            if p * qty < filters.min_notional {
                return Some(RejectReason::FilterMinNotional);
            }
            if !is_multiple_of(p, filters.tick_size) {
                return Some(RejectReason::FilterTickSize);
            }
        }
        None => {
            // Market order without a reference: notional can't be verified.
            notes.push("min_notional unchecked: no reference price".to_string());
        }
    }
    None
}

// ---------------------------------------------------------------------------
// decide
// ---------------------------------------------------------------------------

/// Run the full pipeline for one event.
pub fn decide(event: &PositionDeltaEvent, ctx: &DecisionContext) -> DecisionOutcome {
    // 1. Contract + freshness.
    if !CONTRACT_VERSION.accepts(event.contract) {
        return DecisionOutcome::reject(
            RejectReason::ContractVersionIncompatible,
            format!("event contract {} vs consumer {}", event.contract, CONTRACT_VERSION),
        );
    }
    let age = ctx.now_ms - event.key.timestamp_ms;
    if age > ctx.settings.risk.max_stale_ms {
        return DecisionOutcome::reject(
            RejectReason::EventStale,
            format!("event is {age}ms old, max {}ms", ctx.settings.risk.max_stale_ms),
        );
    }
    if -age > ctx.settings.risk.max_future_ms {
        return DecisionOutcome::reject(
            RejectReason::EventAheadOfClock,
            format!("event is {}ms ahead, max {}ms", -age, ctx.settings.risk.max_future_ms),
        );
    }

    // 2. Replay gate (whole-event drop; per-component blocking happens below).
    if event.is_replay && ctx.settings.replay_policy == ReplayPolicy::Off {
        return DecisionOutcome::reject(RejectReason::ReplayPolicyDrop, "replay_policy=off");
    }

    // 3. Safety gate (whole-event drop on HALT).
    if ctx.safety_mode == SafetyMode::Halt {
        return DecisionOutcome::reject(RejectReason::SafetyHalt, "safety mode is HALT");
    }

    // 4. Hard risk checks shared across components.
    let price = assess_price(event, ctx);
    if let Some(rejection) = price.rejection {
        return DecisionOutcome {
            intents: Vec::new(),
            rejections: vec![rejection],
        };
    }

    let mut outcome = DecisionOutcome::default();

    for component in plan_components(event) {
        let role = component.role();

        // Per-component replay + safety gates: only reduce-only paths pass.
        if component.is_open() {
            if event.is_replay && ctx.settings.replay_policy == ReplayPolicy::CloseOnly {
                outcome.rejections.push(Rejection {
                    reason: RejectReason::ReplayPolicyIncreaseBlocked,
                    detail: "replay_policy=close_only blocks exposure increase".to_string(),
                    role,
                });
                continue;
            }
            if ctx.safety_mode == SafetyMode::ArmedSafe {
                outcome.rejections.push(Rejection {
                    reason: RejectReason::SafetyReduceOnly,
                    detail: "ARMED_SAFE blocks exposure increase".to_string(),
                    role,
                });
                continue;
            }
        }

        let mut notes = price.risk_notes.clone();

        // 5. Sizing.
        let (qty, side, reduce_only) = match &component {
            Component::Open { leader_qty, .. } => {
                let side = if event.next_net >= 0.0 { Side::Buy } else { Side::Sell };
                match size_open(&ctx.settings.sizing, *leader_qty, price.reference) {
                    Ok(q) => (q, side, false),
                    Err(SizingFailure::NeedsPrice) => {
                        outcome.rejections.push(Rejection {
                            reason: RejectReason::PriceUnavailable,
                            detail: "sizing mode requires a reference price".to_string(),
                            role,
                        });
                        continue;
                    }
                    Err(SizingFailure::NoEdge) => {
                        outcome.rejections.push(Rejection {
                            reason: RejectReason::NoEdge,
                            detail: "kelly fraction is non-positive".to_string(),
                            role,
                        });
                        continue;
                    }
                }
            }
            Component::Close { ratio, .. } => {
                let local = ctx.positions.position(&event.key.symbol);
                let closable = local.abs();
                let qty = (closable * ratio).min(closable);
                if qty <= PRICE_EPS {
                    tracing::warn!(
                        symbol = %event.key.symbol,
                        "close component skipped: nothing closable"
                    );
                    outcome.rejections.push(Rejection {
                        reason: RejectReason::ZeroClosable,
                        detail: format!("closable_qty={closable}, ratio={ratio}"),
                        role,
                    });
                    continue;
                }
                (qty, Side::reducing(local), true)
            }
        };

        // 4b. Venue filters (exact multiples, no rounding).
        let Some(filters) = ctx.filters.filters(&event.key.symbol) else {
            outcome.rejections.push(Rejection {
                reason: RejectReason::FilterUnavailable,
                detail: format!("no filters for {}", event.key.symbol),
                role,
            });
            continue;
        };
        if let Some(reason) = check_filters(&filters, qty, price.reference, &mut notes) {
            outcome.rejections.push(Rejection {
                reason,
                detail: format!("qty={qty}, price={:?}", price.reference),
                role,
            });
            continue;
        }

        // 6. Assemble.
        let (order_type, limit_price) = match price.reference {
            Some(p) => (OrderType::Limit, Some(p)),
            None => (OrderType::Market, None),
        };

        outcome.intents.push(OrderIntent {
            correlation_id: correlation_id(
                &event.key.tx_hash,
                event.key.event_index,
                &event.key.symbol,
                role,
            ),
            symbol: event.key.symbol.clone(),
            side,
            order_type,
            qty,
            price: limit_price,
            reduce_only,
            tif: TimeInForce::Gtc,
            is_replay: event.is_replay,
            strategy_version: ctx.settings.strategy_version.clone(),
            risk_notes: notes,
        });
    }

    outcome
}
