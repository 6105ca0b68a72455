//! Intent executor: drives one order intent through its venue lifecycle.
//!
//! # Idempotency protocol
//!
//! - The client order id IS the (normalized) correlation id. A resubmit after
//!   crash or timeout reuses the same id, and the venue's duplicate check
//!   converts the collision into a status query.
//! - Every status update is validated by the FSM and persisted through the
//!   store, which refuses terminal regressions. Terminal states are written
//!   exactly once, after any market fallback has been merged.
//!
//! # Error taxonomy in effect
//!
//! | Venue signal        | Here                                            |
//! |---------------------|-------------------------------------------------|
//! | rate limit          | shared cooldown across submit + poll            |
//! | timeout             | UNKNOWN, counted against the retry budget       |
//! | duplicate client id | query + adopt                                   |
//! | rejection           | REJECTED, permanent                             |
//! | cancel confirmation | drained, then EXPIRED or FILLED as fills decide |

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use pf_config::{ExecutionConfig, RetryBudgetMode};
use pf_schemas::{
    venue_client_id, OrderIntent, OrderResult, OrderStatus, OrderType, ReasonCode, SafetyMode,
};
use pf_store::Store;

use crate::fsm::validate_transition;
use crate::venue::{SubmitOutcome, SubmitRequest, VenueAdapter, VenueError, VenueOrder};

/// Timeout wrapped around every venue call.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Transport errors (request never left) are retried this many times before
/// the order is parked UNKNOWN.
const TRANSPORT_RETRIES: u32 = 2;

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Millisecond wall clock, injected so tests control time.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

// ---------------------------------------------------------------------------
// Retry budget
// ---------------------------------------------------------------------------

/// Sliding-window attempt counter for UNKNOWN recovery.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    max_attempts: u32,
    window_ms: i64,
    attempts_in_window: u32,
    window_start_ms: i64,
}

impl RetryBudget {
    pub fn new(max_attempts: u32, window_sec: u64) -> Self {
        Self {
            max_attempts,
            window_ms: window_sec as i64 * 1000,
            attempts_in_window: 0,
            window_start_ms: 0,
        }
    }

    /// Count one failed attempt. Returns `true` when the budget is exceeded.
    pub fn note_failure(&mut self, now_ms: i64) -> bool {
        if now_ms.saturating_sub(self.window_start_ms) > self.window_ms {
            self.window_start_ms = now_ms;
            self.attempts_in_window = 0;
        }
        self.attempts_in_window += 1;
        self.attempts_in_window >= self.max_attempts
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Safety transition requested by the executor (retry budget exhaustion).
#[derive(Debug, Clone, PartialEq)]
pub struct SafetyTrigger {
    pub mode: RetryBudgetMode,
    pub reason: ReasonCode,
    pub message: String,
}

/// Outcome of driving one intent.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub result: OrderResult,
    /// Set when the retry budget was exhausted; the runtime persists the
    /// corresponding safety transition.
    pub safety_trigger: Option<SafetyTrigger>,
    /// `true` when the safety gate suppressed submission entirely.
    pub suppressed: bool,
}

/// Adapter health snapshot for the safety auto-recovery gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSnapshot {
    pub last_success_ms: i64,
    pub last_error_ms: i64,
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct Executor<V: VenueAdapter, C: Clock> {
    venue: Arc<V>,
    store: Store,
    cfg: ExecutionConfig,
    clock: C,
    /// Shared 429 cooldown deadline across submit and poll.
    cooldown_until_ms: AtomicI64,
    last_success_ms: AtomicI64,
    last_error_ms: AtomicI64,
}

enum SubmitResolution {
    Submitted { exchange_order_id: String },
    Adopted(VenueOrder),
    Rejected { code: String, message: String },
    Unknown,
}

impl<V: VenueAdapter, C: Clock> Executor<V, C> {
    pub fn new(venue: Arc<V>, store: Store, cfg: ExecutionConfig, clock: C) -> Self {
        Self {
            venue,
            store,
            cfg,
            clock,
            cooldown_until_ms: AtomicI64::new(0),
            last_success_ms: AtomicI64::new(0),
            last_error_ms: AtomicI64::new(0),
        }
    }

    pub fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            last_success_ms: self.last_success_ms.load(Ordering::Relaxed),
            last_error_ms: self.last_error_ms.load(Ordering::Relaxed),
        }
    }

    fn note_success(&self) {
        self.last_success_ms
            .store(self.clock.now_ms(), Ordering::Relaxed);
    }

    fn note_error(&self) {
        self.last_error_ms
            .store(self.clock.now_ms(), Ordering::Relaxed);
    }

    /// Honor the shared rate-limit cooldown before any venue call.
    async fn wait_cooldown(&self) {
        let until = self.cooldown_until_ms.load(Ordering::Relaxed);
        let now = self.clock.now_ms();
        if until > now {
            tokio::time::sleep(Duration::from_millis((until - now) as u64)).await;
        }
    }

    fn enter_cooldown(&self, retry_after_ms: Option<u64>) {
        let pause = retry_after_ms.unwrap_or(self.cfg.rate_limit_cooldown_ms);
        let until = self.clock.now_ms() + pause as i64;
        self.cooldown_until_ms.store(until, Ordering::Relaxed);
        tracing::warn!(pause_ms = pause, "rate limited; submit and poll suspended");
    }

    /// Persist a result update, validating the FSM transition first.
    async fn persist(&self, result: &mut OrderResult, to: OrderStatus) -> Result<()> {
        validate_transition(result.status, to)
            .with_context(|| format!("order {}", result.correlation_id))?;
        result.status = to;
        result.updated_at_ms = self.clock.now_ms();
        self.store.upsert_result(result, |_, _| true).await
    }

    /// Merge a venue order view into the local result (fills only).
    fn merge_fills(result: &mut OrderResult, venue: &VenueOrder) {
        if venue.filled_qty > result.filled_qty {
            result.filled_qty = venue.filled_qty;
            result.avg_price = venue.avg_price.or(result.avg_price);
        }
        if result.exchange_order_id.is_none() {
            result.exchange_order_id = venue.exchange_order_id.clone();
        }
    }

    // -----------------------------------------------------------------------
    // Public entry points
    // -----------------------------------------------------------------------

    /// Drive one intent from scratch. `safety_mode` is read at gate time;
    /// HALT suppresses everything, ARMED_SAFE passes only reduce-only.
    pub async fn execute(
        &self,
        intent: &OrderIntent,
        safety_mode: SafetyMode,
    ) -> Result<ExecutionReport> {
        let now = self.clock.now_ms();
        let mut result = match self.store.load_result(&intent.correlation_id).await? {
            Some(existing) => existing,
            None => {
                let fresh = OrderResult::pending(&intent.correlation_id, now);
                self.store.upsert_result(&fresh, |_, _| false).await?;
                fresh
            }
        };

        if result.status.is_terminal() {
            return Ok(ExecutionReport {
                result,
                safety_trigger: None,
                suppressed: false,
            });
        }

        let gate_blocked = match safety_mode {
            SafetyMode::Halt => true,
            SafetyMode::ArmedSafe => !intent.reduce_only,
            SafetyMode::ArmedLive => false,
        };
        if gate_blocked {
            tracing::warn!(
                correlation_id = %intent.correlation_id,
                mode = safety_mode.as_str(),
                "submission suppressed by safety gate"
            );
            return Ok(ExecutionReport {
                result,
                safety_trigger: None,
                suppressed: true,
            });
        }

        self.drive(intent, &mut result, true).await
    }

    /// Restart recovery for one intent. Non-terminal persisted results are
    /// re-queried from the venue; SUBMITTED/UNKNOWN/FILLED bypass the
    /// pre-submit gate entirely.
    pub async fn recover(
        &self,
        intent: &OrderIntent,
        prior: Option<OrderResult>,
        safety_mode: SafetyMode,
    ) -> Result<ExecutionReport> {
        match prior {
            None => self.execute(intent, safety_mode).await,
            Some(r) if r.status == OrderStatus::Pending => {
                self.execute(intent, safety_mode).await
            }
            Some(r) if r.status.is_terminal() => Ok(ExecutionReport {
                result: r,
                safety_trigger: None,
                suppressed: false,
            }),
            Some(mut r) => {
                // The order may be live on the venue: adopt its state and
                // resume the poll loop without re-running pre-submit gates.
                self.drive(intent, &mut r, false).await
            }
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle driver
    // -----------------------------------------------------------------------

    async fn drive(
        &self,
        intent: &OrderIntent,
        result: &mut OrderResult,
        needs_submit: bool,
    ) -> Result<ExecutionReport> {
        let client_id = venue_client_id(&intent.correlation_id);
        let mut budget = RetryBudget::new(
            self.cfg.retry_budget_max_attempts,
            self.cfg.retry_budget_window_sec,
        );

        if needs_submit && result.status == OrderStatus::Pending {
            let resolution = self.submit_once(intent, &client_id).await?;
            if let Some(report) = self.apply_submit_resolution(result, resolution).await? {
                return Ok(report);
            }
        }

        // Poll to resolution. LIMIT orders carry a TIF deadline; market
        // orders (and recovered orders) poll until terminal.
        let deadline = if intent.order_type == OrderType::Limit {
            Some(self.clock.now_ms() + self.cfg.tif_seconds as i64 * 1000)
        } else {
            None
        };

        loop {
            let interval_sec = if result.status == OrderStatus::Unknown {
                self.cfg.unknown_poll_interval_sec
            } else {
                self.cfg.order_poll_interval_sec
            };
            tokio::time::sleep(Duration::from_secs(interval_sec)).await;

            match self.query_once(&client_id).await {
                Ok(Some(order)) => {
                    self.note_success();
                    Self::merge_fills(result, &order);
                    if order.status.is_terminal() {
                        return self.finalize(result, order.status).await;
                    }
                    if order.status != result.status {
                        self.persist(result, order.status).await?;
                    }
                }
                Ok(None) => {
                    // The venue has never seen this id: the submit was lost
                    // before it applied. Resubmitting the same client id is
                    // safe by construction.
                    self.note_success();
                    if result.status == OrderStatus::Unknown {
                        let resolution = self.submit_once(intent, &client_id).await?;
                        if let Some(report) =
                            self.apply_submit_resolution(result, resolution).await?
                        {
                            return Ok(report);
                        }
                    } else {
                        // A supposedly live order the venue cannot find is
                        // UNKNOWN; the next pass resubmits under the same id.
                        self.persist(result, OrderStatus::Unknown).await?;
                    }
                }
                Err(VenueError::RateLimited { retry_after_ms }) => {
                    self.enter_cooldown(retry_after_ms);
                }
                Err(err) => {
                    self.note_error();
                    tracing::warn!(%err, correlation_id = %intent.correlation_id, "query failed");
                    if result.status != OrderStatus::Unknown {
                        self.persist(result, OrderStatus::Unknown).await?;
                    } else if budget.note_failure(self.clock.now_ms()) {
                        return Ok(ExecutionReport {
                            result: result.clone(),
                            safety_trigger: Some(self.budget_trigger(intent)),
                            suppressed: false,
                        });
                    }
                }
            }

            if let Some(deadline_ms) = deadline {
                if self.clock.now_ms() >= deadline_ms
                    && matches!(
                        result.status,
                        OrderStatus::Submitted | OrderStatus::PartiallyFilled
                    )
                {
                    return self.expire_with_fallback(intent, result, &client_id).await;
                }
            }
        }
    }

    /// Fold a submit resolution into the result. Returns a report when the
    /// resolution was terminal.
    async fn apply_submit_resolution(
        &self,
        result: &mut OrderResult,
        resolution: SubmitResolution,
    ) -> Result<Option<ExecutionReport>> {
        match resolution {
            SubmitResolution::Submitted { exchange_order_id } => {
                result.exchange_order_id = Some(exchange_order_id);
                self.persist(result, OrderStatus::Submitted).await?;
                Ok(None)
            }
            SubmitResolution::Adopted(order) => {
                Self::merge_fills(result, &order);
                // The duplicate check proves the order reached the venue, so
                // a still-PENDING local record passed through SUBMITTED.
                if result.status == OrderStatus::Pending {
                    self.persist(result, OrderStatus::Submitted).await?;
                }
                if order.status.is_terminal() {
                    return Ok(Some(self.finalize(result, order.status).await?));
                }
                if order.status != result.status {
                    self.persist(result, order.status).await?;
                }
                Ok(None)
            }
            SubmitResolution::Rejected { code, message } => {
                result.error_code = Some(code);
                result.error_message = Some(message);
                self.persist(result, OrderStatus::Rejected).await?;
                Ok(Some(ExecutionReport {
                    result: result.clone(),
                    safety_trigger: None,
                    suppressed: false,
                }))
            }
            SubmitResolution::Unknown => {
                if result.status != OrderStatus::Unknown {
                    self.persist(result, OrderStatus::Unknown).await?;
                }
                Ok(None)
            }
        }
    }

    fn budget_trigger(&self, intent: &OrderIntent) -> SafetyTrigger {
        SafetyTrigger {
            mode: self.cfg.retry_budget_mode,
            reason: ReasonCode::ExecutionRetryBudgetExceeded,
            message: format!(
                "retry budget exhausted for {} ({} attempts / {}s)",
                intent.correlation_id,
                self.cfg.retry_budget_max_attempts,
                self.cfg.retry_budget_window_sec
            ),
        }
    }

    // -----------------------------------------------------------------------
    // TIF expiry + market fallback
    // -----------------------------------------------------------------------

    /// Cancel an expired LIMIT order, drain late fills, then either submit
    /// the market fallback for the remainder or settle on EXPIRED.
    async fn expire_with_fallback(
        &self,
        intent: &OrderIntent,
        result: &mut OrderResult,
        client_id: &str,
    ) -> Result<ExecutionReport> {
        self.wait_cooldown().await;
        let _ = tokio::time::timeout(REQUEST_TIMEOUT, self.venue.cancel_order(client_id)).await;

        // Drain: wait for the venue to confirm a terminal state, adopting any
        // late fills that landed while the cancel was in flight.
        for _ in 0..16 {
            match self.query_once(client_id).await {
                Ok(Some(order)) => {
                    self.note_success();
                    Self::merge_fills(result, &order);
                    if order.status.is_terminal() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(VenueError::RateLimited { retry_after_ms }) => {
                    self.enter_cooldown(retry_after_ms)
                }
                Err(_) => self.note_error(),
            }
            tokio::time::sleep(Duration::from_secs(self.cfg.order_poll_interval_sec)).await;
        }

        let remaining = (intent.qty - result.filled_qty).max(0.0);
        if remaining <= 1e-12 {
            return self.finalize(result, OrderStatus::Filled).await;
        }

        if self.cfg.market_fallback_enabled
            && remaining <= self.cfg.market_fallback_threshold_pct * intent.qty
        {
            if let Some(report) = self
                .try_market_fallback(intent, result, remaining)
                .await?
            {
                return Ok(report);
            }
        }

        // No fallback: the TIF-driven terminal state stands.
        self.finalize(result, OrderStatus::Expired).await
    }

    /// Submit the MARKET remainder under a fresh correlation suffix. Returns
    /// `None` when the fallback is declined (slippage, no price), in which
    /// case EXPIRED stands.
    async fn try_market_fallback(
        &self,
        intent: &OrderIntent,
        result: &mut OrderResult,
        remaining: f64,
    ) -> Result<Option<ExecutionReport>> {
        let Some(expected) = intent.price else {
            return Ok(None);
        };

        self.wait_cooldown().await;
        let mark = match tokio::time::timeout(
            REQUEST_TIMEOUT,
            self.venue.fetch_mark_price(&intent.symbol),
        )
        .await
        {
            Ok(Ok(m)) => {
                self.note_success();
                m
            }
            _ => {
                self.note_error();
                return Ok(None);
            }
        };

        let slippage = (mark.price - expected).abs() / expected.max(1e-9);
        if self.cfg.market_slippage_cap_pct > 0.0
            && slippage > self.cfg.market_slippage_cap_pct / 100.0
        {
            tracing::warn!(
                correlation_id = %intent.correlation_id,
                slippage_pct = slippage * 100.0,
                "market fallback declined: slippage over cap"
            );
            return Ok(None);
        }

        let fallback_client_id = venue_client_id(&format!("{}-mf1", intent.correlation_id));
        let req = SubmitRequest {
            client_id: fallback_client_id.clone(),
            symbol: intent.symbol.clone(),
            side: intent.side,
            order_type: OrderType::Market,
            qty: remaining,
            price: None,
            tif: intent.tif,
            reduce_only: intent.reduce_only,
        };

        self.wait_cooldown().await;
        match tokio::time::timeout(REQUEST_TIMEOUT, self.venue.submit_order(req)).await {
            Ok(Ok(SubmitOutcome::Submitted { .. })) | Ok(Ok(SubmitOutcome::DuplicateClientId)) => {
                self.note_success();
            }
            _ => {
                self.note_error();
                return Ok(None);
            }
        }

        // Poll the fallback to terminal, then volume-weight its fills in
        // exactly once (the venue reports cumulative quantities).
        let mut fallback_view: Option<VenueOrder> = None;
        for _ in 0..32 {
            tokio::time::sleep(Duration::from_secs(self.cfg.order_poll_interval_sec)).await;
            match self.query_once(&fallback_client_id).await {
                Ok(Some(order)) => {
                    self.note_success();
                    let done = order.status.is_terminal();
                    fallback_view = Some(order);
                    if done {
                        break;
                    }
                }
                Ok(None) => break,
                Err(VenueError::RateLimited { retry_after_ms }) => {
                    self.enter_cooldown(retry_after_ms)
                }
                Err(_) => self.note_error(),
            }
        }

        if let Some(order) = fallback_view {
            if order.filled_qty > 0.0 {
                let prior_notional = result.avg_price.unwrap_or(0.0) * result.filled_qty;
                let fb_notional = order.avg_price.unwrap_or(0.0) * order.filled_qty;
                let total = result.filled_qty + order.filled_qty;
                result.avg_price = Some((prior_notional + fb_notional) / total);
                result.filled_qty = total;
            }
        }

        let final_status = if result.filled_qty >= intent.qty - 1e-12 {
            OrderStatus::Filled
        } else {
            OrderStatus::Expired
        };
        Ok(Some(self.finalize(result, final_status).await?))
    }

    /// Write the single terminal transition for this result.
    async fn finalize(
        &self,
        result: &mut OrderResult,
        status: OrderStatus,
    ) -> Result<ExecutionReport> {
        self.persist(result, status).await?;
        Ok(ExecutionReport {
            result: result.clone(),
            safety_trigger: None,
            suppressed: false,
        })
    }

    // -----------------------------------------------------------------------
    // Venue call wrappers
    // -----------------------------------------------------------------------

    async fn submit_once(
        &self,
        intent: &OrderIntent,
        client_id: &str,
    ) -> Result<SubmitResolution> {
        let req = SubmitRequest {
            client_id: client_id.to_string(),
            symbol: intent.symbol.clone(),
            side: intent.side,
            order_type: intent.order_type,
            qty: intent.qty,
            price: intent.price,
            tif: intent.tif,
            reduce_only: intent.reduce_only,
        };

        let mut transport_attempts = 0u32;
        loop {
            self.wait_cooldown().await;
            match tokio::time::timeout(REQUEST_TIMEOUT, self.venue.submit_order(req.clone())).await
            {
                Ok(Ok(SubmitOutcome::Submitted { exchange_order_id })) => {
                    self.note_success();
                    return Ok(SubmitResolution::Submitted { exchange_order_id });
                }
                Ok(Ok(SubmitOutcome::DuplicateClientId)) => {
                    self.note_success();
                    // Idempotency collision: the existing order is authoritative.
                    match self.query_once(client_id).await {
                        Ok(Some(order)) => return Ok(SubmitResolution::Adopted(order)),
                        Ok(None) | Err(_) => return Ok(SubmitResolution::Unknown),
                    }
                }
                Ok(Ok(SubmitOutcome::Rejected { code, message })) => {
                    self.note_success();
                    return Ok(SubmitResolution::Rejected { code, message });
                }
                Ok(Err(VenueError::RateLimited { retry_after_ms })) => {
                    self.enter_cooldown(retry_after_ms);
                }
                Ok(Err(VenueError::Transport(msg))) if transport_attempts < TRANSPORT_RETRIES => {
                    // The request never left; retrying the same client id is safe.
                    self.note_error();
                    transport_attempts += 1;
                    tracing::warn!(%msg, transport_attempts, "submit transport error, retrying");
                }
                Ok(Err(err)) => {
                    self.note_error();
                    tracing::warn!(%err, "submit outcome unknown");
                    return Ok(SubmitResolution::Unknown);
                }
                Err(_elapsed) => {
                    self.note_error();
                    return Ok(SubmitResolution::Unknown);
                }
            }
        }
    }

    async fn query_once(&self, client_id: &str) -> Result<Option<VenueOrder>, VenueError> {
        self.wait_cooldown().await;
        match tokio::time::timeout(REQUEST_TIMEOUT, self.venue.query_order(client_id)).await {
            Ok(res) => res,
            Err(_elapsed) => Err(VenueError::Timeout),
        }
    }
}
