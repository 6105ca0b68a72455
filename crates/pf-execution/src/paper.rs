//! Deterministic in-memory paper venue.
//!
//! Used by dry-run / backfill-only modes and by tests. Design rules, kept
//! deliberately strict so runs are reproducible:
//!
//! - `exchange_order_id` is `"paper:{client_id}"` — a stable string derived
//!   from the request, never a counter or RNG.
//! - No wall clock: timestamps come from the values the caller scripts.
//! - Fills are not invented. Orders fill according to the scripted plan
//!   (`script_fill`); without a script, submits rest SUBMITTED until filled
//!   or canceled. `fill_immediately(true)` switches to the dry-run default
//!   where every order fills at its limit (or scripted mark) price on the
//!   first poll.
//! - Duplicate client ids are detected exactly like a real venue would.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use pf_schemas::{OrderStatus, OrderType, PricePoint, SymbolFilters};

use crate::venue::{
    CancelOutcome, PositionsSnapshot, SubmitOutcome, SubmitRequest, VenueAdapter, VenueError,
    VenueOrder,
};

#[derive(Debug, Clone)]
struct PaperOrder {
    request: SubmitRequest,
    status: OrderStatus,
    filled_qty: f64,
    avg_price: Option<f64>,
}

#[derive(Debug, Default)]
struct Inner {
    orders: BTreeMap<String, PaperOrder>,
    /// client_id → fills to apply on subsequent polls: (qty, price).
    fill_scripts: BTreeMap<String, Vec<(f64, f64)>>,
    positions: BTreeMap<String, f64>,
    marks: BTreeMap<String, PricePoint>,
    filters: BTreeMap<String, SymbolFilters>,
    /// Scripted errors served before the next successful call, per method.
    query_faults: Vec<VenueError>,
    submit_faults: Vec<VenueError>,
    fill_immediately: bool,
    now_ms: i64,
}

/// Deterministic paper venue.
#[derive(Debug, Default)]
pub struct PaperVenue {
    inner: Mutex<Inner>,
}

impl PaperVenue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dry-run behavior: every order fills fully at its limit (or mark)
    /// price on the first poll after submission.
    pub fn fill_immediately(&self, on: bool) {
        self.inner.lock().unwrap().fill_immediately = on;
    }

    /// Script the next fills for a client id, applied one per poll.
    pub fn script_fill(&self, client_id: &str, qty: f64, price: f64) {
        self.inner
            .lock()
            .unwrap()
            .fill_scripts
            .entry(client_id.to_string())
            .or_default()
            .push((qty, price));
    }

    /// Queue an error to be served by the next `query_order` call(s).
    pub fn script_query_fault(&self, err: VenueError) {
        self.inner.lock().unwrap().query_faults.push(err);
    }

    /// Queue an error to be served by the next `submit_order` call(s).
    pub fn script_submit_fault(&self, err: VenueError) {
        self.inner.lock().unwrap().submit_faults.push(err);
    }

    pub fn set_position(&self, symbol: &str, qty: f64) {
        self.inner
            .lock()
            .unwrap()
            .positions
            .insert(symbol.to_string(), qty);
    }

    pub fn set_mark(&self, symbol: &str, price: f64, timestamp_ms: i64) {
        self.inner.lock().unwrap().marks.insert(
            symbol.to_string(),
            PricePoint {
                price,
                timestamp_ms,
            },
        );
    }

    pub fn set_filters(&self, symbol: &str, filters: SymbolFilters) {
        self.inner
            .lock()
            .unwrap()
            .filters
            .insert(symbol.to_string(), filters);
    }

    pub fn set_now_ms(&self, now_ms: i64) {
        self.inner.lock().unwrap().now_ms = now_ms;
    }

    /// Orders currently resting (non-terminal). Inspection helper.
    pub fn open_order_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .orders
            .values()
            .filter(|o| !o.status.is_terminal())
            .count()
    }

    /// Total submit calls observed for assertions on suppression.
    pub fn order_count(&self) -> usize {
        self.inner.lock().unwrap().orders.len()
    }

    fn apply_pending_fill(inner: &mut Inner, client_id: &str) {
        let Some(order) = inner.orders.get_mut(client_id) else {
            return;
        };
        if order.status.is_terminal() {
            return;
        }

        let scripted = inner
            .fill_scripts
            .get_mut(client_id)
            .and_then(|fills| if fills.is_empty() { None } else { Some(fills.remove(0)) });

        let fill = match scripted {
            Some(f) => Some(f),
            None if inner.fill_immediately => {
                let price = order
                    .request
                    .price
                    .or_else(|| inner.marks.get(&order.request.symbol).map(|m| m.price));
                price.map(|p| (order.request.qty - order.filled_qty, p))
            }
            None => None,
        };

        if let Some((qty, price)) = fill {
            let qty = qty.min(order.request.qty - order.filled_qty);
            if qty <= 0.0 {
                return;
            }
            let prior_notional = order.avg_price.unwrap_or(0.0) * order.filled_qty;
            order.filled_qty += qty;
            order.avg_price = Some((prior_notional + price * qty) / order.filled_qty);
            order.status = if order.filled_qty >= order.request.qty - 1e-12 {
                OrderStatus::Filled
            } else {
                OrderStatus::PartiallyFilled
            };
        }
    }
}

#[async_trait]
impl VenueAdapter for PaperVenue {
    async fn submit_order(&self, req: SubmitRequest) -> Result<SubmitOutcome, VenueError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.submit_faults.is_empty() {
            return Err(inner.submit_faults.remove(0));
        }

        if inner.orders.contains_key(&req.client_id) {
            return Ok(SubmitOutcome::DuplicateClientId);
        }

        let exchange_order_id = format!("paper:{}", req.client_id);
        inner.orders.insert(
            req.client_id.clone(),
            PaperOrder {
                request: req,
                status: OrderStatus::Submitted,
                filled_qty: 0.0,
                avg_price: None,
            },
        );

        Ok(SubmitOutcome::Submitted { exchange_order_id })
    }

    async fn query_order(&self, client_id: &str) -> Result<Option<VenueOrder>, VenueError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.query_faults.is_empty() {
            return Err(inner.query_faults.remove(0));
        }

        Self::apply_pending_fill(&mut inner, client_id);

        Ok(inner.orders.get(client_id).map(|o| VenueOrder {
            exchange_order_id: Some(format!("paper:{client_id}")),
            status: o.status,
            filled_qty: o.filled_qty,
            avg_price: o.avg_price,
            error_code: None,
            error_message: None,
        }))
    }

    async fn cancel_order(&self, client_id: &str) -> Result<CancelOutcome, VenueError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.orders.get_mut(client_id) {
            Some(order) if !order.status.is_terminal() => {
                order.status = OrderStatus::Canceled;
                Ok(CancelOutcome::Ok)
            }
            Some(_) => Ok(CancelOutcome::Ok),
            None => Ok(CancelOutcome::NotFound),
        }
    }

    async fn fetch_positions(&self, symbols: &[String]) -> Result<PositionsSnapshot, VenueError> {
        let inner = self.inner.lock().unwrap();
        let positions = symbols
            .iter()
            .filter_map(|s| inner.positions.get(s).map(|q| (s.clone(), *q)))
            .collect();
        Ok(PositionsSnapshot {
            positions,
            fetched_at_ms: inner.now_ms,
        })
    }

    async fn fetch_mark_price(&self, symbol: &str) -> Result<PricePoint, VenueError> {
        self.inner
            .lock()
            .unwrap()
            .marks
            .get(symbol)
            .copied()
            .ok_or_else(|| VenueError::Api {
                code: None,
                message: format!("no mark price for {symbol}"),
            })
    }

    async fn fetch_filters(&self, symbol: &str) -> Result<SymbolFilters, VenueError> {
        self.inner
            .lock()
            .unwrap()
            .filters
            .get(symbol)
            .copied()
            .ok_or_else(|| VenueError::Api {
                code: None,
                message: format!("no filters for {symbol}"),
            })
    }

    async fn server_time(&self) -> Result<i64, VenueError> {
        Ok(self.inner.lock().unwrap().now_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pf_schemas::{OrderType, Side, TimeInForce};

    fn req(client_id: &str, qty: f64) -> SubmitRequest {
        SubmitRequest {
            client_id: client_id.to_string(),
            symbol: "BTCUSDT".to_string(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            qty,
            price: Some(50_000.0),
            tif: TimeInForce::Gtc,
            reduce_only: false,
        }
    }

    #[tokio::test]
    async fn duplicate_client_id_detected() {
        let venue = PaperVenue::new();
        let first = venue.submit_order(req("c1", 1.0)).await.unwrap();
        assert!(matches!(first, SubmitOutcome::Submitted { .. }));
        let second = venue.submit_order(req("c1", 1.0)).await.unwrap();
        assert_eq!(second, SubmitOutcome::DuplicateClientId);
    }

    #[tokio::test]
    async fn scripted_fills_apply_one_per_poll() {
        let venue = PaperVenue::new();
        venue.submit_order(req("c1", 1.0)).await.unwrap();
        venue.script_fill("c1", 0.6, 50_000.0);
        venue.script_fill("c1", 0.4, 50_100.0);

        let o = venue.query_order("c1").await.unwrap().unwrap();
        assert_eq!(o.status, OrderStatus::PartiallyFilled);
        assert!((o.filled_qty - 0.6).abs() < 1e-12);

        let o = venue.query_order("c1").await.unwrap().unwrap();
        assert_eq!(o.status, OrderStatus::Filled);
        assert!((o.filled_qty - 1.0).abs() < 1e-12);
        // VWAP of 0.6@50000 + 0.4@50100.
        assert!((o.avg_price.unwrap() - 50_040.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn unscripted_orders_rest_until_canceled() {
        let venue = PaperVenue::new();
        venue.submit_order(req("c1", 1.0)).await.unwrap();
        let o = venue.query_order("c1").await.unwrap().unwrap();
        assert_eq!(o.status, OrderStatus::Submitted);

        assert_eq!(venue.cancel_order("c1").await.unwrap(), CancelOutcome::Ok);
        let o = venue.query_order("c1").await.unwrap().unwrap();
        assert_eq!(o.status, OrderStatus::Canceled);

        assert_eq!(
            venue.cancel_order("missing").await.unwrap(),
            CancelOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn fill_immediately_uses_limit_price() {
        let venue = PaperVenue::new();
        venue.fill_immediately(true);
        venue.submit_order(req("c1", 2.0)).await.unwrap();
        let o = venue.query_order("c1").await.unwrap().unwrap();
        assert_eq!(o.status, OrderStatus::Filled);
        assert_eq!(o.avg_price, Some(50_000.0));
    }

    #[tokio::test]
    async fn scripted_faults_serve_in_order() {
        let venue = PaperVenue::new();
        venue.submit_order(req("c1", 1.0)).await.unwrap();
        venue.script_query_fault(VenueError::Timeout);
        assert!(venue.query_order("c1").await.is_err());
        assert!(venue.query_order("c1").await.is_ok());
    }
}
