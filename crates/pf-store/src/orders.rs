//! Intent + result repository and the derived local position view.

use anyhow::{bail, Context, Result};
use pf_schemas::{
    ContractVersion, OrderIntent, OrderResult, OrderStatus, OrderType, Side, TimeInForce,
};
use sqlx::Row;
use std::collections::BTreeMap;

use crate::Store;

/// Derived per-symbol signed quantities.
pub type LocalPositions = BTreeMap<String, f64>;

/// Insert an intent inside the caller's transaction. Insert-or-ignore: the
/// payload of an existing correlation_id is never touched.
pub(crate) async fn insert_intent_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    intent: &OrderIntent,
    created_at_ms: i64,
) -> Result<()> {
    let notes = serde_json::to_string(&intent.risk_notes).context("risk_notes encode failed")?;

    sqlx::query(
        "insert or ignore into order_intents
           (correlation_id, symbol, side, order_type, qty, price, reduce_only, tif,
            is_replay, strategy_version, risk_notes, created_at_ms)
         values (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&intent.correlation_id)
    .bind(&intent.symbol)
    .bind(side_str(intent.side))
    .bind(type_str(intent.order_type))
    .bind(intent.qty)
    .bind(intent.price)
    .bind(intent.reduce_only)
    .bind(tif_str(intent.tif))
    .bind(intent.is_replay)
    .bind(&intent.strategy_version)
    .bind(notes)
    .bind(created_at_ms)
    .execute(&mut **tx)
    .await
    .context("intent insert failed")?;

    Ok(())
}

fn side_str(s: Side) -> &'static str {
    match s {
        Side::Buy => "BUY",
        Side::Sell => "SELL",
    }
}

fn parse_side(s: &str) -> Result<Side> {
    match s {
        "BUY" => Ok(Side::Buy),
        "SELL" => Ok(Side::Sell),
        other => bail!("corrupt side in store: {other}"),
    }
}

fn type_str(t: OrderType) -> &'static str {
    match t {
        OrderType::Limit => "LIMIT",
        OrderType::Market => "MARKET",
    }
}

fn parse_type(s: &str) -> Result<OrderType> {
    match s {
        "LIMIT" => Ok(OrderType::Limit),
        "MARKET" => Ok(OrderType::Market),
        other => bail!("corrupt order type in store: {other}"),
    }
}

fn tif_str(t: TimeInForce) -> &'static str {
    match t {
        TimeInForce::Gtc => "GTC",
        TimeInForce::Ioc => "IOC",
    }
}

fn parse_tif(s: &str) -> Result<TimeInForce> {
    match s {
        "GTC" => Ok(TimeInForce::Gtc),
        "IOC" => Ok(TimeInForce::Ioc),
        other => bail!("corrupt tif in store: {other}"),
    }
}

fn intent_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<OrderIntent> {
    let side: String = row.try_get("side")?;
    let order_type: String = row.try_get("order_type")?;
    let tif: String = row.try_get("tif")?;
    let notes: String = row.try_get("risk_notes")?;

    Ok(OrderIntent {
        correlation_id: row.try_get("correlation_id")?,
        symbol: row.try_get("symbol")?,
        side: parse_side(&side)?,
        order_type: parse_type(&order_type)?,
        qty: row.try_get("qty")?,
        price: row.try_get("price")?,
        reduce_only: row.try_get("reduce_only")?,
        tif: parse_tif(&tif)?,
        is_replay: row.try_get("is_replay")?,
        strategy_version: row.try_get("strategy_version")?,
        risk_notes: serde_json::from_str(&notes).context("risk_notes decode failed")?,
    })
}

fn result_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<OrderResult> {
    let status: String = row.try_get("status")?;
    let status = OrderStatus::parse(&status)
        .ok_or_else(|| anyhow::anyhow!("corrupt status in store: {status}"))?;
    let major: i64 = row.try_get("contract_major")?;
    let minor: i64 = row.try_get("contract_minor")?;

    Ok(OrderResult {
        correlation_id: row.try_get("correlation_id")?,
        exchange_order_id: row.try_get("exchange_order_id")?,
        status,
        filled_qty: row.try_get("filled_qty")?,
        avg_price: row.try_get("avg_price")?,
        error_code: row.try_get("error_code")?,
        error_message: row.try_get("error_message")?,
        contract: ContractVersion {
            major: major as u16,
            minor: minor as u16,
        },
        updated_at_ms: row.try_get("updated_at_ms")?,
    })
}

impl Store {
    pub async fn load_intent(&self, correlation_id: &str) -> Result<Option<OrderIntent>> {
        let row = sqlx::query("select * from order_intents where correlation_id = ?")
            .bind(correlation_id)
            .fetch_optional(self.pool())
            .await
            .context("intent read failed")?;
        row.as_ref().map(intent_from_row).transpose()
    }

    pub async fn load_result(&self, correlation_id: &str) -> Result<Option<OrderResult>> {
        let row = sqlx::query("select * from order_results where correlation_id = ?")
            .bind(correlation_id)
            .fetch_optional(self.pool())
            .await
            .context("result read failed")?;
        row.as_ref().map(result_from_row).transpose()
    }

    /// Upsert an execution result.
    ///
    /// Enforces result monotonicity: once a result is terminal its status can
    /// never change again. When the status transitions, an audit row is
    /// appended in the same transaction if `audit_when` fires for the
    /// (prior, new) pair.
    pub async fn upsert_result<F>(&self, result: &OrderResult, audit_when: F) -> Result<()>
    where
        F: Fn(Option<OrderStatus>, OrderStatus) -> bool,
    {
        let mut tx = self.pool().begin().await.context("upsert_result begin failed")?;

        let prior_row = sqlx::query("select * from order_results where correlation_id = ?")
            .bind(&result.correlation_id)
            .fetch_optional(&mut *tx)
            .await
            .context("result read failed")?;
        let prior = prior_row.as_ref().map(result_from_row).transpose()?;

        let prior_status = prior.as_ref().map(|p| p.status);
        if let Some(p) = &prior {
            if p.status.is_terminal() && p.status != result.status {
                bail!(
                    "RESULT_REGRESSION: {} is terminal ({}) and cannot become {}",
                    result.correlation_id,
                    p.status.as_str(),
                    result.status.as_str()
                );
            }
        }

        sqlx::query(
            "insert into order_results
               (correlation_id, exchange_order_id, status, filled_qty, avg_price,
                error_code, error_message, contract_major, contract_minor, updated_at_ms)
             values (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             on conflict(correlation_id) do update set
               exchange_order_id = excluded.exchange_order_id,
               status = excluded.status,
               filled_qty = excluded.filled_qty,
               avg_price = excluded.avg_price,
               error_code = excluded.error_code,
               error_message = excluded.error_message,
               updated_at_ms = excluded.updated_at_ms",
        )
        .bind(&result.correlation_id)
        .bind(&result.exchange_order_id)
        .bind(result.status.as_str())
        .bind(result.filled_qty)
        .bind(result.avg_price)
        .bind(&result.error_code)
        .bind(&result.error_message)
        .bind(result.contract.major as i64)
        .bind(result.contract.minor as i64)
        .bind(result.updated_at_ms)
        .execute(&mut *tx)
        .await
        .context("result write failed")?;

        if prior_status != Some(result.status) && audit_when(prior_status, result.status) {
            sqlx::query(
                "insert into audit_log
                   (category, entity_id, from_state, to_state, reason_code, reason_message,
                    timestamp_ms, metadata)
                 values ('order_result', ?, ?, ?, 'NONE', '', ?, 'null')",
            )
            .bind(&result.correlation_id)
            .bind(prior_status.map(|s| s.as_str()).unwrap_or(""))
            .bind(result.status.as_str())
            .bind(result.updated_at_ms)
            .execute(&mut *tx)
            .await
            .context("result audit append failed")?;
        }

        tx.commit().await.context("upsert_result commit failed")?;
        Ok(())
    }

    /// Intents whose results are absent or non-terminal — the restart
    /// recovery set.
    pub async fn load_open_orders(&self) -> Result<Vec<(OrderIntent, Option<OrderResult>)>> {
        let rows = sqlx::query(
            "select i.correlation_id as cid from order_intents i
             left join order_results r on r.correlation_id = i.correlation_id
             where r.correlation_id is null
                or r.status in ('PENDING', 'SUBMITTED', 'PARTIALLY_FILLED', 'UNKNOWN')
             order by i.created_at_ms asc",
        )
        .fetch_all(self.pool())
        .await
        .context("open order scan failed")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let cid: String = row.try_get("cid")?;
            let intent = self
                .load_intent(&cid)
                .await?
                .ok_or_else(|| anyhow::anyhow!("intent vanished: {cid}"))?;
            let result = self.load_result(&cid).await?;
            out.push((intent, result));
        }
        Ok(out)
    }

    /// Derive local signed positions for the given symbols by joining intents
    /// with results.
    ///
    /// Contribution per intent:
    /// - terminal result: `side_sign × min(intent.qty, filled_qty)`
    /// - working result (SUBMITTED / PARTIALLY_FILLED / UNKNOWN): the full
    ///   signed intent qty — the order is live on the venue and its unfilled
    ///   remainder is committed exposure
    /// - PENDING result: signed filled qty only (nothing is on the venue yet)
    /// - no result row: nothing
    pub async fn derive_local_positions(&self, symbols: &[String]) -> Result<LocalPositions> {
        let mut positions: LocalPositions =
            symbols.iter().map(|s| (s.clone(), 0.0)).collect();

        if symbols.is_empty() {
            return Ok(positions);
        }

        let placeholders = vec!["?"; symbols.len()].join(", ");
        let sql = format!(
            "select i.symbol as symbol, i.side as side, i.qty as qty,
                    r.status as status, r.filled_qty as filled_qty
             from order_intents i
             join order_results r on r.correlation_id = i.correlation_id
             where i.symbol in ({placeholders})"
        );

        let mut query = sqlx::query(&sql);
        for s in symbols {
            query = query.bind(s);
        }
        let rows = query
            .fetch_all(self.pool())
            .await
            .context("position derivation query failed")?;

        for row in rows {
            let symbol: String = row.try_get("symbol")?;
            let side: String = row.try_get("side")?;
            let qty: f64 = row.try_get("qty")?;
            let status: String = row.try_get("status")?;
            let filled: f64 = row.try_get("filled_qty")?;

            let sign = parse_side(&side)?.sign();
            let status = OrderStatus::parse(&status)
                .ok_or_else(|| anyhow::anyhow!("corrupt status in store: {status}"))?;

            let contribution = if status.is_terminal() {
                sign * qty.min(filled)
            } else if matches!(
                status,
                OrderStatus::Submitted | OrderStatus::PartiallyFilled | OrderStatus::Unknown
            ) {
                sign * qty
            } else {
                sign * filled
            };

            *positions.entry(symbol).or_insert(0.0) += contribution;
        }

        Ok(positions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pf_schemas::{Cursor, DedupKey, DedupRecord, EventKey, CONTRACT_VERSION};

    fn intent(cid: &str, symbol: &str, side: Side, qty: f64) -> OrderIntent {
        OrderIntent {
            correlation_id: cid.to_string(),
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Limit,
            qty,
            price: Some(100.0),
            reduce_only: false,
            tif: TimeInForce::Gtc,
            is_replay: false,
            strategy_version: "copy-1".to_string(),
            risk_notes: vec![],
        }
    }

    fn result(cid: &str, status: OrderStatus, filled: f64) -> OrderResult {
        OrderResult {
            correlation_id: cid.to_string(),
            exchange_order_id: Some(format!("x-{cid}")),
            status,
            filled_qty: filled,
            avg_price: Some(100.0),
            error_code: None,
            error_message: None,
            contract: CONTRACT_VERSION,
            updated_at_ms: 1,
        }
    }

    async fn store_with_intent(items: &[(OrderIntent, Option<OrderResult>)]) -> Store {
        let (store, _) = Store::open("sqlite::memory:").await.unwrap();
        for (i, (intent, result)) in items.iter().enumerate() {
            let dedup = DedupRecord {
                key: DedupKey {
                    tx_hash: format!("0x{i}"),
                    event_index: 0,
                    symbol: intent.symbol.clone(),
                },
                timestamp_ms: 1000 + i as i64,
                is_replay: false,
                created_at_ms: 1000 + i as i64,
            };
            let cursor = Cursor::empty().advanced_to(
                &EventKey {
                    timestamp_ms: dedup.timestamp_ms,
                    event_index: 0,
                    tx_hash: dedup.key.tx_hash.clone(),
                    symbol: intent.symbol.clone(),
                },
                dedup.timestamp_ms,
            );
            store
                .record_event(&dedup, &cursor, std::slice::from_ref(intent))
                .await
                .unwrap();
            if let Some(r) = result {
                store.upsert_result(r, |_, _| false).await.unwrap();
            }
        }
        store
    }

    #[tokio::test]
    async fn intent_insert_is_insert_or_ignore() {
        let store = store_with_intent(&[(intent("c1", "BTCUSDT", Side::Buy, 1.0), None)]).await;

        // A second insert under the same correlation_id must not change the payload.
        let mut tx = store.pool().begin().await.unwrap();
        let mut changed = intent("c1", "BTCUSDT", Side::Sell, 9.0);
        changed.reduce_only = true;
        insert_intent_tx(&mut tx, &changed, 2000).await.unwrap();
        tx.commit().await.unwrap();

        let stored = store.load_intent("c1").await.unwrap().unwrap();
        assert_eq!(stored.side, Side::Buy);
        assert_eq!(stored.qty, 1.0);
        assert!(!stored.reduce_only);
    }

    #[tokio::test]
    async fn terminal_results_never_regress() {
        let store = store_with_intent(&[(
            intent("c1", "BTCUSDT", Side::Buy, 1.0),
            Some(result("c1", OrderStatus::Filled, 1.0)),
        )])
        .await;

        let err = store
            .upsert_result(&result("c1", OrderStatus::Pending, 0.0), |_, _| false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("RESULT_REGRESSION"));

        // Same terminal status again is fine (idempotent re-apply).
        store
            .upsert_result(&result("c1", OrderStatus::Filled, 1.0), |_, _| false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn status_transition_audited_when_predicate_fires() {
        let store = store_with_intent(&[(intent("c1", "BTCUSDT", Side::Buy, 1.0), None)]).await;

        store
            .upsert_result(&result("c1", OrderStatus::Submitted, 0.0), |_, _| true)
            .await
            .unwrap();
        store
            .upsert_result(&result("c1", OrderStatus::Filled, 1.0), |_, _| true)
            .await
            .unwrap();
        // No status change → no audit row regardless of predicate.
        store
            .upsert_result(&result("c1", OrderStatus::Filled, 1.0), |_, _| true)
            .await
            .unwrap();

        let (n,): (i64,) =
            sqlx::query_as("select count(*) from audit_log where category = 'order_result'")
                .fetch_one(store.pool())
                .await
                .unwrap();
        assert_eq!(n, 2);
    }

    #[tokio::test]
    async fn derived_positions_join_intents_with_results() {
        let store = store_with_intent(&[
            // Filled buy of 1.0 → +1.0
            (
                intent("c1", "BTCUSDT", Side::Buy, 1.0),
                Some(result("c1", OrderStatus::Filled, 1.0)),
            ),
            // Working sell of 0.4 → -0.4 (live exposure counts in full)
            (
                intent("c2", "BTCUSDT", Side::Sell, 0.4),
                Some(result("c2", OrderStatus::PartiallyFilled, 0.1)),
            ),
            // Canceled buy that filled 0.2 before the cancel → +0.2
            (
                intent("c3", "BTCUSDT", Side::Buy, 0.5),
                Some(result("c3", OrderStatus::Canceled, 0.2)),
            ),
            // Intent with no result → contributes nothing
            (intent("c4", "BTCUSDT", Side::Buy, 3.0), None),
            // Different symbol
            (
                intent("c5", "ETHUSDT", Side::Sell, 2.0),
                Some(result("c5", OrderStatus::Filled, 2.0)),
            ),
        ])
        .await;

        let pos = store
            .derive_local_positions(&["BTCUSDT".to_string(), "ETHUSDT".to_string()])
            .await
            .unwrap();

        let btc = pos["BTCUSDT"];
        assert!((btc - (1.0 - 0.4 + 0.2)).abs() < 1e-9, "got {btc}");
        let eth = pos["ETHUSDT"];
        assert!((eth - (-2.0)).abs() < 1e-9, "got {eth}");
    }

    #[tokio::test]
    async fn open_orders_are_the_recovery_set() {
        let store = store_with_intent(&[
            (
                intent("c1", "BTCUSDT", Side::Buy, 1.0),
                Some(result("c1", OrderStatus::Filled, 1.0)),
            ),
            (
                intent("c2", "BTCUSDT", Side::Buy, 1.0),
                Some(result("c2", OrderStatus::Unknown, 0.0)),
            ),
            (intent("c3", "BTCUSDT", Side::Buy, 1.0), None),
        ])
        .await;

        let open = store.load_open_orders().await.unwrap();
        let ids: Vec<&str> = open.iter().map(|(i, _)| i.correlation_id.as_str()).collect();
        assert_eq!(ids, vec!["c2", "c3"]);
    }
}
