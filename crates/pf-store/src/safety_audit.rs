//! Safety-state singleton, audit log, and operator baselines.
//!
//! Every safety transition appends its audit row *in the same transaction*
//! that changes the stored mode, so the audit log is a strict superset of
//! externally visible state changes.

use anyhow::{Context, Result};
use pf_schemas::{AuditRecord, Baseline, ReasonCode, SafetyMode, SafetyState};
use sqlx::Row;

use crate::Store;

impl Store {
    /// Load the safety singleton; `None` if no state was ever persisted.
    pub async fn load_safety(&self) -> Result<Option<SafetyState>> {
        let row = sqlx::query(
            "select mode, reason_code, reason_message, changed_at_ms from safety_state where id = 1",
        )
        .fetch_optional(self.pool())
        .await
        .context("safety read failed")?;

        let Some(row) = row else { return Ok(None) };

        let mode: String = row.try_get("mode")?;
        let reason: String = row.try_get("reason_code")?;
        Ok(Some(SafetyState {
            mode: SafetyMode::parse(&mode)
                .ok_or_else(|| anyhow::anyhow!("corrupt safety mode in store: {mode}"))?,
            reason_code: ReasonCode::parse(&reason)
                .ok_or_else(|| anyhow::anyhow!("corrupt reason code in store: {reason}"))?,
            reason_message: row.try_get("reason_message")?,
            changed_at_ms: row.try_get("changed_at_ms")?,
        }))
    }

    /// Persist a safety transition: audit row first, then the singleton and
    /// its `system_state` mirror, all in one transaction.
    pub async fn save_safety(&self, prior: Option<&SafetyState>, next: &SafetyState) -> Result<()> {
        let mut tx = self.pool().begin().await.context("save_safety begin failed")?;

        let from = prior.map(|p| p.mode.as_str()).unwrap_or("");
        sqlx::query(
            "insert into audit_log
               (category, entity_id, from_state, to_state, reason_code, reason_message,
                timestamp_ms, metadata)
             values ('safety', 'safety_state', ?, ?, ?, ?, ?, 'null')",
        )
        .bind(from)
        .bind(next.mode.as_str())
        .bind(next.reason_code.as_str())
        .bind(&next.reason_message)
        .bind(next.changed_at_ms)
        .execute(&mut *tx)
        .await
        .context("safety audit append failed")?;

        sqlx::query(
            "insert into safety_state (id, mode, reason_code, reason_message, changed_at_ms)
             values (1, ?, ?, ?, ?)
             on conflict(id) do update set
               mode = excluded.mode,
               reason_code = excluded.reason_code,
               reason_message = excluded.reason_message,
               changed_at_ms = excluded.changed_at_ms",
        )
        .bind(next.mode.as_str())
        .bind(next.reason_code.as_str())
        .bind(&next.reason_message)
        .bind(next.changed_at_ms)
        .execute(&mut *tx)
        .await
        .context("safety write failed")?;

        for (key, value) in [
            (crate::keys::SAFETY_MODE, next.mode.as_str().to_string()),
            (
                crate::keys::SAFETY_REASON_CODE,
                next.reason_code.as_str().to_string(),
            ),
            (
                crate::keys::SAFETY_REASON_MESSAGE,
                next.reason_message.clone(),
            ),
        ] {
            sqlx::query(
                "insert into system_state (key, value) values (?, ?)
                 on conflict(key) do update set value = excluded.value",
            )
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await
            .context("safety system_state mirror failed")?;
        }

        tx.commit().await.context("save_safety commit failed")?;
        Ok(())
    }

    /// Append one audit row.
    pub async fn append_audit(&self, rec: &AuditRecord) -> Result<()> {
        let metadata = serde_json::to_string(&rec.metadata).context("metadata encode failed")?;
        sqlx::query(
            "insert into audit_log
               (category, entity_id, from_state, to_state, reason_code, reason_message,
                timestamp_ms, metadata)
             values (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&rec.category)
        .bind(&rec.entity_id)
        .bind(&rec.from_state)
        .bind(&rec.to_state)
        .bind(rec.reason_code.as_str())
        .bind(&rec.reason_message)
        .bind(rec.timestamp_ms)
        .bind(metadata)
        .execute(self.pool())
        .await
        .context("audit append failed")?;
        Ok(())
    }

    /// Number of audit rows in a category. Test/inspection helper.
    pub async fn audit_count(&self, category: &str) -> Result<i64> {
        let (n,): (i64,) = sqlx::query_as("select count(*) from audit_log where category = ?")
            .bind(category)
            .fetch_one(self.pool())
            .await
            .context("audit count failed")?;
        Ok(n)
    }

    // -----------------------------------------------------------------------
    // Baselines
    // -----------------------------------------------------------------------

    /// Install a baseline snapshot and activate it, deactivating all others.
    pub async fn install_baseline(&self, baseline_id: &str, rows: &[Baseline]) -> Result<()> {
        let mut tx = self.pool().begin().await.context("baseline begin failed")?;

        sqlx::query("update baselines set active = 0")
            .execute(&mut *tx)
            .await
            .context("baseline deactivate failed")?;

        for b in rows {
            sqlx::query(
                "insert into baselines (baseline_id, symbol, qty, active) values (?, ?, ?, 1)
                 on conflict(baseline_id, symbol) do update set qty = excluded.qty, active = 1",
            )
            .bind(baseline_id)
            .bind(&b.symbol)
            .bind(b.qty)
            .execute(&mut *tx)
            .await
            .context("baseline insert failed")?;
        }

        tx.commit().await.context("baseline commit failed")?;
        Ok(())
    }

    /// The active baseline rows, empty if none installed.
    pub async fn active_baseline(&self) -> Result<Vec<Baseline>> {
        let rows = sqlx::query(
            "select baseline_id, symbol, qty, active from baselines where active = 1
             order by symbol asc",
        )
        .fetch_all(self.pool())
        .await
        .context("baseline read failed")?;

        rows.iter()
            .map(|row| {
                Ok(Baseline {
                    baseline_id: row.try_get("baseline_id")?,
                    symbol: row.try_get("symbol")?,
                    qty: row.try_get("qty")?,
                    active: row.try_get("active")?,
                })
            })
            .collect()
    }
}
