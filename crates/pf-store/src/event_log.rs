//! Dedup + cursor repository.
//!
//! An event counts as *processed* iff its dedup insert, the cursor advance,
//! and any resulting intent inserts commit in one transaction. A duplicate
//! primary key rolls the whole transaction back, leaving the cursor exactly
//! where it was.

use anyhow::{Context, Result};
use pf_schemas::{Cursor, DedupRecord, EventKey, OrderIntent};
use sqlx::Row;

use crate::orders::insert_intent_tx;
use crate::Store;

/// Result of [`Store::record_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// The event was new: dedup marker, cursor, and intents are committed.
    Inserted,
    /// The dedup key already existed: nothing changed.
    Duplicate,
}

impl Store {
    /// Atomically mark an event processed, advance the cursor, and persist
    /// the intents decided for it.
    pub async fn record_event(
        &self,
        dedup: &DedupRecord,
        cursor: &Cursor,
        intents: &[OrderIntent],
    ) -> Result<RecordOutcome> {
        let mut tx = self.pool().begin().await.context("record_event begin failed")?;

        let inserted = sqlx::query(
            "insert or ignore into processed_events
               (tx_hash, event_index, symbol, timestamp_ms, is_replay, created_at_ms)
             values (?, ?, ?, ?, ?, ?)",
        )
        .bind(&dedup.key.tx_hash)
        .bind(dedup.key.event_index as i64)
        .bind(&dedup.key.symbol)
        .bind(dedup.timestamp_ms)
        .bind(dedup.is_replay)
        .bind(dedup.created_at_ms)
        .execute(&mut *tx)
        .await
        .context("dedup insert failed")?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await.context("record_event rollback failed")?;
            return Ok(RecordOutcome::Duplicate);
        }

        write_cursor_tx(&mut tx, cursor).await?;

        for intent in intents {
            insert_intent_tx(&mut tx, intent, dedup.created_at_ms).await?;
        }

        tx.commit().await.context("record_event commit failed")?;
        Ok(RecordOutcome::Inserted)
    }

    /// Load the cursor singleton, or the empty cursor if none was persisted.
    pub async fn load_cursor(&self) -> Result<Cursor> {
        let row = sqlx::query(
            "select last_processed_timestamp_ms, last_processed_event_key, last_ingest_success_ms
             from cursor where id = 1",
        )
        .fetch_optional(self.pool())
        .await
        .context("cursor read failed")?;

        let Some(row) = row else {
            return Ok(Cursor::empty());
        };

        let key: Option<String> = row.try_get("last_processed_event_key")?;
        Ok(Cursor {
            last_processed_timestamp_ms: row.try_get("last_processed_timestamp_ms")?,
            last_processed_event_key: key.as_deref().and_then(EventKey::decode),
            last_ingest_success_ms: row.try_get("last_ingest_success_ms")?,
        })
    }

    /// Record source liveness without advancing progress: updates only
    /// `last_ingest_success_ms` (a quiet leader is not an outage).
    pub async fn touch_ingest_success(&self, now_ms: i64) -> Result<()> {
        let current = self.load_cursor().await?;
        let cursor = Cursor {
            last_ingest_success_ms: now_ms,
            ..current
        };
        let mut tx = self.pool().begin().await?;
        write_cursor_tx(&mut tx, &cursor).await?;
        tx.commit().await.context("touch_ingest_success commit failed")?;
        Ok(())
    }

    /// Overwrite the cursor outside the record_event path. Used only by the
    /// maintenance-skip bypass, which must also write its own audit record.
    pub async fn force_cursor(&self, cursor: &Cursor) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        write_cursor_tx(&mut tx, cursor).await?;
        tx.commit().await.context("force_cursor commit failed")?;
        Ok(())
    }

    /// Delete dedup markers older than `before_ms`. Returns rows removed.
    pub async fn sweep_dedup(&self, before_ms: i64) -> Result<u64> {
        let res = sqlx::query("delete from processed_events where created_at_ms < ?")
            .bind(before_ms)
            .execute(self.pool())
            .await
            .context("dedup sweep failed")?;
        Ok(res.rows_affected())
    }

    /// Count of dedup markers currently held. Test/inspection helper.
    pub async fn dedup_len(&self) -> Result<i64> {
        let (n,): (i64,) = sqlx::query_as("select count(*) from processed_events")
            .fetch_one(self.pool())
            .await
            .context("dedup count failed")?;
        Ok(n)
    }
}

/// Upsert the cursor singleton and mirror its fields into `system_state`
/// inside the caller's transaction.
async fn write_cursor_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    cursor: &Cursor,
) -> Result<()> {
    let key_str = cursor
        .last_processed_event_key
        .as_ref()
        .map(|k| k.encode());

    sqlx::query(
        "insert into cursor (id, last_processed_timestamp_ms, last_processed_event_key, last_ingest_success_ms)
         values (1, ?, ?, ?)
         on conflict(id) do update set
           last_processed_timestamp_ms = excluded.last_processed_timestamp_ms,
           last_processed_event_key = excluded.last_processed_event_key,
           last_ingest_success_ms = excluded.last_ingest_success_ms",
    )
    .bind(cursor.last_processed_timestamp_ms)
    .bind(&key_str)
    .bind(cursor.last_ingest_success_ms)
    .execute(&mut **tx)
    .await
    .context("cursor write failed")?;

    for (key, value) in [
        (
            crate::keys::LAST_PROCESSED_TIMESTAMP_MS,
            cursor.last_processed_timestamp_ms.to_string(),
        ),
        (
            crate::keys::LAST_PROCESSED_EVENT_KEY,
            key_str.unwrap_or_default(),
        ),
        (
            crate::keys::LAST_INGEST_SUCCESS_MS,
            cursor.last_ingest_success_ms.to_string(),
        ),
    ] {
        sqlx::query(
            "insert into system_state (key, value) values (?, ?)
             on conflict(key) do update set value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&mut **tx)
        .await
        .context("system_state mirror failed")?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pf_schemas::DedupKey;

    fn dedup(tx_hash: &str, idx: u64, symbol: &str, ts: i64) -> DedupRecord {
        DedupRecord {
            key: DedupKey {
                tx_hash: tx_hash.to_string(),
                event_index: idx,
                symbol: symbol.to_string(),
            },
            timestamp_ms: ts,
            is_replay: false,
            created_at_ms: ts + 10,
        }
    }

    fn cursor_at(ts: i64, tx_hash: &str, idx: u64, symbol: &str) -> Cursor {
        Cursor::empty().advanced_to(
            &EventKey {
                timestamp_ms: ts,
                event_index: idx,
                tx_hash: tx_hash.to_string(),
                symbol: symbol.to_string(),
            },
            ts + 10,
        )
    }

    #[tokio::test]
    async fn first_insert_then_duplicate() {
        let (store, _) = Store::open("sqlite::memory:").await.unwrap();
        let d = dedup("0xabc", 0, "BTCUSDT", 1000);
        let c = cursor_at(1000, "0xabc", 0, "BTCUSDT");

        let out = store.record_event(&d, &c, &[]).await.unwrap();
        assert_eq!(out, RecordOutcome::Inserted);

        let later = cursor_at(2000, "0xdef", 0, "BTCUSDT");
        let out = store.record_event(&d, &later, &[]).await.unwrap();
        assert_eq!(out, RecordOutcome::Duplicate);

        // Duplicate must not advance the cursor.
        let loaded = store.load_cursor().await.unwrap();
        assert_eq!(loaded.last_processed_timestamp_ms, 1000);
    }

    #[tokio::test]
    async fn cursor_mirrors_system_state() {
        let (store, _) = Store::open("sqlite::memory:").await.unwrap();
        let d = dedup("0xabc", 1, "ETHUSDT", 5000);
        let c = cursor_at(5000, "0xabc", 1, "ETHUSDT");
        store.record_event(&d, &c, &[]).await.unwrap();

        assert_eq!(
            store
                .get_system_state(crate::keys::LAST_PROCESSED_TIMESTAMP_MS)
                .await
                .unwrap(),
            Some("5000".to_string())
        );
        assert_eq!(
            store
                .get_system_state(crate::keys::LAST_PROCESSED_EVENT_KEY)
                .await
                .unwrap(),
            Some("5000:1:0xabc:ETHUSDT".to_string())
        );
    }

    #[tokio::test]
    async fn touch_ingest_success_leaves_progress_alone() {
        let (store, _) = Store::open("sqlite::memory:").await.unwrap();
        let d = dedup("0xabc", 0, "BTCUSDT", 1000);
        let c = cursor_at(1000, "0xabc", 0, "BTCUSDT");
        store.record_event(&d, &c, &[]).await.unwrap();

        store.touch_ingest_success(9999).await.unwrap();
        let loaded = store.load_cursor().await.unwrap();
        assert_eq!(loaded.last_processed_timestamp_ms, 1000);
        assert_eq!(loaded.last_ingest_success_ms, 9999);
    }

    #[tokio::test]
    async fn sweep_removes_only_old_markers() {
        let (store, _) = Store::open("sqlite::memory:").await.unwrap();
        for (i, ts) in [(0u64, 1000i64), (1, 2000), (2, 3000)] {
            let mut d = dedup("0xabc", i, "BTCUSDT", ts - 10);
            d.created_at_ms = ts;
            let c = cursor_at(ts, "0xabc", i, "BTCUSDT");
            store.record_event(&d, &c, &[]).await.unwrap();
        }

        let removed = store.sweep_dedup(2500).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.dedup_len().await.unwrap(), 1);
    }
}
