//! Ingest engine: backfill windows, cursor discipline, gap guard, and the
//! per-event atomic commit that hands intents downstream.
//!
//! # Invariants
//!
//! - The cursor only advances inside `Store::record_event`, together with the
//!   dedup marker and the intents decided for the event (one transaction).
//! - Events at or below the persisted composite key are never re-processed;
//!   exact duplicates fall out of the dedup table, older strangers are
//!   skipped with a counter.
//! - A quiet leader is not an outage: liveness (`last_ingest_success_ms`)
//!   and progress (`last_processed_timestamp_ms`) are separate clocks, and
//!   only a dead *source* can exceed the backfill window.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use pf_schemas::{
    AuditRecord, Cursor, DedupKey, DedupRecord, Fill, OrderIntent, PositionDeltaEvent, ReasonCode,
};
use pf_store::{RecordOutcome, Store};
use tokio::sync::{mpsc, watch};

use crate::aggregate::aggregate_fills;
use crate::source::LeaderSource;

// ---------------------------------------------------------------------------
// Sink + batch types
// ---------------------------------------------------------------------------

/// Where ordered events go. The decision engine implements this; the sink is
/// invoked *before* the commit so its intents land in the same transaction.
pub trait DecisionSink: Send {
    fn decide(&mut self, event: &PositionDeltaEvent) -> Vec<OrderIntent>;
}

/// One event that committed, with the intents persisted alongside it.
#[derive(Debug, Clone)]
pub struct ProcessedEvent {
    pub event: PositionDeltaEvent,
    pub intents: Vec<OrderIntent>,
}

/// Outcome of one ingest pass.
#[derive(Debug, Default)]
pub struct ProcessedBatch {
    pub processed: Vec<ProcessedEvent>,
    pub duplicates: u32,
    pub skipped_out_of_order: u32,
}

// ---------------------------------------------------------------------------
// Gap guard
// ---------------------------------------------------------------------------

/// Liveness verdict for the ingest path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapStatus {
    Healthy,
    /// The leader has been quiet longer than the window, but the source is
    /// responding. Warn only — never HALT.
    EventTimeGap { quiet_ms: i64 },
    /// The *source* has been unreachable past the backfill window: events may
    /// be unrecoverable. HALT with `BACKFILL_WINDOW_EXCEEDED`.
    Exceeded { silent_ms: i64 },
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Plain-value ingest settings (extracted from the app config by the runtime).
#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub backfill_window_ms: i64,
    pub overlap_ms: i64,
    pub dedup_ttl_ms: i64,
    /// One-shot operator bypass for a gap-exceeded HALT.
    pub maintenance_skip_gap: bool,
    pub backfill_retry_max_attempts: u32,
    pub backfill_retry_base_ms: u64,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct IngestEngine<S: LeaderSource> {
    source: Arc<S>,
    store: Store,
    symbol_map: BTreeMap<String, String>,
    settings: IngestSettings,
    boot_ms: i64,
    /// The one-shot skip is consumed on first use.
    maintenance_skip_available: bool,
}

impl<S: LeaderSource> IngestEngine<S> {
    pub fn new(
        source: Arc<S>,
        store: Store,
        symbol_map: BTreeMap<String, String>,
        settings: IngestSettings,
        boot_ms: i64,
    ) -> Self {
        let maintenance_skip_available = settings.maintenance_skip_gap;
        Self {
            source,
            store,
            symbol_map,
            settings,
            boot_ms,
            maintenance_skip_available,
        }
    }

    /// Shared handle to the source, for the stream task.
    pub fn source_handle(&self) -> Arc<S> {
        Arc::clone(&self.source)
    }

    fn map_symbol(&self, coin: &str) -> Option<String> {
        if coin.starts_with('@') {
            return None;
        }
        self.symbol_map.get(coin).cloned()
    }

    /// The REST window to query: overlap behind the cursor for same-ms ties,
    /// clamped to the backfill window behind boot.
    pub fn backfill_range(&self, cursor: &Cursor, now_ms: i64) -> (i64, i64) {
        let floor = self.boot_ms - self.settings.backfill_window_ms;
        let since = (cursor.last_processed_timestamp_ms - self.settings.overlap_ms).max(floor);
        (since.max(0), now_ms)
    }

    /// Classify the current liveness state. Pure.
    pub fn gap_status(&self, cursor: &Cursor, now_ms: i64) -> GapStatus {
        let last_success = if cursor.last_ingest_success_ms > 0 {
            cursor.last_ingest_success_ms
        } else {
            self.boot_ms
        };
        let silent_ms = now_ms.saturating_sub(last_success);
        if silent_ms > self.settings.backfill_window_ms {
            return GapStatus::Exceeded { silent_ms };
        }

        let quiet_ms = now_ms.saturating_sub(cursor.last_processed_timestamp_ms);
        if cursor.last_processed_timestamp_ms > 0 && quiet_ms > self.settings.backfill_window_ms {
            return GapStatus::EventTimeGap { quiet_ms };
        }

        GapStatus::Healthy
    }

    /// One REST poll: fetch the window, aggregate, commit event by event.
    ///
    /// Source success (even an empty window) refreshes the liveness clock.
    pub async fn poll_rest(
        &self,
        now_ms: i64,
        sink: &mut dyn DecisionSink,
    ) -> Result<ProcessedBatch> {
        let cursor = self.store.load_cursor().await?;
        let (since, until) = self.backfill_range(&cursor, now_ms);

        let fills = self
            .source
            .fetch_fills(since, until)
            .await
            .with_context(|| format!("leader fetch [{since}, {until}) failed"))?;

        self.store.touch_ingest_success(now_ms).await?;
        self.process_fills(&fills, true, now_ms, sink).await
    }

    /// Startup catch-up: bounded retries with exponential backoff. Budget
    /// exhaustion propagates as an error — the orchestrator halts on it.
    pub async fn backfill_catchup(
        &self,
        now_ms: i64,
        sink: &mut dyn DecisionSink,
    ) -> Result<ProcessedBatch> {
        let mut attempt = 0u32;
        loop {
            match self.poll_rest(now_ms, sink).await {
                Ok(batch) => return Ok(batch),
                Err(err) if attempt + 1 < self.settings.backfill_retry_max_attempts => {
                    attempt += 1;
                    let backoff = self.settings.backfill_retry_base_ms << attempt.min(10);
                    // Spread retries without an RNG: skew by the wall clock.
                    let jitter = (now_ms as u64).wrapping_add(attempt as u64 * 97) % 250;
                    tracing::warn!(%err, attempt, backoff_ms = backoff + jitter, "backfill retry");
                    tokio::time::sleep(std::time::Duration::from_millis(backoff + jitter)).await;
                }
                Err(err) => {
                    return Err(err.context(format!(
                        "backfill budget exhausted after {} attempts",
                        attempt + 1
                    )));
                }
            }
        }
    }

    /// Aggregate a batch of fills and commit the resulting events in order.
    pub async fn process_fills(
        &self,
        fills: &[Fill],
        is_replay: bool,
        now_ms: i64,
        sink: &mut dyn DecisionSink,
    ) -> Result<ProcessedBatch> {
        let agg = aggregate_fills(fills, |coin| self.map_symbol(coin), is_replay);
        let mut batch = ProcessedBatch::default();

        let mut cursor = self.store.load_cursor().await?;

        for event in agg.events {
            // Never let the cursor regress: events at or below the persisted
            // key were either processed (dedup would catch them) or are too
            // old to act on.
            if let Some(last) = &cursor.last_processed_event_key {
                if event.key <= *last {
                    batch.skipped_out_of_order += 1;
                    continue;
                }
            }

            let intents = sink.decide(&event);

            let dedup = DedupRecord {
                key: DedupKey {
                    tx_hash: event.key.tx_hash.clone(),
                    event_index: event.key.event_index,
                    symbol: event.key.symbol.clone(),
                },
                timestamp_ms: event.key.timestamp_ms,
                is_replay,
                created_at_ms: now_ms,
            };
            let advanced = cursor.advanced_to(&event.key, now_ms);

            match self.store.record_event(&dedup, &advanced, &intents).await? {
                RecordOutcome::Inserted => {
                    cursor = advanced;
                    batch.processed.push(ProcessedEvent { event, intents });
                }
                RecordOutcome::Duplicate => {
                    batch.duplicates += 1;
                }
            }
        }

        Ok(batch)
    }

    /// Apply the operator's one-shot maintenance skip: jump the cursor to
    /// `now`, audit the bypass, and record the timestamp for inspection.
    ///
    /// Returns `false` when no skip is available (not configured, or already
    /// consumed) — the caller must stay halted in that case.
    pub async fn apply_maintenance_skip(&mut self, now_ms: i64) -> Result<bool> {
        if !self.maintenance_skip_available {
            return Ok(false);
        }
        self.maintenance_skip_available = false;

        let cursor = self.store.load_cursor().await?;
        let jumped = Cursor {
            last_processed_timestamp_ms: now_ms,
            last_processed_event_key: cursor.last_processed_event_key.clone(),
            last_ingest_success_ms: now_ms,
        };

        self.store
            .append_audit(
                &AuditRecord::new(
                    "ingest",
                    "cursor",
                    cursor.last_processed_timestamp_ms.to_string(),
                    now_ms.to_string(),
                    ReasonCode::MaintenanceSkipApplied,
                    "operator maintenance skip: cursor jumped past gap",
                    now_ms,
                )
                .with_metadata(serde_json::json!({
                    "skipped_from_ms": cursor.last_processed_timestamp_ms,
                    "skipped_to_ms": now_ms,
                })),
            )
            .await?;
        self.store.force_cursor(&jumped).await?;
        self.store
            .set_system_state(pf_store::keys::MAINTENANCE_SKIP_APPLIED_MS, &now_ms.to_string())
            .await?;

        Ok(true)
    }

    /// TTL sweep of the dedup table.
    pub async fn sweep_dedup(&self, now_ms: i64) -> Result<u64> {
        self.store
            .sweep_dedup(now_ms - self.settings.dedup_ttl_ms)
            .await
    }
}

// ---------------------------------------------------------------------------
// Stream runner
// ---------------------------------------------------------------------------

/// Drive the live fill subscription with exponential-backoff reconnects,
/// pushing fills into `tx` until shutdown flips.
pub async fn run_fill_stream<S: LeaderSource>(
    source: Arc<S>,
    tx: mpsc::Sender<Fill>,
    mut shutdown: watch::Receiver<bool>,
    initial_backoff_ms: u64,
    backoff_cap_ms: u64,
) {
    use futures_util::StreamExt;

    let mut backoff_ms = initial_backoff_ms;

    loop {
        if *shutdown.borrow() {
            return;
        }

        let connect = tokio::time::timeout(
            std::time::Duration::from_secs(15),
            source.subscribe(),
        )
        .await
        .unwrap_or_else(|_| Err(crate::source::SourceError::Transport("connect timed out".to_string())));

        let mut stream = match connect {
            Ok(s) => {
                backoff_ms = initial_backoff_ms;
                s
            }
            Err(err) => {
                tracing::warn!(%err, backoff_ms, "stream connect failed");
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)) => {}
                    _ = shutdown.changed() => return,
                }
                backoff_ms = (backoff_ms * 2).min(backoff_cap_ms);
                continue;
            }
        };

        loop {
            tokio::select! {
                item = stream.next() => match item {
                    Some(Ok(fill)) => {
                        if tx.send(fill).await.is_err() {
                            return; // receiver gone, process is shutting down
                        }
                    }
                    Some(Err(err)) => {
                        tracing::warn!(%err, "stream error, reconnecting");
                        break;
                    }
                    None => {
                        tracing::warn!("stream closed, reconnecting");
                        break;
                    }
                },
                _ = shutdown.changed() => return,
            }
        }
    }
}
