//! The orchestrator: startup state machine, main loop, and background tasks.
//!
//! # Startup
//!
//! ```text
//! BOOTSTRAP → SNAPSHOT_CHECK → RECONCILE_ON_START → BACKFILL_CATCHUP
//!                                                         │
//!                                        {ARMED_SAFE | HALT} (never LIVE)
//! ```
//!
//! Boot is fail-closed: the best landing state is ARMED_SAFE; promotion to
//! ARMED_LIVE is an operator action observed through the store. A persisted
//! HALT survives restart with its reason intact.
//!
//! # Main loop
//!
//! One orchestrator task drives ingest polling (with idle backoff) and
//! execution; a reconcile tick, a heartbeat, and the live fill stream run as
//! separate tasks. Shutdown propagates through a watch channel; every task
//! drains its in-flight store commit before exiting.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};

use pf_config::{AppConfig, LoadedConfig};
use pf_decision::DecisionSettings;
use pf_execution::{Clock, ExecutionReport, Executor, PaperVenue, SystemClock, VenueAdapter};
use pf_ingest::{
    GapStatus, IngestEngine, IngestSettings, LeaderSource, ProcessedBatch, ProcessedEvent,
};
use pf_safety::{evaluate, ExecutionHealth, ReconcileConfig, SafetyController, VenuePositions};
use pf_schemas::{
    AuditRecord, Fill, ReasonCode, RunMode, SafetyMode, CONTRACT_VERSION,
};
use pf_store::{SchemaCheck, Store};

use crate::snapshot::{BatchSink, ProviderSnapshot};

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

pub struct Runtime<S: LeaderSource + 'static, V: VenueAdapter + 'static> {
    cfg: AppConfig,
    mode: RunMode,
    store: Store,
    ingest: IngestEngine<S>,
    executor: Arc<Executor<V, SystemClock>>,
    venue: Arc<V>,
    controller: SafetyController,
    shutdown_rx: watch::Receiver<bool>,
    /// venue server_time − local time, refreshed periodically.
    time_offset_ms: i64,
    /// Last fill seen on the live stream; REST polling takes over when the
    /// stream has been quiet past `rest_stale_after_ms`.
    last_stream_activity_ms: i64,
    /// Venue filters with their fetch time (TTL-cached).
    filters_cache: std::collections::BTreeMap<String, (pf_schemas::SymbolFilters, i64)>,
    clock: SystemClock,
}

/// Convenience alias: dry-run / backfill-only wiring over the paper venue.
pub type PaperRuntime<S> = Runtime<S, PaperVenue>;

impl<S: LeaderSource + 'static, V: VenueAdapter + 'static> Runtime<S, V> {
    /// BOOTSTRAP: wire components, gate the schema, compare the config hash,
    /// and boot the fail-closed safety controller.
    pub async fn bootstrap(
        cfg: AppConfig,
        loaded: &LoadedConfig,
        mode: RunMode,
        store: Store,
        schema_check: SchemaCheck,
        source: Arc<S>,
        venue: Arc<V>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<Self> {
        let clock = SystemClock;
        let now = clock.now_ms();

        // Config provenance: hash mismatch is informational (the operator
        // changed configuration between runs); it is recorded, not fatal.
        let prior_hash = store.get_system_state(pf_store::keys::CONFIG_HASH).await?;
        if let Some(prior) = &prior_hash {
            if prior != &loaded.config_hash {
                tracing::warn!(prior = %prior, current = %loaded.config_hash, "config hash changed");
                store
                    .append_audit(&AuditRecord::new(
                        "config",
                        "config_hash",
                        prior.clone(),
                        loaded.config_hash.clone(),
                        ReasonCode::OperatorAction,
                        "configuration changed between runs",
                        now,
                    ))
                    .await?;
            }
        }
        store
            .set_system_state(pf_store::keys::CONFIG_HASH, &loaded.config_hash)
            .await?;
        store
            .set_system_state(pf_store::keys::CONFIG_VERSION, &cfg.config_version.to_string())
            .await?;
        store
            .set_system_state(pf_store::keys::CONTRACT_VERSION, &CONTRACT_VERSION.to_string())
            .await?;

        let persisted_safety = store.load_safety().await?;
        let mut controller = SafetyController::boot(
            persisted_safety.clone(),
            cfg.safety.auto_recovery_consecutive_clean,
            cfg.safety.adapter_health_window_ms,
            now,
        );
        // Persist the boot state so operators always see the current mode.
        let boot_state = controller.state().clone();
        store
            .save_safety(persisted_safety.as_ref(), &boot_state)
            .await?;

        // A downgraded-but-openable schema halts rather than trades.
        if let SchemaCheck::HaltRequired { found } = schema_check {
            if let Some(t) = controller.halt(
                ReasonCode::SchemaVersionMismatch,
                format!("store schema v{found} has no applicable migration"),
                now,
            ) {
                store.save_safety(Some(controller.state()), &t.next).await?;
                controller.commit(&t);
            }
        }

        let ingest = IngestEngine::new(
            source,
            store.clone(),
            cfg.symbol_map.clone(),
            IngestSettings {
                backfill_window_ms: cfg.ingest.backfill_window_ms,
                overlap_ms: cfg.ingest.overlap_ms,
                dedup_ttl_ms: cfg.ingest.dedup_ttl_ms,
                maintenance_skip_gap: cfg.ingest.maintenance_skip_gap,
                backfill_retry_max_attempts: cfg.ingest.backfill_retry_max_attempts,
                backfill_retry_base_ms: cfg.ingest.backfill_retry_base_ms,
            },
            now,
        );

        let executor = Arc::new(Executor::new(
            Arc::clone(&venue),
            store.clone(),
            cfg.execution.clone(),
            SystemClock,
        ));

        Ok(Self {
            cfg,
            mode,
            store,
            ingest,
            executor,
            venue,
            controller,
            shutdown_rx,
            time_offset_ms: 0,
            last_stream_activity_ms: 0,
            filters_cache: Default::default(),
            clock,
        })
    }

    fn decision_settings(&self) -> DecisionSettings {
        DecisionSettings {
            sizing: self.cfg.sizing.clone(),
            risk: self.cfg.risk.clone(),
            replay_policy: self.cfg.replay_policy,
            strategy_version: self.cfg.strategy_version.clone(),
        }
    }

    fn reconcile_cfg(&self) -> ReconcileConfig {
        ReconcileConfig {
            warn_threshold: self.cfg.safety.warn_threshold,
            critical_threshold: self.cfg.safety.critical_threshold,
            snapshot_max_stale_ms: self.cfg.safety.snapshot_max_stale_ms,
        }
    }

    fn mapped_symbols(&self) -> Vec<String> {
        self.cfg.symbol_map.values().cloned().collect()
    }

    /// Persist and adopt a safety transition. The store writes the audit row
    /// before the mode changes; on entry into HALT, outstanding waiting
    /// orders are canceled as the final act of the transition.
    async fn apply_transition(&mut self, t: pf_safety::Transition) -> Result<()> {
        let entering_halt =
            t.next.mode == SafetyMode::Halt && self.controller.mode() != SafetyMode::Halt;
        self.store
            .save_safety(Some(self.controller.state()), &t.next)
            .await?;
        self.controller.commit(&t);
        tracing::error!(
            mode = t.next.mode.as_str(),
            reason = t.next.reason_code.as_str(),
            message = %t.next.reason_message,
            "safety transition"
        );

        if entering_halt && self.mode.writes_to_venue() {
            self.cancel_outstanding_orders().await;
        }
        Ok(())
    }

    /// Cancel every non-terminal order as part of the transition into HALT.
    async fn cancel_outstanding_orders(&self) {
        let open = match self.store.load_open_orders().await {
            Ok(open) => open,
            Err(err) => {
                tracing::error!(%err, "could not enumerate open orders for halt cancel");
                return;
            }
        };
        for (intent, _) in open {
            let client_id = pf_schemas::venue_client_id(&intent.correlation_id);
            if let Err(err) = self.venue.cancel_order(&client_id).await {
                tracing::warn!(%err, correlation_id = %intent.correlation_id, "halt cancel failed");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Startup sequence
    // -----------------------------------------------------------------------

    /// SNAPSHOT_CHECK → RECONCILE_ON_START → BACKFILL_CATCHUP.
    pub async fn startup(&mut self) -> Result<()> {
        let now = self.clock.now_ms();

        // SNAPSHOT_CHECK: venue clock offset + a first position snapshot.
        match self.venue.server_time().await {
            Ok(server_ms) => {
                self.time_offset_ms = server_ms - self.clock.now_ms();
                tracing::info!(offset_ms = self.time_offset_ms, "venue time offset captured");
            }
            Err(err) => {
                tracing::warn!(%err, "server_time unavailable at startup");
                if let Some(t) = self.controller.demote_to_safe(
                    ReasonCode::SnapshotStale,
                    "venue unreachable during snapshot check",
                    now,
                ) {
                    self.apply_transition(t).await?;
                }
            }
        }

        // RECONCILE_ON_START.
        self.reconcile_tick().await?;

        // BACKFILL_CATCHUP: gap guard first, then the bounded catch-up.
        let cursor = self.store.load_cursor().await?;
        match self.ingest.gap_status(&cursor, self.clock.now_ms()) {
            GapStatus::Exceeded { silent_ms } => {
                self.controller.note_gap_violation();
                if self.ingest.apply_maintenance_skip(self.clock.now_ms()).await? {
                    self.controller.note_maintenance_skip();
                    tracing::warn!(silent_ms, "gap bypassed by maintenance skip; staying ARMED_SAFE");
                } else if let Some(t) = self.controller.halt(
                    ReasonCode::BackfillWindowExceeded,
                    format!("source silent for {silent_ms}ms, beyond the backfill window"),
                    self.clock.now_ms(),
                ) {
                    self.apply_transition(t).await?;
                }
            }
            GapStatus::EventTimeGap { quiet_ms } => {
                tracing::warn!(quiet_ms, "leader quiet past the window; ingest healthy");
            }
            GapStatus::Healthy => {}
        }

        if self.controller.mode() != SafetyMode::Halt {
            let mut sink = self.build_sink().await?;
            let batch = self
                .ingest
                .backfill_catchup(self.clock.now_ms(), &mut sink)
                .await
                .context("startup backfill failed")?;
            self.audit_rejections(&sink).await?;
            tracing::info!(
                events = batch.processed.len(),
                duplicates = batch.duplicates,
                "startup backfill caught up"
            );
            self.execute_batch(batch).await?;
        }

        tracing::info!(mode = self.controller.mode().as_str(), "startup complete");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Main loop
    // -----------------------------------------------------------------------

    /// Run until the shutdown channel flips. Owns ingest polling and
    /// execution; reconcile + heartbeat tick on their own cadences inside
    /// the same select loop to keep all store writers on one task.
    pub async fn run(&mut self) -> Result<()> {
        // Live fill stream feeds this channel from its own task.
        let (fill_tx, mut fill_rx) = mpsc::channel::<Fill>(1024);
        let stream_source = self.ingest.source_handle();
        let stream_shutdown = self.shutdown_rx.clone();
        let reconnect_initial = self.cfg.ingest.stream_reconnect_initial_ms;
        let reconnect_cap = self.cfg.ingest.stream_reconnect_cap_ms;
        tokio::spawn(async move {
            pf_ingest::run_fill_stream(
                stream_source,
                fill_tx,
                stream_shutdown,
                reconnect_initial,
                reconnect_cap,
            )
            .await;
        });

        let mut poll_tick =
            tokio::time::interval(Duration::from_millis(self.cfg.ingest.poll_interval_ms.max(100)));
        let mut reconcile_tick = tokio::time::interval(Duration::from_millis(
            self.cfg.safety.reconcile_interval_ms.max(1_000),
        ));
        let mut heartbeat_tick =
            tokio::time::interval(Duration::from_millis(self.cfg.heartbeat_interval_ms.max(1_000)));
        let mut sweep_tick = tokio::time::interval(Duration::from_secs(600));
        let mut server_time_tick = tokio::time::interval(Duration::from_millis(
            self.cfg.venue.server_time_refresh_ms.max(60_000),
        ));
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    tracing::info!("shutdown signal received; draining");
                    break;
                }

                Some(fill) = fill_rx.recv() => {
                    // Batch whatever else is already queued.
                    let mut fills = vec![fill];
                    while let Ok(f) = fill_rx.try_recv() {
                        fills.push(f);
                    }
                    self.last_stream_activity_ms = self.clock.now_ms();
                    self.adopt_operator_safety().await?;
                    let mut sink = self.build_sink().await?;
                    let batch = self
                        .ingest
                        .process_fills(&fills, false, self.clock.now_ms(), &mut sink)
                        .await?;
                    self.audit_rejections(&sink).await?;
                    self.execute_batch(batch).await?;
                }

                _ = poll_tick.tick() => {
                    self.adopt_operator_safety().await?;
                    self.poll_and_execute().await?;
                }

                _ = reconcile_tick.tick() => {
                    self.adopt_operator_safety().await?;
                    self.reconcile_tick().await?;
                }

                _ = heartbeat_tick.tick() => {
                    self.store
                        .set_system_state(
                            pf_store::keys::LAST_HEARTBEAT_MS,
                            &self.clock.now_ms().to_string(),
                        )
                        .await?;
                }

                _ = sweep_tick.tick() => {
                    let removed = self.ingest.sweep_dedup(self.clock.now_ms()).await?;
                    if removed > 0 {
                        tracing::info!(removed, "dedup sweep");
                    }
                }

                _ = server_time_tick.tick() => {
                    if let Ok(server_ms) = self.venue.server_time().await {
                        self.time_offset_ms = server_ms - self.clock.now_ms();
                        tracing::debug!(offset_ms = self.time_offset_ms, "venue time offset refreshed");
                    }
                }
            }
        }

        // Drain: the store pool closes only after pending commits land.
        self.store.close().await;
        Ok(())
    }

    /// One REST poll plus the gap guard, then execution of anything new.
    async fn poll_and_execute(&mut self) -> Result<()> {
        let now = self.clock.now_ms();
        let cursor = self.store.load_cursor().await?;
        if let GapStatus::Exceeded { silent_ms } = self.ingest.gap_status(&cursor, now) {
            self.controller.note_gap_violation();
            if let Some(t) = self.controller.halt(
                ReasonCode::BackfillWindowExceeded,
                format!("source silent for {silent_ms}ms, beyond the backfill window"),
                now,
            ) {
                self.apply_transition(t).await?;
            }
        }

        // While the live stream is delivering, REST stays a fallback.
        if self.last_stream_activity_ms > 0
            && now - self.last_stream_activity_ms < self.cfg.ingest.rest_stale_after_ms
        {
            return Ok(());
        }

        let mut sink = self.build_sink().await?;
        match self.ingest.poll_rest(now, &mut sink).await {
            Ok(batch) => {
                self.audit_rejections(&sink).await?;
                if batch.processed.is_empty() {
                    tokio::time::sleep(Duration::from_millis(self.cfg.ingest.idle_backoff_ms)).await;
                }
                self.execute_batch(batch).await?;
            }
            Err(err) => {
                tracing::warn!(%err, "ingest poll failed; stream and next poll continue");
            }
        }
        Ok(())
    }

    /// Snapshot providers and assemble the decision sink for one batch.
    async fn build_sink(&mut self) -> Result<BatchSink> {
        let symbols = self.mapped_symbols();
        let now = self.clock.now_ms();
        let mut snapshot = ProviderSnapshot {
            positions: self.store.derive_local_positions(&symbols).await?,
            ..Default::default()
        };

        for symbol in &symbols {
            if let Ok(mark) = self.venue.fetch_mark_price(symbol).await {
                snapshot.marks.insert(symbol.clone(), mark);
            }

            let cached = self
                .filters_cache
                .get(symbol)
                .filter(|(_, at)| now - at < self.cfg.execution.filters_cache_ttl_ms)
                .map(|(f, _)| *f);
            let filters = match cached {
                Some(f) => Some(f),
                None => match self.venue.fetch_filters(symbol).await {
                    Ok(f) => {
                        self.filters_cache.insert(symbol.clone(), (f, now));
                        Some(f)
                    }
                    Err(err) => {
                        tracing::warn!(%err, symbol = %symbol, "filters unavailable");
                        None
                    }
                },
            };
            if let Some(f) = filters {
                snapshot.filters.insert(symbol.clone(), f);
            }
        }

        Ok(BatchSink::new(
            self.decision_settings(),
            snapshot,
            self.controller.mode(),
            now,
        ))
    }

    /// Record decision rejections in the audit log: logical rejections are
    /// first-class outputs, not silence.
    async fn audit_rejections(&self, sink: &BatchSink) -> Result<()> {
        for (event, rejection) in &sink.rejections {
            self.store
                .append_audit(
                    &AuditRecord::new(
                        "decision",
                        event.key.encode(),
                        "",
                        rejection.reason.as_str(),
                        ReasonCode::None,
                        rejection.detail.clone(),
                        self.clock.now_ms(),
                    )
                    .with_metadata(serde_json::json!({
                        "role": rejection.role.map(|r| r.as_str()),
                        "is_replay": event.is_replay,
                    })),
                )
                .await?;
        }
        Ok(())
    }

    /// Execute the intents of a committed batch, in decision order.
    async fn execute_batch(&mut self, batch: ProcessedBatch) -> Result<()> {
        if !self.mode.places_orders() {
            return Ok(());
        }

        for ProcessedEvent { intents, .. } in batch.processed {
            for intent in intents {
                let report = self
                    .executor
                    .execute(&intent, self.controller.mode())
                    .await?;
                self.absorb_report(report).await?;
            }
        }
        Ok(())
    }

    async fn absorb_report(&mut self, report: ExecutionReport) -> Result<()> {
        if let Some(trigger) = report.safety_trigger {
            let now = self.clock.now_ms();
            let transition = match trigger.mode {
                pf_config::RetryBudgetMode::Halt => {
                    self.controller.halt(trigger.reason, trigger.message, now)
                }
                pf_config::RetryBudgetMode::ArmedSafe => {
                    self.controller
                        .demote_to_safe(trigger.reason, trigger.message, now)
                }
            };
            if let Some(t) = transition {
                self.apply_transition(t).await?;
            }
        }
        Ok(())
    }

    /// Re-read the persisted safety state so operator transitions (arm,
    /// manual halt) made through the CLI take effect mid-run.
    async fn adopt_operator_safety(&mut self) -> Result<()> {
        if let Some(persisted) = self.store.load_safety().await? {
            if persisted.mode != self.controller.mode()
                && persisted.changed_at_ms > self.controller.state().changed_at_ms
            {
                tracing::info!(
                    mode = persisted.mode.as_str(),
                    "adopting operator safety change from store"
                );
                self.controller.commit(&pf_safety::Transition { next: persisted });
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reconciliation
    // -----------------------------------------------------------------------

    /// One reconciliation pass: derive local, fetch venue, evaluate, and
    /// fold the report into the safety controller.
    pub async fn reconcile_tick(&mut self) -> Result<()> {
        let symbols = self.mapped_symbols();
        let local = self.store.derive_local_positions(&symbols).await?;
        let baselines = self.store.active_baseline().await?;

        let venue_positions = match self.venue.fetch_positions(&symbols).await {
            Ok(snap) => VenuePositions {
                positions: snap.positions,
                fetched_at_ms: snap.fetched_at_ms,
            },
            Err(err) => {
                tracing::warn!(%err, "venue positions unavailable; treating snapshot as stale");
                VenuePositions {
                    positions: Default::default(),
                    fetched_at_ms: 0,
                }
            }
        };

        let now = self.clock.now_ms();
        let report = evaluate(&local, &venue_positions, &baselines, now, &self.reconcile_cfg());

        let health = self.executor.health();
        let transition = self.controller.apply_report(
            &report,
            Some(ExecutionHealth {
                last_success_ms: health.last_success_ms,
                last_error_ms: health.last_error_ms,
            }),
            now,
        );

        if let Some(t) = transition {
            let metadata = serde_json::to_value(&report).unwrap_or(serde_json::Value::Null);
            self.store
                .append_audit(
                    &AuditRecord::new(
                        "reconcile",
                        "positions",
                        "",
                        format!("{:?}", report.outcome),
                        t.next.reason_code,
                        report.summary(),
                        now,
                    )
                    .with_metadata(metadata),
                )
                .await?;
            self.apply_transition(t).await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Restart recovery
    // -----------------------------------------------------------------------

    /// Re-drive every intent whose result is absent or non-terminal.
    pub async fn recover_open_orders(&mut self) -> Result<()> {
        if !self.mode.places_orders() {
            return Ok(());
        }
        let open = self.store.load_open_orders().await?;
        if open.is_empty() {
            return Ok(());
        }
        tracing::info!(count = open.len(), "recovering open orders");
        for (intent, prior) in open {
            let report = self
                .executor
                .recover(&intent, prior, self.controller.mode())
                .await?;
            self.absorb_report(report).await?;
        }
        Ok(())
    }

    pub fn safety_mode(&self) -> SafetyMode {
        self.controller.mode()
    }
}
