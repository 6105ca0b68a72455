//! Scenario: the orchestrator boots fail-closed and halts on startup drift.
//!
//! # Invariants under test
//!
//! 1. A fresh bootstrap lands in ARMED_SAFE (never ARMED_LIVE) and mirrors
//!    the mode into `system_state` for operator inspection.
//! 2. A reconcile pass that finds local exposure missing on the venue halts
//!    with RECONCILE_CRITICAL, appends audit evidence, and the safety
//!    singleton survives for the next boot.
//! 3. A second bootstrap preserves the persisted HALT reason.

use std::sync::Arc;

use pf_config::AppConfig;
use pf_execution::{Clock, PaperVenue};
use pf_ingest::{FillStream, LeaderSource, SourceError};
use pf_runtime::Runtime;
use pf_schemas::{
    correlation_id, Cursor, DedupKey, DedupRecord, EventKey, Fill, OrderIntent, OrderResult,
    OrderStatus, OrderType, ReasonCode, RunMode, SafetyMode, Side, TimeInForce, CONTRACT_VERSION,
};
use pf_store::Store;
use tokio::sync::watch;

struct QuietSource;

#[async_trait::async_trait]
impl LeaderSource for QuietSource {
    fn name(&self) -> &'static str {
        "quiet"
    }

    async fn fetch_fills(&self, _since_ms: i64, _until_ms: i64) -> Result<Vec<Fill>, SourceError> {
        Ok(Vec::new())
    }

    async fn subscribe(&self) -> Result<FillStream, SourceError> {
        Err(SourceError::Transport("not used in this scenario".to_string()))
    }
}

fn config() -> AppConfig {
    let yaml = r#"
config_version: 1
strategy_version: copy-1
symbol_map: { BTC: BTCUSDT }
sizing: { mode: proportional, ratio: 0.001 }
risk:
  max_stale_ms: 3600000
  max_future_ms: 5000
  slippage_cap_pct: 0.5
  price_failure_policy: reject
  price_fallback_enabled: true
  price_fallback_max_age_ms: 5000
  mark_price_max_age_ms: 10000
replay_policy: close_only
ingest:
  backfill_window_ms: 86400000000
  overlap_ms: 2000
  poll_interval_ms: 1000
  idle_backoff_ms: 10
  stream_reconnect_initial_ms: 1000
  stream_reconnect_cap_ms: 60000
  rest_stale_after_ms: 15000
  dedup_ttl_ms: 86400000
  maintenance_skip_gap: false
  backfill_retry_max_attempts: 2
  backfill_retry_base_ms: 1
execution:
  tif_seconds: 1
  order_poll_interval_sec: 0
  market_fallback_enabled: false
  market_fallback_threshold_pct: 0.5
  market_slippage_cap_pct: 0.5
  unknown_poll_interval_sec: 0
  retry_budget_max_attempts: 3
  retry_budget_window_sec: 60
  retry_budget_mode: armed_safe
  rate_limit_cooldown_ms: 1
  filters_cache_ttl_ms: 600000
safety:
  warn_threshold: 0.001
  critical_threshold: 0.01
  snapshot_max_stale_ms: 86400000000
  reconcile_interval_ms: 10000
  auto_recovery_consecutive_clean: 3
  adapter_health_window_ms: 60000
leader:
  rest_url: https://api.example
  ws_url: wss://api.example/ws
  wallet_env: PF_TEST_WALLET
venue:
  api_key_env: PF_TEST_KEY
  api_secret_env: PF_TEST_SECRET
  server_time_refresh_ms: 300000
store: { path: unused.db }
heartbeat_interval_ms: 10000
"#;
    let yaml_val: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
    let json = serde_json::to_value(yaml_val).unwrap();
    serde_json::from_value(json).unwrap()
}

fn loaded_for(cfg: &AppConfig) -> pf_config::LoadedConfig {
    let json = serde_json::to_value(cfg).unwrap();
    pf_config::LoadedConfig {
        canonical_json: json.to_string(),
        config_json: json,
        config_hash: "test-hash".to_string(),
    }
}

/// Seed one fully filled BUY so derived local positions show +0.1 BTCUSDT.
async fn seed_local_position(store: &Store) {
    let key = EventKey {
        timestamp_ms: 1_000,
        event_index: 0,
        tx_hash: "0xseed".to_string(),
        symbol: "BTCUSDT".to_string(),
    };
    let intent = OrderIntent {
        correlation_id: correlation_id("0xseed", 0, "BTCUSDT", None),
        symbol: "BTCUSDT".to_string(),
        side: Side::Buy,
        order_type: OrderType::Limit,
        qty: 0.1,
        price: Some(50_000.0),
        reduce_only: false,
        tif: TimeInForce::Gtc,
        is_replay: false,
        strategy_version: "copy-1".to_string(),
        risk_notes: vec![],
    };
    let dedup = DedupRecord {
        key: DedupKey {
            tx_hash: key.tx_hash.clone(),
            event_index: 0,
            symbol: key.symbol.clone(),
        },
        timestamp_ms: key.timestamp_ms,
        is_replay: false,
        created_at_ms: key.timestamp_ms,
    };
    store
        .record_event(
            &dedup,
            &Cursor::empty().advanced_to(&key, 1_000),
            std::slice::from_ref(&intent),
        )
        .await
        .unwrap();

    let result = OrderResult {
        correlation_id: intent.correlation_id.clone(),
        exchange_order_id: Some("x-1".to_string()),
        status: OrderStatus::Filled,
        filled_qty: 0.1,
        avg_price: Some(50_000.0),
        error_code: None,
        error_message: None,
        contract: CONTRACT_VERSION,
        updated_at_ms: 2_000,
    };
    store.upsert_result(&result, |_, _| false).await.unwrap();
}

async fn bootstrap(store: Store) -> Runtime<QuietSource, PaperVenue> {
    let cfg = config();
    let loaded = loaded_for(&cfg);
    let (_tx, rx) = watch::channel(false);
    let venue = Arc::new(PaperVenue::new());
    // Position snapshots should read as fresh in this scenario.
    venue.set_now_ms(pf_execution::SystemClock.now_ms());

    Runtime::bootstrap(
        cfg,
        &loaded,
        RunMode::DryRun,
        store,
        pf_store::SchemaCheck::Fresh,
        Arc::new(QuietSource),
        venue,
        rx,
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn fresh_bootstrap_is_armed_safe() {
    let (store, _) = Store::open("sqlite::memory:").await.unwrap();
    let runtime = bootstrap(store.clone()).await;

    assert_eq!(runtime.safety_mode(), SafetyMode::ArmedSafe);
    assert_eq!(
        store
            .get_system_state(pf_store::keys::SAFETY_MODE)
            .await
            .unwrap(),
        Some("ARMED_SAFE".to_string())
    );
    assert_eq!(
        store
            .get_system_state(pf_store::keys::CONFIG_HASH)
            .await
            .unwrap(),
        Some("test-hash".to_string())
    );
}

#[tokio::test]
async fn reconcile_halts_on_missing_venue_position() {
    let (store, _) = Store::open("sqlite::memory:").await.unwrap();
    seed_local_position(&store).await;

    let mut runtime = bootstrap(store.clone()).await;
    runtime.reconcile_tick().await.unwrap();

    assert_eq!(runtime.safety_mode(), SafetyMode::Halt);

    let safety = store.load_safety().await.unwrap().unwrap();
    assert_eq!(safety.mode, SafetyMode::Halt);
    assert_eq!(safety.reason_code, ReasonCode::ReconcileCritical);
    assert!(safety.reason_message.contains("BTCUSDT"));

    assert!(store.audit_count("reconcile").await.unwrap() >= 1);
    assert!(store.audit_count("safety").await.unwrap() >= 2, "boot + halt");
}

#[tokio::test]
async fn restart_preserves_halt_reason() {
    let (store, _) = Store::open("sqlite::memory:").await.unwrap();
    seed_local_position(&store).await;

    let mut runtime = bootstrap(store.clone()).await;
    runtime.reconcile_tick().await.unwrap();
    assert_eq!(runtime.safety_mode(), SafetyMode::Halt);
    drop(runtime);

    let runtime = bootstrap(store.clone()).await;
    assert_eq!(runtime.safety_mode(), SafetyMode::Halt);
    let safety = store.load_safety().await.unwrap().unwrap();
    assert_eq!(safety.reason_code, ReasonCode::ReconcileCritical);
}
