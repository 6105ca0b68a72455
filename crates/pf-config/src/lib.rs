//! Configuration loading for the pilotfish core.
//!
//! Configuration is a process-wide immutable value: a YAML layer stack is
//! merged and canonically hashed once at startup ([`LoadedConfig::load`]),
//! then deserialized into the typed [`AppConfig`] and validated. Secrets
//! never live in YAML — the files carry env var NAMES only, resolved in
//! [`secrets`].

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub mod layering;
pub mod secrets;

pub use layering::LoadedConfig;
pub use secrets::{resolve_secrets_for_mode, ResolvedSecrets};

// ---------------------------------------------------------------------------
// Typed sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingMode {
    FixedNotional,
    Proportional,
    Kelly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KellyConfig {
    /// Estimated win probability of mirrored entries.
    pub win_prob: f64,
    /// Payoff ratio b (average win / average loss).
    pub payoff_ratio: f64,
    /// Bankroll in quote units the Kelly fraction applies to.
    pub bankroll_usd: f64,
    /// Hard cap on the applied fraction (half-Kelly etc.).
    pub fraction_cap: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingConfig {
    pub mode: SizingMode,
    /// Quote notional per intent for `fixed_notional`.
    #[serde(default)]
    pub fixed_notional_usd: f64,
    /// Local-qty / leader-qty ratio for `proportional`.
    #[serde(default)]
    pub ratio: f64,
    #[serde(default)]
    pub kelly: Option<KellyConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceFailurePolicy {
    Reject,
    AllowWithoutPrice,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Events older than this are rejected outright.
    pub max_stale_ms: i64,
    /// Events ahead of the local clock by more than this are rejected.
    pub max_future_ms: i64,
    /// 0 disables the slippage check.
    pub slippage_cap_pct: f64,
    pub price_failure_policy: PriceFailurePolicy,
    pub price_fallback_enabled: bool,
    /// Stricter staleness bound applied to the ingest-supplied fallback price.
    pub price_fallback_max_age_ms: i64,
    /// Staleness bound for the venue mark price.
    pub mark_price_max_age_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayPolicy {
    Off,
    CloseOnly,
    Full,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub backfill_window_ms: i64,
    /// Overlap re-queried on reconnect to absorb same-millisecond ties.
    pub overlap_ms: i64,
    pub poll_interval_ms: u64,
    pub idle_backoff_ms: u64,
    pub stream_reconnect_initial_ms: u64,
    pub stream_reconnect_cap_ms: u64,
    /// REST polling takes over when the stream is silent this long.
    pub rest_stale_after_ms: i64,
    pub dedup_ttl_ms: i64,
    /// One-shot operator bypass for a gap-exceeded HALT.
    #[serde(default)]
    pub maintenance_skip_gap: bool,
    pub backfill_retry_max_attempts: u32,
    pub backfill_retry_base_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryBudgetMode {
    ArmedSafe,
    Halt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub tif_seconds: u64,
    pub order_poll_interval_sec: u64,
    pub market_fallback_enabled: bool,
    /// Fallback only when remaining ≤ this fraction of the original qty.
    pub market_fallback_threshold_pct: f64,
    pub market_slippage_cap_pct: f64,
    pub unknown_poll_interval_sec: u64,
    pub retry_budget_max_attempts: u32,
    pub retry_budget_window_sec: u64,
    pub retry_budget_mode: RetryBudgetMode,
    /// Shared cooldown applied to submit + poll after a 429.
    pub rate_limit_cooldown_ms: u64,
    pub filters_cache_ttl_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Per-symbol drift that logs a warning.
    pub warn_threshold: f64,
    /// Per-symbol drift that halts.
    pub critical_threshold: f64,
    pub snapshot_max_stale_ms: i64,
    pub reconcile_interval_ms: u64,
    /// Consecutive non-critical reconciliations required before HALT may
    /// auto-recover to ARMED_SAFE.
    pub auto_recovery_consecutive_clean: u32,
    /// Execution-adapter health lookback for auto-recovery.
    pub adapter_health_window_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderConfig {
    pub rest_url: String,
    pub ws_url: String,
    /// Env var NAME holding the leader wallet address.
    pub wallet_env: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueConfig {
    /// Env var NAMES for the venue credentials.
    pub api_key_env: String,
    pub api_secret_env: String,
    /// Cadence of the server-time offset refresh.
    pub server_time_refresh_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub path: String,
}

// ---------------------------------------------------------------------------
// AppConfig
// ---------------------------------------------------------------------------

/// The validated process-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub config_version: u32,
    pub strategy_version: String,
    /// Leader coin → execution venue symbol. One-to-one.
    pub symbol_map: BTreeMap<String, String>,
    pub sizing: SizingConfig,
    pub risk: RiskConfig,
    pub replay_policy: ReplayPolicy,
    pub ingest: IngestConfig,
    pub execution: ExecutionConfig,
    pub safety: SafetyConfig,
    pub leader: LeaderConfig,
    pub venue: VenueConfig,
    pub store: StoreConfig,
    pub heartbeat_interval_ms: u64,
}

impl AppConfig {
    /// Deserialize the merged JSON into the typed view and validate it.
    pub fn from_loaded(loaded: &LoadedConfig) -> Result<Self> {
        let cfg: AppConfig = serde_json::from_value(loaded.config_json.clone())
            .context("config does not match expected schema")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations the pipeline cannot run safely under.
    pub fn validate(&self) -> Result<()> {
        if self.symbol_map.is_empty() {
            bail!("CONFIG_INVALID: symbol_map must not be empty");
        }
        let mut seen = BTreeSet::new();
        for (coin, symbol) in &self.symbol_map {
            if !seen.insert(symbol.clone()) {
                bail!("CONFIG_INVALID: symbol_map is not one-to-one; duplicate target '{symbol}' (coin '{coin}')");
            }
        }

        match self.sizing.mode {
            SizingMode::FixedNotional if self.sizing.fixed_notional_usd <= 0.0 => {
                bail!("CONFIG_INVALID: sizing.fixed_notional_usd must be > 0 for fixed_notional");
            }
            SizingMode::Proportional if self.sizing.ratio <= 0.0 => {
                bail!("CONFIG_INVALID: sizing.ratio must be > 0 for proportional");
            }
            SizingMode::Kelly => {
                let k = self
                    .sizing
                    .kelly
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("CONFIG_INVALID: sizing.kelly section required for kelly mode"))?;
                if !(0.0..=1.0).contains(&k.win_prob) {
                    bail!("CONFIG_INVALID: sizing.kelly.win_prob must be in [0, 1]");
                }
                if k.payoff_ratio <= 0.0 || k.bankroll_usd <= 0.0 {
                    bail!("CONFIG_INVALID: sizing.kelly payoff_ratio and bankroll_usd must be > 0");
                }
                if !(0.0..=1.0).contains(&k.fraction_cap) {
                    bail!("CONFIG_INVALID: sizing.kelly.fraction_cap must be in [0, 1]");
                }
            }
            _ => {}
        }

        if self.risk.max_stale_ms <= 0 || self.risk.max_future_ms <= 0 {
            bail!("CONFIG_INVALID: risk staleness windows must be > 0");
        }
        if self.risk.slippage_cap_pct < 0.0 {
            bail!("CONFIG_INVALID: risk.slippage_cap_pct must be >= 0");
        }

        if self.ingest.backfill_window_ms <= 0 {
            bail!("CONFIG_INVALID: ingest.backfill_window_ms must be > 0");
        }
        if self.ingest.overlap_ms < 0 {
            bail!("CONFIG_INVALID: ingest.overlap_ms must be >= 0");
        }

        if !(0.0..=1.0).contains(&self.execution.market_fallback_threshold_pct) {
            bail!("CONFIG_INVALID: execution.market_fallback_threshold_pct must be in [0, 1]");
        }
        if self.execution.retry_budget_max_attempts == 0 {
            bail!("CONFIG_INVALID: execution.retry_budget_max_attempts must be > 0");
        }

        if self.safety.critical_threshold < self.safety.warn_threshold {
            bail!("CONFIG_INVALID: safety.critical_threshold must be >= warn_threshold");
        }

        Ok(())
    }

    /// Map a leader coin to its execution-venue symbol.
    ///
    /// Unmapped coins and spot-style `@`-prefixed symbols return `None`;
    /// the ingest layer drops those with a warning counter instead of
    /// trading the wrong market.
    pub fn map_symbol(&self, coin: &str) -> Option<&str> {
        if coin.starts_with('@') {
            return None;
        }
        self.symbol_map.get(coin).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_config() -> AppConfig {
        AppConfig {
            config_version: 1,
            strategy_version: "copy-1".to_string(),
            symbol_map: BTreeMap::from([
                ("BTC".to_string(), "BTCUSDT".to_string()),
                ("ETH".to_string(), "ETHUSDT".to_string()),
            ]),
            sizing: SizingConfig {
                mode: SizingMode::Proportional,
                fixed_notional_usd: 0.0,
                ratio: 0.001,
                kelly: None,
            },
            risk: RiskConfig {
                max_stale_ms: 30_000,
                max_future_ms: 5_000,
                slippage_cap_pct: 0.5,
                price_failure_policy: PriceFailurePolicy::Reject,
                price_fallback_enabled: true,
                price_fallback_max_age_ms: 5_000,
                mark_price_max_age_ms: 10_000,
            },
            replay_policy: ReplayPolicy::CloseOnly,
            ingest: IngestConfig {
                backfill_window_ms: 3_600_000,
                overlap_ms: 2_000,
                poll_interval_ms: 1_000,
                idle_backoff_ms: 5_000,
                stream_reconnect_initial_ms: 1_000,
                stream_reconnect_cap_ms: 60_000,
                rest_stale_after_ms: 15_000,
                dedup_ttl_ms: 86_400_000,
                maintenance_skip_gap: false,
                backfill_retry_max_attempts: 5,
                backfill_retry_base_ms: 500,
            },
            execution: ExecutionConfig {
                tif_seconds: 30,
                order_poll_interval_sec: 2,
                market_fallback_enabled: true,
                market_fallback_threshold_pct: 0.5,
                market_slippage_cap_pct: 0.5,
                unknown_poll_interval_sec: 5,
                retry_budget_max_attempts: 3,
                retry_budget_window_sec: 60,
                retry_budget_mode: RetryBudgetMode::ArmedSafe,
                rate_limit_cooldown_ms: 2_000,
                filters_cache_ttl_ms: 600_000,
            },
            safety: SafetyConfig {
                warn_threshold: 0.001,
                critical_threshold: 0.01,
                snapshot_max_stale_ms: 30_000,
                reconcile_interval_ms: 10_000,
                auto_recovery_consecutive_clean: 3,
                adapter_health_window_ms: 60_000,
            },
            leader: LeaderConfig {
                rest_url: "https://api.hyperliquid.xyz".to_string(),
                ws_url: "wss://api.hyperliquid.xyz/ws".to_string(),
                wallet_env: "PF_LEADER_WALLET".to_string(),
            },
            venue: VenueConfig {
                api_key_env: "PF_VENUE_API_KEY".to_string(),
                api_secret_env: "PF_VENUE_API_SECRET".to_string(),
                server_time_refresh_ms: 300_000,
            },
            store: StoreConfig {
                path: "pilotfish.db".to_string(),
            },
            heartbeat_interval_ms: 10_000,
        }
    }

    #[test]
    fn sample_validates() {
        sample_config().validate().unwrap();
    }

    #[test]
    fn duplicate_target_symbol_rejected() {
        let mut cfg = sample_config();
        cfg.symbol_map
            .insert("XBT".to_string(), "BTCUSDT".to_string());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn kelly_requires_section() {
        let mut cfg = sample_config();
        cfg.sizing.mode = SizingMode::Kelly;
        cfg.sizing.kelly = None;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn spot_symbols_are_unmapped() {
        let cfg = sample_config();
        assert_eq!(cfg.map_symbol("BTC"), Some("BTCUSDT"));
        assert_eq!(cfg.map_symbol("@107"), None);
        assert_eq!(cfg.map_symbol("DOGE"), None);
    }

    #[test]
    fn typed_view_round_trips_through_json() {
        let cfg = sample_config();
        let json = serde_json::to_value(&cfg).unwrap();
        let loaded = LoadedConfig {
            config_json: json.clone(),
            canonical_json: json.to_string(),
            config_hash: "h".to_string(),
        };
        let back = AppConfig::from_loaded(&loaded).unwrap();
        assert_eq!(back.symbol_map, cfg.symbol_map);
        assert_eq!(back.sizing.mode, SizingMode::Proportional);
    }
}
