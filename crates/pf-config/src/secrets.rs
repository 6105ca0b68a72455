//! Runtime secret resolution.
//!
//! # Contract
//! - Config YAML stores only env var NAMES (e.g. `"PF_VENUE_API_KEY"`).
//! - Callers invoke [`resolve_secrets_for_mode`] once at startup and pass the
//!   returned [`ResolvedSecrets`] into constructors; no scattered
//!   `std::env::var` calls.
//! - `Debug` redacts values. Error messages reference the env var NAME,
//!   never the value.
//!
//! # Mode-aware enforcement
//! - `live`: venue api_key + api_secret + leader wallet are required; absence
//!   is a startup failure (non-zero exit), not a safety transition.
//! - `dry-run` / `backfill-only`: the leader wallet is still required (ingest
//!   runs in every mode); venue credentials are optional.

use anyhow::{bail, Result};
use pf_schemas::RunMode;

use crate::AppConfig;

/// All runtime-resolved secrets for one process. Values redacted in `Debug`.
#[derive(Clone)]
pub struct ResolvedSecrets {
    pub venue_api_key: Option<String>,
    pub venue_api_secret: Option<String>,
    /// Leader wallet address being mirrored.
    pub leader_wallet: String,
}

impl std::fmt::Debug for ResolvedSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedSecrets")
            .field(
                "venue_api_key",
                &self.venue_api_key.as_ref().map(|_| "<REDACTED>"),
            )
            .field(
                "venue_api_secret",
                &self.venue_api_secret.as_ref().map(|_| "<REDACTED>"),
            )
            .field("leader_wallet", &"<REDACTED>")
            .finish()
    }
}

/// Resolve a named environment variable. Unset or blank → `None`.
fn resolve_env(var_name: &str) -> Option<String> {
    match std::env::var(var_name) {
        Ok(v) if !v.trim().is_empty() => Some(v.trim().to_string()),
        _ => None,
    }
}

/// Resolve all secrets from the environment for the given run mode.
///
/// # Errors
/// Returns `Err` naming the env var of the first missing required variable.
pub fn resolve_secrets_for_mode(cfg: &AppConfig, mode: RunMode) -> Result<ResolvedSecrets> {
    let venue_api_key = resolve_env(&cfg.venue.api_key_env);
    let venue_api_secret = resolve_env(&cfg.venue.api_secret_env);
    let leader_wallet = resolve_env(&cfg.leader.wallet_env);

    let leader_wallet = match leader_wallet {
        Some(w) => w,
        None => bail!(
            "SECRETS_MISSING mode={}: required env var '{}' (leader wallet) is not set or empty",
            mode.as_str(),
            cfg.leader.wallet_env,
        ),
    };

    if mode == RunMode::Live {
        if venue_api_key.is_none() {
            bail!(
                "SECRETS_MISSING mode=live: required env var '{}' (venue api_key) is not set or empty",
                cfg.venue.api_key_env,
            );
        }
        if venue_api_secret.is_none() {
            bail!(
                "SECRETS_MISSING mode=live: required env var '{}' (venue api_secret) is not set or empty",
                cfg.venue.api_secret_env,
            );
        }
    }

    Ok(ResolvedSecrets {
        venue_api_key,
        venue_api_secret,
        leader_wallet,
    })
}
