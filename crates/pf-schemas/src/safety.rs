//! Safety mode and its reason vocabulary.

use serde::{Deserialize, Serialize};

/// The global ternary gate controlling what kinds of intents may submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SafetyMode {
    /// Full operation.
    ArmedLive,
    /// Reduce-only permitted; no exposure increase.
    ArmedSafe,
    /// No order submit or cancel. Ingest/reconcile/heartbeat continue.
    Halt,
}

impl SafetyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SafetyMode::ArmedLive => "ARMED_LIVE",
            SafetyMode::ArmedSafe => "ARMED_SAFE",
            SafetyMode::Halt => "HALT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ARMED_LIVE" => Some(SafetyMode::ArmedLive),
            "ARMED_SAFE" => Some(SafetyMode::ArmedSafe),
            "HALT" => Some(SafetyMode::Halt),
            _ => None,
        }
    }
}

/// Closed vocabulary of reasons attached to safety transitions and audit rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    None,
    SchemaVersionMismatch,
    ContractVersionMismatch,
    BackfillWindowExceeded,
    MaintenanceSkipApplied,
    ReconcileCritical,
    SnapshotStale,
    ExecutionRetryBudgetExceeded,
    OperatorAction,
    StartupFailure,
    AutoRecovery,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::None => "NONE",
            ReasonCode::SchemaVersionMismatch => "SCHEMA_VERSION_MISMATCH",
            ReasonCode::ContractVersionMismatch => "CONTRACT_VERSION_MISMATCH",
            ReasonCode::BackfillWindowExceeded => "BACKFILL_WINDOW_EXCEEDED",
            ReasonCode::MaintenanceSkipApplied => "MAINTENANCE_SKIP_APPLIED",
            ReasonCode::ReconcileCritical => "RECONCILE_CRITICAL",
            ReasonCode::SnapshotStale => "SNAPSHOT_STALE",
            ReasonCode::ExecutionRetryBudgetExceeded => "EXECUTION_RETRY_BUDGET_EXCEEDED",
            ReasonCode::OperatorAction => "OPERATOR_ACTION",
            ReasonCode::StartupFailure => "STARTUP_FAILURE",
            ReasonCode::AutoRecovery => "AUTO_RECOVERY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NONE" => Some(ReasonCode::None),
            "SCHEMA_VERSION_MISMATCH" => Some(ReasonCode::SchemaVersionMismatch),
            "CONTRACT_VERSION_MISMATCH" => Some(ReasonCode::ContractVersionMismatch),
            "BACKFILL_WINDOW_EXCEEDED" => Some(ReasonCode::BackfillWindowExceeded),
            "MAINTENANCE_SKIP_APPLIED" => Some(ReasonCode::MaintenanceSkipApplied),
            "RECONCILE_CRITICAL" => Some(ReasonCode::ReconcileCritical),
            "SNAPSHOT_STALE" => Some(ReasonCode::SnapshotStale),
            "EXECUTION_RETRY_BUDGET_EXCEEDED" => Some(ReasonCode::ExecutionRetryBudgetExceeded),
            "OPERATOR_ACTION" => Some(ReasonCode::OperatorAction),
            "STARTUP_FAILURE" => Some(ReasonCode::StartupFailure),
            "AUTO_RECOVERY" => Some(ReasonCode::AutoRecovery),
            _ => None,
        }
    }
}

/// Store-backed singleton: current safety mode plus its provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyState {
    pub mode: SafetyMode,
    pub reason_code: ReasonCode,
    pub reason_message: String,
    pub changed_at_ms: i64,
}

impl SafetyState {
    /// Boot default before any persisted state exists.
    pub fn initial(now_ms: i64) -> Self {
        Self {
            mode: SafetyMode::ArmedSafe,
            reason_code: ReasonCode::None,
            reason_message: "boot default".to_string(),
            changed_at_ms: now_ms,
        }
    }
}
