//! Safety mode controller.
//!
//! # Invariants
//!
//! - **Fail-closed boot**: a process never boots into ARMED_LIVE. Persisted
//!   HALT survives restart (with its reason); anything else boots ARMED_SAFE.
//! - **Sticky HALT**: while halted, reconcile outcomes cannot re-arm the
//!   system except through the explicit auto-recovery gate below.
//! - **ARMED_SAFE → ARMED_LIVE is never automatic**; only an operator
//!   transition does that.
//! - **No auto-increase**: nothing in this controller ever produces an
//!   exposure-increasing repair; it only gates.

use pf_schemas::{ReasonCode, SafetyMode, SafetyState};

use crate::reconcile::{ReconcileOutcome, ReconcileReport};

/// A mode change the runtime must persist (audit row + singleton).
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub next: SafetyState,
}

/// Execution-adapter health evidence for the auto-recovery gate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutionHealth {
    /// Last successful venue call, ms epoch. 0 = never.
    pub last_success_ms: i64,
    /// Last venue exception, ms epoch. 0 = never.
    pub last_error_ms: i64,
}

impl ExecutionHealth {
    /// Healthy = a success within the window and no exception within it.
    pub fn is_healthy(&self, now_ms: i64, window_ms: i64) -> bool {
        let success_fresh =
            self.last_success_ms > 0 && now_ms.saturating_sub(self.last_success_ms) <= window_ms;
        let error_quiet =
            self.last_error_ms == 0 || now_ms.saturating_sub(self.last_error_ms) > window_ms;
        success_fresh && error_quiet
    }
}

/// In-memory safety state machine. The runtime persists every transition it
/// returns before acting on it.
#[derive(Debug, Clone)]
pub struct SafetyController {
    state: SafetyState,
    /// Consecutive non-critical reconciliations since the last critical one.
    consecutive_clean: u32,
    /// Required count before HALT may auto-recover.
    auto_recovery_consecutive_clean: u32,
    /// Adapter health lookback.
    adapter_health_window_ms: i64,
    /// An unresolved gap-guard violation blocks auto-recovery.
    gap_violation: bool,
    /// The operator's one-shot bypass was applied for the current gap.
    maintenance_skip_applied: bool,
}

impl SafetyController {
    /// Fail-closed boot from the persisted state.
    ///
    /// | Persisted              | Boot result                          |
    /// |------------------------|--------------------------------------|
    /// | none                   | ARMED_SAFE (boot default)            |
    /// | HALT { reason }        | HALT { reason } (preserved)          |
    /// | ARMED_LIVE / ARMED_SAFE| ARMED_SAFE (re-arm is explicit)      |
    pub fn boot(
        persisted: Option<SafetyState>,
        auto_recovery_consecutive_clean: u32,
        adapter_health_window_ms: i64,
        now_ms: i64,
    ) -> Self {
        let state = match persisted {
            Some(st) if st.mode == SafetyMode::Halt => st,
            Some(st) => SafetyState {
                mode: SafetyMode::ArmedSafe,
                reason_code: ReasonCode::None,
                reason_message: format!("boot demotion from {}", st.mode.as_str()),
                changed_at_ms: now_ms,
            },
            None => SafetyState::initial(now_ms),
        };

        Self {
            state,
            consecutive_clean: 0,
            auto_recovery_consecutive_clean,
            adapter_health_window_ms,
            gap_violation: false,
            maintenance_skip_applied: false,
        }
    }

    pub fn state(&self) -> &SafetyState {
        &self.state
    }

    pub fn mode(&self) -> SafetyMode {
        self.state.mode
    }

    /// Apply a transition the runtime has already persisted.
    pub fn commit(&mut self, t: &Transition) {
        self.state = t.next.clone();
    }

    fn transition_to(
        &self,
        mode: SafetyMode,
        reason_code: ReasonCode,
        reason_message: String,
        now_ms: i64,
    ) -> Transition {
        Transition {
            next: SafetyState {
                mode,
                reason_code,
                reason_message,
                changed_at_ms: now_ms,
            },
        }
    }

    // -----------------------------------------------------------------------
    // Direct triggers
    // -----------------------------------------------------------------------

    /// HALT from any subsystem (gap guard, schema gate, retry budget).
    /// Already-halted state is left untouched so the first reason survives.
    pub fn halt(
        &self,
        reason_code: ReasonCode,
        reason_message: impl Into<String>,
        now_ms: i64,
    ) -> Option<Transition> {
        if self.state.mode == SafetyMode::Halt {
            return None;
        }
        Some(self.transition_to(SafetyMode::Halt, reason_code, reason_message.into(), now_ms))
    }

    /// Downgrade to ARMED_SAFE. No-op when already at or below.
    pub fn demote_to_safe(
        &self,
        reason_code: ReasonCode,
        reason_message: impl Into<String>,
        now_ms: i64,
    ) -> Option<Transition> {
        if self.state.mode != SafetyMode::ArmedLive {
            return None;
        }
        Some(self.transition_to(
            SafetyMode::ArmedSafe,
            reason_code,
            reason_message.into(),
            now_ms,
        ))
    }

    /// Explicit operator arm to ARMED_LIVE. The only path to full operation.
    pub fn operator_arm_live(&self, now_ms: i64) -> Option<Transition> {
        if self.state.mode != SafetyMode::ArmedSafe {
            return None;
        }
        Some(self.transition_to(
            SafetyMode::ArmedLive,
            ReasonCode::OperatorAction,
            "operator armed live".to_string(),
            now_ms,
        ))
    }

    /// Record a gap-guard violation (blocks auto-recovery until skipped).
    pub fn note_gap_violation(&mut self) {
        self.gap_violation = true;
    }

    /// Record that the operator's maintenance skip was applied for the gap.
    pub fn note_maintenance_skip(&mut self) {
        self.maintenance_skip_applied = true;
    }

    // -----------------------------------------------------------------------
    // Reconciliation-driven transitions
    // -----------------------------------------------------------------------

    /// Fold one reconcile report into the controller.
    ///
    /// `health` is the execution-adapter evidence for the auto-recovery gate;
    /// without it a halted controller stays halted. Returns the transition
    /// the runtime must persist, if any.
    pub fn apply_report(
        &mut self,
        report: &ReconcileReport,
        health: Option<ExecutionHealth>,
        now_ms: i64,
    ) -> Option<Transition> {
        match report.outcome {
            ReconcileOutcome::Critical => {
                self.consecutive_clean = 0;
                self.halt(ReasonCode::ReconcileCritical, report.summary(), now_ms)
            }
            ReconcileOutcome::SnapshotStale => {
                self.consecutive_clean = self.consecutive_clean.saturating_add(1);
                self.demote_to_safe(ReasonCode::SnapshotStale, report.summary(), now_ms)
            }
            _ => {
                self.consecutive_clean = self.consecutive_clean.saturating_add(1);
                if report.outcome == ReconcileOutcome::Warn {
                    tracing::warn!(max_drift = report.max_drift, "reconcile drift warning");
                }
                self.try_auto_recovery(now_ms, health)
            }
        }
    }

    /// HALT → ARMED_SAFE auto-recovery gate. All conditions must hold:
    /// enough consecutive non-critical reconciliations, a fresh snapshot
    /// (implied by the caller passing a non-stale report), no unskipped gap
    /// violation, healthy execution adapter, and a HALT reason on the
    /// allowlist. Recovery to ARMED_LIVE never happens here.
    fn try_auto_recovery(
        &self,
        now_ms: i64,
        health: Option<ExecutionHealth>,
    ) -> Option<Transition> {
        if self.state.mode != SafetyMode::Halt {
            return None;
        }
        if self.consecutive_clean < self.auto_recovery_consecutive_clean {
            return None;
        }
        if self.gap_violation && !self.maintenance_skip_applied {
            return None;
        }
        match health {
            Some(h) if !h.is_healthy(now_ms, self.adapter_health_window_ms) => return None,
            None => return None,
            _ => {}
        }

        let allowed = match self.state.reason_code {
            ReasonCode::SnapshotStale | ReasonCode::ReconcileCritical => true,
            ReasonCode::BackfillWindowExceeded => self.maintenance_skip_applied,
            _ => false,
        };
        if !allowed {
            return None;
        }

        Some(self.transition_to(
            SafetyMode::ArmedSafe,
            ReasonCode::AutoRecovery,
            format!(
                "auto-recovery after {} consecutive non-critical reconciliations (halt reason was {})",
                self.consecutive_clean,
                self.state.reason_code.as_str()
            ),
            now_ms,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn halted(reason: ReasonCode) -> SafetyController {
        let mut c = SafetyController::boot(None, 3, 60_000, 0);
        let t = c.halt(reason, "test halt", 10).unwrap();
        c.commit(&t);
        c
    }

    fn clean_report() -> ReconcileReport {
        ReconcileReport {
            outcome: ReconcileOutcome::Clean,
            max_drift: 0.0,
            drifts: Default::default(),
            missing_on_venue: vec![],
            missing_locally: vec![],
            snapshot_age_ms: 100,
        }
    }

    fn healthy(now: i64) -> ExecutionHealth {
        ExecutionHealth {
            last_success_ms: now - 1000,
            last_error_ms: 0,
        }
    }

    #[test]
    fn boot_never_arms_live() {
        let persisted = SafetyState {
            mode: SafetyMode::ArmedLive,
            reason_code: ReasonCode::None,
            reason_message: String::new(),
            changed_at_ms: 0,
        };
        let c = SafetyController::boot(Some(persisted), 3, 60_000, 100);
        assert_eq!(c.mode(), SafetyMode::ArmedSafe);
    }

    #[test]
    fn boot_preserves_halt_reason() {
        let persisted = SafetyState {
            mode: SafetyMode::Halt,
            reason_code: ReasonCode::BackfillWindowExceeded,
            reason_message: "gap".to_string(),
            changed_at_ms: 5,
        };
        let c = SafetyController::boot(Some(persisted.clone()), 3, 60_000, 100);
        assert_eq!(c.state(), &persisted);
    }

    #[test]
    fn halt_is_sticky_first_reason_wins() {
        let c = halted(ReasonCode::ReconcileCritical);
        assert!(c
            .halt(ReasonCode::ExecutionRetryBudgetExceeded, "later", 20)
            .is_none());
        assert_eq!(c.state().reason_code, ReasonCode::ReconcileCritical);
    }

    #[test]
    fn operator_arm_only_from_safe() {
        let mut c = SafetyController::boot(None, 3, 60_000, 0);
        assert_eq!(c.mode(), SafetyMode::ArmedSafe);
        let t = c.operator_arm_live(50).unwrap();
        c.commit(&t);
        assert_eq!(c.mode(), SafetyMode::ArmedLive);
        // From HALT, operator arm is refused.
        let c = halted(ReasonCode::ReconcileCritical);
        assert!(c.operator_arm_live(60).is_none());
    }

    #[test]
    fn auto_recovery_needs_consecutive_cleans() {
        let mut c = halted(ReasonCode::ReconcileCritical);
        let now = 100_000;
        assert!(c
            .apply_report(&clean_report(), Some(healthy(now)), now)
            .is_none());
        assert!(c
            .apply_report(&clean_report(), Some(healthy(now)), now)
            .is_none());
        let t = c
            .apply_report(&clean_report(), Some(healthy(now)), now)
            .expect("third clean recovers");
        assert_eq!(t.next.mode, SafetyMode::ArmedSafe);
        assert_eq!(t.next.reason_code, ReasonCode::AutoRecovery);
    }

    #[test]
    fn critical_resets_the_counter() {
        let mut c = halted(ReasonCode::ReconcileCritical);
        let now = 100_000;
        c.apply_report(&clean_report(), Some(healthy(now)), now);
        c.apply_report(&clean_report(), Some(healthy(now)), now);
        let critical = ReconcileReport {
            outcome: ReconcileOutcome::Critical,
            ..clean_report()
        };
        c.apply_report(&critical, Some(healthy(now)), now);
        // Needs three fresh cleans again.
        assert!(c
            .apply_report(&clean_report(), Some(healthy(now)), now)
            .is_none());
        assert!(c
            .apply_report(&clean_report(), Some(healthy(now)), now)
            .is_none());
        assert!(c
            .apply_report(&clean_report(), Some(healthy(now)), now)
            .is_some());
    }

    #[test]
    fn unhealthy_adapter_blocks_recovery() {
        let mut c = halted(ReasonCode::ReconcileCritical);
        let now = 100_000;
        let sick = ExecutionHealth {
            last_success_ms: now - 90_000,
            last_error_ms: now - 5_000,
        };
        for _ in 0..5 {
            assert!(c.apply_report(&clean_report(), Some(sick), now).is_none());
        }
    }

    #[test]
    fn gap_halt_recovers_only_with_maintenance_skip() {
        let now = 100_000;

        let mut c = halted(ReasonCode::BackfillWindowExceeded);
        c.note_gap_violation();
        for _ in 0..5 {
            assert!(c
                .apply_report(&clean_report(), Some(healthy(now)), now)
                .is_none());
        }

        let mut c = halted(ReasonCode::BackfillWindowExceeded);
        c.note_gap_violation();
        c.note_maintenance_skip();
        c.apply_report(&clean_report(), Some(healthy(now)), now);
        c.apply_report(&clean_report(), Some(healthy(now)), now);
        let t = c
            .apply_report(&clean_report(), Some(healthy(now)), now)
            .expect("skip unlocks recovery");
        assert_eq!(t.next.mode, SafetyMode::ArmedSafe);
    }

    #[test]
    fn non_allowlisted_reason_never_recovers() {
        let mut c = halted(ReasonCode::SchemaVersionMismatch);
        let now = 100_000;
        for _ in 0..10 {
            assert!(c
                .apply_report(&clean_report(), Some(healthy(now)), now)
                .is_none());
        }
    }

    #[test]
    fn recovery_lands_in_safe_never_live() {
        let mut c = halted(ReasonCode::ReconcileCritical);
        let now = 100_000;
        c.apply_report(&clean_report(), Some(healthy(now)), now);
        c.apply_report(&clean_report(), Some(healthy(now)), now);
        let t = c
            .apply_report(&clean_report(), Some(healthy(now)), now)
            .unwrap();
        assert_eq!(t.next.mode, SafetyMode::ArmedSafe);
        c.commit(&t);
        // And it stays there: further cleans do not escalate.
        assert!(c
            .apply_report(&clean_report(), Some(healthy(now)), now)
            .is_none());
    }
}
