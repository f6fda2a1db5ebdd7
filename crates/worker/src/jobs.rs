//! Job bodies, kept free of scheduler plumbing

use nexo_billing::{InvariantChecker, SessionReconciler, StaleOrderSweep, ViolationSeverity};
use time::{Duration, OffsetDateTime};
use tracing::{error, info, warn};

/// Orders younger than this are still expected to get their webhook
pub const STALE_ORDER_AGE: Duration = Duration::minutes(15);

/// Orders re-checked per sweep
pub const STALE_ORDER_BATCH: i64 = 100;

/// Re-check pending orders older than [`STALE_ORDER_AGE`] against Stripe
pub async fn sweep_stale_orders(
    reconciler: &SessionReconciler,
    now: OffsetDateTime,
) -> Option<StaleOrderSweep> {
    match reconciler
        .reconcile_stale_orders(now - STALE_ORDER_AGE, STALE_ORDER_BATCH)
        .await
    {
        Ok(sweep) => {
            log_sweep(&sweep);
            Some(sweep)
        }
        Err(e) => {
            error!(error = %e, "Stale order sweep failed");
            None
        }
    }
}

fn log_sweep(sweep: &StaleOrderSweep) {
    if sweep.checked == 0 {
        return;
    }
    info!(
        checked = sweep.checked,
        fulfilled = sweep.fulfilled,
        cancelled = sweep.cancelled,
        still_pending = sweep.still_pending,
        failed = sweep.failed,
        "Stale order sweep complete"
    );
    if sweep.fulfilled > 0 {
        // Both the webhook and the success-page poll were lost for these
        warn!(fulfilled = sweep.fulfilled, "Recovered paid orders without webhook delivery");
    }
}

pub async fn check_invariants(checker: &InvariantChecker) {
    let summary = match checker.run_all_checks().await {
        Ok(summary) => summary,
        Err(e) => {
            error!(error = %e, "Invariant check failed to run");
            return;
        }
    };

    if summary.healthy {
        info!(checks_run = summary.checks_run, "All entitlement invariants hold");
        return;
    }

    for violation in &summary.violations {
        match violation.severity {
            ViolationSeverity::Critical | ViolationSeverity::High => error!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                users = violation.user_ids.len(),
                context = %violation.context,
                "{}",
                violation.description
            ),
            ViolationSeverity::Medium | ViolationSeverity::Low => warn!(
                invariant = %violation.invariant,
                severity = %violation.severity,
                users = violation.user_ids.len(),
                "{}",
                violation.description
            ),
        }
    }
    warn!(
        checks_failed = summary.checks_failed,
        violations = summary.violations.len(),
        worst = ?summary.worst_severity(),
        "Entitlement invariant violations found"
    );
}
