//! Reconciliation of stored hedge positions against live exchange state
//!
//! Runs on a fixed interval and on demand:
//! - Both legs flat: the position is completed
//! - Both legs open and matching the record: nothing to do
//! - One leg flat: flagged as unhedged for manual review, never auto-resolved
//! - Side or size disagreement: flagged for manual review

use chrono::{DateTime, Utc};
use futures::future::join_all;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::ReconciliationConfig;
use crate::coordination::ShutdownListener;
use crate::domain::{
    ExecutionPhase, FaultKind, HedgePosition, LegRole, LivePosition, PositionFault, PositionId,
    PositionPatch, PositionStatus,
};
use crate::error::{HedgeError, Result};
use crate::exchange::{ConnectorRegistry, TickerCache};
use crate::execution::PositionLocks;
use crate::store::HedgePositionStore;

pub(crate) const BOTH_CLOSED_NOTE: &str = "synced: both legs already closed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileAction {
    NoOp,
    MarkCompleted,
    FlagForManualReview,
}

impl std::fmt::Display for ReconcileAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconcileAction::NoOp => write!(f, "no_op"),
            ReconcileAction::MarkCompleted => write!(f, "mark_completed"),
            ReconcileAction::FlagForManualReview => write!(f, "flag_for_manual_review"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub position_id: PositionId,
    pub action: ReconcileAction,
    pub previous_status: PositionStatus,
    pub status: PositionStatus,
    pub message: Option<String>,
    pub primary: Option<LivePosition>,
    pub hedge: Option<LivePosition>,
    /// Whether the stored record was modified
    pub updated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepFailure {
    pub position_id: PositionId,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepReport {
    pub timestamp: DateTime<Utc>,
    pub checked: usize,
    pub completed: usize,
    pub flagged: usize,
    pub unchanged: usize,
    pub duration_ms: u64,
    /// Query failures, retried on the next sweep
    pub failures: Vec<SweepFailure>,
    pub reports: Vec<ReconcileReport>,
}

/// Comparison of a stored record with both live legs
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Assessment {
    BothFlat,
    Matching,
    Unhedged { missing: LegRole },
    Mismatch { legs: Vec<(LegRole, String)> },
}

pub(crate) fn assess(
    position: &HedgePosition,
    primary: &LivePosition,
    hedge: &LivePosition,
    tolerance: Decimal,
) -> Assessment {
    match (primary.is_open(), hedge.is_open()) {
        (false, false) => return Assessment::BothFlat,
        (true, false) => return Assessment::Unhedged { missing: LegRole::Hedge },
        (false, true) => return Assessment::Unhedged { missing: LegRole::Primary },
        (true, true) => {}
    }

    let legs: Vec<(LegRole, String)> = [(LegRole::Primary, primary), (LegRole::Hedge, hedge)]
        .into_iter()
        .filter_map(|(role, live)| {
            let recorded = position.leg(role);
            let side_ok = live.side == Some(recorded.side);
            let size_ok =
                (live.quantity.abs() - recorded.quantity).abs() <= tolerance * recorded.quantity;
            if side_ok && size_ok {
                return None;
            }
            let live_side = live
                .side
                .map(|s| s.to_string())
                .unwrap_or_else(|| "UNKNOWN".to_string());
            Some((
                role,
                format!(
                    "{} on {}: recorded {} {}, live {} {}",
                    role, recorded.exchange, recorded.side, recorded.quantity, live_side, live.quantity
                ),
            ))
        })
        .collect();

    if legs.is_empty() {
        Assessment::Matching
    } else {
        Assessment::Mismatch { legs }
    }
}

/// Patch completing a position whose legs are both flat
pub(crate) fn completion_patch(position: &HedgePosition, note: &str) -> PositionPatch {
    let mut patch = PositionPatch::new()
        .status(PositionStatus::Completed)
        .completed_now()
        .note(note);
    if position.phase != ExecutionPhase::Exited
        && position.phase.can_transition_to(ExecutionPhase::Exited)
    {
        patch = patch.phase(ExecutionPhase::Exited);
    }
    patch
}

/// Patch moving a position to ERROR with `fault`, keeping the phase where
/// the state machine does not allow an edge to ERROR
pub(crate) fn error_patch(position: &HedgePosition, fault: PositionFault) -> PositionPatch {
    let mut patch = PositionPatch::new().status(PositionStatus::Error).fault(fault);
    if position.phase != ExecutionPhase::Error
        && position.phase.can_transition_to(ExecutionPhase::Error)
    {
        patch = patch.phase(ExecutionPhase::Error);
    }
    patch
}

pub struct ReconciliationEngine {
    pub(crate) connectors: ConnectorRegistry,
    pub(crate) store: Arc<dyn HedgePositionStore>,
    pub(crate) locks: Arc<PositionLocks>,
    pub(crate) tickers: Arc<TickerCache>,
    pub(crate) config: ReconciliationConfig,
}

impl ReconciliationEngine {
    pub fn new(
        connectors: ConnectorRegistry,
        store: Arc<dyn HedgePositionStore>,
        locks: Arc<PositionLocks>,
        tickers: Arc<TickerCache>,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            connectors,
            store,
            locks,
            tickers,
            config,
        }
    }

    /// Run the periodic sweep until shutdown
    pub async fn run(&self, mut shutdown: ShutdownListener) {
        let mut ticker = interval(Duration::from_secs(self.config.interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Starting reconciliation service (interval: {}s)",
            self.config.interval_secs
        );

        loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    info!("Reconciliation service stopped");
                    break;
                }
                _ = ticker.tick() => {
                    match self.sweep().await {
                        Ok(result) => {
                            let level_warn = result.flagged > 0 || !result.failures.is_empty();
                            if level_warn {
                                warn!(
                                    "Reconciliation completed: {} checked, {} completed, {} flagged, {} query failures ({}ms)",
                                    result.checked,
                                    result.completed,
                                    result.flagged,
                                    result.failures.len(),
                                    result.duration_ms
                                );
                            } else {
                                debug!(
                                    "Reconciliation completed: {} checked, {} completed ({}ms)",
                                    result.checked, result.completed, result.duration_ms
                                );
                            }
                        }
                        Err(e) => error!("Reconciliation sweep failed: {}", e),
                    }
                }
            }
        }
    }

    /// Reconcile every ACTIVE and ERROR position
    pub async fn sweep(&self) -> Result<SweepReport> {
        let start = Instant::now();
        let positions = self
            .store
            .find_by_status(&[PositionStatus::Active, PositionStatus::Error])
            .await?;

        let mut report = SweepReport {
            timestamp: Utc::now(),
            checked: positions.len(),
            completed: 0,
            flagged: 0,
            unchanged: 0,
            duration_ms: 0,
            failures: Vec::new(),
            reports: Vec::with_capacity(positions.len()),
        };

        for batch in positions.chunks(self.config.max_concurrent.max(1)) {
            let results = join_all(batch.iter().map(|position| self.reconcile(position))).await;
            for (position, result) in batch.iter().zip(results) {
                match result {
                    Ok(outcome) => {
                        match outcome.action {
                            ReconcileAction::MarkCompleted => report.completed += 1,
                            ReconcileAction::FlagForManualReview => report.flagged += 1,
                            ReconcileAction::NoOp => report.unchanged += 1,
                        }
                        report.reports.push(outcome);
                    }
                    Err(e) => report.failures.push(SweepFailure {
                        position_id: position.id,
                        error: e.to_string(),
                    }),
                }
            }
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        Ok(report)
    }

    pub async fn reconcile_by_id(&self, id: PositionId) -> Result<ReconcileReport> {
        let position = self.store.require(id).await?;
        self.reconcile(&position).await
    }

    /// Compare one position with both live legs and correct the record.
    ///
    /// Query failures leave the record untouched.
    pub async fn reconcile(&self, position: &HedgePosition) -> Result<ReconcileReport> {
        if !position.status.needs_reconciliation() {
            return Ok(unchanged(position, None, None));
        }

        let exclusive = self.locks.exclusive(position.id).await;
        // Re-read: an in-flight action may have moved the record while we waited
        let position = self.store.require(position.id).await?;
        if !position.status.needs_reconciliation() {
            return Ok(unchanged(&position, None, None));
        }
        if self.locks.exit_in_flight(position.id) {
            debug!(position_id = %position.id, "exit in flight, deferring to next sweep");
            return Ok(unchanged(&position, None, None));
        }

        let (primary, hedge) = self.live_legs(&position).await?;
        let assessment = assess(&position, &primary, &hedge, self.config.quantity_tolerance);
        debug!(position_id = %position.id, ?assessment, "position assessed");

        let (action, patch) = match assessment {
            Assessment::Matching => {
                return Ok(unchanged(&position, Some(primary), Some(hedge)));
            }
            Assessment::BothFlat => {
                info!(position_id = %position.id, "both legs flat, completing position");
                (
                    ReconcileAction::MarkCompleted,
                    Some(completion_patch(&position, BOTH_CLOSED_NOTE)),
                )
            }
            Assessment::Unhedged { missing } => {
                let open = missing.other();
                let open_live = match open {
                    LegRole::Primary => &primary,
                    LegRole::Hedge => &hedge,
                };
                let detail = format!(
                    "{}; {} leg on {} still open ({} {})",
                    HedgeError::UnhedgedDrift {
                        position_id: position.id,
                        missing,
                    },
                    open,
                    position.leg(open).exchange,
                    open_live
                        .side
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| "UNKNOWN".to_string()),
                    open_live.quantity
                );
                let fault = PositionFault::new(FaultKind::UnhedgedDrift, detail)
                    .with_leg(missing, position.leg(missing).exchange)
                    .with_remediation("flagged for manual review");
                error!(position_id = %position.id, fault = %fault, "unhedged position detected");
                (
                    ReconcileAction::FlagForManualReview,
                    self.flag_patch(&position, fault),
                )
            }
            Assessment::Mismatch { legs } => {
                let mut fault = PositionFault::new(
                    FaultKind::LegMismatch,
                    legs.iter()
                        .map(|(_, detail)| detail.as_str())
                        .collect::<Vec<_>>()
                        .join("; "),
                )
                .with_remediation("flagged for manual review");
                for (role, _) in &legs {
                    fault = fault.with_leg(*role, position.leg(*role).exchange);
                }
                warn!(position_id = %position.id, fault = %fault, "live legs disagree with record");
                (
                    ReconcileAction::FlagForManualReview,
                    self.flag_patch(&position, fault),
                )
            }
        };

        let (status, message, updated) = match patch {
            Some(patch) => {
                let record = self.store.update(position.id, &patch).await?;
                (record.status, record.error_message, true)
            }
            None => (position.status, position.error_message.clone(), false),
        };
        if status.is_terminal() {
            drop(exclusive);
            self.locks.release(position.id);
        }

        Ok(ReconcileReport {
            position_id: position.id,
            action,
            previous_status: position.status,
            status,
            message,
            primary: Some(primary),
            hedge: Some(hedge),
            updated,
        })
    }

    /// Error patch, or `None` when the identical fault is already recorded
    fn flag_patch(&self, position: &HedgePosition, fault: PositionFault) -> Option<PositionPatch> {
        if position.status == PositionStatus::Error && position.fault.as_ref() == Some(&fault) {
            debug!(position_id = %position.id, "fault already recorded");
            return None;
        }
        Some(error_patch(position, fault))
    }

    /// Query both legs concurrently
    pub(crate) async fn live_legs(
        &self,
        position: &HedgePosition,
    ) -> Result<(LivePosition, LivePosition)> {
        let (primary, hedge) = tokio::join!(
            self.live_leg(position, LegRole::Primary),
            self.live_leg(position, LegRole::Hedge)
        );
        Ok((primary?, hedge?))
    }

    async fn live_leg(&self, position: &HedgePosition, role: LegRole) -> Result<LivePosition> {
        let exchange = position.leg(role).exchange;
        let query = async {
            let connector = self.connectors.get(exchange)?;
            connector.get_position(&position.symbol).await
        };
        query.await.map_err(|e| {
            warn!(position_id = %position.id, %role, %exchange, error = %e, "position query failed");
            HedgeError::ReconciliationQuery {
                exchange,
                reason: e.to_string(),
            }
        })
    }
}

fn unchanged(
    position: &HedgePosition,
    primary: Option<LivePosition>,
    hedge: Option<LivePosition>,
) -> ReconcileReport {
    ReconcileReport {
        position_id: position.id,
        action: ReconcileAction::NoOp,
        previous_status: position.status,
        status: position.status,
        message: position.error_message.clone(),
        primary,
        hedge,
        updated: false,
    }
}
