//! Operator-driven repair of ERROR positions

use futures::future::join_all;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::{
    ExchangeId, ExecutionPhase, FaultKind, HedgePosition, LegRole, LivePosition, PositionFault,
    PositionId, PositionPatch, PositionSide, PositionStatus, ProtectiveOrders,
};
use crate::error::{HedgeError, Result};

use super::engine::{completion_patch, error_patch, ReconciliationEngine, BOTH_CLOSED_NOTE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealOutcome {
    /// Both legs were already flat; position completed
    Completed,
    /// Both legs open and protected; position back to ACTIVE
    Restored,
    /// Both legs open and protected; waiting for `confirm_heal`
    AwaitingConfirmation,
    /// At least one leg could not be protected or is missing
    Partial,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegHealReport {
    pub role: LegRole,
    pub exchange: ExchangeId,
    pub open: bool,
    pub side: Option<PositionSide>,
    pub quantity: Decimal,
    pub reference_price: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub protected: bool,
    pub error: Option<String>,
}

impl LegHealReport {
    fn summary(&self) -> String {
        let leg = format!("{}@{}", self.role, self.exchange);
        match (&self.error, self.open, self.protected) {
            (Some(error), _, _) => format!("{} not protected: {}", leg, error),
            (None, false, _) => format!("{} flat", leg),
            (None, true, true) => format!(
                "{} protected (tp {}, sl {})",
                leg,
                fmt_level(self.take_profit),
                fmt_level(self.stop_loss)
            ),
            (None, true, false) => format!("{} open", leg),
        }
    }
}

fn fmt_level(level: Option<Decimal>) -> String {
    level
        .map(|p| p.normalize().to_string())
        .unwrap_or_else(|| "-".to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealReport {
    pub position_id: PositionId,
    pub outcome: HealOutcome,
    pub legs: Vec<LegHealReport>,
    pub status: PositionStatus,
    pub message: Option<String>,
}

impl ReconciliationEngine {
    /// Re-protect the live legs of a position and restore it when both are
    /// open and protected
    pub async fn heal(&self, id: PositionId) -> Result<HealReport> {
        let exclusive = self.locks.exclusive(id).await;
        let position = self.store.require(id).await?;
        if !position.status.needs_reconciliation() {
            return Err(HedgeError::Validation(format!(
                "heal applies to ACTIVE or ERROR positions, {} is {}",
                id, position.status
            )));
        }
        if self.locks.exit_in_flight(id) {
            return Err(HedgeError::Validation(format!(
                "position {} is exiting; heal once the exit settles",
                id
            )));
        }

        let (primary, hedge) = self.live_legs(&position).await?;
        if !primary.is_open() && !hedge.is_open() {
            let record = self
                .store
                .update(id, &completion_patch(&position, BOTH_CLOSED_NOTE))
                .await?;
            info!(position_id = %id, "heal: both legs flat, position completed");
            drop(exclusive);
            self.locks.release(id);
            return Ok(HealReport {
                position_id: id,
                outcome: HealOutcome::Completed,
                legs: vec![
                    flat_report(&position, LegRole::Primary),
                    flat_report(&position, LegRole::Hedge),
                ],
                status: record.status,
                message: record.error_message,
            });
        }

        let legs = join_all(
            [(LegRole::Primary, &primary), (LegRole::Hedge, &hedge)]
                .into_iter()
                .map(|(role, live)| self.protect_leg(&position, role, live)),
        )
        .await;

        let both_open = primary.is_open() && hedge.is_open();
        let all_protected = legs.iter().filter(|l| l.open).all(|l| l.protected);
        let summary = legs
            .iter()
            .map(LegHealReport::summary)
            .collect::<Vec<_>>()
            .join("; ");

        let mut patch = PositionPatch::new();
        for leg in legs.iter().filter(|l| l.open && l.error.is_none()) {
            let mut recorded = position.leg(leg.role).clone();
            if recorded.quantity != leg.quantity || recorded.entry_price.is_none() {
                recorded.quantity = leg.quantity;
                recorded.entry_price = recorded.entry_price.or(leg.reference_price);
                patch = patch.leg(leg.role, recorded);
            }
        }

        let (outcome, patch) = if both_open && all_protected {
            if self.config.heal_requires_confirmation {
                let fault = PositionFault::new(
                    FaultKind::HealPendingConfirmation,
                    format!("{}; awaiting operator confirmation", summary),
                )
                .with_leg(LegRole::Primary, position.primary.exchange)
                .with_leg(LegRole::Hedge, position.hedge.exchange)
                .with_remediation("run confirm-heal to resume");
                (HealOutcome::AwaitingConfirmation, merge(patch, error_patch(&position, fault)))
            } else {
                (HealOutcome::Restored, merge(patch, restore_patch(&position, &summary)))
            }
        } else {
            let mut fault = PositionFault::new(FaultKind::HealFailed, summary)
                .with_remediation("manual review required");
            for leg in legs.iter().filter(|l| !l.open || !l.protected) {
                fault = fault.with_leg(leg.role, leg.exchange);
            }
            (HealOutcome::Partial, merge(patch, error_patch(&position, fault)))
        };

        let record = self.store.update(id, &patch).await?;
        match outcome {
            HealOutcome::Partial => warn!(
                position_id = %id,
                message = record.error_message.as_deref().unwrap_or_default(),
                "heal incomplete"
            ),
            _ => info!(position_id = %id, ?outcome, "heal applied"),
        }

        Ok(HealReport {
            position_id: id,
            outcome,
            legs,
            status: record.status,
            message: record.error_message,
        })
    }

    /// Operator confirmation of a heal awaiting confirmation.
    ///
    /// Both legs are re-queried; the position is only restored if they are
    /// still open on their recorded sides.
    pub async fn confirm_heal(&self, id: PositionId) -> Result<HealReport> {
        let _exclusive = self.locks.exclusive(id).await;
        let position = self.store.require(id).await?;
        let pending = position
            .fault
            .as_ref()
            .map(|f| f.kind == FaultKind::HealPendingConfirmation)
            .unwrap_or(false);
        if !pending {
            return Err(HedgeError::Validation(format!(
                "position {} has no heal awaiting confirmation",
                id
            )));
        }

        let (primary, hedge) = self.live_legs(&position).await?;
        let legs: Vec<LegHealReport> = [(LegRole::Primary, &primary), (LegRole::Hedge, &hedge)]
            .into_iter()
            .map(|(role, live)| LegHealReport {
                role,
                exchange: position.leg(role).exchange,
                open: live.is_open(),
                side: live.side,
                quantity: live.quantity,
                reference_price: live.entry_price,
                take_profit: None,
                stop_loss: None,
                protected: false,
                error: None,
            })
            .collect();

        let intact = legs
            .iter()
            .all(|l| l.open && l.side == Some(position.leg(l.role).side));
        if !intact {
            return Err(HedgeError::Validation(format!(
                "legs of {} changed since heal; run heal again",
                id
            )));
        }

        let record = self
            .store
            .update(id, &restore_patch(&position, "heal confirmed by operator"))
            .await?;
        info!(position_id = %id, "heal confirmed, position active");

        Ok(HealReport {
            position_id: id,
            outcome: HealOutcome::Restored,
            legs,
            status: record.status,
            message: record.error_message,
        })
    }

    async fn protect_leg(
        &self,
        position: &HedgePosition,
        role: LegRole,
        live: &LivePosition,
    ) -> LegHealReport {
        let recorded = position.leg(role);
        let mut report = LegHealReport {
            role,
            exchange: recorded.exchange,
            open: live.is_open(),
            side: live.side,
            quantity: live.quantity.abs(),
            reference_price: None,
            take_profit: None,
            stop_loss: None,
            protected: false,
            error: None,
        };
        if !live.is_open() {
            return report;
        }

        let side = live.side.unwrap_or(recorded.side);
        if side != recorded.side {
            report.error = Some(format!(
                "live side {} differs from recorded {}",
                side, recorded.side
            ));
            return report;
        }

        let reference = live
            .entry_price
            .or_else(|| self.tickers.reference_price(recorded.exchange, &position.symbol))
            .or(live.mark_price);
        let Some(reference) = reference else {
            report.error = Some("no reference price".to_string());
            return report;
        };
        report.reference_price = Some(reference);

        let orders = ProtectiveOrders::from_percentages(
            position.symbol.clone(),
            side,
            report.quantity,
            reference,
            position.take_profit_percent,
            position.stop_loss_percent,
        );
        report.take_profit = orders.take_profit;
        report.stop_loss = orders.stop_loss;
        if orders.is_empty() {
            // No levels configured for this position
            report.protected = true;
            return report;
        }

        let result = match self.connectors.get(recorded.exchange) {
            Ok(connector) => connector.set_protective_orders(&orders).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => report.protected = true,
            Err(e) => {
                warn!(position_id = %position.id, %role, exchange = %recorded.exchange, error = %e, "protective orders failed");
                report.error = Some(e.to_string());
            }
        }
        report
    }
}

fn flat_report(position: &HedgePosition, role: LegRole) -> LegHealReport {
    LegHealReport {
        role,
        exchange: position.leg(role).exchange,
        open: false,
        side: None,
        quantity: Decimal::ZERO,
        reference_price: None,
        take_profit: None,
        stop_loss: None,
        protected: false,
        error: None,
    }
}

fn restore_patch(position: &HedgePosition, note: &str) -> PositionPatch {
    let mut patch = PositionPatch::new()
        .status(PositionStatus::Active)
        .note(format!("healed: {}", note));
    if position.phase != ExecutionPhase::Entered
        && position.phase.can_transition_to(ExecutionPhase::Entered)
    {
        patch = patch.phase(ExecutionPhase::Entered);
    }
    patch
}

/// Leg updates from `legs` combined with the status patch
fn merge(legs: PositionPatch, status: PositionPatch) -> PositionPatch {
    PositionPatch {
        primary: legs.primary.or(status.primary),
        hedge: legs.hedge.or(status.hedge),
        ..status
    }
}
