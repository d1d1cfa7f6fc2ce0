//! Two-leg hedge lifecycle: scheduled entry, scheduled exit, stop.
//!
//! Each leg action runs in its own timer task. Leg outcomes are joined per
//! position; whichever leg finishes second resolves the hedge.

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedRwLockReadGuard};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::ExecutionConfig;
use crate::domain::{
    ClosedLeg, ExchangeId, ExecutionPhase, FaultKind, HedgeLeg, HedgePosition, LegRole, OrderFill,
    OrderRequest, PnlReport, PositionFault, PositionId, PositionPatch, PositionStatus,
    ProtectiveOrders, TradePlan,
};
use crate::error::{HedgeError, Result};
use crate::exchange::{ConnectorRegistry, TickerCache};
use crate::store::HedgePositionStore;
use crate::timing::{ActionKind, ActionScheduler, CancelSummary};

use super::retry::submit_with_retry;
use super::PositionLocks;

#[derive(Debug, Clone)]
enum LegOutcome {
    Filled(OrderFill),
    Failed(String),
}

#[derive(Debug, Default)]
struct LegJoin {
    primary: Option<LegOutcome>,
    hedge: Option<LegOutcome>,
}

impl LegJoin {
    fn record(&mut self, role: LegRole, outcome: LegOutcome) {
        match role {
            LegRole::Primary => self.primary = Some(outcome),
            LegRole::Hedge => self.hedge = Some(outcome),
        }
    }

    fn is_complete(&self) -> bool {
        self.primary.is_some() && self.hedge.is_some()
    }

    fn into_outcomes(self) -> Option<(LegOutcome, LegOutcome)> {
        Some((self.primary?, self.hedge?))
    }
}

/// Per-leg result of a stop request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegCloseReport {
    pub role: LegRole,
    pub exchange: ExchangeId,
    pub closed: bool,
    pub fill_price: Option<Decimal>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopReport {
    pub position_id: PositionId,
    pub cancelled: CancelSummary,
    pub legs: Vec<LegCloseReport>,
    pub phase: ExecutionPhase,
    pub status: PositionStatus,
    pub message: Option<String>,
}

pub struct HedgeExecutionEngine {
    connectors: ConnectorRegistry,
    store: Arc<dyn HedgePositionStore>,
    scheduler: Arc<ActionScheduler>,
    tickers: Arc<TickerCache>,
    locks: Arc<PositionLocks>,
    config: ExecutionConfig,
    /// `true` once entry has resolved (either way) or the position stopped
    entries: DashMap<PositionId, watch::Sender<bool>>,
    entry_joins: DashMap<PositionId, LegJoin>,
    exit_joins: DashMap<PositionId, LegJoin>,
}

impl HedgeExecutionEngine {
    pub fn new(
        connectors: ConnectorRegistry,
        store: Arc<dyn HedgePositionStore>,
        scheduler: Arc<ActionScheduler>,
        tickers: Arc<TickerCache>,
        locks: Arc<PositionLocks>,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            connectors,
            store,
            scheduler,
            tickers,
            locks,
            config,
            entries: DashMap::new(),
            entry_joins: DashMap::new(),
            exit_joins: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn HedgePositionStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &Arc<ActionScheduler> {
        &self.scheduler
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Persist a new position and arm its entry and exit actions
    pub async fn schedule(self: &Arc<Self>, plan: TradePlan) -> Result<PositionId> {
        plan.validate()?;
        for leg in [&plan.primary, &plan.hedge] {
            self.connectors.get(leg.exchange)?;
        }

        let position = HedgePosition::from_plan(&plan);
        let id = position.id;
        self.store.create(&position).await?;
        info!(
            position_id = %id,
            symbol = %plan.symbol,
            primary = %plan.primary.exchange,
            hedge = %plan.hedge.exchange,
            entry_at = plan.entry_time_ms(),
            exit_at = plan.exit_time_ms(),
            "hedge scheduled"
        );

        self.subscribe_tickers(&position).await;
        let (entry_tx, _) = watch::channel(false);
        self.entries.insert(id, entry_tx);

        if let Err((role, e)) = self.arm_actions(id, &plan) {
            let summary = self.scheduler.cancel_position(id);
            self.finish_entry(id);
            let exchange = plan_leg_exchange(&plan, role);
            let fault = PositionFault::new(FaultKind::Scheduling, e.to_string())
                .with_leg(role, exchange)
                .with_remediation(format!(
                    "cancelled {} armed action(s); no orders placed",
                    summary.prevented_count()
                ));
            error!(position_id = %id, error = %e, "scheduling failed");
            if let Err(store_err) = self
                .store
                .update(
                    id,
                    &PositionPatch::new()
                        .phase(ExecutionPhase::Error)
                        .status(PositionStatus::Error)
                        .fault(fault),
                )
                .await
            {
                error!(position_id = %id, error = %store_err, "failed to record scheduling fault");
            }
            return Err(e);
        }

        Ok(id)
    }

    fn arm_actions(
        self: &Arc<Self>,
        id: PositionId,
        plan: &TradePlan,
    ) -> std::result::Result<(), (LegRole, HedgeError)> {
        let entry_at = plan.entry_time_ms();
        let exit_at = plan.exit_time_ms();

        for role in LegRole::BOTH {
            let engine = Arc::clone(self);
            self.scheduler
                .arm_action(
                    id,
                    ActionKind::entry(role),
                    plan_leg_exchange(plan, role),
                    entry_at,
                    move || async move { engine.run_entry_leg(id, role).await },
                )
                .map_err(|e| (role, e))?;
        }
        for role in LegRole::BOTH {
            let engine = Arc::clone(self);
            self.scheduler
                .arm_action(
                    id,
                    ActionKind::exit(role),
                    plan_leg_exchange(plan, role),
                    exit_at,
                    move || async move { engine.run_exit_leg(id, role).await },
                )
                .map_err(|e| (role, e))?;
        }
        Ok(())
    }

    async fn subscribe_tickers(&self, position: &HedgePosition) {
        for role in LegRole::BOTH {
            let exchange = position.leg(role).exchange;
            let Ok(connector) = self.connectors.get(exchange) else {
                continue;
            };
            let callback = self.tickers.subscriber(exchange, &position.symbol);
            if let Err(e) = connector.subscribe_ticker(&position.symbol, callback).await {
                debug!(%exchange, symbol = %position.symbol, error = %e, "ticker subscription unavailable");
            }
        }
    }

    async fn run_entry_leg(&self, id: PositionId, role: LegRole) {
        let _activity = self.locks.action(id).await;

        let position = match self.store.get(id).await {
            Ok(Some(position)) => position,
            Ok(None) => {
                warn!(position_id = %id, %role, "entry fired for unknown position");
                return;
            }
            Err(e) => {
                error!(position_id = %id, %role, error = %e, "entry could not load position");
                self.record_entry_outcome(id, role, None, LegOutcome::Failed(e.to_string()))
                    .await;
                return;
            }
        };
        if position.phase != ExecutionPhase::PendingEntry {
            info!(position_id = %id, %role, phase = %position.phase, "entry skipped");
            return;
        }

        let leg = position.leg(role).clone();
        let outcome = match self.open_leg(&position.symbol, &leg).await {
            Ok(fill) => {
                info!(
                    position_id = %id,
                    %role,
                    exchange = %leg.exchange,
                    side = %leg.side,
                    price = %fill.fill_price,
                    "entry filled"
                );
                LegOutcome::Filled(fill)
            }
            Err(e) => {
                error!(position_id = %id, %role, exchange = %leg.exchange, error = %e, "entry failed");
                LegOutcome::Failed(e.to_string())
            }
        };
        self.record_entry_outcome(id, role, Some(leg), outcome).await;
    }

    async fn record_entry_outcome(
        &self,
        id: PositionId,
        role: LegRole,
        leg: Option<HedgeLeg>,
        outcome: LegOutcome,
    ) {
        let record = self.locks.record(id).await;

        if let (LegOutcome::Filled(fill), Some(mut leg)) = (&outcome, leg) {
            leg.entry_price = Some(fill.fill_price);
            leg.quantity = fill.quantity;
            leg.entry_order_id = Some(fill.order_id.clone());
            leg.filled_at = Some(Utc::now());
            if let Err(e) = self.store.update(id, &PositionPatch::new().leg(role, leg)).await {
                error!(position_id = %id, %role, error = %e, "failed to persist entry fill");
            }
        }

        let complete = {
            let mut join = self.entry_joins.entry(id).or_default();
            join.record(role, outcome);
            join.is_complete()
        };
        if !complete {
            return;
        }
        let outcomes = self
            .entry_joins
            .remove(&id)
            .and_then(|(_, join)| join.into_outcomes());
        drop(record);

        if let Some((primary, hedge)) = outcomes {
            self.resolve_entry(id, primary, hedge).await;
        }
        self.finish_entry(id);
    }

    async fn resolve_entry(&self, id: PositionId, primary: LegOutcome, hedge: LegOutcome) {
        let position = match self
            .retry_store(id, "load position for entry join", || self.store.require(id))
            .await
        {
            Ok(position) => position,
            Err(e) => {
                error!(position_id = %id, error = %e, "entry join could not load position");
                return;
            }
        };

        // Fills come from the join, not the record: persisting a fill may have failed
        let outcomes = [(LegRole::Primary, primary), (LegRole::Hedge, hedge)];
        let filled: Vec<(LegRole, HedgeLeg)> = outcomes
            .iter()
            .filter_map(|(role, outcome)| match outcome {
                LegOutcome::Filled(fill) => Some((*role, filled_leg(position.leg(*role), fill))),
                LegOutcome::Failed(_) => None,
            })
            .collect();
        let failed: Vec<(LegRole, String)> = outcomes
            .iter()
            .filter_map(|(role, outcome)| match outcome {
                LegOutcome::Failed(reason) => Some((*role, reason.clone())),
                LegOutcome::Filled(_) => None,
            })
            .collect();

        if failed.is_empty() {
            let mut patch = PositionPatch::new()
                .phase(ExecutionPhase::Entered)
                .status(PositionStatus::Active)
                .clear_fault()
                .opened_now();
            for (role, leg) in &filled {
                patch = patch.leg(*role, leg.clone());
            }
            match self
                .retry_store(id, "record entry", || self.store.update(id, &patch))
                .await
            {
                Ok(entered) => {
                    info!(position_id = %id, symbol = %entered.symbol, "hedge entered");
                    self.protect_legs(&entered).await;
                }
                Err(e) => self.record_unrecorded_entry(&position, filled, e).await,
            }
            return;
        }

        let exits = self.scheduler.cancel_kinds(
            id,
            &[ActionKind::ExitPrimary, ActionKind::ExitHedge],
        );
        debug!(position_id = %id, cancelled = exits, "exit actions cancelled after entry failure");

        let mut fault_detail: Vec<String> = failed
            .iter()
            .map(|(role, reason)| {
                format!(
                    "{} entry on {} failed: {}",
                    role,
                    position.leg(*role).exchange,
                    reason
                )
            })
            .collect();
        let mut fault = PositionFault::new(FaultKind::LegExecution, String::new());
        for (role, _) in &failed {
            fault = fault.with_leg(*role, position.leg(*role).exchange);
        }

        let mut patch = PositionPatch::new()
            .phase(ExecutionPhase::Error)
            .status(PositionStatus::Error);

        let remediation = match filled.as_slice() {
            [] => "no leg filled; exit actions cancelled".to_string(),
            [(role, leg)] => {
                fault_detail.push(format!(
                    "{} leg on {} filled at {}",
                    role,
                    leg.exchange,
                    leg.entry_price.unwrap_or_default()
                ));
                let mut recorded = leg.clone();
                let remediation = if self.config.unwind_on_partial_entry {
                    match self.close_leg(&position.symbol, leg).await {
                        Ok(fill) => {
                            info!(position_id = %id, %role, exchange = %leg.exchange, "filled leg unwound");
                            recorded.exit_price = Some(fill.fill_price);
                            recorded.exit_order_id = Some(fill.order_id.clone());
                            format!("unwound {} leg on {} at {}", role, leg.exchange, fill.fill_price)
                        }
                        Err(e) => format!(
                            "unwind of {} leg on {} failed: {}; manual review required",
                            role, leg.exchange, e
                        ),
                    }
                } else {
                    format!("{} leg on {} left open for manual review", role, leg.exchange)
                };
                patch = patch.leg(*role, recorded);
                remediation
            }
            _ => "manual review required".to_string(),
        };
        fault.detail = fault_detail.join("; ");
        let fault = fault.with_remediation(remediation);
        error!(position_id = %id, fault = %fault, "hedge entry failed");

        let patch = patch.fault(fault);
        if let Err(e) = self
            .retry_store(id, "record entry failure", || self.store.update(id, &patch))
            .await
        {
            error!(position_id = %id, error = %e, "failed to record entry failure");
        }
    }

    /// Both legs filled but ENTERED could not be written. The record is moved
    /// to ERROR so a sweep picks it up, and the exits are cancelled because
    /// they only act on ENTERED positions.
    async fn record_unrecorded_entry(
        &self,
        position: &HedgePosition,
        filled: Vec<(LegRole, HedgeLeg)>,
        cause: HedgeError,
    ) {
        let id = position.id;
        let exits = self.scheduler.cancel_kinds(
            id,
            &[ActionKind::ExitPrimary, ActionKind::ExitHedge],
        );
        let fault = PositionFault::new(
            FaultKind::LegExecution,
            format!("both legs filled but the entry could not be recorded: {}", cause),
        )
        .with_leg(LegRole::Primary, position.primary.exchange)
        .with_leg(LegRole::Hedge, position.hedge.exchange)
        .with_remediation(format!(
            "cancelled {} exit action(s); heal or stop to resolve",
            exits
        ));
        error!(position_id = %id, fault = %fault, "hedge entered but not recorded");

        let mut patch = PositionPatch::new()
            .phase(ExecutionPhase::Error)
            .status(PositionStatus::Error)
            .fault(fault);
        for (role, leg) in filled {
            patch = patch.leg(role, leg);
        }
        if let Err(e) = self.store.update(id, &patch).await {
            error!(position_id = %id, error = %e, "failed to record entry fault; record left PENDING");
        }
    }

    /// Best-effort take-profit / stop-loss around each entry fill
    async fn protect_legs(&self, position: &HedgePosition) {
        if position.take_profit_percent.is_none() && position.stop_loss_percent.is_none() {
            return;
        }

        let requests = LegRole::BOTH.into_iter().filter_map(|role| {
            let leg = position.leg(role);
            let orders = ProtectiveOrders::from_percentages(
                position.symbol.clone(),
                leg.side,
                leg.quantity,
                leg.entry_price?,
                position.take_profit_percent,
                position.stop_loss_percent,
            );
            Some((role, leg.exchange, orders))
        });
        let results = join_all(requests.map(|(role, exchange, orders)| async move {
            let result = match self.connectors.get(exchange) {
                Ok(connector) => connector.set_protective_orders(&orders).await,
                Err(e) => Err(e),
            };
            (role, exchange, result)
        }))
        .await;

        for (role, exchange, result) in results {
            if let Err(e) = result {
                warn!(position_id = %position.id, %role, %exchange, error = %e, "protective orders not placed");
            }
        }
    }

    async fn run_exit_leg(&self, id: PositionId, role: LegRole) {
        self.wait_for_entry(id).await;
        let activity = self.locks.action(id).await;

        let record = self.locks.record(id).await;
        let loaded = self
            .retry_store(id, "load position for exit", || self.store.get(id))
            .await;
        let position = match loaded {
            Ok(Some(position)) => position,
            Ok(None) => {
                warn!(position_id = %id, %role, "exit fired for unknown position");
                return;
            }
            Err(e) => {
                error!(position_id = %id, %role, error = %e, "exit could not load position");
                drop(record);
                let outcome = LegOutcome::Failed(format!("position could not be loaded: {}", e));
                self.finish_exit_leg(id, role, None, outcome, activity).await;
                return;
            }
        };
        match position.phase {
            ExecutionPhase::Entered => {
                self.locks.begin_exit(id);
                let patch = PositionPatch::new().phase(ExecutionPhase::PendingExit);
                if let Err(e) = self
                    .retry_store(id, "mark exit pending", || self.store.update(id, &patch))
                    .await
                {
                    error!(position_id = %id, %role, error = %e, "failed to mark exit pending");
                    drop(record);
                    let outcome = LegOutcome::Failed(format!("exit could not be recorded: {}", e));
                    self.finish_exit_leg(id, role, None, outcome, activity).await;
                    return;
                }
                info!(position_id = %id, "hedge exit started");
            }
            ExecutionPhase::PendingExit => self.locks.begin_exit(id),
            phase => {
                info!(position_id = %id, %role, %phase, "exit skipped");
                return;
            }
        }
        drop(record);

        let leg = position.leg(role).clone();
        let outcome = match self.close_leg(&position.symbol, &leg).await {
            Ok(fill) => {
                info!(position_id = %id, %role, exchange = %leg.exchange, price = %fill.fill_price, "leg closed");
                LegOutcome::Filled(fill)
            }
            Err(e) => {
                error!(position_id = %id, %role, exchange = %leg.exchange, error = %e, "leg close failed");
                LegOutcome::Failed(e.to_string())
            }
        };
        self.finish_exit_leg(id, role, Some(leg), outcome, activity)
            .await;
    }

    /// Record one exit leg in the join; the second leg to report resolves
    /// the exit and ends the exit window.
    async fn finish_exit_leg(
        &self,
        id: PositionId,
        role: LegRole,
        leg: Option<HedgeLeg>,
        outcome: LegOutcome,
        activity: OwnedRwLockReadGuard<()>,
    ) {
        let record = self.locks.record(id).await;
        if let (LegOutcome::Filled(fill), Some(mut closed)) = (&outcome, leg) {
            closed.exit_price = Some(fill.fill_price);
            closed.exit_order_id = Some(fill.order_id.clone());
            if let Err(e) = self.store.update(id, &PositionPatch::new().leg(role, closed)).await {
                error!(position_id = %id, %role, error = %e, "failed to persist exit fill");
            }
        }

        let complete = {
            let mut join = self.exit_joins.entry(id).or_default();
            join.record(role, outcome);
            join.is_complete()
        };
        if !complete {
            return;
        }
        let outcomes = self
            .exit_joins
            .remove(&id)
            .and_then(|(_, join)| join.into_outcomes());
        drop(record);

        if let Some((primary, hedge)) = outcomes {
            self.resolve_exit(id, primary, hedge).await;
        }
        self.locks.end_exit(id);
        drop(activity);
        self.locks.release(id);
    }

    async fn resolve_exit(&self, id: PositionId, primary: LegOutcome, hedge: LegOutcome) {
        let loaded = self
            .retry_store(id, "load position for exit join", || self.store.require(id))
            .await;
        let mut position = match loaded {
            Ok(position) => position,
            Err(e) => {
                error!(position_id = %id, error = %e, "exit join could not load position");
                return;
            }
        };

        let mut failed: Vec<(LegRole, String)> = Vec::new();
        let mut closed_legs = Vec::new();
        for (role, outcome) in [(LegRole::Primary, primary), (LegRole::Hedge, hedge)] {
            match outcome {
                LegOutcome::Filled(fill) => {
                    let leg = position.leg_mut(role);
                    leg.exit_price = Some(fill.fill_price);
                    leg.exit_order_id = Some(fill.order_id);
                    closed_legs.push((role, leg.clone()));
                }
                LegOutcome::Failed(reason) => failed.push((role, reason)),
            }
        }

        let mut patch = if failed.is_empty() {
            let mut patch = PositionPatch::new()
                .phase(ExecutionPhase::Exited)
                .status(PositionStatus::Completed)
                .clear_fault()
                .completed_now();
            if let Some(pnl) = self.compute_pnl(&position) {
                info!(
                    position_id = %id,
                    net_return = %pnl.net_return,
                    net_profit_percent = %pnl.net_profit_percent,
                    net_profit_quote = %pnl.net_profit_quote,
                    "hedge completed"
                );
                patch = patch.pnl(pnl);
            }
            patch
        } else {
            let mut fault = PositionFault::new(
                FaultKind::ExitIncomplete,
                failed
                    .iter()
                    .map(|(role, reason)| {
                        format!(
                            "{} leg still open on {}: close failed: {}",
                            role,
                            position.leg(*role).exchange,
                            reason
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("; "),
            )
            .with_remediation("reconciliation will flag the open leg for manual review");
            for (role, _) in &failed {
                fault = fault.with_leg(*role, position.leg(*role).exchange);
            }
            error!(position_id = %id, fault = %fault, "hedge exit incomplete");
            PositionPatch::new()
                .phase(ExecutionPhase::Error)
                .status(PositionStatus::Error)
                .fault(fault)
        };
        for (role, leg) in closed_legs {
            patch = patch.leg(role, leg);
        }

        if let Err(e) = self
            .retry_store(id, "record exit outcome", || self.store.update(id, &patch))
            .await
        {
            error!(position_id = %id, error = %e, "failed to record exit outcome");
        }
    }

    /// Cancel pending actions, wait out in-flight ones, and close whatever
    /// is still open.
    pub async fn stop(&self, id: PositionId) -> Result<StopReport> {
        self.store.require(id).await?;
        let cancelled = self.scheduler.cancel_position(id);
        let exclusive = self.locks.exclusive(id).await;

        self.entry_joins.remove(&id);
        self.exit_joins.remove(&id);
        self.locks.end_exit(id);
        self.finish_entry(id);

        let position = self.store.require(id).await?;
        if position.phase.is_terminal() {
            info!(position_id = %id, phase = %position.phase, "stop: position already settled");
            return Ok(StopReport {
                position_id: id,
                cancelled,
                legs: Vec::new(),
                phase: position.phase,
                status: position.status,
                message: position.error_message,
            });
        }

        let open = position.open_legs();
        let closes = join_all(open.iter().map(|role| {
            let leg = position.leg(*role);
            let symbol = &position.symbol;
            async move { (*role, self.close_leg(symbol, leg).await) }
        }))
        .await;

        let mut patch = PositionPatch::new().phase(ExecutionPhase::Stopped);
        let mut legs = Vec::new();
        let mut still_open = Vec::new();
        for (role, result) in closes {
            let leg = position.leg(role);
            match result {
                Ok(fill) => {
                    let mut closed = leg.clone();
                    closed.exit_price = Some(fill.fill_price);
                    closed.exit_order_id = Some(fill.order_id.clone());
                    patch = patch.leg(role, closed);
                    legs.push(LegCloseReport {
                        role,
                        exchange: leg.exchange,
                        closed: true,
                        fill_price: Some(fill.fill_price),
                        error: None,
                    });
                }
                Err(e) => {
                    still_open.push((role, e.to_string()));
                    legs.push(LegCloseReport {
                        role,
                        exchange: leg.exchange,
                        closed: false,
                        fill_price: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        let closed_summary = if legs.iter().any(|l| l.closed) {
            legs.iter()
                .filter(|l| l.closed)
                .map(|l| format!("{}@{}", l.role, l.exchange))
                .collect::<Vec<_>>()
                .join(", ")
        } else {
            "none".to_string()
        };

        patch = if still_open.is_empty() {
            let mut projected = position.clone();
            projected.apply(&patch);
            let mut patch = patch
                .status(PositionStatus::Completed)
                .completed_now()
                .note(format!("stopped by operator; closed legs: {}", closed_summary));
            if let Some(pnl) = self.compute_pnl(&projected) {
                patch = patch.pnl(pnl);
            }
            patch
        } else {
            let mut fault = PositionFault::new(
                FaultKind::Stopped,
                still_open
                    .iter()
                    .map(|(role, reason)| {
                        format!(
                            "{} leg still open on {}: {}",
                            role,
                            position.leg(*role).exchange,
                            reason
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("; "),
            )
            .with_remediation(format!(
                "stopped by operator; closed legs: {}; manual close required",
                closed_summary
            ));
            for (role, _) in &still_open {
                fault = fault.with_leg(*role, position.leg(*role).exchange);
            }
            patch.status(PositionStatus::Error).fault(fault)
        };

        let updated = self.store.update(id, &patch).await?;
        if updated.status == PositionStatus::Error {
            warn!(
                position_id = %id,
                message = updated.error_message.as_deref().unwrap_or_default(),
                "position stopped with legs still open"
            );
        } else {
            info!(position_id = %id, prevented = cancelled.prevented_count(), "position stopped");
        }

        drop(exclusive);
        self.locks.release(id);

        Ok(StopReport {
            position_id: id,
            cancelled,
            legs,
            phase: updated.phase,
            status: updated.status,
            message: updated.error_message,
        })
    }

    async fn open_leg(&self, symbol: &str, leg: &HedgeLeg) -> Result<OrderFill> {
        let connector = self.connectors.get(leg.exchange)?;
        let request = OrderRequest::market_open(symbol, leg.side, leg.quantity);
        submit_with_retry(
            leg.exchange,
            "entry order",
            self.config.max_submit_retries,
            self.config.retry_backoff_ms,
            || connector.place_order(&request),
        )
        .await
    }

    async fn close_leg(&self, symbol: &str, leg: &HedgeLeg) -> Result<OrderFill> {
        let connector = self.connectors.get(leg.exchange)?;
        submit_with_retry(
            leg.exchange,
            "close position",
            self.config.max_submit_retries,
            self.config.retry_backoff_ms,
            || connector.close_position(symbol, leg.side),
        )
        .await
    }

    /// Store calls on the join paths. A lost write there strands the record
    /// in a phase no action or sweep will move it out of.
    async fn retry_store<T, F, Fut>(&self, id: PositionId, what: &str, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < STORE_ATTEMPTS && is_store_retryable(&e) => {
                    warn!(position_id = %id, attempt, error = %e, "{} failed, retrying", what);
                    sleep(Duration::from_millis(
                        self.config.retry_backoff_ms.saturating_mul(attempt),
                    ))
                    .await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Realized P&L once both legs carry entry and exit prices
    pub fn compute_pnl(&self, position: &HedgePosition) -> Option<PnlReport> {
        let legs = LegRole::BOTH
            .into_iter()
            .map(|role| {
                let leg = position.leg(role);
                Some(ClosedLeg {
                    role,
                    exchange: leg.exchange,
                    side: leg.side,
                    entry_price: leg.entry_price?,
                    exit_price: leg.exit_price?,
                    taker_fee_rate: self.config.fee_rate(leg.exchange),
                })
            })
            .collect::<Option<Vec<_>>>()?;

        let size = self.config.position_size_usd.unwrap_or_else(|| {
            position.primary.entry_price.unwrap_or_default() * position.primary.quantity
        });
        Some(PnlReport::compute(&legs, size))
    }

    async fn wait_for_entry(&self, id: PositionId) {
        let Some(mut rx) = self.entries.get(&id).map(|tx| tx.subscribe()) else {
            return;
        };
        if !*rx.borrow() {
            debug!(position_id = %id, "exit waiting for entry to resolve");
        }
        let _ = rx.wait_for(|resolved| *resolved).await;
    }

    fn finish_entry(&self, id: PositionId) {
        if let Some((_, tx)) = self.entries.remove(&id) {
            tx.send_replace(true);
        }
    }
}

const STORE_ATTEMPTS: u64 = 3;

/// Rejections by the store itself are final
fn is_store_retryable(e: &HedgeError) -> bool {
    !matches!(
        e,
        HedgeError::InvalidStateTransition { .. }
            | HedgeError::PositionNotFound(_)
            | HedgeError::Validation(_)
    )
}

/// The recorded leg as filled on the exchange
fn filled_leg(leg: &HedgeLeg, fill: &OrderFill) -> HedgeLeg {
    let mut leg = leg.clone();
    leg.entry_price = Some(fill.fill_price);
    leg.quantity = fill.quantity;
    leg.entry_order_id = Some(fill.order_id.clone());
    leg.filled_at = leg.filled_at.or_else(|| Some(Utc::now()));
    leg
}

fn plan_leg_exchange(plan: &TradePlan, role: LegRole) -> ExchangeId {
    match role {
        LegRole::Primary => plan.primary.exchange,
        LegRole::Hedge => plan.hedge.exchange,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClockConfig, SchedulerConfig};
    use crate::domain::{LegPlan, PositionSide};
    use crate::exchange::{PaperCall, PaperExchange, PaperFailure};
    use crate::store::MemoryStore;
    use crate::timing::{ClockPolicy, ClockSync, LocalClock, MonotonicClock};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    struct Harness {
        engine: Arc<HedgeExecutionEngine>,
        bybit: Arc<PaperExchange>,
        bingx: Arc<PaperExchange>,
        clock: Arc<ClockSync>,
    }

    /// Fails a window of upcoming `update` calls
    struct FlakyStore {
        inner: MemoryStore,
        /// (updates to let through first, updates to fail after that)
        window: std::sync::Mutex<(usize, usize)>,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                window: std::sync::Mutex::new((0, 0)),
            }
        }

        fn fail_updates(&self, after: usize, count: usize) {
            *self.window.lock().unwrap() = (after, count);
        }
    }

    #[async_trait::async_trait]
    impl HedgePositionStore for FlakyStore {
        async fn create(&self, position: &HedgePosition) -> Result<()> {
            self.inner.create(position).await
        }

        async fn get(&self, id: PositionId) -> Result<Option<HedgePosition>> {
            self.inner.get(id).await
        }

        async fn update(&self, id: PositionId, patch: &PositionPatch) -> Result<HedgePosition> {
            let fail = {
                let mut window = self.window.lock().unwrap();
                if window.0 > 0 {
                    window.0 -= 1;
                    false
                } else if window.1 > 0 {
                    window.1 -= 1;
                    true
                } else {
                    false
                }
            };
            if fail {
                return Err(HedgeError::Internal("store unavailable".into()));
            }
            self.inner.update(id, patch).await
        }

        async fn find_by_status(&self, statuses: &[PositionStatus]) -> Result<Vec<HedgePosition>> {
            self.inner.find_by_status(statuses).await
        }
    }

    async fn harness() -> Harness {
        harness_with_store(Arc::new(MemoryStore::new())).await
    }

    async fn harness_with_store(store: Arc<dyn HedgePositionStore>) -> Harness {
        let local: Arc<dyn LocalClock> = Arc::new(MonotonicClock::anchored_at(1_700_000_000_000));
        let bybit = Arc::new(PaperExchange::new(ExchangeId::Bybit, Arc::clone(&local)));
        let bingx = Arc::new(PaperExchange::new(ExchangeId::Bingx, Arc::clone(&local)));
        bybit.set_price("BTCUSDT", dec!(100));
        bingx.set_price("BTCUSDT", dec!(100));
        let connectors = ConnectorRegistry::new()
            .with(bybit.clone())
            .with(bingx.clone());

        let clock = Arc::new(ClockSync::new(
            connectors.clone(),
            local,
            ClockPolicy::uniform(ClockConfig::default()),
        ));
        clock.sync(ExchangeId::Bybit).await.unwrap();
        clock.sync(ExchangeId::Bingx).await.unwrap();
        let scheduler = Arc::new(ActionScheduler::new(Arc::clone(&clock), SchedulerConfig::default()));
        let engine = Arc::new(HedgeExecutionEngine::new(
            connectors,
            store,
            scheduler,
            Arc::new(TickerCache::new(Duration::from_secs(30))),
            Arc::new(PositionLocks::new()),
            ExecutionConfig::default(),
        ));
        Harness {
            engine,
            bybit,
            bingx,
            clock,
        }
    }

    fn plan(funding_time_ms: i64) -> TradePlan {
        TradePlan {
            symbol: "BTCUSDT".into(),
            primary: LegPlan {
                exchange: ExchangeId::Bybit,
                side: PositionSide::Short,
                quantity: dec!(0.5),
            },
            hedge: LegPlan {
                exchange: ExchangeId::Bingx,
                side: PositionSide::Long,
                quantity: dec!(0.5),
            },
            funding_time_ms,
            entry_offset_ms: -500,
            exit_offset_ms: 30_000,
            take_profit_percent: None,
            stop_loss_percent: None,
        }
    }

    fn funding_in(h: &Harness, ms: i64) -> i64 {
        h.clock.now(ExchangeId::Bybit).unwrap().ms + ms
    }

    #[tokio::test(start_paused = true)]
    async fn full_cycle_completes_with_pnl() {
        let h = harness().await;
        let id = h.engine.schedule(plan(funding_in(&h, 5_000))).await.unwrap();
        assert_eq!(h.engine.scheduler().armed_count(id), 4);

        tokio::time::sleep(Duration::from_secs(5)).await;
        let entered = h.engine.store().require(id).await.unwrap();
        assert_eq!(entered.phase, ExecutionPhase::Entered);
        assert_eq!(entered.status, PositionStatus::Active);

        h.bybit.set_price("BTCUSDT", dec!(99));
        h.bingx.set_price("BTCUSDT", dec!(99));
        tokio::time::sleep(Duration::from_secs(31)).await;

        let done = h.engine.store().require(id).await.unwrap();
        assert_eq!(done.phase, ExecutionPhase::Exited);
        assert_eq!(done.status, PositionStatus::Completed);
        let pnl = done.pnl.unwrap();
        // +1% short, -1% long, four fills at 0.055%
        assert_eq!(pnl.gross_return, Decimal::ZERO);
        assert_eq!(pnl.total_fees, dec!(0.0022));
        assert!(!h.bybit.position("BTCUSDT").is_open());
        assert!(!h.bingx.position("BTCUSDT").is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn scheduling_failure_cancels_and_records_error() {
        let h = harness().await;
        // Entry lands 500ms before a funding event only 800ms away
        let err = h.engine.schedule(plan(funding_in(&h, 800))).await.unwrap_err();
        assert!(matches!(err, HedgeError::Scheduling { .. }));

        let positions = h
            .engine
            .store()
            .find_by_status(&[PositionStatus::Error])
            .await
            .unwrap();
        assert_eq!(positions.len(), 1);
        let fault = positions[0].fault.clone().unwrap();
        assert_eq!(fault.kind, FaultKind::Scheduling);
        assert_eq!(h.engine.scheduler().armed_count(positions[0].id), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_entry_is_retried() {
        let h = harness().await;
        h.bingx.fail_next(PaperCall::PlaceOrder, PaperFailure::RateLimited);
        let id = h.engine.schedule(plan(funding_in(&h, 5_000))).await.unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        let position = h.engine.store().require(id).await.unwrap();
        assert_eq!(position.status, PositionStatus::Active);
        assert_eq!(h.bingx.orders_placed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_entry_is_not_retried_and_filled_leg_unwinds() {
        let h = harness().await;
        h.bybit.fail_next(PaperCall::PlaceOrder, PaperFailure::Rejected);
        let id = h.engine.schedule(plan(funding_in(&h, 5_000))).await.unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        let position = h.engine.store().require(id).await.unwrap();
        assert_eq!(position.status, PositionStatus::Error);
        assert_eq!(h.bybit.orders_placed(), 0);
        assert!(position.error_message.unwrap().contains("BYBIT"));
        assert!(!h.bingx.position("BTCUSDT").is_open());
        assert_eq!(h.engine.scheduler().armed_count(id), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_before_entry_cancels_everything() {
        let h = harness().await;
        let id = h.engine.schedule(plan(funding_in(&h, 10_000))).await.unwrap();

        let report = h.engine.stop(id).await.unwrap();
        assert_eq!(report.cancelled.prevented_count(), 4);
        assert_eq!(report.phase, ExecutionPhase::Stopped);
        assert_eq!(report.status, PositionStatus::Completed);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.bybit.orders_placed(), 0);
        assert_eq!(h.bingx.orders_placed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_after_entry_closes_both_legs() {
        let h = harness().await;
        let id = h.engine.schedule(plan(funding_in(&h, 5_000))).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        let report = h.engine.stop(id).await.unwrap();
        assert_eq!(report.cancelled.prevented_count(), 2);
        assert_eq!(report.legs.len(), 2);
        assert!(report.legs.iter().all(|l| l.closed));
        assert_eq!(report.status, PositionStatus::Completed);
        assert!(h.engine.store().require(id).await.unwrap().pnl.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_reports_leg_it_could_not_close() {
        let h = harness().await;
        let id = h.engine.schedule(plan(funding_in(&h, 5_000))).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        h.bingx.fail_next(PaperCall::ClosePosition, PaperFailure::Rejected);
        let report = h.engine.stop(id).await.unwrap();
        assert_eq!(report.status, PositionStatus::Error);
        assert_eq!(report.phase, ExecutionPhase::Stopped);
        assert!(report.message.unwrap().contains("BINGX"));
        assert!(h.bingx.position("BTCUSDT").is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn unpersisted_entry_fill_is_still_unwound() {
        let store = Arc::new(FlakyStore::new());
        let h = harness_with_store(store.clone()).await;
        h.bingx.fail_next(PaperCall::PlaceOrder, PaperFailure::Rejected);
        let id = h.engine.schedule(plan(funding_in(&h, 5_000))).await.unwrap();
        // BYBIT fill is the first write; BINGX is rejected before writing
        store.fail_updates(0, 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        let position = h.engine.store().require(id).await.unwrap();
        assert_eq!(position.status, PositionStatus::Error);
        assert_eq!(position.primary.entry_price, Some(dec!(100)));
        assert_eq!(position.primary.exit_price, Some(dec!(100)));
        assert!(!h.bybit.position("BTCUSDT").is_open());
        assert_eq!(h.bybit.positions_closed(), 1);
        let message = position.error_message.unwrap();
        assert!(message.contains("unwound primary"), "{}", message);
    }

    #[tokio::test(start_paused = true)]
    async fn entry_write_is_retried() {
        let store = Arc::new(FlakyStore::new());
        let h = harness_with_store(store.clone()).await;
        let id = h.engine.schedule(plan(funding_in(&h, 5_000))).await.unwrap();
        // Both fills land, the first ENTERED write fails
        store.fail_updates(2, 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        let position = h.engine.store().require(id).await.unwrap();
        assert_eq!(position.phase, ExecutionPhase::Entered);
        assert_eq!(position.status, PositionStatus::Active);
        assert_eq!(h.engine.scheduler().armed_count(id), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_entry_write_surfaces_as_error() {
        let store = Arc::new(FlakyStore::new());
        let h = harness_with_store(store.clone()).await;
        let id = h.engine.schedule(plan(funding_in(&h, 5_000))).await.unwrap();
        store.fail_updates(2, STORE_ATTEMPTS as usize);

        tokio::time::sleep(Duration::from_secs(6)).await;
        let position = h.engine.store().require(id).await.unwrap();
        assert_eq!(position.status, PositionStatus::Error);
        assert_eq!(position.fault.as_ref().map(|f| f.kind), Some(FaultKind::LegExecution));
        assert_eq!(position.open_legs(), LegRole::BOTH.to_vec());
        assert_eq!(h.engine.scheduler().armed_count(id), 0);
        let flagged = h
            .engine
            .store()
            .find_by_status(&[PositionStatus::Error])
            .await
            .unwrap();
        assert_eq!(flagged.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_exit_bookkeeping_still_resolves_the_join() {
        let store = Arc::new(FlakyStore::new());
        let h = harness_with_store(store.clone()).await;
        let id = h.engine.schedule(plan(funding_in(&h, 5_000))).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(
            h.engine.store().require(id).await.unwrap().status,
            PositionStatus::Active
        );

        // The first exit leg cannot mark the exit pending
        store.fail_updates(0, STORE_ATTEMPTS as usize);
        tokio::time::sleep(Duration::from_secs(31)).await;

        let position = h.engine.store().require(id).await.unwrap();
        assert_eq!(position.status, PositionStatus::Error);
        let fault = position.fault.clone().unwrap();
        assert_eq!(fault.kind, FaultKind::ExitIncomplete);
        assert_eq!(fault.legs.len(), 1);
        let open: Vec<ExchangeId> = [(ExchangeId::Bybit, &h.bybit), (ExchangeId::Bingx, &h.bingx)]
            .into_iter()
            .filter(|(_, venue)| venue.position("BTCUSDT").is_open())
            .map(|(exchange, _)| exchange)
            .collect();
        assert_eq!(open, vec![fault.legs[0].exchange]);
        assert!(h.engine.exit_joins.is_empty());
        assert!(!h.engine.locks.exit_in_flight(id));
    }
}
