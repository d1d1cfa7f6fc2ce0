//! Operator facade.
//!
//! `HedgeService` wires clock sync, the action scheduler, the execution engine
//! and the reconciliation engine around one connector registry and one store,
//! and owns the background loops.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::coordination::{ShutdownListener, ShutdownSignal};
use crate::domain::{
    ExchangeId, HedgePosition, LegPlan, PositionId, PositionStatus, TradePlan,
};
use crate::error::{HedgeError, Result};
use crate::exchange::{build_connectors, ConnectorRegistry, TickerCache};
use crate::execution::{HedgeExecutionEngine, PositionLocks, StopReport};
use crate::reconciliation::{HealReport, ReconcileReport, ReconciliationEngine, SweepReport};
use crate::store::{HedgePositionStore, MemoryStore, PostgresStore};
use crate::timing::{ActionScheduler, ClockOffset, ClockPolicy, ClockSync, LocalClock, MonotonicClock};

/// Scope of an operator-triggered reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileTarget {
    Position(PositionId),
    All,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "scope", content = "report", rename_all = "snake_case")]
pub enum ReconciliationReport {
    Position(ReconcileReport),
    Sweep(SweepReport),
}

/// Result of one on-demand clock sync
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClockReport {
    pub exchange: ExchangeId,
    pub offset: Option<ClockOffset>,
    pub error: Option<String>,
}

pub struct HedgeService {
    config: AppConfig,
    clock: Arc<ClockSync>,
    scheduler: Arc<ActionScheduler>,
    store: Arc<dyn HedgePositionStore>,
    engine: Arc<HedgeExecutionEngine>,
    reconciler: Arc<ReconciliationEngine>,
}

impl HedgeService {
    /// Wire the service around explicit connectors, clock and store
    pub fn new(
        config: AppConfig,
        connectors: ConnectorRegistry,
        local_clock: Arc<dyn LocalClock>,
        store: Arc<dyn HedgePositionStore>,
    ) -> Self {
        let clock = Arc::new(ClockSync::new(
            connectors.clone(),
            local_clock,
            ClockPolicy::from_config(&config),
        ));
        let scheduler = Arc::new(ActionScheduler::new(
            Arc::clone(&clock),
            config.scheduler.clone(),
        ));
        let tickers = Arc::new(TickerCache::new(Duration::from_secs(
            config.execution.ticker_ttl_secs,
        )));
        let locks = Arc::new(PositionLocks::new());

        let engine = Arc::new(HedgeExecutionEngine::new(
            connectors.clone(),
            Arc::clone(&store),
            Arc::clone(&scheduler),
            Arc::clone(&tickers),
            Arc::clone(&locks),
            config.execution.clone(),
        ));
        let reconciler = Arc::new(ReconciliationEngine::new(
            connectors,
            Arc::clone(&store),
            locks,
            tickers,
            config.reconciliation.clone(),
        ));

        Self {
            config,
            clock,
            scheduler,
            store,
            engine,
            reconciler,
        }
    }

    /// Build everything from configuration: paper connectors in dry-run mode,
    /// PostgreSQL when `[database]` is set, memory otherwise
    pub async fn from_config(config: AppConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|errors| HedgeError::Validation(errors.join("; ")))?;

        let local_clock: Arc<dyn LocalClock> = Arc::new(MonotonicClock::new());
        let connectors = build_connectors(&config, Arc::clone(&local_clock))?;

        let store: Arc<dyn HedgePositionStore> = match &config.database {
            Some(database) => {
                let store = PostgresStore::new(&database.url, database.max_connections).await?;
                store.migrate().await?;
                Arc::new(store)
            }
            None => {
                warn!("no [database] configured, positions are kept in memory only");
                Arc::new(MemoryStore::new())
            }
        };

        Ok(Self::new(config, connectors, local_clock, store))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<ClockSync> {
        &self.clock
    }

    pub fn scheduler(&self) -> &Arc<ActionScheduler> {
        &self.scheduler
    }

    pub fn engine(&self) -> &Arc<HedgeExecutionEngine> {
        &self.engine
    }

    pub fn reconciler(&self) -> &Arc<ReconciliationEngine> {
        &self.reconciler
    }

    /// Trade plan using the configured entry and exit offsets
    pub fn plan(
        &self,
        symbol: impl Into<String>,
        primary: LegPlan,
        hedge: LegPlan,
        funding_time_ms: i64,
    ) -> TradePlan {
        TradePlan {
            symbol: symbol.into().to_ascii_uppercase(),
            primary,
            hedge,
            funding_time_ms,
            entry_offset_ms: self.config.execution.entry_offset_ms,
            exit_offset_ms: self.config.execution.exit_offset_ms,
            take_profit_percent: None,
            stop_loss_percent: None,
        }
    }

    /// Schedule a new hedge, syncing either leg's clock first if needed
    pub async fn open(&self, plan: TradePlan) -> Result<PositionId> {
        for exchange in [plan.primary.exchange, plan.hedge.exchange] {
            if self.clock.offset(exchange).is_none() {
                self.clock.sync(exchange).await?;
            }
        }
        self.engine.schedule(plan).await
    }

    pub async fn position(&self, id: PositionId) -> Result<HedgePosition> {
        self.store.require(id).await
    }

    pub async fn trigger_reconciliation(&self, target: ReconcileTarget) -> Result<ReconciliationReport> {
        match target {
            ReconcileTarget::Position(id) => self
                .reconciler
                .reconcile_by_id(id)
                .await
                .map(ReconciliationReport::Position),
            ReconcileTarget::All => self.reconciler.sweep().await.map(ReconciliationReport::Sweep),
        }
    }

    pub async fn heal(&self, id: PositionId) -> Result<HealReport> {
        self.reconciler.heal(id).await
    }

    pub async fn confirm_heal(&self, id: PositionId) -> Result<HealReport> {
        self.reconciler.confirm_heal(id).await
    }

    pub async fn stop(&self, id: PositionId) -> Result<StopReport> {
        self.engine.stop(id).await
    }

    /// Sync every registered exchange once
    pub async fn sync_clocks(&self) -> Vec<ClockReport> {
        let exchanges = self.exchanges();
        let results = join_all(exchanges.iter().map(|exchange| self.clock.sync(*exchange))).await;
        exchanges
            .into_iter()
            .zip(results)
            .map(|(exchange, result)| match result {
                Ok(offset) => ClockReport {
                    exchange,
                    offset: Some(offset),
                    error: None,
                },
                Err(e) => ClockReport {
                    exchange,
                    offset: None,
                    error: Some(e.to_string()),
                },
            })
            .collect()
    }

    /// Poll until a position has no armed or running actions and has left
    /// PENDING/ACTIVE
    pub async fn await_settled(&self, id: PositionId, poll: Duration) -> Result<HedgePosition> {
        let mut ticker = interval(poll);
        loop {
            ticker.tick().await;
            let position = self.store.require(id).await?;
            let settled = !matches!(
                position.status,
                PositionStatus::Pending | PositionStatus::Active
            );
            if settled && self.scheduler.actions(id).is_empty() {
                return Ok(position);
            }
        }
    }

    /// Cancel every armed action and stop every position that is not
    /// completed
    pub async fn emergency_stop(&self) -> Vec<StopReport> {
        let cancelled = self.scheduler.cancel_all();
        warn!(cancelled, "emergency stop: armed actions cancelled");

        let positions = match self
            .store
            .find_by_status(&[
                PositionStatus::Pending,
                PositionStatus::Active,
                PositionStatus::Error,
            ])
            .await
        {
            Ok(positions) => positions,
            Err(e) => {
                error!(error = %e, "emergency stop: position lookup failed");
                return Vec::new();
            }
        };

        let results = join_all(positions.iter().map(|p| self.engine.stop(p.id))).await;
        let mut reports = Vec::with_capacity(results.len());
        for (position, result) in positions.iter().zip(results) {
            match result {
                Ok(report) => reports.push(report),
                Err(e) => error!(position_id = %position.id, error = %e, "emergency stop failed"),
            }
        }
        reports
    }

    /// Run clock refresh and reconciliation until shutdown.
    ///
    /// An emergency signal also stops every in-flight position.
    pub async fn run(&self, mut shutdown: ShutdownListener) -> Result<()> {
        let mut tasks = self.clock.spawn_refresh_all(&shutdown);

        let reconciler = Arc::clone(&self.reconciler);
        let listener = shutdown.clone();
        tasks.push(tokio::spawn(async move { reconciler.run(listener).await }));

        info!(
            exchanges = ?self.exchanges(),
            reconcile_interval_secs = self.config.reconciliation.interval_secs,
            "hedge service running"
        );

        let signal = shutdown.wait().await;
        if signal == ShutdownSignal::Emergency {
            let reports = self.emergency_stop().await;
            let unresolved = reports
                .iter()
                .filter(|r| r.status == PositionStatus::Error)
                .count();
            warn!(stopped = reports.len(), unresolved, "emergency stop finished");
        }

        for result in join_all(tasks).await {
            if let Err(e) = result {
                error!(error = %e, "background task panicked");
            }
        }
        info!(%signal, "hedge service stopped");
        Ok(())
    }

    fn exchanges(&self) -> Vec<ExchangeId> {
        self.reconciler.connectors.exchanges()
    }
}
