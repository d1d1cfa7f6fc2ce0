pub mod cli;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod error;
pub mod exchange;
pub mod execution;
pub mod reconciliation;
pub mod service;
pub mod store;
pub mod timing;

pub use config::AppConfig;
pub use coordination::{GracefulShutdown, ShutdownListener, ShutdownSignal};
pub use domain::{
    ExchangeId, ExecutionPhase, FaultKind, HedgeLeg, HedgePosition, LegPlan, LegRole,
    PnlReport, PositionFault, PositionId, PositionSide, PositionStatus, TradePlan,
};
pub use error::{HedgeError, Result};
pub use exchange::{ConnectorRegistry, ExchangeConnector, PaperExchange, TickerCache};
pub use execution::{HedgeExecutionEngine, PositionLocks, StopReport};
pub use reconciliation::{HealOutcome, HealReport, ReconcileAction, ReconcileReport, ReconciliationEngine, SweepReport};
pub use service::{ClockReport, HedgeService, ReconcileTarget, ReconciliationReport};
pub use store::{HedgePositionStore, MemoryStore, PostgresStore};
pub use timing::{ActionScheduler, ClockSync, LocalClock, ManualClock, MonotonicClock};
