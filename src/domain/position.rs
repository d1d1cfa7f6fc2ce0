use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::{ExchangeId, ExecutionPhase, PnlReport, PositionSide, PositionStatus};
use crate::error::{HedgeError, Result};

pub type PositionId = Uuid;

/// Which half of a hedge a leg is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LegRole {
    Primary,
    Hedge,
}

impl LegRole {
    pub const BOTH: [LegRole; 2] = [LegRole::Primary, LegRole::Hedge];

    pub fn other(&self) -> Self {
        match self {
            LegRole::Primary => LegRole::Hedge,
            LegRole::Hedge => LegRole::Primary,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LegRole::Primary => "primary",
            LegRole::Hedge => "hedge",
        }
    }
}

impl fmt::Display for LegRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One side of a hedge, opened on one exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HedgeLeg {
    pub exchange: ExchangeId,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub entry_price: Option<Decimal>,
    pub exit_price: Option<Decimal>,
    pub entry_order_id: Option<String>,
    pub exit_order_id: Option<String>,
    pub filled_at: Option<DateTime<Utc>>,
}

impl HedgeLeg {
    pub fn new(exchange: ExchangeId, side: PositionSide, quantity: Decimal) -> Self {
        Self {
            exchange,
            side,
            quantity,
            entry_price: None,
            exit_price: None,
            entry_order_id: None,
            exit_order_id: None,
            filled_at: None,
        }
    }

    /// Entry filled and not yet closed
    pub fn is_open(&self) -> bool {
        self.entry_price.is_some() && self.exit_price.is_none()
    }
}

/// Requested leg of a new hedge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegPlan {
    pub exchange: ExchangeId,
    pub side: PositionSide,
    pub quantity: Decimal,
}

/// Everything needed to schedule one hedge cycle around a funding event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradePlan {
    pub symbol: String,
    pub primary: LegPlan,
    pub hedge: LegPlan,
    /// Funding event, epoch milliseconds in exchange time
    pub funding_time_ms: i64,
    /// Entry relative to the funding event (negative = before)
    pub entry_offset_ms: i64,
    /// Exit relative to the funding event
    pub exit_offset_ms: i64,
    #[serde(default)]
    pub take_profit_percent: Option<Decimal>,
    #[serde(default)]
    pub stop_loss_percent: Option<Decimal>,
}

impl TradePlan {
    pub fn entry_time_ms(&self) -> i64 {
        self.funding_time_ms + self.entry_offset_ms
    }

    pub fn exit_time_ms(&self) -> i64 {
        self.funding_time_ms + self.exit_offset_ms
    }

    pub fn validate(&self) -> Result<()> {
        if self.symbol.trim().is_empty() {
            return Err(HedgeError::Validation("symbol must not be empty".into()));
        }
        if self.primary.side == self.hedge.side {
            return Err(HedgeError::Validation(format!(
                "legs must be opposite, both are {}",
                self.primary.side
            )));
        }
        if self.primary.exchange == self.hedge.exchange {
            return Err(HedgeError::Validation(format!(
                "legs must be on different exchanges, both are {}",
                self.primary.exchange
            )));
        }
        if self.primary.quantity <= Decimal::ZERO || self.hedge.quantity <= Decimal::ZERO {
            return Err(HedgeError::Validation("leg quantities must be positive".into()));
        }
        if self.exit_offset_ms <= self.entry_offset_ms {
            return Err(HedgeError::Validation(format!(
                "exit offset {}ms must be after entry offset {}ms",
                self.exit_offset_ms, self.entry_offset_ms
            )));
        }
        Ok(())
    }
}

/// Structured failure category recorded on a position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FaultKind {
    ClockFailure,
    Scheduling,
    LegExecution,
    ExitIncomplete,
    UnhedgedDrift,
    LegMismatch,
    ReconciliationQuery,
    HealFailed,
    HealPendingConfirmation,
    Stopped,
}

impl FaultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultKind::ClockFailure => "CLOCK_FAILURE",
            FaultKind::Scheduling => "SCHEDULING",
            FaultKind::LegExecution => "LEG_EXECUTION",
            FaultKind::ExitIncomplete => "EXIT_INCOMPLETE",
            FaultKind::UnhedgedDrift => "UNHEDGED_DRIFT",
            FaultKind::LegMismatch => "LEG_MISMATCH",
            FaultKind::ReconciliationQuery => "RECONCILIATION_QUERY",
            FaultKind::HealFailed => "HEAL_FAILED",
            FaultKind::HealPendingConfirmation => "HEAL_PENDING_CONFIRMATION",
            FaultKind::Stopped => "STOPPED",
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Leg implicated in a fault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultLeg {
    pub role: LegRole,
    pub exchange: ExchangeId,
}

/// Source of truth for a position's `error_message`.
///
/// The human-readable message is always the `Display` rendering of this value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionFault {
    pub kind: FaultKind,
    pub legs: Vec<FaultLeg>,
    pub detail: String,
    pub remediation: Option<String>,
}

impl PositionFault {
    pub fn new(kind: FaultKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            legs: Vec::new(),
            detail: detail.into(),
            remediation: None,
        }
    }

    pub fn with_leg(mut self, role: LegRole, exchange: ExchangeId) -> Self {
        self.legs.push(FaultLeg { role, exchange });
        self
    }

    pub fn with_remediation(mut self, remediation: impl Into<String>) -> Self {
        self.remediation = Some(remediation.into());
        self
    }
}

impl fmt::Display for PositionFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if !self.legs.is_empty() {
            let legs: Vec<String> = self
                .legs
                .iter()
                .map(|l| format!("{}@{}", l.role, l.exchange))
                .collect();
            write!(f, " [{}]", legs.join(", "))?;
        }
        write!(f, ": {}", self.detail)?;
        if let Some(remediation) = &self.remediation {
            write!(f, " (remediation: {})", remediation)?;
        }
        Ok(())
    }
}

/// Durable record of a two-leg hedge position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HedgePosition {
    pub id: PositionId,
    pub symbol: String,
    pub primary: HedgeLeg,
    pub hedge: HedgeLeg,
    pub take_profit_percent: Option<Decimal>,
    pub stop_loss_percent: Option<Decimal>,
    pub funding_time_ms: i64,
    pub phase: ExecutionPhase,
    pub status: PositionStatus,
    pub error_message: Option<String>,
    pub fault: Option<PositionFault>,
    pub pnl: Option<PnlReport>,
    pub created_at: DateTime<Utc>,
    pub opened_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl HedgePosition {
    pub fn from_plan(plan: &TradePlan) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: plan.symbol.clone(),
            primary: HedgeLeg::new(plan.primary.exchange, plan.primary.side, plan.primary.quantity),
            hedge: HedgeLeg::new(plan.hedge.exchange, plan.hedge.side, plan.hedge.quantity),
            take_profit_percent: plan.take_profit_percent,
            stop_loss_percent: plan.stop_loss_percent,
            funding_time_ms: plan.funding_time_ms,
            phase: ExecutionPhase::PendingEntry,
            status: PositionStatus::Pending,
            error_message: None,
            fault: None,
            pnl: None,
            created_at: Utc::now(),
            opened_at: None,
            completed_at: None,
        }
    }

    pub fn leg(&self, role: LegRole) -> &HedgeLeg {
        match role {
            LegRole::Primary => &self.primary,
            LegRole::Hedge => &self.hedge,
        }
    }

    pub fn leg_mut(&mut self, role: LegRole) -> &mut HedgeLeg {
        match role {
            LegRole::Primary => &mut self.primary,
            LegRole::Hedge => &mut self.hedge,
        }
    }

    /// Legs whose entry filled and which have not been closed
    pub fn open_legs(&self) -> Vec<LegRole> {
        LegRole::BOTH
            .into_iter()
            .filter(|role| self.leg(*role).is_open())
            .collect()
    }

    /// Apply a sparse update in place
    pub fn apply(&mut self, patch: &PositionPatch) {
        if let Some(phase) = patch.phase {
            self.phase = phase;
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(primary) = &patch.primary {
            self.primary = primary.clone();
        }
        if let Some(hedge) = &patch.hedge {
            self.hedge = hedge.clone();
        }
        if let Some(error_message) = &patch.error_message {
            self.error_message = error_message.clone();
        }
        if let Some(fault) = &patch.fault {
            self.fault = fault.clone();
        }
        if let Some(pnl) = &patch.pnl {
            self.pnl = Some(pnl.clone());
        }
        if let Some(opened_at) = patch.opened_at {
            self.opened_at = Some(opened_at);
        }
        if let Some(completed_at) = patch.completed_at {
            self.completed_at = Some(completed_at);
        }
    }
}

/// Sparse update for `HedgePositionStore::update`.
///
/// Nullable fields use `Option<Option<T>>`: `Some(None)` clears the value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionPatch {
    pub phase: Option<ExecutionPhase>,
    pub status: Option<PositionStatus>,
    pub primary: Option<HedgeLeg>,
    pub hedge: Option<HedgeLeg>,
    pub error_message: Option<Option<String>>,
    pub fault: Option<Option<PositionFault>>,
    pub pnl: Option<PnlReport>,
    pub opened_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PositionPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(mut self, phase: ExecutionPhase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn status(mut self, status: PositionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn leg(mut self, role: LegRole, leg: HedgeLeg) -> Self {
        match role {
            LegRole::Primary => self.primary = Some(leg),
            LegRole::Hedge => self.hedge = Some(leg),
        }
        self
    }

    /// Record a fault; the error message is its rendering
    pub fn fault(mut self, fault: PositionFault) -> Self {
        self.error_message = Some(Some(fault.to_string()));
        self.fault = Some(Some(fault));
        self
    }

    /// Annotate without a fault (e.g. reconciliation notes)
    pub fn note(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(Some(message.into()));
        self.fault = Some(None);
        self
    }

    pub fn clear_fault(mut self) -> Self {
        self.error_message = Some(None);
        self.fault = Some(None);
        self
    }

    pub fn pnl(mut self, pnl: PnlReport) -> Self {
        self.pnl = Some(pnl);
        self
    }

    pub fn opened_now(mut self) -> Self {
        self.opened_at = Some(Utc::now());
        self
    }

    pub fn completed_now(mut self) -> Self {
        self.completed_at = Some(Utc::now());
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}
