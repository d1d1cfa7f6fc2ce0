use serde::{Deserialize, Serialize};
use std::fmt;

/// Execution phase of a hedge cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionPhase {
    /// Entry actions armed, no leg confirmed yet
    PendingEntry,
    /// Both legs confirmed open
    Entered,
    /// Closing orders in flight
    PendingExit,
    /// Both legs confirmed closed
    Exited,
    /// Aborted by operator
    Stopped,
    /// State uncertain or one leg failed
    Error,
}

impl ExecutionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionPhase::PendingEntry => "PENDING_ENTRY",
            ExecutionPhase::Entered => "ENTERED",
            ExecutionPhase::PendingExit => "PENDING_EXIT",
            ExecutionPhase::Exited => "EXITED",
            ExecutionPhase::Stopped => "STOPPED",
            ExecutionPhase::Error => "ERROR",
        }
    }

    /// Check if this phase can transition to another phase
    pub fn can_transition_to(&self, target: ExecutionPhase) -> bool {
        use ExecutionPhase::*;

        match (self, target) {
            // Success path
            (PendingEntry, Entered) => true,
            (Entered, PendingExit) => true,
            (PendingExit, Exited) => true,

            // Failure path, from any non-terminal phase
            (PendingEntry | Entered | PendingExit, Error) => true,
            (PendingEntry | Entered | PendingExit | Error, Stopped) => true,

            // Reconciliation found both legs closed on the exchanges
            (Entered | Error, Exited) => true,

            // Heal restored a protected, two-legged position
            (Error, Entered) => true,

            _ => false,
        }
    }

    /// Get valid next phases from current phase
    pub fn valid_transitions(&self) -> Vec<ExecutionPhase> {
        use ExecutionPhase::*;

        match self {
            PendingEntry => vec![Entered, Error, Stopped],
            Entered => vec![PendingExit, Error, Stopped, Exited],
            PendingExit => vec![Exited, Error, Stopped],
            Error => vec![Stopped, Exited, Entered],
            Exited | Stopped => vec![],
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionPhase::Exited | ExecutionPhase::Stopped)
    }
}

impl fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for ExecutionPhase {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, String> {
        match s.to_uppercase().as_str() {
            "PENDING_ENTRY" => Ok(ExecutionPhase::PendingEntry),
            "ENTERED" => Ok(ExecutionPhase::Entered),
            "PENDING_EXIT" => Ok(ExecutionPhase::PendingExit),
            "EXITED" => Ok(ExecutionPhase::Exited),
            "STOPPED" => Ok(ExecutionPhase::Stopped),
            "ERROR" => Ok(ExecutionPhase::Error),
            _ => Err(format!("Unknown phase: {}", s)),
        }
    }
}

/// Coarse record-level status of a hedge position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    /// Scheduled, not yet active
    Pending,
    /// Both legs confirmed open
    Active,
    /// Needs operator attention
    Error,
    /// Both legs confirmed closed
    Completed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Pending => "PENDING",
            PositionStatus::Active => "ACTIVE",
            PositionStatus::Error => "ERROR",
            PositionStatus::Completed => "COMPLETED",
        }
    }

    /// Statuses a reconciliation pass queries the exchanges for
    pub fn needs_reconciliation(&self) -> bool {
        matches!(self, PositionStatus::Active | PositionStatus::Error)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PositionStatus::Completed)
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for PositionStatus {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, String> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(PositionStatus::Pending),
            "ACTIVE" => Ok(PositionStatus::Active),
            "ERROR" => Ok(PositionStatus::Error),
            "COMPLETED" => Ok(PositionStatus::Completed),
            _ => Err(format!("Unknown status: {}", s)),
        }
    }
}

/// State transition event (for logging/debugging)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: ExecutionPhase,
    pub to: ExecutionPhase,
    pub reason: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl StateTransition {
    pub fn new(from: ExecutionPhase, to: ExecutionPhase, reason: impl Into<String>) -> Self {
        Self {
            from,
            to,
            reason: reason.into(),
            timestamp: chrono::Utc::now(),
        }
    }
}
