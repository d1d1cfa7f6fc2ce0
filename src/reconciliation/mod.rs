//! Detection and repair of drift between stored positions and exchanges

pub mod engine;
pub mod heal;

pub use engine::{ReconcileAction, ReconcileReport, ReconciliationEngine, SweepFailure, SweepReport};
pub use heal::{HealOutcome, HealReport, LegHealReport};
