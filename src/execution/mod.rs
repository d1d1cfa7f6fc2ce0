//! Hedge entry/exit orchestration

pub mod engine;
pub mod locks;
mod retry;

pub use engine::{HedgeExecutionEngine, LegCloseReport, StopReport};
pub use locks::PositionLocks;
pub use retry::submit_with_retry;
