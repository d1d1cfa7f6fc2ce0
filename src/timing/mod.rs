//! Exchange clock synchronization and time-targeted action scheduling

pub mod clock;
pub mod scheduler;
pub mod sync;

pub use clock::{LocalClock, ManualClock, MonotonicClock};
pub use scheduler::{
    ActionHandle, ActionKind, ActionScheduler, ActionState, CancelSummary, ScheduledAction,
};
pub use sync::{ClockOffset, ClockPolicy, ClockSync, SyncedTime};
