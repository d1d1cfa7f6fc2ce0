//! Process-level coordination

pub mod shutdown;

pub use shutdown::{GracefulShutdown, ShutdownListener, ShutdownSignal};
