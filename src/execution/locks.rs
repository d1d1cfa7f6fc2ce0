//! Per-position serialization.
//!
//! Leg actions share the activity lock so both legs of a hedge run in
//! parallel. Reconciliation, heal and stop take it exclusively, which also
//! makes them wait for any leg action already in flight. The record mutex
//! guards read-modify-write of the stored record.
//!
//! The two exit legs fire on different exchange clocks, so a hedge can sit
//! with one leg closed while the other is still armed. That window is
//! tracked separately and lasts until the exit join resolves.

use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use crate::domain::PositionId;

#[derive(Debug, Default)]
struct PositionGate {
    activity: Arc<RwLock<()>>,
    record: Arc<Mutex<()>>,
}

#[derive(Debug, Default)]
pub struct PositionLocks {
    gates: DashMap<PositionId, Arc<PositionGate>>,
    exits: DashSet<PositionId>,
}

impl PositionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn gate(&self, id: PositionId) -> Arc<PositionGate> {
        Arc::clone(&self.gates.entry(id).or_default())
    }

    /// Shared guard held by a leg action
    pub async fn action(&self, id: PositionId) -> OwnedRwLockReadGuard<()> {
        Arc::clone(&self.gate(id).activity).read_owned().await
    }

    /// Exclusive guard held by reconciliation, heal and stop
    pub async fn exclusive(&self, id: PositionId) -> OwnedRwLockWriteGuard<()> {
        Arc::clone(&self.gate(id).activity).write_owned().await
    }

    pub async fn record(&self, id: PositionId) -> OwnedMutexGuard<()> {
        Arc::clone(&self.gate(id).record).lock_owned().await
    }

    /// Mark the exit of `id` as started; cleared by `end_exit`
    pub fn begin_exit(&self, id: PositionId) {
        self.exits.insert(id);
    }

    pub fn end_exit(&self, id: PositionId) {
        self.exits.remove(&id);
    }

    /// `true` between the first exit leg firing and the exit join resolving
    pub fn exit_in_flight(&self, id: PositionId) -> bool {
        self.exits.contains(&id)
    }

    /// Forget a settled position's gate unless someone still holds a guard
    pub fn release(&self, id: PositionId) {
        self.gates.remove_if(&id, |_, gate| {
            Arc::strong_count(&gate.activity) == 1 && Arc::strong_count(&gate.record) == 1
        });
    }

    pub fn len(&self) -> usize {
        self.gates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }
}
