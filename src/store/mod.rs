//! Durable hedge position records

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use tracing::debug;

use crate::domain::{HedgePosition, PositionId, PositionPatch, PositionStatus, StateTransition};
use crate::error::{HedgeError, Result};

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Persistence for hedge positions. Records are never deleted.
#[async_trait]
pub trait HedgePositionStore: Send + Sync {
    async fn create(&self, position: &HedgePosition) -> Result<()>;

    async fn get(&self, id: PositionId) -> Result<Option<HedgePosition>>;

    /// Apply `patch` and return the updated record.
    ///
    /// Fails with `InvalidStateTransition` if the patch moves the phase along
    /// an edge the state machine does not allow.
    async fn update(&self, id: PositionId, patch: &PositionPatch) -> Result<HedgePosition>;

    async fn find_by_status(&self, statuses: &[PositionStatus]) -> Result<Vec<HedgePosition>>;

    async fn require(&self, id: PositionId) -> Result<HedgePosition> {
        self.get(id).await?.ok_or(HedgeError::PositionNotFound(id))
    }
}

/// Validate and apply a patch to an in-memory copy of the record
pub(crate) fn apply_patch(position: &mut HedgePosition, patch: &PositionPatch) -> Result<()> {
    if let Some(target) = patch.phase {
        if target != position.phase {
            if !position.phase.can_transition_to(target) {
                return Err(HedgeError::InvalidStateTransition {
                    from: position.phase.to_string(),
                    to: target.to_string(),
                });
            }
            let transition = StateTransition::new(
                position.phase,
                target,
                patch.error_message.clone().flatten().unwrap_or_default(),
            );
            debug!(
                position_id = %position.id,
                from = %transition.from,
                to = %transition.to,
                reason = %transition.reason,
                "phase transition"
            );
        }
    }
    position.apply(patch);
    Ok(())
}
