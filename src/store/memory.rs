use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::domain::{HedgePosition, PositionId, PositionPatch, PositionStatus};
use crate::error::{HedgeError, Result};

use super::{apply_patch, HedgePositionStore};

/// Process-local store used in dry-run mode and tests
#[derive(Debug, Default)]
pub struct MemoryStore {
    positions: RwLock<HashMap<PositionId, HedgePosition>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.positions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.positions.read().await.is_empty()
    }
}

#[async_trait]
impl HedgePositionStore for MemoryStore {
    async fn create(&self, position: &HedgePosition) -> Result<()> {
        let mut positions = self.positions.write().await;
        if positions.contains_key(&position.id) {
            return Err(HedgeError::Validation(format!(
                "position {} already exists",
                position.id
            )));
        }
        positions.insert(position.id, position.clone());
        Ok(())
    }

    async fn get(&self, id: PositionId) -> Result<Option<HedgePosition>> {
        Ok(self.positions.read().await.get(&id).cloned())
    }

    async fn update(&self, id: PositionId, patch: &PositionPatch) -> Result<HedgePosition> {
        let mut positions = self.positions.write().await;
        let record = positions
            .get_mut(&id)
            .ok_or(HedgeError::PositionNotFound(id))?;

        let mut updated = record.clone();
        apply_patch(&mut updated, patch)?;
        *record = updated.clone();
        Ok(updated)
    }

    async fn find_by_status(&self, statuses: &[PositionStatus]) -> Result<Vec<HedgePosition>> {
        let mut found: Vec<HedgePosition> = self
            .positions
            .read()
            .await
            .values()
            .filter(|p| statuses.contains(&p.status))
            .cloned()
            .collect();
        found.sort_by_key(|p| p.created_at);
        Ok(found)
    }
}
