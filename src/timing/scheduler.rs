//! Cancellable one-shot actions against synchronized exchange time.
//!
//! Every action is a single tokio timer task. The delay is resolved once at
//! arm time; later clock resyncs never move an armed action.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::domain::{ExchangeId, LegRole, PositionId};
use crate::error::{HedgeError, Result};

use super::ClockSync;

const ARMED: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    EntryPrimary,
    EntryHedge,
    ExitPrimary,
    ExitHedge,
}

impl ActionKind {
    pub fn entry(role: LegRole) -> Self {
        match role {
            LegRole::Primary => ActionKind::EntryPrimary,
            LegRole::Hedge => ActionKind::EntryHedge,
        }
    }

    pub fn exit(role: LegRole) -> Self {
        match role {
            LegRole::Primary => ActionKind::ExitPrimary,
            LegRole::Hedge => ActionKind::ExitHedge,
        }
    }

    pub fn role(&self) -> LegRole {
        match self {
            ActionKind::EntryPrimary | ActionKind::ExitPrimary => LegRole::Primary,
            ActionKind::EntryHedge | ActionKind::ExitHedge => LegRole::Hedge,
        }
    }

    pub fn is_entry(&self) -> bool {
        matches!(self, ActionKind::EntryPrimary | ActionKind::EntryHedge)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::EntryPrimary => "ENTRY_PRIMARY",
            ActionKind::EntryHedge => "ENTRY_HEDGE",
            ActionKind::ExitPrimary => "EXIT_PRIMARY",
            ActionKind::ExitHedge => "EXIT_HEDGE",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionState {
    Armed,
    Fired,
    Cancelled,
}

#[derive(Debug)]
struct ActionInner {
    id: u64,
    exchange: ExchangeId,
    target_ms: i64,
    state: AtomicU8,
    cancelled: Notify,
}

/// Handle to one armed action
#[derive(Debug, Clone)]
pub struct ActionHandle {
    inner: Arc<ActionInner>,
}

impl ActionHandle {
    /// Prevent the action from firing.
    ///
    /// Returns `true` only when this call stopped the callback. Cancelling a
    /// fired or already-cancelled action does nothing and never interrupts a
    /// callback that is running.
    pub fn cancel(&self) -> bool {
        let prevented = self
            .inner
            .state
            .compare_exchange(ARMED, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if prevented {
            self.inner.cancelled.notify_one();
        }
        prevented
    }

    pub fn state(&self) -> ActionState {
        match self.inner.state.load(Ordering::SeqCst) {
            ARMED => ActionState::Armed,
            FIRED => ActionState::Fired,
            _ => ActionState::Cancelled,
        }
    }

    pub fn exchange(&self) -> ExchangeId {
        self.inner.exchange
    }

    /// Synchronized target time
    pub fn target_ms(&self) -> i64 {
        self.inner.target_ms
    }

    fn id(&self) -> u64 {
        self.inner.id
    }
}

/// Registry entry for an action armed on behalf of a position
#[derive(Debug, Clone)]
pub struct ScheduledAction {
    pub position_id: PositionId,
    pub kind: ActionKind,
    pub handle: ActionHandle,
}

impl ScheduledAction {
    pub fn target_ms(&self) -> i64 {
        self.handle.target_ms()
    }
}

/// Outcome of cancelling every action of a position
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelSummary {
    /// Actions whose callbacks will never run
    pub prevented: Vec<ActionKind>,
    /// Actions that had already fired and were still executing
    pub already_fired: Vec<ActionKind>,
}

impl CancelSummary {
    pub fn prevented_count(&self) -> usize {
        self.prevented.len()
    }
}

type Registry = DashMap<PositionId, Vec<ScheduledAction>>;

pub struct ActionScheduler {
    clock: Arc<ClockSync>,
    config: SchedulerConfig,
    actions: Arc<Registry>,
    next_id: AtomicU64,
}

impl ActionScheduler {
    pub fn new(clock: Arc<ClockSync>, config: SchedulerConfig) -> Self {
        Self {
            clock,
            config,
            actions: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn clock(&self) -> &Arc<ClockSync> {
        &self.clock
    }

    /// Arm `callback` to run when `exchange`'s synchronized clock reaches
    /// `target_ms`
    pub fn arm<F, Fut>(&self, exchange: ExchangeId, target_ms: i64, callback: F) -> Result<ActionHandle>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (handle, delay) = self.prepare(exchange, target_ms)?;
        self.spawn_timer(handle.clone(), delay, callback, None);
        Ok(handle)
    }

    /// Arm an action and register it under `position_id`
    pub fn arm_action<F, Fut>(
        &self,
        position_id: PositionId,
        kind: ActionKind,
        exchange: ExchangeId,
        target_ms: i64,
        callback: F,
    ) -> Result<ActionHandle>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (handle, delay) = self.prepare(exchange, target_ms)?;
        self.actions
            .entry(position_id)
            .or_default()
            .push(ScheduledAction {
                position_id,
                kind,
                handle: handle.clone(),
            });
        debug!(%position_id, %kind, %exchange, target_ms, "action registered");
        self.spawn_timer(handle.clone(), delay, callback, Some(position_id));
        Ok(handle)
    }

    /// Cancel every armed action of one position
    pub fn cancel_position(&self, position_id: PositionId) -> CancelSummary {
        let mut summary = CancelSummary::default();
        let Some(actions) = self.actions.get(&position_id).map(|a| a.clone()) else {
            return summary;
        };

        for action in actions {
            if action.handle.cancel() {
                summary.prevented.push(action.kind);
            } else if action.handle.state() == ActionState::Fired {
                summary.already_fired.push(action.kind);
            }
        }
        if !summary.prevented.is_empty() || !summary.already_fired.is_empty() {
            info!(
                %position_id,
                prevented = summary.prevented.len(),
                in_flight = summary.already_fired.len(),
                "position actions cancelled"
            );
        }
        summary
    }

    /// Cancel only the given kinds for a position
    pub fn cancel_kinds(&self, position_id: PositionId, kinds: &[ActionKind]) -> usize {
        let Some(actions) = self.actions.get(&position_id).map(|a| a.clone()) else {
            return 0;
        };
        actions
            .iter()
            .filter(|action| kinds.contains(&action.kind))
            .filter(|action| action.handle.cancel())
            .count()
    }

    pub fn armed_count(&self, position_id: PositionId) -> usize {
        self.actions
            .get(&position_id)
            .map(|actions| {
                actions
                    .iter()
                    .filter(|a| a.handle.state() == ActionState::Armed)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Registered actions of a position that have not settled yet
    pub fn actions(&self, position_id: PositionId) -> Vec<ScheduledAction> {
        self.actions
            .get(&position_id)
            .map(|a| a.clone())
            .unwrap_or_default()
    }

    /// Cancel everything still armed (used on emergency shutdown)
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<PositionId> = self.actions.iter().map(|e| *e.key()).collect();
        ids.into_iter()
            .map(|id| self.cancel_position(id).prevented_count())
            .sum()
    }

    fn prepare(&self, exchange: ExchangeId, target_ms: i64) -> Result<(ActionHandle, Duration)> {
        let now = self.clock.now(exchange)?;
        let lead_ms = target_ms - now.ms;
        if lead_ms < self.config.min_lead_time_ms {
            warn!(%exchange, target_ms, lead_ms, "action rejected: lead time too short");
            return Err(HedgeError::Scheduling {
                exchange,
                lead_ms,
                min_lead_ms: self.config.min_lead_time_ms,
            });
        }
        if !now.synced {
            warn!(%exchange, target_ms, "arming against unsynchronized local clock");
        }

        let handle = ActionHandle {
            inner: Arc::new(ActionInner {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                exchange,
                target_ms,
                state: AtomicU8::new(ARMED),
                cancelled: Notify::new(),
            }),
        };
        Ok((handle, Duration::from_millis(lead_ms.max(0) as u64)))
    }

    fn spawn_timer<F, Fut>(
        &self,
        handle: ActionHandle,
        delay: Duration,
        callback: F,
        position_id: Option<PositionId>,
    ) where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let registry = Arc::clone(&self.actions);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let fired = handle
                        .inner
                        .state
                        .compare_exchange(ARMED, FIRED, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok();
                    if fired {
                        debug!(exchange = %handle.exchange(), target_ms = handle.target_ms(), "action fired");
                        callback().await;
                    }
                }
                _ = handle.inner.cancelled.notified() => {
                    debug!(exchange = %handle.exchange(), target_ms = handle.target_ms(), "action cancelled");
                }
            }

            if let Some(position_id) = position_id {
                settle(&registry, position_id, handle.id());
            }
        });
    }
}

fn settle(registry: &Registry, position_id: PositionId, action_id: u64) {
    let now_empty = match registry.get_mut(&position_id) {
        Some(mut actions) => {
            actions.retain(|a| a.handle.id() != action_id);
            actions.is_empty()
        }
        None => false,
    };
    if now_empty {
        registry.remove_if(&position_id, |_, actions| actions.is_empty());
    }
}
