//! Per-exchange clock offset estimation.
//!
//! Each sample brackets one `get_server_time` call between two local reads
//! and assumes the server stamped its reply at the midpoint:
//!
//! `offset = server - (t0 + rtt / 2)`
//!
//! The sample with the lowest round-trip wins, since it carries the least
//! queueing noise.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, ClockConfig};
use crate::coordination::ShutdownListener;
use crate::domain::ExchangeId;
use crate::error::{HedgeError, Result};
use crate::exchange::ConnectorRegistry;

use super::LocalClock;

/// Estimated exchange-minus-local clock difference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockOffset {
    pub offset_ms: i64,
    /// Local time at the end of the winning sample
    pub measured_at_ms: i64,
    pub round_trip_ms: i64,
    pub samples: u32,
}

/// Synchronized time for one exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncedTime {
    pub ms: i64,
    /// False when no sync has succeeded yet and `ms` is raw local time
    pub synced: bool,
}

/// Clock settings resolved per exchange
#[derive(Debug, Clone, Default)]
pub struct ClockPolicy {
    default: ClockConfig,
    overrides: HashMap<ExchangeId, ClockConfig>,
}

impl ClockPolicy {
    pub fn uniform(default: ClockConfig) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let overrides = ExchangeId::ALL
            .into_iter()
            .map(|exchange| (exchange, config.clock_for(exchange)))
            .collect();
        Self {
            default: config.clock,
            overrides,
        }
    }

    pub fn with_override(mut self, exchange: ExchangeId, config: ClockConfig) -> Self {
        self.overrides.insert(exchange, config);
        self
    }

    pub fn for_exchange(&self, exchange: ExchangeId) -> ClockConfig {
        self.overrides
            .get(&exchange)
            .copied()
            .unwrap_or(self.default)
    }
}

#[derive(Debug, Clone, Default)]
struct ExchangeClock {
    offset: Option<ClockOffset>,
    /// Set while the last measured offset exceeds the hard ceiling
    fault: Option<String>,
}

/// Rolling clock offsets, one per exchange.
///
/// Written only by `sync`; read concurrently by every scheduler. Last write
/// wins.
pub struct ClockSync {
    connectors: ConnectorRegistry,
    clock: Arc<dyn LocalClock>,
    policy: ClockPolicy,
    states: DashMap<ExchangeId, ExchangeClock>,
}

impl ClockSync {
    pub fn new(connectors: ConnectorRegistry, clock: Arc<dyn LocalClock>, policy: ClockPolicy) -> Self {
        Self {
            connectors,
            clock,
            policy,
            states: DashMap::new(),
        }
    }

    pub fn local_clock(&self) -> Arc<dyn LocalClock> {
        Arc::clone(&self.clock)
    }

    pub fn policy(&self) -> &ClockPolicy {
        &self.policy
    }

    /// Measure and store a fresh offset for `exchange`
    pub async fn sync(&self, exchange: ExchangeId) -> Result<ClockOffset> {
        let connector = self.connectors.get(exchange).map_err(|e| HedgeError::ClockFailure {
            exchange,
            reason: e.to_string(),
        })?;
        let settings = self.policy.for_exchange(exchange);
        let previous = self.offset(exchange);
        let samples = match previous {
            None => settings.initial_samples,
            Some(_) => settings.refresh_samples,
        }
        .max(1);

        let mut best: Option<ClockOffset> = None;
        let mut last_error = None;
        for _ in 0..samples {
            let t0 = self.clock.now_ms();
            match connector.get_server_time().await {
                Ok(server_ms) => {
                    let t1 = self.clock.now_ms();
                    let round_trip_ms = (t1 - t0).max(0);
                    let sample = ClockOffset {
                        offset_ms: server_ms - (t0 + round_trip_ms / 2),
                        measured_at_ms: t1,
                        round_trip_ms,
                        samples,
                    };
                    debug!(%exchange, offset_ms = sample.offset_ms, round_trip_ms, "clock sample");
                    if best.map_or(true, |b| sample.round_trip_ms < b.round_trip_ms) {
                        best = Some(sample);
                    }
                }
                Err(e) => {
                    debug!(%exchange, error = %e, "clock sample failed");
                    last_error = Some(e);
                }
            }
        }

        let Some(measured) = best else {
            let reason = format!(
                "all {} server-time samples failed: {}",
                samples,
                last_error.map(|e| e.to_string()).unwrap_or_default()
            );
            warn!(%exchange, %reason, "clock sync failed");
            return Err(HedgeError::ClockFailure { exchange, reason });
        };

        let magnitude = measured.offset_ms.abs();
        if magnitude > settings.max_offset_ms {
            let reason = format!(
                "offset {}ms exceeds ceiling {}ms",
                measured.offset_ms, settings.max_offset_ms
            );
            error!(%exchange, offset_ms = measured.offset_ms, "clock offset above hard ceiling, exchange clock faulted");
            self.states.insert(
                exchange,
                ExchangeClock {
                    offset: Some(measured),
                    fault: Some(reason.clone()),
                },
            );
            return Err(HedgeError::ClockFailure { exchange, reason });
        }
        if magnitude > settings.large_offset_warn_ms {
            warn!(%exchange, offset_ms = measured.offset_ms, "large clock offset");
        }
        if let Some(previous) = previous {
            let drift = (measured.offset_ms - previous.offset_ms).abs();
            if drift > settings.drift_warn_ms {
                warn!(
                    %exchange,
                    drift_ms = drift,
                    previous_ms = previous.offset_ms,
                    current_ms = measured.offset_ms,
                    "clock drift detected; armed actions keep their original targets"
                );
            }
        }

        self.states.insert(
            exchange,
            ExchangeClock {
                offset: Some(measured),
                fault: None,
            },
        );
        info!(
            %exchange,
            offset_ms = measured.offset_ms,
            round_trip_ms = measured.round_trip_ms,
            "clock synced"
        );
        Ok(measured)
    }

    /// Synchronized time for `exchange`.
    ///
    /// Raw local time (flagged `synced: false`) before the first successful
    /// sync; an error while the exchange clock is faulted.
    pub fn now(&self, exchange: ExchangeId) -> Result<SyncedTime> {
        let local = self.clock.now_ms();
        let Some(state) = self.states.get(&exchange) else {
            return Ok(SyncedTime {
                ms: local,
                synced: false,
            });
        };

        if let Some(reason) = &state.fault {
            return Err(HedgeError::ClockFailure {
                exchange,
                reason: reason.clone(),
            });
        }
        Ok(match state.offset {
            Some(offset) => SyncedTime {
                ms: local + offset.offset_ms,
                synced: true,
            },
            None => SyncedTime {
                ms: local,
                synced: false,
            },
        })
    }

    /// Latest healthy offset, if any
    pub fn offset(&self, exchange: ExchangeId) -> Option<ClockOffset> {
        self.states
            .get(&exchange)
            .filter(|state| state.fault.is_none())
            .and_then(|state| state.offset)
    }

    pub fn is_faulted(&self, exchange: ExchangeId) -> bool {
        self.states
            .get(&exchange)
            .map(|state| state.fault.is_some())
            .unwrap_or(false)
    }

    /// Discard everything known about `exchange` (e.g. credential revoked)
    pub fn invalidate(&self, exchange: ExchangeId) {
        if self.states.remove(&exchange).is_some() {
            info!(%exchange, "clock offset discarded");
        }
    }

    /// Resync `exchange` on its configured interval until shutdown
    pub async fn run_refresh(self: Arc<Self>, exchange: ExchangeId, mut shutdown: ShutdownListener) {
        let interval = Duration::from_millis(self.policy.for_exchange(exchange).refresh_interval_ms);
        info!(%exchange, interval_ms = interval.as_millis() as u64, "starting clock refresh");

        if let Err(e) = self.sync(exchange).await {
            warn!(%exchange, error = %e, "initial clock sync failed");
        }

        loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    info!(%exchange, "clock refresh stopped");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.sync(exchange).await {
                        warn!(%exchange, error = %e, "clock resync failed");
                    }
                }
            }
        }
    }

    /// One independent refresh task per registered exchange
    pub fn spawn_refresh_all(self: &Arc<Self>, shutdown: &ShutdownListener) -> Vec<JoinHandle<()>> {
        self.connectors
            .exchanges()
            .into_iter()
            .map(|exchange| {
                let sync = Arc::clone(self);
                tokio::spawn(sync.run_refresh(exchange, shutdown.clone()))
            })
            .collect()
    }
}
