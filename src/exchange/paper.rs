//! In-memory simulated exchange.
//!
//! Implements the full connector capability set against local state so the
//! engine can run in dry-run mode. Server-clock skew, latency and failures
//! can be injected per call kind.

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::domain::{
    ExchangeId, LivePosition, OrderFill, OrderRequest, PositionSide, ProtectiveOrders, Ticker,
};
use crate::error::{HedgeError, Result};
use crate::timing::LocalClock;

use super::symbol::to_exchange;
use super::{ExchangeConnector, TickerCallback};

/// Injected failure for the next matching call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaperFailure {
    /// Request never reached the venue
    RateLimited,
    /// Venue refused the request
    Rejected,
    /// Outcome unknown to the caller
    Network,
}

/// Call kinds failures can be queued for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaperCall {
    ServerTime,
    Position,
    PlaceOrder,
    ClosePosition,
    Protective,
}

pub struct PaperExchange {
    exchange: ExchangeId,
    clock: Arc<dyn LocalClock>,
    skew_ms: AtomicI64,
    /// Max one-way latency in ms; each call sleeps a random 0..=latency
    latency_ms: AtomicU64,
    order_latency_ms: AtomicU64,
    prices: DashMap<String, Decimal>,
    positions: DashMap<String, LivePosition>,
    protective: DashMap<String, ProtectiveOrders>,
    subscribers: DashMap<String, Vec<TickerCallback>>,
    failures: DashMap<PaperCall, Mutex<VecDeque<PaperFailure>>>,
    orders_placed: AtomicU64,
    positions_closed: AtomicU64,
}

impl PaperExchange {
    pub fn new(exchange: ExchangeId, clock: Arc<dyn LocalClock>) -> Self {
        Self {
            exchange,
            clock,
            skew_ms: AtomicI64::new(0),
            latency_ms: AtomicU64::new(0),
            order_latency_ms: AtomicU64::new(0),
            prices: DashMap::new(),
            positions: DashMap::new(),
            protective: DashMap::new(),
            subscribers: DashMap::new(),
            failures: DashMap::new(),
            orders_placed: AtomicU64::new(0),
            positions_closed: AtomicU64::new(0),
        }
    }

    /// Server clock = local clock + skew
    pub fn set_clock_skew_ms(&self, skew_ms: i64) {
        self.skew_ms.store(skew_ms, Ordering::SeqCst);
    }

    /// Random per-call latency bound for server-time queries
    pub fn set_latency_ms(&self, latency_ms: u64) {
        self.latency_ms.store(latency_ms, Ordering::SeqCst);
    }

    /// Fixed latency for order placement and closing
    pub fn set_order_latency_ms(&self, latency_ms: u64) {
        self.order_latency_ms.store(latency_ms, Ordering::SeqCst);
    }

    /// Venue-native symbol; all state is keyed by it
    fn venue_symbol(&self, canonical: &str) -> String {
        to_exchange(self.exchange, canonical)
    }

    /// Set the last price and publish it to subscribers
    pub fn set_price(&self, symbol: &str, price: Decimal) {
        let key = self.venue_symbol(symbol);
        self.prices.insert(key.clone(), price);
        if let Some(mut position) = self.positions.get_mut(&key) {
            position.mark_price = Some(price);
        }
        if let Some(callbacks) = self.subscribers.get(&key) {
            let ticker = Ticker {
                last_price: price,
                mark_price: Some(price),
                timestamp: chrono::Utc::now(),
            };
            for callback in callbacks.iter() {
                callback(ticker);
            }
        }
    }

    /// Queue a failure for the next call of `call`
    pub fn fail_next(&self, call: PaperCall, failure: PaperFailure) {
        self.failures
            .entry(call)
            .or_insert_with(|| Mutex::new(VecDeque::new()))
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(failure);
    }

    /// Overwrite live position state (e.g. to simulate an exchange-side stop)
    pub fn set_position(&self, symbol: &str, position: LivePosition) {
        self.positions.insert(self.venue_symbol(symbol), position);
    }

    /// Flatten a position as if the venue liquidated or stopped it out
    pub fn force_flat(&self, symbol: &str) {
        self.positions.remove(&self.venue_symbol(symbol));
    }

    pub fn position(&self, symbol: &str) -> LivePosition {
        self.positions
            .get(&self.venue_symbol(symbol))
            .map(|p| p.clone())
            .unwrap_or_else(LivePosition::flat)
    }

    pub fn protective_orders(&self, symbol: &str) -> Option<ProtectiveOrders> {
        self.protective
            .get(&self.venue_symbol(symbol))
            .map(|p| p.clone())
    }

    pub fn orders_placed(&self) -> u64 {
        self.orders_placed.load(Ordering::SeqCst)
    }

    pub fn positions_closed(&self) -> u64 {
        self.positions_closed.load(Ordering::SeqCst)
    }

    fn take_failure(&self, call: PaperCall) -> Option<PaperFailure> {
        let queue = self.failures.get(&call)?;
        let mut pending = queue.lock().unwrap_or_else(PoisonError::into_inner);
        let failure = pending.pop_front();
        failure
    }

    fn check_failure(&self, call: PaperCall) -> Result<()> {
        let Some(failure) = self.take_failure(call) else {
            return Ok(());
        };
        let exchange = self.exchange;
        debug!(%exchange, ?call, ?failure, "paper exchange injecting failure");
        Err(match failure {
            PaperFailure::RateLimited => HedgeError::RateLimited {
                exchange,
                reason: "simulated rate limit".into(),
            },
            PaperFailure::Rejected => HedgeError::OrderRejected {
                exchange,
                reason: "simulated rejection".into(),
            },
            PaperFailure::Network => HedgeError::Exchange {
                exchange,
                reason: "simulated network error".into(),
            },
        })
    }

    async fn simulate_latency(&self) {
        let max = self.latency_ms.load(Ordering::SeqCst);
        if max > 0 {
            let ms = rand::thread_rng().gen_range(0..=max);
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    async fn simulate_order_latency(&self) {
        let ms = self.order_latency_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    fn price(&self, symbol: &str) -> Result<Decimal> {
        self.prices
            .get(&self.venue_symbol(symbol))
            .map(|p| *p)
            .ok_or_else(|| HedgeError::OrderRejected {
                exchange: self.exchange,
                reason: format!("no price for {}", symbol),
            })
    }
}

#[async_trait]
impl ExchangeConnector for PaperExchange {
    fn exchange(&self) -> ExchangeId {
        self.exchange
    }

    async fn get_server_time(&self) -> Result<i64> {
        self.simulate_latency().await;
        self.check_failure(PaperCall::ServerTime)?;
        let server_time = self.clock.now_ms() + self.skew_ms.load(Ordering::SeqCst);
        self.simulate_latency().await;
        Ok(server_time)
    }

    async fn get_position(&self, symbol: &str) -> Result<LivePosition> {
        self.simulate_latency().await;
        self.check_failure(PaperCall::Position)?;
        Ok(self.position(symbol))
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderFill> {
        self.check_failure(PaperCall::PlaceOrder)?;
        self.simulate_order_latency().await;

        let price = self.price(&request.symbol)?;
        self.orders_placed.fetch_add(1, Ordering::SeqCst);

        let mut entry = self
            .positions
            .entry(self.venue_symbol(&request.symbol))
            .or_insert_with(LivePosition::flat);
        match entry.side {
            Some(side) if side != request.side => {
                // Opposite order reduces the existing position
                entry.quantity -= request.quantity;
                if entry.quantity <= Decimal::ZERO {
                    *entry = LivePosition::flat();
                }
            }
            _ => {
                let previous_notional =
                    entry.entry_price.unwrap_or(Decimal::ZERO) * entry.quantity;
                entry.quantity += request.quantity;
                entry.side = Some(request.side);
                entry.entry_price =
                    Some((previous_notional + price * request.quantity) / entry.quantity);
                entry.mark_price = Some(price);
            }
        }
        drop(entry);

        Ok(OrderFill {
            order_id: Uuid::new_v4().to_string(),
            fill_price: price,
            quantity: request.quantity,
        })
    }

    async fn close_position(&self, symbol: &str, side: PositionSide) -> Result<OrderFill> {
        self.check_failure(PaperCall::ClosePosition)?;
        self.simulate_order_latency().await;

        let price = self.price(symbol)?;
        let position = self.position(symbol);
        if !position.is_open() || position.side != Some(side) {
            return Err(HedgeError::OrderRejected {
                exchange: self.exchange,
                reason: format!("no open {} position on {}", side, symbol),
            });
        }

        let key = self.venue_symbol(symbol);
        self.positions.remove(&key);
        self.protective.remove(&key);
        self.positions_closed.fetch_add(1, Ordering::SeqCst);

        Ok(OrderFill {
            order_id: Uuid::new_v4().to_string(),
            fill_price: price,
            quantity: position.quantity,
        })
    }

    async fn subscribe_ticker(&self, symbol: &str, callback: TickerCallback) -> Result<()> {
        self.subscribers
            .entry(self.venue_symbol(symbol))
            .or_default()
            .push(callback);
        Ok(())
    }

    async fn set_protective_orders(&self, orders: &ProtectiveOrders) -> Result<()> {
        self.simulate_latency().await;
        self.check_failure(PaperCall::Protective)?;
        if !self.position(&orders.symbol).is_open() {
            return Err(HedgeError::OrderRejected {
                exchange: self.exchange,
                reason: format!("no open position on {}", orders.symbol),
            });
        }
        self.protective
            .insert(self.venue_symbol(&orders.symbol), orders.clone());
        Ok(())
    }
}
