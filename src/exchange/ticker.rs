//! Process-scoped ticker cache with explicit TTL and invalidation

use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::domain::{ExchangeId, Ticker};

use super::TickerCallback;

type Key = (ExchangeId, String);

/// Last ticker per (exchange, canonical symbol)
#[derive(Debug)]
pub struct TickerCache {
    entries: DashMap<Key, (Ticker, Instant)>,
    ttl: Duration,
}

impl TickerCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn update(&self, exchange: ExchangeId, symbol: &str, ticker: Ticker) {
        self.entries
            .insert((exchange, symbol.to_string()), (ticker, Instant::now()));
    }

    /// Fresh ticker, or `None` if missing or older than the TTL
    pub fn get(&self, exchange: ExchangeId, symbol: &str) -> Option<Ticker> {
        let key = (exchange, symbol.to_string());
        let entry = self.entries.get(&key)?;
        let (ticker, stored_at) = *entry;
        drop(entry);

        if stored_at.elapsed() > self.ttl {
            self.entries.remove(&key);
            debug!(%exchange, symbol, "ticker expired");
            return None;
        }
        Some(ticker)
    }

    /// Mark price if present, otherwise last price
    pub fn reference_price(&self, exchange: ExchangeId, symbol: &str) -> Option<Decimal> {
        self.get(exchange, symbol)
            .map(|t| t.mark_price.unwrap_or(t.last_price))
    }

    pub fn invalidate(&self, exchange: ExchangeId, symbol: &str) {
        self.entries.remove(&(exchange, symbol.to_string()));
    }

    /// Drop every entry for an exchange (e.g. after its feed disconnects)
    pub fn invalidate_exchange(&self, exchange: ExchangeId) {
        self.entries.retain(|(ex, _), _| *ex != exchange);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Callback that feeds this cache from a connector subscription
    pub fn subscriber(self: &Arc<Self>, exchange: ExchangeId, symbol: &str) -> TickerCallback {
        let cache = Arc::clone(self);
        let symbol = symbol.to_string();
        Arc::new(move |ticker| cache.update(exchange, &symbol, ticker))
    }
}
