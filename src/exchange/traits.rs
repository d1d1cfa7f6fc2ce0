use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::{
    ExchangeId, LivePosition, OrderFill, OrderRequest, PositionSide, ProtectiveOrders, Ticker,
};
use crate::error::{HedgeError, Result};

/// Callback invoked for every ticker update of a subscription
pub type TickerCallback = Arc<dyn Fn(Ticker) + Send + Sync>;

fn unsupported(feature: &str, exchange: ExchangeId) -> HedgeError {
    HedgeError::Validation(format!(
        "{} is not implemented for exchange '{}'",
        feature,
        exchange.as_str()
    ))
}

/// Normalized capability set every exchange adapter provides.
///
/// Implementations own authentication, rate limiting and symbol translation;
/// callers always pass the canonical symbol (e.g. `BTCUSDT`).
///
/// Error contract for order methods: `RateLimited` and `Transient` mean the
/// request provably never reached the matching engine. Anything else may have
/// been executed and must not be retried.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeConnector: Send + Sync {
    fn exchange(&self) -> ExchangeId;

    /// Exchange server time in epoch milliseconds
    async fn get_server_time(&self) -> Result<i64>;

    async fn get_position(&self, symbol: &str) -> Result<LivePosition>;

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderFill>;

    /// Close the whole position held on `side` for `symbol`
    async fn close_position(&self, symbol: &str, side: PositionSide) -> Result<OrderFill>;

    async fn subscribe_ticker(&self, _symbol: &str, _callback: TickerCallback) -> Result<()> {
        Err(unsupported("subscribe_ticker", self.exchange()))
    }

    async fn set_protective_orders(&self, _orders: &ProtectiveOrders) -> Result<()> {
        Err(unsupported("set_protective_orders", self.exchange()))
    }
}

/// Connectors keyed by exchange
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    connectors: HashMap<ExchangeId, Arc<dyn ExchangeConnector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, connector: Arc<dyn ExchangeConnector>) -> Self {
        self.insert(connector);
        self
    }

    pub fn insert(&mut self, connector: Arc<dyn ExchangeConnector>) {
        self.connectors.insert(connector.exchange(), connector);
    }

    pub fn get(&self, exchange: ExchangeId) -> Result<Arc<dyn ExchangeConnector>> {
        self.connectors.get(&exchange).cloned().ok_or_else(|| {
            HedgeError::Validation(format!("no connector registered for {}", exchange))
        })
    }

    pub fn exchanges(&self) -> Vec<ExchangeId> {
        let mut exchanges: Vec<ExchangeId> = self.connectors.keys().copied().collect();
        exchanges.sort();
        exchanges
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }
}

impl std::fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorRegistry")
            .field("exchanges", &self.exchanges())
            .finish()
    }
}
