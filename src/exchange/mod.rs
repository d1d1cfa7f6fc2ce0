//! Exchange connectors and market data plumbing

pub mod factory;
pub mod mapping;
pub mod paper;
pub mod symbol;
pub mod ticker;
mod traits;

pub use factory::{build_connectors, build_paper_exchange, parse_exchange};
pub use paper::{PaperCall, PaperExchange, PaperFailure};
pub use ticker::TickerCache;
#[cfg(test)]
pub use traits::MockExchangeConnector;
pub use traits::{ConnectorRegistry, ExchangeConnector, TickerCallback};
