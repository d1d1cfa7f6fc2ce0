use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

use crate::config::AppConfig;
use crate::domain::ExchangeId;
use crate::error::{HedgeError, Result};
use crate::timing::LocalClock;

use super::{ConnectorRegistry, PaperExchange};

/// Build the connector registry from `AppConfig`.
///
/// Dry-run mode registers one simulated exchange per `dry_run.exchanges`
/// entry, seeded with `dry_run.prices`. Live connectors are supplied by the
/// embedding application through `HedgeService::new`.
pub fn build_connectors(config: &AppConfig, clock: Arc<dyn LocalClock>) -> Result<ConnectorRegistry> {
    if !config.dry_run.enabled {
        return Err(HedgeError::Validation(
            "live exchange connectors are not built in; enable dry_run or register connectors explicitly"
                .to_string(),
        ));
    }

    let exchanges = config
        .paper_exchanges()
        .map_err(|errors| HedgeError::Validation(errors.join("; ")))?;

    let mut registry = ConnectorRegistry::new();
    for exchange in exchanges {
        registry.insert(Arc::new(build_paper_exchange(exchange, config, Arc::clone(&clock))));
    }
    info!(exchanges = ?registry.exchanges(), "paper connectors ready");
    Ok(registry)
}

/// Simulated exchange seeded with the configured dry-run prices
pub fn build_paper_exchange(
    exchange: ExchangeId,
    config: &AppConfig,
    clock: Arc<dyn LocalClock>,
) -> PaperExchange {
    let paper = PaperExchange::new(exchange, clock);
    for (symbol, price) in &config.dry_run.prices {
        paper.set_price(&symbol.to_ascii_uppercase(), *price);
    }
    paper
}

/// Parse an exchange name from CLI or config input
pub fn parse_exchange(name: &str) -> Result<ExchangeId> {
    ExchangeId::from_str(name).map_err(HedgeError::Validation)
}
