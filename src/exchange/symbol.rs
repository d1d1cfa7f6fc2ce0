//! Canonical symbol translation.
//!
//! The core stores symbols as `BASEQUOTE` (e.g. `BTCUSDT`). Each venue spells
//! them differently; connectors translate at the boundary.

use crate::domain::ExchangeId;

const QUOTE_ASSETS: [&str; 4] = ["USDT", "USDC", "USD", "BTC"];

/// Split a canonical symbol into base and quote
pub fn split_canonical(symbol: &str) -> Option<(&str, &str)> {
    QUOTE_ASSETS.iter().find_map(|quote| {
        symbol
            .strip_suffix(quote)
            .filter(|base| !base.is_empty())
            .map(|base| (base, *quote))
    })
}

/// Venue-specific spelling of a canonical symbol
pub fn to_exchange(exchange: ExchangeId, canonical: &str) -> String {
    let canonical = canonical.trim().to_ascii_uppercase();
    let Some((base, quote)) = split_canonical(&canonical) else {
        return canonical;
    };

    match exchange {
        ExchangeId::Bingx => format!("{}-{}", base, quote),
        ExchangeId::Okx => format!("{}-{}-SWAP", base, quote),
        ExchangeId::Gate => format!("{}_{}", base, quote),
        ExchangeId::Bybit | ExchangeId::Binance | ExchangeId::Paper => canonical,
    }
}

/// Canonical spelling of a venue symbol (`AAA-USDT`, `AAA_USDT`, `AAA-USDT-SWAP`)
pub fn to_canonical(raw: &str) -> String {
    let upper = raw.trim().to_ascii_uppercase();
    let trimmed = upper.strip_suffix("-SWAP").unwrap_or(&upper);
    trimmed.replace(['-', '_', '/'], "")
}
