use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Exchange a leg is opened on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExchangeId {
    Bybit,
    Bingx,
    Binance,
    Okx,
    Gate,
    /// In-memory simulated venue used for dry runs
    Paper,
}

impl ExchangeId {
    pub const ALL: [ExchangeId; 6] = [
        ExchangeId::Bybit,
        ExchangeId::Bingx,
        ExchangeId::Binance,
        ExchangeId::Okx,
        ExchangeId::Gate,
        ExchangeId::Paper,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeId::Bybit => "BYBIT",
            ExchangeId::Bingx => "BINGX",
            ExchangeId::Binance => "BINANCE",
            ExchangeId::Okx => "OKX",
            ExchangeId::Gate => "GATE",
            ExchangeId::Paper => "PAPER",
        }
    }
}

impl std::fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ExchangeId {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "bybit" => Ok(ExchangeId::Bybit),
            "bingx" => Ok(ExchangeId::Bingx),
            "binance" => Ok(ExchangeId::Binance),
            "okx" => Ok(ExchangeId::Okx),
            "gate" | "gateio" | "gate.io" => Ok(ExchangeId::Gate),
            "paper" => Ok(ExchangeId::Paper),
            other => Err(format!("unknown exchange: {}", other)),
        }
    }
}

/// Direction of a perpetual-futures position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Get the opposite side
    pub fn opposite(&self) -> Self {
        match self {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "LONG",
            PositionSide::Short => "SHORT",
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PositionSide {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "long" | "buy" => Ok(PositionSide::Long),
            "short" | "sell" => Ok(PositionSide::Short),
            other => Err(format!("unknown side: {}", other)),
        }
    }
}

/// Live position state reported by an exchange for one symbol.
///
/// A zero `quantity` means the account is flat on that symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivePosition {
    pub side: Option<PositionSide>,
    pub quantity: Decimal,
    pub entry_price: Option<Decimal>,
    pub mark_price: Option<Decimal>,
}

impl LivePosition {
    pub fn flat() -> Self {
        Self {
            side: None,
            quantity: Decimal::ZERO,
            entry_price: None,
            mark_price: None,
        }
    }

    pub fn is_open(&self) -> bool {
        !self.quantity.is_zero()
    }
}

/// Last traded / mark price update for a symbol
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub last_price: Decimal,
    pub mark_price: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}
