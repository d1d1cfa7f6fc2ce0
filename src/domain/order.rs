use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::PositionSide;

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Limit,
    Market,
}

/// Order request (what we want to do)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: String,
    /// Canonical symbol; connectors translate to their own spelling
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub order_type: OrderType,
    pub reduce_only: bool,
}

impl OrderRequest {
    pub fn market_open(symbol: impl Into<String>, side: PositionSide, quantity: Decimal) -> Self {
        Self {
            client_order_id: Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            side,
            quantity,
            order_type: OrderType::Market,
            reduce_only: false,
        }
    }
}

/// Fill returned by an exchange for a placed or closing order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderFill {
    pub order_id: String,
    pub fill_price: Decimal,
    pub quantity: Decimal,
}

/// Take-profit / stop-loss trigger prices for one open leg
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtectiveOrders {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub take_profit: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
}

impl ProtectiveOrders {
    /// Derive trigger prices from percentage distances around `reference`.
    ///
    /// Percentages are expressed in percent units (1.5 = 1.5%).
    pub fn from_percentages(
        symbol: impl Into<String>,
        side: PositionSide,
        quantity: Decimal,
        reference: Decimal,
        take_profit_percent: Option<Decimal>,
        stop_loss_percent: Option<Decimal>,
    ) -> Self {
        let hundred = Decimal::ONE_HUNDRED;
        let take_profit = take_profit_percent.map(|pct| match side {
            PositionSide::Long => reference * (Decimal::ONE + pct / hundred),
            PositionSide::Short => reference * (Decimal::ONE - pct / hundred),
        });
        let stop_loss = stop_loss_percent.map(|pct| match side {
            PositionSide::Long => reference * (Decimal::ONE - pct / hundred),
            PositionSide::Short => reference * (Decimal::ONE + pct / hundred),
        });

        Self {
            symbol: symbol.into(),
            side,
            quantity,
            take_profit,
            stop_loss,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.take_profit.is_none() && self.stop_loss.is_none()
    }
}
