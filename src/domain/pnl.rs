//! Realized P&L for a closed hedge.
//!
//! Per leg: short return = `(entry - exit) / entry`, long return is the
//! negation. Fees are a flat taker rate charged once per fill.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{ExchangeId, LegRole, PositionSide};

/// Fills per leg over a full cycle (entry + exit)
pub const FILLS_PER_LEG: u32 = 2;

/// Signed return of one leg, as a fraction of entry price
pub fn leg_return(side: PositionSide, entry_price: Decimal, exit_price: Decimal) -> Decimal {
    if entry_price.is_zero() {
        return Decimal::ZERO;
    }
    let short_return = (entry_price - exit_price) / entry_price;
    match side {
        PositionSide::Short => short_return,
        PositionSide::Long => -short_return,
    }
}

/// Closed-leg inputs for the P&L calculation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosedLeg {
    pub role: LegRole,
    pub exchange: ExchangeId,
    pub side: PositionSide,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub taker_fee_rate: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegPnl {
    pub role: LegRole,
    pub exchange: ExchangeId,
    pub side: PositionSide,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    /// Signed price-move return (fraction)
    pub price_return: Decimal,
    /// Fee cost for all fills on this leg (fraction)
    pub fees: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PnlReport {
    pub legs: Vec<LegPnl>,
    pub gross_return: Decimal,
    pub total_fees: Decimal,
    /// Net return as a fraction (0.01 = 1%)
    pub net_return: Decimal,
    /// Net return in percent units
    pub net_profit_percent: Decimal,
    /// Net profit in quote currency for the given position size
    pub net_profit_quote: Decimal,
    pub position_size_quote: Decimal,
}

impl PnlReport {
    pub fn compute(legs: &[ClosedLeg], position_size_quote: Decimal) -> Self {
        let legs: Vec<LegPnl> = legs
            .iter()
            .map(|leg| LegPnl {
                role: leg.role,
                exchange: leg.exchange,
                side: leg.side,
                entry_price: leg.entry_price,
                exit_price: leg.exit_price,
                price_return: leg_return(leg.side, leg.entry_price, leg.exit_price),
                fees: leg.taker_fee_rate * Decimal::from(FILLS_PER_LEG),
            })
            .collect();

        let gross_return: Decimal = legs.iter().map(|l| l.price_return).sum();
        let total_fees: Decimal = legs.iter().map(|l| l.fees).sum();
        let net_return = gross_return - total_fees;

        Self {
            legs,
            gross_return,
            total_fees,
            net_return,
            net_profit_percent: net_return * Decimal::ONE_HUNDRED,
            net_profit_quote: net_return * position_size_quote,
            position_size_quote,
        }
    }
}
