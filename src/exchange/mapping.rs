//! Typed response mapping for exchange REST payloads.
//!
//! Each venue gets explicit serde structs and a mapping function into the
//! normalized domain model. Connectors call these; the engine never sees raw
//! exchange JSON.

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::domain::{ExchangeId, LivePosition, PositionSide};
use crate::error::{HedgeError, Result};

use super::symbol::to_canonical;

fn exchange_error(exchange: ExchangeId, code: i64, msg: &str) -> HedgeError {
    // 10006 (Bybit) and 100410 (BingX) are rate-limit codes
    if code == 10006 || code == 100410 {
        HedgeError::RateLimited {
            exchange,
            reason: format!("{} ({})", msg, code),
        }
    } else {
        HedgeError::Exchange {
            exchange,
            reason: format!("{} ({})", msg, code),
        }
    }
}

fn parse_decimal(exchange: ExchangeId, field: &str, raw: &str) -> Result<Option<Decimal>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse::<Decimal>().map(Some).map_err(|e| HedgeError::Exchange {
        exchange,
        reason: format!("invalid {} '{}': {}", field, raw, e),
    })
}

// ---------------------------------------------------------------------------
// Bybit v5
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BybitEnvelope<T> {
    pub ret_code: i64,
    pub ret_msg: String,
    pub result: Option<T>,
    /// Server timestamp in ms, present on every response
    pub time: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BybitServerTime {
    pub time_second: String,
    pub time_nano: String,
}

#[derive(Debug, Deserialize)]
pub struct BybitPositionList {
    pub list: Vec<BybitPosition>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BybitPosition {
    pub symbol: String,
    /// "Buy", "Sell" or "" when flat
    pub side: String,
    pub size: String,
    pub avg_price: String,
    pub mark_price: String,
}

impl<T> BybitEnvelope<T> {
    fn into_result(self) -> Result<T> {
        if self.ret_code != 0 {
            return Err(exchange_error(ExchangeId::Bybit, self.ret_code, &self.ret_msg));
        }
        self.result.ok_or_else(|| HedgeError::Exchange {
            exchange: ExchangeId::Bybit,
            reason: "response has no result".into(),
        })
    }
}

pub fn bybit_server_time(body: &str) -> Result<i64> {
    let envelope: BybitEnvelope<BybitServerTime> = serde_json::from_str(body)?;
    let fallback = envelope.time;
    let time = envelope.into_result()?;

    // timeNano carries sub-second precision; prefer it over the envelope time
    match time.time_nano.parse::<i128>() {
        Ok(nanos) => Ok((nanos / 1_000_000) as i64),
        Err(_) => fallback.ok_or_else(|| HedgeError::Exchange {
            exchange: ExchangeId::Bybit,
            reason: format!("unparseable server time '{}'", time.time_second),
        }),
    }
}

pub fn bybit_position(body: &str, canonical_symbol: &str) -> Result<LivePosition> {
    let envelope: BybitEnvelope<BybitPositionList> = serde_json::from_str(body)?;
    let list = envelope.into_result()?;
    let exchange = ExchangeId::Bybit;

    let Some(raw) = list
        .list
        .into_iter()
        .find(|p| to_canonical(&p.symbol) == canonical_symbol)
    else {
        return Ok(LivePosition::flat());
    };

    let quantity = parse_decimal(exchange, "size", &raw.size)?.unwrap_or(Decimal::ZERO);
    if quantity.is_zero() {
        return Ok(LivePosition::flat());
    }
    let side = match raw.side.as_str() {
        "Buy" => PositionSide::Long,
        "Sell" => PositionSide::Short,
        other => {
            return Err(HedgeError::Exchange {
                exchange,
                reason: format!("unexpected position side '{}'", other),
            })
        }
    };

    Ok(LivePosition {
        side: Some(side),
        quantity: quantity.abs(),
        entry_price: parse_decimal(exchange, "avgPrice", &raw.avg_price)?,
        mark_price: parse_decimal(exchange, "markPrice", &raw.mark_price)?,
    })
}

// ---------------------------------------------------------------------------
// BingX perpetual swap v2
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct BingxEnvelope<T> {
    pub code: i64,
    #[serde(default)]
    pub msg: String,
    pub data: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BingxServerTime {
    pub server_time: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BingxPosition {
    pub symbol: String,
    /// "LONG" or "SHORT"
    pub position_side: String,
    pub position_amt: String,
    pub avg_price: String,
    #[serde(default)]
    pub mark_price: String,
}

impl<T> BingxEnvelope<T> {
    fn into_result(self) -> Result<T> {
        if self.code != 0 {
            return Err(exchange_error(ExchangeId::Bingx, self.code, &self.msg));
        }
        self.data.ok_or_else(|| HedgeError::Exchange {
            exchange: ExchangeId::Bingx,
            reason: "response has no data".into(),
        })
    }
}

pub fn bingx_server_time(body: &str) -> Result<i64> {
    let envelope: BingxEnvelope<BingxServerTime> = serde_json::from_str(body)?;
    Ok(envelope.into_result()?.server_time)
}

pub fn bingx_position(body: &str, canonical_symbol: &str) -> Result<LivePosition> {
    let envelope: BingxEnvelope<Vec<BingxPosition>> = serde_json::from_str(body)?;
    let positions = envelope.into_result()?;
    let exchange = ExchangeId::Bingx;

    let Some(raw) = positions
        .into_iter()
        .filter(|p| to_canonical(&p.symbol) == canonical_symbol)
        .find(|p| {
            p.position_amt
                .trim()
                .parse::<Decimal>()
                .map(|q| !q.is_zero())
                .unwrap_or(false)
        })
    else {
        return Ok(LivePosition::flat());
    };

    let amount = parse_decimal(exchange, "positionAmt", &raw.position_amt)?.unwrap_or(Decimal::ZERO);
    let side = match raw.position_side.to_ascii_uppercase().as_str() {
        "LONG" => PositionSide::Long,
        "SHORT" => PositionSide::Short,
        // one-way mode reports BOTH with a signed amount
        "BOTH" if amount.is_sign_negative() => PositionSide::Short,
        "BOTH" => PositionSide::Long,
        other => {
            return Err(HedgeError::Exchange {
                exchange,
                reason: format!("unexpected positionSide '{}'", other),
            })
        }
    };

    Ok(LivePosition {
        side: Some(side),
        quantity: amount.abs(),
        entry_price: parse_decimal(exchange, "avgPrice", &raw.avg_price)?,
        mark_price: parse_decimal(exchange, "markPrice", &raw.mark_price)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn bybit_server_time_prefers_nanos() {
        let body = r#"{"retCode":0,"retMsg":"OK","result":{"timeSecond":"1700000000","timeNano":"1700000000123456789"},"time":1700000000125}"#;
        assert_eq!(bybit_server_time(body).unwrap(), 1_700_000_000_123);
    }

    #[test]
    fn bybit_position_maps_sell_to_short() {
        let body = r#"{"retCode":0,"retMsg":"OK","result":{"list":[
            {"symbol":"AAAUSDT","side":"Sell","size":"12.5","avgPrice":"100.1","markPrice":"100.3"}
        ]},"time":1}"#;
        let position = bybit_position(body, "AAAUSDT").unwrap();
        assert_eq!(position.side, Some(PositionSide::Short));
        assert_eq!(position.quantity, dec!(12.5));
        assert_eq!(position.entry_price, Some(dec!(100.1)));
        assert_eq!(position.mark_price, Some(dec!(100.3)));
    }

    #[test]
    fn bybit_flat_position_has_empty_side() {
        let body = r#"{"retCode":0,"retMsg":"OK","result":{"list":[
            {"symbol":"AAAUSDT","side":"","size":"0","avgPrice":"0","markPrice":"100.3"}
        ]},"time":1}"#;
        assert!(!bybit_position(body, "AAAUSDT").unwrap().is_open());
    }

    #[test]
    fn bybit_rate_limit_is_retryable() {
        let body = r#"{"retCode":10006,"retMsg":"Too many visits!","result":null,"time":1}"#;
        let err = bybit_server_time(body).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn bingx_position_translates_symbol() {
        let body = r#"{"code":0,"msg":"","data":[
            {"symbol":"AAA-USDT","positionSide":"SHORT","positionAmt":"0","avgPrice":"0"},
            {"symbol":"AAA-USDT","positionSide":"LONG","positionAmt":"3","avgPrice":"50.5","markPrice":"50.7"}
        ]}"#;
        let position = bingx_position(body, "AAAUSDT").unwrap();
        assert_eq!(position.side, Some(PositionSide::Long));
        assert_eq!(position.quantity, dec!(3));
        assert_eq!(position.entry_price, Some(dec!(50.5)));
    }

    #[test]
    fn bingx_missing_symbol_is_flat() {
        let body = r#"{"code":0,"msg":"","data":[]}"#;
        assert_eq!(bingx_position(body, "AAAUSDT").unwrap(), LivePosition::flat());
    }

    #[test]
    fn bingx_server_time() {
        let body = r#"{"code":0,"msg":"","data":{"serverTime":1700000000999}}"#;
        assert_eq!(super::bingx_server_time(body).unwrap(), 1_700_000_000_999);
    }

    #[test]
    fn bingx_error_code_surfaces_exchange() {
        let body = r#"{"code":80014,"msg":"invalid symbol","data":null}"#;
        let err = bingx_position(body, "AAAUSDT").unwrap_err();
        assert!(err.to_string().contains("BINGX"));
        assert!(!err.is_retryable());
    }
}
