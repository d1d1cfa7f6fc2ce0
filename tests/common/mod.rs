#![allow(dead_code)]

use hedgesync::config::AppConfig;
use hedgesync::domain::{ExchangeId, LegPlan, PositionSide, TradePlan};
use hedgesync::exchange::{ConnectorRegistry, PaperExchange};
use hedgesync::service::HedgeService;
use hedgesync::store::MemoryStore;
use hedgesync::timing::{LocalClock, MonotonicClock};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

pub const SYMBOL: &str = "BTCUSDT";

pub struct Harness {
    pub service: HedgeService,
    pub bybit: Arc<PaperExchange>,
    pub bingx: Arc<PaperExchange>,
    pub local: Arc<dyn LocalClock>,
}

pub fn harness() -> Harness {
    harness_with(AppConfig::default())
}

/// BYBIT and BINGX paper venues quoting BTCUSDT and ETHUSDT at 100, in-memory store
pub fn harness_with(config: AppConfig) -> Harness {
    let local: Arc<dyn LocalClock> = Arc::new(MonotonicClock::anchored_at(1_700_000_000_000));
    let bybit = Arc::new(PaperExchange::new(ExchangeId::Bybit, Arc::clone(&local)));
    let bingx = Arc::new(PaperExchange::new(ExchangeId::Bingx, Arc::clone(&local)));
    for venue in [&bybit, &bingx] {
        venue.set_price("BTCUSDT", dec!(100));
        venue.set_price("ETHUSDT", dec!(100));
    }

    let connectors = ConnectorRegistry::new()
        .with(bybit.clone())
        .with(bingx.clone());
    let service = HedgeService::new(
        config,
        connectors,
        Arc::clone(&local),
        Arc::new(MemoryStore::new()),
    );

    Harness {
        service,
        bybit,
        bingx,
        local,
    }
}

impl Harness {
    /// BYBIT SHORT / BINGX LONG hedge with a funding event `in_ms` from now
    pub fn plan(&self, symbol: &str, in_ms: i64) -> TradePlan {
        self.plan_sized(symbol, in_ms, dec!(0.5))
    }

    pub fn plan_sized(&self, symbol: &str, in_ms: i64, quantity: Decimal) -> TradePlan {
        let funding = self.local.now_ms() + in_ms;
        self.service.plan(
            symbol,
            LegPlan {
                exchange: ExchangeId::Bybit,
                side: PositionSide::Short,
                quantity,
            },
            LegPlan {
                exchange: ExchangeId::Bingx,
                side: PositionSide::Long,
                quantity,
            },
            funding,
        )
    }
}
