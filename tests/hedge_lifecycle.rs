mod common;

use common::{harness, harness_with, SYMBOL};
use hedgesync::config::AppConfig;
use hedgesync::coordination::{GracefulShutdown, ShutdownSignal};
use hedgesync::domain::{ExchangeId, ExecutionPhase, FaultKind, PositionStatus};
use hedgesync::exchange::{PaperCall, PaperFailure};
use hedgesync::timing::LocalClock;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_test::{assert_err, assert_ok};

#[tokio::test(start_paused = true)]
async fn both_legs_fill_then_exit_with_pnl() {
    let h = harness();
    let id = assert_ok!(h.service.open(h.plan(SYMBOL, 5_000)).await);

    sleep(Duration::from_secs(5)).await;
    let entered = h.service.position(id).await.unwrap();
    assert_eq!(entered.phase, ExecutionPhase::Entered);
    assert_eq!(entered.status, PositionStatus::Active);
    assert_eq!(entered.primary.entry_price, Some(dec!(100)));
    assert_eq!(entered.hedge.entry_price, Some(dec!(100)));
    assert!(entered.opened_at.is_some());

    h.bybit.set_price(SYMBOL, dec!(98));
    h.bingx.set_price(SYMBOL, dec!(101));
    sleep(Duration::from_secs(31)).await;

    let done = h.service.position(id).await.unwrap();
    assert_eq!(done.phase, ExecutionPhase::Exited);
    assert_eq!(done.status, PositionStatus::Completed);
    assert!(done.fault.is_none());
    let pnl = done.pnl.unwrap();
    // short +2%, long +1%
    assert_eq!(pnl.gross_return, dec!(0.03));
    assert!(pnl.net_return < pnl.gross_return);
    assert!(!h.bybit.position(SYMBOL).is_open());
    assert!(!h.bingx.position(SYMBOL).is_open());
}

#[tokio::test(start_paused = true)]
async fn network_failure_on_hedge_leg_names_the_exchange() {
    let h = harness();
    h.bingx.fail_next(PaperCall::PlaceOrder, PaperFailure::Network);
    let id = h.service.open(h.plan(SYMBOL, 5_000)).await.unwrap();

    sleep(Duration::from_secs(6)).await;
    let position = h.service.position(id).await.unwrap();
    assert_eq!(position.status, PositionStatus::Error);
    assert_eq!(position.phase, ExecutionPhase::Error);
    assert_eq!(position.fault.as_ref().map(|f| f.kind), Some(FaultKind::LegExecution));
    let message = position.error_message.unwrap();
    assert!(message.contains("BINGX"), "{}", message);

    // Filled BYBIT leg unwound, exits never armed again
    assert_eq!(position.primary.entry_price, Some(dec!(100)));
    assert!(!h.bybit.position(SYMBOL).is_open());
    assert_eq!(h.bybit.positions_closed(), 1);
    assert_eq!(h.service.scheduler().armed_count(id), 0);
    assert_eq!(h.bingx.orders_placed(), 0);
}

#[tokio::test(start_paused = true)]
async fn partial_entry_without_unwind_stays_one_legged() {
    let mut config = AppConfig::default();
    config.execution.unwind_on_partial_entry = false;
    let h = harness_with(config);
    h.bingx.fail_next(PaperCall::PlaceOrder, PaperFailure::Rejected);
    let id = h.service.open(h.plan(SYMBOL, 5_000)).await.unwrap();

    sleep(Duration::from_secs(40)).await;
    let position = h.service.position(id).await.unwrap();
    assert_eq!(position.status, PositionStatus::Error);
    assert!(h.bybit.position(SYMBOL).is_open());
    assert_eq!(h.bybit.positions_closed(), 0);
}

#[tokio::test(start_paused = true)]
async fn exit_stays_anchored_to_funding_when_entry_fills_late() {
    let h = harness();
    h.bingx.set_order_latency_ms(1_500);
    let start = Instant::now();
    let id = h.service.open(h.plan(SYMBOL, 5_000)).await.unwrap();

    // Entry fires at +4.5s; BINGX confirms 1.5s later
    sleep_until(start + Duration::from_millis(4_600)).await;
    assert!(h.bybit.position(SYMBOL).is_open());
    assert!(!h.bingx.position(SYMBOL).is_open());
    assert_eq!(h.service.position(id).await.unwrap().status, PositionStatus::Pending);

    sleep_until(start + Duration::from_millis(6_100)).await;
    assert_eq!(h.service.position(id).await.unwrap().status, PositionStatus::Active);

    // Exit is due at funding + 30s = +35s regardless of the late fill
    sleep_until(start + Duration::from_millis(34_900)).await;
    assert!(h.bybit.position(SYMBOL).is_open());

    sleep_until(start + Duration::from_millis(35_100)).await;
    assert!(!h.bybit.position(SYMBOL).is_open());
    assert!(h.bingx.position(SYMBOL).is_open());
    assert_eq!(
        h.service.position(id).await.unwrap().phase,
        ExecutionPhase::PendingExit
    );

    sleep_until(start + Duration::from_millis(36_700)).await;
    let done = h.service.position(id).await.unwrap();
    assert!(!h.bingx.position(SYMBOL).is_open());
    assert_eq!(done.status, PositionStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn entry_fires_on_exchange_time_under_skew() {
    let h = harness();
    h.bybit.set_clock_skew_ms(2_000);
    h.bingx.set_clock_skew_ms(2_000);
    let reports = h.service.sync_clocks().await;
    assert!(reports.iter().all(|r| r.error.is_none()));
    assert_eq!(h.service.clock().offset(ExchangeId::Bybit).unwrap().offset_ms, 2_000);

    // Funding 5s ahead in exchange time is only 3s ahead locally
    let start = Instant::now();
    let mut plan = h.plan(SYMBOL, 0);
    plan.funding_time_ms = h.local.now_ms() + 2_000 + 5_000;
    let id = h.service.open(plan).await.unwrap();

    sleep_until(start + Duration::from_millis(4_400)).await;
    assert!(!h.bybit.position(SYMBOL).is_open());
    sleep_until(start + Duration::from_millis(4_600)).await;
    assert_eq!(h.service.position(id).await.unwrap().status, PositionStatus::Active);
}

#[tokio::test(start_paused = true)]
async fn open_rejects_entry_inside_minimum_lead_time() {
    let h = harness();
    let err = assert_err!(h.service.open(h.plan(SYMBOL, 800)).await);
    assert_eq!(err.exchange(), Some(ExchangeId::Bybit));

    sleep(Duration::from_secs(40)).await;
    assert_eq!(h.bybit.orders_placed(), 0);
    assert_eq!(h.bingx.orders_placed(), 0);
}

#[tokio::test(start_paused = true)]
async fn stop_before_entry_prevents_every_action() {
    let h = harness();
    let id = h.service.open(h.plan(SYMBOL, 5_000)).await.unwrap();

    let report = h.service.stop(id).await.unwrap();
    assert_eq!(report.cancelled.prevented_count(), 4);
    assert_eq!(report.phase, ExecutionPhase::Stopped);
    assert_eq!(report.status, PositionStatus::Completed);

    sleep(Duration::from_secs(40)).await;
    assert_eq!(h.bybit.orders_placed(), 0);
    assert_eq!(h.bingx.orders_placed(), 0);

    // Second stop is a no-op
    let again = h.service.stop(id).await.unwrap();
    assert_eq!(again.cancelled.prevented_count(), 0);
    assert_eq!(again.status, PositionStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn stop_reports_the_leg_that_failed_to_close() {
    let h = harness();
    let id = h.service.open(h.plan(SYMBOL, 5_000)).await.unwrap();
    sleep(Duration::from_secs(5)).await;

    h.bingx.fail_next(PaperCall::ClosePosition, PaperFailure::Rejected);
    let report = h.service.stop(id).await.unwrap();
    assert_eq!(report.status, PositionStatus::Error);
    let failed: Vec<_> = report.legs.iter().filter(|l| !l.closed).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].exchange, ExchangeId::Bingx);
    assert!(report.message.unwrap().contains("BINGX"));

    assert!(!h.bybit.position(SYMBOL).is_open());
    assert!(h.bingx.position(SYMBOL).is_open());
}

#[tokio::test(start_paused = true)]
async fn emergency_shutdown_flattens_active_positions() {
    let h = harness();
    let id = h.service.open(h.plan(SYMBOL, 5_000)).await.unwrap();
    sleep(Duration::from_secs(5)).await;
    assert_eq!(h.service.position(id).await.unwrap().status, PositionStatus::Active);

    let shutdown = GracefulShutdown::new();
    let listener = shutdown.listener();
    let (result, _) = tokio::join!(h.service.run(listener), async {
        sleep(Duration::from_secs(1)).await;
        shutdown.request_shutdown(ShutdownSignal::Emergency);
    });
    assert_ok!(result);

    let stopped = h.service.position(id).await.unwrap();
    assert_eq!(stopped.phase, ExecutionPhase::Stopped);
    assert_eq!(stopped.status, PositionStatus::Completed);
    assert!(!h.bybit.position(SYMBOL).is_open());
    assert!(!h.bingx.position(SYMBOL).is_open());
    assert_eq!(h.service.scheduler().armed_count(id), 0);
}

#[tokio::test(start_paused = true)]
async fn graceful_shutdown_leaves_positions_alone() {
    let h = harness();
    let id = h.service.open(h.plan(SYMBOL, 5_000)).await.unwrap();

    let shutdown = GracefulShutdown::new();
    let listener = shutdown.listener();
    let (result, _) = tokio::join!(h.service.run(listener), async {
        sleep(Duration::from_secs(1)).await;
        shutdown.request_shutdown(ShutdownSignal::Graceful);
    });
    assert_ok!(result);

    let position = h.service.position(id).await.unwrap();
    assert_eq!(position.status, PositionStatus::Pending);
    assert_eq!(h.service.scheduler().armed_count(id), 4);
}

#[tokio::test(start_paused = true)]
async fn await_settled_returns_the_final_record() {
    let h = harness();
    let id = h.service.open(h.plan(SYMBOL, 5_000)).await.unwrap();

    let settled = h
        .service
        .await_settled(id, Duration::from_millis(500))
        .await
        .unwrap();
    assert_eq!(settled.status, PositionStatus::Completed);
    assert_eq!(settled.pnl.map(|p| p.gross_return), Some(Decimal::ZERO));
}
