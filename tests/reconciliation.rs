mod common;

use common::{harness, harness_with, Harness, SYMBOL};
use hedgesync::config::AppConfig;
use hedgesync::domain::{
    ExchangeId, ExecutionPhase, FaultKind, LegRole, LivePosition, PositionId, PositionSide,
    PositionStatus,
};
use hedgesync::error::HedgeError;
use hedgesync::exchange::{PaperCall, PaperFailure};
use hedgesync::reconciliation::{HealOutcome, ReconcileAction};
use hedgesync::service::{ReconcileTarget, ReconciliationReport};
use rust_decimal_macros::dec;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_test::{assert_err, assert_ok};

/// Open a hedge on `symbol` and wait until both legs are in
async fn active_position(h: &Harness, symbol: &str) -> PositionId {
    let id = h.service.open(h.plan(symbol, 5_000)).await.unwrap();
    sleep(Duration::from_secs(5)).await;
    assert_eq!(h.service.position(id).await.unwrap().status, PositionStatus::Active);
    id
}

async fn reconcile_one(h: &Harness, id: PositionId) -> hedgesync::reconciliation::ReconcileReport {
    match h
        .service
        .trigger_reconciliation(ReconcileTarget::Position(id))
        .await
        .unwrap()
    {
        ReconciliationReport::Position(report) => report,
        ReconciliationReport::Sweep(_) => panic!("expected a single-position report"),
    }
}

#[tokio::test(start_paused = true)]
async fn completed_position_reconciles_to_no_op() {
    let h = harness();
    let id = active_position(&h, SYMBOL).await;
    sleep(Duration::from_secs(31)).await;
    let before = h.service.position(id).await.unwrap();
    assert_eq!(before.status, PositionStatus::Completed);

    for _ in 0..2 {
        let report = reconcile_one(&h, id).await;
        assert_eq!(report.action, ReconcileAction::NoOp);
        assert!(!report.updated);
        assert_eq!(report.status, PositionStatus::Completed);
    }
    assert_eq!(h.service.position(id).await.unwrap(), before);
}

#[tokio::test(start_paused = true)]
async fn both_legs_closed_externally_completes_the_position() {
    let h = harness();
    let id = active_position(&h, SYMBOL).await;
    h.bybit.force_flat(SYMBOL);
    h.bingx.force_flat(SYMBOL);

    let report = reconcile_one(&h, id).await;
    assert_eq!(report.action, ReconcileAction::MarkCompleted);
    assert_eq!(report.previous_status, PositionStatus::Active);
    assert_eq!(report.status, PositionStatus::Completed);
    assert_eq!(
        report.message.as_deref(),
        Some("synced: both legs already closed")
    );

    let position = h.service.position(id).await.unwrap();
    assert_eq!(position.phase, ExecutionPhase::Exited);
    assert!(position.completed_at.is_some());

    let again = reconcile_one(&h, id).await;
    assert_eq!(again.action, ReconcileAction::NoOp);
    assert!(!again.updated);
}

#[tokio::test(start_paused = true)]
async fn missing_leg_is_flagged_once() {
    let h = harness();
    let id = active_position(&h, SYMBOL).await;
    h.bingx.force_flat(SYMBOL);

    let report = reconcile_one(&h, id).await;
    assert_eq!(report.action, ReconcileAction::FlagForManualReview);
    assert!(report.updated);
    assert_eq!(report.status, PositionStatus::Error);
    let message = report.message.unwrap();
    assert!(message.contains("UNHEDGED_DRIFT"), "{}", message);
    assert!(message.contains("BINGX"), "{}", message);

    let position = h.service.position(id).await.unwrap();
    assert_eq!(position.phase, ExecutionPhase::Error);
    let fault = position.fault.unwrap();
    assert_eq!(fault.kind, FaultKind::UnhedgedDrift);
    assert_eq!(fault.legs[0].role, LegRole::Hedge);
    assert_eq!(fault.legs[0].exchange, ExchangeId::Bingx);

    // Same drift again: no duplicate write
    let again = reconcile_one(&h, id).await;
    assert_eq!(again.action, ReconcileAction::FlagForManualReview);
    assert!(!again.updated);
    assert_eq!(again.status, PositionStatus::Error);
}

#[tokio::test(start_paused = true)]
async fn resized_leg_is_flagged_as_mismatch() {
    let h = harness();
    let id = active_position(&h, SYMBOL).await;
    h.bingx.set_position(
        SYMBOL,
        LivePosition {
            side: Some(PositionSide::Long),
            quantity: dec!(0.3),
            entry_price: Some(dec!(100)),
            mark_price: Some(dec!(100)),
        },
    );

    let report = reconcile_one(&h, id).await;
    assert_eq!(report.action, ReconcileAction::FlagForManualReview);
    let fault = h.service.position(id).await.unwrap().fault.unwrap();
    assert_eq!(fault.kind, FaultKind::LegMismatch);
    assert!(fault.detail.contains("0.3"));
}

#[tokio::test(start_paused = true)]
async fn query_failure_leaves_the_record_untouched() {
    let h = harness();
    let id = active_position(&h, SYMBOL).await;
    let before = h.service.position(id).await.unwrap();

    h.bybit.fail_next(PaperCall::Position, PaperFailure::Network);
    let err = h
        .service
        .trigger_reconciliation(ReconcileTarget::Position(id))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        HedgeError::ReconciliationQuery {
            exchange: ExchangeId::Bybit,
            ..
        }
    ));
    assert_eq!(h.service.position(id).await.unwrap(), before);
}

#[tokio::test(start_paused = true)]
async fn sweep_counts_each_outcome() {
    let h = harness();
    let flat = active_position(&h, SYMBOL).await;
    let intact = active_position(&h, "ETHUSDT").await;
    h.bybit.force_flat(SYMBOL);
    h.bingx.force_flat(SYMBOL);

    let report = match assert_ok!(h.service.trigger_reconciliation(ReconcileTarget::All).await) {
        ReconciliationReport::Sweep(report) => report,
        ReconciliationReport::Position(_) => panic!("expected a sweep report"),
    };
    assert_eq!(report.checked, 2);
    assert_eq!(report.completed, 1);
    assert_eq!(report.unchanged, 1);
    assert_eq!(report.flagged, 0);
    assert!(report.failures.is_empty());

    assert_eq!(
        h.service.position(flat).await.unwrap().status,
        PositionStatus::Completed
    );
    assert_eq!(
        h.service.position(intact).await.unwrap().status,
        PositionStatus::Active
    );
}

#[tokio::test(start_paused = true)]
async fn sweep_collects_query_failures_per_position() {
    let h = harness();
    let id = active_position(&h, SYMBOL).await;
    h.bingx.fail_next(PaperCall::Position, PaperFailure::RateLimited);

    let report = match h.service.trigger_reconciliation(ReconcileTarget::All).await.unwrap() {
        ReconciliationReport::Sweep(report) => report,
        ReconciliationReport::Position(_) => panic!("expected a sweep report"),
    };
    assert_eq!(report.checked, 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].position_id, id);
    assert!(report.failures[0].error.contains("BINGX"));
}

/// Active hedge with TP/SL whose BINGX leg was resized to 0.3 and flagged
async fn resized_error_position(h: &Harness) -> PositionId {
    let mut plan = h.plan(SYMBOL, 5_000);
    plan.take_profit_percent = Some(dec!(2));
    plan.stop_loss_percent = Some(dec!(1));
    let id = h.service.open(plan).await.unwrap();
    sleep(Duration::from_secs(5)).await;

    h.bingx.set_position(
        SYMBOL,
        LivePosition {
            side: Some(PositionSide::Long),
            quantity: dec!(0.3),
            entry_price: Some(dec!(100)),
            mark_price: Some(dec!(100)),
        },
    );
    reconcile_one(h, id).await;
    assert_eq!(h.service.position(id).await.unwrap().status, PositionStatus::Error);
    id
}

#[tokio::test(start_paused = true)]
async fn heal_reprotects_and_restores_both_legs() {
    let h = harness();
    let id = resized_error_position(&h).await;

    let report = h.service.heal(id).await.unwrap();
    assert_eq!(report.outcome, HealOutcome::Restored);
    assert_eq!(report.status, PositionStatus::Active);
    assert!(report.legs.iter().all(|l| l.protected));

    let hedge = report.legs.iter().find(|l| l.role == LegRole::Hedge).unwrap();
    assert_eq!(hedge.quantity, dec!(0.3));
    assert_eq!(hedge.take_profit, Some(dec!(102)));
    assert_eq!(hedge.stop_loss, Some(dec!(99)));
    let orders = h.bingx.protective_orders(SYMBOL).unwrap();
    assert_eq!(orders.quantity, dec!(0.3));
    assert_eq!(orders.take_profit, Some(dec!(102)));

    let primary = report.legs.iter().find(|l| l.role == LegRole::Primary).unwrap();
    assert_eq!(primary.take_profit, Some(dec!(98)));
    assert_eq!(primary.stop_loss, Some(dec!(101)));

    let position = h.service.position(id).await.unwrap();
    assert_eq!(position.phase, ExecutionPhase::Entered);
    assert_eq!(position.hedge.quantity, dec!(0.3));
    assert!(position.fault.is_none());
    assert!(position.error_message.unwrap().starts_with("healed:"));

    // Record now agrees with the venues
    let report = reconcile_one(&h, id).await;
    assert_eq!(report.action, ReconcileAction::NoOp);
}

#[tokio::test(start_paused = true)]
async fn heal_waits_for_operator_confirmation_when_configured() {
    let mut config = AppConfig::default();
    config.reconciliation.heal_requires_confirmation = true;
    let h = harness_with(config);
    let id = resized_error_position(&h).await;

    let report = h.service.heal(id).await.unwrap();
    assert_eq!(report.outcome, HealOutcome::AwaitingConfirmation);
    assert_eq!(report.status, PositionStatus::Error);
    let position = h.service.position(id).await.unwrap();
    assert_eq!(
        position.fault.map(|f| f.kind),
        Some(FaultKind::HealPendingConfirmation)
    );
    assert!(position.error_message.unwrap().contains("awaiting operator confirmation"));

    let confirmed = h.service.confirm_heal(id).await.unwrap();
    assert_eq!(confirmed.outcome, HealOutcome::Restored);
    assert_eq!(confirmed.status, PositionStatus::Active);

    let err = h.service.confirm_heal(id).await.unwrap_err();
    assert!(matches!(err, HedgeError::Validation(_)));
}

#[tokio::test(start_paused = true)]
async fn confirm_heal_rejects_legs_that_changed() {
    let mut config = AppConfig::default();
    config.reconciliation.heal_requires_confirmation = true;
    let h = harness_with(config);
    let id = resized_error_position(&h).await;
    h.service.heal(id).await.unwrap();

    h.bingx.force_flat(SYMBOL);
    let err = h.service.confirm_heal(id).await.unwrap_err();
    assert!(matches!(err, HedgeError::Validation(_)));
    assert_eq!(h.service.position(id).await.unwrap().status, PositionStatus::Error);
}

#[tokio::test(start_paused = true)]
async fn heal_with_one_leg_protects_it_but_stays_in_error() {
    let h = harness();
    let mut plan = h.plan(SYMBOL, 5_000);
    plan.stop_loss_percent = Some(dec!(1));
    let id = h.service.open(plan).await.unwrap();
    sleep(Duration::from_secs(5)).await;
    h.bingx.force_flat(SYMBOL);
    reconcile_one(&h, id).await;

    let report = h.service.heal(id).await.unwrap();
    assert_eq!(report.outcome, HealOutcome::Partial);
    assert_eq!(report.status, PositionStatus::Error);
    let message = report.message.unwrap();
    assert!(message.contains("HEAL_FAILED"), "{}", message);
    assert!(message.contains("BINGX"), "{}", message);

    let primary = h.bybit.protective_orders(SYMBOL).unwrap();
    assert_eq!(primary.stop_loss, Some(dec!(101)));
    assert_eq!(primary.take_profit, None);
}

#[tokio::test(start_paused = true)]
async fn heal_reports_failed_protection() {
    let h = harness();
    let id = resized_error_position(&h).await;
    h.bybit.fail_next(PaperCall::Protective, PaperFailure::Rejected);

    let report = h.service.heal(id).await.unwrap();
    assert_eq!(report.outcome, HealOutcome::Partial);
    let primary = report.legs.iter().find(|l| l.role == LegRole::Primary).unwrap();
    assert!(!primary.protected);
    assert!(primary.error.is_some());
    assert!(report.message.unwrap().contains("BYBIT"));
}

#[tokio::test(start_paused = true)]
async fn heal_completes_when_both_legs_are_flat() {
    let h = harness();
    let id = active_position(&h, SYMBOL).await;
    h.bybit.force_flat(SYMBOL);
    h.bingx.force_flat(SYMBOL);

    let report = h.service.heal(id).await.unwrap();
    assert_eq!(report.outcome, HealOutcome::Completed);
    assert_eq!(report.status, PositionStatus::Completed);

    let err = h.service.heal(id).await.unwrap_err();
    assert!(matches!(err, HedgeError::Validation(_)));
}

#[tokio::test(start_paused = true)]
async fn reconcile_defers_while_exit_legs_are_staggered() {
    let h = harness();
    // BINGX runs 3s behind, so its exit fires 3s after BYBIT's
    h.bingx.set_clock_skew_ms(-3_000);
    let reports = h.service.sync_clocks().await;
    assert!(reports.iter().all(|r| r.error.is_none()));

    let start = Instant::now();
    let id = h.service.open(h.plan(SYMBOL, 10_000)).await.unwrap();

    sleep_until(start + Duration::from_secs(41)).await;
    let between = h.service.position(id).await.unwrap();
    assert_eq!(between.status, PositionStatus::Active);
    assert_eq!(between.phase, ExecutionPhase::PendingExit);
    assert!(!h.bybit.position(SYMBOL).is_open());
    assert!(h.bingx.position(SYMBOL).is_open());

    let report = reconcile_one(&h, id).await;
    assert_eq!(report.action, ReconcileAction::NoOp);
    assert!(!report.updated);
    let sweep = h.service.reconciler().sweep().await.unwrap();
    assert_eq!(sweep.flagged, 0);
    assert_err!(h.service.heal(id).await);
    assert_eq!(h.service.position(id).await.unwrap(), between);

    sleep_until(start + Duration::from_secs(44)).await;
    let done = h.service.position(id).await.unwrap();
    assert_eq!(done.phase, ExecutionPhase::Exited);
    assert_eq!(done.status, PositionStatus::Completed);
    assert!(!h.bingx.position(SYMBOL).is_open());

    // Settled positions reconcile normally again
    assert_eq!(reconcile_one(&h, id).await.status, PositionStatus::Completed);
}
