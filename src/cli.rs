use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::coordination::{GracefulShutdown, ShutdownSignal};
use crate::domain::{ExchangeId, LegPlan, PositionId, PositionSide};
use crate::error::{HedgeError, Result};
use crate::service::{HedgeService, ReconcileTarget};

#[derive(Parser)]
#[command(name = "hedgesync")]
#[command(version = "0.1.0")]
#[command(about = "Clock-synchronized two-leg hedge execution and reconciliation", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration directory (default.toml plus $HEDGESYNC_ENV.toml)
    #[arg(short, long, default_value = "config", env = "HEDGESYNC_CONFIG_DIR")]
    pub config: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run clock refresh and periodic reconciliation until Ctrl-C
    Run {
        /// Treat Ctrl-C as an emergency: cancel all actions and close every open leg
        #[arg(long)]
        flatten: bool,
    },
    /// Schedule a hedge around a funding event
    Open(OpenArgs),
    /// Reconcile one position, or sweep all ACTIVE/ERROR positions
    Reconcile {
        /// Position to reconcile; omit for a full sweep
        #[arg(short, long)]
        position: Option<PositionId>,
    },
    /// Re-protect the live legs of a position and restore it if both are open
    Heal {
        position: PositionId,
    },
    /// Confirm a heal that is awaiting operator confirmation
    ConfirmHeal {
        position: PositionId,
    },
    /// Cancel pending actions and close any open leg of a position
    Stop {
        position: PositionId,
    },
    /// Measure the clock offset of every configured exchange
    Clock,
}

#[derive(Args, Debug)]
pub struct OpenArgs {
    /// Canonical symbol (e.g. BTCUSDT)
    #[arg(short, long)]
    pub symbol: String,
    /// Exchange of the primary leg
    #[arg(long)]
    pub primary: ExchangeId,
    /// Side of the primary leg; the hedge takes the opposite side
    #[arg(long)]
    pub side: PositionSide,
    /// Exchange of the hedge leg
    #[arg(long)]
    pub hedge: ExchangeId,
    /// Quantity of each leg
    #[arg(short, long)]
    pub quantity: Decimal,
    /// Hedge leg quantity when it differs from the primary
    #[arg(long)]
    pub hedge_quantity: Option<Decimal>,
    /// Funding event, epoch milliseconds in exchange time
    #[arg(long, required_unless_present = "funding_in_secs", conflicts_with = "funding_in_secs")]
    pub funding_time_ms: Option<i64>,
    /// Funding event relative to the primary exchange's current time
    #[arg(long)]
    pub funding_in_secs: Option<u64>,
    /// Entry offset from the funding event (default from config)
    #[arg(long, allow_hyphen_values = true)]
    pub entry_offset_ms: Option<i64>,
    /// Exit offset from the funding event (default from config)
    #[arg(long, allow_hyphen_values = true)]
    pub exit_offset_ms: Option<i64>,
    /// Take-profit percent applied to each leg (e.g. 1.5)
    #[arg(long)]
    pub take_profit: Option<Decimal>,
    /// Stop-loss percent applied to each leg (e.g. 0.8)
    #[arg(long)]
    pub stop_loss: Option<Decimal>,
    /// Stay attached until the position settles; Ctrl-C stops it
    #[arg(short, long)]
    pub wait: bool,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn run_service(service: &HedgeService, flatten: bool) -> Result<()> {
    let shutdown = Arc::new(GracefulShutdown::new());
    let listener = shutdown.listener();

    let trigger = Arc::clone(&shutdown);
    tokio::spawn(async move {
        if !flatten {
            trigger.listen_for_ctrl_c().await;
            return;
        }
        match tokio::signal::ctrl_c().await {
            Ok(()) => trigger.request_shutdown(ShutdownSignal::Emergency),
            Err(e) => warn!("Failed to listen for ctrl-c: {}", e),
        }
    });

    service.run(listener).await
}

pub async fn open_position(service: &HedgeService, args: &OpenArgs) -> Result<()> {
    let funding_time_ms = match (args.funding_time_ms, args.funding_in_secs) {
        (Some(ms), _) => ms,
        (None, Some(secs)) => {
            service.clock().sync(args.primary).await?;
            service.clock().now(args.primary)?.ms + (secs as i64) * 1_000
        }
        (None, None) => {
            return Err(HedgeError::Validation(
                "either --funding-time-ms or --funding-in-secs is required".to_string(),
            ))
        }
    };

    let primary = LegPlan {
        exchange: args.primary,
        side: args.side,
        quantity: args.quantity,
    };
    let hedge = LegPlan {
        exchange: args.hedge,
        side: args.side.opposite(),
        quantity: args.hedge_quantity.unwrap_or(args.quantity),
    };

    let mut plan = service.plan(&args.symbol, primary, hedge, funding_time_ms);
    if let Some(offset) = args.entry_offset_ms {
        plan.entry_offset_ms = offset;
    }
    if let Some(offset) = args.exit_offset_ms {
        plan.exit_offset_ms = offset;
    }
    plan.take_profit_percent = args.take_profit;
    plan.stop_loss_percent = args.stop_loss;

    let id = service.open(plan.clone()).await?;
    print_json(&json!({
        "position_id": id,
        "symbol": plan.symbol,
        "entry_time_ms": plan.entry_time_ms(),
        "exit_time_ms": plan.exit_time_ms(),
    }))?;

    if !args.wait {
        return Ok(());
    }

    info!(position_id = %id, "waiting for position to settle (Ctrl-C stops it)");
    tokio::select! {
        settled = service.await_settled(id, Duration::from_millis(500)) => print_json(&settled?),
        _ = tokio::signal::ctrl_c() => print_json(&service.stop(id).await?),
    }
}

pub async fn reconcile(service: &HedgeService, position: Option<PositionId>) -> Result<()> {
    let target = position
        .map(ReconcileTarget::Position)
        .unwrap_or(ReconcileTarget::All);
    print_json(&service.trigger_reconciliation(target).await?)
}

pub async fn heal(service: &HedgeService, position: PositionId) -> Result<()> {
    print_json(&service.heal(position).await?)
}

pub async fn confirm_heal(service: &HedgeService, position: PositionId) -> Result<()> {
    print_json(&service.confirm_heal(position).await?)
}

pub async fn stop(service: &HedgeService, position: PositionId) -> Result<()> {
    print_json(&service.stop(position).await?)
}

pub async fn show_clocks(service: &HedgeService) -> Result<()> {
    print_json(&service.sync_clocks().await)
}
