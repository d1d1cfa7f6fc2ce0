use anyhow::Context;
use clap::Parser;
use hedgesync::cli::{self, Cli, Commands};
use hedgesync::config::AppConfig;
use hedgesync::service::HedgeService;

mod main_runtime;

use main_runtime::{init_logging, init_logging_simple};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config))?;

    match &cli.command {
        Commands::Run { .. } | Commands::Open(_) => init_logging(&config.logging),
        _ => init_logging_simple(),
    }

    let service = HedgeService::from_config(config)
        .await
        .context("starting hedge service")?;

    match &cli.command {
        Commands::Run { flatten } => cli::run_service(&service, *flatten).await?,
        Commands::Open(args) => cli::open_position(&service, args).await?,
        Commands::Reconcile { position } => cli::reconcile(&service, *position).await?,
        Commands::Heal { position } => cli::heal(&service, *position).await?,
        Commands::ConfirmHeal { position } => cli::confirm_heal(&service, *position).await?,
        Commands::Stop { position } => cli::stop(&service, *position).await?,
        Commands::Clock => cli::show_clocks(&service).await?,
    }

    Ok(())
}
