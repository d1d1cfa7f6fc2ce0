use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use crate::domain::ExchangeId;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub clock: ClockConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    /// Per-exchange overrides keyed by exchange name (e.g. `bybit`)
    #[serde(default)]
    pub exchanges: HashMap<String, ExchangeSettings>,
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub dry_run: DryRunConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ClockConfig {
    /// Samples taken when establishing a fresh sync (lowest round-trip wins)
    #[serde(default = "default_initial_samples")]
    pub initial_samples: u32,
    /// Samples taken on periodic resync
    #[serde(default = "default_refresh_samples")]
    pub refresh_samples: u32,
    /// Resync interval in milliseconds
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
    /// Offsets above this are logged as warnings
    #[serde(default = "default_large_offset_warn_ms")]
    pub large_offset_warn_ms: i64,
    /// Offsets above this fault the exchange clock until a resync succeeds
    #[serde(default = "default_max_offset_ms")]
    pub max_offset_ms: i64,
    /// Offset change between consecutive syncs that is logged as drift
    #[serde(default = "default_drift_warn_ms")]
    pub drift_warn_ms: i64,
}

fn default_initial_samples() -> u32 {
    3
}

fn default_refresh_samples() -> u32 {
    1
}

fn default_refresh_interval_ms() -> u64 {
    60_000
}

fn default_large_offset_warn_ms() -> i64 {
    1_000
}

fn default_max_offset_ms() -> i64 {
    10_000
}

fn default_drift_warn_ms() -> i64 {
    250
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            initial_samples: default_initial_samples(),
            refresh_samples: default_refresh_samples(),
            refresh_interval_ms: default_refresh_interval_ms(),
            large_offset_warn_ms: default_large_offset_warn_ms(),
            max_offset_ms: default_max_offset_ms(),
            drift_warn_ms: default_drift_warn_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Actions closer than this to "now" are rejected at arm time
    #[serde(default = "default_min_lead_time_ms")]
    pub min_lead_time_ms: i64,
}

fn default_min_lead_time_ms() -> i64 {
    1_000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_lead_time_ms: default_min_lead_time_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    /// Default entry offset relative to the funding event (negative = before)
    #[serde(default = "default_entry_offset_ms")]
    pub entry_offset_ms: i64,
    /// Default exit offset relative to the funding event
    #[serde(default = "default_exit_offset_ms")]
    pub exit_offset_ms: i64,
    /// Taker fee per fill (0.00055 = 0.055%)
    #[serde(default = "default_taker_fee_rate")]
    pub taker_fee_rate: Decimal,
    /// Retries for requests that provably never reached the exchange
    #[serde(default = "default_max_submit_retries")]
    pub max_submit_retries: u8,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Close the filled leg when the other leg fails to enter
    #[serde(default = "default_true")]
    pub unwind_on_partial_entry: bool,
    /// Position size in quote currency used for P&L; primary notional if unset
    #[serde(default)]
    pub position_size_usd: Option<Decimal>,
    #[serde(default = "default_ticker_ttl_secs")]
    pub ticker_ttl_secs: u64,
    /// Resolved from `[exchanges.*]`; not read from config directly
    #[serde(skip)]
    pub fee_overrides: HashMap<ExchangeId, Decimal>,
}

fn default_entry_offset_ms() -> i64 {
    -500
}

fn default_exit_offset_ms() -> i64 {
    30_000
}

fn default_taker_fee_rate() -> Decimal {
    dec!(0.00055)
}

/// Submission retries back off exponentially; more than this is never useful
const MAX_SUBMIT_RETRIES: u8 = 10;

fn default_max_submit_retries() -> u8 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    50
}

fn default_ticker_ttl_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            entry_offset_ms: default_entry_offset_ms(),
            exit_offset_ms: default_exit_offset_ms(),
            taker_fee_rate: default_taker_fee_rate(),
            max_submit_retries: default_max_submit_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            unwind_on_partial_entry: true,
            position_size_usd: None,
            ticker_ttl_secs: default_ticker_ttl_secs(),
            fee_overrides: HashMap::new(),
        }
    }
}

impl ExecutionConfig {
    pub fn fee_rate(&self, exchange: ExchangeId) -> Decimal {
        self.fee_overrides
            .get(&exchange)
            .copied()
            .unwrap_or(self.taker_fee_rate)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconciliationConfig {
    /// Sweep interval in seconds (default: 30s)
    #[serde(default = "default_reconcile_interval_secs")]
    pub interval_secs: u64,
    /// Relative quantity difference still treated as matching (0.0001 = 0.01%)
    #[serde(default = "default_quantity_tolerance")]
    pub quantity_tolerance: Decimal,
    /// Keep healed positions in ERROR until an operator confirms
    #[serde(default)]
    pub heal_requires_confirmation: bool,
    /// Positions reconciled concurrently during a sweep
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

fn default_reconcile_interval_secs() -> u64 {
    30
}

fn default_quantity_tolerance() -> Decimal {
    dec!(0.0001)
}

fn default_max_concurrent() -> usize {
    8
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reconcile_interval_secs(),
            quantity_tolerance: default_quantity_tolerance(),
            heal_requires_confirmation: false,
            max_concurrent: default_max_concurrent(),
        }
    }
}

/// Per-exchange overrides
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExchangeSettings {
    #[serde(default)]
    pub taker_fee_rate: Option<Decimal>,
    #[serde(default)]
    pub refresh_interval_ms: Option<u64>,
    #[serde(default)]
    pub large_offset_warn_ms: Option<i64>,
    #[serde(default)]
    pub max_offset_ms: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct DryRunConfig {
    /// Run against in-memory paper exchanges
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Exchanges simulated in dry-run mode
    #[serde(default = "default_paper_exchanges")]
    pub exchanges: Vec<String>,
    /// Starting prices per canonical symbol
    #[serde(default)]
    pub prices: HashMap<String, Decimal>,
}

fn default_paper_exchanges() -> Vec<String> {
    vec!["bybit".to_string(), "bingx".to_string()]
}

impl Default for DryRunConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            exchanges: default_paper_exchanges(),
            prices: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for the daily rolling log file
    #[serde(default)]
    pub dir: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("HEDGESYNC_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (HEDGESYNC_EXECUTION__EXIT_OFFSET_MS, etc.)
            .add_source(
                Environment::with_prefix("HEDGESYNC")
                    .separator("__")
                    .try_parsing(true),
            );

        let mut config: AppConfig = builder.build()?.try_deserialize()?;
        config.resolve_overrides()?;
        Ok(config)
    }

    /// Fold `[exchanges.*]` fee overrides into the execution config
    fn resolve_overrides(&mut self) -> Result<(), ConfigError> {
        let mut fees = HashMap::new();
        for (name, settings) in &self.exchanges {
            let exchange = ExchangeId::from_str(name).map_err(ConfigError::Message)?;
            if let Some(rate) = settings.taker_fee_rate {
                fees.insert(exchange, rate);
            }
        }
        self.execution.fee_overrides = fees;
        Ok(())
    }

    /// Clock settings for one exchange, defaults merged with overrides
    pub fn clock_for(&self, exchange: ExchangeId) -> ClockConfig {
        let mut clock = self.clock;
        let overrides = self
            .exchanges
            .iter()
            .find(|(name, _)| ExchangeId::from_str(name).ok() == Some(exchange))
            .map(|(_, settings)| settings);

        if let Some(settings) = overrides {
            if let Some(interval) = settings.refresh_interval_ms {
                clock.refresh_interval_ms = interval;
            }
            if let Some(warn) = settings.large_offset_warn_ms {
                clock.large_offset_warn_ms = warn;
            }
            if let Some(max) = settings.max_offset_ms {
                clock.max_offset_ms = max;
            }
        }
        clock
    }

    /// Exchanges simulated in dry-run mode
    pub fn paper_exchanges(&self) -> Result<Vec<ExchangeId>, Vec<String>> {
        let mut exchanges = Vec::new();
        let mut errors = Vec::new();
        for name in &self.dry_run.exchanges {
            match ExchangeId::from_str(name) {
                Ok(exchange) => exchanges.push(exchange),
                Err(e) => errors.push(e),
            }
        }
        if errors.is_empty() {
            Ok(exchanges)
        } else {
            Err(errors)
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !(2..=5).contains(&self.clock.initial_samples) {
            errors.push("clock.initial_samples must be between 2 and 5".to_string());
        }
        if self.clock.refresh_samples == 0 {
            errors.push("clock.refresh_samples must be at least 1".to_string());
        }
        if self.clock.large_offset_warn_ms >= self.clock.max_offset_ms {
            errors.push("clock.large_offset_warn_ms must be below clock.max_offset_ms".to_string());
        }

        for exchange in ExchangeId::ALL {
            let clock = self.clock_for(exchange);
            if !(5_000..=300_000).contains(&clock.refresh_interval_ms) {
                errors.push(format!(
                    "{} refresh interval must be between 5s and 5min",
                    exchange
                ));
            }
            if clock.max_offset_ms <= 0 {
                errors.push(format!("{} max_offset_ms must be positive", exchange));
            }
        }

        for name in self.exchanges.keys() {
            if let Err(e) = ExchangeId::from_str(name) {
                errors.push(e);
            }
        }
        if let Err(mut names) = self.paper_exchanges() {
            errors.append(&mut names);
        }

        if self.scheduler.min_lead_time_ms < 0 {
            errors.push("scheduler.min_lead_time_ms must not be negative".to_string());
        }
        if self.execution.max_submit_retries > MAX_SUBMIT_RETRIES {
            errors.push(format!(
                "execution.max_submit_retries must be at most {}",
                MAX_SUBMIT_RETRIES
            ));
        }
        if self.execution.exit_offset_ms <= self.execution.entry_offset_ms {
            errors.push("execution.exit_offset_ms must be after entry_offset_ms".to_string());
        }
        if self.execution.taker_fee_rate < Decimal::ZERO || self.execution.taker_fee_rate >= dec!(0.01) {
            errors.push("execution.taker_fee_rate must be between 0 and 0.01".to_string());
        }
        if self.reconciliation.interval_secs == 0 {
            errors.push("reconciliation.interval_secs must be positive".to_string());
        }
        if self.reconciliation.max_concurrent == 0 {
            errors.push("reconciliation.max_concurrent must be positive".to_string());
        }
        if self.reconciliation.quantity_tolerance < Decimal::ZERO {
            errors.push("reconciliation.quantity_tolerance must not be negative".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
