//! Configuration loading: one JSON file per deployment, with environment
//! variables overlaid on top for secrets. Mirrors the teacher's
//! `Config::from_file` env-overlay pattern (load file, then let
//! `COINDCX_API_KEY`/`COINDCX_API_SECRET`-style variables win).

use crate::domain::TpMode;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("missing required environment variable: {0}")]
    MissingEnv(String),
}

/// Credentials for one exchange account. Populated from the config file and
/// then overlaid with environment variables so secrets need not live on
/// disk in plaintext deployments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeCredentials {
    pub exchange: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl ExchangeCredentials {
    /// Overlay `{EXCHANGE}_API_KEY` / `{EXCHANGE}_API_SECRET` environment
    /// variables on top of whatever the config file provided, the way the
    /// teacher overlays `COINDCX_API_KEY`/`COINDCX_API_SECRET`.
    fn apply_env_overlay(&mut self) {
        let prefix = self.exchange.to_uppercase();
        if let Ok(key) = std::env::var(format!("{prefix}_API_KEY")) {
            self.api_key = key;
        }
        if let Ok(secret) = std::env::var(format!("{prefix}_API_SECRET")) {
            self.api_secret = secret;
        }
    }
}

/// One DCA level's plan: gap from the pyramid's base entry price, the
/// fraction of the pyramid's capital it consumes, and its own TP percent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DcaLevel {
    pub gap_percent: Decimal,
    pub weight_percent: Decimal,
    pub tp_percent: Decimal,
}

/// Per-(user, exchange, symbol) persisted grid configuration. Corresponds to
/// `DCAGridConfig` in the external interface surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DcaGridConfig {
    pub entry_order_type: EntryOrderType,
    pub dca_levels: Vec<DcaLevel>,
    #[serde(default)]
    pub pyramid_specific_levels: HashMap<usize, Vec<DcaLevel>>,
    pub tp_mode: TpMode,
    #[serde(default)]
    pub tp_aggregate_percent: Option<Decimal>,
    #[serde(default)]
    pub pyramid_tp_percents: HashMap<usize, Decimal>,
    pub max_pyramids: u32,
    #[serde(default)]
    pub cancel_dca_beyond_percent: Option<Decimal>,
    pub total_capital_usd: Decimal,
    #[serde(default)]
    pub adjust_tp_to_actual_fill: bool,
    #[serde(default = "default_stale_threshold_hours")]
    pub stale_tp_threshold_hours: Decimal,
    #[serde(default)]
    pub stale_tp_action: StaleTpAction,
}

fn default_stale_threshold_hours() -> Decimal {
    Decimal::from(24)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryOrderType {
    Limit,
    Market,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StaleTpAction {
    #[default]
    Replace,
    MarketClose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerStartCondition {
    After5Pyramids,
    AfterAllDcaSubmitted,
    AfterAllDcaFilled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlippageAction {
    Warn,
    Reject,
}

/// Per-user risk policy, mirroring §4.4 of the specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskEngineConfig {
    pub evaluate_interval_seconds: u64,
    #[serde(default)]
    pub evaluate_on_fill: bool,
    pub max_positions_per_symbol_timeframe_exchange: u32,
    pub max_total_exposure_usd: Decimal,
    pub max_realized_loss_usd: Decimal,
    pub timer_start_condition: TimerStartCondition,
    pub post_full_wait_minutes: u64,
    #[serde(default)]
    pub reset_timer_on_replacement: bool,
    pub required_pyramids_for_timer: u32,
    pub loss_threshold_percent: Decimal,
    pub max_winners_to_combine: u32,
    #[serde(default)]
    pub slippage_action: Option<SlippageAction>,
    #[serde(default)]
    pub max_slippage_percent: Option<Decimal>,
}

impl Default for TimerStartCondition {
    fn default() -> Self {
        TimerStartCondition::AfterAllDcaSubmitted
    }
}

/// Top-level application configuration: exchange credentials plus sane
/// defaults for request pacing. Loaded once at binary start via
/// [`AppConfig::from_file`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub exchanges: Vec<ExchangeCredentials>,
    #[serde(default = "default_max_requests_per_second")]
    pub max_requests_per_second: usize,
    #[serde(default = "default_fill_monitor_interval")]
    pub fill_monitor_interval_seconds: u64,
    #[serde(default = "default_risk_engine_interval")]
    pub risk_engine_interval_seconds: u64,
    #[serde(default = "default_max_concurrent_users")]
    pub max_concurrent_users_per_cycle: usize,
    #[serde(default = "default_per_user_concurrency")]
    pub per_user_concurrency: usize,
    #[serde(default)]
    pub database_path: String,
    #[serde(default = "default_base_currency")]
    pub base_currency: String,
}

fn default_max_requests_per_second() -> usize {
    10
}

fn default_fill_monitor_interval() -> u64 {
    15
}

fn default_max_concurrent_users() -> usize {
    8
}

fn default_risk_engine_interval() -> u64 {
    60
}

fn default_per_user_concurrency() -> usize {
    4
}

fn default_base_currency() -> String {
    "USDT".to_string()
}

impl AppConfig {
    /// Load configuration from a JSON file, then overlay environment
    /// variables for each configured exchange's credentials. `.env` files
    /// are expected to have been loaded by the caller (see `main.rs`) before
    /// this runs, so `std::env::var` sees them.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_str = path_ref.display().to_string();
        let raw = std::fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_str.clone(),
            source,
        })?;
        let mut config: AppConfig =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path_str,
                source,
            })?;
        for creds in &mut config.exchanges {
            creds.apply_env_overlay();
        }
        Ok(config)
    }

    pub fn credentials_for(&self, exchange: &str) -> Option<&ExchangeCredentials> {
        self.exchanges.iter().find(|c| c.exchange.eq_ignore_ascii_case(exchange))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_and_applies_env_overlay() {
        std::env::set_var("BINANCE_API_KEY", "from-env-key");
        std::env::set_var("BINANCE_API_SECRET", "from-env-secret");

        let path = std::env::temp_dir().join(format!("dca-grid-engine-config-test-{:?}.json", std::thread::current().id()));
        {
            let mut file = std::fs::File::create(&path).unwrap();
            write!(
                file,
                r#"{{
                    "exchanges": [{{"exchange": "binance", "api_key": "file-key", "api_secret": "file-secret"}}],
                    "database_path": "dca.db"
                }}"#
            )
            .unwrap();
        }

        let config = AppConfig::from_file(&path).unwrap();
        let creds = config.credentials_for("binance").unwrap();
        assert_eq!(creds.api_key, "from-env-key");
        assert_eq!(creds.api_secret, "from-env-secret");

        std::env::remove_var("BINANCE_API_KEY");
        std::env::remove_var("BINANCE_API_SECRET");
        let _ = std::fs::remove_file(&path);
    }
}
