//! Admin CLI + composition root (spec §6 "CLI / admin surface").
//!
//! Grounded in the teacher's `main.rs` + `commands/live.rs`: a `clap` derive
//! subcommand tree over a single composition root that wires repositories,
//! exchange connectors, the two background loops, and a ctrl-c-driven
//! shutdown channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use uuid::Uuid;

use dca_grid_engine::broadcaster::{Broadcaster, TracingBroadcaster};
use dca_grid_engine::config::AppConfig;
use dca_grid_engine::exchange::binance::BinanceConnector;
use dca_grid_engine::exchange::coindcx::CoinDcxConnector;
use dca_grid_engine::exchange::ExchangeConnector;
use dca_grid_engine::fill_monitor::{ExchangeServices, FillMonitor};
use dca_grid_engine::oms::group_lock::GroupLocks;
use dca_grid_engine::oms::order_service::OrderService;
use dca_grid_engine::oms::position_manager::PositionManager;
use dca_grid_engine::repository::sqlite::SqliteStore;
use dca_grid_engine::repository::{
    DcaOrderRepository, PositionRepository, PyramidRepository, QueuedSignalRepository,
    Repositories, RiskActionRepository, UserConfigRepository,
};
use dca_grid_engine::risk_engine::{RiskEngine, RiskExchangeServices};
use dca_grid_engine::types::ExchangeId;

#[derive(Parser, Debug)]
#[command(name = "dca-grid-engine", about = "Multi-user DCA/grid crypto trading engine")]
pub struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, default_value = "config.json")]
    pub config: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the fill monitor and risk engine loops until interrupted.
    Serve,
    /// Manually force-stop a user's engine (pre-trade gate only; monitoring continues).
    PauseEngine { user_id: Uuid },
    /// Clear a user's manual/automatic pause flags.
    ResumeEngine { user_id: Uuid },
    /// Force-close a position group at market, bypassing its configured exit policy.
    ForceClose { group_id: Uuid },
    /// Reconcile a user's active positions' unrealized PnL against a fresh exchange snapshot.
    Sync { user_id: Uuid, #[arg(long, default_value = "1.0")] divergence_threshold_percent: String },
    /// Set `risk_blocked` and/or `risk_skip_once` on a position group.
    SetRiskFlag {
        group_id: Uuid,
        #[arg(long)]
        blocked: bool,
        #[arg(long)]
        skip_once: bool,
    },
    /// Clear both risk flags on a position group.
    ClearRiskFlag { group_id: Uuid },
    /// Run a single risk-engine evaluation pass for one user, synchronously.
    EvaluateOnce { user_id: Uuid },
}

/// Everything the composition root built, so `Command::Serve` can start both
/// loops and every other subcommand can act through the same wiring.
struct Composition {
    repos: Repositories,
    risk_engine: Arc<RiskEngine>,
    fill_monitor: Arc<FillMonitor>,
}

fn build_connector(creds: &dca_grid_engine::config::ExchangeCredentials) -> Option<Arc<dyn ExchangeConnector>> {
    match creds.exchange.to_ascii_lowercase().as_str() {
        "binance" => {
            let mut connector = BinanceConnector::new(creds.api_key.clone(), creds.api_secret.clone());
            if let Some(base_url) = &creds.base_url {
                connector = BinanceConnector::with_base_url(creds.api_key.clone(), creds.api_secret.clone(), base_url.clone());
            }
            Some(Arc::new(connector))
        }
        "coindcx" => Some(Arc::new(CoinDcxConnector::new(creds.api_key.clone(), creds.api_secret.clone()))),
        other => {
            tracing::warn!(exchange = other, "cli: unrecognized exchange in config, skipping connector");
            None
        }
    }
}

fn build_composition(config: &AppConfig) -> anyhow::Result<Composition> {
    let store = Arc::new(SqliteStore::open(&config.database_path)?);
    let repos = Repositories {
        positions: store.clone() as Arc<dyn PositionRepository>,
        orders: store.clone() as Arc<dyn DcaOrderRepository>,
        pyramids: store.clone() as Arc<dyn PyramidRepository>,
        signals: store.clone() as Arc<dyn QueuedSignalRepository>,
        risk_actions: store.clone() as Arc<dyn RiskActionRepository>,
        user_config: store.clone() as Arc<dyn UserConfigRepository>,
    };

    let broadcaster: Arc<dyn Broadcaster> = Arc::new(TracingBroadcaster::new());

    let mut fill_services: HashMap<ExchangeId, ExchangeServices> = HashMap::new();
    let mut risk_services: HashMap<ExchangeId, RiskExchangeServices> = HashMap::new();

    for creds in &config.exchanges {
        let Some(connector) = build_connector(creds) else { continue };
        let exchange_id = ExchangeId::new(creds.exchange.clone());
        let order_service = Arc::new(OrderService::new(connector.clone(), repos.orders.clone()));
        let position_manager = Arc::new(PositionManager::new(
            order_service.clone(),
            repos.positions.clone(),
            repos.pyramids.clone(),
            repos.orders.clone(),
            broadcaster.clone(),
            config.base_currency.clone(),
        ));

        fill_services.insert(
            exchange_id.clone(),
            ExchangeServices {
                connector: connector.clone(),
                order_service: order_service.clone(),
                position_manager,
                base_currency: config.base_currency.clone(),
            },
        );
        risk_services.insert(exchange_id, RiskExchangeServices { connector, order_service });
    }

    let group_locks = GroupLocks::new();

    let risk_engine = Arc::new(RiskEngine::new(
        repos.clone(),
        broadcaster.clone(),
        risk_services,
        Duration::from_secs(config.risk_engine_interval_seconds),
        group_locks.clone(),
    ));

    let fill_monitor = Arc::new(FillMonitor::new(
        repos.clone(),
        broadcaster,
        fill_services,
        Duration::from_secs(config.fill_monitor_interval_seconds),
        config.max_concurrent_users_per_cycle,
        config.per_user_concurrency,
        Some(risk_engine.clone()),
        group_locks,
    ));

    Ok(Composition { repos, risk_engine, fill_monitor })
}

/// Runs both background loops until `ctrl_c`, then lets in-flight cycles
/// finish their current cooperative checkpoint (spec §5 "Cancellation").
async fn serve(composition: Composition) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let fill_monitor = composition.fill_monitor.clone();
    let fill_monitor_rx = shutdown_rx.clone();
    let fill_monitor_handle = tokio::spawn(async move { fill_monitor.run(fill_monitor_rx).await });

    let risk_engine = composition.risk_engine.clone();
    let risk_engine_handle = tokio::spawn(async move { risk_engine.run(shutdown_rx).await });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = fill_monitor_handle.await;
    let _ = risk_engine_handle.await;
    Ok(())
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = AppConfig::from_file(&cli.config)?;
    let composition = build_composition(&config)?;

    match cli.command {
        Command::Serve => serve(composition).await?,
        Command::PauseEngine { user_id } => {
            if let Some(mut uc) = composition.repos.user_config.get(user_id).await? {
                uc.engine_force_stopped = true;
                composition.repos.user_config.update(&uc).await?;
                println!("engine paused for user {user_id}");
            } else {
                println!("no config found for user {user_id}");
            }
        }
        Command::ResumeEngine { user_id } => {
            if let Some(mut uc) = composition.repos.user_config.get(user_id).await? {
                uc.engine_force_stopped = false;
                uc.engine_paused_by_loss_limit = false;
                composition.repos.user_config.update(&uc).await?;
                println!("engine resumed for user {user_id}");
            } else {
                println!("no config found for user {user_id}");
            }
        }
        Command::ForceClose { group_id } => {
            let Some(group) = composition.repos.positions.get(group_id).await? else {
                println!("no such position group {group_id}");
                return Ok(());
            };
            let Some(mut orders) = composition
                .repos
                .orders
                .get_all_orders_by_group_id(group_id)
                .await
                .ok()
            else {
                println!("failed to load orders for {group_id}");
                return Ok(());
            };
            let Some(position_manager) = composition.fill_monitor.position_manager_for(&group.exchange) else {
                println!("no exchange services configured for {}", group.exchange);
                return Ok(());
            };
            let mut group = group;
            position_manager.handle_exit_signal(&mut group, &mut orders).await?;
            println!("force-closed position group {group_id}");
        }
        Command::Sync { user_id, divergence_threshold_percent } => {
            let threshold = divergence_threshold_percent.parse().unwrap_or(rust_decimal::Decimal::ONE);
            composition.risk_engine.sync_with_exchange(user_id, threshold).await?;
            println!("sync complete for user {user_id}");
        }
        Command::SetRiskFlag { group_id, blocked, skip_once } => {
            composition.risk_engine.set_risk_flag(group_id, blocked, skip_once).await?;
            println!("risk flags updated for group {group_id}");
        }
        Command::ClearRiskFlag { group_id } => {
            composition.risk_engine.set_risk_flag(group_id, false, false).await?;
            println!("risk flags cleared for group {group_id}");
        }
        Command::EvaluateOnce { user_id } => {
            composition.risk_engine.evaluate_user(user_id).await?;
            println!("risk evaluation pass complete for user {user_id}");
        }
    }

    Ok(())
}

