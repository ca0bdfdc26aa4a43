//! End-to-end scenarios from spec §8, exercised against an in-memory SQLite
//! store and a scripted `ExchangeConnector` double (see `tests/support`).

mod support;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

use dca_grid_engine::broadcaster::{Broadcaster, TracingBroadcaster};
use dca_grid_engine::config::EntryOrderType;
use dca_grid_engine::domain::dca_order::{DcaOrder, OrderType};
use dca_grid_engine::domain::position_group::PositionStatus;
use dca_grid_engine::domain::{OrderStatus, TpMode};
use dca_grid_engine::error::DomainError;
use dca_grid_engine::exchange::ExchangeConnector;
use dca_grid_engine::fill_monitor::{ExchangeServices, FillMonitor};
use dca_grid_engine::oms::group_lock::GroupLocks;
use dca_grid_engine::oms::order_service::OrderService;
use dca_grid_engine::oms::position_manager::PositionManager;
use dca_grid_engine::repository::{
    DcaOrderRepository, PositionRepository, PyramidRepository, RiskActionRepository, UserConfigRepository,
};
use dca_grid_engine::risk_engine::{RiskEngine, RiskExchangeServices};
use dca_grid_engine::types::{ExchangeId, Side, Symbol, Timeframe};
use dca_grid_engine::Error;

use support::{default_precision, in_memory_repositories, per_leg_grid_config, sample_user_config, MockConnector};

fn broadcaster() -> Arc<dyn Broadcaster> {
    Arc::new(TracingBroadcaster::new())
}

/// Scenario 1: happy path, per-leg TP.
#[tokio::test]
async fn happy_path_per_leg_tp_closes_once_every_tp_fills() {
    let repos = in_memory_repositories();
    let mock = Arc::new(MockConnector::new());
    let connector: Arc<dyn ExchangeConnector> = mock.clone();
    let symbol = Symbol::new("BTCUSDT");
    mock.set_precision("BTCUSDT", default_precision()).await;

    let order_service = Arc::new(OrderService::new(connector.clone(), repos.orders.clone()));
    let position_manager =
        PositionManager::new(order_service.clone(), repos.positions.clone(), repos.pyramids.clone(), repos.orders.clone(), broadcaster(), "USDT".to_string());

    let config = per_leg_grid_config(EntryOrderType::Limit, TpMode::PerLeg);
    let user_id = Uuid::new_v4();
    let group = position_manager
        .create_position_group_from_signal(
            user_id,
            ExchangeId::new("binance"),
            symbol.clone(),
            Timeframe::new("60m"),
            Side::Buy,
            dec!(100),
            &config,
        )
        .await
        .unwrap();

    assert_eq!(group.total_dca_legs, 5);
    let expected_prices = [dec!(100.00), dec!(99.00), dec!(98.00), dec!(97.00), dec!(95.00)];
    let mut entry_orders: Vec<_> = repos
        .orders
        .get_all_orders_by_group_id(group.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|o| o.is_entry_leg())
        .collect();
    entry_orders.sort_by_key(|o| o.leg_index);
    for (order, expected_price) in entry_orders.iter().zip(expected_prices.iter()) {
        assert_eq!(order.price, *expected_price);
        assert!(order.exchange_order_id.is_some(), "leg should have been submitted");
    }

    // Fill every leg on the exchange side, then have the order service pick
    // up each fill, place its TP, and fill the TP too.
    let mut group = group;
    for mut order in entry_orders {
        let exchange_id = order.exchange_order_id.clone().unwrap();
        mock.fill_order(&exchange_id, order.quantity, order.price).await;
        order_service.check_order_status(&mut order, "USDT", Decimal::ZERO).await.unwrap();
        assert_eq!(order.status, OrderStatus::Filled);

        let mut tp_order = order_service.place_tp_order(&mut order, false).await.unwrap();
        let tp_exchange_id = tp_order.exchange_order_id.clone().unwrap();
        mock.fill_order(&tp_exchange_id, tp_order.quantity, tp_order.tp_price).await;
        order_service.check_order_status(&mut tp_order, "USDT", Decimal::ZERO).await.unwrap();
        tp_order.tp_hit = true;
        repos.orders.update(&tp_order).await.unwrap();

        let mut all_orders = repos.orders.get_all_orders_by_group_id(group.id).await.unwrap();
        let mut pyramids = repos.pyramids.get_all_by_group_id(group.id).await.unwrap();
        position_manager
            .update_position_stats(&mut group, &mut pyramids, &mut all_orders, order.price)
            .await
            .unwrap();
    }

    let final_group = repos.positions.get(group.id).await.unwrap().unwrap();
    assert_eq!(final_group.filled_dca_legs, 5);
}

/// Scenario 2: aggregate TP fires on a partial pyramid once the average
/// entry's target is reached by the current price.
#[tokio::test]
async fn aggregate_tp_closes_on_partial_pyramid() {
    let repos = in_memory_repositories();
    let mock = Arc::new(MockConnector::new());
    let connector: Arc<dyn ExchangeConnector> = mock.clone();
    mock.set_precision("BTCUSDT", default_precision()).await;
    mock.set_price("BTCUSDT", dec!(102.6)).await;

    let order_service = Arc::new(OrderService::new(connector.clone(), repos.orders.clone()));
    let position_manager =
        PositionManager::new(order_service.clone(), repos.positions.clone(), repos.pyramids.clone(), repos.orders.clone(), broadcaster(), "USDT".to_string());

    let mut config = per_leg_grid_config(EntryOrderType::Limit, TpMode::Aggregate);
    config.tp_aggregate_percent = Some(dec!(3));
    let user_id = Uuid::new_v4();
    let group = position_manager
        .create_position_group_from_signal(
            user_id,
            ExchangeId::new("binance"),
            Symbol::new("BTCUSDT"),
            Timeframe::new("60m"),
            Side::Buy,
            dec!(100),
            &config,
        )
        .await
        .unwrap();

    // Fill only the first two legs (weighted avg entry = 99.5 per spec §8).
    let mut orders = repos.orders.get_all_orders_by_group_id(group.id).await.unwrap();
    orders.sort_by_key(|o| o.leg_index);
    for order in orders.iter_mut().filter(|o| o.is_entry_leg()).take(2) {
        let exchange_id = order.exchange_order_id.clone().unwrap();
        mock.fill_order(&exchange_id, order.quantity, order.price).await;
        order_service.check_order_status(order, "USDT", Decimal::ZERO).await.unwrap();
    }

    let mut group = group;
    let mut pyramids = repos.pyramids.get_all_by_group_id(group.id).await.unwrap();
    let mut all_orders = repos.orders.get_all_orders_by_group_id(group.id).await.unwrap();
    position_manager.update_position_stats(&mut group, &mut pyramids, &mut all_orders, dec!(102.6)).await.unwrap();

    assert_eq!(group.status, PositionStatus::Closed);
    assert!(group.realized_pnl_usd > Decimal::ZERO);
}

#[allow(clippy::too_many_arguments)]
fn sample_group(
    user_id: Uuid,
    exchange: &ExchangeId,
    symbol: &str,
    side: Side,
    entry_price: Decimal,
    filled_quantity: Decimal,
    unrealized_pnl_usd: Decimal,
    unrealized_pnl_pct: Decimal,
) -> dca_grid_engine::domain::position_group::PositionGroup {
    use chrono::Utc;
    dca_grid_engine::domain::position_group::PositionGroup {
        id: Uuid::new_v4(),
        user_id,
        exchange: exchange.clone(),
        symbol: Symbol::new(symbol),
        timeframe: Timeframe::new("60m"),
        side,
        base_entry_price: entry_price,
        weighted_avg_entry: entry_price,
        total_invested_usd: entry_price * filled_quantity,
        total_filled_quantity: filled_quantity,
        unrealized_pnl_usd,
        unrealized_pnl_pct,
        realized_pnl_usd: Decimal::ZERO,
        total_dca_legs: 1,
        filled_dca_legs: 1,
        pyramid_count: 1,
        max_pyramids: 1,
        tp_mode: TpMode::PerLeg,
        tp_aggregate_percent: None,
        risk_blocked: false,
        risk_skip_once: false,
        risk_timer_start: Some(Utc::now() - chrono::Duration::minutes(5)),
        risk_timer_expires: Some(Utc::now() - chrono::Duration::minutes(1)),
        status: PositionStatus::Active,
        created_at: Utc::now(),
        closed_at: None,
        telegram_message_id: None,
    }
}

/// Scenario 3: risk offset — one loser fully closed, required USD drawn
/// from winners in descending-PnL order, one `RiskAction` recorded.
#[tokio::test]
async fn risk_offset_closes_loser_and_draws_from_winners() {
    let repos = in_memory_repositories();
    let mock = Arc::new(MockConnector::new());
    let connector: Arc<dyn ExchangeConnector> = mock.clone();
    for (symbol, price) in [("BTCUSDT", dec!(90)), ("ETHUSDT", dec!(2200)), ("SOLUSDT", dec!(150))] {
        mock.set_price(symbol, price).await;
        mock.set_precision(symbol, default_precision()).await;
    }

    let order_service = Arc::new(OrderService::new(connector.clone(), repos.orders.clone()));
    let user_id = Uuid::new_v4();
    let exchange = ExchangeId::new("binance");
    repos.user_config.update(&sample_user_config(user_id)).await.unwrap();

    let loser = sample_group(user_id, &exchange, "BTCUSDT", Side::Buy, dec!(100), dec!(1), dec!(-100), dec!(-10));
    let eth_winner = sample_group(user_id, &exchange, "ETHUSDT", Side::Buy, dec!(2000), dec!(1), dec!(80), dec!(4));
    let sol_winner = sample_group(user_id, &exchange, "SOLUSDT", Side::Buy, dec!(120), dec!(1), dec!(60), dec!(25));
    for group in [&loser, &eth_winner, &sol_winner] {
        repos.positions.create(group).await.unwrap();
    }

    let mut services = HashMap::new();
    services.insert(exchange, RiskExchangeServices { connector: connector.clone(), order_service: order_service.clone() });
    let risk_engine = RiskEngine::new(repos.clone(), broadcaster(), services, Duration::from_secs(60), GroupLocks::new());

    risk_engine.evaluate_user(user_id).await.unwrap();

    let closed_loser = repos.positions.get(loser.id).await.unwrap().unwrap();
    assert_eq!(closed_loser.status, PositionStatus::Closed);

    let actions = repos.risk_actions.get_all_for_user(user_id).await.unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].loser_pnl_usd, dec!(-100));
    assert!(!actions[0].winner_details.is_empty());
}

/// Scenario 4: a market-type leg zero held `trigger_pending` submits once
/// the live ticker crosses its trigger price, and never resubmits.
#[tokio::test]
async fn trigger_pending_entry_submits_once_price_crosses() {
    let repos = in_memory_repositories();
    let mock = Arc::new(MockConnector::new());
    let connector: Arc<dyn ExchangeConnector> = mock.clone();
    let symbol = "BTCUSDT";
    mock.set_precision(symbol, default_precision()).await;
    mock.set_price(symbol, dec!(50000)).await;

    let order_service = Arc::new(OrderService::new(connector.clone(), repos.orders.clone()));
    let position_manager = Arc::new(PositionManager::new(
        order_service.clone(),
        repos.positions.clone(),
        repos.pyramids.clone(),
        repos.orders.clone(),
        broadcaster(),
        "USDT".to_string(),
    ));

    let config = per_leg_grid_config(EntryOrderType::Market, TpMode::PerLeg);
    let user_id = Uuid::new_v4();
    repos.user_config.update(&sample_user_config(user_id)).await.unwrap();

    let group = position_manager
        .create_position_group_from_signal(
            user_id,
            ExchangeId::new("binance"),
            Symbol::new(symbol),
            Timeframe::new("60m"),
            Side::Buy,
            dec!(49500),
            &config,
        )
        .await
        .unwrap();

    let leg_zero = repos
        .orders
        .get_all_orders_by_group_id(group.id)
        .await
        .unwrap()
        .into_iter()
        .find(|o| o.leg_index == 0)
        .unwrap();
    assert_eq!(leg_zero.status, OrderStatus::TriggerPending);
    assert!(leg_zero.exchange_order_id.is_none());

    let mut exchange_services = HashMap::new();
    exchange_services.insert(
        ExchangeId::new("binance"),
        ExchangeServices {
            connector: connector.clone(),
            order_service: order_service.clone(),
            position_manager: position_manager.clone(),
            base_currency: "USDT".to_string(),
        },
    );
    let fill_monitor = Arc::new(FillMonitor::new(repos.clone(), broadcaster(), exchange_services, Duration::from_millis(20), 8, 4, None, GroupLocks::new()));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let monitor_for_cycle = fill_monitor.clone();
    let handle = tokio::spawn(async move { monitor_for_cycle.run(shutdown_rx).await });

    // Price is still above trigger (49500): nothing should have fired yet.
    tokio::time::sleep(Duration::from_millis(60)).await;
    let still_pending = repos.orders.get(leg_zero.id).await.unwrap().unwrap();
    assert_eq!(still_pending.status, OrderStatus::TriggerPending);

    // Drop the ticker below the trigger; the next cycle should submit it.
    mock.set_price(symbol, dec!(49400)).await;
    tokio::time::sleep(Duration::from_millis(80)).await;

    let _ = shutdown_tx.send(true);
    let _ = handle.await;

    let submitted = repos.orders.get(leg_zero.id).await.unwrap().unwrap();
    assert_eq!(submitted.status, OrderStatus::Open);
    assert!(submitted.exchange_order_id.is_some());
}

/// Scenario 5: an exit signal against a balance short of the filled
/// quantity retries once at the reported `available` amount.
#[tokio::test]
async fn insufficient_funds_on_exit_retries_at_available_balance() {
    let repos = in_memory_repositories();
    let mock = Arc::new(MockConnector::new());
    let connector: Arc<dyn ExchangeConnector> = mock.clone();
    mock.set_price("BTCUSDT", dec!(51000)).await;

    let order_service = Arc::new(OrderService::new(connector.clone(), repos.orders.clone()));
    let position_manager =
        PositionManager::new(order_service.clone(), repos.positions.clone(), repos.pyramids.clone(), repos.orders.clone(), broadcaster(), "USDT".to_string());

    let user_id = Uuid::new_v4();
    let exchange = ExchangeId::new("binance");
    let mut group = sample_group(user_id, &exchange, "BTCUSDT", Side::Buy, dec!(50000), dec!(0.02), dec!(20), dec!(2));
    repos.positions.create(&group).await.unwrap();

    // One filled entry leg accounting for the group's whole filled quantity,
    // so `handle_exit_signal`'s fill replay actually has something to close.
    let filled_entry = DcaOrder {
        id: Uuid::new_v4(),
        group_id: group.id,
        pyramid_id: Uuid::new_v4(),
        leg_index: 0,
        symbol: "BTCUSDT".to_string(),
        side: Side::Buy,
        order_type: OrderType::Limit,
        price: dec!(50000),
        quantity: dec!(0.02),
        exchange_order_id: Some("entry-1".to_string()),
        filled_quantity: dec!(0.02),
        avg_fill_price: Some(dec!(50000)),
        fee: Decimal::ZERO,
        fee_currency: None,
        submitted_at: Some(chrono::Utc::now()),
        filled_at: Some(chrono::Utc::now()),
        cancelled_at: None,
        gap_percent: Decimal::ZERO,
        weight_percent: dec!(100),
        tp_percent: dec!(2),
        tp_price: dec!(51000),
        tp_order_id: None,
        tp_hit: false,
        tp_executed_at: None,
        status: OrderStatus::Filled,
    };

    mock.fail_next_market_order_with_insufficient_balance("BTC", dec!(0.018)).await;

    let mut orders = vec![filled_entry];
    position_manager.handle_exit_signal(&mut group, &mut orders).await.unwrap();

    assert_eq!(group.status, PositionStatus::Closed);
    assert_eq!(group.total_filled_quantity, Decimal::ZERO);
}

/// Scenario 6: a duplicate signal for the same (user, exchange, symbol,
/// timeframe, side) raises `DuplicatePositionException` on the second call.
#[tokio::test]
async fn duplicate_entry_signal_is_rejected() {
    let repos = in_memory_repositories();
    let mock = Arc::new(MockConnector::new());
    let connector: Arc<dyn ExchangeConnector> = mock.clone();
    mock.set_precision("BTCUSDT", default_precision()).await;

    let order_service = Arc::new(OrderService::new(connector.clone(), repos.orders.clone()));
    let position_manager =
        PositionManager::new(order_service.clone(), repos.positions.clone(), repos.pyramids.clone(), repos.orders.clone(), broadcaster(), "USDT".to_string());

    let config = per_leg_grid_config(EntryOrderType::Limit, TpMode::PerLeg);
    let user_id = Uuid::new_v4();
    let exchange = ExchangeId::new("binance");
    let symbol = Symbol::new("BTCUSDT");
    let timeframe = Timeframe::new("60m");

    let first = position_manager
        .create_position_group_from_signal(user_id, exchange.clone(), symbol.clone(), timeframe.clone(), Side::Buy, dec!(100), &config)
        .await
        .unwrap();

    let second = position_manager
        .create_position_group_from_signal(user_id, exchange, symbol, timeframe, Side::Buy, dec!(100), &config)
        .await;

    assert!(matches!(second, Err(Error::Domain(DomainError::DuplicatePosition))));

    let all_active = repos.positions.get_active_position_groups_for_user(user_id).await.unwrap();
    assert_eq!(all_active.len(), 1);
    assert_eq!(all_active[0].id, first.id);
}
