//! Shared test doubles and fixture builders for the end-to-end scenarios in
//! `tests/end_to_end.rs`. Not a unit under test itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use dca_grid_engine::config::{
    DcaGridConfig, DcaLevel, EntryOrderType, RiskEngineConfig, StaleTpAction, TimerStartCondition,
};
use dca_grid_engine::domain::TpMode;
use dca_grid_engine::error::ExchangeError;
use dca_grid_engine::exchange::{
    AmountType, Balance, ExchangeConnector, ExchangeOrderResponse, PrecisionRule,
    RequestOrderType, Ticker,
};
use dca_grid_engine::repository::sqlite::SqliteStore;
use dca_grid_engine::repository::{
    DcaOrderRepository, PositionRepository, PyramidRepository, QueuedSignalRepository,
    Repositories, RiskActionRepository, UserConfig, UserConfigRepository,
};
use dca_grid_engine::types::{Side, Symbol};

#[derive(Debug, Clone)]
struct MockOrderState {
    status: String,
    filled: Decimal,
    average: Option<Decimal>,
}

/// A scripted `ExchangeConnector` double. Limit orders open unfilled and are
/// advanced only by the test calling [`MockConnector::fill_order`]; market
/// orders fill immediately at the symbol's seeded price. One insufficient-
/// balance failure can be armed for the very next market order, mirroring
/// scenario 5 in spec §8 — it also seeds `fetch_free_balance`'s reported
/// amount for the given asset, so the real retry path has something to read.
pub struct MockConnector {
    next_id: AtomicU64,
    orders: Mutex<HashMap<String, MockOrderState>>,
    prices: Mutex<HashMap<String, Decimal>>,
    precision: Mutex<HashMap<String, PrecisionRule>>,
    free_balances: Mutex<HashMap<String, Decimal>>,
    fail_next_market_order: Mutex<bool>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            orders: Mutex::new(HashMap::new()),
            prices: Mutex::new(HashMap::new()),
            precision: Mutex::new(HashMap::new()),
            free_balances: Mutex::new(HashMap::new()),
            fail_next_market_order: Mutex::new(false),
        }
    }

    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        self.prices.lock().await.insert(symbol.to_string(), price);
    }

    pub async fn set_precision(&self, symbol: &str, rule: PrecisionRule) {
        self.precision.lock().await.insert(symbol.to_string(), rule);
    }

    pub async fn fail_next_market_order_with_insufficient_balance(&self, asset: &str, available: Decimal) {
        *self.fail_next_market_order.lock().await = true;
        self.free_balances.lock().await.insert(asset.to_string(), available);
    }

    /// Advances a previously placed (still open) order's exchange-side
    /// state, as observed by a subsequent `check_order_status` call.
    pub async fn fill_order(&self, order_id: &str, filled: Decimal, average: Decimal) {
        let mut orders = self.orders.lock().await;
        if let Some(state) = orders.get_mut(order_id) {
            state.status = "filled".to_string();
            state.filled = filled;
            state.average = Some(average);
        }
    }
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExchangeConnector for MockConnector {
    async fn place_order(
        &self,
        symbol: &Symbol,
        order_type: RequestOrderType,
        _side: Side,
        quantity: Decimal,
        price: Option<Decimal>,
        _amount_type: AmountType,
    ) -> Result<ExchangeOrderResponse, ExchangeError> {
        if matches!(order_type, RequestOrderType::Market) {
            let mut fail_next = self.fail_next_market_order.lock().await;
            if *fail_next {
                *fail_next = false;
                return Err(ExchangeError::Api {
                    message: "insufficient balance to fill market order".to_string(),
                    status_code: None,
                });
            }
            drop(fail_next);
            let mark = self.prices.lock().await.get(symbol.as_str()).copied().unwrap_or(Decimal::ZERO);
            let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
            return Ok(ExchangeOrderResponse {
                id,
                status: "filled".to_string(),
                filled: quantity,
                average: Some(mark),
                fee: Some(Decimal::ZERO),
                fee_currency: None,
                info: Value::Null,
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        self.orders.lock().await.insert(
            id.clone(),
            MockOrderState { status: "open".to_string(), filled: Decimal::ZERO, average: None },
        );
        Ok(ExchangeOrderResponse {
            id,
            status: "open".to_string(),
            filled: Decimal::ZERO,
            average: price,
            fee: None,
            fee_currency: None,
            info: Value::Null,
        })
    }

    async fn cancel_order(&self, order_id: &str, _symbol: &Symbol) -> Result<ExchangeOrderResponse, ExchangeError> {
        let mut orders = self.orders.lock().await;
        let state = orders.entry(order_id.to_string()).or_insert(MockOrderState {
            status: "open".to_string(),
            filled: Decimal::ZERO,
            average: None,
        });
        state.status = "cancelled".to_string();
        Ok(ExchangeOrderResponse {
            id: order_id.to_string(),
            status: state.status.clone(),
            filled: state.filled,
            average: state.average,
            fee: None,
            fee_currency: None,
            info: Value::Null,
        })
    }

    async fn get_order_status(&self, order_id: &str, symbol: &Symbol) -> Result<ExchangeOrderResponse, ExchangeError> {
        let orders = self.orders.lock().await;
        let state = orders
            .get(order_id)
            .ok_or_else(|| ExchangeError::OrderNotFound { order_id: order_id.to_string(), symbol: symbol.to_string() })?;
        Ok(ExchangeOrderResponse {
            id: order_id.to_string(),
            status: state.status.clone(),
            filled: state.filled,
            average: state.average,
            fee: Some(Decimal::ZERO),
            fee_currency: None,
            info: Value::Null,
        })
    }

    async fn get_current_price(&self, symbol: &Symbol) -> Result<Decimal, ExchangeError> {
        Ok(self.prices.lock().await.get(symbol.as_str()).copied().unwrap_or(Decimal::ZERO))
    }

    async fn get_all_tickers(&self) -> Result<HashMap<Symbol, Ticker>, ExchangeError> {
        let prices = self.prices.lock().await;
        Ok(prices
            .iter()
            .map(|(symbol, price)| (Symbol::new(symbol.clone()), Ticker { symbol: Symbol::new(symbol.clone()), last: *price }))
            .collect())
    }

    async fn get_precision_rules(&self) -> Result<HashMap<Symbol, PrecisionRule>, ExchangeError> {
        let precision = self.precision.lock().await;
        Ok(precision.iter().map(|(symbol, rule)| (Symbol::new(symbol.clone()), *rule)).collect())
    }

    async fn get_trading_fee_rate(&self, _symbol: &Symbol) -> Result<Decimal, ExchangeError> {
        Ok(Decimal::ZERO)
    }

    async fn fetch_free_balance(&self) -> Result<HashMap<String, Decimal>, ExchangeError> {
        Ok(self.free_balances.lock().await.clone())
    }

    async fn fetch_balance(&self) -> Result<HashMap<String, Balance>, ExchangeError> {
        Ok(HashMap::new())
    }

    async fn get_positions(&self) -> Result<Vec<Balance>, ExchangeError> {
        Ok(Vec::new())
    }

    async fn close(&self) -> Result<(), ExchangeError> {
        Ok(())
    }
}

pub fn in_memory_repositories() -> Repositories {
    let store = Arc::new(SqliteStore::open_in_memory().expect("in-memory sqlite store"));
    Repositories {
        positions: store.clone() as Arc<dyn PositionRepository>,
        orders: store.clone() as Arc<dyn DcaOrderRepository>,
        pyramids: store.clone() as Arc<dyn PyramidRepository>,
        signals: store.clone() as Arc<dyn QueuedSignalRepository>,
        risk_actions: store.clone() as Arc<dyn RiskActionRepository>,
        user_config: store as Arc<dyn UserConfigRepository>,
    }
}

/// Scenario 1's grid: 5 legs, weights 20% each, gaps `[0, -1, -2, -3, -5]%`,
/// tp_percents `[2, 1.5, 1, 0.5, 0.5]%`.
pub fn per_leg_grid_config(entry_order_type: EntryOrderType, tp_mode: TpMode) -> DcaGridConfig {
    DcaGridConfig {
        entry_order_type,
        dca_levels: vec![
            DcaLevel { gap_percent: dec!(0), weight_percent: dec!(20), tp_percent: dec!(2) },
            DcaLevel { gap_percent: dec!(-1), weight_percent: dec!(20), tp_percent: dec!(1.5) },
            DcaLevel { gap_percent: dec!(-2), weight_percent: dec!(20), tp_percent: dec!(1) },
            DcaLevel { gap_percent: dec!(-3), weight_percent: dec!(20), tp_percent: dec!(0.5) },
            DcaLevel { gap_percent: dec!(-5), weight_percent: dec!(20), tp_percent: dec!(0.5) },
        ],
        pyramid_specific_levels: HashMap::new(),
        tp_mode,
        tp_aggregate_percent: None,
        pyramid_tp_percents: HashMap::new(),
        max_pyramids: 3,
        cancel_dca_beyond_percent: None,
        total_capital_usd: dec!(500),
        adjust_tp_to_actual_fill: false,
        stale_tp_threshold_hours: dec!(24),
        stale_tp_action: StaleTpAction::Replace,
    }
}

pub fn default_precision() -> PrecisionRule {
    PrecisionRule { tick_size: dec!(0.01), step_size: dec!(0.01), min_notional: dec!(0) }
}

pub fn sample_risk_config() -> RiskEngineConfig {
    RiskEngineConfig {
        evaluate_interval_seconds: 60,
        evaluate_on_fill: false,
        max_positions_per_symbol_timeframe_exchange: 1,
        max_total_exposure_usd: dec!(100000),
        max_realized_loss_usd: dec!(100000),
        timer_start_condition: TimerStartCondition::AfterAllDcaSubmitted,
        post_full_wait_minutes: 0,
        reset_timer_on_replacement: false,
        required_pyramids_for_timer: 1,
        loss_threshold_percent: dec!(-1),
        max_winners_to_combine: 3,
        slippage_action: None,
        max_slippage_percent: None,
    }
}

pub fn sample_user_config(user_id: Uuid) -> UserConfig {
    UserConfig {
        user_id,
        risk_engine_config: sample_risk_config(),
        grid_configs: HashMap::new(),
        engine_force_stopped: false,
        engine_paused_by_loss_limit: false,
    }
}
