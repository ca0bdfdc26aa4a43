//! `OrderService`: the sole component that mutates a single order or calls
//! the exchange for it (spec §4.1).
//!
//! Retry/verification constants are grounded in
//! `examples/original_source/order_management.py`: `base_delay=1s`, up to
//! 50% jitter on the exponential backoff, `verification_delay=0.5s`
//! progressive, `max_verification_attempts=3`, `stale_threshold_hours=24`.
//! The retry loop shape itself mirrors the teacher's
//! `coindcx::client::execute_with_retry`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::{DcaGridConfig, StaleTpAction};
use crate::domain::dca_order::{DcaOrder, OrderStatus, OrderType, LEG_INDEX_AD_HOC_CLOSE, LEG_INDEX_TP_FILL};
use crate::domain::position_group::PositionGroup;
use crate::error::{ExchangeError, OrderError};
use crate::exchange::{AmountType, ExchangeConnector, PrecisionRule, RequestOrderType};
use crate::grid::round_down_to_increment;
use crate::repository::DcaOrderRepository;
use crate::types::{Side, Symbol};

const MAX_SUBMIT_ATTEMPTS: u32 = 3;
const BASE_DELAY: Duration = Duration::from_secs(1);
const MAX_VERIFICATION_ATTEMPTS: u32 = 3;
const VERIFICATION_DELAY: Duration = Duration::from_millis(500);

/// Outcome of [`OrderService::cancel_with_verification`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Success { verified: bool },
    AlreadyCancelled,
    AlreadyFilled,
    NotFound,
    VerificationFailed,
}

/// Governs how a market order's realized/estimated slippage is handled.
#[derive(Debug, Clone, Copy)]
pub struct SlippageGuard {
    pub expected_price: Option<Decimal>,
    pub max_slippage_percent: Option<Decimal>,
    pub reject: bool,
}

impl SlippageGuard {
    pub fn none() -> Self {
        Self { expected_price: None, max_slippage_percent: None, reject: false }
    }
}

fn slippage_percent(expected: Decimal, actual: Decimal) -> Decimal {
    if expected == Decimal::ZERO {
        return Decimal::ZERO;
    }
    ((actual - expected) / expected).abs() * Decimal::from(100)
}

/// Maps an exchange-native status string (each connector uses its own
/// vocabulary — Binance's is pre-normalized, CoinDCX's passes the raw
/// exchange string through) onto the internal `OrderStatus` vocabulary.
fn normalize_exchange_status(raw: &str) -> OrderStatus {
    match raw.to_ascii_lowercase().as_str() {
        "new" | "open" | "init" => OrderStatus::Open,
        "partially_filled" | "partial_fill" => OrderStatus::PartiallyFilled,
        "filled" | "closed" | "done" => OrderStatus::Filled,
        "canceled" | "cancelled" | "rejected" | "expired" => OrderStatus::Cancelled,
        _ => OrderStatus::Open,
    }
}

pub struct OrderService {
    connector: Arc<dyn ExchangeConnector>,
    orders: Arc<dyn DcaOrderRepository>,
    precision_cache: Mutex<HashMap<Symbol, PrecisionRule>>,
}

impl OrderService {
    pub fn new(connector: Arc<dyn ExchangeConnector>, orders: Arc<dyn DcaOrderRepository>) -> Self {
        Self { connector, orders, precision_cache: Mutex::new(HashMap::new()) }
    }

    /// Fetches (and caches) precision rules for `symbol`, falling back to
    /// `PrecisionRule::default()` when the exchange fetch fails.
    pub async fn precision_for(&self, symbol: &Symbol) -> PrecisionRule {
        {
            let cache = self.precision_cache.lock().await;
            if let Some(rule) = cache.get(symbol) {
                return *rule;
            }
        }
        let rules = self.connector.get_precision_rules().await.unwrap_or_default();
        let mut cache = self.precision_cache.lock().await;
        for (sym, rule) in &rules {
            cache.insert(sym.clone(), *rule);
        }
        cache.get(symbol).copied().unwrap_or_default()
    }

    /// Free balance per asset, straight from the exchange. Used by
    /// `PositionManager::handle_exit_signal`'s insufficient-balance retry.
    pub async fn fetch_free_balance(&self) -> Result<HashMap<String, Decimal>, ExchangeError> {
        self.connector.fetch_free_balance().await
    }

    /// Error messages mentioning precision/lot-size/tick-size/notional
    /// terminology invalidate the whole cached precision table, since a
    /// stale cache is the most likely cause.
    async fn invalidate_precision_cache_if_warranted(&self, err: &ExchangeError) {
        if err.mentions_precision() {
            tracing::warn!("invalidating exchange precision cache after precision-related error");
            self.precision_cache.lock().await.clear();
        }
    }

    fn jittered_backoff(attempt: u32) -> Duration {
        let backoff = BASE_DELAY * 2u32.pow(attempt);
        let jitter_fraction: f64 = rand::thread_rng().gen_range(0.0..0.5);
        backoff.mul_f64(1.0 + jitter_fraction)
    }

    /// Submits a `pending`/`trigger_pending` order. On success advances the
    /// order to `open` and records `exchange_order_id`/`submitted_at`. On
    /// exhausted/non-transient failure advances it to `failed`.
    pub async fn submit_order(&self, order: &mut DcaOrder) -> Result<(), OrderError> {
        let symbol = Symbol::new(order.symbol.clone());
        let request_type = match order.order_type {
            OrderType::Limit => RequestOrderType::Limit,
            OrderType::Market => RequestOrderType::Market,
        };
        let price = match order.order_type {
            OrderType::Limit => Some(order.price),
            OrderType::Market => None,
        };

        let mut attempt = 0u32;
        loop {
            let result = self
                .connector
                .place_order(&symbol, request_type, order.side, order.quantity, price, AmountType::Base)
                .await;

            match result {
                Ok(response) => {
                    order.exchange_order_id = Some(response.id);
                    order.submitted_at = Some(Utc::now());
                    if order.status.can_transition_to(OrderStatus::Open) {
                        order.status = OrderStatus::Open;
                    }
                    self.orders.update(order).await.map_err(|e| {
                        OrderError::SubmissionExhausted(format!("order placed but persist failed: {e}"))
                    })?;
                    return Ok(());
                }
                Err(err) => {
                    self.invalidate_precision_cache_if_warranted(&err).await;
                    let transient = err.is_transient();
                    attempt += 1;
                    if transient && attempt < MAX_SUBMIT_ATTEMPTS {
                        tokio::time::sleep(Self::jittered_backoff(attempt - 1)).await;
                        continue;
                    }
                    order.status = OrderStatus::Failed;
                    let _ = self.orders.update(order).await;
                    return Err(if transient {
                        OrderError::SubmissionExhausted(err.to_string())
                    } else {
                        OrderError::Exchange(err)
                    });
                }
            }
        }
    }

    /// Cancels `order` and polls status until the cancellation is confirmed
    /// or `max_verification_attempts` is exhausted.
    pub async fn cancel_with_verification(&self, order: &mut DcaOrder) -> Result<CancelOutcome, OrderError> {
        let symbol = Symbol::new(order.symbol.clone());
        let exchange_order_id = order
            .exchange_order_id
            .clone()
            .ok_or_else(|| OrderError::VerificationFailed("order has no exchange_order_id".into()))?;

        let mut not_found_on_cancel = false;
        match self.connector.cancel_order(&exchange_order_id, &symbol).await {
            Ok(response) => {
                if normalize_exchange_status(&response.status) == OrderStatus::Filled {
                    return Ok(CancelOutcome::AlreadyFilled);
                }
            }
            Err(ExchangeError::OrderNotFound { .. }) => not_found_on_cancel = true,
            Err(err) => return Err(OrderError::Exchange(err)),
        }

        for attempt in 0..MAX_VERIFICATION_ATTEMPTS {
            tokio::time::sleep(VERIFICATION_DELAY * (attempt + 1)).await;
            match self.connector.get_order_status(&exchange_order_id, &symbol).await {
                Ok(response) => match normalize_exchange_status(&response.status) {
                    OrderStatus::Cancelled => {
                        if order.status.can_transition_to(OrderStatus::Cancelled) {
                            order.status = OrderStatus::Cancelled;
                            order.cancelled_at = Some(Utc::now());
                            let _ = self.orders.update(order).await;
                        }
                        return Ok(CancelOutcome::Success { verified: true });
                    }
                    OrderStatus::Filled => return Ok(CancelOutcome::AlreadyFilled),
                    _ => continue,
                },
                Err(ExchangeError::OrderNotFound { .. }) => {
                    if not_found_on_cancel {
                        return Ok(CancelOutcome::NotFound);
                    }
                    continue;
                }
                Err(err) if err.is_transient() => continue,
                Err(err) => return Err(OrderError::Exchange(err)),
            }
        }

        if not_found_on_cancel {
            Ok(CancelOutcome::NotFound)
        } else if order.exchange_order_id.is_some() {
            Ok(CancelOutcome::Success { verified: false })
        } else {
            Ok(CancelOutcome::VerificationFailed)
        }
    }

    /// Refreshes `order` from the exchange. Returns whether anything
    /// changed. `base_currency` is used to apply invariant 5 (fee-in-base
    /// nets out of `filled_quantity`); `fee_rate` estimates the fee when the
    /// exchange response omits one.
    pub async fn check_order_status(
        &self,
        order: &mut DcaOrder,
        base_currency: &str,
        fee_rate: Decimal,
    ) -> Result<bool, OrderError> {
        let symbol = Symbol::new(order.symbol.clone());
        let exchange_order_id = order
            .exchange_order_id
            .clone()
            .ok_or_else(|| OrderError::VerificationFailed("order has no exchange_order_id".into()))?;

        let response = self
            .connector
            .get_order_status(&exchange_order_id, &symbol)
            .await
            .map_err(OrderError::Exchange)?;

        let new_status = normalize_exchange_status(&response.status);
        let changed = new_status != order.status || response.filled != order.filled_quantity;
        if !changed {
            return Ok(false);
        }

        // Prefer CoinDCX-style raw per-currency fee detail over a unified
        // field that has been observed to misreport for multi-currency
        // fills; fall back to an estimate when the exchange omits a fee.
        let cum_fee_detail = response.info.get("cumFeeDetail").and_then(|detail| detail.as_object()).and_then(|obj| obj.iter().next());

        let fee = cum_fee_detail
            .and_then(|(_, v)| v.as_f64())
            .and_then(Decimal::from_f64_retain)
            .or(response.fee)
            .unwrap_or_else(|| response.filled * response.average.unwrap_or(order.price) * fee_rate);

        let fee_currency = cum_fee_detail.map(|(currency, _)| currency.clone()).or_else(|| response.fee_currency.clone());
        order.filled_quantity = if fee_currency.as_deref() == Some(base_currency) {
            (response.filled - fee).max(Decimal::ZERO)
        } else {
            response.filled
        };
        order.avg_fill_price = response.average.or(order.avg_fill_price);
        order.fee = fee;
        order.fee_currency = fee_currency;

        if new_status == OrderStatus::Filled && order.filled_at.is_none() {
            order.filled_at = Some(Utc::now());
        }
        if order.status.can_transition_to(new_status) {
            order.status = new_status;
        }

        self.orders.update(order).await.map_err(|e| OrderError::VerificationFailed(e.to_string()))?;
        Ok(true)
    }

    /// Places the per-leg (or partial-fill) take-profit order for a filled
    /// leg: a new `DcaOrder` record, leg-tagged `LEG_INDEX_TP_FILL`, on the
    /// opposite side of `entry_leg` at its take-profit price.
    pub async fn place_tp_order(
        &self,
        entry_leg: &mut DcaOrder,
        adjust_to_actual_fill: bool,
    ) -> Result<DcaOrder, OrderError> {
        if entry_leg.status != OrderStatus::Filled || entry_leg.tp_order_id.is_some() {
            return Err(OrderError::VerificationFailed(
                "leg is not eligible for a take-profit order".into(),
            ));
        }

        let symbol = Symbol::new(entry_leg.symbol.clone());
        let precision = self.precision_for(&symbol).await;
        let base_price = if adjust_to_actual_fill {
            entry_leg.avg_fill_price.unwrap_or(entry_leg.price)
        } else {
            entry_leg.price
        };
        let raw_tp_price = match entry_leg.side {
            Side::Buy => base_price * (Decimal::ONE + entry_leg.tp_percent / Decimal::from(100)),
            Side::Sell => base_price * (Decimal::ONE - entry_leg.tp_percent / Decimal::from(100)),
        };
        let tp_price = round_down_to_increment(raw_tp_price, precision.tick_size);
        let tp_side = entry_leg.synthetic_close_side();

        let response = self
            .connector
            .place_order(
                &symbol,
                RequestOrderType::Limit,
                tp_side,
                entry_leg.filled_quantity,
                Some(tp_price),
                AmountType::Base,
            )
            .await
            .map_err(OrderError::Exchange)?;

        let mut tp_record = DcaOrder {
            id: Uuid::new_v4(),
            group_id: entry_leg.group_id,
            pyramid_id: entry_leg.pyramid_id,
            leg_index: LEG_INDEX_TP_FILL,
            symbol: entry_leg.symbol.clone(),
            side: tp_side,
            order_type: OrderType::Limit,
            price: tp_price,
            quantity: entry_leg.filled_quantity,
            exchange_order_id: Some(response.id),
            filled_quantity: Decimal::ZERO,
            avg_fill_price: None,
            fee: Decimal::ZERO,
            fee_currency: None,
            submitted_at: Some(Utc::now()),
            filled_at: None,
            cancelled_at: None,
            gap_percent: Decimal::ZERO,
            weight_percent: Decimal::ZERO,
            tp_percent: entry_leg.tp_percent,
            tp_price,
            tp_order_id: None,
            tp_hit: false,
            tp_executed_at: None,
            status: OrderStatus::Open,
        };
        self.orders.create(&mut tp_record).await.map_err(|e| OrderError::VerificationFailed(e.to_string()))?;

        entry_leg.tp_order_id = Some(tp_record.id);
        self.orders.update(entry_leg).await.map_err(|e| OrderError::VerificationFailed(e.to_string()))?;

        Ok(tp_record)
    }

    /// If `tp_record` has been open longer than `config.stale_tp_threshold_hours`
    /// since `entry_leg` filled, replaces it (limit, at the current
    /// price + tp%) or market-closes the held quantity, per
    /// `config.stale_tp_action`.
    pub async fn retry_stale_tp(
        &self,
        entry_leg: &mut DcaOrder,
        tp_record: &mut DcaOrder,
        config: &DcaGridConfig,
        current_price: Decimal,
    ) -> Result<(), OrderError> {
        let Some(filled_at) = entry_leg.filled_at else { return Ok(()) };
        let hours_open = Decimal::from((Utc::now() - filled_at).num_seconds()) / Decimal::from(3600);
        if hours_open <= config.stale_tp_threshold_hours {
            return Ok(());
        }

        match config.stale_tp_action {
            StaleTpAction::Replace => {
                self.cancel_with_verification(tp_record).await?;
                let symbol = Symbol::new(entry_leg.symbol.clone());
                let precision = self.precision_for(&symbol).await;
                let raw_price = match entry_leg.side {
                    Side::Buy => current_price * (Decimal::ONE + entry_leg.tp_percent / Decimal::from(100)),
                    Side::Sell => current_price * (Decimal::ONE - entry_leg.tp_percent / Decimal::from(100)),
                };
                let new_price = round_down_to_increment(raw_price, precision.tick_size);
                let response = self
                    .connector
                    .place_order(
                        &symbol,
                        RequestOrderType::Limit,
                        entry_leg.synthetic_close_side(),
                        entry_leg.filled_quantity,
                        Some(new_price),
                        AmountType::Base,
                    )
                    .await
                    .map_err(OrderError::Exchange)?;
                tp_record.exchange_order_id = Some(response.id);
                tp_record.price = new_price;
                tp_record.status = OrderStatus::Open;
                tp_record.submitted_at = Some(Utc::now());
                self.orders.update(tp_record).await.map_err(|e| OrderError::VerificationFailed(e.to_string()))?;
            }
            StaleTpAction::MarketClose => {
                self.cancel_with_verification(tp_record).await?;
                let guard = SlippageGuard::none();
                let _ = self
                    .place_market_order(
                        &Symbol::new(entry_leg.symbol.clone()),
                        entry_leg.synthetic_close_side(),
                        entry_leg.filled_quantity,
                        guard,
                        entry_leg.group_id,
                        entry_leg.pyramid_id,
                    )
                    .await?;
                entry_leg.tp_hit = true;
                entry_leg.tp_executed_at = Some(Utc::now());
                self.orders.update(entry_leg).await.map_err(|e| OrderError::VerificationFailed(e.to_string()))?;
            }
        }
        Ok(())
    }

    /// Places a market order with optional pre/post-execution slippage
    /// checks, persisting a synthetic `leg_index=-1` audit record.
    pub async fn place_market_order(
        &self,
        symbol: &Symbol,
        side: Side,
        quantity: Decimal,
        guard: SlippageGuard,
        group_id: Uuid,
        pyramid_id: Uuid,
    ) -> Result<DcaOrder, OrderError> {
        if let (Some(expected), Some(max_pct)) = (guard.expected_price, guard.max_slippage_percent) {
            let mark = self.connector.get_current_price(symbol).await.map_err(OrderError::Exchange)?;
            let pct = slippage_percent(expected, mark);
            if pct > max_pct {
                if guard.reject {
                    return Err(OrderError::Exchange(ExchangeError::SlippageExceeded {
                        expected,
                        actual: mark,
                        max_percent: max_pct,
                    }));
                }
                tracing::warn!(%symbol, %expected, actual = %mark, %max_pct, "pre-check slippage warning");
            }
        }

        let response = self
            .connector
            .place_order(symbol, RequestOrderType::Market, side, quantity, None, AmountType::Base)
            .await
            .map_err(OrderError::Exchange)?;

        if let (Some(expected), Some(max_pct), Some(actual)) =
            (guard.expected_price, guard.max_slippage_percent, response.average)
        {
            let pct = slippage_percent(expected, actual);
            if pct > max_pct {
                // The trade has already executed; a post-check breach can
                // only ever be logged, never rejected.
                tracing::warn!(%symbol, %expected, %actual, %max_pct, "post-check slippage exceeded");
            }
        }

        let mut record = DcaOrder {
            id: Uuid::new_v4(),
            group_id,
            pyramid_id,
            leg_index: LEG_INDEX_AD_HOC_CLOSE,
            symbol: symbol.as_str().to_string(),
            side,
            order_type: OrderType::Market,
            price: response.average.unwrap_or(Decimal::ZERO),
            quantity,
            exchange_order_id: Some(response.id),
            filled_quantity: response.filled,
            avg_fill_price: response.average,
            fee: response.fee.unwrap_or(Decimal::ZERO),
            fee_currency: response.fee_currency.clone(),
            submitted_at: Some(Utc::now()),
            filled_at: Some(Utc::now()),
            cancelled_at: None,
            gap_percent: Decimal::ZERO,
            weight_percent: Decimal::ZERO,
            tp_percent: Decimal::ZERO,
            tp_price: Decimal::ZERO,
            tp_order_id: None,
            tp_hit: false,
            tp_executed_at: None,
            status: OrderStatus::Filled,
        };
        self.orders.create(&mut record).await.map_err(|e| OrderError::VerificationFailed(e.to_string()))?;
        Ok(record)
    }

    /// Cancels every entry order still `open`/`partially_filled`/
    /// `trigger_pending`, plus any TP record attached to a filled leg,
    /// clearing `tp_order_id` on legs whose TP gets cleared.
    pub async fn cancel_all_open_orders_for_group(&self, orders: &mut [DcaOrder]) -> Vec<Result<(), OrderError>> {
        let mut results = Vec::new();

        let tp_ids: Vec<Uuid> = orders.iter().filter_map(|o| o.tp_order_id).collect();
        for idx in 0..orders.len() {
            let status = orders[idx].status;
            let is_cancellable_entry = orders[idx].is_entry_leg()
                && matches!(status, OrderStatus::Open | OrderStatus::PartiallyFilled | OrderStatus::TriggerPending);
            let is_tp_record = orders[idx].leg_index == LEG_INDEX_TP_FILL
                && matches!(status, OrderStatus::Open | OrderStatus::PartiallyFilled)
                && tp_ids.contains(&orders[idx].id);

            if !is_cancellable_entry && !is_tp_record {
                continue;
            }
            if orders[idx].status == OrderStatus::TriggerPending {
                orders[idx].status = OrderStatus::Cancelled;
                orders[idx].cancelled_at = Some(Utc::now());
                results.push(self.orders.update(&orders[idx]).await.map_err(|e| OrderError::VerificationFailed(e.to_string())));
                continue;
            }

            let order_id = orders[idx].id;
            let mut order = orders[idx].clone();
            let outcome = self.cancel_with_verification(&mut order).await;
            orders[idx] = order;
            results.push(outcome.map(|_| ()));

            if is_tp_record {
                if let Some(parent) = orders.iter_mut().find(|o| o.tp_order_id == Some(order_id)) {
                    parent.tp_order_id = None;
                }
            }
        }

        results
    }

    /// Convenience: closes `group`'s remaining quantity at market on the
    /// opposite side from its recorded `side`.
    pub async fn close_position_market(
        &self,
        group: &PositionGroup,
        quantity: Decimal,
        guard: SlippageGuard,
    ) -> Result<DcaOrder, OrderError> {
        self.place_market_order(&group.symbol, group.side.opposite(), quantity, guard, group.id, Uuid::nil()).await
    }
}
