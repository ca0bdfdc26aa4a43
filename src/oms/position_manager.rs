//! `PositionManager`: creates position groups and pyramids from signals,
//! recomputes group statistics from fills, drives TP-mode-specific exit
//! logic, and processes exit signals (spec §4.2).
//!
//! The chronological-replay stats loop is structurally grounded in the
//! teacher's `oms/position_manager.rs::add_fill` FIFO accounting, generalized
//! from a per-symbol FIFO ladder to a per-group weighted average per spec §3
//! invariant 4.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::broadcaster::Broadcaster;
use crate::config::{DcaGridConfig, RiskEngineConfig};
use crate::domain::dca_order::{DcaOrder, OrderStatus};
use crate::domain::position_group::{PositionGroup, PositionStatus, TpMode};
use crate::domain::pyramid::{Pyramid, PyramidStatus};
use crate::error::{DomainError, Error, OrderError, RepositoryError};
use crate::grid::{self, leg_zero_starts_trigger_pending};
use crate::oms::order_service::{OrderService, SlippageGuard};
use crate::repository::{DcaOrderRepository, PositionRepository, PyramidRepository};
use crate::types::{ExchangeId, Side, Symbol, Timeframe};

/// The tradable asset a trading-pair symbol is denominated in (e.g. `BTC`
/// for `BTCUSDT` against quote currency `USDT`), used to look up the right
/// entry in a `fetch_free_balance` snapshot. Falls back to the whole symbol
/// if it doesn't carry the expected quote suffix.
fn base_asset(symbol: &str, quote_currency: &str) -> String {
    symbol.strip_suffix(quote_currency).unwrap_or(symbol).to_string()
}

/// Running state of a chronological fill replay (spec §3 invariant 4).
#[derive(Debug, Clone, Copy, Default)]
struct ReplayState {
    invested_usd: Decimal,
    quantity: Decimal,
    avg_entry: Decimal,
    realized_pnl_usd: Decimal,
}

/// Replays `orders`' filled legs in fill order (falling back to
/// `submitted_at` when `filled_at` is absent — this domain has no
/// per-order `created_at`, so `submitted_at` is the closest analogue).
/// Entry legs (`is_entry_leg`) increase the position; TP-fill and ad-hoc
/// close legs (the synthetic `leg_index` markers) realize PnL and reduce it.
fn replay_fills(side: Side, orders: &[DcaOrder]) -> ReplayState {
    let mut filled: Vec<&DcaOrder> = orders.iter().filter(|o| o.status == OrderStatus::Filled).collect();
    filled.sort_by_key(|o| o.filled_at.or(o.submitted_at));

    let mut state = ReplayState::default();
    for order in filled {
        let price = order.avg_fill_price.unwrap_or(order.price);
        if order.is_entry_leg() {
            state.invested_usd += order.filled_quantity * price;
            state.quantity += order.filled_quantity;
            state.avg_entry = if state.quantity > Decimal::ZERO {
                state.invested_usd / state.quantity
            } else {
                Decimal::ZERO
            };
        } else {
            let pnl_per_unit = match side {
                Side::Buy => price - state.avg_entry,
                Side::Sell => state.avg_entry - price,
            };
            let closed_qty = order.filled_quantity.min(state.quantity);
            state.realized_pnl_usd += pnl_per_unit * closed_qty;
            state.invested_usd -= state.avg_entry * closed_qty;
            state.quantity -= closed_qty;
            if state.quantity <= Decimal::ZERO {
                state.quantity = Decimal::ZERO;
                state.invested_usd = Decimal::ZERO;
                state.avg_entry = Decimal::ZERO;
            }
        }
    }
    state
}

pub struct PositionManager {
    order_service: Arc<OrderService>,
    positions: Arc<dyn PositionRepository>,
    pyramids: Arc<dyn PyramidRepository>,
    orders: Arc<dyn DcaOrderRepository>,
    broadcaster: Arc<dyn Broadcaster>,
    base_currency: String,
}

impl PositionManager {
    pub fn new(
        order_service: Arc<OrderService>,
        positions: Arc<dyn PositionRepository>,
        pyramids: Arc<dyn PyramidRepository>,
        orders: Arc<dyn DcaOrderRepository>,
        broadcaster: Arc<dyn Broadcaster>,
        base_currency: String,
    ) -> Self {
        Self { order_service, positions, pyramids, orders, broadcaster, base_currency }
    }

    /// Builds `DcaOrder` records (not yet persisted) for one pyramid wave
    /// from its computed, non-skipped grid legs.
    fn build_leg_orders(
        group_id: Uuid,
        pyramid_id: Uuid,
        symbol: &Symbol,
        side: Side,
        legs: &[grid::GridLeg],
        leg_zero_trigger_pending: bool,
    ) -> Vec<DcaOrder> {
        legs.iter()
            .filter(|leg| !leg.skip)
            .map(|leg| {
                let status = if leg.leg_index == 0 && leg_zero_trigger_pending {
                    OrderStatus::TriggerPending
                } else {
                    OrderStatus::Pending
                };
                let order_type = if leg.leg_index == 0 && leg_zero_trigger_pending {
                    crate::domain::dca_order::OrderType::Market
                } else {
                    crate::domain::dca_order::OrderType::Limit
                };
                DcaOrder {
                    id: Uuid::new_v4(),
                    group_id,
                    pyramid_id,
                    leg_index: leg.leg_index as i32,
                    symbol: symbol.as_str().to_string(),
                    side,
                    order_type,
                    price: leg.price,
                    quantity: leg.quantity,
                    exchange_order_id: None,
                    filled_quantity: Decimal::ZERO,
                    avg_fill_price: None,
                    fee: Decimal::ZERO,
                    fee_currency: None,
                    submitted_at: None,
                    filled_at: None,
                    cancelled_at: None,
                    gap_percent: leg.gap_percent,
                    weight_percent: leg.weight_percent,
                    tp_percent: leg.tp_percent,
                    tp_price: leg.tp_price,
                    tp_order_id: None,
                    tp_hit: false,
                    tp_executed_at: None,
                    status,
                }
            })
            .collect()
    }

    /// Spec §4.2 "create position group from signal", steps 2-9 (step 1,
    /// user/credential resolution, is a composition-root concern).
    #[allow(clippy::too_many_arguments)]
    pub async fn create_position_group_from_signal(
        &self,
        user_id: Uuid,
        exchange: ExchangeId,
        symbol: Symbol,
        timeframe: Timeframe,
        side: Side,
        base_entry_price: Decimal,
        config: &DcaGridConfig,
    ) -> Result<PositionGroup, Error> {
        let precision = self.order_service.precision_for(&symbol).await;
        let legs = grid::compute_grid_legs(config, 0, base_entry_price, side, precision);
        let eligible: Vec<_> = legs.iter().filter(|l| !l.skip).collect();

        let mut group = PositionGroup {
            id: Uuid::new_v4(),
            user_id,
            exchange,
            symbol: symbol.clone(),
            timeframe,
            side,
            base_entry_price,
            weighted_avg_entry: Decimal::ZERO,
            total_invested_usd: Decimal::ZERO,
            total_filled_quantity: Decimal::ZERO,
            unrealized_pnl_usd: Decimal::ZERO,
            unrealized_pnl_pct: Decimal::ZERO,
            realized_pnl_usd: Decimal::ZERO,
            total_dca_legs: eligible.len() as u32,
            filled_dca_legs: 0,
            pyramid_count: 1,
            max_pyramids: config.max_pyramids,
            tp_mode: config.tp_mode,
            tp_aggregate_percent: config.tp_aggregate_percent,
            risk_blocked: false,
            risk_skip_once: false,
            risk_timer_start: None,
            risk_timer_expires: None,
            status: PositionStatus::Live,
            created_at: Utc::now(),
            closed_at: None,
            telegram_message_id: None,
        };

        self.positions.create(&group).await.map_err(|e| match e {
            RepositoryError::UniqueViolation(_) => Error::Domain(DomainError::DuplicatePosition),
            other => Error::Repository(other),
        })?;

        let mut pyramid = Pyramid {
            id: Uuid::new_v4(),
            group_id: group.id,
            pyramid_index: 0,
            entry_price: base_entry_price,
            status: PyramidStatus::Pending,
            dca_config: config.clone(),
            created_at: Utc::now(),
        };
        self.pyramids.create(&pyramid).await?;

        let leg_zero_trigger = leg_zero_starts_trigger_pending(config);
        let mut leg_orders = Self::build_leg_orders(group.id, pyramid.id, &symbol, side, &legs, leg_zero_trigger);
        for order in &mut leg_orders {
            self.orders.create(order).await?;
        }

        let mut any_submission_failed = false;
        for order in &mut leg_orders {
            if order.status != OrderStatus::Pending {
                continue;
            }
            if let Err(err) = self.order_service.submit_order(order).await {
                tracing::warn!(group_id = %group.id, error = %err, "leg submission failed during group creation");
                any_submission_failed = true;
            }
        }

        pyramid.status = PyramidStatus::Submitted;
        self.pyramids.update(&pyramid).await?;

        if any_submission_failed && leg_orders.iter().all(|o| o.status == OrderStatus::Failed) {
            group.status = PositionStatus::Failed;
            self.positions.update(&group).await?;
        }

        self.broadcaster.send_entry_signal(&group).await;
        Ok(group)
    }

    /// Spec §4.2 "pyramid continuation". Uses the atomic
    /// `increment_pyramid_count` to avoid a lost-update race between
    /// concurrent continuation signals for the same group.
    pub async fn continue_pyramid(
        &self,
        group: &mut PositionGroup,
        grid_config: &DcaGridConfig,
        risk_config: &RiskEngineConfig,
        current_price: Decimal,
    ) -> Result<Pyramid, Error> {
        let precision = self.order_service.precision_for(&group.symbol).await;
        let pyramid_index = group.pyramid_count;
        let legs = grid::compute_grid_legs(grid_config, pyramid_index, current_price, group.side, precision);
        let eligible: Vec<_> = legs.iter().filter(|l| !l.skip).collect();
        let additional = eligible.len() as u32;

        let new_count = self.positions.increment_pyramid_count(group.id, additional).await?;
        group.pyramid_count = new_count;
        group.total_dca_legs += additional;

        let mut pyramid = Pyramid {
            id: Uuid::new_v4(),
            group_id: group.id,
            pyramid_index,
            entry_price: current_price,
            status: PyramidStatus::Pending,
            dca_config: grid_config.clone(),
            created_at: Utc::now(),
        };
        self.pyramids.create(&pyramid).await?;

        let leg_zero_trigger = leg_zero_starts_trigger_pending(grid_config);
        let mut leg_orders =
            Self::build_leg_orders(group.id, pyramid.id, &group.symbol, group.side, &legs, leg_zero_trigger);
        for order in &mut leg_orders {
            self.orders.create(order).await?;
        }
        for order in &mut leg_orders {
            if order.status != OrderStatus::Pending {
                continue;
            }
            if let Err(err) = self.order_service.submit_order(order).await {
                tracing::warn!(group_id = %group.id, error = %err, "leg submission failed during pyramid continuation");
            }
        }

        pyramid.status = PyramidStatus::Submitted;
        self.pyramids.update(&pyramid).await?;

        // A timer is reset to a fresh window only if one was already
        // running; a continuation arriving before any timer has started
        // never spuriously starts one early.
        if risk_config.reset_timer_on_replacement && group.risk_timer_start.is_some() {
            let now = Utc::now();
            group.risk_timer_start = Some(now);
            group.risk_timer_expires = Some(now + chrono::Duration::minutes(risk_config.post_full_wait_minutes as i64));
        }

        self.positions.update(group).await?;
        self.broadcaster.send_pyramid_added(group, pyramid_index).await;
        Ok(pyramid)
    }

    /// Spec §4.2 "update position stats". Caller is responsible for holding
    /// `group_id`'s lock from [`crate::oms::group_lock::GroupLocks`] (spec
    /// §5) across this call, so this read-compute-write sequence never
    /// interleaves with a concurrent risk-engine offset on the same group.
    /// `FillMonitor::process_group` and `RiskEngine::execute_offset` are the
    /// two current holders.
    pub async fn update_position_stats(
        &self,
        group: &mut PositionGroup,
        pyramids: &mut [Pyramid],
        orders: &mut [DcaOrder],
        current_price: Decimal,
    ) -> Result<(), Error> {
        for pyramid in pyramids.iter_mut() {
            let pyramid_orders: Vec<&DcaOrder> = orders.iter().filter(|o| o.pyramid_id == pyramid.id).collect();
            if pyramid_orders.is_empty() {
                continue;
            }
            let any_active = pyramid_orders
                .iter()
                .any(|o| matches!(o.status, OrderStatus::Open | OrderStatus::Filled | OrderStatus::PartiallyFilled));
            if pyramid.status == PyramidStatus::Pending && any_active {
                pyramid.status = PyramidStatus::Submitted;
                self.pyramids.update(pyramid).await?;
            }
            let all_filled = pyramid_orders.iter().all(|o| o.status == OrderStatus::Filled);
            if all_filled && pyramid.status != PyramidStatus::Filled {
                pyramid.status = PyramidStatus::Filled;
                self.pyramids.update(pyramid).await?;
            }
        }

        let replay = replay_fills(group.side, orders);
        group.total_invested_usd = replay.invested_usd;
        group.total_filled_quantity = replay.quantity;
        group.weighted_avg_entry = replay.avg_entry;
        group.realized_pnl_usd = replay.realized_pnl_usd;

        group.filled_dca_legs = orders.iter().filter(|o| o.counts_as_filled_entry()).count() as u32;

        group.unrealized_pnl_usd = match group.side {
            Side::Buy => (current_price - replay.avg_entry) * replay.quantity,
            Side::Sell => (replay.avg_entry - current_price) * replay.quantity,
        };
        group.unrealized_pnl_pct = if replay.invested_usd > Decimal::ZERO {
            group.unrealized_pnl_usd / replay.invested_usd * Decimal::from(100)
        } else {
            Decimal::ZERO
        };

        let old_status = group.status;
        if matches!(group.status, PositionStatus::Live | PositionStatus::PartiallyFilled) {
            if group.total_dca_legs > 0 && group.filled_dca_legs == group.total_dca_legs {
                group.status = PositionStatus::Active;
            } else if group.status == PositionStatus::Live && group.filled_dca_legs > 0 {
                group.status = PositionStatus::PartiallyFilled;
            }
        }
        if group.should_auto_close() {
            group.status = PositionStatus::Closed;
            group.closed_at = Some(Utc::now());
            let _ = self.order_service.cancel_all_open_orders_for_group(orders).await;
        }
        if old_status != group.status {
            self.broadcaster.send_status_change(group, &format!("{old_status:?}"), &format!("{:?}", group.status)).await;
        }

        if group.status != PositionStatus::Closed {
            match group.tp_mode {
                TpMode::Aggregate | TpMode::Hybrid => {
                    self.maybe_close_aggregate_tp(group, orders, current_price).await?;
                }
                TpMode::PyramidAggregate => {
                    self.evaluate_pyramid_aggregate(group, pyramids, orders, current_price).await?;
                }
                TpMode::PerLeg => {}
            }
        }

        self.positions.update(group).await?;
        Ok(())
    }

    async fn maybe_close_aggregate_tp(
        &self,
        group: &mut PositionGroup,
        orders: &mut [DcaOrder],
        current_price: Decimal,
    ) -> Result<(), Error> {
        let Some(tp_pct) = group.tp_aggregate_percent else { return Ok(()) };
        if group.total_filled_quantity <= Decimal::ZERO {
            return Ok(());
        }
        let target = match group.side {
            Side::Buy => group.weighted_avg_entry * (Decimal::ONE + tp_pct / Decimal::from(100)),
            Side::Sell => group.weighted_avg_entry * (Decimal::ONE - tp_pct / Decimal::from(100)),
        };
        let reached = match group.side {
            Side::Buy => current_price >= target,
            Side::Sell => current_price <= target,
        };
        if !reached {
            return Ok(());
        }

        let _ = self.order_service.cancel_all_open_orders_for_group(orders).await;
        let quantity = group.total_filled_quantity;
        match self.order_service.close_position_market(group, quantity, SlippageGuard::none()).await {
            Ok(_) => {
                group.status = PositionStatus::Closed;
                group.closed_at = Some(Utc::now());
                group.total_filled_quantity = Decimal::ZERO;
                group.unrealized_pnl_usd = Decimal::ZERO;
                group.unrealized_pnl_pct = Decimal::ZERO;
                self.broadcaster.send_tp_hit(group, -1, target).await;
            }
            Err(err) => {
                tracing::warn!(group_id = %group.id, error = %err, "aggregate tp market close failed");
            }
        }
        Ok(())
    }

    async fn evaluate_pyramid_aggregate(
        &self,
        group: &mut PositionGroup,
        pyramids: &mut [Pyramid],
        orders: &mut [DcaOrder],
        current_price: Decimal,
    ) -> Result<(), Error> {
        for pyramid in pyramids.iter_mut() {
            if pyramid.status == PyramidStatus::Filled {
                continue;
            }
            let pyramid_order_ids: Vec<Uuid> = orders
                .iter()
                .filter(|o| o.pyramid_id == pyramid.id && o.is_entry_leg() && o.status == OrderStatus::Filled && !o.tp_hit)
                .map(|o| o.id)
                .collect();
            if pyramid_order_ids.is_empty() {
                continue;
            }
            let fills: Vec<(Decimal, Decimal)> = orders
                .iter()
                .filter(|o| pyramid_order_ids.contains(&o.id))
                .map(|o| (o.avg_fill_price.unwrap_or(o.price), o.filled_quantity))
                .collect();
            let Some(avg) = grid::pyramid_weighted_avg_entry(&fills) else { continue };

            let tp_pct = pyramid
                .dca_config
                .pyramid_tp_percents
                .get(&(pyramid.pyramid_index as usize))
                .copied()
                .or(group.tp_aggregate_percent);
            let Some(tp_pct) = tp_pct else { continue };

            let target = match group.side {
                Side::Buy => avg * (Decimal::ONE + tp_pct / Decimal::from(100)),
                Side::Sell => avg * (Decimal::ONE - tp_pct / Decimal::from(100)),
            };
            let reached = match group.side {
                Side::Buy => current_price >= target,
                Side::Sell => current_price <= target,
            };
            if !reached {
                continue;
            }

            let total_qty: Decimal = fills.iter().map(|(_, q)| *q).sum();

            let tp_ids_to_cancel: Vec<Uuid> = orders
                .iter()
                .filter(|o| pyramid_order_ids.contains(&o.id))
                .filter_map(|o| o.tp_order_id)
                .collect();
            for tp_id in tp_ids_to_cancel {
                if let Some(pos) = orders.iter().position(|o| o.id == tp_id) {
                    let mut tp_record = orders[pos].clone();
                    let _ = self.order_service.cancel_with_verification(&mut tp_record).await;
                    orders[pos] = tp_record;
                }
            }

            for order in orders.iter_mut().filter(|o| pyramid_order_ids.contains(&o.id)) {
                order.tp_hit = true;
                order.tp_executed_at = Some(Utc::now());
                self.orders.update(order).await?;
            }

            match self.order_service.close_position_market(group, total_qty, SlippageGuard::none()).await {
                Ok(_) => {
                    pyramid.status = PyramidStatus::Filled;
                    self.pyramids.update(pyramid).await?;
                    self.broadcaster.send_tp_hit(group, pyramid.pyramid_index as i32, target).await;
                }
                Err(err) => {
                    tracing::warn!(group_id = %group.id, pyramid_index = pyramid.pyramid_index, error = %err, "pyramid aggregate tp close failed");
                }
            }
        }

        if !pyramids.is_empty() && pyramids.iter().all(|p| p.status == PyramidStatus::Filled) {
            group.status = PositionStatus::Closed;
            group.closed_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Spec §4.2 "handle exit signal". Idempotent: returns immediately if
    /// the group is already closed.
    pub async fn handle_exit_signal(&self, group: &mut PositionGroup, orders: &mut [DcaOrder]) -> Result<(), Error> {
        if group.status == PositionStatus::Closed {
            return Ok(());
        }

        group.status = PositionStatus::Closing;
        self.positions.update(group).await?;
        let _ = self.order_service.cancel_all_open_orders_for_group(orders).await;

        let replay = replay_fills(group.side, orders);
        if replay.quantity <= Decimal::ZERO {
            group.status = PositionStatus::Closed;
            group.closed_at = Some(Utc::now());
            group.total_filled_quantity = Decimal::ZERO;
            self.positions.update(group).await?;
            return Ok(());
        }

        let mut quantity = replay.quantity;
        let close_result = self
            .order_service
            .close_position_market(group, quantity, SlippageGuard::none())
            .await;

        let closed_order = match close_result {
            Ok(order) => order,
            Err(OrderError::Exchange(exch_err)) if exch_err.mentions_insufficient_balance() => {
                let asset = base_asset(group.symbol.as_str(), &self.base_currency);
                let available = self
                    .order_service
                    .fetch_free_balance()
                    .await
                    .ok()
                    .and_then(|balances| balances.get(&asset).copied())
                    .unwrap_or(Decimal::ZERO);
                quantity = quantity.min(available);
                self.order_service
                    .close_position_market(group, quantity, SlippageGuard::none())
                    .await
                    .map_err(Error::Order)?
            }
            Err(err) => return Err(Error::Order(err)),
        };

        let exit_price = closed_order.avg_fill_price.unwrap_or(closed_order.price);
        let pnl_per_unit = match group.side {
            Side::Buy => exit_price - replay.avg_entry,
            Side::Sell => replay.avg_entry - exit_price,
        };
        group.realized_pnl_usd += pnl_per_unit * quantity;
        group.unrealized_pnl_usd = Decimal::ZERO;
        group.unrealized_pnl_pct = Decimal::ZERO;
        group.total_filled_quantity = Decimal::ZERO;
        group.status = PositionStatus::Closed;
        group.closed_at = Some(Utc::now());
        self.positions.update(group).await?;
        self.broadcaster.send_exit_signal(group, group.realized_pnl_usd).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExchangeId;
    use rust_decimal_macros::dec;

    fn filled_entry(side: Side, price: Decimal, qty: Decimal, filled_at_secs: i64) -> DcaOrder {
        DcaOrder {
            id: Uuid::new_v4(),
            group_id: Uuid::new_v4(),
            pyramid_id: Uuid::new_v4(),
            leg_index: 0,
            symbol: "BTCUSDT".into(),
            side,
            order_type: crate::domain::dca_order::OrderType::Limit,
            price,
            quantity: qty,
            exchange_order_id: Some("x".into()),
            filled_quantity: qty,
            avg_fill_price: Some(price),
            fee: Decimal::ZERO,
            fee_currency: None,
            submitted_at: Some(Utc::now()),
            filled_at: Some(Utc::now() + chrono::Duration::seconds(filled_at_secs)),
            cancelled_at: None,
            gap_percent: Decimal::ZERO,
            weight_percent: Decimal::ZERO,
            tp_percent: Decimal::ZERO,
            tp_price: Decimal::ZERO,
            tp_order_id: None,
            tp_hit: false,
            tp_executed_at: None,
            status: OrderStatus::Filled,
        }
    }

    #[test]
    fn replay_computes_weighted_average_across_two_entries() {
        let orders = vec![
            filled_entry(Side::Buy, dec!(100), dec!(1), 0),
            filled_entry(Side::Buy, dec!(90), dec!(1), 1),
        ];
        let state = replay_fills(Side::Buy, &orders);
        assert_eq!(state.avg_entry, dec!(95));
        assert_eq!(state.quantity, dec!(2));
    }

    #[test]
    fn replay_realizes_pnl_on_exit_leg() {
        let mut exit = filled_entry(Side::Buy, dec!(110), dec!(1), 1);
        exit.leg_index = crate::domain::dca_order::LEG_INDEX_TP_FILL;
        exit.side = Side::Sell;
        let orders = vec![filled_entry(Side::Buy, dec!(100), dec!(1), 0), exit];
        let state = replay_fills(Side::Buy, &orders);
        assert_eq!(state.realized_pnl_usd, dec!(10));
        assert_eq!(state.quantity, Decimal::ZERO);
    }

    #[test]
    fn exchange_id_roundtrip_sanity() {
        assert_eq!(ExchangeId::new("binance").as_str(), "binance");
    }
}
