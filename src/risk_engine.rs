//! `RiskEngine`: per-user policy enforcement and cross-position offset
//! execution (spec §4.4).
//!
//! The periodic-loop shape mirrors `FillMonitor::run` (itself grounded in
//! the teacher's `commands/live.rs::run_async`); the threshold/selection
//! semantics (timer discipline, loser/winner selection, partial-close sizing)
//! are grounded in `examples/original_source/risk_engine.py`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use tokio::sync::watch;
use uuid::Uuid;

use crate::broadcaster::Broadcaster;
use crate::config::{RiskEngineConfig, TimerStartCondition};
use crate::domain::position_group::PositionGroup;
use crate::domain::risk_action::{ActionType, RiskAction, WinnerDetail};
use crate::error::Error;
use crate::exchange::{ExchangeConnector, Ticker};
use crate::grid::round_down_to_increment;
use crate::oms::group_lock::GroupLocks;
use crate::oms::order_service::{OrderService, SlippageGuard};
use crate::repository::{Repositories, UserConfig};
use crate::types::{ExchangeId, Symbol};

/// Reasons a pre-trade check can reject a signal, carried back to the
/// webhook/queue caller as a rejection reason (spec §4.4 "Pre-trade risk
/// check").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreTradeRejection {
    EngineStopped,
    EngineAutoPaused,
    MaxPositionsForSymbolReached,
    MaxTotalExposureExceeded,
    MaxRealizedLossBreached,
}

/// Per-exchange services a `RiskEngine` cycle needs to act on offsets: the
/// connector's owning `OrderService` plus its precision source. One per
/// exchange, shared with `FillMonitor`'s `ExchangeServices` at the
/// composition root.
pub struct RiskExchangeServices {
    pub connector: Arc<dyn ExchangeConnector>,
    pub order_service: Arc<OrderService>,
}

pub struct RiskEngine {
    repos: Repositories,
    broadcaster: Arc<dyn Broadcaster>,
    services: HashMap<ExchangeId, RiskExchangeServices>,
    poll_interval: Duration,
    /// Shared with `FillMonitor` at the composition root (spec §5): held
    /// for every group an offset touches so a concurrent
    /// `update_position_stats` on the same group can't interleave with it.
    group_locks: GroupLocks,
}

impl RiskEngine {
    pub fn new(
        repos: Repositories,
        broadcaster: Arc<dyn Broadcaster>,
        services: HashMap<ExchangeId, RiskExchangeServices>,
        poll_interval: Duration,
        group_locks: GroupLocks,
    ) -> Self {
        Self { repos, broadcaster, services, poll_interval, group_locks }
    }

    /// **Pre-trade risk check** (spec §4.4): order-independent gates run
    /// before a queued signal is promoted. Max global position count is
    /// deliberately *not* re-checked here — it is delegated to the external
    /// execution-pool gate (spec §9 open question 2); this coupling must be
    /// preserved or removed in both places atomically.
    pub async fn pre_trade_check(
        &self,
        user_config: &UserConfig,
        exchange: &ExchangeId,
        symbol: &Symbol,
        timeframe_str: &str,
        allocated_capital_usd: Decimal,
    ) -> Result<(), PreTradeRejection> {
        if user_config.engine_force_stopped {
            return Err(PreTradeRejection::EngineStopped);
        }
        if user_config.engine_paused_by_loss_limit {
            return Err(PreTradeRejection::EngineAutoPaused);
        }

        let active = self
            .repos
            .positions
            .get_active_position_groups_for_user(user_config.user_id)
            .await
            .unwrap_or_default();

        let same_symbol_count = active
            .iter()
            .filter(|g| &g.exchange == exchange && &g.symbol == symbol && g.timeframe.0 == timeframe_str)
            .count() as u32;
        if same_symbol_count >= user_config.risk_engine_config.max_positions_per_symbol_timeframe_exchange {
            return Err(PreTradeRejection::MaxPositionsForSymbolReached);
        }

        let current_exposure: Decimal = active.iter().map(|g| g.total_invested_usd).sum();
        if current_exposure + allocated_capital_usd > user_config.risk_engine_config.max_total_exposure_usd {
            return Err(PreTradeRejection::MaxTotalExposureExceeded);
        }

        let daily_pnl = self
            .repos
            .positions
            .get_daily_realized_pnl(user_config.user_id)
            .await
            .unwrap_or(Decimal::ZERO);
        if daily_pnl < Decimal::ZERO && daily_pnl.abs() >= user_config.risk_engine_config.max_realized_loss_usd {
            return Err(PreTradeRejection::MaxRealizedLossBreached);
        }

        Ok(())
    }

    /// **Timer discipline** (spec §4.4): starts the risk timer the first
    /// time `timer_start_condition` is satisfied. Never shortens an existing
    /// timer; `continue_pyramid` (in `PositionManager`) handles the
    /// `reset_timer_on_replacement` reset path separately.
    pub fn maybe_start_timer(group: &mut PositionGroup, config: &RiskEngineConfig, all_submitted: bool, all_filled: bool) {
        if group.risk_timer_start.is_some() {
            return;
        }
        let satisfied = match config.timer_start_condition {
            TimerStartCondition::After5Pyramids => group.pyramid_count >= 5,
            TimerStartCondition::AfterAllDcaSubmitted => all_submitted,
            TimerStartCondition::AfterAllDcaFilled => all_filled,
        };
        if !satisfied {
            return;
        }
        let now = Utc::now();
        group.risk_timer_start = Some(now);
        group.risk_timer_expires = Some(now + ChronoDuration::minutes(config.post_full_wait_minutes as i64));
    }

    /// **Loser/winner selection** (spec §4.4): among `positions`, the
    /// eligible loser with the largest absolute unrealized loss, and winners
    /// sorted descending by PnL and capped at `max_winners_to_combine`.
    fn select_loser_and_winners<'a>(
        positions: &'a [PositionGroup],
        config: &RiskEngineConfig,
        now: chrono::DateTime<Utc>,
    ) -> Option<(&'a PositionGroup, Vec<&'a PositionGroup>)> {
        let loser = positions
            .iter()
            .filter(|g| {
                !g.risk_blocked
                    && !g.risk_skip_once
                    && g.risk_timer_expires.is_some_and(|exp| exp <= now)
                    && g.pyramid_count >= config.required_pyramids_for_timer
                    && g.unrealized_pnl_pct <= config.loss_threshold_percent
            })
            .min_by_key(|g| g.unrealized_pnl_usd)?;

        let mut winners: Vec<&PositionGroup> = positions
            .iter()
            .filter(|g| g.id != loser.id && g.unrealized_pnl_usd > Decimal::ZERO)
            .collect();
        winners.sort_by(|a, b| b.unrealized_pnl_usd.cmp(&a.unrealized_pnl_usd));
        winners.truncate(config.max_winners_to_combine as usize);

        Some((loser, winners))
    }

    /// **Partial-close quantity calculation** (spec §4.4), for one winner
    /// against a remaining USD requirement. Returns `None` when the winner
    /// must be skipped entirely (non-positive edge, below minimum notional,
    /// or would fully close the winner).
    fn partial_close_quantity(
        winner: &PositionGroup,
        current_price: Decimal,
        required_usd_remaining: Decimal,
        step_size: Decimal,
        min_notional: Decimal,
    ) -> Option<Decimal> {
        let profit_per_unit = match winner.side {
            crate::types::Side::Buy => current_price - winner.weighted_avg_entry,
            crate::types::Side::Sell => winner.weighted_avg_entry - current_price,
        };
        if profit_per_unit <= Decimal::ZERO {
            return None;
        }
        let raw_quantity = required_usd_remaining / profit_per_unit;
        let quantity = round_down_to_increment(raw_quantity, step_size);
        if quantity <= Decimal::ZERO {
            return None;
        }
        if quantity * current_price < min_notional {
            return None;
        }
        if quantity >= winner.total_filled_quantity {
            return None;
        }
        Some(quantity)
    }

    /// **Execution** (spec §4.4): closes the loser in full and partially
    /// closes winners until `required_usd` is covered or winners are
    /// exhausted, concurrently, then records one `RiskAction` snapshot and
    /// broadcasts an "offset executed" event.
    async fn execute_offset(
        &self,
        user_id: Uuid,
        loser: &PositionGroup,
        winners: &[&PositionGroup],
        tickers: &HashMap<Symbol, Ticker>,
    ) -> Result<(), Error> {
        let Some(services) = self.services.get(&loser.exchange) else {
            tracing::warn!(%user_id, exchange = %loser.exchange, "risk engine: no order service for loser's exchange");
            return Ok(());
        };

        // Held across the whole offset (order placement through the final
        // position-group write) so FillMonitor's concurrent
        // update_position_stats never interleaves with it for any group
        // this offset touches. Sorted by id: execute_offset is the only
        // caller that ever holds more than one group lock at a time, and a
        // stable acquisition order rules out a deadlock against itself.
        let mut lock_ids: Vec<Uuid> = std::iter::once(loser.id).chain(winners.iter().map(|w| w.id)).collect();
        lock_ids.sort();
        lock_ids.dedup();
        let mut _group_guards = Vec::with_capacity(lock_ids.len());
        for id in lock_ids {
            _group_guards.push(self.group_locks.lock(id).await);
        }

        let required_usd = loser.unrealized_pnl_usd.abs();
        let mut remaining = required_usd;
        let mut winner_plans: Vec<(&PositionGroup, Decimal)> = Vec::new();

        for winner in winners {
            if remaining <= Decimal::ZERO {
                break;
            }
            let Some(winner_services) = self.services.get(&winner.exchange) else { continue };
            let current_price = tickers.get(&winner.symbol).map(|t| t.last).unwrap_or(winner.weighted_avg_entry);
            let precision = winner_services.order_service.precision_for(&winner.symbol).await;
            let Some(quantity) = Self::partial_close_quantity(
                winner,
                current_price,
                remaining,
                precision.step_size,
                precision.min_notional,
            ) else {
                continue;
            };
            let achieved_usd = quantity
                * match winner.side {
                    crate::types::Side::Buy => current_price - winner.weighted_avg_entry,
                    crate::types::Side::Sell => winner.weighted_avg_entry - current_price,
                };
            remaining -= achieved_usd;
            winner_plans.push((winner, quantity));
        }

        let loser_order_service = Arc::clone(&services.order_service);
        let loser_clone = loser.clone();
        let loser_quantity = loser.total_filled_quantity;
        let loser_task = tokio::spawn(async move {
            loser_order_service.close_position_market(&loser_clone, loser_quantity, SlippageGuard::none()).await
        });

        let mut winner_tasks = Vec::with_capacity(winner_plans.len());
        for (winner, quantity) in &winner_plans {
            let order_service = Arc::clone(&self.services.get(&winner.exchange).expect("winner exchange service presence checked above").order_service);
            let winner_clone = winner.clone();
            let quantity = *quantity;
            winner_tasks.push(tokio::spawn(async move {
                order_service.close_position_market(&winner_clone, quantity, SlippageGuard::none()).await
            }));
        }

        let loser_result = loser_task.await.map_err(|e| Error::Repository(crate::error::RepositoryError::Join(e.to_string())))?;
        let mut winner_results = Vec::with_capacity(winner_tasks.len());
        for task in winner_tasks {
            winner_results.push(task.await.map_err(|e| Error::Repository(crate::error::RepositoryError::Join(e.to_string())))?);
        }

        let mut winner_details = Vec::new();
        for ((winner, quantity), result) in winner_plans.iter().zip(winner_results) {
            match result {
                Ok(order) => {
                    winner_details.push(WinnerDetail {
                        group_id: winner.id,
                        symbol: winner.symbol.clone(),
                        pnl_usd: order.filled_quantity * order.avg_fill_price.unwrap_or(order.price)
                            - order.filled_quantity * winner.weighted_avg_entry,
                        quantity_closed: *quantity,
                    });
                }
                Err(err) => {
                    tracing::warn!(%user_id, group_id = %winner.id, error = %err, "risk engine: winner partial close failed");
                }
            }
        }

        if let Err(err) = loser_result {
            tracing::error!(%user_id, group_id = %loser.id, error = %err, "risk engine: loser close failed");
            return Ok(());
        }

        let action = RiskAction {
            id: Uuid::new_v4(),
            user_id,
            timestamp: Utc::now(),
            action_type: ActionType::RiskOffsetClose,
            loser_group_id: loser.id,
            loser_symbol: loser.symbol.clone(),
            loser_pnl_usd: loser.unrealized_pnl_usd,
            winner_details,
            notes: None,
        };
        self.repos.risk_actions.create(&action).await?;

        let mut closed_loser = loser.clone();
        closed_loser.status = crate::domain::position_group::PositionStatus::Closed;
        closed_loser.closed_at = Some(Utc::now());
        closed_loser.realized_pnl_usd += closed_loser.unrealized_pnl_usd;
        closed_loser.unrealized_pnl_usd = Decimal::ZERO;
        closed_loser.unrealized_pnl_pct = Decimal::ZERO;
        closed_loser.total_filled_quantity = Decimal::ZERO;
        closed_loser.risk_skip_once = false;
        self.repos.positions.update(&closed_loser).await?;

        let summary = format!("offset executed: loser {} covered by {} winner(s)", loser.symbol, action.winner_details.len());
        self.broadcaster.send_risk_event(user_id, ActionType::RiskOffsetClose, &summary).await;

        Ok(())
    }

    /// One user's evaluation: select a loser/winner set from this user's
    /// active positions and execute the offset if one qualifies. Spec §4.4:
    /// "exceptions inside a user's evaluation roll back that user's
    /// transaction and continue with the next user" — callers in
    /// `evaluate_all_users` already isolate failures per user; this method
    /// simply returns `Err` rather than partially mutating state on failure.
    pub async fn evaluate_user(&self, user_id: Uuid) -> Result<(), Error> {
        let Some(user_config) = self.repos.user_config.get(user_id).await? else { return Ok(()) };
        let positions = self.repos.positions.get_active_position_groups_for_user(user_id).await?;
        if positions.is_empty() {
            return Ok(());
        }

        // Ticker snapshot: one fetch per exchange represented among this
        // user's active positions.
        let mut tickers: HashMap<Symbol, Ticker> = HashMap::new();
        let mut seen_exchanges = std::collections::HashSet::new();
        for group in &positions {
            if !seen_exchanges.insert(group.exchange.clone()) {
                continue;
            }
            if let Some(services) = self.services.get(&group.exchange) {
                if let Ok(fetched) = services.connector.get_all_tickers().await {
                    tickers.extend(fetched);
                }
            }
        }

        let mut positions = positions;
        for group in positions.iter_mut() {
            if group.risk_timer_start.is_some() {
                continue;
            }
            let orders = self.repos.orders.get_all_orders_by_group_id(group.id).await.unwrap_or_default();
            let entry_orders: Vec<_> = orders.iter().filter(|o| o.is_entry_leg()).collect();
            if entry_orders.is_empty() {
                continue;
            }
            let all_submitted = entry_orders.iter().all(|o| o.submitted_at.is_some());
            let all_filled = entry_orders.iter().all(|o| o.status == crate::domain::dca_order::OrderStatus::Filled);
            Self::maybe_start_timer(group, &user_config.risk_engine_config, all_submitted, all_filled);
            if group.risk_timer_start.is_some() {
                self.repos.positions.update(group).await?;
            }
        }

        let Some((loser, winners)) = Self::select_loser_and_winners(&positions, &user_config.risk_engine_config, Utc::now()) else {
            return Ok(());
        };

        self.execute_offset(user_id, loser, &winners, &tickers).await
    }

    /// Periodic evaluation across every active user. Spec §5: "across users:
    /// fully independent; failures in one user's cycle never affect
    /// another."
    pub async fn evaluate_all_users(&self) -> Result<(), Error> {
        let user_ids = self.repos.user_config.get_all_active_user_ids().await?;
        for user_id in user_ids {
            if let Err(err) = self.evaluate_user(user_id).await {
                tracing::error!(%user_id, error = %err, "risk engine: user evaluation failed, continuing");
            }
        }
        Ok(())
    }

    /// Runs `evaluate_all_users` at `poll_interval` until `shutdown` reports
    /// `true`. Shape mirrors `FillMonitor::run`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.evaluate_all_users().await {
                        tracing::error!(error = %err, "risk engine cycle failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("risk engine shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Clears a user-set `risk_blocked` or `risk_skip_once` flag on a group
    /// (CLI admin surface, spec §6).
    pub async fn set_risk_flag(&self, group_id: Uuid, blocked: bool, skip_once: bool) -> Result<(), Error> {
        let Some(mut group) = self.repos.positions.get(group_id).await? else {
            return Err(Error::Domain(crate::error::DomainError::PositionGroupNotFound(group_id.to_string())));
        };
        group.risk_blocked = blocked;
        group.risk_skip_once = skip_once;
        self.repos.positions.update(&group).await?;
        Ok(())
    }

    /// **Sync-with-exchange** (spec §4.4): reconciles a user's active
    /// positions' unrealized PnL against a fresh exchange ticker snapshot,
    /// logging a correction whenever the locally-stored mark and the fresh
    /// mark diverge by more than `divergence_threshold_percent`.
    pub async fn sync_with_exchange(&self, user_id: Uuid, divergence_threshold_percent: Decimal) -> Result<(), Error> {
        let positions = self.repos.positions.get_active_position_groups_for_user(user_id).await?;
        for group in positions {
            let Some(services) = self.services.get(&group.exchange) else { continue };
            let Ok(current_price) = services.connector.get_current_price(&group.symbol).await else { continue };
            if group.weighted_avg_entry <= Decimal::ZERO {
                continue;
            }
            let fresh_pct = match group.side {
                crate::types::Side::Buy => (current_price - group.weighted_avg_entry) / group.weighted_avg_entry * Decimal::from(100),
                crate::types::Side::Sell => (group.weighted_avg_entry - current_price) / group.weighted_avg_entry * Decimal::from(100),
            };
            let divergence = (fresh_pct - group.unrealized_pnl_pct).abs();
            if divergence > divergence_threshold_percent {
                tracing::warn!(
                    group_id = %group.id,
                    stored_pct = %group.unrealized_pnl_pct,
                    fresh_pct = %fresh_pct,
                    "risk engine: exchange sync found diverging unrealized pnl"
                );
            }
        }
        Ok(())
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::position_group::{PositionStatus, TpMode};
    use crate::types::{Side, Timeframe};
    use rust_decimal_macros::dec;

    fn sample(id_seed: u8, pnl: Decimal, side: Side) -> PositionGroup {
        PositionGroup {
            id: Uuid::from_bytes([id_seed; 16]),
            user_id: Uuid::nil(),
            exchange: ExchangeId::new("binance"),
            symbol: Symbol::new("BTCUSDT"),
            timeframe: Timeframe::new("60m"),
            side,
            base_entry_price: dec!(100),
            weighted_avg_entry: dec!(100),
            total_invested_usd: dec!(500),
            total_filled_quantity: dec!(5),
            unrealized_pnl_usd: pnl,
            unrealized_pnl_pct: pnl / dec!(5),
            realized_pnl_usd: Decimal::ZERO,
            total_dca_legs: 5,
            filled_dca_legs: 5,
            pyramid_count: 2,
            max_pyramids: 3,
            tp_mode: TpMode::PerLeg,
            tp_aggregate_percent: None,
            risk_blocked: false,
            risk_skip_once: false,
            risk_timer_start: Some(Utc::now() - ChronoDuration::minutes(120)),
            risk_timer_expires: Some(Utc::now() - ChronoDuration::minutes(1)),
            status: PositionStatus::Active,
            created_at: Utc::now(),
            closed_at: None,
            telegram_message_id: None,
        }
    }

    fn sample_config() -> RiskEngineConfig {
        RiskEngineConfig {
            evaluate_interval_seconds: 60,
            evaluate_on_fill: false,
            max_positions_per_symbol_timeframe_exchange: 2,
            max_total_exposure_usd: dec!(10000),
            max_realized_loss_usd: dec!(1000),
            timer_start_condition: TimerStartCondition::AfterAllDcaSubmitted,
            post_full_wait_minutes: 60,
            reset_timer_on_replacement: false,
            required_pyramids_for_timer: 1,
            loss_threshold_percent: dec!(-10),
            max_winners_to_combine: 3,
            slippage_action: None,
            max_slippage_percent: None,
        }
    }

    #[test]
    fn selects_the_largest_absolute_loser_and_sorted_winners() {
        let loser = sample(1, dec!(-100), Side::Buy);
        let small_loser = sample(2, dec!(-20), Side::Buy);
        let winner_a = sample(3, dec!(80), Side::Buy);
        let winner_b = sample(4, dec!(60), Side::Buy);
        let positions = vec![loser.clone(), small_loser, winner_a.clone(), winner_b.clone()];
        let config = sample_config();

        let (selected_loser, winners) = RiskEngine::select_loser_and_winners(&positions, &config, Utc::now()).unwrap();
        assert_eq!(selected_loser.id, loser.id);
        assert_eq!(winners.len(), 2);
        assert_eq!(winners[0].id, winner_a.id);
        assert_eq!(winners[1].id, winner_b.id);
    }

    #[test]
    fn blocked_and_skip_once_positions_are_never_eligible_losers() {
        let mut blocked = sample(1, dec!(-100), Side::Buy);
        blocked.risk_blocked = true;
        let mut skip_once = sample(2, dec!(-90), Side::Buy);
        skip_once.risk_skip_once = true;
        let positions = vec![blocked, skip_once];
        let config = sample_config();
        assert!(RiskEngine::select_loser_and_winners(&positions, &config, Utc::now()).is_none());
    }

    #[test]
    fn partial_close_quantity_skips_non_positive_edge() {
        let winner = sample(1, dec!(80), Side::Buy);
        let result = RiskEngine::partial_close_quantity(&winner, dec!(90), dec!(50), dec!(0.01), Decimal::ZERO);
        assert!(result.is_none());
    }

    #[test]
    fn partial_close_quantity_never_fully_closes_winner() {
        let mut winner = sample(1, dec!(80), Side::Buy);
        winner.total_filled_quantity = dec!(1);
        let result = RiskEngine::partial_close_quantity(&winner, dec!(200), dec!(1000), dec!(0.01), Decimal::ZERO);
        assert!(result.is_none());
    }

    #[test]
    fn partial_close_quantity_rounds_down_to_step_size() {
        let winner = sample(1, dec!(80), Side::Buy);
        let quantity = RiskEngine::partial_close_quantity(&winner, dec!(120), dec!(33), dec!(0.1), Decimal::ZERO).unwrap();
        assert_eq!(quantity, dec!(1.6));
    }

    #[test]
    fn timer_never_starts_before_the_configured_condition_is_met() {
        let mut group = sample(1, Decimal::ZERO, Side::Buy);
        group.risk_timer_start = None;
        group.risk_timer_expires = None;
        let config = sample_config();
        RiskEngine::maybe_start_timer(&mut group, &config, false, false);
        assert!(group.risk_timer_start.is_none());
        RiskEngine::maybe_start_timer(&mut group, &config, true, false);
        assert!(group.risk_timer_start.is_some());
    }

    #[test]
    fn timer_never_restarts_once_already_running() {
        let mut group = sample(1, Decimal::ZERO, Side::Buy);
        let original_start = Utc::now() - ChronoDuration::minutes(30);
        group.risk_timer_start = Some(original_start);
        let config = sample_config();
        RiskEngine::maybe_start_timer(&mut group, &config, true, true);
        assert_eq!(group.risk_timer_start.unwrap(), original_start);
    }
}
