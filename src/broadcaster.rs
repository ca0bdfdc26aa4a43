//! `Broadcaster`: the out-of-band notification sink (spec §6). Fire-and-forget
//! — the core must never `await` on or observe a broadcaster's outcome, so
//! every method here returns `()`, not a `Result`.

use async_trait::async_trait;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::domain::{ActionType, PositionGroup};
use crate::types::{Side, Symbol};

/// One filled DCA leg, as reported to a broadcaster.
#[derive(Debug, Clone)]
pub struct FillEvent {
    pub group_id: Uuid,
    pub leg_index: i32,
    pub symbol: Symbol,
    pub side: Side,
    pub price: Decimal,
    pub quantity: Decimal,
}

/// Out-of-band event notification sink. Implementations must never panic or
/// propagate an error into the caller — a failing notification transport is
/// never allowed to interrupt order/position/risk processing.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn send_entry_signal(&self, group: &PositionGroup);
    async fn send_exit_signal(&self, group: &PositionGroup, realized_pnl_usd: Decimal);
    async fn send_dca_fill(&self, group: &PositionGroup, fill: &FillEvent);
    async fn send_status_change(&self, group: &PositionGroup, from: &str, to: &str);
    async fn send_tp_hit(&self, group: &PositionGroup, leg_index: i32, tp_price: Decimal);
    async fn send_risk_event(&self, user_id: Uuid, action_type: ActionType, summary: &str);
    async fn send_failure(&self, user_id: Uuid, context: &str, message: &str);
    async fn send_pyramid_added(&self, group: &PositionGroup, pyramid_index: u32);

    /// Persists the correlator id for a previously-sent message (e.g. a chat
    /// message id the group's lifecycle updates should edit in place) so
    /// later events can be threaded under it. A no-op for transports with no
    /// such concept.
    async fn save_message_id(&self, group_id: Uuid, message_id: &str);
}

/// Reference implementation: every event becomes one `tracing` event at
/// `info` (or `warn` for failures), tagged with the fields the teacher's
/// strategies log by (`symbol`, `user_id`, ...). Suitable for a deployment
/// with no chat/webhook transport wired up, and for tests.
#[derive(Debug, Default)]
pub struct TracingBroadcaster;

impl TracingBroadcaster {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Broadcaster for TracingBroadcaster {
    async fn send_entry_signal(&self, group: &PositionGroup) {
        tracing::info!(
            group_id = %group.id,
            user_id = %group.user_id,
            symbol = %group.symbol,
            side = %group.side,
            "entry signal accepted"
        );
    }

    async fn send_exit_signal(&self, group: &PositionGroup, realized_pnl_usd: Decimal) {
        tracing::info!(
            group_id = %group.id,
            user_id = %group.user_id,
            symbol = %group.symbol,
            %realized_pnl_usd,
            "position exited"
        );
    }

    async fn send_dca_fill(&self, group: &PositionGroup, fill: &FillEvent) {
        tracing::info!(
            group_id = %group.id,
            leg_index = fill.leg_index,
            symbol = %fill.symbol,
            side = %fill.side,
            price = %fill.price,
            quantity = %fill.quantity,
            "dca leg filled"
        );
    }

    async fn send_status_change(&self, group: &PositionGroup, from: &str, to: &str) {
        tracing::info!(group_id = %group.id, from, to, "position status changed");
    }

    async fn send_tp_hit(&self, group: &PositionGroup, leg_index: i32, tp_price: Decimal) {
        tracing::info!(group_id = %group.id, leg_index, %tp_price, "take-profit hit");
    }

    async fn send_risk_event(&self, user_id: Uuid, action_type: ActionType, summary: &str) {
        tracing::info!(%user_id, ?action_type, summary, "risk engine action");
    }

    async fn send_failure(&self, user_id: Uuid, context: &str, message: &str) {
        tracing::warn!(%user_id, context, message, "failure reported to broadcaster");
    }

    async fn send_pyramid_added(&self, group: &PositionGroup, pyramid_index: u32) {
        tracing::info!(group_id = %group.id, pyramid_index, "pyramid added");
    }

    async fn save_message_id(&self, group_id: Uuid, message_id: &str) {
        tracing::debug!(%group_id, message_id, "message id saved");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::position_group::{PositionStatus, TpMode};
    use crate::types::{ExchangeId, Timeframe};
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn sample_group() -> PositionGroup {
        PositionGroup {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            exchange: ExchangeId::new("binance"),
            symbol: Symbol::new("BTCUSDT"),
            timeframe: Timeframe::new("60m"),
            side: Side::Buy,
            base_entry_price: Decimal::new(10000, 2),
            weighted_avg_entry: Decimal::new(10000, 2),
            total_invested_usd: Decimal::ZERO,
            total_filled_quantity: Decimal::ZERO,
            unrealized_pnl_usd: Decimal::ZERO,
            unrealized_pnl_pct: Decimal::ZERO,
            realized_pnl_usd: Decimal::ZERO,
            total_dca_legs: 5,
            filled_dca_legs: 0,
            pyramid_count: 1,
            max_pyramids: 3,
            tp_mode: TpMode::PerLeg,
            tp_aggregate_percent: None,
            risk_blocked: false,
            risk_skip_once: false,
            risk_timer_start: None,
            risk_timer_expires: None,
            status: PositionStatus::Live,
            created_at: Utc::now(),
            closed_at: None,
            telegram_message_id: None,
        }
    }

    #[tokio::test]
    async fn tracing_broadcaster_never_panics_across_every_method() {
        let broadcaster = TracingBroadcaster::new();
        let group = sample_group();
        let fill = FillEvent {
            group_id: group.id,
            leg_index: 0,
            symbol: group.symbol.clone(),
            side: Side::Buy,
            price: Decimal::new(10000, 2),
            quantity: Decimal::ONE,
        };

        broadcaster.send_entry_signal(&group).await;
        broadcaster.send_exit_signal(&group, Decimal::new(500, 2)).await;
        broadcaster.send_dca_fill(&group, &fill).await;
        broadcaster.send_status_change(&group, "live", "active").await;
        broadcaster.send_tp_hit(&group, 0, Decimal::new(10200, 2)).await;
        broadcaster
            .send_risk_event(group.user_id, ActionType::RiskOffsetClose, "offset executed")
            .await;
        broadcaster.send_failure(group.user_id, "fill_monitor", "connector timeout").await;
        broadcaster.send_pyramid_added(&group, 1).await;
        broadcaster.save_message_id(group.id, "msg-123").await;
    }
}
