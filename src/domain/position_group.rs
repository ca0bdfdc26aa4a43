//! `PositionGroup`: one open trading position for a (user, exchange, symbol,
//! timeframe, side) tuple. Owns its pyramids and DCA orders by composition.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{ExchangeId, Side, Symbol, Timeframe};

/// Which exit policy the group uses once legs start filling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TpMode {
    /// An independent take-profit order per filled leg.
    PerLeg,
    /// A single market close of the whole group at the group's aggregate
    /// target.
    Aggregate,
    /// Per-leg TPs, with an aggregate TP as a fallback umbrella exit.
    Hybrid,
    /// Aggregate TP computed per pyramid rather than per group.
    PyramidAggregate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    /// Just created; at least one leg not yet filled and none of the
    /// "active" conditions below hold yet.
    Live,
    /// Some but not all entry legs filled.
    PartiallyFilled,
    /// All entry legs in the current pyramid wave filled.
    Active,
    /// Exit in progress (force-close or exit-signal handling underway).
    Closing,
    /// Terminal: quantity is fully unwound.
    Closed,
    /// Terminal failure: creation or submission failed before any order was
    /// placed successfully.
    Failed,
}

impl PositionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, PositionStatus::Closed | PositionStatus::Failed)
    }
}

/// One open trading position. See module docs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionGroup {
    pub id: Uuid,
    pub user_id: Uuid,
    pub exchange: ExchangeId,
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    pub side: Side,

    pub base_entry_price: Decimal,
    pub weighted_avg_entry: Decimal,
    pub total_invested_usd: Decimal,
    pub total_filled_quantity: Decimal,
    pub unrealized_pnl_usd: Decimal,
    pub unrealized_pnl_pct: Decimal,
    pub realized_pnl_usd: Decimal,

    pub total_dca_legs: u32,
    pub filled_dca_legs: u32,
    pub pyramid_count: u32,
    pub max_pyramids: u32,

    pub tp_mode: TpMode,
    pub tp_aggregate_percent: Option<Decimal>,

    pub risk_blocked: bool,
    pub risk_skip_once: bool,
    pub risk_timer_start: Option<DateTime<Utc>>,
    pub risk_timer_expires: Option<DateTime<Utc>>,

    pub status: PositionStatus,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,

    /// Opaque correlator for an out-of-band notification message (e.g. a
    /// chat message this group's lifecycle updates get threaded under).
    pub telegram_message_id: Option<String>,
}

impl PositionGroup {
    /// `invariant 6`: a group with at least one filled order whose net
    /// quantity has dropped to zero (or below, guarding against rounding
    /// dust) is closed.
    pub fn should_auto_close(&self) -> bool {
        self.total_filled_quantity <= Decimal::ZERO && self.filled_dca_legs > 0
    }

    /// `invariant 1`: filled_dca_legs must never exceed total_dca_legs.
    pub fn legs_consistent(&self) -> bool {
        self.filled_dca_legs <= self.total_dca_legs
    }

    pub fn is_risk_eligible_position(&self) -> bool {
        !self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PositionGroup {
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

    #[test]
    fn auto_close_requires_at_least_one_fill() {
        let g = sample();
        assert!(!g.should_auto_close());
    }

    #[test]
    fn auto_close_when_qty_drained_after_fill() {
        let mut g = sample();
        g.filled_dca_legs = 2;
        g.total_filled_quantity = Decimal::ZERO;
        assert!(g.should_auto_close());
    }
}
