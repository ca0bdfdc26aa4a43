//! `DCAOrder`: a single leg, and the state machine it moves through.
//!
//! ```text
//!   pending ──submit──▶ open ──(partial)──▶ partially_filled ──▶ filled
//!      │                  │                        │                │
//!      │                  ├──cancel──▶ cancelled   │                │
//!      │                  │                        └──cancel──▶ cancelled
//!   trigger_pending ──(trigger crossed)──▶ (submit path above)
//!      │
//!      └── failed (terminal if submission attempts exhausted)
//! ```

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::Side;

/// Reserved `leg_index` for a synthetic TP-fill audit record.
pub const LEG_INDEX_TP_FILL: i32 = 999;
/// Reserved `leg_index` for a synthetic ad-hoc market-close audit record.
pub const LEG_INDEX_AD_HOC_CLOSE: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Limit,
    Market,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    /// Held locally; waiting for the current price to cross `price` in the
    /// direction implied by `side` before being submitted.
    TriggerPending,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    /// Terminal: submission attempts exhausted on a non-transient error.
    Failed,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Failed)
    }

    /// `invariant 3`: a DCAOrder only ever moves forward through this list.
    /// Returns whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (Pending, Open)
                | (Pending, Failed)
                | (TriggerPending, Open)
                | (TriggerPending, Failed)
                | (Open, PartiallyFilled)
                | (Open, Filled)
                | (Open, Cancelled)
                | (PartiallyFilled, Filled)
                | (PartiallyFilled, Cancelled)
        )
    }
}

/// A single order leg, whether a real exchange order or a synthetic audit
/// record (`leg_index` in {[`LEG_INDEX_TP_FILL`], [`LEG_INDEX_AD_HOC_CLOSE`]}).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DcaOrder {
    pub id: Uuid,
    pub group_id: Uuid,
    pub pyramid_id: Uuid,
    pub leg_index: i32,

    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,

    pub price: Decimal,
    pub quantity: Decimal,

    pub exchange_order_id: Option<String>,

    pub filled_quantity: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub fee: Decimal,
    pub fee_currency: Option<String>,

    pub submitted_at: Option<DateTime<Utc>>,
    pub filled_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,

    pub gap_percent: Decimal,
    pub weight_percent: Decimal,
    pub tp_percent: Decimal,
    pub tp_price: Decimal,

    pub tp_order_id: Option<Uuid>,
    pub tp_hit: bool,
    pub tp_executed_at: Option<DateTime<Utc>>,

    pub status: OrderStatus,
}

impl DcaOrder {
    pub fn is_entry_leg(&self) -> bool {
        self.leg_index != LEG_INDEX_TP_FILL && self.leg_index != LEG_INDEX_AD_HOC_CLOSE
    }

    /// Counts toward `filled_dca_legs` per spec §4.2 step 4: entry legs
    /// only, filled, and not already counted as TP-hit.
    pub fn counts_as_filled_entry(&self) -> bool {
        self.is_entry_leg() && self.status == OrderStatus::Filled && !self.tp_hit
    }

    /// `invariant 2`: filled_quantity must never exceed quantity (beyond a
    /// small rounding epsilon), and any positive fill implies a fill-bearing
    /// status.
    pub fn fill_invariant_holds(&self, epsilon: Decimal) -> bool {
        let within_quantity = self.filled_quantity <= self.quantity + epsilon;
        let status_consistent = self.filled_quantity <= Decimal::ZERO
            || matches!(self.status, OrderStatus::PartiallyFilled | OrderStatus::Filled);
        within_quantity && status_consistent
    }

    /// Derives the opposite side for a synthetic closing/TP record from this
    /// leg's side. Preserves the original implementation's asymmetric
    /// buy->sell / sell->buy mapping rather than a generic `Side::opposite`
    /// call, since this is specifically about a closing record mirroring an
    /// entry leg.
    pub fn synthetic_close_side(&self) -> Side {
        match self.side {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_only_transitions() {
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::Open));
        assert!(OrderStatus::Open.can_transition_to(OrderStatus::PartiallyFilled));
        assert!(OrderStatus::PartiallyFilled.can_transition_to(OrderStatus::Filled));
        assert!(!OrderStatus::Filled.can_transition_to(OrderStatus::Open));
        assert!(!OrderStatus::Cancelled.can_transition_to(OrderStatus::Open));
    }

    #[test]
    fn trigger_pending_only_goes_to_open_or_failed() {
        assert!(OrderStatus::TriggerPending.can_transition_to(OrderStatus::Open));
        assert!(OrderStatus::TriggerPending.can_transition_to(OrderStatus::Failed));
        assert!(!OrderStatus::TriggerPending.can_transition_to(OrderStatus::Filled));
    }

    #[test]
    fn synthetic_close_side_mirrors_entry() {
        let mut order = sample_order();
        order.side = Side::Buy;
        assert_eq!(order.synthetic_close_side(), Side::Sell);
        order.side = Side::Sell;
        assert_eq!(order.synthetic_close_side(), Side::Buy);
    }

    fn sample_order() -> DcaOrder {
        DcaOrder {
            id: Uuid::new_v4(),
            group_id: Uuid::new_v4(),
            pyramid_id: Uuid::new_v4(),
            leg_index: 0,
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            price: Decimal::new(10000, 2),
            quantity: Decimal::ONE,
            exchange_order_id: None,
            filled_quantity: Decimal::ZERO,
            avg_fill_price: None,
            fee: Decimal::ZERO,
            fee_currency: None,
            submitted_at: None,
            filled_at: None,
            cancelled_at: None,
            gap_percent: Decimal::ZERO,
            weight_percent: Decimal::new(20, 0),
            tp_percent: Decimal::new(2, 0),
            tp_price: Decimal::ZERO,
            tp_order_id: None,
            tp_hit: false,
            tp_executed_at: None,
            status: OrderStatus::Pending,
        }
    }
}
