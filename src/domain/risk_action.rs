//! `RiskAction`: immutable audit record of a risk-engine intervention.
//!
//! Captured values are decision-time snapshots, not live references — a
//! `RiskAction` must remain legible after the positions it names have
//! closed (spec §8 quantified invariant 6).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::Symbol;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    OffsetLoss,
    ManualClose,
    EngineClose,
    TpExit,
    RiskOffsetClose,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WinnerDetail {
    pub group_id: Uuid,
    pub symbol: Symbol,
    pub pnl_usd: Decimal,
    pub quantity_closed: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub action_type: ActionType,
    pub loser_group_id: Uuid,
    pub loser_symbol: Symbol,
    /// Snapshot of the loser's unrealized PnL at decision time, not a
    /// reference to the live value.
    pub loser_pnl_usd: Decimal,
    pub winner_details: Vec<WinnerDetail>,
    pub notes: Option<String>,
}
