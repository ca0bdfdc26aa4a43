//! `QueuedSignal`: a pending inbound signal awaiting an execution slot.
//!
//! Promotion policy beyond the slot-count gate is an external collaborator
//! (see spec §1); this crate only models the entity and the pre-trade gate
//! consulted before promotion (`risk_engine::pre_trade_check`).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::types::{ExchangeId, Side, Symbol, Timeframe};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalStatus {
    Queued,
    Promoted,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedSignal {
    pub id: Uuid,
    pub user_id: Uuid,
    pub exchange: ExchangeId,
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    pub side: Side,
    pub entry_price: Decimal,
    pub queued_at: DateTime<Utc>,
    pub promoted_at: Option<DateTime<Utc>>,
    pub status: SignalStatus,
    /// Opaque payload as received from the signal source; reinterpreted by
    /// the promotion/execution path, not by this crate.
    pub raw_payload: Value,
}
