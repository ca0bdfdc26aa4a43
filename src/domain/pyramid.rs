//! `Pyramid`: a single DCA entry wave within a `PositionGroup`.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::DcaGridConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PyramidStatus {
    Pending,
    Submitted,
    Filled,
}

/// One entry wave. `dca_config` is a snapshot of the grid configuration used
/// to compute this wave's legs, taken at creation time so later config edits
/// never retroactively change an already-placed wave's plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pyramid {
    pub id: Uuid,
    pub group_id: Uuid,
    pub pyramid_index: u32,
    pub entry_price: Decimal,
    pub status: PyramidStatus,
    pub dca_config: DcaGridConfig,
    pub created_at: DateTime<Utc>,
}
