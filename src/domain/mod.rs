//! Domain entities: the persisted shape of a user's trading state.
//!
//! These are plain data types plus the handful of pure state-transition
//! helpers that belong to the entity itself (status advancement, terminal
//! checks). The actual orchestration that mutates and persists them lives in
//! `oms::position_manager` and `oms::order_service`.

pub mod dca_order;
pub mod position_group;
pub mod pyramid;
pub mod queued_signal;
pub mod risk_action;

pub use dca_order::{DcaOrder, OrderStatus, OrderType};
pub use position_group::{PositionGroup, PositionStatus, TpMode};
pub use pyramid::{Pyramid, PyramidStatus};
pub use queued_signal::{QueuedSignal, SignalStatus};
pub use risk_action::{ActionType, RiskAction, WinnerDetail};
