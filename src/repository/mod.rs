//! Persistence boundary. Trait definitions here; one SQLite reference
//! implementation in [`sqlite`].

pub mod sqlite;

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use uuid::Uuid;

use crate::config::{DcaGridConfig, RiskEngineConfig};
use crate::domain::{DcaOrder, PositionGroup, Pyramid, QueuedSignal, RiskAction};
use crate::error::RepositoryError;

/// A `PositionGroup` together with its owned `Pyramid`s and `DcaOrder`s, the
/// shape returned by `get_with_orders`.
#[derive(Debug, Clone)]
pub struct PositionGroupWithOrders {
    pub group: PositionGroup,
    pub pyramids: Vec<Pyramid>,
    pub orders: Vec<DcaOrder>,
}

#[async_trait]
pub trait PositionRepository: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<PositionGroup>, RepositoryError>;
    async fn get_with_orders(&self, id: Uuid) -> Result<Option<PositionGroupWithOrders>, RepositoryError>;
    async fn create(&self, group: &PositionGroup) -> Result<(), RepositoryError>;
    async fn update(&self, group: &PositionGroup) -> Result<(), RepositoryError>;
    async fn get_all_active_by_user(&self, user_id: Uuid) -> Result<Vec<PositionGroup>, RepositoryError>;
    async fn get_active_position_groups_for_user(&self, user_id: Uuid) -> Result<Vec<PositionGroup>, RepositoryError> {
        self.get_all_active_by_user(user_id).await
    }
    /// Atomically bumps `pyramid_count` and returns the new value, avoiding
    /// a read-modify-write race between concurrent pyramid continuations for
    /// the same group.
    async fn increment_pyramid_count(&self, group_id: Uuid, additional_dca_legs: u32) -> Result<u32, RepositoryError>;
    async fn get_daily_realized_pnl(&self, user_id: Uuid) -> Result<Decimal, RepositoryError>;
    async fn get_closed_by_user_all(&self, user_id: Uuid) -> Result<Vec<PositionGroup>, RepositoryError>;
}

#[async_trait]
pub trait DcaOrderRepository: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<DcaOrder>, RepositoryError>;
    async fn create(&self, order: &DcaOrder) -> Result<(), RepositoryError>;
    async fn update(&self, order: &DcaOrder) -> Result<(), RepositoryError>;
    async fn get_all_orders_by_group_id(&self, group_id: Uuid) -> Result<Vec<DcaOrder>, RepositoryError>;
    /// All non-terminal orders across every user, grouped by user id, as
    /// consumed by `FillMonitor`'s per-cycle scan.
    async fn get_all_open_orders_for_all_users(&self) -> Result<HashMap<Uuid, Vec<DcaOrder>>, RepositoryError>;
}

#[async_trait]
pub trait PyramidRepository: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<Pyramid>, RepositoryError>;
    async fn create(&self, pyramid: &Pyramid) -> Result<(), RepositoryError>;
    async fn update(&self, pyramid: &Pyramid) -> Result<(), RepositoryError>;
    async fn get_all_by_group_id(&self, group_id: Uuid) -> Result<Vec<Pyramid>, RepositoryError>;
}

#[async_trait]
pub trait QueuedSignalRepository: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<QueuedSignal>, RepositoryError>;
    async fn create(&self, signal: &QueuedSignal) -> Result<(), RepositoryError>;
    async fn update(&self, signal: &QueuedSignal) -> Result<(), RepositoryError>;
    async fn get_queued_for_user(&self, user_id: Uuid) -> Result<Vec<QueuedSignal>, RepositoryError>;
}

#[async_trait]
pub trait RiskActionRepository: Send + Sync {
    async fn create(&self, action: &RiskAction) -> Result<(), RepositoryError>;
    async fn get_all_for_user(&self, user_id: Uuid) -> Result<Vec<RiskAction>, RepositoryError>;
}

/// Per-user persisted configuration plus the two risk-engine control flags.
#[derive(Debug, Clone)]
pub struct UserConfig {
    pub user_id: Uuid,
    pub risk_engine_config: RiskEngineConfig,
    pub grid_configs: HashMap<String, DcaGridConfig>,
    pub engine_force_stopped: bool,
    pub engine_paused_by_loss_limit: bool,
}

#[async_trait]
pub trait UserConfigRepository: Send + Sync {
    async fn get(&self, user_id: Uuid) -> Result<Option<UserConfig>, RepositoryError>;
    async fn update(&self, config: &UserConfig) -> Result<(), RepositoryError>;
    async fn get_all_active_user_ids(&self) -> Result<Vec<Uuid>, RepositoryError>;
}

/// The full set of repositories the composition root wires up. Bundled
/// together so `OrderService`/`PositionManager`/`FillMonitor`/`RiskEngine`
/// take one object instead of five. Cheap to clone: every field is an `Arc`.
#[derive(Clone)]
pub struct Repositories {
    pub positions: std::sync::Arc<dyn PositionRepository>,
    pub orders: std::sync::Arc<dyn DcaOrderRepository>,
    pub pyramids: std::sync::Arc<dyn PyramidRepository>,
    pub signals: std::sync::Arc<dyn QueuedSignalRepository>,
    pub risk_actions: std::sync::Arc<dyn RiskActionRepository>,
    pub user_config: std::sync::Arc<dyn UserConfigRepository>,
}
