//! SQLite reference implementation of the repository traits.
//!
//! Grounded in the teacher's sibling `state_manager.rs`: a single
//! `rusqlite::Connection` behind `Arc<Mutex<_>>`, `WAL` journal mode, and
//! JSON columns for nested/blob fields. Every blocking `rusqlite` call runs
//! inside `tokio::task::spawn_blocking` so the async repository traits never
//! stall the runtime.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::config::{DcaGridConfig, RiskEngineConfig};
use crate::domain::dca_order::{DcaOrder, OrderStatus, OrderType};
use crate::domain::position_group::{PositionGroup, PositionStatus, TpMode};
use crate::domain::pyramid::{Pyramid, PyramidStatus};
use crate::domain::queued_signal::{QueuedSignal, SignalStatus};
use crate::domain::risk_action::{ActionType, RiskAction};
use crate::error::RepositoryError;
use crate::types::{ExchangeId, Side, Symbol, Timeframe};

use super::{
    DcaOrderRepository, PositionGroupWithOrders, PositionRepository, PyramidRepository,
    QueuedSignalRepository, RiskActionRepository, Repositories, UserConfig, UserConfigRepository,
};

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RepositoryError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, RepositoryError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, RepositoryError> {
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        create_tables(&conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Wraps this store in `Arc`s suitable for the composition root's
    /// [`Repositories`] bundle — every field shares the same underlying
    /// connection.
    pub fn into_repositories(self) -> Repositories {
        let shared = Arc::new(self);
        Repositories {
            positions: shared.clone(),
            orders: shared.clone(),
            pyramids: shared.clone(),
            signals: shared.clone(),
            risk_actions: shared.clone(),
            user_config: shared,
        }
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<Result<T, RepositoryError>, RepositoryError>
    where
        F: FnOnce(&Connection) -> Result<T, RepositoryError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        // rusqlite::Connection is not Send-safe to hold across an .await,
        // so the lock is acquired and released entirely inside the blocking
        // closure handed to Tokio's managed blocking pool.
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().expect("sqlite mutex poisoned");
            f(&guard)
        })
        .await
        .map_err(|_| RepositoryError::Join("sqlite worker thread panicked".into()))
    }
}

fn create_tables(conn: &Connection) -> Result<(), RepositoryError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS position_groups (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            exchange TEXT NOT NULL,
            symbol TEXT NOT NULL,
            timeframe TEXT NOT NULL,
            side TEXT NOT NULL,
            base_entry_price TEXT NOT NULL,
            weighted_avg_entry TEXT NOT NULL,
            total_invested_usd TEXT NOT NULL,
            total_filled_quantity TEXT NOT NULL,
            unrealized_pnl_usd TEXT NOT NULL,
            unrealized_pnl_pct TEXT NOT NULL,
            realized_pnl_usd TEXT NOT NULL,
            total_dca_legs INTEGER NOT NULL,
            filled_dca_legs INTEGER NOT NULL,
            pyramid_count INTEGER NOT NULL,
            max_pyramids INTEGER NOT NULL,
            tp_mode TEXT NOT NULL,
            tp_aggregate_percent TEXT,
            risk_blocked INTEGER NOT NULL,
            risk_skip_once INTEGER NOT NULL,
            risk_timer_start TEXT,
            risk_timer_expires TEXT,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            closed_at TEXT,
            telegram_message_id TEXT
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_position_groups_unique_open
            ON position_groups (user_id, exchange, symbol, timeframe, side)
            WHERE status NOT IN ('closed', 'failed');

        CREATE TABLE IF NOT EXISTS pyramids (
            id TEXT PRIMARY KEY,
            group_id TEXT NOT NULL,
            pyramid_index INTEGER NOT NULL,
            entry_price TEXT NOT NULL,
            status TEXT NOT NULL,
            dca_config TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_pyramids_group ON pyramids (group_id);

        CREATE TABLE IF NOT EXISTS dca_orders (
            id TEXT PRIMARY KEY,
            group_id TEXT NOT NULL,
            pyramid_id TEXT NOT NULL,
            leg_index INTEGER NOT NULL,
            symbol TEXT NOT NULL,
            side TEXT NOT NULL,
            order_type TEXT NOT NULL,
            price TEXT NOT NULL,
            quantity TEXT NOT NULL,
            exchange_order_id TEXT,
            filled_quantity TEXT NOT NULL,
            avg_fill_price TEXT,
            fee TEXT NOT NULL,
            fee_currency TEXT,
            submitted_at TEXT,
            filled_at TEXT,
            cancelled_at TEXT,
            gap_percent TEXT NOT NULL,
            weight_percent TEXT NOT NULL,
            tp_percent TEXT NOT NULL,
            tp_price TEXT NOT NULL,
            tp_order_id TEXT,
            tp_hit INTEGER NOT NULL,
            tp_executed_at TEXT,
            status TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_dca_orders_group ON dca_orders (group_id);
        CREATE INDEX IF NOT EXISTS idx_dca_orders_status ON dca_orders (status);

        CREATE TABLE IF NOT EXISTS queued_signals (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            exchange TEXT NOT NULL,
            symbol TEXT NOT NULL,
            timeframe TEXT NOT NULL,
            side TEXT NOT NULL,
            entry_price TEXT NOT NULL,
            queued_at TEXT NOT NULL,
            promoted_at TEXT,
            status TEXT NOT NULL,
            raw_payload TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS risk_actions (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            action_type TEXT NOT NULL,
            loser_group_id TEXT NOT NULL,
            loser_symbol TEXT NOT NULL,
            loser_pnl_usd TEXT NOT NULL,
            winner_details TEXT NOT NULL,
            notes TEXT
        );

        CREATE TABLE IF NOT EXISTS user_config (
            user_id TEXT PRIMARY KEY,
            risk_engine_config TEXT NOT NULL,
            grid_configs TEXT NOT NULL,
            engine_force_stopped INTEGER NOT NULL,
            engine_paused_by_loss_limit INTEGER NOT NULL
        );
        "#,
    )?;
    Ok(())
}

fn parse_dt(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::NotFound(format!("bad timestamp {s}: {e}")))
}

fn parse_dt_opt(s: Option<String>) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    s.map(|s| parse_dt(&s)).transpose()
}

fn parse_decimal(s: &str) -> Result<Decimal, RepositoryError> {
    Decimal::from_str(s).map_err(|e| RepositoryError::NotFound(format!("bad decimal {s}: {e}")))
}

fn parse_decimal_opt(s: Option<String>) -> Result<Option<Decimal>, RepositoryError> {
    s.map(|s| parse_decimal(&s)).transpose()
}

fn position_group_from_row(row: &Row) -> rusqlite::Result<(PositionGroup,)> {
    let group = PositionGroup {
        id: Uuid::parse_str(&row.get::<_, String>("id")?).unwrap(),
        user_id: Uuid::parse_str(&row.get::<_, String>("user_id")?).unwrap(),
        exchange: ExchangeId::new(row.get::<_, String>("exchange")?),
        symbol: Symbol::new(row.get::<_, String>("symbol")?),
        timeframe: Timeframe::new(row.get::<_, String>("timeframe")?),
        side: side_from_str(&row.get::<_, String>("side")?),
        base_entry_price: parse_decimal(&row.get::<_, String>("base_entry_price")?).unwrap(),
        weighted_avg_entry: parse_decimal(&row.get::<_, String>("weighted_avg_entry")?).unwrap(),
        total_invested_usd: parse_decimal(&row.get::<_, String>("total_invested_usd")?).unwrap(),
        total_filled_quantity: parse_decimal(&row.get::<_, String>("total_filled_quantity")?).unwrap(),
        unrealized_pnl_usd: parse_decimal(&row.get::<_, String>("unrealized_pnl_usd")?).unwrap(),
        unrealized_pnl_pct: parse_decimal(&row.get::<_, String>("unrealized_pnl_pct")?).unwrap(),
        realized_pnl_usd: parse_decimal(&row.get::<_, String>("realized_pnl_usd")?).unwrap(),
        total_dca_legs: row.get::<_, i64>("total_dca_legs")? as u32,
        filled_dca_legs: row.get::<_, i64>("filled_dca_legs")? as u32,
        pyramid_count: row.get::<_, i64>("pyramid_count")? as u32,
        max_pyramids: row.get::<_, i64>("max_pyramids")? as u32,
        tp_mode: tp_mode_from_str(&row.get::<_, String>("tp_mode")?),
        tp_aggregate_percent: parse_decimal_opt(row.get("tp_aggregate_percent")?).unwrap(),
        risk_blocked: row.get::<_, i64>("risk_blocked")? != 0,
        risk_skip_once: row.get::<_, i64>("risk_skip_once")? != 0,
        risk_timer_start: parse_dt_opt(row.get("risk_timer_start")?).unwrap(),
        risk_timer_expires: parse_dt_opt(row.get("risk_timer_expires")?).unwrap(),
        status: position_status_from_str(&row.get::<_, String>("status")?),
        created_at: parse_dt(&row.get::<_, String>("created_at")?).unwrap(),
        closed_at: parse_dt_opt(row.get("closed_at")?).unwrap(),
        telegram_message_id: row.get("telegram_message_id")?,
    };
    Ok((group,))
}

fn side_from_str(s: &str) -> Side {
    if s.eq_ignore_ascii_case("sell") { Side::Sell } else { Side::Buy }
}

fn tp_mode_from_str(s: &str) -> TpMode {
    match s {
        "aggregate" => TpMode::Aggregate,
        "hybrid" => TpMode::Hybrid,
        "pyramid_aggregate" => TpMode::PyramidAggregate,
        _ => TpMode::PerLeg,
    }
}

fn tp_mode_to_str(m: TpMode) -> &'static str {
    match m {
        TpMode::PerLeg => "per_leg",
        TpMode::Aggregate => "aggregate",
        TpMode::Hybrid => "hybrid",
        TpMode::PyramidAggregate => "pyramid_aggregate",
    }
}

fn position_status_from_str(s: &str) -> PositionStatus {
    match s {
        "partially_filled" => PositionStatus::PartiallyFilled,
        "active" => PositionStatus::Active,
        "closing" => PositionStatus::Closing,
        "closed" => PositionStatus::Closed,
        "failed" => PositionStatus::Failed,
        _ => PositionStatus::Live,
    }
}

fn position_status_to_str(s: PositionStatus) -> &'static str {
    match s {
        PositionStatus::Live => "live",
        PositionStatus::PartiallyFilled => "partially_filled",
        PositionStatus::Active => "active",
        PositionStatus::Closing => "closing",
        PositionStatus::Closed => "closed",
        PositionStatus::Failed => "failed",
    }
}

fn order_status_from_str(s: &str) -> OrderStatus {
    match s {
        "trigger_pending" => OrderStatus::TriggerPending,
        "open" => OrderStatus::Open,
        "partially_filled" => OrderStatus::PartiallyFilled,
        "filled" => OrderStatus::Filled,
        "cancelled" => OrderStatus::Cancelled,
        "failed" => OrderStatus::Failed,
        _ => OrderStatus::Pending,
    }
}

fn order_status_to_str(s: OrderStatus) -> &'static str {
    match s {
        OrderStatus::Pending => "pending",
        OrderStatus::TriggerPending => "trigger_pending",
        OrderStatus::Open => "open",
        OrderStatus::PartiallyFilled => "partially_filled",
        OrderStatus::Filled => "filled",
        OrderStatus::Cancelled => "cancelled",
        OrderStatus::Failed => "failed",
    }
}

fn order_type_from_str(s: &str) -> OrderType {
    if s == "market" { OrderType::Market } else { OrderType::Limit }
}

fn dca_order_from_row(row: &Row) -> rusqlite::Result<DcaOrder> {
    Ok(DcaOrder {
        id: Uuid::parse_str(&row.get::<_, String>("id")?).unwrap(),
        group_id: Uuid::parse_str(&row.get::<_, String>("group_id")?).unwrap(),
        pyramid_id: Uuid::parse_str(&row.get::<_, String>("pyramid_id")?).unwrap(),
        leg_index: row.get::<_, i64>("leg_index")? as i32,
        symbol: row.get("symbol")?,
        side: side_from_str(&row.get::<_, String>("side")?),
        order_type: order_type_from_str(&row.get::<_, String>("order_type")?),
        price: parse_decimal(&row.get::<_, String>("price")?).unwrap(),
        quantity: parse_decimal(&row.get::<_, String>("quantity")?).unwrap(),
        exchange_order_id: row.get("exchange_order_id")?,
        filled_quantity: parse_decimal(&row.get::<_, String>("filled_quantity")?).unwrap(),
        avg_fill_price: parse_decimal_opt(row.get("avg_fill_price")?).unwrap(),
        fee: parse_decimal(&row.get::<_, String>("fee")?).unwrap(),
        fee_currency: row.get("fee_currency")?,
        submitted_at: parse_dt_opt(row.get("submitted_at")?).unwrap(),
        filled_at: parse_dt_opt(row.get("filled_at")?).unwrap(),
        cancelled_at: parse_dt_opt(row.get("cancelled_at")?).unwrap(),
        gap_percent: parse_decimal(&row.get::<_, String>("gap_percent")?).unwrap(),
        weight_percent: parse_decimal(&row.get::<_, String>("weight_percent")?).unwrap(),
        tp_percent: parse_decimal(&row.get::<_, String>("tp_percent")?).unwrap(),
        tp_price: parse_decimal(&row.get::<_, String>("tp_price")?).unwrap(),
        tp_order_id: row.get::<_, Option<String>>("tp_order_id")?.map(|s| Uuid::parse_str(&s).unwrap()),
        tp_hit: row.get::<_, i64>("tp_hit")? != 0,
        tp_executed_at: parse_dt_opt(row.get("tp_executed_at")?).unwrap(),
        status: order_status_from_str(&row.get::<_, String>("status")?),
    })
}

fn pyramid_status_from_str(s: &str) -> PyramidStatus {
    match s {
        "submitted" => PyramidStatus::Submitted,
        "filled" => PyramidStatus::Filled,
        _ => PyramidStatus::Pending,
    }
}

fn pyramid_status_to_str(s: PyramidStatus) -> &'static str {
    match s {
        PyramidStatus::Pending => "pending",
        PyramidStatus::Submitted => "submitted",
        PyramidStatus::Filled => "filled",
    }
}

fn pyramid_from_row(row: &Row) -> rusqlite::Result<Pyramid> {
    let dca_config_json: String = row.get("dca_config")?;
    let dca_config: DcaGridConfig = serde_json::from_str(&dca_config_json)
        .unwrap_or_else(|e| panic!("corrupt dca_config JSON: {e}"));
    Ok(Pyramid {
        id: Uuid::parse_str(&row.get::<_, String>("id")?).unwrap(),
        group_id: Uuid::parse_str(&row.get::<_, String>("group_id")?).unwrap(),
        pyramid_index: row.get::<_, i64>("pyramid_index")? as u32,
        entry_price: parse_decimal(&row.get::<_, String>("entry_price")?).unwrap(),
        status: pyramid_status_from_str(&row.get::<_, String>("status")?),
        dca_config,
        created_at: parse_dt(&row.get::<_, String>("created_at")?).unwrap(),
    })
}

#[async_trait]
impl PositionRepository for SqliteStore {
    async fn get(&self, id: Uuid) -> Result<Option<PositionGroup>, RepositoryError> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT * FROM position_groups WHERE id = ?1",
                params![id.to_string()],
                |row| position_group_from_row(row),
            )
            .optional()
            .map(|opt| opt.map(|(g,)| g))
            .map_err(RepositoryError::from)
        })
        .await
        .and_then(std::convert::identity)
    }

    async fn get_with_orders(&self, id: Uuid) -> Result<Option<PositionGroupWithOrders>, RepositoryError> {
        let group = PositionRepository::get(self, id).await?;
        let Some(group) = group else { return Ok(None) };
        let pyramids = PyramidRepository::get_all_by_group_id(self, id).await?;
        let orders = DcaOrderRepository::get_all_orders_by_group_id(self, id).await?;
        Ok(Some(PositionGroupWithOrders { group, pyramids, orders }))
    }

    async fn create(&self, group: &PositionGroup) -> Result<(), RepositoryError> {
        let group = group.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO position_groups (
                    id, user_id, exchange, symbol, timeframe, side,
                    base_entry_price, weighted_avg_entry, total_invested_usd, total_filled_quantity,
                    unrealized_pnl_usd, unrealized_pnl_pct, realized_pnl_usd,
                    total_dca_legs, filled_dca_legs, pyramid_count, max_pyramids,
                    tp_mode, tp_aggregate_percent, risk_blocked, risk_skip_once,
                    risk_timer_start, risk_timer_expires, status, created_at, closed_at, telegram_message_id
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23,?24,?25,?26,?27)",
                params![
                    group.id.to_string(),
                    group.user_id.to_string(),
                    group.exchange.as_str(),
                    group.symbol.as_str(),
                    group.timeframe.0,
                    group.side.to_string(),
                    group.base_entry_price.to_string(),
                    group.weighted_avg_entry.to_string(),
                    group.total_invested_usd.to_string(),
                    group.total_filled_quantity.to_string(),
                    group.unrealized_pnl_usd.to_string(),
                    group.unrealized_pnl_pct.to_string(),
                    group.realized_pnl_usd.to_string(),
                    group.total_dca_legs,
                    group.filled_dca_legs,
                    group.pyramid_count,
                    group.max_pyramids,
                    tp_mode_to_str(group.tp_mode),
                    group.tp_aggregate_percent.map(|d| d.to_string()),
                    group.risk_blocked as i64,
                    group.risk_skip_once as i64,
                    group.risk_timer_start.map(|dt| dt.to_rfc3339()),
                    group.risk_timer_expires.map(|dt| dt.to_rfc3339()),
                    position_status_to_str(group.status),
                    group.created_at.to_rfc3339(),
                    group.closed_at.map(|dt| dt.to_rfc3339()),
                    group.telegram_message_id,
                ],
            )
            .map(|_| ())
            .map_err(|e| {
                if e.to_string().contains("UNIQUE constraint failed") {
                    RepositoryError::UniqueViolation(
                        "active position already exists for this (user, exchange, symbol, timeframe, side)".into(),
                    )
                } else {
                    RepositoryError::from(e)
                }
            })
        })
        .await
        .and_then(std::convert::identity)
    }

    async fn update(&self, group: &PositionGroup) -> Result<(), RepositoryError> {
        let group = group.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE position_groups SET
                    weighted_avg_entry=?1, total_invested_usd=?2, total_filled_quantity=?3,
                    unrealized_pnl_usd=?4, unrealized_pnl_pct=?5, realized_pnl_usd=?6,
                    filled_dca_legs=?7, pyramid_count=?8, risk_blocked=?9, risk_skip_once=?10,
                    risk_timer_start=?11, risk_timer_expires=?12, status=?13, closed_at=?14,
                    telegram_message_id=?15
                 WHERE id=?16",
                params![
                    group.weighted_avg_entry.to_string(),
                    group.total_invested_usd.to_string(),
                    group.total_filled_quantity.to_string(),
                    group.unrealized_pnl_usd.to_string(),
                    group.unrealized_pnl_pct.to_string(),
                    group.realized_pnl_usd.to_string(),
                    group.filled_dca_legs,
                    group.pyramid_count,
                    group.risk_blocked as i64,
                    group.risk_skip_once as i64,
                    group.risk_timer_start.map(|dt| dt.to_rfc3339()),
                    group.risk_timer_expires.map(|dt| dt.to_rfc3339()),
                    position_status_to_str(group.status),
                    group.closed_at.map(|dt| dt.to_rfc3339()),
                    group.telegram_message_id,
                    group.id.to_string(),
                ],
            )
            .map(|_| ())
            .map_err(RepositoryError::from)
        })
        .await
        .and_then(std::convert::identity)
    }

    async fn get_all_active_by_user(&self, user_id: Uuid) -> Result<Vec<PositionGroup>, RepositoryError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM position_groups WHERE user_id = ?1 AND status NOT IN ('closed', 'failed')",
            )?;
            let rows = stmt
                .query_map(params![user_id.to_string()], position_group_from_row)?
                .map(|r| r.map(|(g,)| g))
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
        .and_then(std::convert::identity)
    }

    async fn increment_pyramid_count(&self, group_id: Uuid, additional_dca_legs: u32) -> Result<u32, RepositoryError> {
        self.with_conn(move |conn| {
            conn.query_row(
                "UPDATE position_groups
                 SET pyramid_count = pyramid_count + 1, total_dca_legs = total_dca_legs + ?1
                 WHERE id = ?2
                 RETURNING pyramid_count",
                params![additional_dca_legs, group_id.to_string()],
                |row| row.get::<_, i64>(0),
            )
            .map(|v| v as u32)
            .map_err(RepositoryError::from)
        })
        .await
        .and_then(std::convert::identity)
    }

    async fn get_daily_realized_pnl(&self, user_id: Uuid) -> Result<Decimal, RepositoryError> {
        self.with_conn(move |conn| {
            let today = Utc::now().date_naive().and_hms_opt(0, 0, 0).unwrap().and_utc();
            let rows: Vec<String> = conn
                .prepare(
                    "SELECT realized_pnl_usd FROM position_groups
                     WHERE user_id = ?1 AND status = 'closed' AND closed_at >= ?2",
                )?
                .query_map(params![user_id.to_string(), today.to_rfc3339()], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let mut total = Decimal::ZERO;
            for raw in rows {
                total += parse_decimal(&raw).map_err(|_| rusqlite::Error::InvalidQuery)?;
            }
            Ok(total)
        })
        .await
        .and_then(std::convert::identity)
    }

    async fn get_closed_by_user_all(&self, user_id: Uuid) -> Result<Vec<PositionGroup>, RepositoryError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM position_groups WHERE user_id = ?1 AND status = 'closed' ORDER BY closed_at DESC",
            )?;
            let rows = stmt
                .query_map(params![user_id.to_string()], position_group_from_row)?
                .map(|r| r.map(|(g,)| g))
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
        .and_then(std::convert::identity)
    }
}

#[async_trait]
impl PyramidRepository for SqliteStore {
    async fn get(&self, id: Uuid) -> Result<Option<Pyramid>, RepositoryError> {
        self.with_conn(move |conn| {
            conn.query_row("SELECT * FROM pyramids WHERE id = ?1", params![id.to_string()], pyramid_from_row)
                .optional()
                .map_err(RepositoryError::from)
        })
        .await
        .and_then(std::convert::identity)
    }

    async fn create(&self, pyramid: &Pyramid) -> Result<(), RepositoryError> {
        let pyramid = pyramid.clone();
        let config_json = serde_json::to_string(&pyramid.dca_config)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO pyramids (id, group_id, pyramid_index, entry_price, status, dca_config, created_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7)",
                params![
                    pyramid.id.to_string(),
                    pyramid.group_id.to_string(),
                    pyramid.pyramid_index,
                    pyramid.entry_price.to_string(),
                    pyramid_status_to_str(pyramid.status),
                    config_json,
                    pyramid.created_at.to_rfc3339(),
                ],
            )
            .map(|_| ())
            .map_err(RepositoryError::from)
        })
        .await
        .and_then(std::convert::identity)
    }

    async fn update(&self, pyramid: &Pyramid) -> Result<(), RepositoryError> {
        let pyramid = pyramid.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE pyramids SET status=?1 WHERE id=?2",
                params![pyramid_status_to_str(pyramid.status), pyramid.id.to_string()],
            )
            .map(|_| ())
            .map_err(RepositoryError::from)
        })
        .await
        .and_then(std::convert::identity)
    }

    async fn get_all_by_group_id(&self, group_id: Uuid) -> Result<Vec<Pyramid>, RepositoryError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT * FROM pyramids WHERE group_id = ?1 ORDER BY pyramid_index")?;
            let rows = stmt
                .query_map(params![group_id.to_string()], pyramid_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
        .and_then(std::convert::identity)
    }
}

#[async_trait]
impl DcaOrderRepository for SqliteStore {
    async fn get(&self, id: Uuid) -> Result<Option<DcaOrder>, RepositoryError> {
        self.with_conn(move |conn| {
            conn.query_row("SELECT * FROM dca_orders WHERE id = ?1", params![id.to_string()], dca_order_from_row)
                .optional()
                .map_err(RepositoryError::from)
        })
        .await
        .and_then(std::convert::identity)
    }

    async fn create(&self, order: &DcaOrder) -> Result<(), RepositoryError> {
        let order = order.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO dca_orders (
                    id, group_id, pyramid_id, leg_index, symbol, side, order_type, price, quantity,
                    exchange_order_id, filled_quantity, avg_fill_price, fee, fee_currency,
                    submitted_at, filled_at, cancelled_at, gap_percent, weight_percent, tp_percent,
                    tp_price, tp_order_id, tp_hit, tp_executed_at, status
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22,?23,?24,?25)",
                params![
                    order.id.to_string(),
                    order.group_id.to_string(),
                    order.pyramid_id.to_string(),
                    order.leg_index,
                    order.symbol,
                    order.side.to_string(),
                    if order.order_type == OrderType::Market { "market" } else { "limit" },
                    order.price.to_string(),
                    order.quantity.to_string(),
                    order.exchange_order_id,
                    order.filled_quantity.to_string(),
                    order.avg_fill_price.map(|d| d.to_string()),
                    order.fee.to_string(),
                    order.fee_currency,
                    order.submitted_at.map(|dt| dt.to_rfc3339()),
                    order.filled_at.map(|dt| dt.to_rfc3339()),
                    order.cancelled_at.map(|dt| dt.to_rfc3339()),
                    order.gap_percent.to_string(),
                    order.weight_percent.to_string(),
                    order.tp_percent.to_string(),
                    order.tp_price.to_string(),
                    order.tp_order_id.map(|id| id.to_string()),
                    order.tp_hit as i64,
                    order.tp_executed_at.map(|dt| dt.to_rfc3339()),
                    order_status_to_str(order.status),
                ],
            )
            .map(|_| ())
            .map_err(RepositoryError::from)
        })
        .await
        .and_then(std::convert::identity)
    }

    async fn update(&self, order: &DcaOrder) -> Result<(), RepositoryError> {
        let order = order.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE dca_orders SET
                    exchange_order_id=?1, filled_quantity=?2, avg_fill_price=?3, fee=?4, fee_currency=?5,
                    submitted_at=?6, filled_at=?7, cancelled_at=?8, tp_order_id=?9, tp_hit=?10,
                    tp_executed_at=?11, status=?12
                 WHERE id=?13",
                params![
                    order.exchange_order_id,
                    order.filled_quantity.to_string(),
                    order.avg_fill_price.map(|d| d.to_string()),
                    order.fee.to_string(),
                    order.fee_currency,
                    order.submitted_at.map(|dt| dt.to_rfc3339()),
                    order.filled_at.map(|dt| dt.to_rfc3339()),
                    order.cancelled_at.map(|dt| dt.to_rfc3339()),
                    order.tp_order_id.map(|id| id.to_string()),
                    order.tp_hit as i64,
                    order.tp_executed_at.map(|dt| dt.to_rfc3339()),
                    order_status_to_str(order.status),
                    order.id.to_string(),
                ],
            )
            .map(|_| ())
            .map_err(RepositoryError::from)
        })
        .await
        .and_then(std::convert::identity)
    }

    async fn get_all_orders_by_group_id(&self, group_id: Uuid) -> Result<Vec<DcaOrder>, RepositoryError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT * FROM dca_orders WHERE group_id = ?1 ORDER BY leg_index")?;
            let rows = stmt
                .query_map(params![group_id.to_string()], dca_order_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
        .and_then(std::convert::identity)
    }

    async fn get_all_open_orders_for_all_users(&self) -> Result<HashMap<Uuid, Vec<DcaOrder>>, RepositoryError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT o.*, g.user_id as owning_user_id FROM dca_orders o
                 JOIN position_groups g ON g.id = o.group_id
                 WHERE o.status NOT IN ('filled', 'cancelled', 'failed') OR (o.status = 'filled' AND o.tp_order_id IS NULL)",
            )?;
            let mut grouped: HashMap<Uuid, Vec<DcaOrder>> = HashMap::new();
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let user_id = Uuid::parse_str(&row.get::<_, String>("owning_user_id")?).unwrap();
                let order = dca_order_from_row(row)?;
                grouped.entry(user_id).or_default().push(order);
            }
            Ok(grouped)
        })
        .await
        .and_then(std::convert::identity)
    }
}

#[async_trait]
impl QueuedSignalRepository for SqliteStore {
    async fn get(&self, id: Uuid) -> Result<Option<QueuedSignal>, RepositoryError> {
        self.with_conn(move |conn| {
            conn.query_row("SELECT * FROM queued_signals WHERE id = ?1", params![id.to_string()], queued_signal_from_row)
                .optional()
                .map_err(RepositoryError::from)
        })
        .await
        .and_then(std::convert::identity)
    }

    async fn create(&self, signal: &QueuedSignal) -> Result<(), RepositoryError> {
        let signal = signal.clone();
        let payload = serde_json::to_string(&signal.raw_payload)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO queued_signals (id, user_id, exchange, symbol, timeframe, side, entry_price, queued_at, promoted_at, status, raw_payload)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
                params![
                    signal.id.to_string(),
                    signal.user_id.to_string(),
                    signal.exchange.as_str(),
                    signal.symbol.as_str(),
                    signal.timeframe.0,
                    signal.side.to_string(),
                    signal.entry_price.to_string(),
                    signal.queued_at.to_rfc3339(),
                    signal.promoted_at.map(|dt| dt.to_rfc3339()),
                    signal_status_to_str(signal.status),
                    payload,
                ],
            )
            .map(|_| ())
            .map_err(RepositoryError::from)
        })
        .await
        .and_then(std::convert::identity)
    }

    async fn update(&self, signal: &QueuedSignal) -> Result<(), RepositoryError> {
        let signal = signal.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE queued_signals SET promoted_at=?1, status=?2 WHERE id=?3",
                params![
                    signal.promoted_at.map(|dt| dt.to_rfc3339()),
                    signal_status_to_str(signal.status),
                    signal.id.to_string(),
                ],
            )
            .map(|_| ())
            .map_err(RepositoryError::from)
        })
        .await
        .and_then(std::convert::identity)
    }

    async fn get_queued_for_user(&self, user_id: Uuid) -> Result<Vec<QueuedSignal>, RepositoryError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM queued_signals WHERE user_id = ?1 AND status = 'queued' ORDER BY queued_at",
            )?;
            let rows = stmt
                .query_map(params![user_id.to_string()], queued_signal_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
        .and_then(std::convert::identity)
    }
}

fn signal_status_from_str(s: &str) -> SignalStatus {
    match s {
        "promoted" => SignalStatus::Promoted,
        "cancelled" => SignalStatus::Cancelled,
        _ => SignalStatus::Queued,
    }
}

fn signal_status_to_str(s: SignalStatus) -> &'static str {
    match s {
        SignalStatus::Queued => "queued",
        SignalStatus::Promoted => "promoted",
        SignalStatus::Cancelled => "cancelled",
    }
}

fn queued_signal_from_row(row: &Row) -> rusqlite::Result<QueuedSignal> {
    let payload_json: String = row.get("raw_payload")?;
    Ok(QueuedSignal {
        id: Uuid::parse_str(&row.get::<_, String>("id")?).unwrap(),
        user_id: Uuid::parse_str(&row.get::<_, String>("user_id")?).unwrap(),
        exchange: ExchangeId::new(row.get::<_, String>("exchange")?),
        symbol: Symbol::new(row.get::<_, String>("symbol")?),
        timeframe: Timeframe::new(row.get::<_, String>("timeframe")?),
        side: side_from_str(&row.get::<_, String>("side")?),
        entry_price: parse_decimal(&row.get::<_, String>("entry_price")?).unwrap(),
        queued_at: parse_dt(&row.get::<_, String>("queued_at")?).unwrap(),
        promoted_at: parse_dt_opt(row.get("promoted_at")?).unwrap(),
        status: signal_status_from_str(&row.get::<_, String>("status")?),
        raw_payload: serde_json::from_str(&payload_json).unwrap_or(serde_json::Value::Null),
    })
}

#[async_trait]
impl RiskActionRepository for SqliteStore {
    async fn create(&self, action: &RiskAction) -> Result<(), RepositoryError> {
        let action = action.clone();
        let winners_json = serde_json::to_string(&action.winner_details)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO risk_actions (id, user_id, timestamp, action_type, loser_group_id, loser_symbol, loser_pnl_usd, winner_details, notes)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
                params![
                    action.id.to_string(),
                    action.user_id.to_string(),
                    action.timestamp.to_rfc3339(),
                    action_type_to_str(action.action_type),
                    action.loser_group_id.to_string(),
                    action.loser_symbol.as_str(),
                    action.loser_pnl_usd.to_string(),
                    winners_json,
                    action.notes,
                ],
            )
            .map(|_| ())
            .map_err(RepositoryError::from)
        })
        .await
        .and_then(std::convert::identity)
    }

    async fn get_all_for_user(&self, user_id: Uuid) -> Result<Vec<RiskAction>, RepositoryError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM risk_actions WHERE user_id = ?1 ORDER BY timestamp DESC",
            )?;
            let rows = stmt
                .query_map(params![user_id.to_string()], risk_action_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
        .and_then(std::convert::identity)
    }
}

fn action_type_to_str(a: ActionType) -> &'static str {
    match a {
        ActionType::OffsetLoss => "offset_loss",
        ActionType::ManualClose => "manual_close",
        ActionType::EngineClose => "engine_close",
        ActionType::TpExit => "tp_exit",
        ActionType::RiskOffsetClose => "risk_offset_close",
    }
}

fn action_type_from_str(s: &str) -> ActionType {
    match s {
        "manual_close" => ActionType::ManualClose,
        "engine_close" => ActionType::EngineClose,
        "tp_exit" => ActionType::TpExit,
        "risk_offset_close" => ActionType::RiskOffsetClose,
        _ => ActionType::OffsetLoss,
    }
}

fn risk_action_from_row(row: &Row) -> rusqlite::Result<RiskAction> {
    let winners_json: String = row.get("winner_details")?;
    Ok(RiskAction {
        id: Uuid::parse_str(&row.get::<_, String>("id")?).unwrap(),
        user_id: Uuid::parse_str(&row.get::<_, String>("user_id")?).unwrap(),
        timestamp: parse_dt(&row.get::<_, String>("timestamp")?).unwrap(),
        action_type: action_type_from_str(&row.get::<_, String>("action_type")?),
        loser_group_id: Uuid::parse_str(&row.get::<_, String>("loser_group_id")?).unwrap(),
        loser_symbol: Symbol::new(row.get::<_, String>("loser_symbol")?),
        loser_pnl_usd: parse_decimal(&row.get::<_, String>("loser_pnl_usd")?).unwrap(),
        winner_details: serde_json::from_str(&winners_json).unwrap_or_default(),
        notes: row.get("notes")?,
    })
}

#[async_trait]
impl UserConfigRepository for SqliteStore {
    async fn get(&self, user_id: Uuid) -> Result<Option<UserConfig>, RepositoryError> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT * FROM user_config WHERE user_id = ?1",
                params![user_id.to_string()],
                |row| {
                    let risk_json: String = row.get("risk_engine_config")?;
                    let grids_json: String = row.get("grid_configs")?;
                    Ok(UserConfig {
                        user_id,
                        risk_engine_config: serde_json::from_str::<RiskEngineConfig>(&risk_json)
                            .expect("corrupt risk_engine_config JSON"),
                        grid_configs: serde_json::from_str(&grids_json).expect("corrupt grid_configs JSON"),
                        engine_force_stopped: row.get::<_, i64>("engine_force_stopped")? != 0,
                        engine_paused_by_loss_limit: row.get::<_, i64>("engine_paused_by_loss_limit")? != 0,
                    })
                },
            )
            .optional()
            .map_err(RepositoryError::from)
        })
        .await
        .and_then(std::convert::identity)
    }

    async fn update(&self, config: &UserConfig) -> Result<(), RepositoryError> {
        let config = config.clone_for_persist();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO user_config (user_id, risk_engine_config, grid_configs, engine_force_stopped, engine_paused_by_loss_limit)
                 VALUES (?1,?2,?3,?4,?5)
                 ON CONFLICT(user_id) DO UPDATE SET
                    risk_engine_config=excluded.risk_engine_config,
                    grid_configs=excluded.grid_configs,
                    engine_force_stopped=excluded.engine_force_stopped,
                    engine_paused_by_loss_limit=excluded.engine_paused_by_loss_limit",
                params![
                    config.user_id.to_string(),
                    config.risk_engine_config_json,
                    config.grid_configs_json,
                    config.engine_force_stopped as i64,
                    config.engine_paused_by_loss_limit as i64,
                ],
            )
            .map(|_| ())
            .map_err(RepositoryError::from)
        })
        .await
        .and_then(std::convert::identity)
    }

    async fn get_all_active_user_ids(&self) -> Result<Vec<Uuid>, RepositoryError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT user_id FROM user_config WHERE engine_force_stopped = 0")?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .map(|r| r.map(|s| Uuid::parse_str(&s).unwrap()))
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
        .and_then(std::convert::identity)
    }
}

struct PersistableUserConfig {
    user_id: Uuid,
    risk_engine_config_json: String,
    grid_configs_json: String,
    engine_force_stopped: bool,
    engine_paused_by_loss_limit: bool,
}

impl UserConfig {
    fn clone_for_persist(&self) -> PersistableUserConfig {
        PersistableUserConfig {
            user_id: self.user_id,
            risk_engine_config_json: serde_json::to_string(&self.risk_engine_config)
                .expect("RiskEngineConfig always serializes"),
            grid_configs_json: serde_json::to_string(&self.grid_configs)
                .expect("grid config map always serializes"),
            engine_force_stopped: self.engine_force_stopped,
            engine_paused_by_loss_limit: self.engine_paused_by_loss_limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EntryOrderType, TimerStartCondition};
    use crate::domain::position_group::PositionStatus;
    use rust_decimal_macros::dec;

    fn sample_group(user_id: Uuid) -> PositionGroup {
        PositionGroup {
            id: Uuid::new_v4(),
            user_id,
            exchange: ExchangeId::new("binance"),
            symbol: Symbol::new("BTCUSDT"),
            timeframe: Timeframe::new("60m"),
            side: Side::Buy,
            base_entry_price: dec!(100),
            weighted_avg_entry: dec!(100),
            total_invested_usd: dec!(0),
            total_filled_quantity: dec!(0),
            unrealized_pnl_usd: dec!(0),
            unrealized_pnl_pct: dec!(0),
            realized_pnl_usd: dec!(0),
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
    async fn create_then_get_round_trips() {
        let store = SqliteStore::open_in_memory().unwrap();
        let user_id = Uuid::new_v4();
        let group = sample_group(user_id);

        PositionRepository::create(&store, &group).await.unwrap();
        let fetched = PositionRepository::get(&store, group.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, group.id);
        assert_eq!(fetched.base_entry_price, dec!(100));
    }

    #[tokio::test]
    async fn duplicate_open_position_is_rejected() {
        let store = SqliteStore::open_in_memory().unwrap();
        let user_id = Uuid::new_v4();
        let first = sample_group(user_id);
        let mut second = sample_group(user_id);
        second.id = Uuid::new_v4();

        PositionRepository::create(&store, &first).await.unwrap();
        let result = PositionRepository::create(&store, &second).await;
        assert!(matches!(result, Err(RepositoryError::UniqueViolation(_))));
    }

    #[tokio::test]
    async fn closed_position_does_not_block_a_new_one() {
        let store = SqliteStore::open_in_memory().unwrap();
        let user_id = Uuid::new_v4();
        let mut first = sample_group(user_id);
        first.status = PositionStatus::Closed;
        first.closed_at = Some(Utc::now());
        let second = sample_group(user_id);

        PositionRepository::create(&store, &first).await.unwrap();
        PositionRepository::create(&store, &second).await.unwrap();
    }

    #[tokio::test]
    async fn increment_pyramid_count_is_atomic_and_returns_new_value() {
        let store = SqliteStore::open_in_memory().unwrap();
        let group = sample_group(Uuid::new_v4());
        PositionRepository::create(&store, &group).await.unwrap();

        let new_count = PositionRepository::increment_pyramid_count(&store, group.id, 5).await.unwrap();
        assert_eq!(new_count, 2);
        let fetched = PositionRepository::get(&store, group.id).await.unwrap().unwrap();
        assert_eq!(fetched.total_dca_legs, 10);
    }

    #[tokio::test]
    async fn user_config_round_trips() {
        let store = SqliteStore::open_in_memory().unwrap();
        let user_id = Uuid::new_v4();
        let config = UserConfig {
            user_id,
            risk_engine_config: RiskEngineConfig {
                evaluate_interval_seconds: 60,
                evaluate_on_fill: true,
                max_positions_per_symbol_timeframe_exchange: 2,
                max_total_exposure_usd: dec!(10000),
                max_realized_loss_usd: dec!(500),
                timer_start_condition: TimerStartCondition::AfterAllDcaSubmitted,
                post_full_wait_minutes: 60,
                reset_timer_on_replacement: true,
                required_pyramids_for_timer: 1,
                loss_threshold_percent: dec!(-5),
                max_winners_to_combine: 3,
                slippage_action: None,
                max_slippage_percent: None,
            },
            grid_configs: HashMap::new(),
            engine_force_stopped: false,
            engine_paused_by_loss_limit: false,
        };
        let _ = EntryOrderType::Limit;

        UserConfigRepository::update(&store, &config).await.unwrap();
        let fetched = UserConfigRepository::get(&store, user_id).await.unwrap().unwrap();
        assert_eq!(fetched.risk_engine_config.evaluate_interval_seconds, 60);
    }
}
