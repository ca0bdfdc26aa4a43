//! `ExchangeConnector`: a uniform, CCXT-style facade over exchange calls.
//!
//! Defined as an `#[async_trait]` rather than relying on native
//! async-fn-in-trait because `ConnectorRegistry` stores these behind
//! `Arc<dyn ExchangeConnector>` — a pattern grounded in how
//! `aibysid-HyperLiquidMM`'s market-making engine boxes its exchange clients
//! for the same reason.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::HashMap;

use crate::error::ExchangeError;
use crate::types::{Side, Symbol};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmountType {
    Base,
    Quote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOrderType {
    Limit,
    Market,
}

/// The envelope returned by `place_order` and `get_order_status`, shaped
/// after a normalized CCXT order response.
#[derive(Debug, Clone)]
pub struct ExchangeOrderResponse {
    pub id: String,
    pub status: String,
    pub filled: Decimal,
    pub average: Option<Decimal>,
    pub fee: Option<Decimal>,
    pub fee_currency: Option<String>,
    /// Raw exchange payload, preserved for callers that need
    /// exchange-specific fields `get_order_status`'s normalized view drops
    /// (e.g. CoinDCX's `info.cumFeeDetail`).
    pub info: Value,
}

#[derive(Debug, Clone, Copy)]
pub struct PrecisionRule {
    pub tick_size: Decimal,
    pub step_size: Decimal,
    pub min_notional: Decimal,
}

impl Default for PrecisionRule {
    /// Fallback precision used when a fetch fails: `10^-8` tick/step, zero
    /// minimum notional (permissive, since the real constraint is unknown).
    fn default() -> Self {
        Self {
            tick_size: Decimal::new(1, 8),
            step_size: Decimal::new(1, 8),
            min_notional: Decimal::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Ticker {
    pub symbol: Symbol,
    pub last: Decimal,
}

#[derive(Debug, Clone)]
pub struct Balance {
    pub total: Decimal,
    pub free: Decimal,
}

/// Uniform facade over one exchange account. Each call may fail with a
/// transient or permanent [`ExchangeError`].
#[async_trait]
pub trait ExchangeConnector: Send + Sync {
    async fn place_order(
        &self,
        symbol: &Symbol,
        order_type: RequestOrderType,
        side: Side,
        quantity: Decimal,
        price: Option<Decimal>,
        amount_type: AmountType,
    ) -> Result<ExchangeOrderResponse, ExchangeError>;

    async fn cancel_order(
        &self,
        order_id: &str,
        symbol: &Symbol,
    ) -> Result<ExchangeOrderResponse, ExchangeError>;

    async fn get_order_status(
        &self,
        order_id: &str,
        symbol: &Symbol,
    ) -> Result<ExchangeOrderResponse, ExchangeError>;

    async fn get_current_price(&self, symbol: &Symbol) -> Result<Decimal, ExchangeError>;

    async fn get_all_tickers(&self) -> Result<HashMap<Symbol, Ticker>, ExchangeError>;

    async fn get_precision_rules(
        &self,
    ) -> Result<HashMap<Symbol, PrecisionRule>, ExchangeError>;

    async fn get_trading_fee_rate(&self, symbol: &Symbol) -> Result<Decimal, ExchangeError>;

    async fn fetch_free_balance(&self) -> Result<HashMap<String, Decimal>, ExchangeError>;

    async fn fetch_balance(&self) -> Result<HashMap<String, Balance>, ExchangeError>;

    /// Spot exchanges have no derivatives-style positions; connectors return
    /// derived long balances per currency.
    async fn get_positions(&self) -> Result<Vec<Balance>, ExchangeError>;

    async fn close(&self) -> Result<(), ExchangeError>;
}
