//! Exchange-facing connectors: the `ExchangeConnector` trait plus two thin
//! reference implementations (Binance spot, CoinDCX). Neither is a complete
//! exchange SDK — just enough surface to exercise `OrderService` against a
//! believable HTTP backend.

pub mod binance;
pub mod coindcx;
pub mod connector;

pub use connector::{
    AmountType, Balance, ExchangeConnector, ExchangeOrderResponse, PrecisionRule,
    RequestOrderType, Ticker,
};

use std::collections::HashMap;
use std::sync::Arc;

use crate::types::ExchangeId;

/// One connector per configured exchange, acquired once per `FillMonitor`
/// cycle and shared by every user trading on that exchange (spec §5:
/// "one per (user, exchange) per cycle... never shared across users" refers
/// to the per-user *work*, not the connector handle itself, which is stateless
/// HTTP plumbing safe to share).
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    connectors: HashMap<ExchangeId, Arc<dyn ExchangeConnector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, exchange: ExchangeId, connector: Arc<dyn ExchangeConnector>) {
        self.connectors.insert(exchange, connector);
    }

    pub fn get(&self, exchange: &ExchangeId) -> Option<Arc<dyn ExchangeConnector>> {
        self.connectors.get(exchange).cloned()
    }

    pub fn exchanges(&self) -> impl Iterator<Item = &ExchangeId> {
        self.connectors.keys()
    }
}
