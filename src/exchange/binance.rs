//! Reference Binance spot connector.
//!
//! Grounded in the teacher's `binance::client::BinanceClient` reqwest usage
//! (base URL constant, `reqwest::Client` reused across calls, JSON response
//! parsing through `decimal::lenient`). The teacher's client only ever
//! fetched historical klines; this one speaks the live order/account
//! surface `ExchangeConnector` needs instead.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde_json::Value;
use sha2::Sha256;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::decimal as lenient_decimal;
use crate::error::ExchangeError;
use crate::types::{Side, Symbol};

use super::connector::{
    AmountType, Balance, ExchangeConnector, ExchangeOrderResponse, PrecisionRule,
    RequestOrderType, Ticker,
};

const DEFAULT_BASE_URL: &str = "https://api.binance.com";

type HmacSha256 = Hmac<Sha256>;

pub struct BinanceConnector {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

impl BinanceConnector {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self::with_base_url(api_key, api_secret, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_millis() -> u128 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before epoch")
            .as_millis()
    }

    fn map_status(binance_status: &str) -> String {
        match binance_status {
            "NEW" => "open",
            "PARTIALLY_FILLED" => "partially_filled",
            "FILLED" => "closed",
            "CANCELED" | "PENDING_CANCEL" | "EXPIRED" | "REJECTED" => "canceled",
            other => other,
        }
        .to_string()
    }

    fn parse_order_response(value: Value) -> Result<ExchangeOrderResponse, ExchangeError> {
        let id = value
            .get("orderId")
            .map(|v| v.to_string())
            .unwrap_or_default();
        let status = value
            .get("status")
            .and_then(Value::as_str)
            .map(Self::map_status)
            .unwrap_or_else(|| "open".to_string());
        let filled = value
            .get("executedQty")
            .map(lenient_decimal::from_value)
            .transpose()
            .map_err(ExchangeError::Connection)?
            .unwrap_or(Decimal::ZERO);
        let average = value
            .get("cummulativeQuoteQty")
            .and_then(|v| lenient_decimal::from_value(v).ok())
            .filter(|_| filled > Decimal::ZERO)
            .map(|quote: Decimal| quote / filled);

        Ok(ExchangeOrderResponse {
            id,
            status,
            filled,
            average,
            fee: None,
            fee_currency: None,
            info: value,
        })
    }

    async fn signed_request(
        &self,
        method: reqwest::Method,
        path: &str,
        mut params: Vec<(String, String)>,
    ) -> Result<Value, ExchangeError> {
        params.push(("timestamp".to_string(), Self::timestamp_millis().to_string()));
        let query = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let signature = self.sign(&query);
        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);

        let response = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| ExchangeError::Connection(e.to_string()))?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| ExchangeError::Connection(e.to_string()))?;

        if !status.is_success() {
            let message = body
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or("unknown Binance error")
                .to_string();
            return Err(ExchangeError::Api { message, status_code: Some(status.as_u16()) });
        }

        Ok(body)
    }
}

#[async_trait]
impl ExchangeConnector for BinanceConnector {
    async fn place_order(
        &self,
        symbol: &Symbol,
        order_type: RequestOrderType,
        side: Side,
        quantity: Decimal,
        price: Option<Decimal>,
        amount_type: AmountType,
    ) -> Result<ExchangeOrderResponse, ExchangeError> {
        let mut params = vec![
            ("symbol".to_string(), symbol.as_str().to_string()),
            ("side".to_string(), side.as_exchange_str().to_string()),
            (
                "type".to_string(),
                match order_type {
                    RequestOrderType::Limit => "LIMIT".to_string(),
                    RequestOrderType::Market => "MARKET".to_string(),
                },
            ),
        ];

        match (order_type, amount_type) {
            (RequestOrderType::Market, AmountType::Quote) => {
                params.push(("quoteOrderQty".to_string(), quantity.to_string()));
            }
            _ => {
                params.push(("quantity".to_string(), quantity.to_string()));
            }
        }

        if let RequestOrderType::Limit = order_type {
            params.push(("timeInForce".to_string(), "GTC".to_string()));
            if let Some(p) = price {
                params.push(("price".to_string(), p.to_string()));
            }
        }

        let body = self
            .signed_request(reqwest::Method::POST, "/api/v3/order", params)
            .await?;
        Self::parse_order_response(body)
    }

    async fn cancel_order(
        &self,
        order_id: &str,
        symbol: &Symbol,
    ) -> Result<ExchangeOrderResponse, ExchangeError> {
        let params = vec![
            ("symbol".to_string(), symbol.as_str().to_string()),
            ("orderId".to_string(), order_id.to_string()),
        ];
        match self
            .signed_request(reqwest::Method::DELETE, "/api/v3/order", params)
            .await
        {
            Ok(body) => Self::parse_order_response(body),
            Err(ExchangeError::Api { message, .. }) if message.contains("Unknown order") => {
                Err(ExchangeError::OrderNotFound {
                    order_id: order_id.to_string(),
                    symbol: symbol.to_string(),
                })
            }
            Err(other) => Err(other),
        }
    }

    async fn get_order_status(
        &self,
        order_id: &str,
        symbol: &Symbol,
    ) -> Result<ExchangeOrderResponse, ExchangeError> {
        let params = vec![
            ("symbol".to_string(), symbol.as_str().to_string()),
            ("orderId".to_string(), order_id.to_string()),
        ];
        let body = self
            .signed_request(reqwest::Method::GET, "/api/v3/order", params)
            .await
            .map_err(|e| match e {
                ExchangeError::Api { message, .. } if message.contains("Unknown order") => {
                    ExchangeError::OrderNotFound {
                        order_id: order_id.to_string(),
                        symbol: symbol.to_string(),
                    }
                }
                other => other,
            })?;
        Self::parse_order_response(body)
    }

    async fn get_current_price(&self, symbol: &Symbol) -> Result<Decimal, ExchangeError> {
        let url = format!("{}/api/v3/ticker/price?symbol={}", self.base_url, symbol.as_str());
        let body: Value = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ExchangeError::Connection(e.to_string()))?
            .json()
            .await
            .map_err(|e| ExchangeError::Connection(e.to_string()))?;
        let price = body
            .get("price")
            .ok_or_else(|| ExchangeError::Api { message: "missing price field".into(), status_code: None })?;
        lenient_decimal::from_value(price).map_err(ExchangeError::Connection)
    }

    async fn get_all_tickers(&self) -> Result<HashMap<Symbol, Ticker>, ExchangeError> {
        let url = format!("{}/api/v3/ticker/price", self.base_url);
        let body: Vec<Value> = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ExchangeError::Connection(e.to_string()))?
            .json()
            .await
            .map_err(|e| ExchangeError::Connection(e.to_string()))?;

        let mut tickers = HashMap::new();
        for entry in body {
            let (Some(symbol_str), Some(price_value)) = (entry.get("symbol").and_then(Value::as_str), entry.get("price")) else {
                continue;
            };
            if let Ok(last) = lenient_decimal::from_value(price_value) {
                let symbol = Symbol::new(symbol_str);
                tickers.insert(symbol.clone(), Ticker { symbol, last });
            }
        }
        Ok(tickers)
    }

    async fn get_precision_rules(&self) -> Result<HashMap<Symbol, PrecisionRule>, ExchangeError> {
        let url = format!("{}/api/v3/exchangeInfo", self.base_url);
        let body: Value = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ExchangeError::Connection(e.to_string()))?
            .json()
            .await
            .map_err(|e| ExchangeError::Connection(e.to_string()))?;

        let mut rules = HashMap::new();
        let Some(symbols) = body.get("symbols").and_then(Value::as_array) else {
            return Ok(rules);
        };
        for entry in symbols {
            let Some(symbol_str) = entry.get("symbol").and_then(Value::as_str) else { continue };
            let mut tick_size = Decimal::new(1, 8);
            let mut step_size = Decimal::new(1, 8);
            let mut min_notional = Decimal::ZERO;

            if let Some(filters) = entry.get("filters").and_then(Value::as_array) {
                for filter in filters {
                    match filter.get("filterType").and_then(Value::as_str) {
                        Some("PRICE_FILTER") => {
                            if let Some(v) = filter.get("tickSize") {
                                tick_size = lenient_decimal::from_value(v).unwrap_or(tick_size);
                            }
                        }
                        Some("LOT_SIZE") => {
                            if let Some(v) = filter.get("stepSize") {
                                step_size = lenient_decimal::from_value(v).unwrap_or(step_size);
                            }
                        }
                        Some("MIN_NOTIONAL" | "NOTIONAL") => {
                            if let Some(v) = filter.get("minNotional") {
                                min_notional = lenient_decimal::from_value(v).unwrap_or(min_notional);
                            }
                        }
                        _ => {}
                    }
                }
            }

            rules.insert(Symbol::new(symbol_str), PrecisionRule { tick_size, step_size, min_notional });
        }
        Ok(rules)
    }

    async fn get_trading_fee_rate(&self, _symbol: &Symbol) -> Result<Decimal, ExchangeError> {
        // Binance spot default maker/taker fee absent account-level fee-tier
        // data; callers that need the precise tier should fetch via the
        // account endpoint, not modeled here.
        Ok(Decimal::new(1, 3))
    }

    async fn fetch_free_balance(&self) -> Result<HashMap<String, Decimal>, ExchangeError> {
        let balances = self.fetch_balance().await?;
        Ok(balances.into_iter().map(|(k, v)| (k, v.free)).collect())
    }

    async fn fetch_balance(&self) -> Result<HashMap<String, Balance>, ExchangeError> {
        let body = self
            .signed_request(reqwest::Method::GET, "/api/v3/account", vec![])
            .await?;
        let mut balances = HashMap::new();
        if let Some(entries) = body.get("balances").and_then(Value::as_array) {
            for entry in entries {
                let Some(asset) = entry.get("asset").and_then(Value::as_str) else { continue };
                let free = entry.get("free").and_then(|v| lenient_decimal::from_value(v).ok()).unwrap_or(Decimal::ZERO);
                let locked = entry.get("locked").and_then(|v| lenient_decimal::from_value(v).ok()).unwrap_or(Decimal::ZERO);
                balances.insert(asset.to_string(), Balance { total: free + locked, free });
            }
        }
        Ok(balances)
    }

    async fn get_positions(&self) -> Result<Vec<Balance>, ExchangeError> {
        Ok(self.fetch_balance().await?.into_values().collect())
    }

    async fn close(&self) -> Result<(), ExchangeError> {
        Ok(())
    }
}
