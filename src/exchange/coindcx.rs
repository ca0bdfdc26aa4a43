//! Reference CoinDCX connector.
//!
//! Carries forward the teacher's `coindcx::client::CoinDCXClient` composition
//! of circuit breaker + rate limiter + exponential backoff around every
//! HTTP call (`execute_with_retry`), and its HMAC-SHA256 request signing.
//! The teacher's `auth.rs`/`types.rs` siblings were absent from this
//! checkout, so the signing helper and response shapes are rebuilt here
//! rather than patched in from a file that did not exist.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::common::{CircuitBreaker, CircuitBreakerConfig, RateLimiter, RateLimiterConfig};
use crate::decimal as lenient_decimal;
use crate::error::ExchangeError;
use crate::types::{Side, Symbol};

use super::connector::{
    AmountType, Balance, ExchangeConnector, ExchangeOrderResponse, PrecisionRule,
    RequestOrderType, Ticker,
};

const DEFAULT_BASE_URL: &str = "https://api.coindcx.com";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub max_requests_per_second: usize,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            max_requests_per_second: 10,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_rate_limit(mut self, requests_per_second: usize) -> Self {
        self.max_requests_per_second = requests_per_second;
        self
    }
}

pub struct CoinDcxConnector {
    http: reqwest::Client,
    config: ClientConfig,
    api_key: String,
    api_secret: String,
    rate_limiter: RateLimiter,
    circuit_breaker: Arc<Mutex<CircuitBreaker>>,
}

impl CoinDcxConnector {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self::with_config(api_key, api_secret, ClientConfig::default())
    }

    pub fn with_config(
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
        config: ClientConfig,
    ) -> Self {
        let rate_limiter = RateLimiter::new(RateLimiterConfig::default().with_rate(config.max_requests_per_second));
        let circuit_breaker = Arc::new(Mutex::new(CircuitBreaker::new(config.circuit_breaker.clone())));
        Self {
            http: reqwest::Client::new(),
            config,
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            rate_limiter,
            circuit_breaker,
        }
    }

    fn sign(&self, body: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(body.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Runs `operation` with the shared circuit breaker and rate limiter,
    /// retrying transient failures with `base_delay * 2^attempt` backoff up
    /// to 3 attempts total, mirroring `execute_with_retry`.
    async fn execute_with_retry<F, Fut>(&self, mut operation: F) -> Result<Value, ExchangeError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<Value, ExchangeError>>,
    {
        const MAX_ATTEMPTS: u32 = 3;
        let mut attempt = 0;

        loop {
            {
                let mut breaker = self.circuit_breaker.lock().await;
                if !breaker.can_attempt() {
                    return Err(ExchangeError::Connection("circuit breaker open".into()));
                }
            }
            self.rate_limiter.acquire().await;

            match operation().await {
                Ok(value) => {
                    self.circuit_breaker.lock().await.record_success();
                    return Ok(value);
                }
                Err(err) if err.is_transient() && attempt + 1 < MAX_ATTEMPTS => {
                    self.circuit_breaker.lock().await.record_failure();
                    let wait_ms = 1000u64 * 2u64.pow(attempt);
                    tokio::time::sleep(std::time::Duration::from_millis(wait_ms)).await;
                    attempt += 1;
                }
                Err(err) => {
                    self.circuit_breaker.lock().await.record_failure();
                    return Err(err);
                }
            }
        }
    }

    async fn authenticated_post(&self, path: &str, mut payload: Value) -> Result<Value, ExchangeError> {
        let timestamp = chrono::Utc::now().timestamp_millis();
        payload["timestamp"] = json!(timestamp);
        let body = serde_json::to_string(&payload)
            .map_err(|e| ExchangeError::Connection(e.to_string()))?;
        let signature = self.sign(&body);
        let url = format!("{}{}", self.config.base_url, path);

        let response = self
            .http
            .post(&url)
            .header("Content-Type", "application/json")
            .header("X-AUTH-APIKEY", &self.api_key)
            .header("X-AUTH-SIGNATURE", signature)
            .body(body)
            .send()
            .await
            .map_err(|e| ExchangeError::Connection(e.to_string()))?;

        let status = response.status();
        let value: Value = response
            .json()
            .await
            .map_err(|e| ExchangeError::Connection(e.to_string()))?;

        if status.is_server_error() || status.as_u16() == 429 {
            return Err(ExchangeError::Connection(format!("transient HTTP {status}")));
        }
        if !status.is_success() {
            let message = value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown CoinDCX error")
                .to_string();
            if message.to_lowercase().contains("not found") || message.to_lowercase().contains("invalid order") {
                return Err(ExchangeError::OrderNotFound {
                    order_id: payload.get("id").map(|v| v.to_string()).unwrap_or_default(),
                    symbol: payload.get("market").and_then(Value::as_str).unwrap_or_default().to_string(),
                });
            }
            return Err(ExchangeError::Api { message, status_code: Some(status.as_u16()) });
        }
        Ok(value)
    }

    fn parse_order(value: &Value) -> ExchangeOrderResponse {
        let id = value.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
        let status = value.get("status").and_then(Value::as_str).unwrap_or("open").to_string();
        let filled = value
            .get("total_quantity")
            .zip(value.get("remaining_quantity"))
            .and_then(|(total, remaining)| {
                let total = lenient_decimal::from_value(total).ok()?;
                let remaining = lenient_decimal::from_value(remaining).ok()?;
                Some(total - remaining)
            })
            .unwrap_or(Decimal::ZERO);
        let average = value
            .get("avg_price")
            .and_then(|v| lenient_decimal::from_value(v).ok())
            .filter(|p| *p > Decimal::ZERO);

        // CoinDCX's unified `fee_amount` field has been observed to
        // misreport for multi-currency fills; prefer the raw per-currency
        // breakdown under `info.cumFeeDetail` when present.
        let (fee, fee_currency) = value
            .get("cumFeeDetail")
            .and_then(Value::as_object)
            .and_then(|detail| detail.iter().next())
            .and_then(|(currency, amount)| {
                let amount = lenient_decimal::from_value(amount).ok()?;
                Some((Some(amount), Some(currency.clone())))
            })
            .unwrap_or_else(|| {
                let fee = value.get("fee_amount").and_then(|v| lenient_decimal::from_value(v).ok());
                (fee, None)
            });

        ExchangeOrderResponse { id, status, filled, average, fee, fee_currency, info: value.clone() }
    }
}

#[async_trait]
impl ExchangeConnector for CoinDcxConnector {
    async fn place_order(
        &self,
        symbol: &Symbol,
        order_type: RequestOrderType,
        side: Side,
        quantity: Decimal,
        price: Option<Decimal>,
        amount_type: AmountType,
    ) -> Result<ExchangeOrderResponse, ExchangeError> {
        let order_type_str = match order_type {
            RequestOrderType::Limit => "limit_order",
            RequestOrderType::Market => "market_order",
        };
        let mut payload = json!({
            "market": symbol.as_str(),
            "side": side.to_string(),
            "order_type": order_type_str,
        });
        match amount_type {
            AmountType::Quote => payload["total_quantity_in_quote"] = json!(quantity.to_string()),
            AmountType::Base => payload["total_quantity"] = json!(quantity.to_string()),
        }
        if let (RequestOrderType::Limit, Some(p)) = (order_type, price) {
            payload["price_per_unit"] = json!(p.to_string());
        }

        let value = self
            .execute_with_retry(|| async { self.authenticated_post("/exchange/v1/orders/create", payload.clone()).await })
            .await?;
        let order = value.get("orders").and_then(Value::as_array).and_then(|o| o.first()).unwrap_or(&value);
        Ok(Self::parse_order(order))
    }

    async fn cancel_order(&self, order_id: &str, symbol: &Symbol) -> Result<ExchangeOrderResponse, ExchangeError> {
        let payload = json!({ "id": order_id, "market": symbol.as_str() });
        match self
            .execute_with_retry(|| async { self.authenticated_post("/exchange/v1/orders/cancel", payload.clone()).await })
            .await
        {
            Ok(value) => Ok(Self::parse_order(&value)),
            Err(ExchangeError::OrderNotFound { order_id, symbol }) => {
                Err(ExchangeError::OrderNotFound { order_id, symbol })
            }
            Err(other) => Err(other),
        }
    }

    async fn get_order_status(&self, order_id: &str, symbol: &Symbol) -> Result<ExchangeOrderResponse, ExchangeError> {
        let payload = json!({ "id": order_id, "market": symbol.as_str() });
        let value = self
            .execute_with_retry(|| async { self.authenticated_post("/exchange/v1/orders/status", payload.clone()).await })
            .await?;
        Ok(Self::parse_order(&value))
    }

    async fn get_current_price(&self, symbol: &Symbol) -> Result<Decimal, ExchangeError> {
        let tickers = self.get_all_tickers().await?;
        tickers
            .get(symbol)
            .map(|t| t.last)
            .ok_or_else(|| ExchangeError::Api { message: format!("no ticker for {symbol}"), status_code: None })
    }

    async fn get_all_tickers(&self) -> Result<HashMap<Symbol, Ticker>, ExchangeError> {
        self.rate_limiter.acquire().await;
        let url = format!("{}/exchange/ticker", self.config.base_url);
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
            let (Some(market), Some(last_value)) = (entry.get("market").and_then(Value::as_str), entry.get("last_price")) else {
                continue;
            };
            if let Ok(last) = lenient_decimal::from_value(last_value) {
                let symbol = Symbol::new(market);
                tickers.insert(symbol.clone(), Ticker { symbol, last });
            }
        }
        Ok(tickers)
    }

    async fn get_precision_rules(&self) -> Result<HashMap<Symbol, PrecisionRule>, ExchangeError> {
        self.rate_limiter.acquire().await;
        let url = format!("{}/exchange/v1/markets_details", self.config.base_url);
        let body: Vec<Value> = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ExchangeError::Connection(e.to_string()))?
            .json()
            .await
            .map_err(|e| ExchangeError::Connection(e.to_string()))?;

        let mut rules = HashMap::new();
        for entry in body {
            let Some(symbol_str) = entry.get("symbol").and_then(Value::as_str) else { continue };
            let default = PrecisionRule::default();
            let tick_size = entry
                .get("price_increment")
                .and_then(|v| lenient_decimal::from_value(v).ok())
                .unwrap_or(default.tick_size);
            let step_size = entry
                .get("step")
                .and_then(|v| lenient_decimal::from_value(v).ok())
                .unwrap_or(default.step_size);
            let min_notional = entry
                .get("min_notional")
                .and_then(|v| lenient_decimal::from_value(v).ok())
                .unwrap_or(default.min_notional);
            rules.insert(Symbol::new(symbol_str), PrecisionRule { tick_size, step_size, min_notional });
        }
        Ok(rules)
    }

    async fn get_trading_fee_rate(&self, _symbol: &Symbol) -> Result<Decimal, ExchangeError> {
        Ok(Decimal::new(1, 3))
    }

    async fn fetch_free_balance(&self) -> Result<HashMap<String, Decimal>, ExchangeError> {
        let balances = self.fetch_balance().await?;
        Ok(balances.into_iter().map(|(k, v)| (k, v.free)).collect())
    }

    async fn fetch_balance(&self) -> Result<HashMap<String, Balance>, ExchangeError> {
        let value = self
            .execute_with_retry(|| async { self.authenticated_post("/exchange/v1/users/balances", json!({})).await })
            .await?;
        let mut balances = HashMap::new();
        if let Some(entries) = value.as_array() {
            for entry in entries {
                let Some(currency) = entry.get("currency").and_then(Value::as_str) else { continue };
                let free = entry.get("balance").and_then(|v| lenient_decimal::from_value(v).ok()).unwrap_or(Decimal::ZERO);
                let locked = entry.get("locked_balance").and_then(|v| lenient_decimal::from_value(v).ok()).unwrap_or(Decimal::ZERO);
                balances.insert(currency.to_string(), Balance { total: free + locked, free });
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signing_is_deterministic() {
        let connector = CoinDcxConnector::new("key", "secret");
        let sig1 = connector.sign(r#"{"a":1}"#);
        let sig2 = connector.sign(r#"{"a":1}"#);
        assert_eq!(sig1, sig2);
        assert_eq!(sig1.len(), 64);
    }

    #[test]
    fn prefers_cum_fee_detail_over_unified_field() {
        let raw = json!({
            "id": "abc",
            "status": "filled",
            "total_quantity": "1.0",
            "remaining_quantity": "0.0",
            "avg_price": "100.0",
            "fee_amount": "0.5",
            "cumFeeDetail": {"USDT": "0.1"}
        });
        let parsed = CoinDcxConnector::parse_order(&raw);
        assert_eq!(parsed.fee, Some(Decimal::new(1, 1)));
        assert_eq!(parsed.fee_currency.as_deref(), Some("USDT"));
    }
}
