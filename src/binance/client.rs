// =============================================================================
// Binance REST API Client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. All signed requests
// include X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between the bot and Binance servers.
// =============================================================================

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument, warn};

use crate::market_data::Candle;

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Binance REST API client with HMAC-SHA256 request signing.
#[derive(Clone)]
pub struct BinanceClient {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl BinanceClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new `BinanceClient`.
    ///
    /// # Arguments
    /// * `api_key` — Binance API key (sent as a header, never in query params).
    /// * `secret`  — Binance secret key used exclusively for HMAC signing.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        // The API key header is required for all signed endpoints.
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!("BinanceClient initialised (base_url=https://api.binance.com)");

        Self {
            api_key,
            secret,
            base_url: "https://api.binance.com".to_string(),
            client,
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Produce an HMAC-SHA256 hex signature of `query`.
    pub fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Current UNIX timestamp in milliseconds.
    pub fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Build the full query string for a signed request (appends timestamp,
    /// recvWindow, and signature).
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Account / balance
    // -------------------------------------------------------------------------

    /// GET /api/v3/account (signed).
    #[instrument(skip(self), name = "binance::get_account")]
    pub async fn get_account(&self) -> Result<serde_json::Value> {
        let qs = self.signed_query("");
        let url = format!("{}/api/v3/account?{}", self.base_url, qs);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/account request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse account response")?;

        if !status.is_success() {
            anyhow::bail!(
                "Binance GET /api/v3/account returned {}: {}",
                status,
                body
            );
        }

        debug!("account info retrieved successfully");
        Ok(body)
    }

    /// Convenience: extract the free balance for a single `asset`.
    #[instrument(skip(self), name = "binance::get_balance")]
    pub async fn get_balance(&self, asset: &str) -> Result<f64> {
        let account = self.get_account().await?;

        let balances = account["balances"]
            .as_array()
            .context("account response missing 'balances' array")?;

        for b in balances {
            if b["asset"].as_str() == Some(asset) {
                let free: f64 = b["free"]
                    .as_str()
                    .unwrap_or("0")
                    .parse()
                    .unwrap_or(0.0);
                debug!(asset, free, "balance retrieved");
                return Ok(free);
            }
        }

        warn!(asset, "asset not found in balances — returning 0.0");
        Ok(0.0)
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// POST /api/v3/order (signed) — submit a new order.
    ///
    /// # Arguments
    /// * `symbol`          — e.g. "BTCUSDT"
    /// * `side`            — "BUY" or "SELL"
    /// * `order_type`      — "LIMIT", "MARKET", etc.
    /// * `quantity`        — order quantity
    /// * `price`           — required for LIMIT orders
    /// * `time_in_force`   — e.g. "GTC"; required for LIMIT orders
    /// * `client_order_id` — optional custom order id
    #[instrument(skip(self, price, time_in_force, client_order_id), name = "binance::place_order")]
    pub async fn place_order(
        &self,
        symbol: &str,
        side: &str,
        order_type: &str,
        quantity: f64,
        price: Option<f64>,
        time_in_force: Option<&str>,
        client_order_id: Option<&str>,
    ) -> Result<serde_json::Value> {
        let mut params = format!(
            "symbol={symbol}&side={side}&type={order_type}&quantity={quantity}"
        );

        if let Some(p) = price {
            params.push_str(&format!("&price={p}"));
        }
        if let Some(tif) = time_in_force {
            params.push_str(&format!("&timeInForce={tif}"));
        }
        if let Some(coid) = client_order_id {
            params.push_str(&format!("&newClientOrderId={coid}"));
        }

        let qs = self.signed_query(&params);
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);

        debug!(symbol, side, order_type, quantity, "placing order");

        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .context("POST /api/v3/order request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse order response")?;

        if !status.is_success() {
            anyhow::bail!(
                "Binance POST /api/v3/order returned {}: {}",
                status,
                body
            );
        }

        debug!(symbol, side, "order placed successfully");
        Ok(body)
    }

    /// DELETE /api/v3/order (signed) — cancel an existing order.
    #[instrument(skip(self), name = "binance::cancel_order")]
    pub async fn cancel_order(
        &self,
        symbol: &str,
        order_id: u64,
    ) -> Result<serde_json::Value> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        let qs = self.signed_query(&params);
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);

        debug!(symbol, order_id, "cancelling order");

        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .context("DELETE /api/v3/order request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse cancel response")?;

        if !status.is_success() {
            anyhow::bail!(
                "Binance DELETE /api/v3/order returned {}: {}",
                status,
                body
            );
        }

        debug!(symbol, order_id, "order cancelled");
        Ok(body)
    }

    /// GET /api/v3/openOrders (signed).
    #[instrument(skip(self), name = "binance::get_open_orders")]
    pub async fn get_open_orders(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<serde_json::Value>> {
        let params = match symbol {
            Some(s) => format!("symbol={s}"),
            None => String::new(),
        };
        let qs = self.signed_query(&params);
        let url = format!("{}/api/v3/openOrders?{}", self.base_url, qs);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/openOrders request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse openOrders response")?;

        if !status.is_success() {
            anyhow::bail!(
                "Binance GET /api/v3/openOrders returned {}: {}",
                status,
                body
            );
        }

        let orders: Vec<serde_json::Value> = body
            .as_array()
            .cloned()
            .unwrap_or_default();

        debug!(count = orders.len(), "open orders retrieved");
        Ok(orders)
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    /// GET /api/v3/klines (public — no signature required).
    ///
    /// Returns a vector of [`Candle`] structs parsed from Binance's array-of-
    /// arrays response format.
    ///
    /// Array indices:
    ///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
    ///   [6] closeTime, [7] quoteAssetVolume, [8] numberOfTrades,
    ///   [9] takerBuyBaseVolume, [10] takerBuyQuoteVolume
    #[instrument(skip(self), name = "binance::get_klines")]
    pub async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Candle>> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, interval, limit
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/klines request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse klines response")?;

        if !status.is_success() {
            anyhow::bail!(
                "Binance GET /api/v3/klines returned {}: {}",
                status,
                body
            );
        }

        let raw = body
            .as_array()
            .context("klines response is not an array")?;

        let mut candles = Vec::with_capacity(raw.len());

        for entry in raw {
            let arr = entry
                .as_array()
                .context("kline entry is not an array")?;

            if arr.len() < 11 {
                warn!("skipping malformed kline entry with {} elements", arr.len());
                continue;
            }

            let open_time = arr[0].as_i64().unwrap_or(0);
            let open = Self::parse_str_f64(&arr[1])?;
            let high = Self::parse_str_f64(&arr[2])?;
            let low = Self::parse_str_f64(&arr[3])?;
            let close = Self::parse_str_f64(&arr[4])?;
            let volume = Self::parse_str_f64(&arr[5])?;
            let close_time = arr[6].as_i64().unwrap_or(0);

            candles.push(Candle::new(open_time, open, high, low, close, volume, close_time));
        }

        debug!(symbol, interval, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    /// GET /api/v3/exchangeInfo filtered by symbol.
    #[instrument(skip(self), name = "binance::get_symbol_info")]
    pub async fn get_symbol_info(&self, symbol: &str) -> Result<serde_json::Value> {
        let url = format!(
            "{}/api/v3/exchangeInfo?symbol={}",
            self.base_url, symbol
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/exchangeInfo request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse exchangeInfo response")?;

        if !status.is_success() {
            anyhow::bail!(
                "Binance GET /api/v3/exchangeInfo returned {}: {}",
                status,
                body
            );
        }

        // Extract the first (and usually only) symbol entry.
        let info = body["symbols"]
            .as_array()
            .and_then(|arr| arr.first().cloned())
            .context("symbol not found in exchangeInfo response")?;

        debug!(symbol, "symbol info retrieved");
        Ok(info)
    }

    // -------------------------------------------------------------------------
    // Trading
    // -------------------------------------------------------------------------

    /// Place a MARKET order. Buys specify `quote_quantity` (spend this much
    /// quote asset); sells specify `quantity` (sell this much base asset).
    #[instrument(skip(self), name = "binance::place_market_order")]
    pub async fn place_market_order(
        &self,
        symbol: &str,
        side: &str,
        quantity: Option<f64>,
        quote_quantity: Option<f64>,
    ) -> Result<serde_json::Value> {
        let mut params = format!("symbol={symbol}&side={side}&type=MARKET");
        if let Some(q) = quantity {
            params.push_str(&format!("&quantity={}", Self::float_as_decimal_str(q)));
        }
        if let Some(qq) = quote_quantity {
            params.push_str(&format!("&quoteOrderQty={}", Self::float_as_decimal_str(qq)));
        }
        let qs = self.signed_query(&params);
        let url = format!("{}/api/v3/order?{}", self.base_url, qs);

        debug!(symbol, side, "placing market order");

        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .context("POST /api/v3/order (market) request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse market order response")?;

        if !status.is_success() {
            anyhow::bail!("Binance market order returned {}: {}", status, body);
        }
        Ok(body)
    }

    fn float_as_decimal_str(num: f64) -> String {
        let s = format!("{num:.8}");
        let s = s.trim_end_matches('0');
        s.trim_end_matches('.').to_string()
    }

    // -------------------------------------------------------------------------
    // Public market data (trading-relevant)
    // -------------------------------------------------------------------------

    /// GET /api/v3/ticker/price (no symbol — fetches every ticker at once).
    #[instrument(skip(self), name = "binance::get_all_ticker_prices")]
    pub async fn get_all_ticker_prices(&self) -> Result<Vec<(String, f64)>> {
        let url = format!("{}/api/v3/ticker/price", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/ticker/price request failed")?;
        let body: serde_json::Value = resp.json().await.context("failed to parse ticker prices")?;
        let arr = body.as_array().context("ticker/price response is not an array")?;
        let mut out = Vec::with_capacity(arr.len());
        for entry in arr {
            let symbol = entry["symbol"].as_str().unwrap_or_default().to_string();
            let price = Self::parse_str_f64(&entry["price"]).unwrap_or(0.0);
            out.push((symbol, price));
        }
        Ok(out)
    }

    /// GET /api/v3/depth — full order-book snapshot for a resync.
    #[instrument(skip(self), name = "binance::get_order_book")]
    pub async fn get_order_book(&self, symbol: &str, limit: u32) -> Result<(u64, Vec<(f64, f64)>, Vec<(f64, f64)>)> {
        let url = format!("{}/api/v3/depth?symbol={}&limit={}", self.base_url, symbol, limit);
        let resp = self.client.get(&url).send().await.context("GET /api/v3/depth request failed")?;
        let body: serde_json::Value = resp.json().await.context("failed to parse depth response")?;
        let last_update_id = body["lastUpdateId"].as_u64().context("missing lastUpdateId")?;
        let parse_levels = |levels: &serde_json::Value| -> Result<Vec<(f64, f64)>> {
            let arr = levels.as_array().context("expected level array")?;
            arr.iter()
                .map(|lvl| {
                    let lvl = lvl.as_array().context("expected [price, qty] pair")?;
                    Ok((Self::parse_str_f64(&lvl[0])?, Self::parse_str_f64(&lvl[1])?))
                })
                .collect()
        };
        let bids = parse_levels(&body["bids"])?;
        let asks = parse_levels(&body["asks"])?;
        Ok((last_update_id, bids, asks))
    }

    /// GET /api/v3/exchangeInfo's LOT_SIZE filter, expressed as the tick
    /// exponent (number of decimal places `stepSize` allows).
    #[instrument(skip(self), name = "binance::get_lot_size_tick")]
    pub async fn get_lot_size_tick(&self, origin_symbol: &str, target_symbol: &str) -> Result<i32> {
        let info = self.get_symbol_info(&format!("{origin_symbol}{target_symbol}")).await?;
        let filters = info["filters"].as_array().context("missing filters")?;
        let lot_size = filters
            .iter()
            .find(|f| f["filterType"].as_str() == Some("LOT_SIZE"))
            .context("missing LOT_SIZE filter")?;
        let step_size = lot_size["stepSize"].as_str().context("missing stepSize")?;
        Ok(tick_exponent_from_step_size(step_size))
    }

    /// GET /api/v3/exchangeInfo's NOTIONAL/MIN_NOTIONAL filter — the minimum
    /// `price * quantity` the exchange accepts for an order on this symbol.
    #[instrument(skip(self), name = "binance::get_min_notional")]
    pub async fn get_min_notional(&self, symbol: &str) -> Result<f64> {
        let info = self.get_symbol_info(symbol).await?;
        let filters = info["filters"].as_array().context("missing filters")?;
        let filter = filters
            .iter()
            .find(|f| matches!(f["filterType"].as_str(), Some("MIN_NOTIONAL") | Some("NOTIONAL")))
            .context("missing MIN_NOTIONAL/NOTIONAL filter")?;
        let raw = filter["minNotional"].as_str().context("missing minNotional")?;
        Self::parse_str_f64(&serde_json::Value::String(raw.to_string()))
    }

    /// GET /api/v3/tradeFee (signed) — taker commission per symbol.
    #[instrument(skip(self), name = "binance::get_trade_fees")]
    pub async fn get_trade_fees(&self) -> Result<std::collections::HashMap<String, f64>> {
        let qs = self.signed_query("");
        let url = format!("{}/sapi/v1/asset/tradeFee?{}", self.base_url, qs);
        let resp = self.client.get(&url).send().await.context("GET tradeFee request failed")?;
        let body: serde_json::Value = resp.json().await.context("failed to parse tradeFee response")?;
        let arr = body.as_array().context("tradeFee response is not an array")?;
        let mut out = std::collections::HashMap::new();
        for entry in arr {
            let symbol = entry["symbol"].as_str().unwrap_or_default().to_string();
            let fee: f64 = entry["takerCommission"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .or_else(|| entry["takerCommission"].as_f64())
                .unwrap_or(0.001);
            out.insert(symbol, fee);
        }
        Ok(out)
    }

    /// GET /sapi/v1/bnbBurn (signed) — whether BNB fee burn is enabled.
    #[instrument(skip(self), name = "binance::get_bnb_burn_spot_margin")]
    pub async fn get_bnb_burn_spot_margin(&self) -> Result<bool> {
        let qs = self.signed_query("");
        let url = format!("{}/sapi/v1/bnbBurn?{}", self.base_url, qs);
        let resp = self.client.get(&url).send().await.context("GET bnbBurn request failed")?;
        let body: serde_json::Value = resp.json().await.context("failed to parse bnbBurn response")?;
        Ok(body["spotBNBBurn"].as_bool().unwrap_or(false))
    }

    /// GET /api/v3/klines over a date range, for backtest history fill.
    #[instrument(skip(self), name = "binance::get_historical_klines")]
    pub async fn get_historical_klines_range(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Candle>> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval=1m&startTime={}&endTime={}&limit=1000",
            self.base_url, symbol, start_ms, end_ms
        );
        let resp = self.client.get(&url).send().await.context("GET historical klines failed")?;
        let body: serde_json::Value = resp.json().await.context("failed to parse historical klines")?;
        let raw = body.as_array().context("klines response is not an array")?;
        let mut candles = Vec::with_capacity(raw.len());
        for entry in raw {
            let arr = entry.as_array().context("kline entry is not an array")?;
            if arr.len() < 7 {
                continue;
            }
            let open_time = arr[0].as_i64().unwrap_or(0);
            let open = Self::parse_str_f64(&arr[1])?;
            let high = Self::parse_str_f64(&arr[2])?;
            let low = Self::parse_str_f64(&arr[3])?;
            let close = Self::parse_str_f64(&arr[4])?;
            let volume = Self::parse_str_f64(&arr[5])?;
            let close_time = arr[6].as_i64().unwrap_or(0);
            candles.push(Candle::new(open_time, open, high, low, close, volume, close_time));
        }
        Ok(candles)
    }

    // -------------------------------------------------------------------------
    // User data stream (listen key)
    // -------------------------------------------------------------------------

    /// POST /api/v3/userDataStream — obtain a listen key for the account's
    /// user-data WebSocket. Valid for 60 minutes unless kept alive.
    #[instrument(skip(self), name = "binance::start_user_data_stream")]
    pub async fn start_user_data_stream(&self) -> Result<String> {
        let url = format!("{}/api/v3/userDataStream", self.base_url);
        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .context("POST /api/v3/userDataStream request failed")?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse userDataStream response")?;
        if !status.is_success() {
            anyhow::bail!("Binance POST /api/v3/userDataStream returned {}: {}", status, body);
        }
        body["listenKey"]
            .as_str()
            .map(|s| s.to_string())
            .context("userDataStream response missing listenKey")
    }

    /// PUT /api/v3/userDataStream — extend a listen key's validity by another
    /// 60 minutes. Must be called roughly every 30 minutes.
    #[instrument(skip(self), name = "binance::keepalive_user_data_stream")]
    pub async fn keepalive_user_data_stream(&self, listen_key: &str) -> Result<()> {
        let url = format!("{}/api/v3/userDataStream?listenKey={}", self.base_url, listen_key);
        let resp = self
            .client
            .put(&url)
            .send()
            .await
            .context("PUT /api/v3/userDataStream request failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Binance PUT /api/v3/userDataStream returned {}: {}", status, body);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Internal helpers
    // -------------------------------------------------------------------------

    /// Parse a JSON value that may be either a string or a number into `f64`.
    fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
        if let Some(s) = val.as_str() {
            s.parse::<f64>()
                .with_context(|| format!("failed to parse '{s}' as f64"))
        } else if let Some(n) = val.as_f64() {
            Ok(n)
        } else {
            anyhow::bail!("expected string or number, got: {val}")
        }
    }
}

/// `stepSize` ("0.00100000" -> 3, "1.00000000" -> 0) expressed as the power
/// of ten a quantity must be rounded down to before it is accepted.
fn tick_exponent_from_step_size(step_size: &str) -> i32 {
    if let Some(dot) = step_size.find('.') {
        if let Some(one) = step_size.find('1') {
            if one == 0 {
                return 1 - dot as i32;
            }
            return one as i32 - 1;
        }
    }
    0
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}
