//! Bybit v5 linear perpetual adapter

use crate::{
    config::ExchangeConfig,
    connectors::{
        rest::{sign_hmac_sha256, RestClient},
        sizing::LotSize,
        traits::*,
        Exchange,
    },
    data::DEFAULT_PERIODS_PER_YEAR,
    ArbitrageError, Result,
};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use dashmap::DashMap;
use reqwest::{header::CONTENT_TYPE, Method};
use rust_decimal::prelude::*;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::json;
use tracing::{debug, info, warn};

/// Bybit linear perpetual adapter
pub struct BybitAdapter {
    client: RestClient,
    config: ExchangeConfig,
    quote_asset: String,
    periods_per_year: f64,
    lot_sizes: DashMap<String, LotSize>,
}

impl BybitAdapter {
    /// Create a new adapter; no requests are sent until [`ExchangeAdapter::initialize`]
    pub fn new(client: RestClient, config: ExchangeConfig, quote_asset: String) -> Self {
        Self {
            client,
            config,
            quote_asset,
            periods_per_year: DEFAULT_PERIODS_PER_YEAR,
            lot_sizes: DashMap::new(),
        }
    }

    /// Annualize funding with a custom settlement count
    pub fn with_periods_per_year(mut self, periods_per_year: f64) -> Self {
        self.periods_per_year = periods_per_year;
        self
    }

    /// Signature over `timestamp + api_key + recv_window + payload`
    fn sign(&self, timestamp: i64, payload: &str) -> Result<String> {
        let prehash = format!(
            "{}{}{}{}",
            timestamp, self.config.api_key, self.config.recv_window_ms, payload
        );
        sign_hmac_sha256(&self.config.secret_key, &prehash)
    }

    fn authenticate(&self, request: reqwest::RequestBuilder, payload: &str) -> Result<reqwest::RequestBuilder> {
        let timestamp = Utc::now().timestamp_millis();
        let signature = self.sign(timestamp, payload)?;
        Ok(request
            .header("X-BAPI-API-KEY", &self.config.api_key)
            .header("X-BAPI-TIMESTAMP", timestamp.to_string())
            .header("X-BAPI-RECV-WINDOW", self.config.recv_window_ms.to_string())
            .header("X-BAPI-SIGN", signature))
    }

    async fn get<T: DeserializeOwned + Default>(&self, what: &str, path: &str, query: &str, signed: bool) -> Result<T> {
        let response: BybitResponse<T> = self
            .client
            .send_json(what, true, || {
                let request = self.client.request(Method::GET, &format!("{}?{}", path, query));
                if signed {
                    self.authenticate(request, query)
                } else {
                    Ok(request)
                }
            })
            .await?;
        response.into_result()
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<BybitTicker> {
        let query = format!("category=linear&symbol={}", self.to_exchange_symbol(symbol));
        let tickers: BybitList<BybitTicker> = self.get("tickers", "/v5/market/tickers", &query, false).await?;
        tickers.list.into_iter().next().ok_or_else(|| {
            ArbitrageError::DataParsing(format!("No Bybit ticker for {}", symbol)).into()
        })
    }

    async fn fetch_positions(&self) -> Result<Vec<Position>> {
        let query = format!("category=linear&settleCoin={}", self.quote_asset);
        let raw: BybitList<BybitPosition> = self.get("positions", "/v5/position/list", &query, true).await?;

        Ok(raw
            .list
            .into_iter()
            .filter_map(|p| {
                let size = parse_f64(&p.size)?;
                let side = match p.side.as_str() {
                    "Buy" => PositionSide::Long,
                    "Sell" => PositionSide::Short,
                    _ => return None,
                };
                if size == 0.0 {
                    return None;
                }
                Some(Position {
                    symbol: self.from_exchange_symbol(&p.symbol),
                    exchange: Exchange::Bybit,
                    side,
                    size,
                    entry_price: parse_f64(&p.avg_price).unwrap_or(0.0),
                    mark_price: parse_f64(&p.mark_price).unwrap_or(0.0),
                    unrealized_pnl: parse_f64(&p.unrealised_pnl).unwrap_or(0.0),
                })
            })
            .collect())
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: Decimal,
        reduce_only: bool,
        mark_price: f64,
    ) -> ExecutionResult {
        let body = json!({
            "category": "linear",
            "symbol": self.to_exchange_symbol(symbol),
            "side": order_side(side),
            "orderType": "Market",
            "qty": quantity.to_string(),
            "reduceOnly": reduce_only,
            "orderLinkId": format!("fra{}", uuid::Uuid::new_v4().simple()),
        })
        .to_string();

        let response: Result<BybitOrderResult> = async {
            let envelope: BybitResponse<BybitOrderResult> = self
                .client
                .send_json("order", false, || {
                    let request = self
                        .client
                        .request(Method::POST, "/v5/order/create")
                        .header(CONTENT_TYPE, "application/json")
                        .body(body.clone());
                    self.authenticate(request, &body)
                })
                .await?;
            envelope.into_order_result()
        }
        .await;

        let order = match response {
            Ok(order) => order,
            Err(e) => {
                warn!("Bybit order for {} {} {} failed: {}", side, quantity, symbol, e);
                return ExecutionResult::rejected(e.to_string());
            }
        };
        info!(
            "Bybit order {} accepted: {} {} {} (reduce_only={})",
            order.order_id, side, quantity, symbol, reduce_only
        );

        // order/create only acknowledges; the executed value comes from the order itself
        let estimate = quantity.to_f64().unwrap_or(0.0) * mark_price;
        match self.fetch_order(symbol, &order.order_id).await {
            Ok(Some(state)) => {
                let executed_qty = parse_f64(&state.cum_exec_qty).unwrap_or(0.0);
                if executed_qty == 0.0 && matches!(state.order_status.as_str(), "Rejected" | "Cancelled" | "Deactivated") {
                    warn!("Bybit order {} ended {} without fills", order.order_id, state.order_status);
                    return ExecutionResult::rejected(format!(
                        "order {} {} without fills",
                        order.order_id, state.order_status
                    ));
                }
                let notional = parse_f64(&state.cum_exec_value).filter(|v| *v > 0.0).unwrap_or_else(|| {
                    debug!("Bybit order {} has no executed value yet; estimating at mark", order.order_id);
                    estimate
                });
                ExecutionResult::filled(order.order_id, notional)
            }
            Ok(None) => {
                debug!("Bybit order {} not visible yet; estimating at mark", order.order_id);
                ExecutionResult::filled(order.order_id, estimate)
            }
            Err(e) => {
                debug!("Bybit order {} lookup failed ({}); estimating at mark", order.order_id, e);
                ExecutionResult::filled(order.order_id, estimate)
            }
        }
    }

    async fn fetch_order(&self, symbol: &str, order_id: &str) -> Result<Option<BybitOrderState>> {
        let query = format!(
            "category=linear&symbol={}&orderId={}",
            self.to_exchange_symbol(symbol),
            order_id
        );
        let orders: BybitList<BybitOrderState> = self.get("order status", "/v5/order/realtime", &query, true).await?;
        Ok(orders.list.into_iter().next())
    }
}

#[async_trait]
impl ExchangeAdapter for BybitAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Bybit
    }

    async fn initialize(&self) -> bool {
        info!("Initializing Bybit adapter at {}", self.client.base_url());
        let instruments: BybitList<BybitInstrument> = match self
            .get("instruments", "/v5/market/instruments-info", "category=linear&limit=1000", false)
            .await
        {
            Ok(instruments) => instruments,
            Err(e) => {
                warn!("Failed to load Bybit instruments: {}", e);
                return false;
            }
        };

        for instrument in instruments.list {
            if !instrument.symbol.ends_with(&self.quote_asset) {
                continue;
            }
            let filter = &instrument.lot_size_filter;
            if let Some(lot) = LotSize::parse(&filter.qty_step, &filter.min_order_qty) {
                self.lot_sizes.insert(instrument.symbol, lot);
            }
        }

        info!("Bybit adapter ready with {} contracts", self.lot_sizes.len());
        !self.lot_sizes.is_empty()
    }

    async fn close(&self) {
        self.lot_sizes.clear();
        info!("Bybit adapter closed");
    }

    async fn get_funding_info(&self, symbol: &str) -> Option<FundingQuote> {
        let ticker = match self.fetch_ticker(symbol).await {
            Ok(ticker) => ticker,
            Err(e) => {
                warn!("Bybit funding lookup for {} failed: {}", symbol, e);
                return None;
            }
        };

        let rate = parse_f64(&ticker.funding_rate)?;
        let mark = parse_f64(&ticker.mark_price)?;
        let next = ticker
            .next_funding_time
            .parse::<i64>()
            .ok()
            .filter(|ms| *ms > 0)
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());

        debug!("Bybit {} funding {:.6} mark {:.4}", symbol, rate, mark);
        Some(FundingQuote::new(symbol, Exchange::Bybit, rate, mark, next, self.periods_per_year))
    }

    async fn get_mark_price(&self, symbol: &str) -> Option<f64> {
        match self.fetch_ticker(symbol).await {
            Ok(ticker) => parse_f64(&ticker.mark_price).filter(|p| *p > 0.0),
            Err(e) => {
                warn!("Bybit mark price lookup for {} failed: {}", symbol, e);
                None
            }
        }
    }

    async fn get_balance(&self) -> Option<AccountBalance> {
        let wallets: BybitList<BybitWallet> = match self
            .get("wallet", "/v5/account/wallet-balance", "accountType=UNIFIED", true)
            .await
        {
            Ok(wallets) => wallets,
            Err(e) => {
                warn!("Bybit balance lookup failed: {}", e);
                return None;
            }
        };

        let wallet = wallets.list.into_iter().next()?;
        Some(AccountBalance {
            equity: parse_f64(&wallet.total_equity)?,
            available_balance: parse_f64(&wallet.total_available_balance)?,
            margin_used: parse_f64(&wallet.total_initial_margin).unwrap_or(0.0),
        })
    }

    async fn get_position(&self, symbol: &str) -> Option<Position> {
        self.get_all_positions()
            .await?
            .into_iter()
            .find(|p| p.symbol == symbol)
    }

    async fn get_all_positions(&self) -> Option<Vec<Position>> {
        match self.fetch_positions().await {
            Ok(positions) => Some(positions),
            Err(e) => {
                warn!("Bybit position lookup failed: {}", e);
                None
            }
        }
    }

    async fn open_position(
        &self,
        symbol: &str,
        side: PositionSide,
        size_usd: f64,
        reduce_only: bool,
    ) -> ExecutionResult {
        let exchange_symbol = self.to_exchange_symbol(symbol);
        let Some(lot) = self.lot_sizes.get(&exchange_symbol).map(|l| *l) else {
            return ExecutionResult::failed(
                FailureKind::MissingData,
                format!("No lot size for {}; adapter not initialized", exchange_symbol),
            );
        };
        let Some(mark) = self.get_mark_price(symbol).await else {
            return ExecutionResult::failed(FailureKind::MissingData, "mark price unavailable");
        };
        let Some(quantity) = lot.quantity_for(size_usd, mark) else {
            return ExecutionResult::rejected(format!(
                "${:.2} of {} is below the minimum quantity {}",
                size_usd, symbol, lot.min_qty
            ));
        };

        self.place_market_order(symbol, side, quantity, reduce_only, mark).await
    }

    async fn close_position(&self, symbol: &str) -> ExecutionResult {
        let positions = match self.fetch_positions().await {
            Ok(positions) => positions,
            Err(e) => return ExecutionResult::rejected(format!("position lookup failed: {}", e)),
        };
        let Some(position) = positions.into_iter().find(|p| p.symbol == symbol) else {
            return ExecutionResult::noop();
        };
        let Some(quantity) = Decimal::from_f64(position.size) else {
            return ExecutionResult::rejected(format!("invalid position size {}", position.size));
        };

        self.place_market_order(
            symbol,
            position.side.opposite(),
            quantity.normalize(),
            true,
            position.mark_price,
        )
        .await
    }

    async fn adjust_position(
        &self,
        symbol: &str,
        target_size_usd: f64,
        target_side: PositionSide,
    ) -> ExecutionResult {
        execute_adjustment(self, symbol, target_size_usd, target_side, 1.0).await
    }

    fn to_exchange_symbol(&self, symbol: &str) -> String {
        format!("{}{}", symbol.to_uppercase(), self.quote_asset)
    }

    fn from_exchange_symbol(&self, exchange_symbol: &str) -> String {
        exchange_symbol
            .strip_suffix(self.quote_asset.as_str())
            .unwrap_or(exchange_symbol)
            .to_string()
    }
}

fn order_side(side: PositionSide) -> &'static str {
    match side {
        PositionSide::Long => "Buy",
        PositionSide::Short => "Sell",
    }
}

fn parse_f64(value: &str) -> Option<f64> {
    value.parse::<f64>().ok().filter(|v| v.is_finite())
}

// Bybit API response types
#[derive(Debug, Deserialize)]
struct BybitResponse<T> {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg", default)]
    ret_msg: String,
    #[serde(default)]
    result: T,
}

impl<T: Default> BybitResponse<T> {
    fn into_result(self) -> Result<T> {
        if self.ret_code != 0 {
            return Err(ArbitrageError::Api {
                code: self.ret_code,
                message: self.ret_msg,
            }
            .into());
        }
        Ok(self.result)
    }
}

impl BybitResponse<BybitOrderResult> {
    fn into_order_result(self) -> Result<BybitOrderResult> {
        if self.ret_code != 0 {
            return Err(ArbitrageError::RejectedOrder(format!(
                "retCode {}: {}",
                self.ret_code, self.ret_msg
            ))
            .into());
        }
        Ok(self.result)
    }
}

#[derive(Debug, Default, Deserialize)]
struct BybitList<T> {
    #[serde(default = "Vec::new")]
    list: Vec<T>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitTicker {
    mark_price: String,
    #[serde(default)]
    funding_rate: String,
    #[serde(default)]
    next_funding_time: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitInstrument {
    symbol: String,
    #[serde(default)]
    lot_size_filter: BybitLotSizeFilter,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitLotSizeFilter {
    #[serde(default)]
    qty_step: String,
    #[serde(default)]
    min_order_qty: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitWallet {
    #[serde(default)]
    total_equity: String,
    #[serde(default)]
    total_available_balance: String,
    #[serde(default)]
    total_initial_margin: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitPosition {
    symbol: String,
    #[serde(default)]
    side: String,
    #[serde(default)]
    size: String,
    #[serde(default)]
    avg_price: String,
    #[serde(default)]
    mark_price: String,
    #[serde(default)]
    unrealised_pnl: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitOrderResult {
    #[serde(default)]
    order_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitOrderState {
    #[serde(default)]
    order_status: String,
    #[serde(default)]
    cum_exec_qty: String,
    #[serde(default)]
    cum_exec_value: String,
}
