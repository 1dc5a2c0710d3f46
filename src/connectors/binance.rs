//! Binance USDⓈ-M futures adapter

use crate::{
    config::ExchangeConfig,
    connectors::{
        rest::{sign_hmac_sha256, RestClient},
        sizing::LotSize,
        traits::*,
        Exchange,
    },
    data::DEFAULT_PERIODS_PER_YEAR,
    Result,
};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use dashmap::DashMap;
use reqwest::Method;
use rust_decimal::prelude::*;
use serde::Deserialize;
use tracing::{debug, info, warn};

/// Binance futures adapter
pub struct BinanceAdapter {
    client: RestClient,
    config: ExchangeConfig,
    quote_asset: String,
    periods_per_year: f64,
    lot_sizes: DashMap<String, LotSize>,
}

impl BinanceAdapter {
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

    /// Append timestamp, receive window and signature to a query string
    fn signed_query(&self, params: &str) -> Result<String> {
        let mut query = String::from(params);
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(&format!(
            "recvWindow={}&timestamp={}",
            self.config.recv_window_ms,
            Utc::now().timestamp_millis()
        ));
        let signature = sign_hmac_sha256(&self.config.secret_key, &query)?;
        Ok(format!("{}&signature={}", query, signature))
    }

    async fn public_get<T: serde::de::DeserializeOwned>(&self, what: &str, path: &str) -> Result<T> {
        self.client
            .send_json(what, true, || Ok(self.client.request(Method::GET, path)))
            .await
    }

    async fn signed<T: serde::de::DeserializeOwned>(
        &self,
        what: &str,
        method: Method,
        path: &str,
        params: &str,
        idempotent: bool,
    ) -> Result<T> {
        self.client
            .send_json(what, idempotent, || {
                let query = self.signed_query(params)?;
                Ok(self
                    .client
                    .request(method.clone(), &format!("{}?{}", path, query))
                    .header("X-MBX-APIKEY", &self.config.api_key))
            })
            .await
    }

    async fn fetch_premium_index(&self, symbol: &str) -> Result<BinancePremiumIndex> {
        let path = format!("/fapi/v1/premiumIndex?symbol={}", self.to_exchange_symbol(symbol));
        self.public_get("premiumIndex", &path).await
    }

    async fn fetch_positions(&self) -> Result<Vec<Position>> {
        let raw: Vec<BinancePositionRisk> = self
            .signed("positionRisk", Method::GET, "/fapi/v2/positionRisk", "", true)
            .await?;

        Ok(raw
            .into_iter()
            .filter(|p| p.symbol.ends_with(&self.quote_asset))
            .filter_map(|p| {
                let amount = parse_f64(&p.position_amt)?;
                if amount == 0.0 {
                    return None;
                }
                Some(Position {
                    symbol: self.from_exchange_symbol(&p.symbol),
                    exchange: Exchange::Binance,
                    side: if amount > 0.0 { PositionSide::Long } else { PositionSide::Short },
                    size: amount.abs(),
                    entry_price: parse_f64(&p.entry_price).unwrap_or(0.0),
                    mark_price: parse_f64(&p.mark_price).unwrap_or(0.0),
                    unrealized_pnl: parse_f64(&p.unrealized_profit).unwrap_or(0.0),
                })
            })
            .collect())
    }

    /// Send a MARKET order for an exact quantity
    async fn place_market_order(
        &self,
        symbol: &str,
        side: PositionSide,
        quantity: Decimal,
        reduce_only: bool,
        mark_price: f64,
    ) -> ExecutionResult {
        let params = format!(
            "symbol={}&side={}&type=MARKET&quantity={}&reduceOnly={}&newClientOrderId=fra{}",
            self.to_exchange_symbol(symbol),
            order_side(side),
            quantity,
            reduce_only,
            uuid::Uuid::new_v4().simple()
        );

        match self
            .signed::<BinanceOrderResponse>("order", Method::POST, "/fapi/v1/order", &params, false)
            .await
        {
            Ok(order) => {
                let quoted = parse_f64(&order.cum_quote).unwrap_or(0.0);
                let notional = if quoted > 0.0 {
                    quoted
                } else {
                    quantity.to_f64().unwrap_or(0.0) * mark_price
                };
                info!(
                    "Binance order {} filled: {} {} {} (reduce_only={}, status={})",
                    order.order_id, side, quantity, symbol, reduce_only, order.status
                );
                ExecutionResult::filled(order.order_id.to_string(), notional)
            }
            Err(e) => {
                warn!("Binance order for {} {} {} failed: {}", side, quantity, symbol, e);
                ExecutionResult::rejected(e.to_string())
            }
        }
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Binance
    }

    async fn initialize(&self) -> bool {
        info!("Initializing Binance adapter at {}", self.client.base_url());
        let info: BinanceExchangeInfo = match self.public_get("exchangeInfo", "/fapi/v1/exchangeInfo").await {
            Ok(info) => info,
            Err(e) => {
                warn!("Failed to load Binance exchange info: {}", e);
                return false;
            }
        };

        for contract in info.symbols {
            if contract.quote_asset != self.quote_asset {
                continue;
            }
            let lot = contract
                .filters
                .iter()
                .find(|f| f.filter_type == "LOT_SIZE")
                .and_then(|f| LotSize::parse(f.step_size.as_deref()?, f.min_qty.as_deref()?));
            if let Some(lot) = lot {
                self.lot_sizes.insert(contract.symbol, lot);
            }
        }

        info!("Binance adapter ready with {} contracts", self.lot_sizes.len());
        !self.lot_sizes.is_empty()
    }

    async fn close(&self) {
        self.lot_sizes.clear();
        info!("Binance adapter closed");
    }

    async fn get_funding_info(&self, symbol: &str) -> Option<FundingQuote> {
        let index = match self.fetch_premium_index(symbol).await {
            Ok(index) => index,
            Err(e) => {
                warn!("Binance funding lookup for {} failed: {}", symbol, e);
                return None;
            }
        };

        let rate = parse_f64(&index.last_funding_rate)?;
        let mark = parse_f64(&index.mark_price)?;
        let next = (index.next_funding_time > 0)
            .then(|| Utc.timestamp_millis_opt(index.next_funding_time).single())
            .flatten();

        debug!("Binance {} funding {:.6} mark {:.4}", symbol, rate, mark);
        Some(FundingQuote::new(symbol, Exchange::Binance, rate, mark, next, self.periods_per_year))
    }

    async fn get_mark_price(&self, symbol: &str) -> Option<f64> {
        match self.fetch_premium_index(symbol).await {
            Ok(index) => parse_f64(&index.mark_price).filter(|p| *p > 0.0),
            Err(e) => {
                warn!("Binance mark price lookup for {} failed: {}", symbol, e);
                None
            }
        }
    }

    async fn get_balance(&self) -> Option<AccountBalance> {
        let account: BinanceAccount = match self
            .signed("account", Method::GET, "/fapi/v2/account", "", true)
            .await
        {
            Ok(account) => account,
            Err(e) => {
                warn!("Binance balance lookup failed: {}", e);
                return None;
            }
        };

        Some(AccountBalance {
            equity: parse_f64(&account.total_margin_balance)?,
            available_balance: parse_f64(&account.available_balance)?,
            margin_used: parse_f64(&account.total_initial_margin).unwrap_or(0.0),
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
                warn!("Binance position lookup failed: {}", e);
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
        PositionSide::Long => "BUY",
        PositionSide::Short => "SELL",
    }
}

fn parse_f64(value: &str) -> Option<f64> {
    value.parse::<f64>().ok().filter(|v| v.is_finite())
}

// Binance API response types
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BinancePremiumIndex {
    mark_price: String,
    last_funding_rate: String,
    #[serde(default)]
    next_funding_time: i64,
}

#[derive(Debug, Deserialize)]
struct BinanceExchangeInfo {
    symbols: Vec<BinanceContract>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BinanceContract {
    symbol: String,
    quote_asset: String,
    #[serde(default)]
    filters: Vec<BinanceFilter>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BinanceFilter {
    filter_type: String,
    step_size: Option<String>,
    min_qty: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BinanceAccount {
    total_margin_balance: String,
    available_balance: String,
    #[serde(default)]
    total_initial_margin: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BinancePositionRisk {
    symbol: String,
    position_amt: String,
    entry_price: String,
    mark_price: String,
    #[serde(rename = "unRealizedProfit")]
    unrealized_profit: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BinanceOrderResponse {
    order_id: u64,
    status: String,
    #[serde(default)]
    cum_quote: String,
}
