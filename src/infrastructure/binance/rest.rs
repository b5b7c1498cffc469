//! Binance REST data-plane client
//!
//! Covers every endpoint the syncers consume: instrument listings, 24h
//! tickers, book tickers, ticker prices, klines, order-book depth, futures
//! contract definitions and funding rates. No trading endpoints, no signing.
//!
//! Every call is gated by the shared token-bucket pool and returns a
//! classified [`ApiError`] so callers can apply the per-kind retry policy.

use crate::domain::errors::ApiError;
use crate::domain::types::{
    Candle, DepthSnapshot, FundingRate, FundingSource, FuturesContract, Instrument, Market,
    Ticker24h,
};
use crate::infrastructure::binance::common::rest_path;
use crate::infrastructure::core::http_client_factory::{HttpClientFactory, build_url_with_query};
use crate::infrastructure::core::rate_limiter::{EndpointClass, RateLimiterPool};
use chrono::Utc;
use reqwest_middleware::ClientWithMiddleware;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct BinanceApiConfig {
    pub spot_rest_url: String,
    pub futures_rest_url: String,
    pub timeout: Duration,
}

impl Default for BinanceApiConfig {
    fn default() -> Self {
        Self {
            spot_rest_url: super::common::DEFAULT_SPOT_REST_URL.to_string(),
            futures_rest_url: super::common::DEFAULT_FUTURES_REST_URL.to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

pub struct BinanceRestClient {
    client: ClientWithMiddleware,
    config: BinanceApiConfig,
    limiter: Arc<RateLimiterPool>,
    shutdown: watch::Receiver<bool>,
}

impl BinanceRestClient {
    pub fn new(
        config: BinanceApiConfig,
        limiter: Arc<RateLimiterPool>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let client = HttpClientFactory::create_client(config.timeout);
        Self {
            client,
            config,
            limiter,
            shutdown,
        }
    }

    fn base_url(&self, market: Market) -> &str {
        match market {
            Market::Spot => &self.config.spot_rest_url,
            Market::Futures => &self.config.futures_rest_url,
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        class: EndpointClass,
        symbol: &str,
        url: &str,
    ) -> Result<T, ApiError> {
        let mut shutdown = self.shutdown.clone();
        self.limiter
            .acquire(class, &mut shutdown)
            .await
            .map_err(|e| ApiError::Other {
                message: format!("rate limiter: {}", e),
            })?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(ApiError::from_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_response(symbol, status.as_u16(), &body));
        }

        response.json::<T>().await.map_err(|e| ApiError::Other {
            message: format!("failed to parse response: {}", e),
        })
    }

    /// Full instrument listing for one market.
    pub async fn exchange_info(&self, market: Market) -> Result<Vec<Instrument>, ApiError> {
        #[derive(Debug, Deserialize)]
        struct SymbolInfo {
            symbol: String,
            status: String,
            #[serde(rename = "baseAsset")]
            base_asset: String,
            #[serde(rename = "quoteAsset")]
            quote_asset: String,
            #[serde(rename = "baseAssetPrecision", default)]
            base_precision: Option<i32>,
            #[serde(rename = "quotePrecision", default)]
            quote_precision: Option<i32>,
            #[serde(default)]
            filters: serde_json::Value,
            #[serde(default)]
            permissions: serde_json::Value,
        }

        #[derive(Debug, Deserialize)]
        struct ExchangeInfo {
            symbols: Vec<SymbolInfo>,
        }

        let url = format!("{}{}", self.base_url(market), rest_path(market, "exchangeInfo"));
        let info: ExchangeInfo = self.get_json(EndpointClass::General, "", &url).await?;

        let now = Utc::now();
        let instruments = info
            .symbols
            .into_iter()
            .map(|s| Instrument {
                symbol: s.symbol,
                market,
                status: s.status,
                base_asset: s.base_asset,
                quote_asset: s.quote_asset,
                base_precision: s.base_precision.unwrap_or(8),
                quote_precision: s.quote_precision.unwrap_or(8),
                filters: s.filters.to_string(),
                permissions: s.permissions.to_string(),
                is_active: true,
                last_seen_active: now,
                deactivated_at: None,
            })
            .collect();

        Ok(instruments)
    }

    /// Latest price for one symbol, preserved as the exchange's string.
    pub async fn ticker_price(&self, symbol: &str, market: Market) -> Result<String, ApiError> {
        #[derive(Debug, Deserialize)]
        struct PriceTicker {
            price: String,
        }

        let url = build_url_with_query(
            &format!("{}{}", self.base_url(market), rest_path(market, "ticker/price")),
            &[("symbol", symbol)],
        );
        let ticker: PriceTicker = self.get_json(EndpointClass::Price, symbol, &url).await?;
        Ok(ticker.price)
    }

    /// Full 24h rolling-window ticker for one symbol.
    pub async fn ticker_24h(&self, symbol: &str, market: Market) -> Result<Ticker24h, ApiError> {
        #[derive(Debug, Deserialize)]
        struct RawTicker {
            #[serde(rename = "priceChange")]
            price_change: String,
            #[serde(rename = "priceChangePercent")]
            price_change_percent: String,
            #[serde(rename = "weightedAvgPrice")]
            weighted_avg_price: String,
            #[serde(rename = "lastPrice")]
            last_price: String,
            #[serde(rename = "openPrice")]
            open_price: String,
            #[serde(rename = "highPrice")]
            high_price: String,
            #[serde(rename = "lowPrice")]
            low_price: String,
            volume: String,
            #[serde(rename = "quoteVolume")]
            quote_volume: String,
            #[serde(rename = "openTime")]
            open_time: i64,
            #[serde(rename = "closeTime")]
            close_time: i64,
            count: i64,
        }

        let url = build_url_with_query(
            &format!("{}{}", self.base_url(market), rest_path(market, "ticker/24hr")),
            &[("symbol", symbol)],
        );
        let raw: RawTicker = self.get_json(EndpointClass::General, symbol, &url).await?;

        Ok(Ticker24h {
            symbol: symbol.to_string(),
            market,
            price_change: raw.price_change,
            price_change_percent: raw.price_change_percent,
            weighted_avg_price: raw.weighted_avg_price,
            last_price: raw.last_price,
            open_price: raw.open_price,
            high_price: raw.high_price,
            low_price: raw.low_price,
            volume: raw.volume,
            quote_volume: raw.quote_volume,
            open_time: raw.open_time,
            close_time: raw.close_time,
            trade_count: raw.count,
            bid_price: None,
            ask_price: None,
        })
    }

    /// Futures top-of-book, merged into the 24h record by the stats syncer.
    pub async fn book_ticker(&self, symbol: &str) -> Result<(String, String), ApiError> {
        #[derive(Debug, Deserialize)]
        struct BookTicker {
            #[serde(rename = "bidPrice")]
            bid_price: String,
            #[serde(rename = "askPrice")]
            ask_price: String,
        }

        let url = build_url_with_query(
            &format!(
                "{}{}",
                self.base_url(Market::Futures),
                rest_path(Market::Futures, "ticker/bookTicker")
            ),
            &[("symbol", symbol)],
        );
        let book: BookTicker = self.get_json(EndpointClass::General, symbol, &url).await?;
        Ok((book.bid_price, book.ask_price))
    }

    /// Most recent klines for one key, newest last.
    pub async fn klines(
        &self,
        symbol: &str,
        market: Market,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, ApiError> {
        let limit_str = limit.to_string();
        let url = build_url_with_query(
            &format!("{}{}", self.base_url(market), rest_path(market, "klines")),
            &[
                ("symbol", symbol),
                ("interval", interval),
                ("limit", limit_str.as_str()),
            ],
        );

        // Kline rows arrive as positional arrays:
        // [openTime, open, high, low, close, volume, closeTime, quoteVolume, count, ...]
        let rows: Vec<serde_json::Value> =
            self.get_json(EndpointClass::Candles, symbol, &url).await?;

        let candles = rows
            .iter()
            .filter_map(|row| parse_kline_row(row, symbol, market, interval))
            .collect::<Vec<_>>();

        if candles.len() < rows.len() {
            debug!(
                "BinanceRestClient: Dropped {} malformed kline rows for {} {}",
                rows.len() - candles.len(),
                symbol,
                interval
            );
        }

        Ok(candles)
    }

    /// 20-level order-book snapshot. Levels stay as string pairs.
    pub async fn depth(
        &self,
        symbol: &str,
        market: Market,
        limit: u32,
    ) -> Result<DepthSnapshot, ApiError> {
        #[derive(Debug, Deserialize)]
        struct RawDepth {
            #[serde(rename = "lastUpdateId")]
            last_update_id: i64,
            bids: Vec<[String; 2]>,
            asks: Vec<[String; 2]>,
        }

        let limit_str = limit.to_string();
        let url = build_url_with_query(
            &format!("{}{}", self.base_url(market), rest_path(market, "depth")),
            &[("symbol", symbol), ("limit", limit_str.as_str())],
        );
        let raw: RawDepth = self.get_json(EndpointClass::Depth, symbol, &url).await?;

        Ok(DepthSnapshot {
            symbol: symbol.to_string(),
            market,
            last_update_id: raw.last_update_id,
            bids: raw.bids,
            asks: raw.asks,
            snapshot_time_ms: Utc::now().timestamp_millis(),
        })
    }

    /// All futures contract definitions.
    pub async fn futures_contracts(&self) -> Result<Vec<FuturesContract>, ApiError> {
        #[derive(Debug, Deserialize)]
        struct RawContract {
            symbol: String,
            status: String,
            #[serde(rename = "contractType", default)]
            contract_type: String,
            #[serde(rename = "baseAsset")]
            base_asset: String,
            #[serde(rename = "quoteAsset")]
            quote_asset: String,
            #[serde(rename = "orderTypes", default)]
            order_types: serde_json::Value,
            #[serde(rename = "timeInForce", default)]
            time_in_force: serde_json::Value,
            #[serde(default)]
            filters: serde_json::Value,
            #[serde(rename = "underlyingSubType", default)]
            underlying_sub_type: serde_json::Value,
        }

        #[derive(Debug, Deserialize)]
        struct FuturesExchangeInfo {
            symbols: Vec<RawContract>,
        }

        let url = format!(
            "{}{}",
            self.base_url(Market::Futures),
            rest_path(Market::Futures, "exchangeInfo")
        );
        let info: FuturesExchangeInfo = self.get_json(EndpointClass::General, "", &url).await?;

        Ok(info
            .symbols
            .into_iter()
            .map(|c| FuturesContract {
                symbol: c.symbol,
                status: c.status,
                contract_type: c.contract_type,
                base_asset: c.base_asset,
                quote_asset: c.quote_asset,
                order_types: c.order_types.to_string(),
                time_in_force: c.time_in_force.to_string(),
                filters: c.filters.to_string(),
                underlying_sub_type: c.underlying_sub_type.to_string(),
            })
            .collect())
    }

    /// Settled funding points since `start_ms` (ascending), newest last.
    pub async fn funding_rate_history(
        &self,
        symbol: &str,
        start_ms: Option<i64>,
        limit: u32,
    ) -> Result<Vec<FundingRate>, ApiError> {
        #[derive(Debug, Deserialize)]
        struct RawFunding {
            #[serde(rename = "fundingRate")]
            funding_rate: String,
            #[serde(rename = "fundingTime")]
            funding_time: i64,
        }

        let limit_str = limit.to_string();
        let mut params: Vec<(&str, String)> = vec![
            ("symbol", symbol.to_string()),
            ("limit", limit_str),
        ];
        if let Some(start) = start_ms {
            params.push(("startTime", start.to_string()));
        }
        let params: Vec<(&str, &str)> = params.iter().map(|(k, v)| (*k, v.as_str())).collect();

        let url = build_url_with_query(
            &format!(
                "{}{}",
                self.base_url(Market::Futures),
                rest_path(Market::Futures, "fundingRate")
            ),
            &params,
        );
        let rows: Vec<RawFunding> = self.get_json(EndpointClass::General, symbol, &url).await?;

        Ok(rows
            .into_iter()
            .map(|r| FundingRate {
                symbol: symbol.to_string(),
                funding_rate: r.funding_rate,
                funding_time: r.funding_time,
                source: FundingSource::Settled,
            })
            .collect())
    }

    /// Premium/mark index; carries the in-progress funding rate.
    pub async fn premium_index(&self, symbol: &str) -> Result<Option<FundingRate>, ApiError> {
        #[derive(Debug, Deserialize)]
        struct PremiumIndex {
            #[serde(rename = "lastFundingRate", default)]
            last_funding_rate: String,
            #[serde(rename = "nextFundingTime", default)]
            next_funding_time: i64,
        }

        let url = build_url_with_query(
            &format!(
                "{}{}",
                self.base_url(Market::Futures),
                rest_path(Market::Futures, "premiumIndex")
            ),
            &[("symbol", symbol)],
        );
        let index: PremiumIndex = self.get_json(EndpointClass::General, symbol, &url).await?;

        if index.last_funding_rate.is_empty() {
            return Ok(None);
        }
        Ok(Some(FundingRate {
            symbol: symbol.to_string(),
            funding_rate: index.last_funding_rate,
            funding_time: index.next_funding_time,
            source: FundingSource::Realtime,
        }))
    }
}

fn parse_kline_row(
    row: &serde_json::Value,
    symbol: &str,
    market: Market,
    interval: &str,
) -> Option<Candle> {
    let arr = row.as_array()?;
    if arr.len() < 6 {
        return None;
    }

    let decimal_at = |idx: usize| -> Option<Decimal> {
        arr.get(idx)
            .and_then(|v| v.as_str())
            .and_then(|s| Decimal::from_str(s).ok())
    };

    Some(Candle {
        symbol: symbol.to_string(),
        market,
        interval: interval.to_string(),
        open_time: arr[0].as_i64()?,
        open: decimal_at(1)?,
        high: decimal_at(2)?,
        low: decimal_at(3)?,
        close: decimal_at(4)?,
        volume: decimal_at(5)?,
        quote_volume: decimal_at(7),
        trade_count: arr.get(8).and_then(|v| v.as_i64()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_positional_kline_rows() {
        let row = serde_json::json!([
            1700000000000_i64,
            "35000.10",
            "35100.00",
            "34900.50",
            "35050.25",
            "123.456",
            1700000059999_i64,
            "4325000.00",
            987
        ]);

        let candle = parse_kline_row(&row, "BTCUSDT", Market::Spot, "1m").unwrap();
        assert_eq!(candle.open_time, 1700000000000);
        assert_eq!(candle.open, Decimal::from_str("35000.10").unwrap());
        assert_eq!(candle.close, Decimal::from_str("35050.25").unwrap());
        assert_eq!(candle.quote_volume, Decimal::from_str("4325000.00").ok());
        assert_eq!(candle.trade_count, Some(987));
    }

    #[test]
    fn rejects_short_kline_rows() {
        let row = serde_json::json!([1700000000000_i64, "1", "2"]);
        assert!(parse_kline_row(&row, "BTCUSDT", Market::Spot, "1m").is_none());
    }
}
