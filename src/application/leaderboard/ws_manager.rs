//! Dedicated WebSocket manager for the realtime leaderboard.
//!
//! One task per subscription set: `update_subscription` replaces the set by
//! aborting the previous task and spawning a fresh one for the full desired
//! list (the upstream treats repeated subscribes as idempotent, so callers
//! just send the whole set). Parsed ticks go onto a bounded channel with
//! `try_send`; when the channel is full the tick is dropped so the reader
//! never blocks.

use crate::application::leaderboard::price_cache::PriceUpdate;
use crate::domain::types::{Market, PriceSource};
use anyhow::Result;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{RwLock, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

pub struct LeaderboardWsManager {
    ws_url: String,
    market: Market,
    reconnect_delay_secs: u64,
    update_tx: mpsc::Sender<PriceUpdate>,
    subscribed_symbols: Arc<RwLock<Vec<String>>>,
    dropped_updates: Arc<AtomicU64>,
    // Handle for the active WebSocket task to allow cancellation
    task_handle: Arc<tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl LeaderboardWsManager {
    pub fn new(
        ws_url: String,
        market: Market,
        reconnect_delay_secs: u64,
        update_tx: mpsc::Sender<PriceUpdate>,
    ) -> Self {
        Self {
            ws_url,
            market,
            reconnect_delay_secs,
            update_tx,
            subscribed_symbols: Arc::new(RwLock::new(Vec::new())),
            dropped_updates: Arc::new(AtomicU64::new(0)),
            task_handle: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    /// Replace the subscription set with `symbols`. Duplicate symbols collapse
    /// to one logical subscription; an unchanged set is a no-op.
    pub async fn update_subscription(&self, symbols: Vec<String>) -> Result<()> {
        let desired: Vec<String> = symbols
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        {
            let current = self.subscribed_symbols.read().await;
            if *current == desired {
                debug!(
                    "LeaderboardWsManager[{}]: subscription unchanged ({} symbols)",
                    self.market,
                    desired.len()
                );
                return Ok(());
            }
        }

        let mut handle_guard = self.task_handle.lock().await;
        if let Some(handle) = handle_guard.take() {
            debug!(
                "LeaderboardWsManager[{}]: aborting previous WebSocket task",
                self.market
            );
            handle.abort();
        }

        *self.subscribed_symbols.write().await = desired.clone();

        if desired.is_empty() {
            info!(
                "LeaderboardWsManager[{}]: subscription empty, not spawning task",
                self.market
            );
            return Ok(());
        }

        let ws_url = self.ws_url.clone();
        let market = self.market;
        let update_tx = self.update_tx.clone();
        let dropped = self.dropped_updates.clone();
        let reconnect_delay = self.reconnect_delay_secs;
        let count = desired.len();

        let handle = tokio::spawn(async move {
            Self::run_websocket(ws_url, market, desired, update_tx, dropped, reconnect_delay)
                .await;
        });

        *handle_guard = Some(handle);
        info!(
            "LeaderboardWsManager[{}]: spawned WebSocket task for {} symbols",
            self.market, count
        );

        Ok(())
    }

    pub async fn subscribed(&self) -> Vec<String> {
        self.subscribed_symbols.read().await.clone()
    }

    pub fn dropped_updates(&self) -> u64 {
        self.dropped_updates.load(Ordering::Relaxed)
    }

    pub async fn shutdown(&self) {
        let mut handle_guard = self.task_handle.lock().await;
        if let Some(handle) = handle_guard.take() {
            handle.abort();
        }
    }

    async fn run_websocket(
        ws_url: String,
        market: Market,
        symbols: Vec<String>,
        update_tx: mpsc::Sender<PriceUpdate>,
        dropped: Arc<AtomicU64>,
        reconnect_delay_secs: u64,
    ) {
        let mut backoff = reconnect_delay_secs.max(1);
        const MAX_BACKOFF: u64 = 60;

        loop {
            match Self::connect_and_stream(&ws_url, market, &symbols, &update_tx, &dropped).await
            {
                Ok(()) => {
                    info!(
                        "LeaderboardWsManager[{}]: connection closed gracefully",
                        market
                    );
                    tokio::time::sleep(std::time::Duration::from_secs(reconnect_delay_secs.max(1)))
                        .await;
                    backoff = reconnect_delay_secs.max(1);
                }
                Err(e) => {
                    error!(
                        "LeaderboardWsManager[{}]: WebSocket error: {}. Reconnecting in {}s...",
                        market, e, backoff
                    );
                    tokio::time::sleep(std::time::Duration::from_secs(backoff)).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    async fn connect_and_stream(
        ws_url: &str,
        market: Market,
        symbols: &[String],
        update_tx: &mpsc::Sender<PriceUpdate>,
        dropped: &Arc<AtomicU64>,
    ) -> Result<()> {
        let url = format!("{}/stream", ws_url.trim_end_matches('/'));
        info!(
            "LeaderboardWsManager[{}]: connecting to {} for {} symbols",
            market,
            url,
            symbols.len()
        );

        let (ws_stream, _) = connect_async(&url).await?;
        let (mut write, mut read) = ws_stream.split();

        // One SUBSCRIBE with the full desired set; upstream dedups repeats
        let streams: Vec<String> = symbols
            .iter()
            .map(|s| crate::infrastructure::binance::common::stream_name(s, "@ticker"))
            .collect();
        let frame = serde_json::json!({
            "method": "SUBSCRIBE",
            "params": streams,
            "id": Utc::now().timestamp_millis(),
        });
        write.send(Message::Text(frame.to_string().into())).await?;

        // Writer channel for pongs so the read loop never writes directly
        let (ws_tx, mut ws_rx) = mpsc::channel::<Message>(16);
        tokio::spawn(async move {
            while let Some(msg) = ws_rx.recv().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
        });

        while let Some(msg_result) = read.next().await {
            match msg_result {
                Ok(Message::Text(text)) => {
                    if let Some(update) = Self::parse_tick(&text) {
                        // Bounded channel: drop on full rather than block
                        if let Err(mpsc::error::TrySendError::Full(_)) =
                            update_tx.try_send(update)
                        {
                            let total = dropped.fetch_add(1, Ordering::Relaxed) + 1;
                            if total.is_power_of_two() {
                                warn!(
                                    "LeaderboardWsManager[{}]: update channel full, {} ticks dropped so far",
                                    market, total
                                );
                            }
                        }
                    }
                }
                Ok(Message::Ping(payload)) => {
                    let _ = ws_tx.send(Message::Pong(payload)).await;
                }
                Ok(Message::Close(frame)) => {
                    info!(
                        "LeaderboardWsManager[{}]: closed by server: {:?}",
                        market, frame
                    );
                    break;
                }
                Err(e) => {
                    return Err(e.into());
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Parse one ticker frame (combined or single-stream format).
    fn parse_tick(text: &str) -> Option<PriceUpdate> {
        let value: serde_json::Value = serde_json::from_str(text).ok()?;
        let data = match value.get("data") {
            Some(data) => data,
            None => &value,
        };

        let event = data.get("e").and_then(|e| e.as_str());
        let is_ticker = event == Some("24hrTicker")
            || value
                .get("stream")
                .and_then(|s| s.as_str())
                .map(|s| s.ends_with("@ticker"))
                .unwrap_or(false);
        if !is_ticker {
            return None;
        }

        let symbol = data.get("s")?.as_str()?;
        let price_raw = data.get("c")?.as_str()?;
        let price = Decimal::from_str(price_raw).ok()?;

        Some(PriceUpdate {
            symbol: symbol.to_string(),
            price,
            price_raw: price_raw.to_string(),
            volume_24h: data
                .get("q")
                .and_then(|q| q.as_str())
                .and_then(|q| Decimal::from_str(q).ok()),
            change_percent: data
                .get("P")
                .and_then(|p| p.as_str())
                .and_then(|p| Decimal::from_str(p).ok()),
            source: PriceSource::Websocket,
            observed_at: Utc::now(),
        })
    }

    pub fn market(&self) -> Market {
        self.market
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_combined_ticker_frames() {
        let text = r#"{"stream":"btcusdt@ticker","data":{"e":"24hrTicker","s":"BTCUSDT","c":"50000.10","P":"3.25","q":"12345.6"}}"#;
        let update = LeaderboardWsManager::parse_tick(text).unwrap();
        assert_eq!(update.symbol, "BTCUSDT");
        assert_eq!(update.price_raw, "50000.10");
        assert_eq!(update.change_percent, Decimal::from_str("3.25").ok());
        assert_eq!(update.source, PriceSource::Websocket);
    }

    #[test]
    fn parses_single_stream_ticker_frames() {
        let text = r#"{"e":"24hrTicker","s":"ETHUSDT","c":"3000","P":"-1.5","q":"99"}"#;
        let update = LeaderboardWsManager::parse_tick(text).unwrap();
        assert_eq!(update.symbol, "ETHUSDT");
        assert_eq!(update.change_percent, Decimal::from_str("-1.5").ok());
    }

    #[test]
    fn ignores_non_ticker_frames() {
        assert!(LeaderboardWsManager::parse_tick(r#"{"result":null,"id":1}"#).is_none());
        assert!(
            LeaderboardWsManager::parse_tick(r#"{"e":"trade","s":"BTCUSDT","p":"1","q":"2"}"#)
                .is_none()
        );
    }

    #[tokio::test]
    async fn duplicate_symbols_collapse_to_one_subscription() {
        let (tx, _rx) = mpsc::channel(10);
        let manager = LeaderboardWsManager::new(
            "wss://example.invalid".to_string(),
            Market::Spot,
            5,
            tx,
        );

        manager
            .update_subscription(vec![
                "BTCUSDT".to_string(),
                "BTCUSDT".to_string(),
                "ETHUSDT".to_string(),
            ])
            .await
            .unwrap();

        let subscribed = manager.subscribed().await;
        assert_eq!(subscribed.len(), 2);
        manager.shutdown().await;
    }
}
