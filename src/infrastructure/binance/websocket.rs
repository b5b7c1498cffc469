//! One upstream WebSocket connection.
//!
//! Each connection owns a fixed stream group, a writer channel, a ping task
//! and a read task with a rolling 60 s deadline. Read failures are classified
//! and handled per class; reconnects go through a cooldown gate with bounded
//! attempts per trigger.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{
    connect_async,
    tungstenite::Message,
    tungstenite::protocol::frame::coding::CloseCode,
};
use tracing::{debug, error, info, warn};

use crate::domain::types::Market;

/// Stream type bound to one connection. Connections never mix types.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Ticker,
    Kline(String),
    Depth,
    Trade,
}

impl StreamKind {
    pub fn suffix(&self) -> String {
        match self {
            StreamKind::Ticker => "@ticker".to_string(),
            StreamKind::Kline(interval) => format!("@kline_{}", interval),
            StreamKind::Depth => "@depth20@100ms".to_string(),
            StreamKind::Trade => "@trade".to_string(),
        }
    }

    pub fn name(&self) -> String {
        match self {
            StreamKind::Ticker => "ticker".to_string(),
            StreamKind::Kline(interval) => format!("kline_{}", interval),
            StreamKind::Depth => "depth".to_string(),
            StreamKind::Trade => "trade".to_string(),
        }
    }

    /// Whether connections of this kind may exceed the pool's nominal
    /// connection cap. Kline types multiply by interval, so they are the
    /// distributed ones; simple types stay hard-capped.
    pub fn is_elastic(&self) -> bool {
        matches!(self, StreamKind::Kline(_))
    }
}

/// Identity of one connection in a market pool.
///
/// `elastic` marks distributed stream-group types that may exceed the pool's
/// nominal connection cap when the symbol universe is large; simple types are
/// hard-capped.
#[derive(Debug, Clone)]
pub struct ConnectionType {
    pub market: Market,
    pub kind: StreamKind,
    pub group: usize,
    pub elastic: bool,
}

impl ConnectionType {
    pub fn label(&self) -> String {
        format!("{}_{}_{}", self.market, self.kind.name(), self.group)
    }
}

/// Classification of a failed or terminated read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadFailure {
    /// No frame within the read deadline.
    Timeout,
    /// Peer closed or transport dropped.
    ConnectionClosed,
    /// Close code 1008; permanent for this reader.
    PolicyViolation,
    /// Framing/parse-level failure; resubscribe before reconnecting.
    ProtocolError,
    Other(String),
}

pub fn classify_ws_error(err: &tokio_tungstenite::tungstenite::Error) -> ReadFailure {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => ReadFailure::ConnectionClosed,
        WsError::Protocol(_) => ReadFailure::ProtocolError,
        WsError::Io(e) => ReadFailure::Other(format!("io: {}", e)),
        other => ReadFailure::Other(other.to_string()),
    }
}

/// Cooldown gate: at most one reconnect per `cooldown` window.
pub struct ReconnectGate {
    cooldown: Duration,
    last_attempt: Option<Instant>,
}

impl ReconnectGate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_attempt: None,
        }
    }

    /// Returns how long to hold before the attempt may proceed, and records
    /// the attempt as taken at `now + wait`.
    pub fn delay_for_attempt(&mut self, now: Instant) -> Duration {
        let wait = match self.last_attempt {
            Some(last) => {
                let since = now.duration_since(last);
                self.cooldown.saturating_sub(since)
            }
            None => Duration::ZERO,
        };
        self.last_attempt = Some(now + wait);
        wait
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub ws_url: String,
    pub reconnect_cooldown: Duration,
    pub max_reconnect_attempts: u32,
    pub read_deadline: Duration,
}

/// Handle to one running connection task.
pub struct WsConnection {
    pub conn_type: ConnectionType,
    pub streams: Vec<String>,
    healthy: Arc<AtomicBool>,
    last_active_ms: Arc<AtomicI64>,
    task: tokio::task::JoinHandle<()>,
}

impl WsConnection {
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn last_active_ms(&self) -> i64 {
        self.last_active_ms.load(Ordering::Acquire)
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Spawn the connection task: connect, subscribe the stream group, read until
/// failure, recover per the failure class.
pub fn spawn_connection(
    conn_type: ConnectionType,
    streams: Vec<String>,
    settings: ConnectionSettings,
    on_message: Arc<dyn Fn(&str) + Send + Sync>,
    reconnects: Arc<AtomicU64>,
    mut shutdown: watch::Receiver<bool>,
) -> WsConnection {
    let healthy = Arc::new(AtomicBool::new(false));
    let last_active_ms = Arc::new(AtomicI64::new(chrono::Utc::now().timestamp_millis()));

    let label = conn_type.label();
    let task_streams = streams.clone();
    let task_healthy = healthy.clone();
    let task_last_active = last_active_ms.clone();

    let task = tokio::spawn(async move {
        let mut gate = ReconnectGate::new(settings.reconnect_cooldown);
        let mut other_failures: u32 = 0;

        'outer: loop {
            if *shutdown.borrow() {
                break;
            }

            let session = run_session(
                &label,
                &settings,
                &task_streams,
                &on_message,
                &task_healthy,
                &task_last_active,
                &mut shutdown,
            )
            .await;

            task_healthy.store(false, Ordering::Release);

            let failure = match session {
                SessionEnd::Shutdown => break,
                SessionEnd::Failure(f) => f,
            };

            match failure {
                ReadFailure::PolicyViolation => {
                    error!(
                        "WsConnection[{}]: policy violation from upstream, terminating reader permanently",
                        label
                    );
                    break;
                }
                ReadFailure::Other(ref msg) => {
                    other_failures += 1;
                    let sleep = Duration::from_secs(2u64.pow(other_failures.min(5))).min(
                        Duration::from_secs(30),
                    );
                    warn!(
                        "WsConnection[{}]: read error ({}), backing off {:?}",
                        label, msg, sleep
                    );
                    if !sleep_or_shutdown(sleep, &mut shutdown).await {
                        break;
                    }
                }
                _ => {
                    other_failures = 0;
                    debug!("WsConnection[{}]: {:?}, reconnecting", label, failure);
                }
            }

            // Reconnect with cooldown and bounded attempts per trigger
            reconnects.fetch_add(1, Ordering::Relaxed);
            for attempt in 0..settings.max_reconnect_attempts {
                let wait = gate.delay_for_attempt(Instant::now())
                    + settings.reconnect_cooldown * attempt;
                if !sleep_or_shutdown(wait, &mut shutdown).await {
                    break 'outer;
                }
                match probe_connect(&settings.ws_url).await {
                    Ok(()) => continue 'outer,
                    Err(e) => warn!(
                        "WsConnection[{}]: reconnect attempt {} failed: {}",
                        label,
                        attempt + 1,
                        e
                    ),
                }
            }
            // All attempts failed; loop again after a full cooldown so the
            // market-level health check can still trigger a global reconnect
            if !sleep_or_shutdown(settings.reconnect_cooldown, &mut shutdown).await {
                break;
            }
        }

        task_healthy.store(false, Ordering::Release);
    });

    WsConnection {
        conn_type,
        streams,
        healthy,
        last_active_ms,
        task,
    }
}

enum SessionEnd {
    Shutdown,
    Failure(ReadFailure),
}

/// Cheap reachability check before re-entering the session loop.
async fn probe_connect(ws_url: &str) -> Result<()> {
    let url = format!("{}/stream", ws_url.trim_end_matches('/'));
    let (stream, _) = connect_async(&url)
        .await
        .context("probe connect failed")?;
    drop(stream);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn run_session(
    label: &str,
    settings: &ConnectionSettings,
    streams: &[String],
    on_message: &Arc<dyn Fn(&str) + Send + Sync>,
    healthy: &Arc<AtomicBool>,
    last_active_ms: &Arc<AtomicI64>,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let url = format!("{}/stream", settings.ws_url.trim_end_matches('/'));

    let connect = tokio::select! {
        result = connect_async(&url) => result,
        _ = shutdown.changed() => return SessionEnd::Shutdown,
    };

    let ws_stream = match connect {
        Ok((stream, _)) => stream,
        Err(e) => {
            return SessionEnd::Failure(ReadFailure::Other(format!("connect: {}", e)));
        }
    };

    info!(
        "WsConnection[{}]: connected ({} streams)",
        label,
        streams.len()
    );

    let (mut write, mut read) = ws_stream.split();

    // Subscribe the full stream group in chunks; the upstream treats repeated
    // subscribes as idempotent
    const SUBSCRIBE_CHUNK: usize = 20;
    for chunk in streams.chunks(SUBSCRIBE_CHUNK) {
        let frame = serde_json::json!({
            "method": "SUBSCRIBE",
            "params": chunk,
            "id": chrono::Utc::now().timestamp_millis(),
        });
        if let Err(e) = write.send(Message::Text(frame.to_string().into())).await {
            return SessionEnd::Failure(classify_ws_error(&e));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    healthy.store(true, Ordering::Release);

    // Serialize all outgoing frames (controls + pings) through one writer task
    let (ws_tx, mut ws_rx) = mpsc::channel::<Message>(64);
    let writer_task = tokio::spawn(async move {
        while let Some(msg) = ws_rx.recv().await {
            if write.send(msg).await.is_err() {
                break;
            }
        }
    });

    let tx_ping = ws_tx.clone();
    let ping_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(Duration::from_secs(180));
        ping_interval.tick().await; // immediate first tick
        loop {
            ping_interval.tick().await;
            if tx_ping.send(Message::Ping(vec![].into())).await.is_err() {
                break;
            }
        }
    });

    let mut protocol_errors: u32 = 0;

    let end = loop {
        let next = tokio::select! {
            next = tokio::time::timeout(settings.read_deadline, read.next()) => next,
            _ = shutdown.changed() => break SessionEnd::Shutdown,
        };

        match next {
            Err(_) => break SessionEnd::Failure(ReadFailure::Timeout),
            Ok(None) => break SessionEnd::Failure(ReadFailure::ConnectionClosed),
            Ok(Some(Ok(msg))) => {
                // Deadline advances on every successful read
                last_active_ms.store(chrono::Utc::now().timestamp_millis(), Ordering::Release);
                match msg {
                    Message::Text(text) => on_message(&text),
                    Message::Ping(payload) => {
                        let _ = ws_tx.send(Message::Pong(payload)).await;
                    }
                    Message::Close(Some(frame)) if frame.code == CloseCode::Policy => {
                        break SessionEnd::Failure(ReadFailure::PolicyViolation);
                    }
                    Message::Close(frame) => {
                        info!("WsConnection[{}]: closed by server: {:?}", label, frame);
                        break SessionEnd::Failure(ReadFailure::ConnectionClosed);
                    }
                    _ => {}
                }
            }
            Ok(Some(Err(e))) => {
                let failure = classify_ws_error(&e);
                if failure == ReadFailure::ProtocolError {
                    protocol_errors += 1;
                    if protocol_errors <= 2 {
                        // Resubscribe in place before giving up on the socket
                        warn!(
                            "WsConnection[{}]: protocol error ({}), resubscribing",
                            label, e
                        );
                        for chunk in streams.chunks(SUBSCRIBE_CHUNK) {
                            let frame = serde_json::json!({
                                "method": "SUBSCRIBE",
                                "params": chunk,
                                "id": chrono::Utc::now().timestamp_millis(),
                            });
                            if ws_tx
                                .send(Message::Text(frame.to_string().into()))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        continue;
                    }
                }
                break SessionEnd::Failure(failure);
            }
        }
    };

    ping_task.abort();
    writer_task.abort();
    end
}

/// Sleep that aborts early on shutdown. Returns false when shutting down.
async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if duration.is_zero() {
        return !*shutdown.borrow();
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        changed = shutdown.changed() => match changed {
            Ok(_) => !*shutdown.borrow(),
            Err(_) => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_labels_follow_market_kind_group() {
        let conn = ConnectionType {
            market: Market::Spot,
            kind: StreamKind::Ticker,
            group: 0,
            elastic: StreamKind::Ticker.is_elastic(),
        };
        assert_eq!(conn.label(), "spot_ticker_0");

        let kline_kind = StreamKind::Kline("1m".to_string());
        let kline = ConnectionType {
            market: Market::Futures,
            kind: kline_kind.clone(),
            group: 2,
            elastic: kline_kind.is_elastic(),
        };
        assert_eq!(kline.label(), "futures_kline_1m_2");
    }

    #[test]
    fn only_kline_kinds_are_elastic() {
        assert!(StreamKind::Kline("1m".into()).is_elastic());
        assert!(StreamKind::Kline("4h".into()).is_elastic());
        assert!(!StreamKind::Ticker.is_elastic());
        assert!(!StreamKind::Depth.is_elastic());
        assert!(!StreamKind::Trade.is_elastic());
    }

    #[test]
    fn reconnect_gate_suppresses_attempts_within_cooldown() {
        let mut gate = ReconnectGate::new(Duration::from_secs(5));
        let t0 = Instant::now();

        // First attempt passes immediately
        assert_eq!(gate.delay_for_attempt(t0), Duration::ZERO);

        // A second attempt 1s later is held for the remaining 4s
        let t1 = t0 + Duration::from_secs(1);
        assert_eq!(gate.delay_for_attempt(t1), Duration::from_secs(4));

        // An attempt after the cooldown passes immediately
        let t2 = t0 + Duration::from_secs(20);
        assert_eq!(gate.delay_for_attempt(t2), Duration::ZERO);
    }

    #[test]
    fn stream_kind_suffixes() {
        assert_eq!(StreamKind::Ticker.suffix(), "@ticker");
        assert_eq!(StreamKind::Kline("5m".into()).suffix(), "@kline_5m");
        assert_eq!(StreamKind::Depth.suffix(), "@depth20@100ms");
        assert_eq!(StreamKind::Trade.suffix(), "@trade");
    }
}
