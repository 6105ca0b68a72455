//! Hyperliquid leader-source adapter.
//!
//! Two channels, per the venue's public API:
//! - REST `POST {base}/info` with `{"type": "userFillsByTime", ...}` for
//!   backfill and polling fallback.
//! - WebSocket `userFills` subscription for the live stream.
//!
//! Poison payloads (unparseable fills) are counted, logged, and skipped; a
//! fill group missing one member still aggregates from the rest.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use pf_schemas::{Fill, FillSide};
use serde::Deserialize;
use serde_json::json;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::source::{FillStream, LeaderSource, SourceError};

/// Timeout wrapped around every REST call.
const REST_TIMEOUT: Duration = Duration::from_secs(10);

/// Raw fill shape as the venue reports it. Numeric fields arrive as strings.
#[derive(Debug, Deserialize)]
struct WireFill {
    coin: String,
    side: String,
    sz: String,
    time: i64,
    hash: String,
    tid: u64,
    #[serde(rename = "startPosition")]
    start_position: Option<String>,
    px: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WsEnvelope {
    channel: String,
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct WsUserFills {
    #[serde(default, rename = "isSnapshot")]
    is_snapshot: bool,
    fills: Vec<serde_json::Value>,
}

#[derive(Debug)]
pub struct HyperliquidSource {
    http: reqwest::Client,
    rest_url: String,
    ws_url: String,
    wallet: String,
    /// Unparseable fills dropped so far (REST + stream).
    poison_count: Arc<AtomicU64>,
}

impl HyperliquidSource {
    pub fn new(rest_url: &str, ws_url: &str, wallet: &str) -> Result<Self, SourceError> {
        if wallet.trim().is_empty() {
            return Err(SourceError::Config("leader wallet is empty".to_string()));
        }
        let http = reqwest::Client::builder()
            .timeout(REST_TIMEOUT)
            .build()
            .map_err(|e| SourceError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            rest_url: rest_url.trim_end_matches('/').to_string(),
            ws_url: ws_url.to_string(),
            wallet: wallet.to_string(),
            poison_count: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn poison_count(&self) -> u64 {
        self.poison_count.load(Ordering::Relaxed)
    }

    fn decode_fill(raw: &serde_json::Value, poison: &AtomicU64) -> Option<Fill> {
        let wire: WireFill = match serde_json::from_value(raw.clone()) {
            Ok(w) => w,
            Err(err) => {
                poison.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%err, "poison fill skipped");
                return None;
            }
        };

        let Some(side) = FillSide::from_code(&wire.side) else {
            poison.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(side = %wire.side, tx = %wire.hash, "fill with invalid side skipped");
            return None;
        };

        let size = match wire.sz.parse::<f64>() {
            Ok(s) if s > 0.0 => s,
            _ => {
                poison.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(sz = %wire.sz, tx = %wire.hash, "fill with invalid size skipped");
                return None;
            }
        };

        Some(Fill {
            tx_hash: wire.hash,
            tid: wire.tid,
            coin: wire.coin,
            side,
            size,
            start_position: wire.start_position.and_then(|s| s.parse().ok()),
            time_ms: wire.time,
            px: wire.px.and_then(|p| p.parse().ok()),
        })
    }
}

#[async_trait]
impl LeaderSource for HyperliquidSource {
    fn name(&self) -> &'static str {
        "hyperliquid"
    }

    async fn fetch_fills(&self, since_ms: i64, until_ms: i64) -> Result<Vec<Fill>, SourceError> {
        let body = json!({
            "type": "userFillsByTime",
            "user": self.wallet,
            "startTime": since_ms,
            "endTime": until_ms,
        });

        let resp = self
            .http
            .post(format!("{}/info", self.rest_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| SourceError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(SourceError::Api {
                code: Some(status.as_u16() as i64),
                message,
            });
        }

        let raw: Vec<serde_json::Value> = resp
            .json()
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))?;

        // The half-open window contract is enforced here: the venue's
        // endTime is inclusive.
        Ok(raw
            .iter()
            .filter_map(|v| Self::decode_fill(v, &self.poison_count))
            .filter(|f| f.time_ms >= since_ms && f.time_ms < until_ms)
            .collect())
    }

    async fn subscribe(&self) -> Result<FillStream, SourceError> {
        let (ws, _) = connect_async(&self.ws_url)
            .await
            .map_err(|e| SourceError::Transport(e.to_string()))?;
        let (mut sink, stream) = ws.split();

        let sub = json!({
            "method": "subscribe",
            "subscription": { "type": "userFills", "user": self.wallet },
        });
        sink.send(Message::Text(sub.to_string()))
            .await
            .map_err(|e| SourceError::Transport(e.to_string()))?;

        let poison = Arc::clone(&self.poison_count);
        let fills = stream
            .filter_map(move |msg| {
                let poison = Arc::clone(&poison);
                async move {
                    match msg {
                        Ok(Message::Text(text)) => {
                            let env: WsEnvelope = match serde_json::from_str(&text) {
                                Ok(e) => e,
                                Err(_) => return None, // pings, acks, other channels
                            };
                            if env.channel != "userFills" {
                                return None;
                            }
                            let payload: WsUserFills = match serde_json::from_value(env.data) {
                                Ok(p) => p,
                                Err(err) => {
                                    tracing::warn!(%err, "undecodable userFills frame");
                                    return None;
                                }
                            };
                            // The initial snapshot duplicates what backfill
                            // already covers; dedup would drop it anyway, but
                            // skipping avoids a burst of no-op commits.
                            if payload.is_snapshot {
                                return None;
                            }
                            let decoded: Vec<Result<Fill, SourceError>> = payload
                                .fills
                                .iter()
                                .filter_map(|v| Self::decode_fill(v, &poison))
                                .map(Ok)
                                .collect();
                            Some(futures_util::stream::iter(decoded))
                        }
                        Ok(_) => None,
                        Err(e) => Some(futures_util::stream::iter(vec![Err(
                            SourceError::Transport(e.to_string()),
                        )])),
                    }
                }
            })
            .flatten();

        Ok(fills.boxed())
    }
}
