//! Signed REST adapter for a Binance-style USD-M futures venue.
//!
//! Thin by design: it translates the [`VenueAdapter`] contract onto the
//! venue's `/fapi` endpoints and maps its error signals into the internal
//! taxonomy. Lifecycle policy (TIF, fallback, budgets) lives in the
//! executor, never here.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use pf_schemas::{OrderStatus, OrderType, PricePoint, Side, SymbolFilters, TimeInForce};
use serde::Deserialize;
use sha2::Sha256;

use crate::venue::{
    CancelOutcome, PositionsSnapshot, SubmitOutcome, SubmitRequest, VenueAdapter, VenueError,
    VenueOrder,
};

type HmacSha256 = Hmac<Sha256>;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Venue error code for a duplicate client order id.
const CODE_DUPLICATE_CLIENT_ID: i64 = -4116;
/// Venue error code for "order does not exist" on cancel/query.
const CODE_ORDER_NOT_FOUND: i64 = -2011;
/// Unknown-order code returned by query endpoints.
const CODE_NO_SUCH_ORDER: i64 = -2013;

pub struct RestVenue {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: Option<i64>,
    status: Option<String>,
    executed_qty: Option<String>,
    avg_price: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRisk {
    symbol: String,
    position_amt: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PremiumIndex {
    mark_price: String,
    time: i64,
}

#[derive(Debug, Deserialize)]
struct ServerTime {
    #[serde(rename = "serverTime")]
    server_time: i64,
}

impl RestVenue {
    pub fn new(base_url: &str, api_key: &str, api_secret: &str) -> Result<Self, VenueError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| VenueError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
        })
    }

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_query(&self, mut params: BTreeMap<String, String>) -> String {
        let now_ms = chrono::Utc::now().timestamp_millis();
        params.insert("timestamp".to_string(), now_ms.to_string());
        let query: String = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let signature = self.sign(&query);
        format!("{query}&signature={signature}")
    }

    /// Issue one request and decode either `T` or the venue's error shape.
    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &str,
    ) -> Result<T, VenueError> {
        let url = format!("{}{}?{}", self.base_url, path, query);
        let resp = self
            .http
            .request(method, url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    VenueError::Timeout
                } else {
                    VenueError::Transport(e.to_string())
                }
            })?;

        let status = resp.status();
        if status.as_u16() == 429 || status.as_u16() == 418 {
            let retry_after_ms = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(|secs| secs * 1000);
            return Err(VenueError::RateLimited { retry_after_ms });
        }

        let body = resp
            .text()
            .await
            .map_err(|e| VenueError::Transport(e.to_string()))?;

        if status.is_success() {
            serde_json::from_str(&body).map_err(|e| VenueError::Api {
                code: None,
                message: format!("undecodable response: {e}: {body}"),
            })
        } else {
            let err: ApiError = serde_json::from_str(&body).unwrap_or(ApiError {
                code: status.as_u16() as i64,
                msg: body,
            });
            Err(VenueError::Api {
                code: Some(err.code),
                message: err.msg,
            })
        }
    }

    fn map_status(raw: &str) -> OrderStatus {
        match raw {
            "NEW" => OrderStatus::Submitted,
            "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
            "FILLED" => OrderStatus::Filled,
            "CANCELED" => OrderStatus::Canceled,
            "EXPIRED" | "EXPIRED_IN_MATCH" => OrderStatus::Expired,
            "REJECTED" => OrderStatus::Rejected,
            _ => OrderStatus::Unknown,
        }
    }

    fn order_from_response(resp: OrderResponse) -> VenueOrder {
        VenueOrder {
            exchange_order_id: resp.order_id.map(|id| id.to_string()),
            status: resp
                .status
                .as_deref()
                .map(Self::map_status)
                .unwrap_or(OrderStatus::Unknown),
            filled_qty: resp
                .executed_qty
                .and_then(|q| q.parse().ok())
                .unwrap_or(0.0),
            avg_price: resp
                .avg_price
                .and_then(|p| p.parse::<f64>().ok())
                .filter(|p| *p > 0.0),
            error_code: None,
            error_message: None,
        }
    }
}

#[async_trait]
impl VenueAdapter for RestVenue {
    async fn submit_order(&self, req: SubmitRequest) -> Result<SubmitOutcome, VenueError> {
        let mut params = BTreeMap::from([
            ("symbol".to_string(), req.symbol.clone()),
            (
                "side".to_string(),
                match req.side {
                    Side::Buy => "BUY".to_string(),
                    Side::Sell => "SELL".to_string(),
                },
            ),
            ("newClientOrderId".to_string(), req.client_id.clone()),
            ("quantity".to_string(), req.qty.to_string()),
            ("reduceOnly".to_string(), req.reduce_only.to_string()),
        ]);
        match req.order_type {
            OrderType::Limit => {
                params.insert("type".to_string(), "LIMIT".to_string());
                params.insert(
                    "timeInForce".to_string(),
                    match req.tif {
                        TimeInForce::Gtc => "GTC".to_string(),
                        TimeInForce::Ioc => "IOC".to_string(),
                    },
                );
                if let Some(price) = req.price {
                    params.insert("price".to_string(), price.to_string());
                }
            }
            OrderType::Market => {
                params.insert("type".to_string(), "MARKET".to_string());
            }
        }

        let query = self.signed_query(params);
        match self
            .call::<OrderResponse>(reqwest::Method::POST, "/fapi/v1/order", &query)
            .await
        {
            Ok(resp) => Ok(SubmitOutcome::Submitted {
                exchange_order_id: resp.order_id.map(|id| id.to_string()).unwrap_or_default(),
            }),
            Err(VenueError::Api {
                code: Some(CODE_DUPLICATE_CLIENT_ID),
                ..
            }) => Ok(SubmitOutcome::DuplicateClientId),
            Err(VenueError::Api {
                code: Some(code),
                message,
            }) => Ok(SubmitOutcome::Rejected {
                code: code.to_string(),
                message,
            }),
            Err(other) => Err(other),
        }
    }

    async fn query_order(&self, client_id: &str) -> Result<Option<VenueOrder>, VenueError> {
        let params = BTreeMap::from([(
            "origClientOrderId".to_string(),
            client_id.to_string(),
        )]);
        let query = self.signed_query(params);
        match self
            .call::<OrderResponse>(reqwest::Method::GET, "/fapi/v1/order", &query)
            .await
        {
            Ok(resp) => Ok(Some(Self::order_from_response(resp))),
            Err(VenueError::Api {
                code: Some(CODE_ORDER_NOT_FOUND | CODE_NO_SUCH_ORDER),
                ..
            }) => Ok(None),
            Err(other) => Err(other),
        }
    }

    async fn cancel_order(&self, client_id: &str) -> Result<CancelOutcome, VenueError> {
        let params = BTreeMap::from([(
            "origClientOrderId".to_string(),
            client_id.to_string(),
        )]);
        let query = self.signed_query(params);
        match self
            .call::<OrderResponse>(reqwest::Method::DELETE, "/fapi/v1/order", &query)
            .await
        {
            Ok(_) => Ok(CancelOutcome::Ok),
            Err(VenueError::Api {
                code: Some(CODE_ORDER_NOT_FOUND | CODE_NO_SUCH_ORDER),
                ..
            }) => Ok(CancelOutcome::NotFound),
            Err(other) => Err(other),
        }
    }

    async fn fetch_positions(&self, symbols: &[String]) -> Result<PositionsSnapshot, VenueError> {
        let query = self.signed_query(BTreeMap::new());
        let all: Vec<PositionRisk> = self
            .call(reqwest::Method::GET, "/fapi/v2/positionRisk", &query)
            .await?;

        let fetched_at_ms = chrono::Utc::now().timestamp_millis();

        let positions = all
            .into_iter()
            .filter(|p| symbols.contains(&p.symbol))
            .filter_map(|p| p.position_amt.parse::<f64>().ok().map(|q| (p.symbol, q)))
            .collect();

        Ok(PositionsSnapshot {
            positions,
            fetched_at_ms,
        })
    }

    async fn fetch_mark_price(&self, symbol: &str) -> Result<PricePoint, VenueError> {
        let query = format!("symbol={symbol}");
        let idx: PremiumIndex = self
            .call(reqwest::Method::GET, "/fapi/v1/premiumIndex", &query)
            .await?;
        let price = idx.mark_price.parse().map_err(|_| VenueError::Api {
            code: None,
            message: format!("bad mark price: {}", idx.mark_price),
        })?;
        Ok(PricePoint {
            price,
            timestamp_ms: idx.time,
        })
    }

    async fn fetch_filters(&self, symbol: &str) -> Result<SymbolFilters, VenueError> {
        #[derive(Debug, Deserialize)]
        struct ExchangeInfo {
            symbols: Vec<SymbolInfo>,
        }
        #[derive(Debug, Deserialize)]
        struct SymbolInfo {
            symbol: String,
            filters: Vec<serde_json::Value>,
        }

        let query = format!("symbol={symbol}");
        let info: ExchangeInfo = self
            .call(reqwest::Method::GET, "/fapi/v1/exchangeInfo", &query)
            .await?;
        let sym = info
            .symbols
            .into_iter()
            .find(|s| s.symbol == symbol)
            .ok_or_else(|| VenueError::Api {
                code: None,
                message: format!("symbol {symbol} not listed"),
            })?;

        let mut out = SymbolFilters {
            min_qty: 0.0,
            step_size: 0.0,
            min_notional: 0.0,
            tick_size: 0.0,
        };
        for f in sym.filters {
            let get = |key: &str| {
                f.get(key)
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse::<f64>().ok())
            };
            match f.get("filterType").and_then(|v| v.as_str()) {
                Some("LOT_SIZE") => {
                    out.min_qty = get("minQty").unwrap_or(0.0);
                    out.step_size = get("stepSize").unwrap_or(0.0);
                }
                Some("PRICE_FILTER") => {
                    out.tick_size = get("tickSize").unwrap_or(0.0);
                }
                Some("MIN_NOTIONAL") => {
                    out.min_notional = get("notional")
                        .or_else(|| get("minNotional"))
                        .unwrap_or(0.0);
                }
                _ => {}
            }
        }
        Ok(out)
    }

    async fn server_time(&self) -> Result<i64, VenueError> {
        let t: ServerTime = self
            .call(reqwest::Method::GET, "/fapi/v1/time", "")
            .await?;
        Ok(t.server_time)
    }
}
