//! Hyperliquid REST client (info endpoint).

use rust_decimal::Decimal;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument};

use super::types::*;
use crate::utils::retry::{with_backoff, RetryPolicy};
use crate::venues::error::{VenueError, VenueResult};

/// Base URL for Hyperliquid mainnet.
const MAINNET_API_URL: &str = "https://api.hyperliquid.xyz";

/// Minimum spacing between requests to the venue.
const MIN_REQUEST_INTERVAL: Duration = Duration::from_millis(100);

/// Hyperliquid API client for market and account data.
pub struct HyperliquidClient {
    http: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
    last_request: Mutex<Option<Instant>>,
}

impl HyperliquidClient {
    /// Create a new client for mainnet.
    pub fn new() -> VenueResult<Self> {
        Self::with_base_url(MAINNET_API_URL)
    }

    /// Create a new client with a custom base URL.
    pub fn with_base_url(base_url: &str) -> VenueResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| VenueError::Network(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.to_string(),
            retry: RetryPolicy::default(),
            last_request: Mutex::new(None),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Enforce the per-venue minimum request interval.
    async fn throttle(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < MIN_REQUEST_INTERVAL {
                tokio::time::sleep(MIN_REQUEST_INTERVAL - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    async fn post_info<T: serde::de::DeserializeOwned>(
        &self,
        request: &InfoRequest,
    ) -> VenueResult<T> {
        self.throttle().await;
        let url = format!("{}/info", self.base_url);

        let response = self.http.post(&url).json(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VenueError::from_status(status, body));
        }

        response
            .json()
            .await
            .map_err(|e| VenueError::Network(format!("invalid info response: {}", e)))
    }

    /// Get metadata and asset contexts for all perpetuals.
    #[instrument(skip(self), name = "hl_meta_and_asset_ctxs")]
    pub async fn meta_and_asset_ctxs(&self) -> VenueResult<MetaAndAssetCtxsResponse> {
        let request = InfoRequest::MetaAndAssetCtxs;
        with_backoff(&self.retry, "metaAndAssetCtxs", || self.post_info(&request)).await
    }

    /// Get all assets with their current market data.
    #[instrument(skip(self), name = "hl_get_assets")]
    pub async fn get_assets(&self) -> VenueResult<Vec<PerpAsset>> {
        let (meta, ctxs) = self.meta_and_asset_ctxs().await?;

        if meta.universe.len() != ctxs.len() {
            return Err(VenueError::Network(format!(
                "universe ({}) and context ({}) length mismatch",
                meta.universe.len(),
                ctxs.len()
            )));
        }

        let assets: Vec<PerpAsset> = meta
            .universe
            .into_iter()
            .zip(ctxs)
            .map(|(m, c)| PerpAsset {
                name: m.name,
                sz_decimals: m.sz_decimals,
                max_leverage: m.max_leverage,
                funding_rate: c.funding,
                open_interest: c.open_interest,
                oracle_price: c.oracle_px,
                mark_price: c.mark_px,
                mid_price: c.mid_px,
                volume_24h: c.day_ntl_vlm,
                premium: c.premium.unwrap_or_default(),
            })
            .collect();

        debug!("fetched {} perpetual assets", assets.len());
        Ok(assets)
    }

    /// Get one asset by coin name.
    pub async fn get_asset(&self, coin: &str) -> VenueResult<PerpAsset> {
        self.get_assets()
            .await?
            .into_iter()
            .find(|a| a.name == coin)
            .ok_or_else(|| VenueError::Client(format!("unknown coin {}", coin)))
    }

    /// Get mid prices for all coins.
    #[instrument(skip(self), name = "hl_all_mids")]
    pub async fn all_mids(&self) -> VenueResult<HashMap<String, Decimal>> {
        let request = InfoRequest::AllMids;
        let raw: HashMap<String, String> =
            with_backoff(&self.retry, "allMids", || self.post_info(&request)).await?;

        raw.into_iter()
            .map(|(coin, px)| {
                px.parse::<Decimal>()
                    .map(|p| (coin, p))
                    .map_err(|e| VenueError::Network(format!("bad mid price: {}", e)))
            })
            .collect()
    }

    /// Get account state for a wallet.
    #[instrument(skip(self), name = "hl_clearinghouse_state")]
    pub async fn clearinghouse_state(&self, wallet: &str) -> VenueResult<ClearinghouseState> {
        let request = InfoRequest::ClearinghouseState {
            user: wallet.to_string(),
        };
        with_backoff(&self.retry, "clearinghouseState", || self.post_info(&request)).await
    }

    /// Get funding history for a coin.
    #[instrument(skip(self), name = "hl_funding_history")]
    pub async fn funding_history(
        &self,
        coin: &str,
        start_time: i64,
        end_time: Option<i64>,
    ) -> VenueResult<Vec<FundingHistoryRecord>> {
        let request = InfoRequest::FundingHistory {
            coin: coin.to_string(),
            start_time,
            end_time,
        };
        let records: Vec<FundingHistoryRecord> =
            with_backoff(&self.retry, "fundingHistory", || self.post_info(&request)).await?;

        debug!("fetched {} funding records for {}", records.len(), coin);
        Ok(records)
    }

    /// Whether the venue responds at all.
    pub async fn health_check(&self) -> bool {
        self.meta_and_asset_ctxs().await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn meta_body() -> serde_json::Value {
        serde_json::json!([
            {"universe": [
                {"name": "SOL", "szDecimals": 2, "maxLeverage": 20}
            ]},
            [{
                "funding": "-0.0000125",
                "openInterest": "100000",
                "prevDayPx": "150",
                "dayNtlVlm": "5000000",
                "premium": "-0.0001",
                "oraclePx": "150.0",
                "markPx": "149.95",
                "midPx": "149.96"
            }]
        ])
    }

    #[tokio::test]
    async fn test_get_assets() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/info"))
            .and(body_partial_json(
                serde_json::json!({"type": "metaAndAssetCtxs"}),
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(meta_body()))
            .mount(&server)
            .await;

        let client = HyperliquidClient::with_base_url(&server.uri()).unwrap();
        let assets = client.get_assets().await.unwrap();

        assert_eq!(assets.len(), 1);
        assert_eq!(assets[0].name, "SOL");
        assert_eq!(assets[0].funding_rate.to_string(), "-0.0000125");
    }

    #[tokio::test]
    async fn test_get_asset_unknown_coin() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/info"))
            .respond_with(ResponseTemplate::new(200).set_body_json(meta_body()))
            .mount(&server)
            .await;

        let client = HyperliquidClient::with_base_url(&server.uri()).unwrap();
        let err = client.get_asset("DOGE").await.unwrap_err();
        assert!(matches!(err, VenueError::Client(_)));
    }

    #[tokio::test]
    async fn test_all_mids() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/info"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"SOL": "149.96", "BTC": "65000.5"})),
            )
            .mount(&server)
            .await;

        let client = HyperliquidClient::with_base_url(&server.uri()).unwrap();
        let mids = client.all_mids().await.unwrap();
        assert_eq!(mids["SOL"].to_string(), "149.96");
        assert_eq!(mids.len(), 2);
    }
}
