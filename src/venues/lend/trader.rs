//! HTTP client for the lending venue's trade-builder API.

use async_trait::async_trait;
use base64::Engine;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument};

use super::{LongOpenReceipt, LongOpenRequest, LongPositionState, LongVenue, UnsignedLongTx};
use crate::model::{Asset, Protocol, VenueRates, USDC_MINT};
use crate::utils::retry::{with_backoff, RetryPolicy};
use crate::venues::error::{VenueError, VenueResult};

/// Minimum spacing between requests to the venue API.
const MIN_REQUEST_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Deserialize)]
struct MarketRow {
    protocol: String,
    asset_mint: String,
    quote_mint: String,
    #[serde(with = "rust_decimal::serde::str")]
    lending_apy: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    borrowing_apy: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    max_borrow_capacity_usd: Decimal,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    oracle_price: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
struct BuildResponse {
    intent_id: String,
    /// Base64-encoded unsigned transaction.
    transaction: String,
}

#[derive(Debug, Clone, Deserialize)]
struct IntentStatusResponse {
    position_handle: String,
    #[serde(with = "rust_decimal::serde::str")]
    collateral_usd: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    borrowed_usd: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    base_token_qty: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    entry_price: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
struct PositionRow {
    position_handle: String,
    #[serde(with = "rust_decimal::serde::str")]
    health_factor: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    base_token_qty: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    quote_borrowed: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    price_base: Decimal,
    is_active: bool,
}

/// Client for the lending venue REST API.
pub struct LendClient {
    http: reqwest::Client,
    base_url: String,
    wallet: String,
    retry: RetryPolicy,
    last_request: Mutex<Option<Instant>>,
}

impl LendClient {
    pub fn new(base_url: impl Into<String>, wallet: impl Into<String>) -> VenueResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| VenueError::Network(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.into(),
            wallet: wallet.into(),
            retry: RetryPolicy::default(),
            last_request: Mutex::new(None),
        })
    }

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

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> VenueResult<T> {
        self.throttle().await;
        let response = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await?;
        Self::parse(response).await
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> VenueResult<T> {
        self.throttle().await;
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(&body)
            .send()
            .await?;
        Self::parse(response).await
    }

    async fn parse<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> VenueResult<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VenueError::from_status(status, body));
        }
        response
            .json()
            .await
            .map_err(|e| VenueError::Network(format!("invalid venue response: {}", e)))
    }

    fn parse_protocol(name: &str) -> Option<Protocol> {
        match name {
            "marginfi" => Some(Protocol::Marginfi),
            "kamino" => Some(Protocol::Kamino),
            "solend" => Some(Protocol::Solend),
            "drift" => Some(Protocol::Drift),
            _ => None,
        }
    }

    fn open_body(&self, request: &LongOpenRequest) -> serde_json::Value {
        json!({
            "wallet": self.wallet,
            "protocol": request.protocol.to_string(),
            "asset_mint": request.asset.mint(),
            "quote_mint": USDC_MINT,
            "collateral_usd": request.collateral_usd.to_string(),
            "leverage": request.leverage.to_string(),
        })
    }
}

#[async_trait]
impl LongVenue for LendClient {
    #[instrument(skip(self))]
    async fn get_markets(&self) -> VenueResult<Vec<VenueRates>> {
        let rows: Vec<MarketRow> = with_backoff(&self.retry, "lend_get_markets", || {
            self.get_json("/v1/markets")
        })
        .await?;

        let rates = rows
            .into_iter()
            .filter_map(|row| {
                // Unknown protocols are skipped, not an error: the venue may
                // list sub-venues this engine does not trade.
                let protocol = Self::parse_protocol(&row.protocol)?;
                Some(VenueRates {
                    protocol,
                    long_asset_mint: row.asset_mint,
                    quote_mint: row.quote_mint,
                    lending_apy: row.lending_apy,
                    borrowing_apy: row.borrowing_apy,
                    max_borrow_capacity_usd: row.max_borrow_capacity_usd,
                })
            })
            .collect::<Vec<_>>();

        debug!(markets = rates.len(), "fetched lending markets");
        Ok(rates)
    }

    #[instrument(skip(self))]
    async fn oracle_price(&self, asset: Asset) -> VenueResult<Option<Decimal>> {
        let rows: Vec<MarketRow> = with_backoff(&self.retry, "lend_get_markets", || {
            self.get_json("/v1/markets")
        })
        .await?;
        Ok(rows
            .into_iter()
            .find(|r| r.asset_mint == asset.mint())
            .and_then(|r| r.oracle_price))
    }

    #[instrument(skip(self, request), fields(asset = %request.asset, protocol = %request.protocol))]
    async fn build_open(&self, request: &LongOpenRequest) -> VenueResult<UnsignedLongTx> {
        let built: BuildResponse = self
            .post_json("/v1/positions/build-open", self.open_body(request))
            .await?;

        let tx_bytes = base64::engine::general_purpose::STANDARD
            .decode(&built.transaction)
            .map_err(|e| VenueError::Network(format!("undecodable transaction: {}", e)))?;

        Ok(UnsignedLongTx {
            intent_id: built.intent_id,
            tx_bytes,
        })
    }

    #[instrument(skip(self))]
    async fn build_close(&self, position_handle: &str) -> VenueResult<UnsignedLongTx> {
        let built: BuildResponse = self
            .post_json(
                "/v1/positions/build-close",
                json!({"wallet": self.wallet, "position_handle": position_handle}),
            )
            .await?;

        let tx_bytes = base64::engine::general_purpose::STANDARD
            .decode(&built.transaction)
            .map_err(|e| VenueError::Network(format!("undecodable transaction: {}", e)))?;

        Ok(UnsignedLongTx {
            intent_id: built.intent_id,
            tx_bytes,
        })
    }

    #[instrument(skip(self, request), fields(asset = %request.asset))]
    async fn simulate_open(&self, request: &LongOpenRequest) -> VenueResult<()> {
        let _: serde_json::Value = self
            .post_json("/v1/positions/simulate-open", self.open_body(request))
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn confirm_open(&self, intent_id: &str, txid: &str) -> VenueResult<LongOpenReceipt> {
        let path = format!("/v1/intents/{}?txid={}", intent_id, txid);
        let status: IntentStatusResponse =
            with_backoff(&self.retry, "lend_confirm_open", || self.get_json(&path)).await?;

        Ok(LongOpenReceipt {
            position_handle: status.position_handle,
            intent_id: intent_id.to_string(),
            collateral_usd: status.collateral_usd,
            borrowed_usd: status.borrowed_usd,
            base_token_qty: status.base_token_qty,
            entry_price: status.entry_price,
        })
    }

    #[instrument(skip(self))]
    async fn position_state(&self, handle: &str) -> VenueResult<LongPositionState> {
        let path = format!("/v1/positions/{}", handle);
        let row: PositionRow =
            with_backoff(&self.retry, "lend_position_state", || self.get_json(&path)).await?;

        Ok(LongPositionState {
            position_handle: row.position_handle,
            health_factor: row.health_factor,
            base_token_qty: row.base_token_qty,
            quote_borrowed: row.quote_borrowed,
            price_base: row.price_base,
            is_active: row.is_active,
        })
    }

    async fn monitor_health(&self, handle: &str) -> VenueResult<Decimal> {
        Ok(self.position_state(handle).await?.health_factor)
    }

    async fn health_check(&self) -> bool {
        self.get_json::<Vec<MarketRow>>("/v1/markets").await.is_ok()
    }
}
