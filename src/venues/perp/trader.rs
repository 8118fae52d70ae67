//! Hyperliquid trader: exchange-endpoint actions signed through the
//! external key service, plus the market-data surface of `PerpVenue`.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::client::HyperliquidClient;
use super::oracle::FundingOracle;
use super::{
    PerpAccountSnapshot, PerpFill, PerpMarketSnapshot, PerpOrder, PerpPositionInfo, PerpVenue,
};
use crate::model::FundingRate;
use crate::venues::chain::KeyService;
use crate::venues::error::{VenueError, VenueResult};

/// Minimum spacing between exchange-endpoint requests.
const MIN_ACTION_INTERVAL: Duration = Duration::from_millis(200);

/// EIP-712 domain for exchange actions.
fn exchange_domain() -> Value {
    json!({
        "name": "Exchange",
        "version": "1",
        "chainId": 42161,
        "verifyingContract": "0x0000000000000000000000000000000000000000",
    })
}

/// Trading client for the perp venue.
pub struct HyperliquidTrader {
    client: Arc<HyperliquidClient>,
    oracle: FundingOracle,
    key: Arc<dyn KeyService>,
    http: reqwest::Client,
    wallet: String,
    last_action: Mutex<Option<Instant>>,
}

impl HyperliquidTrader {
    pub fn new(
        client: Arc<HyperliquidClient>,
        key: Arc<dyn KeyService>,
        wallet: impl Into<String>,
    ) -> VenueResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| VenueError::Network(e.to_string()))?;

        Ok(Self {
            oracle: FundingOracle::new(client.clone()),
            client,
            key,
            http,
            wallet: wallet.into(),
            last_action: Mutex::new(None),
        })
    }

    pub fn wallet(&self) -> &str {
        &self.wallet
    }

    async fn throttle(&self) {
        let mut last = self.last_action.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < MIN_ACTION_INTERVAL {
                tokio::time::sleep(MIN_ACTION_INTERVAL - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// Sign and submit an exchange action.
    async fn post_action(&self, action: Value) -> VenueResult<super::types::ExchangeResponse> {
        self.throttle().await;

        let nonce = Utc::now().timestamp_millis();
        let payload = json!({"action": action, "nonce": nonce});
        let signature = self
            .key
            .sign_typed_data(&exchange_domain(), &payload)
            .await?;

        let body = json!({
            "action": payload["action"],
            "nonce": nonce,
            "signature": signature,
        });

        let url = format!("{}/exchange", self.client.base_url());
        let response = self.http.post(&url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(VenueError::from_status(status, text));
        }

        let parsed: super::types::ExchangeResponse = response
            .json()
            .await
            .map_err(|e| VenueError::Network(format!("invalid exchange response: {}", e)))?;

        if parsed.status != "ok" {
            return Err(VenueError::Rejected(format!(
                "exchange action failed: {}",
                parsed.status
            )));
        }
        Ok(parsed)
    }
}

#[async_trait]
impl PerpVenue for HyperliquidTrader {
    async fn snapshot(&self, coin: &str) -> VenueResult<PerpMarketSnapshot> {
        let asset = self.client.get_asset(coin).await?;
        let mid = match asset.mid_price {
            Some(mid) => mid,
            // Inactive book: fall back to mark.
            None => asset.mark_price,
        };
        Ok(PerpMarketSnapshot {
            coin: asset.name,
            mark_price: asset.mark_price,
            oracle_price: asset.oracle_price,
            mid_price: mid,
            funding_hourly: asset.funding_rate,
            premium: asset.premium,
            sz_decimals: asset.sz_decimals,
        })
    }

    async fn current_funding(&self, coin: &str) -> VenueResult<FundingRate> {
        self.oracle.current_funding(coin).await
    }

    async fn predict_next_funding(&self, coin: &str) -> VenueResult<FundingRate> {
        let prediction = self.oracle.predict_next_funding(coin).await?;
        Ok(FundingRate::new(
            coin,
            prediction.predicted_rate_8h,
            Utc::now(),
        ))
    }

    async fn funding_volatility(&self, coin: &str, lookback_hours: u32) -> VenueResult<Decimal> {
        self.oracle.funding_volatility(coin, lookback_hours).await
    }

    #[instrument(skip(self))]
    async fn account_snapshot(&self) -> VenueResult<PerpAccountSnapshot> {
        let state = self.client.clearinghouse_state(&self.wallet).await?;
        let positions = state
            .asset_positions
            .into_iter()
            .map(|p| {
                let pos = p.position;
                PerpPositionInfo {
                    coin: pos.coin,
                    size_base: pos.szi,
                    entry_price: pos.entry_px,
                    position_value: pos.position_value,
                    unrealized_pnl: pos.unrealized_pnl,
                    margin_used: pos.margin_used,
                    liquidation_price: pos.liquidation_px,
                    leverage: Decimal::from(pos.leverage.value),
                    cum_funding_since_open: pos.cum_funding.since_open,
                }
            })
            .collect();

        Ok(PerpAccountSnapshot {
            account_value: state.margin_summary.account_value,
            total_notional: state.margin_summary.total_ntl_pos,
            total_margin_used: state.margin_summary.total_margin_used,
            withdrawable: state.withdrawable,
            positions,
        })
    }

    #[instrument(skip(self))]
    async fn update_leverage(&self, coin: &str, leverage: u32, is_cross: bool) -> VenueResult<()> {
        let action = json!({
            "type": "updateLeverage",
            "coin": coin,
            "isCross": is_cross,
            "leverage": leverage,
        });
        self.post_action(action).await?;
        info!(coin, leverage, is_cross, "perp leverage updated");
        Ok(())
    }

    #[instrument(skip(self, order), fields(coin = %order.coin, is_buy = order.is_buy, sz = %order.size))]
    async fn submit_order(&self, order: &PerpOrder) -> VenueResult<PerpFill> {
        let tif = if order.ioc { "Ioc" } else { "Gtc" };
        let action = json!({
            "type": "order",
            "orders": [{
                "coin": order.coin,
                "isBuy": order.is_buy,
                "sz": order.size.to_string(),
                "limitPx": order.limit_price.to_string(),
                "orderType": {"limit": {"tif": tif}},
                "reduceOnly": order.reduce_only,
            }],
            "grouping": "na",
        });

        let response = self.post_action(action).await?;
        let statuses = response
            .response
            .and_then(|r| r.data)
            .map(|d| d.statuses)
            .unwrap_or_default();

        match statuses.into_iter().next() {
            Some(super::types::OrderStatus::Filled(fill)) => {
                debug!(sz = %fill.total_sz, px = %fill.avg_px, "order filled");
                Ok(PerpFill {
                    filled_size: fill.total_sz,
                    avg_price: fill.avg_px,
                })
            }
            Some(super::types::OrderStatus::Resting(resting)) => {
                // IOC orders never rest; a resting response means the venue
                // ignored the tif. Treat as no fill.
                warn!(oid = resting.oid, "order rested unexpectedly");
                Ok(PerpFill::empty())
            }
            Some(super::types::OrderStatus::Error(msg)) => {
                if msg.contains("could not immediately match") {
                    Ok(PerpFill::empty())
                } else {
                    Err(VenueError::Rejected(msg))
                }
            }
            None => Err(VenueError::Network("order response missing status".into())),
        }
    }

    #[instrument(skip(self))]
    async fn spot_to_perp_transfer(&self, amount_usd: Decimal) -> VenueResult<String> {
        let action = json!({
            "type": "usdClassTransfer",
            "amount": amount_usd.to_string(),
            "toPerp": true,
        });
        self.post_action(action).await?;
        info!(amount = %amount_usd, "transferred collateral to perp clearinghouse");
        Ok(format!("transfer-{}", Utc::now().timestamp_millis()))
    }

    async fn health_check(&self) -> bool {
        self.client.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::venues::chain::MockKeyService;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn mock_key() -> Arc<dyn KeyService> {
        let mut key = MockKeyService::new();
        key.expect_sign_typed_data()
            .returning(|_, _| Ok("0xsig".to_string()));
        Arc::new(key)
    }

    async fn trader_for(server: &MockServer) -> HyperliquidTrader {
        let client = Arc::new(HyperliquidClient::with_base_url(&server.uri()).unwrap());
        HyperliquidTrader::new(client, mock_key(), "0xwallet").unwrap()
    }

    #[tokio::test]
    async fn test_submit_order_filled() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/exchange"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "ok",
                "response": {"data": {"statuses": [
                    {"filled": {"totalSz": "49.95", "avgPx": "149.9", "oid": 1}}
                ]}}
            })))
            .mount(&server)
            .await;

        let trader = trader_for(&server).await;
        let fill = trader
            .submit_order(&PerpOrder {
                coin: "SOL".into(),
                is_buy: false,
                size: dec!(50),
                limit_price: dec!(147),
                ioc: true,
                reduce_only: false,
            })
            .await
            .unwrap();

        assert_eq!(fill.filled_size, dec!(49.95));
        assert_eq!(fill.avg_price, dec!(149.9));
    }

    #[tokio::test]
    async fn test_unmatched_ioc_is_empty_fill() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/exchange"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "ok",
                "response": {"data": {"statuses": [
                    {"error": "Order could not immediately match against any resting orders."}
                ]}}
            })))
            .mount(&server)
            .await;

        let trader = trader_for(&server).await;
        let fill = trader
            .submit_order(&PerpOrder {
                coin: "SOL".into(),
                is_buy: false,
                size: dec!(50),
                limit_price: dec!(147),
                ioc: true,
                reduce_only: false,
            })
            .await
            .unwrap();

        assert_eq!(fill.filled_size, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_rejected_action_surfaces() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/exchange"))
            .and(body_partial_json(serde_json::json!({
                "action": {"type": "updateLeverage"}
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"status": "err:Invalid leverage"})),
            )
            .mount(&server)
            .await;

        let trader = trader_for(&server).await;
        let err = trader.update_leverage("SOL", 50, true).await.unwrap_err();
        assert!(matches!(err, VenueError::Rejected(_)));
    }
}
