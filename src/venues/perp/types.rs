//! Type definitions for the Hyperliquid API.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Request type for the info endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum InfoRequest {
    /// Get metadata and asset contexts (funding rates, prices, OI).
    #[serde(rename = "metaAndAssetCtxs")]
    MetaAndAssetCtxs,

    /// Get all mid prices.
    #[serde(rename = "allMids")]
    AllMids,

    /// Get account state (margin summary + open positions).
    #[serde(rename = "clearinghouseState")]
    ClearinghouseState { user: String },

    /// Get funding rate history.
    #[serde(rename = "fundingHistory")]
    FundingHistory {
        coin: String,
        #[serde(rename = "startTime")]
        start_time: i64,
        #[serde(rename = "endTime", skip_serializing_if = "Option::is_none")]
        end_time: Option<i64>,
    },
}

/// Response from metaAndAssetCtxs: a tuple of (Meta, Vec<AssetCtx>).
pub type MetaAndAssetCtxsResponse = (Meta, Vec<AssetCtx>);

/// Universe metadata for perpetuals.
#[derive(Debug, Clone, Deserialize)]
pub struct Meta {
    pub universe: Vec<AssetMeta>,
}

/// Metadata for a single asset in the universe.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetMeta {
    /// Asset name (e.g. "SOL").
    pub name: String,
    /// Size decimal precision.
    pub sz_decimals: u8,
    /// Maximum allowed leverage.
    pub max_leverage: u8,
    /// Whether only isolated margin is allowed.
    #[serde(default)]
    pub only_isolated: bool,
}

/// Real-time context for an asset (prices, funding, volume).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetCtx {
    /// Current funding rate (hourly, as decimal string).
    #[serde(deserialize_with = "deserialize_decimal_str")]
    pub funding: Decimal,
    #[serde(deserialize_with = "deserialize_decimal_str")]
    pub open_interest: Decimal,
    #[serde(deserialize_with = "deserialize_decimal_str")]
    pub prev_day_px: Decimal,
    #[serde(deserialize_with = "deserialize_decimal_str")]
    pub day_ntl_vlm: Decimal,
    /// Premium over oracle price (can be null for inactive coins).
    #[serde(default, deserialize_with = "deserialize_decimal_str_option_null")]
    pub premium: Option<Decimal>,
    #[serde(deserialize_with = "deserialize_decimal_str")]
    pub oracle_px: Decimal,
    #[serde(deserialize_with = "deserialize_decimal_str")]
    pub mark_px: Decimal,
    /// Mid price (null for inactive coins).
    #[serde(default, deserialize_with = "deserialize_decimal_str_option_null")]
    pub mid_px: Option<Decimal>,
}

/// Historical funding rate record.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FundingHistoryRecord {
    pub coin: String,
    #[serde(deserialize_with = "deserialize_decimal_str")]
    pub funding_rate: Decimal,
    #[serde(deserialize_with = "deserialize_decimal_str")]
    pub premium: Decimal,
    /// Timestamp in milliseconds.
    pub time: i64,
}

/// Margin summary inside a clearinghouse state.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarginSummary {
    #[serde(deserialize_with = "deserialize_decimal_str")]
    pub account_value: Decimal,
    #[serde(deserialize_with = "deserialize_decimal_str")]
    pub total_ntl_pos: Decimal,
    #[serde(deserialize_with = "deserialize_decimal_str")]
    pub total_margin_used: Decimal,
}

/// Account state returned by clearinghouseState.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearinghouseState {
    pub margin_summary: MarginSummary,
    #[serde(deserialize_with = "deserialize_decimal_str")]
    pub withdrawable: Decimal,
    #[serde(default)]
    pub asset_positions: Vec<AssetPosition>,
}

/// Wrapper around one open perp position.
#[derive(Debug, Clone, Deserialize)]
pub struct AssetPosition {
    pub position: PerpPositionData,
}

/// Leverage descriptor on a position.
#[derive(Debug, Clone, Deserialize)]
pub struct PositionLeverage {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: u32,
}

/// Cumulative funding on a position.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CumFunding {
    #[serde(deserialize_with = "deserialize_decimal_str")]
    pub all_time: Decimal,
    #[serde(deserialize_with = "deserialize_decimal_str")]
    pub since_open: Decimal,
}

/// One open perp position.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerpPositionData {
    pub coin: String,
    /// Signed size (negative for shorts).
    #[serde(deserialize_with = "deserialize_decimal_str")]
    pub szi: Decimal,
    #[serde(deserialize_with = "deserialize_decimal_str")]
    pub entry_px: Decimal,
    #[serde(deserialize_with = "deserialize_decimal_str")]
    pub position_value: Decimal,
    #[serde(deserialize_with = "deserialize_decimal_str")]
    pub unrealized_pnl: Decimal,
    #[serde(deserialize_with = "deserialize_decimal_str")]
    pub margin_used: Decimal,
    #[serde(default, deserialize_with = "deserialize_decimal_str_option_null")]
    pub liquidation_px: Option<Decimal>,
    pub leverage: PositionLeverage,
    pub cum_funding: CumFunding,
}

/// Combined asset data with metadata and context.
#[derive(Debug, Clone)]
pub struct PerpAsset {
    pub name: String,
    pub sz_decimals: u8,
    pub max_leverage: u8,
    /// Current hourly funding rate.
    pub funding_rate: Decimal,
    pub open_interest: Decimal,
    pub oracle_price: Decimal,
    pub mark_price: Decimal,
    pub mid_price: Option<Decimal>,
    pub volume_24h: Decimal,
    pub premium: Decimal,
}

/// Response from the exchange endpoint for an order action.
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeResponse {
    pub status: String,
    #[serde(default)]
    pub response: Option<ExchangeResponseBody>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeResponseBody {
    #[serde(default)]
    pub data: Option<OrderResponseData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderResponseData {
    #[serde(default)]
    pub statuses: Vec<OrderStatus>,
}

/// Per-order status inside an exchange response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OrderStatus {
    Filled(FilledStatus),
    Resting(RestingStatus),
    Error(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilledStatus {
    #[serde(deserialize_with = "deserialize_decimal_str")]
    pub total_sz: Decimal,
    #[serde(deserialize_with = "deserialize_decimal_str")]
    pub avg_px: Decimal,
    pub oid: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RestingStatus {
    pub oid: u64,
}

// Custom deserializers for string-encoded decimals.

fn deserialize_decimal_str<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    s.parse::<Decimal>().map_err(serde::de::Error::custom)
}

/// Deserializer that handles both null JSON values and missing fields.
fn deserialize_decimal_str_option_null<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let opt: Option<Option<String>> = Option::deserialize(deserializer)?;
    match opt {
        Some(Some(s)) if !s.is_empty() => s
            .parse::<Decimal>()
            .map(Some)
            .map_err(serde::de::Error::custom),
        _ => Ok(None),
    }
}
