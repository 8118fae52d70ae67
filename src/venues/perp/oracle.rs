//! Funding rate oracle: current rates, next-period prediction, and
//! volatility over a lookback window.
//!
//! Prediction follows the venue's own formula:
//! `rate = premium + clamp(interest, -0.0001, 0.0001)` where
//! `premium = (mark - oracle) / oracle`.

use chrono::Utc;
use rust_decimal::{Decimal, MathematicalOps};
use rust_decimal_macros::dec;
use std::sync::Arc;
use tracing::{debug, instrument};

use super::client::HyperliquidClient;
use super::types::FundingHistoryRecord;
use crate::model::FundingRate;
use crate::utils::decimal::clamp;
use crate::venues::error::{VenueError, VenueResult};

/// Clamp bound on the interest component.
const INTEREST_CLAMP: Decimal = dec!(0.0001);
/// The venue's fixed hourly interest component (0.01% per 8h equivalent).
const INTEREST_RATE_8H: Decimal = dec!(0.0001);
/// Hours of funding settlement per 8h book period.
const FUNDING_PERIOD_HOURS: Decimal = dec!(8);

/// Prediction for the next funding period.
#[derive(Debug, Clone)]
pub struct FundingPrediction {
    pub coin: String,
    /// Predicted rate per 8h period.
    pub predicted_rate_8h: Decimal,
    pub premium: Decimal,
    pub interest: Decimal,
}

/// Funding data provider over the info client.
pub struct FundingOracle {
    client: Arc<HyperliquidClient>,
}

impl FundingOracle {
    pub fn new(client: Arc<HyperliquidClient>) -> Self {
        Self { client }
    }

    /// Current funding for a coin, normalized to an 8h rate.
    #[instrument(skip(self))]
    pub async fn current_funding(&self, coin: &str) -> VenueResult<FundingRate> {
        let asset = self.client.get_asset(coin).await?;
        Ok(FundingRate::new(
            coin,
            asset.funding_rate * FUNDING_PERIOD_HOURS,
            Utc::now(),
        ))
    }

    /// Predict the next funding rate from the current premium plus the
    /// clamped interest component.
    #[instrument(skip(self))]
    pub async fn predict_next_funding(&self, coin: &str) -> VenueResult<FundingPrediction> {
        let asset = self.client.get_asset(coin).await?;
        if asset.oracle_price == Decimal::ZERO {
            return Err(VenueError::Network(format!("no oracle price for {}", coin)));
        }

        let premium = (asset.mark_price - asset.oracle_price) / asset.oracle_price;
        let interest = clamp(INTEREST_RATE_8H, -INTEREST_CLAMP, INTEREST_CLAMP);
        let predicted = premium + interest;

        debug!(
            coin,
            premium = %premium,
            predicted = %predicted,
            "predicted next funding"
        );

        Ok(FundingPrediction {
            coin: coin.to_string(),
            predicted_rate_8h: predicted,
            premium,
            interest,
        })
    }

    /// Funding volatility over the lookback window, as a coefficient of
    /// variation. Returns the maximum representable volatility when there is
    /// not enough history to judge.
    #[instrument(skip(self))]
    pub async fn funding_volatility(&self, coin: &str, lookback_hours: u32) -> VenueResult<Decimal> {
        let start = Utc::now().timestamp_millis() - i64::from(lookback_hours) * 3_600_000;
        let records = self.client.funding_history(coin, start, None).await?;
        Ok(coefficient_of_variation(&records))
    }
}

/// CV = stddev(rates) / mean(|rates|). A flat history returns zero; an empty
/// one returns one (maximally uncertain).
pub fn coefficient_of_variation(records: &[FundingHistoryRecord]) -> Decimal {
    if records.len() < 2 {
        return Decimal::ONE;
    }

    let n = Decimal::from(records.len());
    let mean_abs = records
        .iter()
        .map(|r| r.funding_rate.abs())
        .sum::<Decimal>()
        / n;
    if mean_abs == Decimal::ZERO {
        return Decimal::ZERO;
    }

    let mean = records.iter().map(|r| r.funding_rate).sum::<Decimal>() / n;
    let variance = records
        .iter()
        .map(|r| {
            let d = r.funding_rate - mean;
            d * d
        })
        .sum::<Decimal>()
        / n;
    let std_dev = variance.sqrt().unwrap_or(Decimal::ZERO);

    std_dev / mean_abs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(rate: Decimal) -> FundingHistoryRecord {
        FundingHistoryRecord {
            coin: "SOL".into(),
            funding_rate: rate,
            premium: Decimal::ZERO,
            time: 0,
        }
    }

    #[test]
    fn test_cv_flat_history_is_zero() {
        let records = vec![record(dec!(-0.0001)); 10];
        assert_eq!(coefficient_of_variation(&records), Decimal::ZERO);
    }

    #[test]
    fn test_cv_empty_history_is_max() {
        assert_eq!(coefficient_of_variation(&[]), Decimal::ONE);
        assert_eq!(coefficient_of_variation(&[record(dec!(-0.0001))]), Decimal::ONE);
    }

    #[test]
    fn test_cv_spread_history() {
        // Alternating -0.0002 / 0: mean |r| = 0.0001, stddev = 0.0001, CV = 1.
        let records: Vec<_> = (0..10)
            .map(|i| record(if i % 2 == 0 { dec!(-0.0002) } else { Decimal::ZERO }))
            .collect();
        let cv = coefficient_of_variation(&records);
        assert!(cv > dec!(0.99) && cv < dec!(1.01), "cv = {}", cv);
    }

    #[test]
    fn test_cv_mild_variation_under_threshold() {
        // Rates tightly clustered around -0.0001: CV well under 0.5.
        let rates = [
            dec!(-0.00010),
            dec!(-0.00011),
            dec!(-0.00009),
            dec!(-0.00010),
            dec!(-0.00012),
            dec!(-0.00008),
        ];
        let records: Vec<_> = rates.into_iter().map(record).collect();
        let cv = coefficient_of_variation(&records);
        assert!(cv < dec!(0.5), "cv = {}", cv);
    }
}
