//! Row-level validation for exchange-derived data.
//!
//! Invalid rows are rejected individually; a bad row never fails the batch it
//! arrived in.

use crate::domain::types::Candle;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CandleRejection {
    #[error("OHLC ordering violated for {symbol} {interval} @ {open_time}")]
    OhlcOrdering {
        symbol: String,
        interval: String,
        open_time: i64,
    },

    #[error("open_time {open_time} outside accepted window for {symbol} {interval}")]
    OpenTimeOutOfRange {
        symbol: String,
        interval: String,
        open_time: i64,
    },
}

/// Accepted candle age: two years back, one day of clock skew forward.
const MAX_AGE_DAYS: i64 = 365 * 2;
const MAX_SKEW_HOURS: i64 = 24;

/// Validate one candle row. `low <= open <= high`, `low <= close <= high`,
/// and `open_time` within `[now - 2y, now + 24h]`.
pub fn validate_candle(candle: &Candle, now: DateTime<Utc>) -> Result<(), CandleRejection> {
    let ordered = candle.low <= candle.high
        && candle.low <= candle.open
        && candle.open <= candle.high
        && candle.low <= candle.close
        && candle.close <= candle.high;
    if !ordered {
        return Err(CandleRejection::OhlcOrdering {
            symbol: candle.symbol.clone(),
            interval: candle.interval.clone(),
            open_time: candle.open_time,
        });
    }

    let earliest = (now - Duration::days(MAX_AGE_DAYS)).timestamp_millis();
    let latest = (now + Duration::hours(MAX_SKEW_HOURS)).timestamp_millis();
    if candle.open_time < earliest || candle.open_time > latest {
        return Err(CandleRejection::OpenTimeOutOfRange {
            symbol: candle.symbol.clone(),
            interval: candle.interval.clone(),
            open_time: candle.open_time,
        });
    }

    Ok(())
}

/// Split a fetched batch into valid rows and a rejected count.
pub fn partition_valid(candles: Vec<Candle>, now: DateTime<Utc>) -> (Vec<Candle>, usize) {
    let total = candles.len();
    let valid: Vec<Candle> = candles
        .into_iter()
        .filter(|c| validate_candle(c, now).is_ok())
        .collect();
    let rejected = total - valid.len();
    (valid, rejected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::Market;
    use rust_decimal::Decimal;

    fn candle(open: i64, high: i64, low: i64, close: i64, open_time: i64) -> Candle {
        Candle {
            symbol: "BTCUSDT".to_string(),
            market: Market::Spot,
            interval: "1m".to_string(),
            open_time,
            open: Decimal::from(open),
            high: Decimal::from(high),
            low: Decimal::from(low),
            close: Decimal::from(close),
            volume: Decimal::ONE,
            quote_volume: None,
            trade_count: None,
        }
    }

    #[test]
    fn rejects_inverted_ohlc() {
        let now = Utc::now();
        let bad = candle(100, 90, 95, 92, now.timestamp_millis());
        assert!(matches!(
            validate_candle(&bad, now),
            Err(CandleRejection::OhlcOrdering { .. })
        ));
    }

    #[test]
    fn accepts_flat_candle() {
        let now = Utc::now();
        let flat = candle(100, 100, 100, 100, now.timestamp_millis());
        assert!(validate_candle(&flat, now).is_ok());
    }

    #[test]
    fn rejects_far_future_and_ancient_open_times() {
        let now = Utc::now();
        let future = candle(1, 2, 1, 2, (now + Duration::hours(25)).timestamp_millis());
        assert!(matches!(
            validate_candle(&future, now),
            Err(CandleRejection::OpenTimeOutOfRange { .. })
        ));

        let ancient = candle(1, 2, 1, 2, (now - Duration::days(800)).timestamp_millis());
        assert!(validate_candle(&ancient, now).is_err());

        let skewed = candle(1, 2, 1, 2, (now + Duration::hours(23)).timestamp_millis());
        assert!(validate_candle(&skewed, now).is_ok());
    }

    #[test]
    fn partition_keeps_valid_rows_and_counts_rejects() {
        let now = Utc::now();
        let batch = vec![
            candle(100, 110, 95, 105, now.timestamp_millis()),
            candle(100, 90, 95, 92, now.timestamp_millis()),
            candle(50, 55, 48, 52, now.timestamp_millis()),
        ];
        let (valid, rejected) = partition_valid(batch, now);
        assert_eq!(valid.len(), 2);
        assert_eq!(rejected, 1);
    }
}
