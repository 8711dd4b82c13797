pub mod context;
pub mod fetcher;
pub mod frame;

use chrono::{DateTime, Duration, Timelike, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Candle timeframes supported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "3m")]
    M3,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

#[derive(Debug, Error)]
#[error("unknown timeframe '{name}', known: {known:?}")]
pub struct UnknownTimeframe {
    pub name: String,
    pub known: Vec<&'static str>,
}

impl Timeframe {
    pub const ALL: [Timeframe; 8] = [
        Timeframe::M1,
        Timeframe::M3,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M30,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M3 => "3m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }

    pub fn interval_minutes(self) -> i64 {
        match self {
            Timeframe::M1 => 1,
            Timeframe::M3 => 3,
            Timeframe::M5 => 5,
            Timeframe::M15 => 15,
            Timeframe::M30 => 30,
            Timeframe::H1 => 60,
            Timeframe::H4 => 240,
            Timeframe::D1 => 1440,
        }
    }

    pub fn interval(self) -> Duration {
        Duration::minutes(self.interval_minutes())
    }

    /// Minutes after entry at which an unresolved trade exits at breakeven.
    /// 4h and 1d have no table entry and fall back to two intervals.
    pub fn fallback_exit_minutes(self) -> i64 {
        match self {
            Timeframe::M1 => 15,
            Timeframe::M3 => 30,
            Timeframe::M5 => 45,
            Timeframe::M15 => 60,
            Timeframe::M30 => 90,
            Timeframe::H1 => 120,
            Timeframe::H4 | Timeframe::D1 => 2 * self.interval_minutes(),
        }
    }

    /// Floor `ts` to the start of the candle whose half-open interval
    /// [start, start + interval) contains it.
    pub fn candle_start(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let interval_secs = self.interval_minutes() * 60;
        let secs = ts.timestamp();
        DateTime::from_timestamp(secs - secs.rem_euclid(interval_secs), 0)
            .expect("floored timestamp in range")
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = UnknownTimeframe;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Timeframe::ALL
            .into_iter()
            .find(|tf| tf.as_str() == s)
            .ok_or_else(|| UnknownTimeframe {
                name: s.to_string(),
                known: Timeframe::ALL.iter().map(|tf| tf.as_str()).collect(),
            })
    }
}

/// One OHLCV bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// OHLC ordering and positivity: low <= open <= high, low <= close <= high.
    pub fn is_well_formed(&self) -> bool {
        self.low > 0.0
            && self.low <= self.open
            && self.open <= self.high
            && self.low <= self.close
            && self.close <= self.high
    }
}

#[derive(Debug, Error)]
pub enum SeriesError {
    #[error("empty candle series for {symbol} {timeframe}")]
    Empty { symbol: String, timeframe: Timeframe },
    #[error("malformed candle at index {index} ({timestamp}): OHLC ordering violated")]
    MalformedCandle {
        index: usize,
        timestamp: DateTime<Utc>,
    },
    #[error("non-monotonic timestamps at index {index}: {prev} >= {next}")]
    NonMonotonic {
        index: usize,
        prev: DateTime<Utc>,
        next: DateTime<Utc>,
    },
}

/// A validated, chronologically ordered OHLCV window for one (symbol, timeframe).
///
/// Each analysis owns its series exclusively; windows are never shared across
/// analyses (a shared cache once made every analysis replay the first
/// symbol's prices).
#[derive(Debug, Clone)]
pub struct CandleSeries {
    symbol: String,
    timeframe: Timeframe,
    candles: Vec<Candle>,
    by_start: FxHashMap<i64, usize>,
}

impl CandleSeries {
    pub fn new(
        symbol: impl Into<String>,
        timeframe: Timeframe,
        candles: Vec<Candle>,
    ) -> Result<Self, SeriesError> {
        let symbol = symbol.into();
        if candles.is_empty() {
            return Err(SeriesError::Empty { symbol, timeframe });
        }
        for (i, c) in candles.iter().enumerate() {
            if !c.is_well_formed() {
                return Err(SeriesError::MalformedCandle {
                    index: i,
                    timestamp: c.timestamp,
                });
            }
            if i > 0 && candles[i - 1].timestamp >= c.timestamp {
                return Err(SeriesError::NonMonotonic {
                    index: i,
                    prev: candles[i - 1].timestamp,
                    next: c.timestamp,
                });
            }
        }
        let by_start = candles
            .iter()
            .enumerate()
            .map(|(i, c)| (c.timestamp.timestamp(), i))
            .collect();
        Ok(Self {
            symbol,
            timeframe,
            candles,
            by_start,
        })
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn first(&self) -> &Candle {
        &self.candles[0]
    }

    pub fn last(&self) -> &Candle {
        &self.candles[self.candles.len() - 1]
    }

    /// Exact lookup of the candle whose interval contains `ts`.
    pub fn containing(&self, ts: DateTime<Utc>) -> Option<&Candle> {
        let start = self.timeframe.candle_start(ts);
        self.by_start
            .get(&start.timestamp())
            .map(|&i| &self.candles[i])
    }

    /// Nearest candle to the interval start of `ts`, with its absolute
    /// distance. Used by flexible matching over gapped data.
    pub fn nearest(&self, ts: DateTime<Utc>) -> Option<(&Candle, Duration)> {
        let target = self.timeframe.candle_start(ts);
        let idx = self
            .candles
            .partition_point(|c| c.timestamp < target)
            .min(self.candles.len() - 1);
        let mut best = &self.candles[idx];
        if idx > 0 {
            let prev = &self.candles[idx - 1];
            if (target - prev.timestamp).abs() < (target - best.timestamp).abs() {
                best = prev;
            }
        }
        Some((best, (target - best.timestamp).abs()))
    }

    /// Candles strictly after `ts`, in chronological order, restricted to
    /// those at or before the given window end.
    pub fn after(
        &self,
        ts: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> impl Iterator<Item = &Candle> {
        let start = self.candles.partition_point(|c| c.timestamp <= ts);
        self.candles[start..]
            .iter()
            .take_while(move |c| c.timestamp <= window_end)
    }

    /// Candles at or before `ts`: the only view the decision pipeline may
    /// see at evaluation time `ts`.
    pub fn up_to(&self, ts: DateTime<Utc>) -> &[Candle] {
        let end = self.candles.partition_point(|c| c.timestamp <= ts);
        &self.candles[..end]
    }
}

/// First timestamp >= `start` aligned to `evaluation_interval_minutes`
/// boundaries. Hour-multiple intervals snap to the hour; sub-hour intervals
/// snap to minute boundaries. Avoids probing timestamps where a freshly
/// listed symbol has no candle yet.
pub fn align_evaluation_start(start: DateTime<Utc>, evaluation_interval_minutes: i64) -> DateTime<Utc> {
    let truncated = start
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .expect("truncation keeps timestamp in range");
    let interval = evaluation_interval_minutes.max(1);
    if interval >= 60 {
        let hours = interval / 60;
        let day_start = truncated
            .with_hour(0)
            .and_then(|t| t.with_minute(0))
            .expect("midnight in range");
        let elapsed_h = i64::from(truncated.hour())
            + i64::from(truncated.minute() > 0 || start > truncated);
        let aligned_h = (elapsed_h + hours - 1) / hours * hours;
        day_start + Duration::hours(aligned_h)
    } else {
        let day_start = truncated
            .with_hour(0)
            .and_then(|t| t.with_minute(0))
            .expect("midnight in range");
        let elapsed_m =
            i64::from(truncated.hour()) * 60 + i64::from(truncated.minute()) + i64::from(start > truncated);
        let aligned_m = (elapsed_m + interval - 1) / interval * interval;
        day_start + Duration::minutes(aligned_m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, 0).unwrap()
    }

    fn candle(t: DateTime<Utc>, open: f64) -> Candle {
        Candle {
            timestamp: t,
            open,
            high: open * 1.01,
            low: open * 0.99,
            close: open * 1.005,
            volume: 1000.0,
        }
    }

    #[test]
    fn timeframe_round_trips_all_tags() {
        for tf in Timeframe::ALL {
            assert_eq!(tf.as_str().parse::<Timeframe>().unwrap(), tf);
        }
    }

    #[test]
    fn unknown_timeframe_lists_known() {
        let err = "2h".parse::<Timeframe>().unwrap_err();
        assert_eq!(err.name, "2h");
        assert!(err.known.contains(&"1h"));
        assert_eq!(err.known.len(), 8);
    }

    #[test]
    fn candle_start_floors_to_interval() {
        let t = ts(14, 37);
        assert_eq!(Timeframe::H1.candle_start(t), ts(14, 0));
        assert_eq!(Timeframe::M15.candle_start(t), ts(14, 30));
        assert_eq!(Timeframe::M1.candle_start(t), ts(14, 37));
    }

    #[test]
    fn series_rejects_malformed_candle() {
        let mut c = candle(ts(0, 0), 100.0);
        c.low = 200.0;
        let err = CandleSeries::new("BTC", Timeframe::H1, vec![c]).unwrap_err();
        assert!(matches!(err, SeriesError::MalformedCandle { index: 0, .. }));
    }

    #[test]
    fn series_rejects_non_monotonic() {
        let candles = vec![candle(ts(2, 0), 100.0), candle(ts(1, 0), 101.0)];
        let err = CandleSeries::new("BTC", Timeframe::H1, candles).unwrap_err();
        assert!(matches!(err, SeriesError::NonMonotonic { index: 1, .. }));
    }

    #[test]
    fn containing_finds_exact_candle() {
        let candles = (0..5).map(|i| candle(ts(i, 0), 100.0 + f64::from(i))).collect();
        let series = CandleSeries::new("BTC", Timeframe::H1, candles).unwrap();
        let c = series.containing(ts(2, 45)).unwrap();
        assert_eq!(c.timestamp, ts(2, 0));
    }

    #[test]
    fn nearest_reports_distance_over_gap() {
        // Gap: candles at 00:00 and 04:00 only.
        let candles = vec![candle(ts(0, 0), 100.0), candle(ts(4, 0), 101.0)];
        let series = CandleSeries::new("BTC", Timeframe::H1, candles).unwrap();
        let (c, dist) = series.nearest(ts(1, 0)).unwrap();
        assert_eq!(c.timestamp, ts(0, 0));
        assert_eq!(dist, Duration::hours(1));
    }

    #[test]
    fn after_is_strict_and_bounded() {
        let candles: Vec<_> = (0..6).map(|i| candle(ts(i, 0), 100.0)).collect();
        let series = CandleSeries::new("BTC", Timeframe::H1, candles).unwrap();
        let got: Vec<_> = series.after(ts(1, 0), ts(4, 0)).map(|c| c.timestamp).collect();
        assert_eq!(got, vec![ts(2, 0), ts(3, 0), ts(4, 0)]);
    }

    #[test]
    fn up_to_never_exposes_future_candles() {
        let candles: Vec<_> = (0..6).map(|i| candle(ts(i, 0), 100.0)).collect();
        let series = CandleSeries::new("BTC", Timeframe::H1, candles).unwrap();
        let visible = series.up_to(ts(3, 30));
        assert_eq!(visible.len(), 4);
        assert!(visible.iter().all(|c| c.timestamp <= ts(3, 30)));
    }

    #[test]
    fn align_hourly_snaps_to_hour() {
        assert_eq!(align_evaluation_start(ts(6, 30), 60), ts(7, 0));
        assert_eq!(align_evaluation_start(ts(6, 0), 60), ts(6, 0));
        assert_eq!(align_evaluation_start(ts(6, 30), 240), ts(8, 0));
    }

    #[test]
    fn align_sub_hour_snaps_to_minute_boundary() {
        assert_eq!(align_evaluation_start(ts(6, 7), 15), ts(6, 15));
        assert_eq!(align_evaluation_start(ts(6, 15), 15), ts(6, 15));
        assert_eq!(align_evaluation_start(ts(6, 59), 5), ts(7, 0));
    }

    #[test]
    fn fallback_minutes_match_table() {
        assert_eq!(Timeframe::M1.fallback_exit_minutes(), 15);
        assert_eq!(Timeframe::M30.fallback_exit_minutes(), 90);
        assert_eq!(Timeframe::H1.fallback_exit_minutes(), 120);
        assert_eq!(Timeframe::H4.fallback_exit_minutes(), 480);
    }
}
