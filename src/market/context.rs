use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use super::{Candle, CandleSeries};
use crate::engine::types::{MarketContext, MarketPhase, TrendDirection};

/// Escalating candle-match tolerances for gapped data, capped for sub-hour
/// timeframes at twice the interval so a 1m analysis never matches a candle
/// hours away.
const TOLERANCE_STEPS_MINUTES: [i64; 5] = [1, 5, 15, 30, 120];

const TREND_SHORT_WINDOW: usize = 10;
const TREND_LONG_WINDOW: usize = 30;
const ATR_PERIOD: usize = 14;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("no candle within tolerance of {target} (nearest gap {gap_minutes}min)")]
    NoMatchingCandle {
        target: DateTime<Utc>,
        gap_minutes: i64,
    },
    #[error("insufficient history at {target}: {available} candles, {required} required")]
    InsufficientHistory {
        target: DateTime<Utc>,
        available: usize,
        required: usize,
    },
}

/// Market-context capability: the single authority for "current price" at a
/// target timestamp.
pub trait MarketContextAnalyzer: Send + Sync {
    /// With `is_realtime = false` the price MUST be the open of the candle
    /// whose half-open interval contains `target`, the first price a trader
    /// could have acted on. With `is_realtime = true` it is the close of the
    /// latest candle. No other mode exists.
    fn analyze(
        &self,
        series: &CandleSeries,
        target: DateTime<Utc>,
        is_realtime: bool,
    ) -> Result<MarketContext, ContextError>;
}

/// Default analyzer: open-of-containing-candle price selection with
/// escalating gap tolerance, SMA-crossover trend, ATR volatility.
#[derive(Debug, Default)]
pub struct DefaultContextAnalyzer;

impl DefaultContextAnalyzer {
    fn match_candle<'a>(
        &self,
        series: &'a CandleSeries,
        target: DateTime<Utc>,
    ) -> Result<&'a Candle, ContextError> {
        if let Some(c) = series.containing(target) {
            return Ok(c);
        }

        let interval = series.timeframe().interval_minutes();
        let cap = if interval < 60 { 2 * interval } else { i64::MAX };
        let (nearest, gap) = series
            .nearest(target)
            .ok_or(ContextError::NoMatchingCandle {
                target,
                gap_minutes: i64::MAX,
            })?;

        for tolerance in TOLERANCE_STEPS_MINUTES {
            let tolerance = tolerance.min(cap);
            if gap <= Duration::minutes(tolerance) {
                warn!(
                    target = %target,
                    matched = %nearest.timestamp,
                    gap_minutes = gap.num_minutes(),
                    "gapped data: using nearest candle"
                );
                return Ok(nearest);
            }
        }

        Err(ContextError::NoMatchingCandle {
            target,
            gap_minutes: gap.num_minutes(),
        })
    }
}

impl MarketContextAnalyzer for DefaultContextAnalyzer {
    fn analyze(
        &self,
        series: &CandleSeries,
        target: DateTime<Utc>,
        is_realtime: bool,
    ) -> Result<MarketContext, ContextError> {
        let (anchor, current_price) = if is_realtime {
            let last = series.last();
            (last.timestamp, last.close)
        } else {
            let candle = self.match_candle(series, target)?;
            (candle.timestamp, candle.open)
        };

        // Only candles at or before the anchor may shape the context.
        let visible = series.up_to(anchor);
        if visible.len() < TREND_LONG_WINDOW {
            return Err(ContextError::InsufficientHistory {
                target,
                available: visible.len(),
                required: TREND_LONG_WINDOW,
            });
        }

        let closes: Vec<f64> = visible.iter().map(|c| c.close).collect();
        let short_ma = mean(&closes[closes.len() - TREND_SHORT_WINDOW..]);
        let long_ma = mean(&closes[closes.len() - TREND_LONG_WINDOW..]);
        let trend = if short_ma > long_ma * 1.002 {
            TrendDirection::Bullish
        } else if short_ma < long_ma * 0.998 {
            TrendDirection::Bearish
        } else {
            TrendDirection::Sideways
        };

        let volatility = atr_volatility(visible, current_price);
        let phase = classify_phase(visible, current_price, trend);

        debug!(%target, current_price, ?trend, volatility, "market context");
        Ok(MarketContext {
            current_price,
            trend,
            volatility,
            phase,
            timestamp: anchor,
        })
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// ATR over the trailing period, relative to the current price.
fn atr_volatility(visible: &[Candle], current_price: f64) -> f64 {
    let window = &visible[visible.len().saturating_sub(ATR_PERIOD)..];
    let closes: Vec<f64> = window.iter().map(|c| c.close).collect();
    let highs: Vec<f64> = window.iter().map(|c| c.high).collect();
    let lows: Vec<f64> = window.iter().map(|c| c.low).collect();
    let atr = rust_ti::other_indicators::single::average_true_range(
        &closes,
        &highs,
        &lows,
        rust_ti::ConstantModelType::SimpleMovingAverage,
    );
    if current_price > 0.0 {
        atr / current_price
    } else {
        0.0
    }
}

/// Wyckoff-style phase from the price's position in the recent range.
fn classify_phase(visible: &[Candle], current_price: f64, trend: TrendDirection) -> MarketPhase {
    let window = &visible[visible.len().saturating_sub(TREND_LONG_WINDOW)..];
    let range_high = window.iter().map(|c| c.high).fold(f64::MIN, f64::max);
    let range_low = window.iter().map(|c| c.low).fold(f64::MAX, f64::min);
    let span = (range_high - range_low).max(f64::EPSILON);
    let position = (current_price - range_low) / span;

    match trend {
        TrendDirection::Bullish => MarketPhase::Markup,
        TrendDirection::Bearish => MarketPhase::Markdown,
        TrendDirection::Sideways => {
            if position < 0.5 {
                MarketPhase::Accumulation
            } else {
                MarketPhase::Distribution
            }
        }
    }
}
