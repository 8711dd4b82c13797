use chrono::{DateTime, Duration, Utc};

use super::types::Outcome;
use crate::market::CandleSeries;

/// Resolved exit for a long position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitResolution {
    pub exit_time: DateTime<Utc>,
    pub exit_price: f64,
    pub outcome: Outcome,
}

/// Scan candles strictly after `entry_time` for the first TP or SL touch.
///
/// The horizon is the timeframe's fallback window; an unresolved trade exits
/// at breakeven when it closes. Within one candle a simultaneous touch of
/// both levels resolves to the stop: the candle carries no intra-bar order,
/// so the conservative reading wins. Only observed OHLC values are used;
/// the resolver never synthesizes a price.
pub fn resolve_exit(
    series: &CandleSeries,
    entry_time: DateTime<Utc>,
    entry_price: f64,
    take_profit_price: f64,
    stop_loss_price: f64,
) -> ExitResolution {
    let horizon_minutes = series.timeframe().fallback_exit_minutes();
    let horizon_end = entry_time + Duration::minutes(horizon_minutes);

    for candle in series.after(entry_time, horizon_end) {
        if candle.low <= stop_loss_price {
            return ExitResolution {
                exit_time: candle.timestamp,
                exit_price: stop_loss_price,
                outcome: Outcome::Loss,
            };
        }
        if candle.high >= take_profit_price {
            return ExitResolution {
                exit_time: candle.timestamp,
                exit_price: take_profit_price,
                outcome: Outcome::Profit,
            };
        }
    }

    ExitResolution {
        exit_time: horizon_end,
        exit_price: entry_price,
        outcome: Outcome::Breakeven,
    }
}
