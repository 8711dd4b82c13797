use super::{MlPredictor, ProviderError};
use crate::engine::types::MlPrediction;
use crate::market::Candle;

const MIN_CANDLES: usize = 30;

/// Momentum-derived predictor used when no trained model is plugged in.
///
/// Maps the trailing RSI into bounce/breakout probabilities: oversold
/// readings favor a bounce from support, strong momentum favors a breakout.
/// Confidence scales with how far the reading sits from the neutral band.
#[derive(Debug, Clone, Default)]
pub struct DefaultMlPredictor;

impl MlPredictor for DefaultMlPredictor {
    fn predict(&self, window: &[Candle]) -> Result<MlPrediction, ProviderError> {
        if window.len() < MIN_CANDLES {
            return Err(ProviderError::InsufficientData {
                required: MIN_CANDLES,
                available: window.len(),
            });
        }

        let closes: Vec<f64> = window.iter().map(|c| c.close).collect();
        let rsi_series = rust_ti::standard_indicators::bulk::rsi(&closes);
        let rsi = rsi_series.last().copied().unwrap_or(50.0);

        let breakout_prob = ((rsi - 50.0) / 50.0).clamp(0.0, 1.0);
        let bounce_prob = ((50.0 - rsi) / 50.0).clamp(0.0, 1.0).max(0.2);
        let confidence = ((rsi - 50.0).abs() / 50.0).clamp(0.1, 1.0);

        Ok(MlPrediction {
            breakout_prob,
            bounce_prob,
            confidence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn window(prices: impl Iterator<Item = f64>) -> Vec<Candle> {
        prices
            .enumerate()
            .map(|(i, p)| Candle {
                timestamp: Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()
                    + Duration::hours(i as i64),
                open: p,
                high: p + 0.5,
                low: p - 0.5,
                close: p,
                volume: 10.0,
            })
            .collect()
    }

    #[test]
    fn insufficient_data_is_reported() {
        let predictor = DefaultMlPredictor;
        let w = window((0..10).map(|i| 100.0 + f64::from(i)));
        assert!(matches!(
            predictor.predict(&w),
            Err(ProviderError::InsufficientData { .. })
        ));
    }

    #[test]
    fn probabilities_stay_in_unit_range() {
        let predictor = DefaultMlPredictor;
        let w = window((0..60).map(|i| 100.0 + f64::from(i % 7)));
        let p = predictor.predict(&w).unwrap();
        assert!((0.0..=1.0).contains(&p.breakout_prob));
        assert!((0.0..=1.0).contains(&p.bounce_prob));
        assert!((0.0..=1.0).contains(&p.confidence));
    }

    #[test]
    fn rising_prices_favor_breakout() {
        let predictor = DefaultMlPredictor;
        let w = window((0..60).map(|i| 100.0 + f64::from(i) * 2.0));
        let p = predictor.predict(&w).unwrap();
        assert!(p.breakout_prob > p.bounce_prob);
    }
}
