use super::{BtcCorrelationProvider, ProviderError};
use crate::engine::types::BtcCorrelation;
use crate::market::Candle;

const MIN_CANDLES: usize = 30;
const DOWNSIDE_WINDOW: usize = 5;

/// Correlation-risk estimator used when no cross-market feed is plugged in.
///
/// Assumes a fixed correlation strength to the majors and derives the
/// expected downside from the symbol's own worst trailing multi-candle drop,
/// which is what the constraint actually guards against.
#[derive(Debug, Clone)]
pub struct DefaultCorrelationProvider {
    pub strength: f64,
}

impl Default for DefaultCorrelationProvider {
    fn default() -> Self {
        Self { strength: 0.6 }
    }
}

impl BtcCorrelationProvider for DefaultCorrelationProvider {
    fn correlation(&self, window: &[Candle]) -> Result<BtcCorrelation, ProviderError> {
        if window.len() < MIN_CANDLES {
            return Err(ProviderError::InsufficientData {
                required: MIN_CANDLES,
                available: window.len(),
            });
        }

        let mut worst_drop = 0.0f64;
        for slice in window.windows(DOWNSIDE_WINDOW) {
            let start = slice[0].open;
            let low = slice.iter().map(|c| c.low).fold(f64::MAX, f64::min);
            if start > 0.0 {
                worst_drop = worst_drop.max((start - low) / start);
            }
        }

        Ok(BtcCorrelation {
            strength: self.strength,
            expected_downside: worst_drop,
        })
    }
}
