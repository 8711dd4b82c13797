pub mod correlation;
pub mod ml;
pub mod support_resistance;

use thiserror::Error;

use crate::engine::types::{BtcCorrelation, MlPrediction, PriceLevel};
use crate::market::Candle;

pub use correlation::DefaultCorrelationProvider;
pub use ml::DefaultMlPredictor;
pub use support_resistance::SwingPointDetector;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("insufficient data: {available} candles, {required} required")]
    InsufficientData { required: usize, available: usize },
}

/// Support/resistance detection capability.
///
/// Must be pure with respect to (window, current_price); returning empty
/// lists is valid and surfaces as an early exit upstream.
pub trait SupportResistanceProvider: Send + Sync {
    fn detect_levels(
        &self,
        window: &[Candle],
        current_price: f64,
    ) -> Result<(Vec<PriceLevel>, Vec<PriceLevel>), ProviderError>;
}

/// ML prediction capability; all probabilities in [0, 1].
pub trait MlPredictor: Send + Sync {
    fn predict(&self, window: &[Candle]) -> Result<MlPrediction, ProviderError>;
}

/// BTC-correlation risk capability.
pub trait BtcCorrelationProvider: Send + Sync {
    fn correlation(&self, window: &[Candle]) -> Result<BtcCorrelation, ProviderError>;
}
