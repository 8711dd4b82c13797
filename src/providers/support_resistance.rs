use ordered_float::OrderedFloat;
use tracing::debug;

use super::{ProviderError, SupportResistanceProvider};
use crate::engine::types::PriceLevel;
use crate::market::Candle;

/// Swing-point support/resistance detector.
///
/// A candle is a swing low (high) when its low (high) is the extreme of the
/// surrounding `pivot_window` candles on both sides. Nearby pivots cluster
/// into one level when within `tolerance_pct` of each other; clusters with
/// fewer than `min_touches` members are discarded.
#[derive(Debug, Clone)]
pub struct SwingPointDetector {
    pub min_candles: usize,
    pub pivot_window: usize,
    pub tolerance_pct: f64,
    pub min_touches: u32,
    /// Attach a bounce-probability estimate from touch-hold history.
    pub estimate_bounce: bool,
}

impl Default for SwingPointDetector {
    fn default() -> Self {
        Self {
            min_candles: 50,
            pivot_window: 3,
            tolerance_pct: 0.01,
            min_touches: 2,
            estimate_bounce: true,
        }
    }
}

#[derive(Debug)]
struct Cluster {
    prices: Vec<f64>,
    touches: u32,
    held: u32,
}

impl Cluster {
    fn center(&self) -> f64 {
        self.prices.iter().sum::<f64>() / self.prices.len() as f64
    }
}

impl SwingPointDetector {
    fn cluster(&self, pivots: &[(f64, bool)]) -> Vec<Cluster> {
        let mut sorted: Vec<&(f64, bool)> = pivots.iter().collect();
        sorted.sort_by_key(|(price, _)| OrderedFloat(*price));

        let mut clusters: Vec<Cluster> = Vec::new();
        for &&(price, held) in &sorted {
            match clusters.last_mut() {
                Some(c) if (price - c.center()).abs() / c.center() <= self.tolerance_pct => {
                    c.prices.push(price);
                    c.touches += 1;
                    c.held += u32::from(held);
                }
                _ => clusters.push(Cluster {
                    prices: vec![price],
                    touches: 1,
                    held: u32::from(held),
                }),
            }
        }
        clusters.retain(|c| c.touches >= self.min_touches);
        clusters
    }

    fn to_levels(&self, clusters: Vec<Cluster>, max_touches: u32) -> Vec<PriceLevel> {
        clusters
            .into_iter()
            .map(|c| PriceLevel {
                price: c.center(),
                strength: f64::from(c.touches) / f64::from(max_touches.max(1)),
                touch_count: c.touches,
                ml_bounce_probability: self
                    .estimate_bounce
                    .then(|| f64::from(c.held) / f64::from(c.touches)),
            })
            .collect()
    }
}

impl SupportResistanceProvider for SwingPointDetector {
    fn detect_levels(
        &self,
        window: &[Candle],
        current_price: f64,
    ) -> Result<(Vec<PriceLevel>, Vec<PriceLevel>), ProviderError> {
        if window.len() < self.min_candles {
            return Err(ProviderError::InsufficientData {
                required: self.min_candles,
                available: window.len(),
            });
        }

        let k = self.pivot_window;
        let mut swing_lows: Vec<(f64, bool)> = Vec::new();
        let mut swing_highs: Vec<(f64, bool)> = Vec::new();

        for i in k..window.len() - k {
            let lo = window[i].low;
            let hi = window[i].high;
            let neighborhood = &window[i - k..=i + k];
            if neighborhood.iter().all(|c| c.low >= lo) {
                // Held when the close stayed above the pivot low.
                swing_lows.push((lo, window[i].close > lo));
            }
            if neighborhood.iter().all(|c| c.high <= hi) {
                swing_highs.push((hi, window[i].close < hi));
            }
        }

        let low_clusters = self.cluster(&swing_lows);
        let high_clusters = self.cluster(&swing_highs);
        let max_touches = low_clusters
            .iter()
            .chain(high_clusters.iter())
            .map(|c| c.touches)
            .max()
            .unwrap_or(1);

        let mut supports: Vec<PriceLevel> = self
            .to_levels(low_clusters, max_touches)
            .into_iter()
            .filter(|l| l.price < current_price)
            .collect();
        let mut resistances: Vec<PriceLevel> = self
            .to_levels(high_clusters, max_touches)
            .into_iter()
            .filter(|l| l.price > current_price)
            .collect();

        // Nearest-to-price first.
        supports.sort_by_key(|l| OrderedFloat(current_price - l.price));
        resistances.sort_by_key(|l| OrderedFloat(l.price - current_price));

        debug!(
            supports = supports.len(),
            resistances = resistances.len(),
            "swing-point detection"
        );
        Ok((supports, resistances))
    }
}
