use serde::{Deserialize, Serialize};

use super::types::{MarketContext, PriceLevel};
use crate::config::LeverageEngineConstants;

/// Which SL/TP calculator a strategy uses. A tagged variant, not a type
/// hierarchy: the strategy config names one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SltpCalculatorKind {
    Default,
    Conservative,
    Aggressive,
    Traditional,
    Ml,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SltpLevels {
    pub stop_loss_price: f64,
    pub take_profit_price: f64,
}

pub struct SltpInputs<'a> {
    pub entry_price: f64,
    pub supports: &'a [PriceLevel],
    pub resistances: &'a [PriceLevel],
    pub context: &'a MarketContext,
    pub constants: &'a LeverageEngineConstants,
}

/// Compute SL below a support and TP below a resistance for a long entry.
///
/// Returns `None` when no support below or resistance above the entry price
/// exists (the traditional calculator is the exception: it is purely
/// volatility-based and always produces levels).
pub fn calculate(kind: SltpCalculatorKind, inputs: &SltpInputs<'_>) -> Option<SltpLevels> {
    let margin = inputs.constants.safety_margin_pct;
    let buffer = inputs.constants.tp_buffer_pct;

    if kind == SltpCalculatorKind::Traditional {
        // Volatility bands around the entry; no levels consulted.
        let vol = inputs.context.volatility.max(0.005);
        return Some(SltpLevels {
            stop_loss_price: inputs.entry_price * (1.0 - 2.0 * vol),
            take_profit_price: inputs.entry_price * (1.0 + 3.0 * vol),
        });
    }

    let support = match kind {
        SltpCalculatorKind::Ml => strongest_support_by_bounce(inputs),
        _ => nearest_support(inputs),
    }?;
    let resistance = match kind {
        SltpCalculatorKind::Aggressive => furthest_resistance(inputs),
        _ => nearest_resistance(inputs),
    }?;

    let (sl_margin, tp_buffer) = match kind {
        // Conservative: wider stop margin so support-test wicks don't shake
        // the position out, and an earlier profit take.
        SltpCalculatorKind::Conservative => (2.0 * margin, 2.0 * buffer),
        // Aggressive: tight stop, profit target at the furthest resistance.
        SltpCalculatorKind::Aggressive => (0.5 * margin, buffer),
        _ => (margin, buffer),
    };

    Some(SltpLevels {
        stop_loss_price: support.price * (1.0 - sl_margin),
        take_profit_price: resistance.price * (1.0 - tp_buffer),
    })
}

fn nearest_support<'a>(inputs: &'a SltpInputs<'_>) -> Option<&'a PriceLevel> {
    inputs
        .supports
        .iter()
        .filter(|l| l.price < inputs.entry_price)
        .max_by(|a, b| a.price.total_cmp(&b.price))
}

fn strongest_support_by_bounce<'a>(inputs: &'a SltpInputs<'_>) -> Option<&'a PriceLevel> {
    inputs
        .supports
        .iter()
        .filter(|l| l.price < inputs.entry_price)
        .max_by(|a, b| {
            let score = |l: &PriceLevel| l.strength * l.ml_bounce_probability.unwrap_or(0.5);
            score(a).total_cmp(&score(b))
        })
}

fn nearest_resistance<'a>(inputs: &'a SltpInputs<'_>) -> Option<&'a PriceLevel> {
    inputs
        .resistances
        .iter()
        .filter(|l| l.price > inputs.entry_price)
        .min_by(|a, b| a.price.total_cmp(&b.price))
}

fn furthest_resistance<'a>(inputs: &'a SltpInputs<'_>) -> Option<&'a PriceLevel> {
    inputs
        .resistances
        .iter()
        .filter(|l| l.price > inputs.entry_price)
        .max_by(|a, b| a.price.total_cmp(&b.price))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{MarketPhase, TrendDirection};
    use chrono::Utc;

    fn level(price: f64, strength: f64, bounce: Option<f64>) -> PriceLevel {
        PriceLevel {
            price,
            strength,
            touch_count: 3,
            ml_bounce_probability: bounce,
        }
    }

    fn constants() -> LeverageEngineConstants {
        LeverageEngineConstants {
            max_leverage: 20.0,
            min_safe_leverage: 2.0,
            max_drawdown_tolerance_pct: 0.10,
            safety_margin_pct: 0.005,
            tp_buffer_pct: 0.003,
            volatility_cap_factor: 0.02,
            btc_downside_cap_factor: 0.5,
        }
    }

    fn context(price: f64) -> MarketContext {
        MarketContext {
            current_price: price,
            trend: TrendDirection::Bullish,
            volatility: 0.02,
            phase: MarketPhase::Markup,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn default_uses_nearest_levels() {
        let supports = vec![level(95.0, 0.7, None), level(90.0, 0.9, None)];
        let resistances = vec![level(105.0, 0.6, None), level(112.0, 0.8, None)];
        let constants = constants();
        let ctx = context(100.0);
        let levels = calculate(
            SltpCalculatorKind::Default,
            &SltpInputs {
                entry_price: 100.0,
                supports: &supports,
                resistances: &resistances,
                context: &ctx,
                constants: &constants,
            },
        )
        .unwrap();
        assert!((levels.stop_loss_price - 95.0 * 0.995).abs() < 1e-9);
        assert!((levels.take_profit_price - 105.0 * 0.997).abs() < 1e-9);
        assert!(levels.stop_loss_price < 100.0);
        assert!(levels.take_profit_price > 100.0);
    }

    #[test]
    fn aggressive_targets_furthest_resistance() {
        let supports = vec![level(95.0, 0.7, None)];
        let resistances = vec![level(105.0, 0.6, None), level(112.0, 0.8, None)];
        let constants = constants();
        let ctx = context(100.0);
        let levels = calculate(
            SltpCalculatorKind::Aggressive,
            &SltpInputs {
                entry_price: 100.0,
                supports: &supports,
                resistances: &resistances,
                context: &ctx,
                constants: &constants,
            },
        )
        .unwrap();
        assert!(levels.take_profit_price > 111.0);
        // Tighter stop than default.
        assert!(levels.stop_loss_price > 95.0 * 0.995);
    }

    #[test]
    fn ml_prefers_high_bounce_support() {
        let supports = vec![level(96.0, 0.5, Some(0.2)), level(92.0, 0.8, Some(0.9))];
        let resistances = vec![level(105.0, 0.6, None)];
        let constants = constants();
        let ctx = context(100.0);
        let levels = calculate(
            SltpCalculatorKind::Ml,
            &SltpInputs {
                entry_price: 100.0,
                supports: &supports,
                resistances: &resistances,
                context: &ctx,
                constants: &constants,
            },
        )
        .unwrap();
        // SL anchors to the 92.0 support (strength * bounce wins).
        assert!(levels.stop_loss_price < 92.0);
    }

    #[test]
    fn traditional_ignores_levels() {
        let constants = constants();
        let ctx = context(100.0);
        let levels = calculate(
            SltpCalculatorKind::Traditional,
            &SltpInputs {
                entry_price: 100.0,
                supports: &[],
                resistances: &[],
                context: &ctx,
                constants: &constants,
            },
        )
        .unwrap();
        assert!((levels.stop_loss_price - 96.0).abs() < 1e-9);
        assert!((levels.take_profit_price - 106.0).abs() < 1e-9);
    }

    #[test]
    fn no_support_below_entry_yields_none() {
        let supports = vec![level(101.0, 0.7, None)];
        let resistances = vec![level(105.0, 0.6, None)];
        let constants = constants();
        let ctx = context(100.0);
        let out = calculate(
            SltpCalculatorKind::Default,
            &SltpInputs {
                entry_price: 100.0,
                supports: &supports,
                resistances: &resistances,
                context: &ctx,
                constants: &constants,
            },
        );
        assert!(out.is_none());
    }
}
