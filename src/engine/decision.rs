use std::sync::Arc;
use tracing::debug;

use super::sltp::{self, SltpCalculatorKind, SltpInputs};
use super::types::{
    EarlyExit, ExitReason, ExitStage, LeverageDecision, MarketContext, PriceLevel,
};
use crate::config::{EntryConditions, LeverageEngineConstants};
use crate::market::Candle;
use crate::providers::{
    BtcCorrelationProvider, MlPredictor, ProviderError, SupportResistanceProvider,
};

/// Full leverage at this preliminary risk/reward and above.
const FULL_LEVERAGE_RR: f64 = 2.0;

/// A decision together with the levels that produced it, so the caller can
/// recompute SL/TP against the realized entry price without re-running
/// detection.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionArtifacts {
    pub decision: LeverageDecision,
    pub supports: Vec<PriceLevel>,
    pub resistances: Vec<PriceLevel>,
}

/// Leverage decision engine (long positions only).
///
/// Consumes the injected analysis capabilities and either produces a
/// `LeverageDecision` or a structured early exit. The engine only ever sees
/// the candle window the caller passes in; callers hand it
/// `series.up_to(target)` so nothing after the target timestamp can shape
/// the decision.
pub struct LeverageDecisionEngine {
    support_resistance: Arc<dyn SupportResistanceProvider>,
    ml: Arc<dyn MlPredictor>,
    correlation: Arc<dyn BtcCorrelationProvider>,
    sltp_kind: SltpCalculatorKind,
}

impl LeverageDecisionEngine {
    pub fn new(
        support_resistance: Arc<dyn SupportResistanceProvider>,
        ml: Arc<dyn MlPredictor>,
        correlation: Arc<dyn BtcCorrelationProvider>,
        sltp_kind: SltpCalculatorKind,
    ) -> Self {
        Self {
            support_resistance,
            ml,
            correlation,
            sltp_kind,
        }
    }

    pub fn decide(
        &self,
        window: &[Candle],
        context: &MarketContext,
        conditions: &EntryConditions,
        constants: &LeverageEngineConstants,
    ) -> Result<DecisionArtifacts, EarlyExit> {
        let price = context.current_price;
        let mut reasoning = Vec::new();

        let (supports, resistances) = self
            .support_resistance
            .detect_levels(window, price)
            .map_err(|e| provider_exit(ExitStage::SupportResistance, &e))?;
        let prediction = self
            .ml
            .predict(window)
            .map_err(|e| provider_exit(ExitStage::MlPrediction, &e))?;
        let correlation = self
            .correlation
            .correlation(window)
            .map_err(|e| provider_exit(ExitStage::LeverageDecision, &e))?;

        let Some(nearest_support) = nearest_below(&supports, price) else {
            return Err(EarlyExit::new(
                ExitStage::SupportResistance,
                ExitReason::NoSupportResistance,
            )
            .with_detail(format!(
                "no support below {price:.6} among {} detected levels",
                supports.len()
            )));
        };
        let support_distance_pct = (price - nearest_support.price) / price;
        if support_distance_pct <= 0.0 {
            return Err(EarlyExit::new(
                ExitStage::SupportResistance,
                ExitReason::NoSupportResistance,
            ));
        }

        // Preliminary reward/risk from the raw level geometry; the final RR
        // is recomputed from the calculated TP/SL below.
        let prelim_rr = nearest_above(&resistances, price)
            .map(|r| ((r.price - price) / price) / support_distance_pct)
            .unwrap_or(0.0);

        let support_constraint = constants.max_drawdown_tolerance_pct / support_distance_pct;
        reasoning.push(format!(
            "support {:.6} at {:.2}% caps leverage at {support_constraint:.2}x",
            nearest_support.price,
            support_distance_pct * 100.0
        ));

        let rr_constraint =
            constants.max_leverage * (prelim_rr / FULL_LEVERAGE_RR).clamp(0.0, 1.0);
        reasoning.push(format!(
            "preliminary risk/reward {prelim_rr:.2} caps leverage at {rr_constraint:.2}x"
        ));

        let confidence = blend_confidence(prediction.confidence, nearest_support, context);
        let confidence_constraint = constants.max_leverage * confidence;
        reasoning.push(format!(
            "confidence {:.0}% caps leverage at {confidence_constraint:.2}x",
            confidence * 100.0
        ));

        let correlated_downside = correlation.strength
            * correlation.expected_downside
            * constants.btc_downside_cap_factor;
        let btc_constraint = if correlated_downside > 1e-9 {
            constants.max_drawdown_tolerance_pct / correlated_downside
        } else {
            constants.max_leverage
        };
        reasoning.push(format!(
            "correlated downside {:.2}% caps leverage at {btc_constraint:.2}x",
            correlated_downside * 100.0
        ));

        let volatility_constraint = if context.volatility > 1e-9 {
            constants.max_leverage * (constants.volatility_cap_factor / context.volatility).min(1.0)
        } else {
            constants.max_leverage
        };
        reasoning.push(format!(
            "volatility {:.2}% caps leverage at {volatility_constraint:.2}x",
            context.volatility * 100.0
        ));

        let leverage = [
            support_constraint,
            rr_constraint,
            confidence_constraint,
            btc_constraint,
            volatility_constraint,
            conditions.max_leverage,
            constants.max_leverage,
        ]
        .into_iter()
        .fold(f64::INFINITY, f64::min);
        reasoning.push(format!(
            "strategy cap {:.2}x, global cap {:.2}x, final {leverage:.2}x",
            conditions.max_leverage, constants.max_leverage
        ));

        if leverage < constants.min_safe_leverage {
            return Err(EarlyExit::new(
                ExitStage::LeverageDecision,
                ExitReason::UnsafeLeverage,
            )
            .with_detail(format!(
                "constrained leverage {leverage:.2}x below safe minimum {:.2}x",
                constants.min_safe_leverage
            )));
        }

        let Some(levels) = sltp::calculate(
            self.sltp_kind,
            &SltpInputs {
                entry_price: price,
                supports: &supports,
                resistances: &resistances,
                context,
                constants,
            },
        ) else {
            return Err(EarlyExit::new(
                ExitStage::LeverageDecision,
                ExitReason::UnsafeLeverage,
            )
            .with_detail("SL/TP calculator produced no usable levels".to_string()));
        };

        // Long-position ordering is a hard gate, not a warning.
        if levels.stop_loss_price >= price || levels.take_profit_price <= price {
            return Err(EarlyExit::new(
                ExitStage::LeverageDecision,
                ExitReason::UnsafeLeverage,
            )
            .with_detail(format!(
                "price ordering violated: sl {:.6}, entry {price:.6}, tp {:.6}",
                levels.stop_loss_price, levels.take_profit_price
            )));
        }

        let risk_reward =
            (levels.take_profit_price - price) / (price - levels.stop_loss_price);
        if risk_reward < conditions.min_risk_reward {
            return Err(EarlyExit::new(
                ExitStage::EntryConditions,
                ExitReason::LowRiskReward,
            )
            .with_detail(format!(
                "risk/reward {risk_reward:.2} below minimum {:.2}",
                conditions.min_risk_reward
            )));
        }

        debug!(leverage, confidence, risk_reward, "leverage decision");
        Ok(DecisionArtifacts {
            decision: LeverageDecision {
                leverage,
                confidence: confidence * 100.0,
                take_profit_price: levels.take_profit_price,
                stop_loss_price: levels.stop_loss_price,
                risk_reward,
                current_price: price,
                reasoning,
            },
            supports,
            resistances,
        })
    }
}

fn provider_exit(stage: ExitStage, err: &ProviderError) -> EarlyExit {
    match err {
        ProviderError::InsufficientData {
            required,
            available,
        } => EarlyExit::new(stage, ExitReason::InsufficientData).with_detail(format!(
            "{}: {available} candles available, {required} required",
            stage.as_str()
        )),
    }
}

fn nearest_below(levels: &[PriceLevel], price: f64) -> Option<&PriceLevel> {
    levels
        .iter()
        .filter(|l| l.price < price)
        .max_by(|a, b| a.price.total_cmp(&b.price))
}

fn nearest_above(levels: &[PriceLevel], price: f64) -> Option<&PriceLevel> {
    levels
        .iter()
        .filter(|l| l.price > price)
        .min_by(|a, b| a.price.total_cmp(&b.price))
}

/// Confidence blend: ML confidence, the anchoring support's strength and a
/// small trend bonus. Kept in [0, 1].
fn blend_confidence(ml_confidence: f64, support: &PriceLevel, context: &MarketContext) -> f64 {
    let trend_bonus = match context.trend {
        crate::engine::types::TrendDirection::Bullish => 1.0,
        crate::engine::types::TrendDirection::Sideways => 0.6,
        crate::engine::types::TrendDirection::Bearish => 0.2,
    };
    let bounce = support.ml_bounce_probability.unwrap_or(0.5);
    (0.35 * ml_confidence + 0.3 * support.strength + 0.15 * bounce + 0.2 * trend_bonus)
        .clamp(0.0, 1.0)
}
