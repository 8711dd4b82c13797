use thiserror::Error;
use tracing::debug;

use crate::config::EntryConditions;

/// Raw per-timestamp signal as surfaced by the decision pipeline. Fields are
/// optional because upstream plugins may legitimately omit them; omission is
/// a reportable error, never a silent rejection.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EntrySignal {
    pub leverage: Option<f64>,
    /// Percent scale (0–100).
    pub confidence_pct: Option<f64>,
    pub risk_reward: Option<f64>,
    pub current_price: Option<f64>,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("entry signal missing fields: {missing_fields:?}")]
pub struct MissingFields {
    pub missing_fields: Vec<&'static str>,
}

/// Pure entry gate: leverage, confidence and risk/reward against the
/// effective thresholds, plus a sane positive price.
///
/// Logs the first failing predicate for observability but has no other side
/// effects.
pub fn evaluate(signal: &EntrySignal, conditions: &EntryConditions) -> Result<bool, MissingFields> {
    let mut missing = Vec::new();
    if signal.leverage.is_none() {
        missing.push("leverage");
    }
    if signal.confidence_pct.is_none() {
        missing.push("confidence");
    }
    if signal.risk_reward.is_none() {
        missing.push("risk_reward");
    }
    if signal.current_price.is_none() {
        missing.push("current_price");
    }
    if !missing.is_empty() {
        return Err(MissingFields {
            missing_fields: missing,
        });
    }

    let leverage = signal.leverage.unwrap_or_default();
    let confidence = signal.confidence_pct.unwrap_or_default() / 100.0;
    let risk_reward = signal.risk_reward.unwrap_or_default();
    let current_price = signal.current_price.unwrap_or_default();

    if leverage < conditions.min_leverage {
        debug!(leverage, min = conditions.min_leverage, "entry rejected: leverage below floor");
        return Ok(false);
    }
    if confidence < conditions.min_confidence {
        debug!(confidence, min = conditions.min_confidence, "entry rejected: confidence below floor");
        return Ok(false);
    }
    if risk_reward < conditions.min_risk_reward {
        debug!(risk_reward, min = conditions.min_risk_reward, "entry rejected: risk/reward below floor");
        return Ok(false);
    }
    if current_price <= 0.0 {
        debug!(current_price, "entry rejected: non-positive price");
        return Ok(false);
    }
    Ok(true)
}
