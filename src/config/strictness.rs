use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::{BaseEntryConditions, ConfigError};

/// The five-step strictness ladder over base entry thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrictnessLevel {
    Development,
    Testing,
    Conservative,
    Standard,
    Strict,
}

impl StrictnessLevel {
    pub const ALL: [StrictnessLevel; 5] = [
        StrictnessLevel::Development,
        StrictnessLevel::Testing,
        StrictnessLevel::Conservative,
        StrictnessLevel::Standard,
        StrictnessLevel::Strict,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StrictnessLevel::Development => "development",
            StrictnessLevel::Testing => "testing",
            StrictnessLevel::Conservative => "conservative",
            StrictnessLevel::Standard => "standard",
            StrictnessLevel::Strict => "strict",
        }
    }
}

impl fmt::Display for StrictnessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Multiplicative adjusters applied to the base thresholds of a timeframe.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StrictnessMultipliers {
    pub leverage_factor: f64,
    pub confidence_factor: f64,
    pub risk_reward_factor: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StrictnessLevelConfig {
    pub description: String,
    #[serde(default)]
    pub usage: String,
    pub multipliers: StrictnessMultipliers,
}

/// Parsed `condition_strictness_levels.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct StrictnessConfig {
    pub current_level: StrictnessLevel,
    pub strictness_levels: BTreeMap<StrictnessLevel, StrictnessLevelConfig>,
}

impl StrictnessConfig {
    pub fn multipliers(&self, level: StrictnessLevel) -> Result<StrictnessMultipliers, ConfigError> {
        self.strictness_levels
            .get(&level)
            .map(|c| c.multipliers)
            .ok_or_else(|| ConfigError::UnknownStrictnessLevel {
                name: level.as_str().to_string(),
                known: self
                    .strictness_levels
                    .keys()
                    .map(|l| l.as_str().to_string())
                    .collect(),
            })
    }

    /// Base thresholds scaled by the level's factors, clamped to the
    /// documented floors: leverage >= 1.0, confidence in [0.1, 1.0],
    /// risk/reward >= 0.5.
    pub fn adjust(
        &self,
        base: &BaseEntryConditions,
        level: StrictnessLevel,
    ) -> Result<AdjustedConditions, ConfigError> {
        let m = self.multipliers(level)?;
        Ok(AdjustedConditions {
            min_leverage: (base.base_min_leverage * m.leverage_factor).max(1.0),
            min_confidence: (base.base_min_confidence * m.confidence_factor).clamp(0.1, 1.0),
            min_risk_reward: (base.base_min_risk_reward * m.risk_reward_factor).max(0.5),
        })
    }
}

/// Thresholds after strictness scaling, before strategy adjustments.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdjustedConditions {
    pub min_leverage: f64,
    pub min_confidence: f64,
    pub min_risk_reward: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StrictnessConfig {
        serde_json::from_str(
            r#"{
                "current_level": "standard",
                "strictness_levels": {
                    "development": {"description": "loose", "multipliers": {"leverage_factor": 0.3, "confidence_factor": 0.4, "risk_reward_factor": 0.5}},
                    "testing": {"description": "relaxed", "multipliers": {"leverage_factor": 0.5, "confidence_factor": 0.6, "risk_reward_factor": 0.7}},
                    "conservative": {"description": "cautious", "multipliers": {"leverage_factor": 0.8, "confidence_factor": 0.9, "risk_reward_factor": 0.9}},
                    "standard": {"description": "default", "multipliers": {"leverage_factor": 1.0, "confidence_factor": 1.0, "risk_reward_factor": 1.0}},
                    "strict": {"description": "tight", "multipliers": {"leverage_factor": 1.3, "confidence_factor": 1.2, "risk_reward_factor": 1.2}}
                }
            }"#,
        )
        .unwrap()
    }

    fn base() -> BaseEntryConditions {
        BaseEntryConditions {
            base_min_leverage: 4.0,
            base_min_confidence: 0.6,
            base_min_risk_reward: 1.5,
        }
    }

    #[test]
    fn standard_level_is_identity() {
        let adjusted = config().adjust(&base(), StrictnessLevel::Standard).unwrap();
        assert!((adjusted.min_leverage - 4.0).abs() < 1e-12);
        assert!((adjusted.min_confidence - 0.6).abs() < 1e-12);
        assert!((adjusted.min_risk_reward - 1.5).abs() < 1e-12);
    }

    #[test]
    fn levels_are_monotonic_in_min_leverage() {
        let cfg = config();
        let b = base();
        let dev = cfg.adjust(&b, StrictnessLevel::Development).unwrap();
        let std_ = cfg.adjust(&b, StrictnessLevel::Standard).unwrap();
        let strict = cfg.adjust(&b, StrictnessLevel::Strict).unwrap();
        assert!(dev.min_leverage <= std_.min_leverage);
        assert!(std_.min_leverage <= strict.min_leverage);
    }

    #[test]
    fn floors_are_enforced() {
        let cfg = config();
        let tiny = BaseEntryConditions {
            base_min_leverage: 0.5,
            base_min_confidence: 0.05,
            base_min_risk_reward: 0.2,
        };
        let adjusted = cfg.adjust(&tiny, StrictnessLevel::Development).unwrap();
        assert!((adjusted.min_leverage - 1.0).abs() < 1e-12);
        assert!((adjusted.min_confidence - 0.1).abs() < 1e-12);
        assert!((adjusted.min_risk_reward - 0.5).abs() < 1e-12);
    }

    #[test]
    fn confidence_is_capped_at_one() {
        let cfg = config();
        let hot = BaseEntryConditions {
            base_min_leverage: 4.0,
            base_min_confidence: 0.95,
            base_min_risk_reward: 1.5,
        };
        let adjusted = cfg.adjust(&hot, StrictnessLevel::Strict).unwrap();
        assert!((adjusted.min_confidence - 1.0).abs() < 1e-12);
    }
}
