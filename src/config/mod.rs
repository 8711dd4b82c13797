pub mod strictness;

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

use crate::engine::sltp::SltpCalculatorKind;
use crate::market::Timeframe;
pub use strictness::{StrictnessConfig, StrictnessLevel};

/// Env var overriding the directory the global store loads from.
pub const CONFIG_DIR_ENV: &str = "LEVTRADER_CONFIG_DIR";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("unknown strategy '{name}', known: {known:?}")]
    UnknownStrategy { name: String, known: Vec<String> },
    #[error("unknown timeframe '{name}', known: {known:?}")]
    UnknownTimeframe { name: String, known: Vec<String> },
    #[error("unknown strictness level '{name}', known: {known:?}")]
    UnknownStrictnessLevel { name: String, known: Vec<String> },
}

/// Per-timeframe base thresholds before strictness/strategy adjustment.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BaseEntryConditions {
    pub base_min_leverage: f64,
    pub base_min_confidence: f64,
    pub base_min_risk_reward: f64,
}

/// Per-timeframe analysis parameters from `timeframe_conditions.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeframeConfig {
    pub data_days: i64,
    pub evaluation_interval_minutes: i64,
    pub max_evaluations: usize,
    pub entry_conditions: BaseEntryConditions,
}

/// Per-strategy modifiers from `trading_conditions.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct StrategyConfig {
    pub sltp_calculator: SltpCalculatorKind,
    pub risk_multiplier: f64,
    pub confidence_boost: f64,
    pub leverage_cap: f64,
}

/// Constants consumed by the leverage decision engine.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct LeverageEngineConstants {
    pub max_leverage: f64,
    pub min_safe_leverage: f64,
    /// Tolerated adverse move, as a fraction of entry (e.g. 0.05 = 5%).
    pub max_drawdown_tolerance_pct: f64,
    pub safety_margin_pct: f64,
    pub tp_buffer_pct: f64,
    pub volatility_cap_factor: f64,
    pub btc_downside_cap_factor: f64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RiskManagementConfig {
    /// Minimum candles required before support/resistance detection runs.
    pub min_detection_candles: usize,
    /// Prior candles fetched ahead of the evaluation window.
    pub lookback_candles: i64,
}

#[derive(Debug, Clone, Deserialize)]
struct TimeframeDocument {
    timeframe_configs: BTreeMap<String, TimeframeConfig>,
}

#[derive(Debug, Clone, Deserialize)]
struct TradingDocument {
    strategy_configs: BTreeMap<String, StrategyConfig>,
    leverage_engine_constants: LeverageEngineConstants,
    risk_management: RiskManagementConfig,
}

/// Resolved entry thresholds for a (timeframe, strategy, strictness) triple.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntryConditions {
    pub min_leverage: f64,
    pub min_confidence: f64,
    pub min_risk_reward: f64,
    pub max_leverage: f64,
}

/// Immutable configuration store: the three JSON documents, loaded once.
///
/// `global()` is the process-wide instance; after the first load concurrent
/// readers touch no locks. Tests construct instances directly from a
/// directory.
#[derive(Debug)]
pub struct ConfigStore {
    timeframes: BTreeMap<Timeframe, TimeframeConfig>,
    strategies: BTreeMap<String, StrategyConfig>,
    strictness: StrictnessConfig,
    leverage_engine: LeverageEngineConstants,
    risk_management: RiskManagementConfig,
}

static GLOBAL: OnceLock<ConfigStore> = OnceLock::new();

impl ConfigStore {
    pub fn load_from_dir(dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let dir = dir.as_ref();
        let tf_doc: TimeframeDocument = read_json(&dir.join("timeframe_conditions.json"))?;
        let trading: TradingDocument = read_json(&dir.join("trading_conditions.json"))?;
        let strictness: StrictnessConfig =
            read_json(&dir.join("condition_strictness_levels.json"))?;

        let mut timeframes = BTreeMap::new();
        for (tag, cfg) in tf_doc.timeframe_configs {
            let tf: Timeframe = tag.parse().map_err(|_| ConfigError::UnknownTimeframe {
                name: tag.clone(),
                known: Timeframe::ALL.iter().map(|t| t.as_str().to_string()).collect(),
            })?;
            timeframes.insert(tf, cfg);
        }

        Ok(Self {
            timeframes,
            strategies: trading.strategy_configs,
            strictness,
            leverage_engine: trading.leverage_engine_constants,
            risk_management: trading.risk_management,
        })
    }

    /// Process-wide store, loaded lazily from `LEVTRADER_CONFIG_DIR` or
    /// `./config` on first use.
    pub fn global() -> Result<&'static ConfigStore, ConfigError> {
        if let Some(store) = GLOBAL.get() {
            return Ok(store);
        }
        let dir = std::env::var(CONFIG_DIR_ENV).map_or_else(|_| PathBuf::from("config"), PathBuf::from);
        let store = Self::load_from_dir(dir)?;
        Ok(GLOBAL.get_or_init(|| store))
    }

    pub fn timeframe(&self, timeframe: Timeframe) -> Result<&TimeframeConfig, ConfigError> {
        self.timeframes
            .get(&timeframe)
            .ok_or_else(|| ConfigError::UnknownTimeframe {
                name: timeframe.as_str().to_string(),
                known: self
                    .timeframes
                    .keys()
                    .map(|t| t.as_str().to_string())
                    .collect(),
            })
    }

    pub fn strategy(&self, name: &str) -> Result<&StrategyConfig, ConfigError> {
        self.strategies
            .get(name)
            .ok_or_else(|| ConfigError::UnknownStrategy {
                name: name.to_string(),
                known: self.strategies.keys().cloned().collect(),
            })
    }

    pub fn known_strategies(&self) -> Vec<&str> {
        self.strategies.keys().map(String::as_str).collect()
    }

    pub fn leverage_engine(&self) -> &LeverageEngineConstants {
        &self.leverage_engine
    }

    pub fn risk_management(&self) -> &RiskManagementConfig {
        &self.risk_management
    }

    pub fn strictness(&self) -> &StrictnessConfig {
        &self.strictness
    }

    pub fn default_strictness_level(&self) -> StrictnessLevel {
        self.strictness.current_level
    }

    /// Resolve effective entry thresholds.
    ///
    /// Base thresholds come from the timeframe, strictness multiplies and
    /// clamps them, then the strategy applies its confidence boost
    /// (additive, re-clamped to [0.1, 1.0]), risk multiplier and leverage
    /// cap.
    pub fn effective_entry_conditions(
        &self,
        timeframe: Timeframe,
        strategy: &str,
        level: StrictnessLevel,
    ) -> Result<EntryConditions, ConfigError> {
        let tf = self.timeframe(timeframe)?;
        let strat = self.strategy(strategy)?;
        let adjusted = self.strictness.adjust(&tf.entry_conditions, level)?;

        let min_confidence = (adjusted.min_confidence + strat.confidence_boost).clamp(0.1, 1.0);
        let min_risk_reward = adjusted.min_risk_reward * strat.risk_multiplier;

        Ok(EntryConditions {
            min_leverage: adjusted.min_leverage,
            min_confidence,
            min_risk_reward,
            max_leverage: strat.leverage_cap,
        })
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ConfigStore {
        ConfigStore::load_from_dir("config").expect("shipped config parses")
    }

    #[test]
    fn shipped_config_loads() {
        let s = store();
        assert!(s.timeframe(Timeframe::H1).is_ok());
        assert!(s.strategy("Balanced").is_ok());
    }

    #[test]
    fn unknown_strategy_lists_known() {
        let s = store();
        let err = s.strategy("Nope_ML").unwrap_err();
        match err {
            ConfigError::UnknownStrategy { name, known } => {
                assert_eq!(name, "Nope_ML");
                assert!(known.contains(&"Balanced".to_string()));
                assert!(known.len() >= 3);
            }
            other => panic!("expected UnknownStrategy, got {other:?}"),
        }
    }

    #[test]
    fn effective_conditions_apply_strategy_adjustments() {
        let s = store();
        let balanced = s
            .effective_entry_conditions(Timeframe::H1, "Balanced", StrictnessLevel::Standard)
            .unwrap();
        let conservative = s
            .effective_entry_conditions(Timeframe::H1, "Conservative_ML", StrictnessLevel::Standard)
            .unwrap();
        // Conservative boosts confidence and demands a higher risk/reward.
        assert!(conservative.min_confidence >= balanced.min_confidence);
        assert!(conservative.min_risk_reward >= balanced.min_risk_reward);
        assert!(conservative.max_leverage <= balanced.max_leverage);
    }

    #[test]
    fn strictness_monotonicity_across_all_pairs() {
        let s = store();
        for tf in Timeframe::ALL {
            if s.timeframe(tf).is_err() {
                continue;
            }
            for strat in s.known_strategies() {
                let dev = s
                    .effective_entry_conditions(tf, strat, StrictnessLevel::Development)
                    .unwrap();
                let std_ = s
                    .effective_entry_conditions(tf, strat, StrictnessLevel::Standard)
                    .unwrap();
                let strict = s
                    .effective_entry_conditions(tf, strat, StrictnessLevel::Strict)
                    .unwrap();
                assert!(dev.min_leverage <= std_.min_leverage, "{tf} {strat}");
                assert!(std_.min_leverage <= strict.min_leverage, "{tf} {strat}");
            }
        }
    }

    #[test]
    fn confidence_stays_within_unit_interval() {
        let s = store();
        for strat in s.known_strategies() {
            let c = s
                .effective_entry_conditions(Timeframe::M15, strat, StrictnessLevel::Strict)
                .unwrap();
            assert!((0.1..=1.0).contains(&c.min_confidence), "{strat}: {c:?}");
        }
    }
}
