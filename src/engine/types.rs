use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a trade resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Profit,
    Loss,
    /// Neither TP nor SL touched within the horizon; exited at entry price.
    Breakeven,
}

/// Shared severity scale for price-consistency and backtest-result checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationLevel {
    Normal,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for ValidationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValidationLevel::Normal => "normal",
            ValidationLevel::Warning => "warning",
            ValidationLevel::Error => "error",
            ValidationLevel::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// One closed long trade in an analysis ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_price: f64,
    pub take_profit_price: f64,
    pub stop_loss_price: f64,
    pub leverage: f64,
    /// Leveraged return: (exit - entry) / entry * leverage.
    pub pnl_pct: f64,
    pub confidence: f64,
    pub outcome: Outcome,
    pub strategy: String,
    pub price_consistency_score: f64,
    pub price_validation_level: ValidationLevel,
    pub backtest_validation_severity: ValidationLevel,
    pub analysis_price: f64,
}

/// Pipeline stage at which an analysis terminated early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStage {
    DataFetch,
    SupportResistance,
    MlPrediction,
    MarketContext,
    LeverageDecision,
    EntryConditions,
}

impl ExitStage {
    pub fn as_str(self) -> &'static str {
        match self {
            ExitStage::DataFetch => "data_fetch",
            ExitStage::SupportResistance => "support_resistance",
            ExitStage::MlPrediction => "ml_prediction",
            ExitStage::MarketContext => "market_context",
            ExitStage::LeverageDecision => "leverage_decision",
            ExitStage::EntryConditions => "entry_conditions",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    InsufficientData,
    NoSupportResistance,
    LowConfidence,
    UnsafeLeverage,
    LowRiskReward,
}

impl ExitReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ExitReason::InsufficientData => "insufficient_data",
            ExitReason::NoSupportResistance => "no_support_resistance",
            ExitReason::LowConfidence => "low_confidence",
            ExitReason::UnsafeLeverage => "unsafe_leverage",
            ExitReason::LowRiskReward => "low_risk_reward",
        }
    }
}

/// Structured early termination: a first-class result, not an error.
///
/// Carries messaging for all three audiences: a one-line user summary, the
/// detailed operator log line, and actionable suggestions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EarlyExit {
    pub stage: ExitStage,
    pub reason: ExitReason,
    pub user_message: String,
    pub detailed_message: String,
    pub suggestions: Vec<String>,
}

impl EarlyExit {
    pub fn new(stage: ExitStage, reason: ExitReason) -> Self {
        let (user_message, suggestions) = default_messaging(stage, reason);
        Self {
            stage,
            reason,
            user_message,
            detailed_message: format!(
                "analysis stopped at {}: {}",
                stage.as_str(),
                reason.as_str()
            ),
            suggestions,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detailed_message = detail.into();
        self
    }

    /// Short form used for the metadata row's error_message.
    pub fn summary(&self) -> String {
        format!("{}: {}", self.stage.as_str(), self.reason.as_str())
    }
}

fn default_messaging(stage: ExitStage, reason: ExitReason) -> (String, Vec<String>) {
    match reason {
        ExitReason::InsufficientData => (
            format!("Not enough market data to evaluate ({})", stage.as_str()),
            vec![
                "Wait for more price history to accumulate".to_string(),
                "Try a longer timeframe".to_string(),
            ],
        ),
        ExitReason::NoSupportResistance => (
            "No usable support/resistance levels were found".to_string(),
            vec![
                "The market may be trending without established levels".to_string(),
                "Try a longer analysis window".to_string(),
            ],
        ),
        ExitReason::LowConfidence => (
            "Signal confidence was below the configured floor".to_string(),
            vec!["Relax the strictness level for exploratory runs".to_string()],
        ),
        ExitReason::UnsafeLeverage => (
            "No leverage satisfied the safety constraints".to_string(),
            vec![
                "Nearby support is too close or volatility too high".to_string(),
                "Review the leverage engine constants".to_string(),
            ],
        ),
        ExitReason::LowRiskReward => (
            "Risk/reward ratio fell below the strategy minimum".to_string(),
            vec!["Resistance is too close to the candidate entry".to_string()],
        ),
    }
}

/// Leverage decision emitted for an accepted evaluation timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeverageDecision {
    pub leverage: f64,
    /// Percent scale (0–100), matching the provider contract.
    pub confidence: f64,
    pub take_profit_price: f64,
    pub stop_loss_price: f64,
    pub risk_reward: f64,
    pub current_price: f64,
    /// Per-constraint leverage candidates, kept for observability.
    pub reasoning: Vec<String>,
}

/// Worker -> orchestrator message for one analysis.
#[derive(Debug, Clone)]
pub enum AnalysisResult {
    Completed {
        trades: Vec<TradeRecord>,
        metrics: AnalysisMetrics,
    },
    EarlyExit(EarlyExit),
}

impl AnalysisResult {
    pub fn early(stage: ExitStage, reason: ExitReason) -> Self {
        AnalysisResult::EarlyExit(EarlyExit::new(stage, reason))
    }
}

/// Aggregated per-analysis performance figures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisMetrics {
    pub total_trades: usize,
    /// wins / decisive trades; breakevens are excluded from the denominator.
    pub win_rate: f64,
    pub total_return: f64,
    pub sharpe_ratio: f64,
    pub max_drawdown: f64,
    pub avg_leverage: f64,
    pub breakeven_trades: usize,
    pub decisive_trades: usize,
    pub breakeven_rate: f64,
    pub avg_price_consistency: f64,
    pub critical_price_issues: usize,
    pub critical_backtest_issues: usize,
}

/// A detected support or resistance level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: f64,
    /// Relative strength in [0, 1].
    pub strength: f64,
    pub touch_count: u32,
    pub ml_bounce_probability: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MlPrediction {
    pub breakout_prob: f64,
    pub bounce_prob: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BtcCorrelation {
    pub strength: f64,
    pub expected_downside: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Bullish,
    Bearish,
    Sideways,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketPhase {
    Accumulation,
    Markup,
    Distribution,
    Markdown,
}

/// Market snapshot at an evaluation timestamp. In backtest mode
/// `current_price` is the open of the candle containing the target
/// timestamp; in realtime mode it is the latest close.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarketContext {
    pub current_price: f64,
    pub trend: TrendDirection,
    pub volatility: f64,
    pub phase: MarketPhase,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_levels_order_by_severity() {
        assert!(ValidationLevel::Normal < ValidationLevel::Warning);
        assert!(ValidationLevel::Warning < ValidationLevel::Error);
        assert!(ValidationLevel::Error < ValidationLevel::Critical);
    }

    #[test]
    fn early_exit_summary_names_stage_and_reason() {
        let exit = EarlyExit::new(ExitStage::SupportResistance, ExitReason::NoSupportResistance);
        assert_eq!(exit.summary(), "support_resistance: no_support_resistance");
        assert!(!exit.user_message.is_empty());
        assert!(!exit.suggestions.is_empty());
    }

    #[test]
    fn stage_and_reason_serialize_snake_case() {
        let stage = serde_json::to_string(&ExitStage::LeverageDecision).unwrap();
        assert_eq!(stage, "\"leverage_decision\"");
        let reason = serde_json::to_string(&ExitReason::InsufficientData).unwrap();
        assert_eq!(reason, "\"insufficient_data\"");
    }

    #[test]
    fn trade_record_round_trips_through_json() {
        let trade = TradeRecord {
            entry_time: Utc::now(),
            exit_time: Utc::now(),
            entry_price: 100.0,
            exit_price: 105.0,
            take_profit_price: 105.0,
            stop_loss_price: 98.0,
            leverage: 5.0,
            pnl_pct: 0.25,
            confidence: 0.8,
            outcome: Outcome::Profit,
            strategy: "Balanced".to_string(),
            price_consistency_score: 1.0,
            price_validation_level: ValidationLevel::Normal,
            backtest_validation_severity: ValidationLevel::Normal,
            analysis_price: 100.0,
        };
        let json = serde_json::to_string(&trade).unwrap();
        let back: TradeRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, trade);
    }
}
