use chrono::{DateTime, Duration, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::decision::{DecisionArtifacts, LeverageDecisionEngine};
use super::entry::{self, EntrySignal};
use super::exits::resolve_exit;
use super::metrics::calculate_metrics;
use super::sltp::{self, SltpInputs};
use super::types::{
    AnalysisResult, ExitReason, ExitStage, Outcome, TradeRecord, ValidationLevel,
};
use super::validator::PriceValidator;
use crate::config::{ConfigError, ConfigStore, StrictnessLevel, TimeframeConfig};
use crate::market::context::{ContextError, MarketContextAnalyzer};
use crate::market::{align_evaluation_start, CandleSeries, Timeframe};
use crate::providers::{BtcCorrelationProvider, MlPredictor, SupportResistanceProvider};

/// Hard ceiling on evaluations per analysis, regardless of window size.
const MAX_EVALUATIONS_CEILING: usize = 5000;
/// Fraction of available candles the evaluation budget may cover.
const EVALUATION_COVERAGE: f64 = 0.8;

/// Env var carrying a user-specified analysis window into worker processes.
pub const CUSTOM_PERIOD_ENV: &str = "CUSTOM_PERIOD_SETTINGS";

#[derive(Debug, Error)]
pub enum BacktestError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("critical backtest validation for {symbol}: {issues:?}")]
    CriticalValidation { symbol: String, issues: Vec<String> },
}

/// A user-specified analysis window.
#[derive(Debug, Clone, Copy, PartialEq, Validate)]
pub struct CustomPeriod {
    #[garde(skip)]
    pub start: DateTime<Utc>,
    #[garde(custom(after_start(&self.start)))]
    pub end: DateTime<Utc>,
}

fn after_start(start: &DateTime<Utc>) -> impl FnOnce(&DateTime<Utc>, &()) -> garde::Result + '_ {
    move |end: &DateTime<Utc>, (): &()| {
        if end <= start {
            return Err(garde::Error::new(format!(
                "period end ({end}) must be after start ({start})"
            )));
        }
        Ok(())
    }
}

/// Wire form of `CUSTOM_PERIOD_SETTINGS`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CustomPeriodSettings {
    mode: String,
    start_date: DateTime<Utc>,
    end_date: DateTime<Utc>,
}

impl CustomPeriod {
    /// Parse the well-known env var; `None` when unset or not in custom
    /// mode. Malformed JSON is reported, not swallowed into a default.
    pub fn from_env() -> Result<Option<Self>, serde_json::Error> {
        let Ok(raw) = std::env::var(CUSTOM_PERIOD_ENV) else {
            return Ok(None);
        };
        let settings: CustomPeriodSettings = serde_json::from_str(&raw)?;
        if settings.mode != "custom" {
            return Ok(None);
        }
        Ok(Some(Self {
            start: settings.start_date,
            end: settings.end_date,
        }))
    }
}

/// One backtest request as accepted from the outside.
#[derive(Debug, Clone, Validate)]
pub struct BacktestRequest {
    #[garde(length(min = 1))]
    pub symbol: String,
    #[garde(skip)]
    pub timeframe: Timeframe,
    #[garde(length(min = 1))]
    pub strategy: String,
    #[garde(length(min = 1))]
    pub execution_id: String,
    #[garde(dive)]
    pub custom_period: Option<CustomPeriod>,
}

/// Fetch and evaluation bounds for one analysis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalysisWindow {
    /// Extended backwards so level detection has prior candles at the first
    /// evaluation timestamp.
    pub fetch_start: DateTime<Utc>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// Resolve the analysis window from the timeframe config, an optional
/// custom period, and an explicit `now` (the loop itself never reads the
/// clock).
pub fn plan_window(
    tf_config: &TimeframeConfig,
    timeframe: Timeframe,
    lookback_candles: i64,
    now: DateTime<Utc>,
    custom: Option<&CustomPeriod>,
) -> AnalysisWindow {
    let lookback_minutes = lookback_candles * timeframe.interval_minutes();
    let lookback_days = (lookback_minutes as f64 / 1440.0).ceil() as i64;

    let (start_time, end_time) = match custom {
        Some(period) => (period.start, period.end),
        None => (now - Duration::days(tf_config.data_days), now),
    };

    AnalysisWindow {
        fetch_start: start_time - Duration::days(lookback_days),
        start_time,
        end_time,
    }
}

/// Evaluation budget: at least the configured floor, at most 80% of the
/// window's candles, hard-capped at 5000.
pub fn evaluation_budget(
    tf_config: &TimeframeConfig,
    timeframe: Timeframe,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
) -> usize {
    let total_minutes = (end_time - start_time).num_minutes().max(0);
    let coverage =
        (total_minutes as f64 / timeframe.interval_minutes() as f64 * EVALUATION_COVERAGE) as usize;
    coverage.max(tf_config.max_evaluations).min(MAX_EVALUATIONS_CEILING)
}

/// Per-analysis backtest driver.
///
/// Owns nothing global: providers and analyzer are injected, configuration
/// is read from the store, and each call consumes its own candle series.
/// The window is moved in and dropped on return, so no data can leak into
/// another analysis.
pub struct BacktestRunner {
    analyzer: Arc<dyn MarketContextAnalyzer>,
    support_resistance: Arc<dyn SupportResistanceProvider>,
    ml: Arc<dyn MlPredictor>,
    correlation: Arc<dyn BtcCorrelationProvider>,
    validator: Arc<PriceValidator>,
}

impl BacktestRunner {
    pub fn new(
        analyzer: Arc<dyn MarketContextAnalyzer>,
        support_resistance: Arc<dyn SupportResistanceProvider>,
        ml: Arc<dyn MlPredictor>,
        correlation: Arc<dyn BtcCorrelationProvider>,
        validator: Arc<PriceValidator>,
    ) -> Self {
        Self {
            analyzer,
            support_resistance,
            ml,
            correlation,
            validator,
        }
    }

    /// Walk the timeline candle-by-candle and produce the analysis result.
    ///
    /// The series is consumed: ownership guarantees no cross-analysis reuse.
    #[allow(clippy::too_many_lines)]
    pub fn run(
        &self,
        request: &BacktestRequest,
        series: CandleSeries,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        level: StrictnessLevel,
        config: &ConfigStore,
    ) -> Result<AnalysisResult, BacktestError> {
        let timeframe = request.timeframe;
        let tf_config = config.timeframe(timeframe)?;
        let strategy = config.strategy(&request.strategy)?;
        let conditions =
            config.effective_entry_conditions(timeframe, &request.strategy, level)?;
        let constants = config.leverage_engine();
        let min_candles = config.risk_management().min_detection_candles;

        if series.len() < min_candles {
            return Ok(AnalysisResult::early(
                ExitStage::DataFetch,
                ExitReason::InsufficientData,
            ));
        }

        let engine = LeverageDecisionEngine::new(
            Arc::clone(&self.support_resistance),
            Arc::clone(&self.ml),
            Arc::clone(&self.correlation),
            strategy.sltp_calculator,
        );

        let effective_start = start_time.max(series.first().timestamp);
        let aligned_start =
            align_evaluation_start(effective_start, tf_config.evaluation_interval_minutes);
        if aligned_start > effective_start {
            debug!(%effective_start, %aligned_start, "evaluation start aligned forward");
        }
        let budget = evaluation_budget(tf_config, timeframe, start_time, end_time);

        let mut trades: Vec<TradeRecord> = Vec::new();
        let mut evaluations = 0usize;
        let mut skipped = 0usize;

        for candle in series
            .candles()
            .iter()
            .filter(|c| c.timestamp >= aligned_start && c.timestamp <= end_time)
        {
            if evaluations >= budget {
                debug!(budget, "evaluation budget exhausted");
                break;
            }
            evaluations += 1;
            let t = candle.timestamp;

            // 1. Market context at t. Gapped data fails the iteration only.
            let context = match self.analyzer.analyze(&series, t, false) {
                Ok(ctx) => ctx,
                Err(ContextError::NoMatchingCandle { gap_minutes, .. }) => {
                    warn!(%t, gap_minutes, "no candle within tolerance; skipping evaluation");
                    skipped += 1;
                    continue;
                }
                Err(ContextError::InsufficientHistory { .. }) => {
                    skipped += 1;
                    continue;
                }
            };

            // 2. Leverage decision. The first early exit terminates the
            //    analysis; its stage and reason surface to the user.
            let visible = series.up_to(t);
            let DecisionArtifacts {
                decision,
                supports,
                resistances,
            } = match engine.decide(visible, &context, &conditions, constants) {
                Ok(artifacts) => artifacts,
                Err(exit) => {
                    info!(%t, stage = exit.stage.as_str(), reason = exit.reason.as_str(),
                          "early exit");
                    return Ok(AnalysisResult::EarlyExit(exit));
                }
            };

            // 3. Entry gate.
            let signal = EntrySignal {
                leverage: Some(decision.leverage),
                confidence_pct: Some(decision.confidence),
                risk_reward: Some(decision.risk_reward),
                current_price: Some(decision.current_price),
            };
            match entry::evaluate(&signal, &conditions) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(%t, error = %e, "entry evaluation rejected signal");
                    continue;
                }
            }

            // 4. Source-of-truth entry price: the candle's own open.
            //    Recompute TP/SL with it as base and re-check ordering.
            let entry_price = candle.open;
            let Some(levels) = sltp::calculate(
                strategy.sltp_calculator,
                &SltpInputs {
                    entry_price,
                    supports: &supports,
                    resistances: &resistances,
                    context: &context,
                    constants,
                },
            ) else {
                warn!(%t, "no SL/TP at entry price; skipping");
                continue;
            };
            if levels.stop_loss_price >= entry_price || levels.take_profit_price <= entry_price {
                warn!(
                    %t,
                    sl = levels.stop_loss_price,
                    tp = levels.take_profit_price,
                    entry_price,
                    "long ordering violated at entry price; skipping"
                );
                continue;
            }

            // 5. Analysis-vs-entry price consistency.
            let consistency = self.validator.validate(
                decision.current_price,
                entry_price,
                &format!("{}_{}_{}", request.symbol, timeframe, request.strategy),
                t,
            );
            if consistency.level == ValidationLevel::Critical {
                warn!(%t, diff_pct = consistency.diff_pct, "critical price inconsistency; skipping trade");
                continue;
            }

            // 6. Exit resolution over post-entry candles.
            let exit = resolve_exit(
                &series,
                t,
                entry_price,
                levels.take_profit_price,
                levels.stop_loss_price,
            );

            let pnl_pct = (exit.exit_price - entry_price) / entry_price * decision.leverage;
            let duration_minutes = (exit.exit_time - t).num_minutes();

            // 7. Whole-trade realism. Critical aborts the analysis so
            //    downstream consumers never see nonsense ledgers.
            let backtest_validation = self.validator.validate_backtest(
                entry_price,
                levels.stop_loss_price,
                levels.take_profit_price,
                exit.exit_price,
                duration_minutes,
                &request.symbol,
            );
            if backtest_validation.severity == ValidationLevel::Critical {
                return Err(BacktestError::CriticalValidation {
                    symbol: request.symbol.clone(),
                    issues: backtest_validation.issues,
                });
            }

            trades.push(TradeRecord {
                entry_time: t,
                exit_time: exit.exit_time,
                entry_price,
                exit_price: exit.exit_price,
                take_profit_price: levels.take_profit_price,
                stop_loss_price: levels.stop_loss_price,
                leverage: decision.leverage,
                pnl_pct: if exit.outcome == Outcome::Breakeven {
                    0.0
                } else {
                    pnl_pct
                },
                confidence: decision.confidence / 100.0,
                outcome: exit.outcome,
                strategy: request.strategy.clone(),
                price_consistency_score: self
                    .validator
                    .consistency_score(decision.current_price, entry_price),
                price_validation_level: consistency.level,
                backtest_validation_severity: backtest_validation.severity,
                analysis_price: decision.current_price,
            });
        }

        info!(
            symbol = %request.symbol,
            timeframe = %timeframe,
            strategy = %request.strategy,
            evaluations,
            skipped,
            trades = trades.len(),
            "backtest walk finished"
        );

        let metrics = calculate_metrics(&trades);
        Ok(AnalysisResult::Completed { trades, metrics })
    }
}
