use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

use super::types::ValidationLevel;
use crate::market::Timeframe;

const MINUTES_PER_YEAR: f64 = 365.0 * 24.0 * 60.0;

/// Outcome of comparing an analysis-time price against the realized entry
/// price.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceConsistencyResult {
    pub is_consistent: bool,
    pub level: ValidationLevel,
    pub diff_pct: f64,
    pub reference_price: f64,
    pub comparison_price: f64,
    pub message: String,
    pub recommendations: Vec<String>,
}

/// Canonical record tying the two price observations of a trade together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedPriceRecord {
    pub analysis_price: f64,
    pub entry_price: f64,
    pub market_timestamp: DateTime<Utc>,
    pub analysis_timestamp: DateTime<Utc>,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub source: String,
    /// 1.0 = bit-exact agreement, 0.0 = unusable.
    pub consistency_score: f64,
}

/// Verdict over a whole simulated trade.
#[derive(Debug, Clone, PartialEq)]
pub struct BacktestValidation {
    pub is_valid: bool,
    pub severity: ValidationLevel,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
    pub profit_pct: f64,
    pub annualized_pct: f64,
    pub duration_minutes: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationSummary {
    pub total: usize,
    pub consistent_count: usize,
    /// Percent of validations at normal or warning level.
    pub consistency_rate: f64,
    pub avg_diff_pct: f64,
    pub level_counts: BTreeMap<ValidationLevel, usize>,
    pub window_hours: i64,
}

#[derive(Debug, Clone)]
struct HistoryEntry {
    observed_at: DateTime<Utc>,
    level: ValidationLevel,
    diff_pct: f64,
}

/// Price-consistency and trade-realism validator.
///
/// Thresholds classify the relative divergence between the analyzer's price
/// and the realized entry price: <1% normal, <5% warning (still consistent),
/// <10% error, otherwise critical. Zero or negative prices are critical
/// outright.
#[derive(Debug)]
pub struct PriceValidator {
    warning_threshold_pct: f64,
    error_threshold_pct: f64,
    critical_threshold_pct: f64,
    history: Mutex<Vec<HistoryEntry>>,
}

impl Default for PriceValidator {
    fn default() -> Self {
        Self::new(1.0, 5.0, 10.0)
    }
}

impl PriceValidator {
    pub fn new(warning_pct: f64, error_pct: f64, critical_pct: f64) -> Self {
        Self {
            warning_threshold_pct: warning_pct,
            error_threshold_pct: error_pct,
            critical_threshold_pct: critical_pct,
            history: Mutex::new(Vec::new()),
        }
    }

    /// Classify `analysis_price` vs `entry_price`. `observed_at` stamps the
    /// rolling history; the backtest loop passes the evaluation timestamp so
    /// replays stay deterministic.
    pub fn validate(
        &self,
        analysis_price: f64,
        entry_price: f64,
        context: &str,
        observed_at: DateTime<Utc>,
    ) -> PriceConsistencyResult {
        let result = if analysis_price <= 0.0 || entry_price <= 0.0 {
            PriceConsistencyResult {
                is_consistent: false,
                level: ValidationLevel::Critical,
                diff_pct: f64::INFINITY,
                reference_price: analysis_price,
                comparison_price: entry_price,
                message: format!("non-positive price data ({context})"),
                recommendations: vec![
                    "Check the market-data source".to_string(),
                    "Verify the exchange API response".to_string(),
                ],
            }
        } else {
            let diff_pct = (analysis_price - entry_price).abs() / analysis_price * 100.0;
            let (level, is_consistent, recommendations) = self.classify(diff_pct);
            PriceConsistencyResult {
                is_consistent,
                level,
                diff_pct,
                reference_price: analysis_price,
                comparison_price: entry_price,
                message: format!("price consistency {level} (diff {diff_pct:.2}%, {context})"),
                recommendations,
            }
        };

        self.history
            .lock()
            .expect("validator history lock")
            .push(HistoryEntry {
                observed_at,
                level: result.level,
                diff_pct: if result.diff_pct.is_finite() {
                    result.diff_pct
                } else {
                    100.0
                },
            });

        result
    }

    fn classify(&self, diff_pct: f64) -> (ValidationLevel, bool, Vec<String>) {
        if diff_pct < self.warning_threshold_pct {
            (ValidationLevel::Normal, true, vec![])
        } else if diff_pct < self.error_threshold_pct {
            (
                ValidationLevel::Warning,
                true,
                vec!["Check price-data timestamps for skew".to_string()],
            )
        } else if diff_pct < self.critical_threshold_pct {
            (
                ValidationLevel::Error,
                false,
                vec![
                    "Confirm both prices come from the same source".to_string(),
                    "Check timezone handling".to_string(),
                ],
            )
        } else {
            (
                ValidationLevel::Critical,
                false,
                vec![
                    "Inspect the price-data pipeline".to_string(),
                    "Do not act on this analysis".to_string(),
                ],
            )
        }
    }

    /// Consistency score for the unified record: 1.0 / 0.8 / 0.5 / 0.0 by
    /// the same thresholds.
    pub fn consistency_score(&self, analysis_price: f64, entry_price: f64) -> f64 {
        if analysis_price <= 0.0 || entry_price <= 0.0 {
            return 0.0;
        }
        let diff_pct = (analysis_price - entry_price).abs() / analysis_price * 100.0;
        if diff_pct < self.warning_threshold_pct {
            1.0
        } else if diff_pct < self.error_threshold_pct {
            0.8
        } else if diff_pct < self.critical_threshold_pct {
            0.5
        } else {
            0.0
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn unified_record(
        &self,
        analysis_price: f64,
        entry_price: f64,
        symbol: &str,
        timeframe: Timeframe,
        market_timestamp: DateTime<Utc>,
        analysis_timestamp: DateTime<Utc>,
        source: &str,
    ) -> UnifiedPriceRecord {
        UnifiedPriceRecord {
            analysis_price,
            entry_price,
            market_timestamp,
            analysis_timestamp,
            symbol: symbol.to_string(),
            timeframe,
            source: source.to_string(),
            consistency_score: self.consistency_score(analysis_price, entry_price),
        }
    }

    /// Whole-trade realism check. Hard invariant violations and impossible
    /// short-duration moves are critical; a critical verdict aborts the
    /// analysis. An outsized annualized figure on its own is only an error.
    pub fn validate_backtest(
        &self,
        entry_price: f64,
        stop_loss_price: f64,
        take_profit_price: f64,
        exit_price: f64,
        duration_minutes: i64,
        symbol: &str,
    ) -> BacktestValidation {
        let mut issues = Vec::new();
        let mut warnings = Vec::new();
        let mut severity = ValidationLevel::Normal;
        fn raise(sev: &mut ValidationLevel, to: ValidationLevel) {
            if to > *sev {
                *sev = to;
            }
        }

        if stop_loss_price >= entry_price {
            issues.push(format!(
                "stop loss {stop_loss_price:.6} >= entry {entry_price:.6}"
            ));
            raise(&mut severity, ValidationLevel::Critical);
        }
        if take_profit_price <= entry_price {
            issues.push(format!(
                "take profit {take_profit_price:.6} <= entry {entry_price:.6}"
            ));
            raise(&mut severity, ValidationLevel::Critical);
        }
        if stop_loss_price >= take_profit_price {
            issues.push(format!(
                "stop loss {stop_loss_price:.6} >= take profit {take_profit_price:.6}"
            ));
            raise(&mut severity, ValidationLevel::Critical);
        }

        let profit_pct = (exit_price - entry_price) / entry_price * 100.0;
        let annualized_pct = if duration_minutes > 0 {
            profit_pct * (MINUTES_PER_YEAR / duration_minutes as f64)
        } else {
            0.0
        };

        if duration_minutes < 1 {
            issues.push(format!("trade duration {duration_minutes}min < 1min"));
            raise(&mut severity, ValidationLevel::Critical);
        } else {
            if duration_minutes < 60 && profit_pct.abs() > 20.0 {
                issues.push(format!(
                    "{profit_pct:.1}% move in under an hour ({symbol})"
                ));
                raise(&mut severity, ValidationLevel::Critical);
            }
            if duration_minutes < 120 && profit_pct.abs() > 40.0 {
                issues.push(format!(
                    "{profit_pct:.1}% move in under two hours ({symbol})"
                ));
                raise(&mut severity, ValidationLevel::Critical);
            }
            // A steep annualized figure alone is suspicious, not fatal:
            // short winners annualize astronomically by construction.
            if annualized_pct > 1000.0 {
                issues.push(format!("annualized return {annualized_pct:.0}%"));
                raise(&mut severity, ValidationLevel::Error);
            }
            if duration_minutes > 10_080 {
                warnings.push(format!("trade open for {duration_minutes}min (> 1 week)"));
                raise(&mut severity, ValidationLevel::Warning);
            }
        }

        let prices = [entry_price, stop_loss_price, take_profit_price, exit_price];
        let max_price = prices.iter().copied().fold(f64::MIN, f64::max);
        let min_price = prices.iter().copied().fold(f64::MAX, f64::min);
        if min_price > 0.0 && max_price / min_price > 3.0 {
            warnings.push(format!(
                "price range unusually wide (max {max_price:.4} / min {min_price:.4})"
            ));
            raise(&mut severity, ValidationLevel::Warning);
        }

        BacktestValidation {
            is_valid: issues.is_empty(),
            severity,
            issues,
            warnings,
            profit_pct,
            annualized_pct,
            duration_minutes,
        }
    }

    /// Summary of validations observed within the trailing window.
    pub fn summary(&self, window_hours: i64) -> ValidationSummary {
        let history = self.history.lock().expect("validator history lock");
        let cutoff = history
            .iter()
            .map(|e| e.observed_at)
            .max()
            .map(|latest| latest - Duration::hours(window_hours));

        let recent: Vec<&HistoryEntry> = match cutoff {
            Some(cutoff) => history.iter().filter(|e| e.observed_at > cutoff).collect(),
            None => Vec::new(),
        };

        let mut level_counts = BTreeMap::new();
        for e in &recent {
            *level_counts.entry(e.level).or_insert(0) += 1;
        }
        let consistent_count = level_counts.get(&ValidationLevel::Normal).copied().unwrap_or(0)
            + level_counts.get(&ValidationLevel::Warning).copied().unwrap_or(0);
        let total = recent.len();
        let consistency_rate = if total > 0 {
            consistent_count as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        let avg_diff_pct = if total > 0 {
            recent.iter().map(|e| e.diff_pct).sum::<f64>() / total as f64
        } else {
            0.0
        };

        ValidationSummary {
            total,
            consistent_count,
            consistency_rate,
            avg_diff_pct,
            level_counts,
            window_hours,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn identical_prices_are_normal_with_zero_diff() {
        let v = PriceValidator::default();
        let r = v.validate(50_000.0, 50_000.0, "t", now());
        assert_eq!(r.level, ValidationLevel::Normal);
        assert!(r.is_consistent);
        assert_eq!(r.diff_pct, 0.0);
    }

    #[test]
    fn warning_band_remains_consistent() {
        let v = PriceValidator::default();
        let r = v.validate(50_000.0, 51_500.0, "t", now()); // 3%
        assert_eq!(r.level, ValidationLevel::Warning);
        assert!(r.is_consistent);
    }

    #[test]
    fn error_band_is_inconsistent() {
        let v = PriceValidator::default();
        let r = v.validate(100.0, 107.0, "t", now()); // 7%
        assert_eq!(r.level, ValidationLevel::Error);
        assert!(!r.is_consistent);
    }

    #[test]
    fn large_divergence_is_critical() {
        let v = PriceValidator::default();
        let r = v.validate(3950.0, 5739.36, "eth_anomaly", now());
        assert_eq!(r.level, ValidationLevel::Critical);
        assert!(!r.is_consistent);
        assert!(r.diff_pct > 10.0);
    }

    #[test]
    fn zero_price_is_critical() {
        let v = PriceValidator::default();
        let r = v.validate(0.0, 100.0, "t", now());
        assert_eq!(r.level, ValidationLevel::Critical);
        assert!(!r.is_consistent);
    }

    #[test]
    fn consistency_scores_follow_thresholds() {
        let v = PriceValidator::default();
        assert_eq!(v.consistency_score(100.0, 100.2), 1.0);
        assert_eq!(v.consistency_score(100.0, 103.0), 0.8);
        assert_eq!(v.consistency_score(100.0, 107.0), 0.5);
        assert_eq!(v.consistency_score(100.0, 150.0), 0.0);
        assert_eq!(v.consistency_score(-1.0, 100.0), 0.0);
    }

    #[test]
    fn backtest_rejects_inverted_levels() {
        let v = PriceValidator::default();
        let r = v.validate_backtest(1932.0, 2578.0, 2782.0, 2812.0, 50, "ETH");
        assert!(!r.is_valid);
        assert_eq!(r.severity, ValidationLevel::Critical);
        assert!(r.issues.iter().any(|i| i.contains("stop loss")));
    }

    #[test]
    fn backtest_flags_unrealistic_hourly_profit() {
        let v = PriceValidator::default();
        // +25% in 30 minutes with otherwise sane levels.
        let r = v.validate_backtest(100.0, 95.0, 130.0, 125.0, 30, "X");
        assert!(!r.is_valid);
        assert_eq!(r.severity, ValidationLevel::Critical);
    }

    #[test]
    fn backtest_flags_sub_minute_duration() {
        let v = PriceValidator::default();
        let r = v.validate_backtest(100.0, 98.0, 104.0, 104.0, 0, "X");
        assert!(!r.is_valid);
        assert_eq!(r.severity, ValidationLevel::Critical);
    }

    #[test]
    fn modest_trade_passes() {
        // +1% over three days: ~122% annualized, well inside realism bounds.
        let v = PriceValidator::default();
        let r = v.validate_backtest(100.0, 97.0, 105.0, 101.0, 4320, "X");
        assert!(r.is_valid, "issues: {:?}", r.issues);
        assert_eq!(r.severity, ValidationLevel::Normal);
    }

    #[test]
    fn fast_take_profit_annualizes_to_error_not_critical() {
        // +4.7% in an hour annualizes far beyond 1000%, which is flagged
        // but never a hard abort on its own.
        let v = PriceValidator::default();
        let r = v.validate_backtest(100.0, 97.5, 104.7, 104.7, 60, "X");
        assert!(!r.is_valid);
        assert_eq!(r.severity, ValidationLevel::Error);
    }

    #[test]
    fn breakeven_trade_is_always_clean() {
        let v = PriceValidator::default();
        let r = v.validate_backtest(100.0, 97.0, 105.0, 100.0, 120, "X");
        assert!(r.is_valid);
        assert_eq!(r.profit_pct, 0.0);
    }

    #[test]
    fn summary_counts_levels_in_window() {
        let v = PriceValidator::default();
        let t0 = now();
        v.validate(100.0, 100.1, "a", t0);
        v.validate(100.0, 103.0, "b", t0);
        v.validate(100.0, 150.0, "c", t0);
        let s = v.summary(24);
        assert_eq!(s.total, 3);
        assert_eq!(s.consistent_count, 2);
        assert!((s.consistency_rate - 66.666).abs() < 0.1);
        assert_eq!(s.level_counts[&ValidationLevel::Critical], 1);
    }

    #[test]
    fn summary_window_excludes_old_entries() {
        let v = PriceValidator::default();
        let t0 = now();
        v.validate(100.0, 100.1, "old", t0 - Duration::hours(48));
        v.validate(100.0, 100.1, "new", t0);
        let s = v.summary(24);
        assert_eq!(s.total, 1);
    }
}
