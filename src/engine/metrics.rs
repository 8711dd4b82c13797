use statrs::statistics::Statistics;

use super::types::{AnalysisMetrics, Outcome, TradeRecord, ValidationLevel};

pub(crate) const EMPTY_METRICS: AnalysisMetrics = AnalysisMetrics {
    total_trades: 0,
    win_rate: 0.0,
    total_return: 0.0,
    sharpe_ratio: 0.0,
    max_drawdown: 0.0,
    avg_leverage: 0.0,
    breakeven_trades: 0,
    decisive_trades: 0,
    breakeven_rate: 0.0,
    avg_price_consistency: 1.0,
    critical_price_issues: 0,
    critical_backtest_issues: 0,
};

/// Aggregate a trade ledger into analysis metrics.
///
/// Breakeven trades count toward trade density (`total_trades`,
/// `breakeven_rate`) but not toward directional performance: the win-rate
/// denominator is the decisive trades only, and a pure-breakeven ledger
/// reports `win_rate = 0`, `breakeven_rate = 1`.
pub fn calculate_metrics(trades: &[TradeRecord]) -> AnalysisMetrics {
    if trades.is_empty() {
        return EMPTY_METRICS;
    }

    let total = trades.len();
    let wins = trades.iter().filter(|t| t.outcome == Outcome::Profit).count();
    let breakevens = trades
        .iter()
        .filter(|t| t.outcome == Outcome::Breakeven)
        .count();
    let decisive = total - breakevens;

    let win_rate = if decisive > 0 {
        wins as f64 / decisive as f64
    } else {
        0.0
    };

    let returns: Vec<f64> = trades.iter().map(|t| t.pnl_pct).collect();
    let total_return: f64 = returns.iter().sum();

    let std = returns.iter().population_std_dev();
    let sharpe_ratio = if std > 0.0 {
        returns.iter().mean() / std
    } else {
        0.0
    };

    // Running min of (cumulative return − running max); <= 0, in return-sum
    // space rather than a ratio, so non-positive peaks cannot blow it up.
    let mut cumulative = 0.0;
    let mut peak = 0.0f64;
    let mut max_drawdown = 0.0f64;
    for r in &returns {
        cumulative += r;
        peak = peak.max(cumulative);
        max_drawdown = max_drawdown.min(cumulative - peak);
    }

    let avg_leverage = trades.iter().map(|t| t.leverage).mean();
    let avg_price_consistency = trades.iter().map(|t| t.price_consistency_score).mean();
    let critical_price_issues = trades
        .iter()
        .filter(|t| t.price_validation_level == ValidationLevel::Critical)
        .count();
    let critical_backtest_issues = trades
        .iter()
        .filter(|t| t.backtest_validation_severity == ValidationLevel::Critical)
        .count();

    AnalysisMetrics {
        total_trades: total,
        win_rate,
        total_return,
        sharpe_ratio,
        max_drawdown,
        avg_leverage,
        breakeven_trades: breakevens,
        decisive_trades: decisive,
        breakeven_rate: breakevens as f64 / total as f64,
        avg_price_consistency,
        critical_price_issues,
        critical_backtest_issues,
    }
}
