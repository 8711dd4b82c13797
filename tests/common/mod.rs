#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use polars::prelude::DataFrame;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use levtrader::config::ConfigStore;
use levtrader::engine::backtest::BacktestRunner;
use levtrader::engine::types::{BtcCorrelation, MlPrediction, PriceLevel};
use levtrader::engine::validator::PriceValidator;
use levtrader::market::context::{ContextError, DefaultContextAnalyzer, MarketContextAnalyzer};
use levtrader::market::fetcher::OhlcvFetcher;
use levtrader::market::frame::dataframe_from_candles;
use levtrader::market::{Candle, CandleSeries, Timeframe};
use levtrader::notify::{EarlyExitNotification, Notifier};
use levtrader::orchestrator::{NeverCancelled, Orchestrator, OrchestratorOptions};
use levtrader::providers::{
    BtcCorrelationProvider, MlPredictor, ProviderError, SupportResistanceProvider,
};
use levtrader::store::db::AnalysisDb;
use levtrader::store::ledger::TradeLedger;
use levtrader::store::progress::ProgressTracker;
use levtrader::store::StorePaths;

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// `n` hourly candles climbing linearly from `start_price` by `step` per
/// candle, with a ±0.5% wick envelope.
pub fn ascending_candles(n: i64, start_price: f64, step: f64) -> Vec<Candle> {
    (0..n)
        .map(|i| {
            let open = start_price + step * i as f64;
            Candle {
                timestamp: base_time() + Duration::hours(i),
                open,
                high: open * 1.005,
                low: open * 0.995,
                close: open + step * 0.5,
                volume: 1000.0,
            }
        })
        .collect()
}

/// `n` hourly candles pinned flat at `price`.
pub fn flat_candles(n: i64, price: f64) -> Vec<Candle> {
    (0..n)
        .map(|i| Candle {
            timestamp: base_time() + Duration::hours(i),
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 1000.0,
        })
        .collect()
}

/// Fetcher over canned candle vectors, keyed by symbol.
pub struct StubFetcher {
    data: HashMap<String, Vec<Candle>>,
}

impl StubFetcher {
    pub fn new() -> Self {
        Self {
            data: HashMap::new(),
        }
    }

    pub fn with_symbol(mut self, symbol: &str, candles: Vec<Candle>) -> Self {
        self.data.insert(symbol.to_string(), candles);
        self
    }
}

#[async_trait]
impl OhlcvFetcher for StubFetcher {
    async fn fetch(
        &self,
        symbol: &str,
        _timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<DataFrame> {
        let candles = self.data.get(symbol).cloned().unwrap_or_default();
        let window: Vec<Candle> = candles
            .into_iter()
            .filter(|c| c.timestamp >= start && c.timestamp <= end)
            .collect();
        Ok(dataframe_from_candles(&window)?)
    }
}

/// Support at entry×0.98 and resistance at entry×1.05, like a market that
/// keeps respecting the same relative structure.
pub struct RelativeLevels;

impl SupportResistanceProvider for RelativeLevels {
    fn detect_levels(
        &self,
        _window: &[Candle],
        current_price: f64,
    ) -> Result<(Vec<PriceLevel>, Vec<PriceLevel>), ProviderError> {
        Ok((
            vec![PriceLevel {
                price: current_price * 0.98,
                strength: 0.9,
                touch_count: 4,
                ml_bounce_probability: Some(0.7),
            }],
            vec![PriceLevel {
                price: current_price * 1.05,
                strength: 0.8,
                touch_count: 3,
                ml_bounce_probability: None,
            }],
        ))
    }
}

/// Structure that clears every safety gate but leaves constrained leverage
/// under the entry floor, so evaluations reject without early-exiting.
pub struct WeakLevels;

impl SupportResistanceProvider for WeakLevels {
    fn detect_levels(
        &self,
        _window: &[Candle],
        current_price: f64,
    ) -> Result<(Vec<PriceLevel>, Vec<PriceLevel>), ProviderError> {
        Ok((
            vec![PriceLevel {
                price: current_price * 0.96,
                strength: 0.9,
                touch_count: 4,
                ml_bounce_probability: Some(0.7),
            }],
            vec![PriceLevel {
                price: current_price * 1.10,
                strength: 0.8,
                touch_count: 3,
                ml_bounce_probability: None,
            }],
        ))
    }
}

/// A provider that finds nothing: the no-structure market.
pub struct NoLevels;

impl SupportResistanceProvider for NoLevels {
    fn detect_levels(
        &self,
        _window: &[Candle],
        _current_price: f64,
    ) -> Result<(Vec<PriceLevel>, Vec<PriceLevel>), ProviderError> {
        Ok((vec![], vec![]))
    }
}

pub struct StubMl;

impl MlPredictor for StubMl {
    fn predict(&self, _window: &[Candle]) -> Result<MlPrediction, ProviderError> {
        Ok(MlPrediction {
            breakout_prob: 0.7,
            bounce_prob: 0.3,
            confidence: 0.8,
        })
    }
}

pub struct StubCorrelation;

impl BtcCorrelationProvider for StubCorrelation {
    fn correlation(&self, _window: &[Candle]) -> Result<BtcCorrelation, ProviderError> {
        Ok(BtcCorrelation {
            strength: 0.5,
            expected_downside: 0.05,
        })
    }
}

/// Delegating analyzer that records every (target, current_price) pair it
/// hands out, for look-ahead probes.
pub struct SpyAnalyzer {
    inner: DefaultContextAnalyzer,
    pub observed: Mutex<Vec<(DateTime<Utc>, f64)>>,
}

impl SpyAnalyzer {
    pub fn new() -> Self {
        Self {
            inner: DefaultContextAnalyzer,
            observed: Mutex::new(Vec::new()),
        }
    }
}

impl MarketContextAnalyzer for SpyAnalyzer {
    fn analyze(
        &self,
        series: &CandleSeries,
        target: DateTime<Utc>,
        is_realtime: bool,
    ) -> Result<levtrader::engine::types::MarketContext, ContextError> {
        let ctx = self.inner.analyze(series, target, is_realtime)?;
        self.observed
            .lock()
            .unwrap()
            .push((target, ctx.current_price));
        Ok(ctx)
    }
}

/// Notifier that captures payloads for assertions.
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<EarlyExitNotification>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify_early_exit(&self, notification: &EarlyExitNotification) {
        self.sent.lock().unwrap().push(notification.clone());
    }
}

/// Everything an end-to-end scenario needs, rooted in one temp directory.
pub struct Harness {
    pub _dir: tempfile::TempDir,
    pub config: Arc<ConfigStore>,
    pub db: Arc<AnalysisDb>,
    pub ledger: Arc<TradeLedger>,
    pub progress: Arc<ProgressTracker>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Harness {
    pub fn new() -> Self {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let paths = StorePaths::resolve(dir.path().join("analysis")).unwrap();
        paths.ensure_dirs().unwrap();
        let config = Arc::new(ConfigStore::load_from_dir("config").unwrap());
        let db = Arc::new(AnalysisDb::open(&paths).unwrap());
        let ledger = Arc::new(TradeLedger::new(&paths));
        let progress =
            Arc::new(ProgressTracker::with_dir(dir.path().join("progress")).unwrap());
        Self {
            _dir: dir,
            config,
            db,
            ledger,
            progress,
            notifier: Arc::new(RecordingNotifier::default()),
        }
    }

    pub fn runner(
        &self,
        support_resistance: Arc<dyn SupportResistanceProvider>,
    ) -> Arc<BacktestRunner> {
        Arc::new(BacktestRunner::new(
            Arc::new(DefaultContextAnalyzer),
            support_resistance,
            Arc::new(StubMl),
            Arc::new(StubCorrelation),
            Arc::new(PriceValidator::default()),
        ))
    }

    pub fn orchestrator(
        &self,
        fetcher: Arc<dyn OhlcvFetcher>,
        support_resistance: Arc<dyn SupportResistanceProvider>,
    ) -> Orchestrator {
        Orchestrator::new(
            Arc::clone(&self.config),
            Arc::clone(&self.db),
            Arc::clone(&self.ledger),
            Arc::clone(&self.progress),
            self.runner(support_resistance),
            fetcher,
            self.notifier.clone(),
            Arc::new(NeverCancelled),
            OrchestratorOptions {
                max_workers: Some(2),
                ..OrchestratorOptions::default()
            },
        )
    }
}
