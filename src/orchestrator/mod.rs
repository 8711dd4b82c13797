use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{ConfigStore, StrictnessLevel};
use crate::engine::backtest::{BacktestError, BacktestRequest, BacktestRunner, CustomPeriod};
use crate::engine::types::{AnalysisResult, EarlyExit, ExitReason, ExitStage};
use crate::market::fetcher::OhlcvFetcher;
use crate::market::frame::series_from_dataframe;
use crate::notify::{EarlyExitNotification, Notifier};
use crate::store::db::{AnalysisDb, AnalysisKey, AnalysisTarget};
use crate::store::ledger::TradeLedger;
use crate::store::progress::{ProgressTracker, StageKey, StageOutcome};

/// Worker <-> orchestrator execution-id handoff for subprocess ergonomics.
pub const EXECUTION_ID_ENV: &str = "CURRENT_EXECUTION_ID";

/// Explicit argument wins; the well-known env var is the fallback.
pub fn resolve_execution_id(explicit: Option<&str>) -> Option<String> {
    explicit
        .map(str::to_string)
        .or_else(|| std::env::var(EXECUTION_ID_ENV).ok())
}

/// External cancellation store (execution status table) polled between
/// chunks and before each task.
#[async_trait]
pub trait CancellationCheck: Send + Sync {
    async fn is_cancelled(&self, execution_id: &str) -> bool;
}

/// Default: executions are never cancelled externally.
#[derive(Debug, Default)]
pub struct NeverCancelled;

#[async_trait]
impl CancellationCheck for NeverCancelled {
    async fn is_cancelled(&self, _execution_id: &str) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Defaults to min(cpu count, 4); bounded to respect upstream exchange
    /// rate limits, not compute.
    pub max_workers: Option<usize>,
    pub chunk_timeout: Duration,
    pub strictness: Option<StrictnessLevel>,
    pub show_progress_bar: bool,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            max_workers: None,
            chunk_timeout: Duration::from_secs(30 * 60),
            strictness: None,
            show_progress_bar: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub execution_id: String,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: bool,
}

/// Batch orchestrator: pre-reserves metadata rows, partitions the batch
/// into chunks, dispatches bounded-parallel workers, and aggregates counts.
/// Per-trade data never crosses the worker boundary; workers persist
/// ledgers and metrics themselves.
pub struct Orchestrator {
    config: Arc<ConfigStore>,
    db: Arc<AnalysisDb>,
    ledger: Arc<TradeLedger>,
    progress: Arc<ProgressTracker>,
    runner: Arc<BacktestRunner>,
    fetcher: Arc<dyn OhlcvFetcher>,
    notifier: Arc<dyn Notifier>,
    cancellation: Arc<dyn CancellationCheck>,
    options: OrchestratorOptions,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<ConfigStore>,
        db: Arc<AnalysisDb>,
        ledger: Arc<TradeLedger>,
        progress: Arc<ProgressTracker>,
        runner: Arc<BacktestRunner>,
        fetcher: Arc<dyn OhlcvFetcher>,
        notifier: Arc<dyn Notifier>,
        cancellation: Arc<dyn CancellationCheck>,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            config,
            db,
            ledger,
            progress,
            runner,
            fetcher,
            notifier,
            cancellation,
            options,
        }
    }

    fn max_workers(&self) -> usize {
        self.options.max_workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1)
                .min(4)
        })
    }

    /// Run a batch with `now` taken from the wall clock.
    pub async fn run_batch(
        &self,
        targets: Vec<AnalysisTarget>,
        execution_id: Option<String>,
    ) -> Result<BatchReport> {
        self.run_batch_at(targets, execution_id, Utc::now()).await
    }

    /// Run a batch against an explicit `now` (tests and replays).
    pub async fn run_batch_at(
        &self,
        targets: Vec<AnalysisTarget>,
        execution_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<BatchReport> {
        dotenvy::dotenv().ok();
        let execution_id = resolve_execution_id(execution_id.as_deref())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        std::env::set_var(EXECUTION_ID_ENV, &execution_id);

        // Config errors fail the batch before any row is reserved.
        for target in &targets {
            self.config.strategy(&target.strategy).with_context(|| {
                format!("invalid batch entry {}", target.analysis_id())
            })?;
            self.config.timeframe(target.timeframe)?;
        }

        let custom_period = CustomPeriod::from_env()
            .context("malformed CUSTOM_PERIOD_SETTINGS")?;
        let strictness = self
            .options
            .strictness
            .unwrap_or_else(|| self.config.default_strictness_level());

        self.db.pre_reserve(&targets, &execution_id)?;
        if let Some(first) = targets.first() {
            if let Err(e) = self.progress.start(&first.symbol, &execution_id) {
                warn!(error = %e, "progress tracking unavailable");
            }
        }

        let max_workers = self.max_workers();
        let chunk_size = targets.len().div_ceil(max_workers).max(1);
        let chunks: Vec<Vec<AnalysisTarget>> =
            targets.chunks(chunk_size).map(<[AnalysisTarget]>::to_vec).collect();
        info!(
            %execution_id,
            targets = targets.len(),
            chunks = chunks.len(),
            max_workers,
            "batch dispatch"
        );

        let bar = if self.options.show_progress_bar {
            let bar = ProgressBar::new(targets.len() as u64);
            bar.set_style(
                ProgressStyle::with_template(
                    "{spinner} [{elapsed_precise}] {bar:40} {pos}/{len} {msg}",
                )
                .expect("static template parses"),
            );
            bar
        } else {
            ProgressBar::hidden()
        };

        let token = CancellationToken::new();
        let mut join_set: JoinSet<(usize, usize)> = JoinSet::new();
        let mut cancelled = false;

        for (chunk_id, chunk) in chunks.into_iter().enumerate() {
            // Cancellation is polled between chunk dispatches.
            if self.cancellation.is_cancelled(&execution_id).await {
                warn!(%execution_id, chunk_id, "cancellation detected; aborting dispatch");
                token.cancel();
                cancelled = true;
                for target in &chunk {
                    self.fail_target(target, &execution_id, "cancelled");
                }
                continue;
            }

            let worker = ChunkWorker {
                chunk_id,
                execution_id: execution_id.clone(),
                now,
                custom_period,
                strictness,
                config: Arc::clone(&self.config),
                db: Arc::clone(&self.db),
                ledger: Arc::clone(&self.ledger),
                progress: Arc::clone(&self.progress),
                runner: Arc::clone(&self.runner),
                fetcher: Arc::clone(&self.fetcher),
                notifier: Arc::clone(&self.notifier),
                cancellation: Arc::clone(&self.cancellation),
                token: token.clone(),
                bar: bar.clone(),
            };
            let timeout = self.options.chunk_timeout;
            join_set.spawn(async move {
                match tokio::time::timeout(timeout, worker.process(chunk)).await {
                    Ok(counts) => counts,
                    Err(_) => {
                        error!(chunk_id, "chunk timed out");
                        (0, 0)
                    }
                }
            });
        }

        let mut completed = 0;
        let mut failed = 0;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((ok, bad)) => {
                    completed += ok;
                    failed += bad;
                }
                Err(e) => {
                    // A panicked worker poisons nothing else; the chunk is
                    // charged as failed and the rest of the batch continues.
                    error!(error = %e, "chunk task aborted");
                    failed += 1;
                }
            }
        }
        bar.finish_and_clear();

        // A failed analysis already wrote its failure stage to the progress
        // file; only an all-clear batch transitions it to success.
        if !cancelled && failed == 0 {
            let message = format!("{completed} completed, {failed} failed");
            if let Err(e) = self.progress.complete(
                &execution_id,
                if completed > 0 { "signal" } else { "no_signal" },
                &message,
            ) {
                warn!(error = %e, "progress completion update failed");
            }
        }

        info!(%execution_id, completed, failed, cancelled, "batch finished");
        Ok(BatchReport {
            execution_id,
            completed,
            failed,
            cancelled,
        })
    }

    /// Completed ledgers matching the filters, keyed by analysis id.
    pub fn load_trades(
        &self,
        filters: &crate::store::db::QueryFilters,
        limit: usize,
    ) -> Result<std::collections::HashMap<String, Vec<crate::engine::types::TradeRecord>>> {
        let rows = self
            .db
            .query(filters, crate::store::db::OrderBy::SharpeRatio, limit)?;
        let ids: Vec<String> = rows
            .iter()
            .map(|r| format!("{}_{}_{}", r.symbol, r.timeframe, r.strategy))
            .collect();
        Ok(self.ledger.load_many(&ids))
    }

    /// Drop completed analyses under the sharpe floor, ledger blobs
    /// included. Returns the number of rows removed.
    pub fn cleanup_low_performers(&self, min_sharpe: f64) -> Result<usize> {
        let paths = self.db.cleanup_low_performers(min_sharpe)?;
        let removed = paths.len();
        for path in paths {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(%path, error = %e, "could not remove ledger blob");
                }
            }
        }
        Ok(removed)
    }

    fn fail_target(&self, target: &AnalysisTarget, execution_id: &str, message: &str) {
        let key = AnalysisKey {
            target: target.clone(),
            execution_id: execution_id.to_string(),
        };
        if let Err(e) = self.db.mark_failed(&key, message) {
            error!(error = %e, "failed to mark cancelled row");
        }
    }
}

/// Per-chunk worker state. Within a chunk, tasks execute sequentially; the
/// chunk is the unit of parallelism.
struct ChunkWorker {
    chunk_id: usize,
    execution_id: String,
    now: DateTime<Utc>,
    custom_period: Option<CustomPeriod>,
    strictness: StrictnessLevel,
    config: Arc<ConfigStore>,
    db: Arc<AnalysisDb>,
    ledger: Arc<TradeLedger>,
    progress: Arc<ProgressTracker>,
    runner: Arc<BacktestRunner>,
    fetcher: Arc<dyn OhlcvFetcher>,
    notifier: Arc<dyn Notifier>,
    cancellation: Arc<dyn CancellationCheck>,
    token: CancellationToken,
    bar: ProgressBar,
}

impl ChunkWorker {
    /// Returns (completed, failed) counts for the chunk.
    async fn process(&self, chunk: Vec<AnalysisTarget>) -> (usize, usize) {
        let mut completed = 0;
        let mut failed = 0;

        for (i, target) in chunk.iter().enumerate() {
            if self.token.is_cancelled()
                || self.cancellation.is_cancelled(&self.execution_id).await
            {
                info!(chunk = self.chunk_id, "cancellation observed; stopping chunk");
                for remaining in &chunk[i..] {
                    self.mark_failed(remaining, "cancelled");
                    failed += 1;
                }
                break;
            }

            match self.process_target(target).await {
                Ok(true) => completed += 1,
                Ok(false) => failed += 1,
                Err(e) => {
                    // Unexpected failures mark the task failed and the
                    // chunk continues.
                    error!(target = %target.analysis_id(), error = %e, "task failed unexpectedly");
                    self.mark_failed(target, &format!("unexpected failure: {e:#}"));
                    failed += 1;
                }
            }
            self.bar.inc(1);
        }

        (completed, failed)
    }

    fn key(&self, target: &AnalysisTarget) -> AnalysisKey {
        AnalysisKey {
            target: target.clone(),
            execution_id: self.execution_id.clone(),
        }
    }

    fn mark_failed(&self, target: &AnalysisTarget, message: &str) {
        if let Err(e) = self.db.mark_failed(&self.key(target), message) {
            error!(error = %e, target = %target.analysis_id(), "mark_failed errored");
        }
    }

    /// Ok(true) = completed, Ok(false) = failed terminally (row updated).
    async fn process_target(&self, target: &AnalysisTarget) -> Result<bool> {
        let key = self.key(target);
        if let Err(e) = self.db.mark_running(&key) {
            warn!(error = %e, "mark_running failed; continuing");
        }
        let _ = self
            .progress
            .update_stage(&self.execution_id, &format!("analyzing {}", target.analysis_id()));

        let request = BacktestRequest {
            symbol: target.symbol.clone(),
            timeframe: target.timeframe,
            strategy: target.strategy.clone(),
            execution_id: self.execution_id.clone(),
            custom_period: self.custom_period,
        };

        let tf_config = self.config.timeframe(target.timeframe)?;
        let window = crate::engine::backtest::plan_window(
            tf_config,
            target.timeframe,
            self.config.risk_management().lookback_candles,
            self.now,
            self.custom_period.as_ref(),
        );

        // Data fetch: failures and empty responses are insufficient data,
        // not crashes.
        let frame = match self
            .fetcher
            .fetch(&target.symbol, target.timeframe, window.fetch_start, window.end_time)
            .await
        {
            Ok(frame) if frame.height() > 0 => frame,
            Ok(_) => {
                return Ok(self
                    .handle_early_exit(
                        target,
                        EarlyExit::new(ExitStage::DataFetch, ExitReason::InsufficientData)
                            .with_detail(format!("empty OHLCV response for {}", target.symbol)),
                    )
                    .await)
            }
            Err(e) => {
                return Ok(self
                    .handle_early_exit(
                        target,
                        EarlyExit::new(ExitStage::DataFetch, ExitReason::InsufficientData)
                            .with_detail(format!("fetch failed: {e:#}")),
                    )
                    .await)
            }
        };

        let series = match series_from_dataframe(&frame, &target.symbol, target.timeframe) {
            Ok(series) => series,
            Err(e) => {
                // Integrity violations in upstream data degrade to
                // insufficient_data.
                return Ok(self
                    .handle_early_exit(
                        target,
                        EarlyExit::new(ExitStage::DataFetch, ExitReason::InsufficientData)
                            .with_detail(format!("invalid OHLCV series: {e:#}")),
                    )
                    .await);
            }
        };

        // The walk is pure compute; keep it off the async executor. The
        // series moves into the task and dies with it.
        let runner = Arc::clone(&self.runner);
        let config = Arc::clone(&self.config);
        let strictness = self.strictness;
        let run_request = request.clone();
        let (start_time, end_time) = (window.start_time, window.end_time);
        let outcome = tokio::task::spawn_blocking(move || {
            runner.run(&run_request, series, start_time, end_time, strictness, &config)
        })
        .await
        .context("backtest task panicked")?;

        match outcome {
            Ok(AnalysisResult::Completed { trades, metrics }) => {
                let analysis_id = target.analysis_id();
                let blob_path = self.ledger.save(&analysis_id, &trades)?;
                self.db.mark_completed(
                    &key,
                    &metrics,
                    None,
                    &blob_path.to_string_lossy(),
                )?;
                info!(
                    analysis = %analysis_id,
                    trades = metrics.total_trades,
                    win_rate = metrics.win_rate,
                    "analysis completed"
                );
                Ok(true)
            }
            Ok(AnalysisResult::EarlyExit(exit)) => {
                Ok(self.handle_early_exit(target, exit).await)
            }
            Err(BacktestError::CriticalValidation { symbol, issues }) => {
                let message = format!("critical backtest validation: {}", issues.join("; "));
                error!(%symbol, %message, "aborting analysis");
                self.mark_failed(target, &message);
                let _ = self
                    .progress
                    .fail(&self.execution_id, "backtest_validation", &message);
                Ok(false)
            }
            Err(BacktestError::Config(e)) => {
                self.mark_failed(target, &e.to_string());
                Err(e.into())
            }
        }
    }

    /// Record a structured early exit across all three surfaces: metadata
    /// row, progress file, notification transport. Always "failed" (false).
    async fn handle_early_exit(&self, target: &AnalysisTarget, exit: EarlyExit) -> bool {
        info!(
            target = %target.analysis_id(),
            stage = exit.stage.as_str(),
            reason = exit.reason.as_str(),
            detail = %exit.detailed_message,
            "early exit"
        );
        self.mark_failed(target, &exit.summary());
        if let Some(stage_key) = tracked_stage(exit.stage) {
            let _ = self.progress.update_stage_result(
                &self.execution_id,
                stage_key,
                StageOutcome {
                    status: "failed".to_string(),
                    summary: exit.detailed_message.clone(),
                },
            );
        }
        let _ = self
            .progress
            .fail(&self.execution_id, exit.stage.as_str(), &exit.user_message);
        let notification = EarlyExitNotification::from_exit(
            &exit,
            &target.symbol,
            target.timeframe,
            &target.strategy,
            &self.execution_id,
        );
        self.notifier.notify_early_exit(&notification).await;
        false
    }
}

/// Stages with a dedicated result slot in the progress file.
fn tracked_stage(stage: ExitStage) -> Option<StageKey> {
    match stage {
        ExitStage::SupportResistance => Some(StageKey::SupportResistance),
        ExitStage::MlPrediction => Some(StageKey::MlPrediction),
        ExitStage::MarketContext => Some(StageKey::MarketContext),
        ExitStage::LeverageDecision => Some(StageKey::LeverageDecision),
        ExitStage::DataFetch | ExitStage::EntryConditions => None,
    }
}
