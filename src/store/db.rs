use chrono::Utc;
use refinery::embed_migrations;
use rusqlite::{params, types::Value, Connection, TransactionBehavior};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use super::StorePaths;
use crate::engine::types::AnalysisMetrics;
use crate::market::Timeframe;

embed_migrations!("migrations");

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("migration error: {0}")]
    Migration(#[from] refinery::Error),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One (symbol, timeframe, strategy) combination to analyze.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AnalysisTarget {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub strategy: String,
}

impl AnalysisTarget {
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe, strategy: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
            strategy: strategy.into(),
        }
    }

    /// Content address of the target's ledger blob.
    pub fn analysis_id(&self) -> String {
        format!("{}_{}_{}", self.symbol, self.timeframe, self.strategy)
    }
}

/// A target bound to one orchestrator execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AnalysisKey {
    pub target: AnalysisTarget,
    pub execution_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisRow {
    pub id: i64,
    pub symbol: String,
    pub timeframe: String,
    pub strategy: String,
    pub generated_at: String,
    pub total_trades: Option<i64>,
    pub win_rate: Option<f64>,
    pub total_return: Option<f64>,
    pub sharpe_ratio: Option<f64>,
    pub max_drawdown: Option<f64>,
    pub avg_leverage: Option<f64>,
    pub chart_path: Option<String>,
    pub compressed_path: Option<String>,
    pub status: String,
    pub execution_id: Option<String>,
    pub task_status: String,
    pub task_started_at: Option<String>,
    pub task_completed_at: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct QueryFilters {
    pub symbols: Vec<String>,
    pub timeframes: Vec<Timeframe>,
    pub strategies: Vec<String>,
    pub min_sharpe: Option<f64>,
}

/// Whitelisted ordering columns; never interpolate caller strings into SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderBy {
    #[default]
    SharpeRatio,
    TotalReturn,
    WinRate,
    GeneratedAt,
}

impl OrderBy {
    fn column(self) -> &'static str {
        match self {
            OrderBy::SharpeRatio => "sharpe_ratio",
            OrderBy::TotalReturn => "total_return",
            OrderBy::WinRate => "win_rate",
            OrderBy::GeneratedAt => "generated_at",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DbStatistics {
    pub status_counts: Vec<(String, i64)>,
    pub completed_analyses: i64,
    pub avg_sharpe: Option<f64>,
    pub max_sharpe: Option<f64>,
    pub avg_return: Option<f64>,
    pub unique_symbols: i64,
    pub unique_strategies: i64,
}

/// Metadata store for analysis rows and their summary metrics.
///
/// Single-file SQLite in WAL mode. Every handle owns its own connection;
/// writers serialize through short `BEGIN IMMEDIATE` transactions. Schema
/// changes are additive refinery migrations, applied on open.
pub struct AnalysisDb {
    conn: Mutex<Connection>,
}

impl AnalysisDb {
    pub fn open(paths: &StorePaths) -> Result<Self, DbError> {
        if let Some(parent) = paths.db_path().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| DbError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        let mut conn = Connection::open(paths.db_path())?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(Duration::from_secs(10))?;
        migrations::runner().run(&mut conn)?;
        info!(path = %paths.db_path().display(), "analysis db ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert a pending row for every target that has no live row under this
    /// execution id. Idempotent per execution: re-running pre-reservation
    /// never duplicates pending/running rows.
    pub fn pre_reserve(
        &self,
        targets: &[AnalysisTarget],
        execution_id: &str,
    ) -> Result<usize, DbError> {
        let mut conn = self.conn.lock().expect("db lock");
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut created = 0;
        for target in targets {
            let live: i64 = tx.query_row(
                "SELECT COUNT(*) FROM analyses
                 WHERE symbol = ?1 AND timeframe = ?2 AND config = ?3 AND execution_id = ?4
                   AND task_status IN ('pending', 'running')",
                params![
                    target.symbol,
                    target.timeframe.as_str(),
                    target.strategy,
                    execution_id
                ],
                |row| row.get(0),
            )?;
            if live == 0 {
                tx.execute(
                    "INSERT INTO analyses
                       (symbol, timeframe, config, strategy_name, task_status, status, execution_id)
                     VALUES (?1, ?2, ?3, ?3, 'pending', 'running', ?4)",
                    params![
                        target.symbol,
                        target.timeframe.as_str(),
                        target.strategy,
                        execution_id
                    ],
                )?;
                created += 1;
            }
        }
        tx.commit()?;
        info!(created, total = targets.len(), execution_id, "pre-reserved analysis rows");
        Ok(created)
    }

    pub fn mark_running(&self, key: &AnalysisKey) -> Result<(), DbError> {
        self.update_task(
            key,
            "UPDATE analyses SET task_status = 'running', task_started_at = ?5
             WHERE symbol = ?1 AND timeframe = ?2 AND config = ?3 AND execution_id = ?4",
            &Utc::now().to_rfc3339(),
        )
    }

    pub fn mark_failed(&self, key: &AnalysisKey, message: &str) -> Result<(), DbError> {
        self.update_task(
            key,
            "UPDATE analyses SET task_status = 'failed', status = 'failed', error_message = ?5,
                                 task_completed_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
             WHERE symbol = ?1 AND timeframe = ?2 AND config = ?3 AND execution_id = ?4",
            message,
        )
    }

    fn update_task(&self, key: &AnalysisKey, sql: &str, arg: &str) -> Result<(), DbError> {
        let conn = self.conn.lock().expect("db lock");
        let updated = conn.execute(
            sql,
            params![
                key.target.symbol,
                key.target.timeframe.as_str(),
                key.target.strategy,
                key.execution_id,
                arg
            ],
        )?;
        if updated == 0 {
            warn!(?key, "task-status update matched no row");
        }
        Ok(())
    }

    /// Transition the pre-reserved row to completed with its metrics, and
    /// record the extended metric set in `backtest_summary`. When no
    /// pre-reserved row exists (degraded path) a fresh completed row is
    /// inserted instead.
    pub fn mark_completed(
        &self,
        key: &AnalysisKey,
        metrics: &AnalysisMetrics,
        chart_path: Option<&str>,
        compressed_path: &str,
    ) -> Result<i64, DbError> {
        let mut conn = self.conn.lock().expect("db lock");
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now().to_rfc3339();

        let updated = tx.execute(
            "UPDATE analyses SET
                 total_trades = ?5, win_rate = ?6, total_return = ?7, sharpe_ratio = ?8,
                 max_drawdown = ?9, avg_leverage = ?10, chart_path = ?11, compressed_path = ?12,
                 status = 'completed', task_status = 'completed', task_completed_at = ?13,
                 error_message = NULL
             WHERE symbol = ?1 AND timeframe = ?2 AND config = ?3 AND execution_id = ?4",
            params![
                key.target.symbol,
                key.target.timeframe.as_str(),
                key.target.strategy,
                key.execution_id,
                metrics.total_trades as i64,
                metrics.win_rate,
                metrics.total_return,
                metrics.sharpe_ratio,
                metrics.max_drawdown,
                metrics.avg_leverage,
                chart_path,
                compressed_path,
                now,
            ],
        )?;

        let analysis_id: i64 = if updated == 0 {
            warn!(?key, "no pre-reserved row; inserting completed row directly");
            tx.execute(
                "INSERT INTO analyses
                   (symbol, timeframe, config, strategy_name, total_trades, win_rate, total_return,
                    sharpe_ratio, max_drawdown, avg_leverage, chart_path, compressed_path,
                    status, task_status, task_completed_at, execution_id)
                 VALUES (?1, ?2, ?3, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11,
                         'completed', 'completed', ?12, ?13)",
                params![
                    key.target.symbol,
                    key.target.timeframe.as_str(),
                    key.target.strategy,
                    metrics.total_trades as i64,
                    metrics.win_rate,
                    metrics.total_return,
                    metrics.sharpe_ratio,
                    metrics.max_drawdown,
                    metrics.avg_leverage,
                    chart_path,
                    compressed_path,
                    now,
                    key.execution_id,
                ],
            )?;
            tx.last_insert_rowid()
        } else {
            tx.query_row(
                "SELECT id FROM analyses
                 WHERE symbol = ?1 AND timeframe = ?2 AND config = ?3 AND execution_id = ?4",
                params![
                    key.target.symbol,
                    key.target.timeframe.as_str(),
                    key.target.strategy,
                    key.execution_id
                ],
                |row| row.get(0),
            )?
        };

        for (name, value) in [
            ("breakeven_trades", metrics.breakeven_trades as f64),
            ("decisive_trades", metrics.decisive_trades as f64),
            ("breakeven_rate", metrics.breakeven_rate),
            ("avg_price_consistency", metrics.avg_price_consistency),
            ("critical_price_issues", metrics.critical_price_issues as f64),
            (
                "critical_backtest_issues",
                metrics.critical_backtest_issues as f64,
            ),
        ] {
            tx.execute(
                "INSERT INTO backtest_summary (analysis_id, metric_name, metric_value)
                 VALUES (?1, ?2, ?3)",
                params![analysis_id, name, value],
            )?;
        }

        tx.commit()?;
        Ok(analysis_id)
    }

    /// Completed rows matching the filters.
    pub fn query(
        &self,
        filters: &QueryFilters,
        order_by: OrderBy,
        limit: usize,
    ) -> Result<Vec<AnalysisRow>, DbError> {
        let mut sql = String::from("SELECT * FROM analyses WHERE status = 'completed'");
        let mut values: Vec<Value> = Vec::new();

        push_in_clause(&mut sql, &mut values, "symbol", &filters.symbols);
        let timeframe_tags: Vec<String> = filters
            .timeframes
            .iter()
            .map(|t| t.as_str().to_string())
            .collect();
        push_in_clause(&mut sql, &mut values, "timeframe", &timeframe_tags);
        push_in_clause(&mut sql, &mut values, "config", &filters.strategies);

        if let Some(min_sharpe) = filters.min_sharpe {
            sql.push_str(&format!(" AND sharpe_ratio >= ?{}", values.len() + 1));
            values.push(Value::Real(min_sharpe));
        }

        sql.push_str(&format!(
            " ORDER BY {} DESC LIMIT ?{}",
            order_by.column(),
            values.len() + 1
        ));
        values.push(Value::Integer(limit as i64));

        let conn = self.conn.lock().expect("db lock");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(values), row_to_analysis)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Deduplication helper only; never used to block re-runs under a new
    /// execution id.
    pub fn analysis_exists(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        strategy: &str,
    ) -> Result<bool, DbError> {
        let conn = self.conn.lock().expect("db lock");
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM analyses WHERE symbol = ?1 AND timeframe = ?2 AND config = ?3",
            params![symbol, timeframe.as_str(), strategy],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn statistics(&self) -> Result<DbStatistics, DbError> {
        let conn = self.conn.lock().expect("db lock");
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM analyses GROUP BY status ORDER BY status")?;
        let status_counts = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<(String, i64)>, _>>()?;

        let (completed_analyses, avg_sharpe, max_sharpe, avg_return, unique_symbols, unique_strategies) =
            conn.query_row(
                "SELECT COUNT(*), AVG(sharpe_ratio), MAX(sharpe_ratio), AVG(total_return),
                        COUNT(DISTINCT symbol), COUNT(DISTINCT config)
                 FROM analyses WHERE status = 'completed'",
                [],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                },
            )?;

        Ok(DbStatistics {
            status_counts,
            completed_analyses,
            avg_sharpe,
            max_sharpe,
            avg_return,
            unique_symbols,
            unique_strategies,
        })
    }

    /// Delete completed rows under the sharpe floor. Returns the compressed
    /// paths of the removed rows so the caller can drop the ledger blobs.
    pub fn cleanup_low_performers(&self, min_sharpe: f64) -> Result<Vec<String>, DbError> {
        let mut conn = self.conn.lock().expect("db lock");
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let paths: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT compressed_path FROM analyses
                 WHERE status = 'completed' AND sharpe_ratio < ?1 AND compressed_path IS NOT NULL",
            )?;
            let collected = stmt
                .query_map(params![min_sharpe], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            collected
        };

        tx.execute(
            "DELETE FROM backtest_summary WHERE analysis_id IN
               (SELECT id FROM analyses WHERE status = 'completed' AND sharpe_ratio < ?1)",
            params![min_sharpe],
        )?;
        let removed = tx.execute(
            "DELETE FROM analyses WHERE status = 'completed' AND sharpe_ratio < ?1",
            params![min_sharpe],
        )?;
        tx.commit()?;
        info!(removed, min_sharpe, "cleaned up low performers");
        Ok(paths)
    }
}

fn push_in_clause(sql: &mut String, values: &mut Vec<Value>, column: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    let placeholders: Vec<String> = (0..items.len())
        .map(|i| format!("?{}", values.len() + i + 1))
        .collect();
    sql.push_str(&format!(" AND {column} IN ({})", placeholders.join(", ")));
    values.extend(items.iter().cloned().map(Value::Text));
}

fn row_to_analysis(row: &rusqlite::Row<'_>) -> rusqlite::Result<AnalysisRow> {
    Ok(AnalysisRow {
        id: row.get("id")?,
        symbol: row.get("symbol")?,
        timeframe: row.get("timeframe")?,
        strategy: row.get("config")?,
        generated_at: row.get("generated_at")?,
        total_trades: row.get("total_trades")?,
        win_rate: row.get("win_rate")?,
        total_return: row.get("total_return")?,
        sharpe_ratio: row.get("sharpe_ratio")?,
        max_drawdown: row.get("max_drawdown")?,
        avg_leverage: row.get("avg_leverage")?,
        chart_path: row.get("chart_path")?,
        compressed_path: row.get("compressed_path")?,
        status: row.get("status")?,
        execution_id: row.get("execution_id")?,
        task_status: row.get("task_status")?,
        task_started_at: row.get("task_started_at")?,
        task_completed_at: row.get("task_completed_at")?,
        error_message: row.get("error_message")?,
    })
}
