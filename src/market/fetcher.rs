use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use polars::prelude::*;
use std::path::PathBuf;

use super::frame::TIMESTAMP_COL;
use super::Timeframe;

/// Market-data fetch capability.
///
/// Contract: timestamps unique, sorted ascending, uniform interval spacing
/// except for exchange-side gaps; prices positive. An empty frame is a valid
/// response and is treated downstream as insufficient data.
#[async_trait]
pub trait OhlcvFetcher: Send + Sync {
    async fn fetch(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<DataFrame>;
}

/// File-backed fetcher over per-(symbol, timeframe) parquet files.
///
/// Layout: `<data_dir>/<symbol>_<timeframe>.parquet` with the standard OHLCV
/// columns. Used for offline backtests and the test suite; live deployments
/// plug an exchange client into the same trait.
pub struct ParquetFetcher {
    data_dir: PathBuf,
}

impl ParquetFetcher {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    fn path_for(&self, symbol: &str, timeframe: Timeframe) -> PathBuf {
        self.data_dir.join(format!("{symbol}_{timeframe}.parquet"))
    }
}

#[async_trait]
impl OhlcvFetcher for ParquetFetcher {
    async fn fetch(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<DataFrame> {
        let path = self.path_for(symbol, timeframe);
        let df = tokio::task::spawn_blocking(move || -> Result<DataFrame> {
            let file = std::fs::File::open(&path)
                .with_context(|| format!("no OHLCV file at {}", path.display()))?;
            Ok(ParquetReader::new(file).finish()?)
        })
        .await??;

        let filtered = df
            .lazy()
            .filter(
                col(TIMESTAMP_COL)
                    .gt_eq(lit(start.naive_utc()))
                    .and(col(TIMESTAMP_COL).lt_eq(lit(end.naive_utc()))),
            )
            .sort([TIMESTAMP_COL], SortMultipleOptions::default())
            .collect()?;
        Ok(filtered)
    }
}
