use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rayon::prelude::*;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use super::StorePaths;
use crate::engine::types::TradeRecord;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("no ledger blob for '{analysis_id}' at {path}")]
    Missing { analysis_id: String, path: PathBuf },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt ledger blob at {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Compressed trade-ledger store, content-addressed by
/// `{symbol}_{timeframe}_{strategy}`.
///
/// A blob is one gzip-compressed JSON array of trade records, written whole
/// via temp-file + atomic rename; there are no partial updates. Identical
/// trade sequences serialize to byte-identical blobs, which is what makes
/// replay comparisons meaningful.
pub struct TradeLedger {
    compressed_dir: PathBuf,
}

impl TradeLedger {
    pub fn new(paths: &StorePaths) -> Self {
        Self {
            compressed_dir: paths.compressed_dir(),
        }
    }

    pub fn blob_path(&self, analysis_id: &str) -> PathBuf {
        self.compressed_dir.join(format!("{analysis_id}.json.gz"))
    }

    pub fn exists(&self, analysis_id: &str) -> bool {
        self.blob_path(analysis_id).exists()
    }

    /// Serialize, compress and atomically (re)place the blob. A re-analysis
    /// of the same key overwrites in one rename; readers never observe a
    /// half-written file.
    pub fn save(&self, analysis_id: &str, trades: &[TradeRecord]) -> Result<PathBuf, LedgerError> {
        std::fs::create_dir_all(&self.compressed_dir).map_err(|source| LedgerError::Io {
            path: self.compressed_dir.clone(),
            source,
        })?;
        let path = self.blob_path(analysis_id);

        let io_err = |source| LedgerError::Io {
            path: path.clone(),
            source,
        };

        let json = serde_json::to_vec(trades).expect("trade records serialize");
        let tmp = tempfile::NamedTempFile::new_in(&self.compressed_dir).map_err(io_err)?;
        let mut encoder = GzEncoder::new(tmp, Compression::default());
        encoder.write_all(&json).map_err(io_err)?;
        let tmp = encoder.finish().map_err(io_err)?;
        tmp.persist(&path).map_err(|e| io_err(e.error))?;

        info!(analysis_id, trades = trades.len(), path = %path.display(), "ledger blob written");
        Ok(path)
    }

    pub fn load(&self, analysis_id: &str) -> Result<Vec<TradeRecord>, LedgerError> {
        let path = self.blob_path(analysis_id);
        let file = std::fs::File::open(&path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                LedgerError::Missing {
                    analysis_id: analysis_id.to_string(),
                    path: path.clone(),
                }
            } else {
                LedgerError::Io {
                    path: path.clone(),
                    source,
                }
            }
        })?;
        let mut json = Vec::new();
        GzDecoder::new(file)
            .read_to_end(&mut json)
            .map_err(|source| LedgerError::Io {
                path: path.clone(),
                source,
            })?;
        serde_json::from_slice(&json).map_err(|source| LedgerError::Corrupt { path, source })
    }

    /// Bulk load; unreadable blobs are logged and skipped.
    pub fn load_many(&self, analysis_ids: &[String]) -> HashMap<String, Vec<TradeRecord>> {
        analysis_ids
            .par_iter()
            .filter_map(|id| match self.load(id) {
                Ok(trades) => Some((id.clone(), trades)),
                Err(e) => {
                    warn!(analysis_id = %id, error = %e, "skipping unreadable ledger blob");
                    None
                }
            })
            .collect()
    }

    pub fn delete(&self, analysis_id: &str) -> Result<bool, LedgerError> {
        let path = self.blob_path(analysis_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(LedgerError::Io { path, source }),
        }
    }

    /// Export a ledger to CSV with the canonical column set.
    pub fn export_csv(&self, analysis_id: &str, output: &Path) -> Result<usize, LedgerError> {
        let trades = self.load(analysis_id)?;
        let io_err = |source| LedgerError::Io {
            path: output.to_path_buf(),
            source,
        };

        let mut out = std::io::BufWriter::new(std::fs::File::create(output).map_err(io_err)?);
        writeln!(
            out,
            "entry_time,exit_time,entry_price,exit_price,take_profit_price,stop_loss_price,\
             leverage,pnl_pct,confidence,outcome,strategy,price_consistency_score,\
             price_validation_level,backtest_validation_severity,analysis_price"
        )
        .map_err(io_err)?;
        for t in &trades {
            writeln!(
                out,
                "{},{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
                t.entry_time.to_rfc3339(),
                t.exit_time.to_rfc3339(),
                t.entry_price,
                t.exit_price,
                t.take_profit_price,
                t.stop_loss_price,
                t.leverage,
                t.pnl_pct,
                t.confidence,
                outcome_tag(t),
                t.strategy,
                t.price_consistency_score,
                t.price_validation_level,
                t.backtest_validation_severity,
                t.analysis_price,
            )
            .map_err(io_err)?;
        }
        out.flush().map_err(io_err)?;
        Ok(trades.len())
    }
}

fn outcome_tag(t: &TradeRecord) -> &'static str {
    match t.outcome {
        crate::engine::types::Outcome::Profit => "profit",
        crate::engine::types::Outcome::Loss => "loss",
        crate::engine::types::Outcome::Breakeven => "breakeven",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{Outcome, ValidationLevel};
    use chrono::{Duration, TimeZone, Utc};

    fn make_trades(n: usize) -> Vec<TradeRecord> {
        (0..n)
            .map(|i| {
                let entry = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
                    + Duration::hours(i as i64);
                TradeRecord {
                    entry_time: entry,
                    exit_time: entry + Duration::hours(2),
                    entry_price: 100.0 + i as f64,
                    exit_price: 103.0 + i as f64,
                    take_profit_price: 103.0 + i as f64,
                    stop_loss_price: 98.0 + i as f64,
                    leverage: 5.0,
                    pnl_pct: 0.15,
                    confidence: 0.72,
                    outcome: Outcome::Profit,
                    strategy: "Balanced".to_string(),
                    price_consistency_score: 1.0,
                    price_validation_level: ValidationLevel::Normal,
                    backtest_validation_severity: ValidationLevel::Normal,
                    analysis_price: 100.0 + i as f64,
                }
            })
            .collect()
    }

    fn ledger() -> (tempfile::TempDir, TradeLedger) {
        let dir = tempfile::tempdir().unwrap();
        let paths = StorePaths::resolve(dir.path().join("analysis")).unwrap();
        (dir, TradeLedger::new(&paths))
    }

    #[test]
    fn save_then_load_round_trips() {
        let (_dir, ledger) = ledger();
        let trades = make_trades(25);
        ledger.save("BTC_1h_Balanced", &trades).unwrap();
        let loaded = ledger.load("BTC_1h_Balanced").unwrap();
        assert_eq!(loaded, trades);
    }

    #[test]
    fn identical_ledgers_are_byte_identical() {
        let (_dir, ledger) = ledger();
        let trades = make_trades(10);
        let p1 = ledger.save("A_1h_Balanced", &trades).unwrap();
        let p2 = ledger.save("B_1h_Balanced", &trades).unwrap();
        let b1 = std::fs::read(p1).unwrap();
        let b2 = std::fs::read(p2).unwrap();
        assert_eq!(b1, b2);
    }

    #[test]
    fn rewrite_replaces_whole_blob() {
        let (_dir, ledger) = ledger();
        ledger.save("BTC_1h_Balanced", &make_trades(25)).unwrap();
        ledger.save("BTC_1h_Balanced", &make_trades(3)).unwrap();
        assert_eq!(ledger.load("BTC_1h_Balanced").unwrap().len(), 3);
    }

    #[test]
    fn missing_blob_is_a_distinct_error() {
        let (_dir, ledger) = ledger();
        assert!(matches!(
            ledger.load("GHOST_1h_Balanced"),
            Err(LedgerError::Missing { .. })
        ));
    }

    #[test]
    fn load_many_skips_missing_entries() {
        let (_dir, ledger) = ledger();
        ledger.save("BTC_1h_Balanced", &make_trades(5)).unwrap();
        let loaded = ledger.load_many(&[
            "BTC_1h_Balanced".to_string(),
            "GHOST_1h_Balanced".to_string(),
        ]);
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains_key("BTC_1h_Balanced"));
    }

    #[test]
    fn delete_reports_presence() {
        let (_dir, ledger) = ledger();
        ledger.save("BTC_1h_Balanced", &make_trades(1)).unwrap();
        assert!(ledger.delete("BTC_1h_Balanced").unwrap());
        assert!(!ledger.delete("BTC_1h_Balanced").unwrap());
    }

    #[test]
    fn csv_export_round_trips_within_tolerance() {
        let (dir, ledger) = ledger();
        let trades = make_trades(4);
        ledger.save("BTC_1h_Balanced", &trades).unwrap();
        let out = dir.path().join("export.csv");
        let exported = ledger.export_csv("BTC_1h_Balanced", &out).unwrap();
        assert_eq!(exported, 4);

        let content = std::fs::read_to_string(&out).unwrap();
        let mut lines = content.lines();
        let header = lines.next().unwrap();
        assert!(header.starts_with("entry_time,exit_time,entry_price"));
        for (line, trade) in lines.zip(&trades) {
            let fields: Vec<&str> = line.split(',').collect();
            assert_eq!(fields.len(), 15);
            let entry_price: f64 = fields[2].parse().unwrap();
            let pnl: f64 = fields[7].parse().unwrap();
            assert!((entry_price - trade.entry_price).abs() <= 1e-9);
            assert!((pnl - trade.pnl_pct).abs() <= 1e-9);
            assert_eq!(fields[9], "profit");
            assert_eq!(fields[10], "Balanced");
        }
    }

    #[test]
    fn empty_ledger_is_storable() {
        let (_dir, ledger) = ledger();
        ledger.save("BTC_1h_Balanced", &[]).unwrap();
        assert!(ledger.load("BTC_1h_Balanced").unwrap().is_empty());
    }
}
