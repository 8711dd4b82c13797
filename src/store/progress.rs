use chrono::{DateTime, Duration, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Cross-process progress state, one JSON document per execution id.
///
/// The orchestrator and its workers share no memory; the filesystem is the
/// only coordination surface. Writes go to a temp file under an exclusive
/// advisory lock and land via atomic rename, so dashboard readers (shared
/// lock) always observe a complete document.
pub struct ProgressTracker {
    progress_dir: PathBuf,
}

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("no progress file for execution '{execution_id}'")]
    NotFound { execution_id: String },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt progress file at {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Running,
    Success,
    Failed,
}

/// Result snapshot for one pipeline component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub status: String,
    pub summary: String,
}

/// The components whose results are tracked individually.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKey {
    SupportResistance,
    MlPrediction,
    MarketContext,
    LeverageDecision,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub symbol: String,
    pub execution_id: String,
    pub start_time: DateTime<Utc>,
    pub current_stage: String,
    pub overall_status: OverallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub support_resistance: Option<StageOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ml_prediction: Option<StageOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market_context: Option<StageOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leverage_decision: Option<StageOutcome>,
    pub final_signal: String,
    pub failure_stage: String,
    pub final_message: String,
}

impl ProgressTracker {
    /// Tracker rooted under the system temp directory.
    pub fn new() -> Result<Self, ProgressError> {
        Self::with_dir(std::env::temp_dir().join("levtrader_progress"))
    }

    pub fn with_dir(progress_dir: impl Into<PathBuf>) -> Result<Self, ProgressError> {
        let progress_dir = progress_dir.into();
        std::fs::create_dir_all(&progress_dir).map_err(|source| ProgressError::Io {
            path: progress_dir.clone(),
            source,
        })?;
        let tracker = Self { progress_dir };
        // Stale files from crashed runs are garbage, not state.
        match tracker.cleanup_older_than(24) {
            Ok(0) => {}
            Ok(removed) => info!(removed, "cleaned up stale progress files"),
            Err(e) => warn!(error = %e, "progress cleanup failed"),
        }
        Ok(tracker)
    }

    fn path_for(&self, execution_id: &str) -> PathBuf {
        self.progress_dir.join(format!("progress_{execution_id}.json"))
    }

    pub fn start(&self, symbol: &str, execution_id: &str) -> Result<ProgressRecord, ProgressError> {
        let record = ProgressRecord {
            symbol: symbol.to_string(),
            execution_id: execution_id.to_string(),
            start_time: Utc::now(),
            current_stage: "initializing".to_string(),
            overall_status: OverallStatus::Running,
            support_resistance: None,
            ml_prediction: None,
            market_context: None,
            leverage_decision: None,
            final_signal: "analyzing".to_string(),
            failure_stage: String::new(),
            final_message: String::new(),
        };
        self.write(&record)?;
        info!(symbol, execution_id, "progress tracking started");
        Ok(record)
    }

    pub fn get(&self, execution_id: &str) -> Result<ProgressRecord, ProgressError> {
        self.read(execution_id)
    }

    pub fn update_stage(&self, execution_id: &str, stage: &str) -> Result<(), ProgressError> {
        self.mutate(execution_id, |r| {
            r.current_stage = stage.to_string();
        })
    }

    pub fn update_stage_result(
        &self,
        execution_id: &str,
        stage: StageKey,
        outcome: StageOutcome,
    ) -> Result<(), ProgressError> {
        self.mutate(execution_id, |r| {
            let slot = match stage {
                StageKey::SupportResistance => &mut r.support_resistance,
                StageKey::MlPrediction => &mut r.ml_prediction,
                StageKey::MarketContext => &mut r.market_context,
                StageKey::LeverageDecision => &mut r.leverage_decision,
            };
            *slot = Some(outcome);
        })
    }

    pub fn complete(
        &self,
        execution_id: &str,
        signal: &str,
        message: &str,
    ) -> Result<(), ProgressError> {
        self.mutate(execution_id, |r| {
            r.overall_status = OverallStatus::Success;
            r.current_stage = "completed".to_string();
            r.final_signal = signal.to_string();
            r.final_message = message.to_string();
        })
    }

    pub fn fail(
        &self,
        execution_id: &str,
        stage: &str,
        message: &str,
    ) -> Result<(), ProgressError> {
        self.mutate(execution_id, |r| {
            r.overall_status = OverallStatus::Failed;
            r.failure_stage = stage.to_string();
            r.final_signal = "no_signal".to_string();
            r.final_message = message.to_string();
        })
    }

    /// Records started within the trailing window, newest first. Unreadable
    /// files are skipped.
    pub fn recent(&self, hours: i64) -> Result<Vec<ProgressRecord>, ProgressError> {
        let cutoff = Utc::now() - Duration::hours(hours);
        let mut records = Vec::new();
        for entry in self.list_files()? {
            match self.read_path(&entry) {
                Ok(record) if record.start_time >= cutoff => records.push(record),
                Ok(_) => {}
                Err(e) => warn!(path = %entry.display(), error = %e, "skipping progress file"),
            }
        }
        records.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(records)
    }

    /// Execution ids whose overall status is still running.
    pub fn active_executions(&self) -> Result<Vec<String>, ProgressError> {
        let mut active = Vec::new();
        for entry in self.list_files()? {
            if let Ok(record) = self.read_path(&entry) {
                if record.overall_status == OverallStatus::Running {
                    active.push(record.execution_id);
                }
            }
        }
        active.sort();
        Ok(active)
    }

    /// Delete progress files older than the window (by file mtime).
    /// Returns the number removed.
    pub fn cleanup_older_than(&self, hours: i64) -> Result<usize, ProgressError> {
        let cutoff = std::time::SystemTime::now()
            - std::time::Duration::from_secs(hours.max(0) as u64 * 3600);
        let mut removed = 0;
        for entry in self.list_files()? {
            let Ok(meta) = std::fs::metadata(&entry) else {
                continue;
            };
            let Ok(mtime) = meta.modified() else { continue };
            if mtime < cutoff {
                match std::fs::remove_file(&entry) {
                    Ok(()) => {
                        removed += 1;
                        debug!(path = %entry.display(), "removed stale progress file");
                    }
                    Err(e) => warn!(path = %entry.display(), error = %e, "cleanup failed"),
                }
            }
        }
        Ok(removed)
    }

    fn list_files(&self) -> Result<Vec<PathBuf>, ProgressError> {
        let entries = std::fs::read_dir(&self.progress_dir).map_err(|source| ProgressError::Io {
            path: self.progress_dir.clone(),
            source,
        })?;
        Ok(entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| {
                p.extension().is_some_and(|ext| ext == "json")
                    && p.file_name()
                        .is_some_and(|n| n.to_string_lossy().starts_with("progress_"))
            })
            .collect())
    }

    fn mutate(
        &self,
        execution_id: &str,
        apply: impl FnOnce(&mut ProgressRecord),
    ) -> Result<(), ProgressError> {
        let mut record = self.read(execution_id)?;
        apply(&mut record);
        self.write(&record)
    }

    fn read(&self, execution_id: &str) -> Result<ProgressRecord, ProgressError> {
        let path = self.path_for(execution_id);
        if !path.exists() {
            return Err(ProgressError::NotFound {
                execution_id: execution_id.to_string(),
            });
        }
        self.read_path(&path)
    }

    fn read_path(&self, path: &Path) -> Result<ProgressRecord, ProgressError> {
        let io_err = |source| ProgressError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut file = std::fs::File::open(path).map_err(io_err)?;
        file.lock_shared().map_err(io_err)?;
        let mut raw = String::new();
        let result = file.read_to_string(&mut raw);
        let _ = fs2::FileExt::unlock(&file);
        result.map_err(io_err)?;
        serde_json::from_str(&raw).map_err(|source| ProgressError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
    }

    fn write(&self, record: &ProgressRecord) -> Result<(), ProgressError> {
        let path = self.path_for(&record.execution_id);
        let io_err = |source| ProgressError::Io {
            path: path.clone(),
            source,
        };

        let json = serde_json::to_vec_pretty(record).expect("progress record serializes");
        let mut tmp = tempfile::NamedTempFile::new_in(&self.progress_dir).map_err(io_err)?;
        tmp.as_file().lock_exclusive().map_err(io_err)?;
        tmp.write_all(&json).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        let _ = fs2::FileExt::unlock(tmp.as_file());
        tmp.persist(&path).map_err(|e| io_err(e.error))?;
        Ok(())
    }
}
