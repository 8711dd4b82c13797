pub mod db;
pub mod ledger;
pub mod progress;

use std::path::{Path, PathBuf};
use thiserror::Error;

/// When set truthy, pins the analysis DB to the project root regardless of
/// the configured base directory. Guards against a historical failure mode
/// where two components resolved the DB path differently and silently wrote
/// to different files.
pub const FORCE_ROOT_DB_ENV: &str = "FORCE_ROOT_ANALYSIS_DB";

/// Subdirectories reserved for other concerns; analysis data must never be
/// created under them.
const RESERVED_SUBDIRS: [&str; 2] = ["web_dashboard", "dashboard"];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("refusing analysis store under reserved directory '{component}': {path}")]
    ReservedPath { path: PathBuf, component: String },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The single authority for every analysis-store path.
///
/// Metadata DB, ledger blobs and charts all derive their locations from one
/// resolved base directory. Nothing else in the crate is allowed to compute
/// these paths.
#[derive(Debug, Clone)]
pub struct StorePaths {
    base_dir: PathBuf,
    db_path: PathBuf,
}

impl StorePaths {
    pub fn resolve(base_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let base_dir: PathBuf = base_dir.into();

        for component in base_dir.components() {
            let name = component.as_os_str().to_string_lossy();
            if RESERVED_SUBDIRS.contains(&name.as_ref()) {
                return Err(StoreError::ReservedPath {
                    path: base_dir.clone(),
                    component: name.into_owned(),
                });
            }
        }

        let db_path = if force_root_db() {
            let root = base_dir
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
            root.join("analysis.db")
        } else {
            base_dir.join("analysis.db")
        };

        Ok(Self { base_dir, db_path })
    }

    pub fn ensure_dirs(&self) -> Result<(), StoreError> {
        for dir in [&self.base_dir, &self.compressed_dir(), &self.charts_dir()] {
            std::fs::create_dir_all(dir).map_err(|source| StoreError::Io {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn compressed_dir(&self) -> PathBuf {
        self.base_dir.join("compressed")
    }

    pub fn charts_dir(&self) -> PathBuf {
        self.base_dir.join("charts")
    }
}

fn force_root_db() -> bool {
    std::env::var(FORCE_ROOT_DB_ENV)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_lives_under_base_dir() {
        let paths = StorePaths::resolve("/tmp/levtrader-test/analysis").unwrap();
        assert_eq!(
            paths.db_path(),
            Path::new("/tmp/levtrader-test/analysis/analysis.db")
        );
        assert_eq!(
            paths.compressed_dir(),
            Path::new("/tmp/levtrader-test/analysis/compressed")
        );
    }

    #[test]
    fn reserved_subdirectory_is_refused() {
        let err = StorePaths::resolve("/srv/app/web_dashboard/data").unwrap_err();
        match err {
            StoreError::ReservedPath { component, .. } => {
                assert_eq!(component, "web_dashboard");
            }
            other => panic!("expected ReservedPath, got {other:?}"),
        }
    }

    #[test]
    fn dashboard_component_is_refused_anywhere() {
        assert!(StorePaths::resolve("dashboard/data").is_err());
        assert!(StorePaths::resolve("data/dashboard").is_err());
    }
}
