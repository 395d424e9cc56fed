//! Filesystem locations used by the service.
//!
//! Everything the process writes lives under one data directory so a
//! deployment only has to mount a single volume.

use std::env;
use std::io;
use std::path::PathBuf;

const ROOT_ENV: &str = "RAG_ASSISTANT_ROOT";
const DATA_DIR_ENV: &str = "RAG_ASSISTANT_DATA_DIR";

#[derive(Debug, Clone)]
pub struct AppPaths {
    /// Directory holding the shipped `config.yml`.
    pub project_root: PathBuf,
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub db_path: PathBuf,
    pub secrets_path: PathBuf,
}

impl AppPaths {
    /// Resolves `RAG_ASSISTANT_ROOT` (default: working directory) and
    /// `RAG_ASSISTANT_DATA_DIR` (default: `<root>/data`).
    pub fn from_env() -> Self {
        Self::resolve(|key| env::var(key).ok())
    }

    fn resolve(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let project_root = lookup(ROOT_ENV)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .or_else(|| env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));
        let data_dir = lookup(DATA_DIR_ENV)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| project_root.join("data"));
        Self::with_data_dir(project_root, data_dir)
    }

    pub fn with_data_dir(project_root: PathBuf, data_dir: PathBuf) -> Self {
        Self {
            log_dir: data_dir.join("logs"),
            db_path: data_dir.join("sessions.db"),
            secrets_path: data_dir.join("secrets.yaml"),
            project_root,
            data_dir,
        }
    }

    /// Creates the data and log directories.
    pub fn ensure_dirs(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(&self.log_dir)
    }
}
