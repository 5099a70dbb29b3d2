//! Step-scoped log artifacts: `{logs}/<step-name>_<YYYYmmdd_HHMMSS>.log`.

use std::fmt::Display;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepLog {
    path: PathBuf,
}

impl StepLog {
    pub fn new(logs_dir: &Path, step_name: &str, started: DateTime<Local>) -> Self {
        let stamp = started.format("%Y%m%d_%H%M%S");
        Self {
            path: logs_dir.join(format!("{step_name}_{stamp}.log")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append raw bytes, creating the file (and its directory) on first use.
    pub fn append(&self, bytes: &[u8]) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(bytes)
    }

    /// Append one timestamped line.
    pub fn line(&self, message: impl Display) -> io::Result<()> {
        let ts = Local::now().format("%Y-%m-%d %H:%M:%S");
        self.append(format!("{ts} {message}\n").as_bytes())
    }
}
