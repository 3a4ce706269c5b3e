use std::fmt::Display;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use pm_core::errors::PmError;

/// Per-walker progress log: `[<walker>:<timestamp>] message` lines.
///
/// Without a file the journal only forwards to the `log` facade. Write
/// failures are reported once and never stop the walker.
#[derive(Debug)]
pub struct WalkerJournal {
    walker_id: usize,
    file: Option<File>,
    failed: bool,
}

impl WalkerJournal {
    /// Journal appending to `path`.
    pub fn open(path: &Path, walker_id: usize) -> Result<Self, PmError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| PmError::io("journal-mkdir", parent, err))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| PmError::io("journal-open", path, err))?;
        Ok(Self {
            walker_id,
            file: Some(file),
            failed: false,
        })
    }

    /// Journal without a backing file.
    pub fn detached(walker_id: usize) -> Self {
        Self {
            walker_id,
            file: None,
            failed: false,
        }
    }

    /// Appends one line.
    pub fn line(&mut self, message: impl Display) {
        debug!("[walker {}] {message}", self.walker_id);
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        if let Err(err) = writeln!(file, "[{}:{stamp}] {message}", self.walker_id) {
            if !self.failed {
                warn!("walker {} journal write failed: {err}", self.walker_id);
                self.failed = true;
            }
        }
    }
}

/// Append-only log of caught failures, shared by every walker of a run.
#[derive(Debug, Clone)]
pub struct ExceptionsLog {
    path: Option<PathBuf>,
}

impl ExceptionsLog {
    /// Log appending to `path`, or only to the `log` facade when `None`.
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    /// Records a failure of `walker_id` at `step`.
    pub fn record(&self, walker_id: usize, step: u64, error: &PmError) {
        warn!("walker {walker_id} step {step}: {error}");
        let Some(path) = &self.path else {
            return;
        };
        let line = format!(
            "[{walker_id}:{}] step {step}: {error}\n",
            chrono::Utc::now().to_rfc3339()
        );
        let written = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| file.write_all(line.as_bytes()));
        if let Err(err) = written {
            warn!("could not append to {}: {err}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pm_core::errors::ErrorInfo;

    #[test]
    fn journal_lines_carry_the_walker_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("walker3.log");
        let mut journal = WalkerJournal::open(&path, 3).unwrap();
        journal.line("started");
        journal.line(format_args!("step {}", 1));
        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("[3:"));
        assert!(lines[1].ends_with("] step 1"));
    }

    #[test]
    fn exceptions_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exceptions.log");
        let log = ExceptionsLog::new(Some(path.clone()));
        let error = PmError::Oracle(ErrorInfo::new("boom", "scorer crashed"));
        log.record(0, 4, &error);
        log.record(1, 9, &error);
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.contains("step 9"));
    }
}
