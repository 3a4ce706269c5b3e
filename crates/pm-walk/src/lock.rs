use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use fs2::FileExt;
use log::{debug, warn};
use pm_core::errors::{ErrorInfo, PmError};
use rand::Rng;

use crate::config::HiscoreConfig;

/// Randomized exponential backoff.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    /// Creates a backoff starting at `base` and capped at `max`.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            attempt: 0,
        }
    }

    /// Backoff configured from the hiscore section.
    pub fn from_config(config: &HiscoreConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
        )
    }

    /// Next delay: `base * 2^attempt`, capped, jittered by a factor in `[0.5, 1.5)`.
    pub fn next_delay(&mut self) -> Duration {
        let exponent = self.attempt.min(16);
        self.attempt += 1;
        let nominal = self.base.saturating_mul(1u32 << exponent).min(self.max);
        let jitter: f64 = rand::thread_rng().gen_range(0.5..1.5);
        nominal.mul_f64(jitter)
    }

    /// Sleeps for the next delay.
    pub fn wait(&mut self) {
        let delay = self.next_delay();
        debug!("backing off for {delay:?}");
        thread::sleep(delay);
    }

    /// Number of delays handed out so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

/// Exclusive cross-process lock: an OS advisory lock on a file that stays
/// open for as long as the guard lives.
///
/// The lock file itself is never removed. The kernel releases the lock when
/// the guard is dropped or the holding process dies, so a crashed holder
/// cannot wedge the board.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    file: File,
}

impl LockFile {
    /// Single attempt; `Ok(None)` when another holder owns the lock.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>, PmError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|err| lock_io(path, &err))?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                let stamp = format!("{} {}\n", std::process::id(), chrono::Utc::now().to_rfc3339());
                if let Err(err) = file.set_len(0).and_then(|()| file.write_all(stamp.as_bytes())) {
                    warn!("could not stamp lock {}: {err}", path.display());
                }
                Ok(Some(Self {
                    path: path.to_path_buf(),
                    file,
                }))
            }
            Err(err) if err.raw_os_error() == fs2::lock_contended_error().raw_os_error() => Ok(None),
            Err(err) => Err(lock_io(path, &err)),
        }
    }

    /// Retries with backoff until the lock is obtained or `max_retries` is exhausted.
    pub fn acquire(path: &Path, max_retries: u32, backoff: &mut Backoff) -> Result<Self, PmError> {
        for attempt in 0..=max_retries {
            if let Some(lock) = Self::try_acquire(path)? {
                return Ok(lock);
            }
            if attempt < max_retries {
                backoff.wait();
            }
        }
        Err(PmError::Lock(
            ErrorInfo::new("lock-busy", "lock still held after retries")
                .with_context("path", path.display().to_string())
                .with_context("retries", max_retries.to_string()),
        ))
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!("could not release lock {}: {err}", self.path.display());
        }
    }
}

fn lock_io(path: &Path, err: &std::io::Error) -> PmError {
    PmError::Lock(
        ErrorInfo::new("lock-io", err.to_string()).with_context("path", path.display().to_string()),
    )
}
