//! Shared, crash-safe leaderboard of the best candidates found by any walker.
//!
//! The persisted record is rewritten atomically under an exclusive lock file.
//! A writer first reloads whatever another walker published, merges its own
//! candidate into that view and only writes when the record did not change
//! since it was loaded; otherwise it backs off and retries with the newer
//! view. A small side file carries the best score and the admission cutoff so
//! walkers can skip hopeless candidates without reading the full record.

use std::fmt;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use log::{debug, info, warn};
use pm_core::errors::{ErrorInfo, PmError};
use pm_model::{state_dicts_to_json, CandidateModel, StateDict};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::config::{HiscoreConfig, OutputConfig};
use crate::lock::{Backoff, LockFile};

/// Files making up one persisted leaderboard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HiscorePaths {
    /// Binary record with every slot.
    pub record: PathBuf,
    /// Ranked state dictionaries (used for teleports).
    pub states: PathBuf,
    /// `best=` / `cutoff=` side file.
    pub cutoff: PathBuf,
    /// Lock file guarding writes.
    pub lock: PathBuf,
}

impl HiscorePaths {
    /// Paths configured for a run, `None` without a run directory.
    pub fn from_output(output: &OutputConfig) -> Option<Self> {
        let record = output.resolve(&output.hiscore_file)?;
        Some(Self {
            lock: lock_path_for(&record),
            states: output.resolve(&output.states_file)?,
            cutoff: output.resolve(&output.cutoff_file)?,
            record,
        })
    }

    /// Paths derived from a record file: siblings with fixed suffixes.
    pub fn for_record(record: &Path) -> Self {
        Self {
            lock: lock_path_for(record),
            states: record.with_extension("states.json"),
            cutoff: record.with_extension("cutoff"),
            record: record.to_path_buf(),
        }
    }

    /// Location of the previous record kept before each overwrite.
    pub fn backup(&self) -> PathBuf {
        let mut name = self.record.as_os_str().to_os_string();
        name.push(".old");
        PathBuf::from(name)
    }
}

fn lock_path_for(record: &Path) -> PathBuf {
    let mut name = record.as_os_str().to_os_string();
    name.push(".lock");
    PathBuf::from(name)
}

/// Persisted leaderboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HiscoreRecord {
    /// RFC 3339 time of the write.
    pub timestamp: String,
    /// Monotonic write counter.
    pub generation: u64,
    /// Ranked slots, best first.
    pub slots: Vec<Option<CandidateModel>>,
}

impl HiscoreRecord {
    /// Reads a bincode record.
    pub fn load(path: &Path) -> Result<Self, PmError> {
        let bytes = fs::read(path).map_err(|err| PmError::io("hiscore-read", path, err))?;
        bincode::deserialize(&bytes).map_err(|err| {
            PmError::Hiscore(
                ErrorInfo::new("hiscore-parse", err.to_string())
                    .with_context("path", path.display().to_string()),
            )
        })
    }

    /// Writes the record atomically.
    pub fn store(&self, path: &Path) -> Result<(), PmError> {
        let bytes = bincode::serialize(self).map_err(|err| {
            PmError::Hiscore(ErrorInfo::new("hiscore-serialize", err.to_string()))
        })?;
        write_atomic(path, &bytes)
    }
}

/// Contents of the cutoff side file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CutoffFile {
    /// Best score on the board.
    pub best: f64,
    /// Score a candidate must beat to be admitted.
    pub cutoff: f64,
}

impl CutoffFile {
    /// Summarizes a ranked slot list.
    pub fn from_slots(slots: &[Option<CandidateModel>]) -> Self {
        Self {
            best: slots
                .first()
                .and_then(|slot| slot.as_ref())
                .map_or(0.0, |model| model.score),
            cutoff: admission_cutoff(slots),
        }
    }

    /// Parses `best=` and `cutoff=` lines; unknown lines are ignored.
    pub fn parse(contents: &str) -> Result<Self, PmError> {
        let mut best = None;
        let mut cutoff = None;
        for line in contents.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value: f64 = value.trim().parse().map_err(|_| {
                PmError::Hiscore(
                    ErrorInfo::new("cutoff-parse", "side file value is not a number")
                        .with_context("line", line),
                )
            })?;
            match key.trim() {
                "best" => best = Some(value),
                "cutoff" => cutoff = Some(value),
                _ => {}
            }
        }
        match (best, cutoff) {
            (Some(best), Some(cutoff)) => Ok(Self { best, cutoff }),
            _ => Err(PmError::Hiscore(ErrorInfo::new(
                "cutoff-parse",
                "side file lacks best or cutoff",
            ))),
        }
    }

    /// Reads the side file.
    pub fn load(path: &Path) -> Result<Self, PmError> {
        let contents =
            fs::read_to_string(path).map_err(|err| PmError::io("cutoff-read", path, err))?;
        Self::parse(&contents)
    }

    /// Writes the side file atomically.
    pub fn store(&self, path: &Path) -> Result<(), PmError> {
        write_atomic(path, self.to_string().as_bytes())
    }
}

impl fmt::Display for CutoffFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "best={}", self.best)?;
        writeln!(f, "cutoff={}", self.cutoff)
    }
}

/// Score of the last slot of a full board, zero while a slot is free.
pub fn admission_cutoff(slots: &[Option<CandidateModel>]) -> f64 {
    match slots.last() {
        Some(Some(model)) => model.score,
        _ => 0.0,
    }
}

/// Result of merging one candidate into a slot list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insertion {
    /// A near-identical model already holds this rank.
    Duplicate(usize),
    /// The candidate beats no slot.
    NotBetter,
    /// The candidate now holds this rank.
    Inserted(usize),
}

/// Inserts `candidate` into `slots` (padded or truncated to `capacity`).
///
/// Near-identical models are never admitted twice, and a score already listed
/// is never admitted again, which keeps the listed scores strictly
/// descending. Otherwise the candidate takes the first slot it beats (or the
/// first empty one), demoting everything below by one rank and dropping the
/// last entry.
pub fn insert_candidate(
    slots: &mut Vec<Option<CandidateModel>>,
    capacity: usize,
    candidate: &CandidateModel,
) -> Insertion {
    slots.resize(capacity, None);
    if let Some(rank) = slots
        .iter()
        .position(|slot| slot.as_ref().is_some_and(|model| model.almost_same_as(candidate)))
    {
        return Insertion::Duplicate(rank);
    }
    if slots.iter().flatten().any(|model| model.score == candidate.score) {
        return Insertion::NotBetter;
    }
    let position = slots.iter().position(|slot| match slot {
        Some(model) => candidate.score > model.score,
        None => true,
    });
    let Some(rank) = position else {
        return Insertion::NotBetter;
    };
    slots.insert(rank, Some(candidate.detached()));
    slots.truncate(capacity);
    Insertion::Inserted(rank)
}

/// What happened to a submitted candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsiderOutcome {
    /// Not positive or not above the admission cutoff.
    BelowCutoff,
    /// A near-identical model is already listed.
    Duplicate {
        /// Rank of the existing entry.
        rank: usize,
    },
    /// Published at this rank.
    Inserted {
        /// Rank of the new entry.
        rank: usize,
    },
    /// Contention did not clear within the retry budget.
    Abandoned,
}

impl fmt::Display for ConsiderOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsiderOutcome::BelowCutoff => write!(f, "below cutoff"),
            ConsiderOutcome::Duplicate { rank } => write!(f, "duplicate of rank {rank}"),
            ConsiderOutcome::Inserted { rank } => write!(f, "inserted at rank {rank}"),
            ConsiderOutcome::Abandoned => write!(f, "abandoned after contention"),
        }
    }
}

enum Persist {
    Written,
    Stale,
    Busy,
}

/// One walker's view of the shared leaderboard.
#[derive(Debug, Clone)]
pub struct Hiscores {
    config: HiscoreConfig,
    paths: Option<HiscorePaths>,
    slots: Vec<Option<CandidateModel>>,
    loaded_mtime: Option<SystemTime>,
    generation: u64,
}

impl Hiscores {
    /// Leaderboard persisted at `paths`.
    pub fn persistent(config: HiscoreConfig, paths: HiscorePaths) -> Self {
        let slots = vec![None; config.capacity];
        Self {
            config,
            paths: Some(paths),
            slots,
            loaded_mtime: None,
            generation: 0,
        }
    }

    /// Leaderboard living only in memory.
    pub fn in_memory(config: HiscoreConfig) -> Self {
        let slots = vec![None; config.capacity];
        Self {
            config,
            paths: None,
            slots,
            loaded_mtime: None,
            generation: 0,
        }
    }

    /// Ranked slots of the last loaded view.
    pub fn slots(&self) -> &[Option<CandidateModel>] {
        &self.slots
    }

    /// Files backing the board, if persistent.
    pub fn paths(&self) -> Option<&HiscorePaths> {
        self.paths.as_ref()
    }

    /// Write counter of the last loaded or written record.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    /// True when no slot is occupied.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Admission cutoff, taking the side file of other walkers into account.
    pub fn global_cutoff(&self) -> f64 {
        let local = admission_cutoff(&self.slots);
        match self.read_side_file() {
            Some(side) => local.max(side.cutoff),
            None => local,
        }
    }

    /// Best score known to any walker.
    pub fn global_best(&self) -> f64 {
        let local = CutoffFile::from_slots(&self.slots).best;
        match self.read_side_file() {
            Some(side) => local.max(side.best),
            None => local,
        }
    }

    fn read_side_file(&self) -> Option<CutoffFile> {
        let paths = self.paths.as_ref()?;
        match CutoffFile::load(&paths.cutoff) {
            Ok(side) => Some(side),
            Err(err) => {
                debug!("cutoff side file unavailable: {err}");
                None
            }
        }
    }

    /// Reloads the persisted record when it changed since the last load.
    ///
    /// A missing record is an empty board. A record that keeps failing to
    /// parse is replaced by an empty board after the retry budget.
    pub fn refresh(&mut self) -> Result<(), PmError> {
        let Some(paths) = self.paths.clone() else {
            return Ok(());
        };
        let on_disk = modified(&paths.record)?;
        if on_disk == self.loaded_mtime {
            return Ok(());
        }
        let Some(mtime) = on_disk else {
            self.slots = vec![None; self.config.capacity];
            self.loaded_mtime = None;
            return Ok(());
        };
        let mut backoff = Backoff::from_config(&self.config);
        for attempt in 0..=self.config.max_retries {
            match HiscoreRecord::load(&paths.record) {
                Ok(mut record) => {
                    record.slots.resize(self.config.capacity, None);
                    self.slots = record.slots;
                    self.generation = record.generation;
                    self.loaded_mtime = Some(mtime);
                    return Ok(());
                }
                Err(err) if err.code() == "hiscore-read" && !paths.record.exists() => {
                    self.slots = vec![None; self.config.capacity];
                    self.loaded_mtime = None;
                    return Ok(());
                }
                Err(err) => {
                    warn!("loading hiscores failed (attempt {attempt}): {err}");
                    if attempt < self.config.max_retries {
                        backoff.wait();
                    }
                }
            }
        }
        warn!(
            "hiscore record {} is unreadable, continuing with an empty board",
            paths.record.display()
        );
        self.slots = vec![None; self.config.capacity];
        self.loaded_mtime = Some(mtime);
        Ok(())
    }

    /// Offers a candidate to the shared board.
    ///
    /// Contention (a busy lock or a record that changed underneath) is retried
    /// with randomized backoff and finally reported as
    /// [`ConsiderOutcome::Abandoned`]; it is never an error.
    pub fn consider(&mut self, candidate: &CandidateModel) -> Result<ConsiderOutcome, PmError> {
        if !(candidate.score > 0.0) || candidate.score <= self.global_cutoff() {
            return Ok(ConsiderOutcome::BelowCutoff);
        }
        let mut backoff = Backoff::from_config(&self.config);
        for attempt in 0..=self.config.max_retries {
            self.refresh()?;
            let mut next = self.slots.clone();
            let rank = match insert_candidate(&mut next, self.config.capacity, candidate) {
                Insertion::Duplicate(rank) => return Ok(ConsiderOutcome::Duplicate { rank }),
                Insertion::NotBetter => return Ok(ConsiderOutcome::BelowCutoff),
                Insertion::Inserted(rank) => rank,
            };
            match self.persist(&mut next, true)? {
                Persist::Written => {
                    self.slots = next;
                    info!(
                        "walker {} step {} entered the hiscores at rank {rank} with {:.3}",
                        candidate.walker_id, candidate.step, candidate.score
                    );
                    return Ok(ConsiderOutcome::Inserted { rank });
                }
                Persist::Stale => debug!("hiscores changed underneath (attempt {attempt})"),
                Persist::Busy => debug!("hiscore lock busy (attempt {attempt})"),
            }
            if attempt < self.config.max_retries {
                backoff.wait();
            }
        }
        warn!(
            "giving up on publishing walker {} step {}",
            candidate.walker_id, candidate.step
        );
        Ok(ConsiderOutcome::Abandoned)
    }

    /// Replaces the whole board, ignoring what is currently persisted.
    pub fn overwrite(&mut self, slots: Vec<Option<CandidateModel>>) -> Result<(), PmError> {
        let mut next = slots;
        next.resize(self.config.capacity, None);
        match self.persist(&mut next, false)? {
            Persist::Written => {
                self.slots = next;
                Ok(())
            }
            Persist::Stale | Persist::Busy => Err(PmError::Lock(ErrorInfo::new(
                "lock-busy",
                "could not obtain the hiscore lock",
            ))),
        }
    }

    fn persist(
        &mut self,
        next: &mut [Option<CandidateModel>],
        check_stale: bool,
    ) -> Result<Persist, PmError> {
        if self.config.strip_combinations {
            for model in next.iter_mut().skip(1).flatten() {
                model.strip_best_combination();
            }
        }
        let Some(paths) = self.paths.clone() else {
            return Ok(Persist::Written);
        };
        if let Some(parent) = paths.record.parent() {
            fs::create_dir_all(parent).map_err(|err| PmError::io("hiscore-mkdir", parent, err))?;
        }
        let mut backoff = Backoff::from_config(&self.config);
        let lock = match LockFile::acquire(&paths.lock, self.config.max_retries, &mut backoff) {
            Ok(lock) => lock,
            Err(err) if err.code() == "lock-busy" => return Ok(Persist::Busy),
            Err(err) => return Err(err),
        };
        if check_stale && modified(&paths.record)? != self.loaded_mtime {
            return Ok(Persist::Stale);
        }
        if self.config.backups && paths.record.exists() {
            if let Err(err) = fs::copy(&paths.record, paths.backup()) {
                warn!("could not back up {}: {err}", paths.record.display());
            }
        }
        let record = HiscoreRecord {
            timestamp: chrono::Utc::now().to_rfc3339(),
            generation: self.generation + 1,
            slots: next.to_vec(),
        };
        record.store(&paths.record)?;
        let states: Vec<StateDict> = next.iter().flatten().map(StateDict::from_model).collect();
        write_atomic(&paths.states, state_dicts_to_json(&states)?.as_bytes())?;
        CutoffFile::from_slots(next).store(&paths.cutoff)?;
        self.loaded_mtime = modified(&paths.record)?;
        self.generation = record.generation;
        drop(lock);
        Ok(Persist::Written)
    }
}

impl fmt::Display for Hiscores {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:>4} {:>9} {:>7} {:>7} {:>6} {:>6}  spectrum",
            "rank", "score", "Z", "rmax", "walker", "step"
        )?;
        for (rank, slot) in self.slots.iter().enumerate() {
            match slot {
                Some(model) => writeln!(
                    f,
                    "{rank:>4} {:>9.3} {:>7.3} {:>7.3} {:>6} {:>6}  {}",
                    model.score,
                    model.significance,
                    model.rmax,
                    model.walker_id,
                    model.step,
                    model.describe()
                )?,
                None => writeln!(f, "{rank:>4} {:>9}", "-")?,
            }
        }
        Ok(())
    }
}

/// Merges several persisted boards into one of `capacity` slots.
///
/// Unreadable inputs are skipped with a warning; near-identical models are
/// kept once, with the higher score.
pub fn compile_hiscores(
    inputs: &[PathBuf],
    capacity: usize,
) -> Result<Vec<Option<CandidateModel>>, PmError> {
    let mut candidates = Vec::new();
    let mut readable = 0usize;
    for path in inputs {
        match HiscoreRecord::load(path) {
            Ok(record) => {
                readable += 1;
                candidates.extend(record.slots.into_iter().flatten());
            }
            Err(err) => warn!("skipping {}: {err}", path.display()),
        }
    }
    if readable == 0 {
        return Err(PmError::Hiscore(
            ErrorInfo::new("no-inputs", "no readable hiscore record among the inputs")
                .with_context("inputs", inputs.len().to_string()),
        ));
    }
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut slots = vec![None; capacity];
    for candidate in &candidates {
        insert_candidate(&mut slots, capacity, candidate);
    }
    Ok(slots)
}

fn modified(path: &Path) -> Result<Option<SystemTime>, PmError> {
    match fs::metadata(path) {
        Ok(meta) => meta
            .modified()
            .map(Some)
            .map_err(|err| PmError::io("hiscore-mtime", path, err)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(PmError::io("hiscore-mtime", path, err)),
    }
}

/// Writes through a temporary sibling and renames it over `path`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PmError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(|err| PmError::io("atomic-mkdir", dir, err))?;
    let mut file = NamedTempFile::new_in(dir).map_err(|err| PmError::io("atomic-temp", dir, err))?;
    file.write_all(bytes)
        .map_err(|err| PmError::io("atomic-write", path, err))?;
    file.persist(path)
        .map_err(|err| PmError::io("atomic-rename", path, err.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_file_roundtrip() {
        let side = CutoffFile {
            best: 12.5,
            cutoff: 3.25,
        };
        assert_eq!(CutoffFile::parse(&side.to_string()).unwrap(), side);
        assert!(CutoffFile::parse("best=1\n").is_err());
        assert!(CutoffFile::parse("best=x\ncutoff=1").is_err());
    }

    #[test]
    fn sibling_paths() {
        let paths = HiscorePaths::for_record(Path::new("/tmp/run/hiscores.bin"));
        assert_eq!(paths.lock, PathBuf::from("/tmp/run/hiscores.bin.lock"));
        assert_eq!(paths.backup(), PathBuf::from("/tmp/run/hiscores.bin.old"));
        assert_eq!(paths.cutoff, PathBuf::from("/tmp/run/hiscores.cutoff"));
    }
}
