//! # raftline-storage
//!
//! why: provide a durable raft log and vote record using standard rust fs apis
//! relations: implements the Log trait from raftline-core
//! what: FileLog, a json-file log with an in-memory mirror

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use raftline_core::{Log, LogEntry, LogError, Operation};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

const META_FILE: &str = "meta.json";
const LOG_FILE: &str = "log.json";

/// metadata structure for term and vote
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct MetaData {
    term: u64,
    voted_for: Option<u64>,
}

/// File-backed log.
///
/// Stores state in a directory with:
/// - meta.json: current term and vote
/// - log.json: array of log entries
///
/// Every mutation is written to a temp file, synced and renamed over the
/// previous file before memory is updated, so a failed write leaves both the
/// files and the in-memory mirror unchanged.
#[derive(Debug)]
pub struct FileLog {
    dir: PathBuf,
    meta: MetaData,
    entries: Vec<LogEntry>,
}

impl FileLog {
    /// Open the log in `dir`, creating the directory if it doesn't exist.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, LogError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let meta = match read_json::<MetaData>(&dir.join(META_FILE))? {
            Some(meta) => meta,
            None => MetaData::default(),
        };
        let entries = read_json::<Vec<LogEntry>>(&dir.join(LOG_FILE))?.unwrap_or_default();
        for (position, entry) in entries.iter().enumerate() {
            let expected = position as u64 + 1;
            if entry.index != expected {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("log entry at position {position} has index {}, expected {expected}", entry.index),
                )
                .into());
            }
        }

        debug!(dir = %dir.display(), term = meta.term, entries = entries.len(), "opened file log");
        Ok(Self { dir, meta, entries })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove all persisted state.
    pub fn clear(&mut self) -> Result<(), LogError> {
        for name in [META_FILE, LOG_FILE] {
            match fs::remove_file(self.dir.join(name)) {
                Ok(()) => {}
                Err(error) if error.kind() == io::ErrorKind::NotFound => {}
                Err(error) => return Err(error.into()),
            }
        }
        self.meta = MetaData::default();
        self.entries.clear();
        Ok(())
    }

    // TODO: switch to an append-only segment file; log.json is rewritten in full on every append
    fn write_entries(&self, entries: &[LogEntry]) -> Result<(), LogError> {
        write_atomic(&self.dir, LOG_FILE, entries)
    }
}

impl Log for FileLog {
    fn append(&mut self, term: u64, operation: Operation) -> Result<u64, LogError> {
        let index = self.entries.len() as u64 + 1;
        self.entries.push(LogEntry::new(term, index, operation));
        if let Err(error) = self.write_entries(&self.entries) {
            self.entries.pop();
            return Err(error);
        }
        trace!(index, term, "appended entry");
        Ok(index)
    }

    fn get(&self, index: u64) -> Option<LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get(index as usize - 1).cloned()
    }

    fn truncate_after(&mut self, index: u64) -> Result<(), LogError> {
        let keep = (index as usize).min(self.entries.len());
        if keep == self.entries.len() {
            return Ok(());
        }
        self.write_entries(&self.entries[..keep])?;
        debug!(removed = self.entries.len() - keep, last_index = keep, "truncated log");
        self.entries.truncate(keep);
        Ok(())
    }

    fn last_index(&self) -> u64 {
        self.entries.len() as u64
    }

    fn last_term(&self) -> u64 {
        self.entries.last().map(|entry| entry.term).unwrap_or(0)
    }

    fn save_vote(&mut self, term: u64, voted_for: Option<u64>) -> Result<(), LogError> {
        let meta = MetaData { term, voted_for };
        write_atomic(&self.dir, META_FILE, &meta)?;
        self.meta = meta;
        Ok(())
    }

    fn load_vote(&self) -> Result<(u64, Option<u64>), LogError> {
        Ok((self.meta.term, self.meta.voted_for))
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>, LogError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(error) => return Err(error.into()),
    };
    Ok(Some(serde_json::from_str(&contents)?))
}

/// atomic write: write to temp file then rename
fn write_atomic<T: Serialize + ?Sized>(dir: &Path, name: &str, value: &T) -> Result<(), LogError> {
    let json = serde_json::to_vec_pretty(value)?;
    let temp_path = dir.join(format!("{name}.tmp"));
    let mut file = File::create(&temp_path)?;
    file.write_all(&json)?;
    file.sync_all()?;
    fs::rename(&temp_path, dir.join(name))?;
    Ok(())
}
