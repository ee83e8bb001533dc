//! File-backed timer store.
//!
//! Every committed transaction is appended to a JSONL journal as one line per
//! write. On open the journal is replayed into memory and compacted to one
//! `save` line per live record.

use std::collections::HashMap;
use std::fs::{self, create_dir_all, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::entity::TimerEntity;
use super::memory::{InMemoryTimerStore, Journal, StoreOp};
use crate::core::{TimerError, TimerRecord, TimerStore, Transaction};
use crate::util::serde::TimerId;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalLine {
    Save { timer: TimerEntity },
    Delete { id: TimerId },
}

impl From<&StoreOp> for JournalLine {
    fn from(op: &StoreOp) -> Self {
        match op {
            StoreOp::Save(record) => Self::Save {
                timer: TimerEntity::from(record),
            },
            StoreOp::Delete(id) => Self::Delete { id: *id },
        }
    }
}

fn backend(err: impl std::fmt::Display) -> TimerError {
    TimerError::Backend(err.to_string())
}

/// Append-only file that can be cut back to an earlier length.
trait JournalFile: Write {
    fn end(&mut self) -> io::Result<u64>;
    fn truncate(&mut self, len: u64) -> io::Result<()>;
    fn sync(&mut self) -> io::Result<()>;
}

impl JournalFile for File {
    fn end(&mut self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

/// Writes whole transactions. A failed append is cut back off the file so
/// the next one never lands behind a partial line. If even that fails the
/// journal refuses further appends; the partial line then stays the last one
/// and is dropped on the next open.
struct FileJournal<F = File> {
    file: Mutex<F>,
    torn: AtomicBool,
}

impl<F> FileJournal<F> {
    fn new(file: F) -> Self {
        Self {
            file: Mutex::new(file),
            torn: AtomicBool::new(false),
        }
    }
}

impl<F: JournalFile + Send> Journal for FileJournal<F> {
    fn append(&self, ops: &[StoreOp]) -> Result<(), TimerError> {
        let mut buf = String::new();
        for op in ops {
            buf.push_str(&serde_json::to_string(&JournalLine::from(op)).map_err(backend)?);
            buf.push('\n');
        }
        let mut file = self.file.lock();
        if self.torn.load(Ordering::Acquire) {
            return Err(TimerError::Backend(
                "journal has a partial write; reopen the store".into(),
            ));
        }
        let start = file.end().map_err(backend)?;
        let Err(err) = file.write_all(buf.as_bytes()).and_then(|()| file.sync()) else {
            return Ok(());
        };
        if let Err(cut) = file.truncate(start) {
            self.torn.store(true, Ordering::Release);
            error!(error = %cut, "could not rewind journal after failed append");
        }
        Err(backend(err))
    }
}

/// Durable store keeping its records in `<dir>/<stream>.jsonl`.
pub struct FileTimerStore {
    path: PathBuf,
    memory: InMemoryTimerStore,
}

impl std::fmt::Debug for FileTimerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileTimerStore")
            .field("path", &self.path)
            .field("records", &self.memory.len())
            .finish()
    }
}

impl FileTimerStore {
    /// Open or create the journal for `stream` under `dir`.
    pub fn open(dir: impl AsRef<Path>, stream: impl Into<String>) -> Result<Self, TimerError> {
        let dir = dir.as_ref();
        create_dir_all(dir).map_err(backend)?;
        let path = dir.join(format!("{}.jsonl", stream.into()));

        let records = load_from_disk(&path)?;
        rewrite_disk(&path, &records)?;
        info!(path = %path.display(), records = records.len(), "timer journal opened");

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(backend)?;
        let journal = FileJournal::new(file);
        Ok(Self {
            path,
            memory: InMemoryTimerStore::with_journal(records, Box::new(journal)),
        })
    }

    /// Journal file location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of committed records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.memory.len()
    }

    /// Whether no records are committed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }
}

fn load_from_disk(path: &Path) -> Result<HashMap<TimerId, TimerRecord>, TimerError> {
    let mut records = HashMap::new();
    if !path.exists() {
        return Ok(records);
    }
    let file = File::open(path).map_err(backend)?;
    let lines = BufReader::new(file)
        .lines()
        .collect::<Result<Vec<_>, _>>()
        .map_err(backend)?;
    let last = lines.len().saturating_sub(1);

    for (idx, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JournalLine>(line) {
            Ok(JournalLine::Save { timer }) => {
                let record = TimerRecord::try_from(timer)?;
                records.insert(record.id, record);
            }
            Ok(JournalLine::Delete { id }) => {
                records.remove(&id);
            }
            // A torn final line is a write cut short by a crash.
            Err(err) if idx == last => {
                warn!(path = %path.display(), error = %err, "discarding incomplete journal tail");
            }
            Err(err) => return Err(backend(format!("{}:{}: {err}", path.display(), idx + 1))),
        }
    }
    Ok(records)
}

fn rewrite_disk(path: &Path, records: &HashMap<TimerId, TimerRecord>) -> Result<(), TimerError> {
    let tmp = path.with_extension("jsonl.tmp");
    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)
            .map_err(backend)?;
        for record in records.values() {
            let line = serde_json::to_string(&JournalLine::Save {
                timer: TimerEntity::from(record),
            })
            .map_err(backend)?;
            writeln!(file, "{line}").map_err(backend)?;
        }
        file.sync_data().map_err(backend)?;
    }
    fs::rename(&tmp, path).map_err(backend)
}

impl TimerStore for FileTimerStore {
    fn save(&self, tx: &Transaction, record: &TimerRecord) -> Result<(), TimerError> {
        self.memory.save(tx, record)
    }

    fn load(&self, tx: &Transaction, id: TimerId) -> Result<Option<TimerRecord>, TimerError> {
        self.memory.load(tx, id)
    }

    fn load_all_active(
        &self,
        tx: &Transaction,
        owner_id: &str,
    ) -> Result<Vec<TimerRecord>, TimerError> {
        self.memory.load_all_active(tx, owner_id)
    }

    fn delete(&self, tx: &Transaction, id: TimerId) -> Result<(), TimerError> {
        self.memory.delete(tx, id)
    }
}
