//! Durable consensus storage.
//!
//! One append-only WAL file per node holds both the log entries and the
//! stable state (current term, vote) as JSON-line records; the same file
//! handle serves both roles and is opened exactly once per process.
//! Compaction and truncation are recorded as tombstone records and the
//! file is rewritten in canonical form on the next open, before the
//! long-lived handle exists.
//!
//! Snapshots live in their own directory, one file per snapshot, written
//! through a temp-file sink that only renames into place on commit.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::consensus::state::LogEntry;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum WalRecord {
    Stable {
        term: u64,
        voted_for: Option<String>,
    },
    Entry {
        entry: LogEntry,
    },
    Truncate {
        from_index: u64,
    },
    Compact {
        through_index: u64,
        term: u64,
    },
    Member {
        id: String,
        addr: String,
    },
}

/// State recovered from the WAL at open time.
#[derive(Debug, Default)]
pub struct WalState {
    pub current_term: u64,
    pub voted_for: Option<String>,
    pub entries: Vec<LogEntry>,
    pub snapshot_index: u64,
    pub snapshot_term: u64,
    /// Known cluster members, id -> address. Kept in the stable store so
    /// membership survives log compaction.
    pub members: BTreeMap<String, String>,
}

impl WalState {
    fn apply_record(&mut self, record: WalRecord) {
        match record {
            WalRecord::Stable { term, voted_for } => {
                self.current_term = term;
                self.voted_for = voted_for;
            }
            WalRecord::Entry { entry } => {
                // An entry at an index supersedes anything at or past it.
                self.entries.retain(|e| e.index < entry.index);
                self.entries.push(entry);
            }
            WalRecord::Truncate { from_index } => {
                self.entries.retain(|e| e.index < from_index);
            }
            WalRecord::Compact {
                through_index,
                term,
            } => {
                self.entries.retain(|e| e.index > through_index);
                self.snapshot_index = through_index;
                self.snapshot_term = term;
            }
            WalRecord::Member { id, addr } => {
                self.members.insert(id, addr);
            }
        }
    }
}

/// Append-only durable log + stable store behind a single file handle.
pub struct WalStore {
    path: PathBuf,
    file: File,
}

impl WalStore {
    /// Open (or create) the WAL at `path`, replaying existing records.
    ///
    /// Replay stops at the first unparsable line (a torn tail from a
    /// crash); the surviving state is rewritten in canonical form before
    /// the durable handle opens, so the handle is never reopened later.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<(Self, WalState)> {
        let path = path.into();
        let mut state = WalState::default();
        let mut needs_rewrite = false;

        if path.exists() {
            let content = fs::read_to_string(&path)?;
            for line in content.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<WalRecord>(line) {
                    Ok(record) => {
                        if matches!(
                            record,
                            WalRecord::Truncate { .. } | WalRecord::Compact { .. }
                        ) {
                            needs_rewrite = true;
                        }
                        state.apply_record(record);
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "truncating torn wal tail");
                        needs_rewrite = true;
                        break;
                    }
                }
            }
        }

        if needs_rewrite {
            Self::rewrite(&path, &state)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok((Self { path, file }, state))
    }

    /// Rewrite the file to hold exactly the recovered state. Runs only
    /// during `open`, before the long-lived handle exists.
    fn rewrite(path: &Path, state: &WalState) -> io::Result<()> {
        let tmp_path = path.with_extension("rewrite");
        {
            let mut tmp = File::create(&tmp_path)?;
            write_record(
                &mut tmp,
                &WalRecord::Stable {
                    term: state.current_term,
                    voted_for: state.voted_for.clone(),
                },
            )?;
            if state.snapshot_index > 0 {
                write_record(
                    &mut tmp,
                    &WalRecord::Compact {
                        through_index: state.snapshot_index,
                        term: state.snapshot_term,
                    },
                )?;
            }
            for (id, addr) in &state.members {
                write_record(
                    &mut tmp,
                    &WalRecord::Member {
                        id: id.clone(),
                        addr: addr.clone(),
                    },
                )?;
            }
            for entry in &state.entries {
                write_record(
                    &mut tmp,
                    &WalRecord::Entry {
                        entry: entry.clone(),
                    },
                )?;
            }
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, path)
    }

    fn append(&mut self, record: &WalRecord) -> io::Result<()> {
        write_record(&mut self.file, record)?;
        self.file.sync_data()
    }

    /// Persist the stable state (term and vote).
    pub fn append_stable(&mut self, term: u64, voted_for: Option<&str>) -> io::Result<()> {
        self.append(&WalRecord::Stable {
            term,
            voted_for: voted_for.map(str::to_string),
        })
    }

    /// Persist a log entry.
    pub fn append_entry(&mut self, entry: &LogEntry) -> io::Result<()> {
        self.append(&WalRecord::Entry {
            entry: entry.clone(),
        })
    }

    /// Record that entries from `from_index` on were discarded.
    pub fn append_truncate(&mut self, from_index: u64) -> io::Result<()> {
        self.append(&WalRecord::Truncate { from_index })
    }

    /// Record that entries through `through_index` were folded into a
    /// snapshot.
    pub fn append_compact(&mut self, through_index: u64, term: u64) -> io::Result<()> {
        self.append(&WalRecord::Compact {
            through_index,
            term,
        })
    }

    /// Persist a cluster member's address.
    pub fn append_member(&mut self, id: &str, addr: &str) -> io::Result<()> {
        self.append(&WalRecord::Member {
            id: id.to_string(),
            addr: addr.to_string(),
        })
    }

    /// Flush everything to disk. Called on shutdown after the consensus
    /// loop has stopped; the handle closes when the store drops.
    pub fn sync(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_record(file: &mut File, record: &WalRecord) -> io::Result<()> {
    let mut line = serde_json::to_vec(record).map_err(io::Error::other)?;
    line.push(b'\n');
    file.write_all(&line)
}

/// Identity of one snapshot: the last log entry it covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub index: u64,
    pub term: u64,
}

/// A writable snapshot destination. `commit` makes the snapshot visible;
/// `cancel` discards it. Exactly one of the two must be called.
pub trait SnapshotSink: Write {
    fn commit(self) -> io::Result<()>;
    fn cancel(self) -> io::Result<()>;
}

/// File-backed snapshot storage, newest-wins.
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Begin writing a snapshot. Nothing is visible until the sink commits.
    pub fn create(&self, meta: SnapshotMeta) -> io::Result<FileSnapshotSink> {
        let final_path = self.dir.join(snapshot_file_name(meta));
        let tmp_path = final_path.with_extension("tmp");
        let file = File::create(&tmp_path)?;
        Ok(FileSnapshotSink {
            tmp_path,
            final_path,
            file,
        })
    }

    /// The most recent committed snapshot, if any.
    pub fn latest(&self) -> io::Result<Option<(SnapshotMeta, Vec<u8>)>> {
        let mut newest: Option<(SnapshotMeta, PathBuf)> = None;
        for dir_entry in fs::read_dir(&self.dir)? {
            let path = dir_entry?.path();
            let Some(meta) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(parse_snapshot_file_name)
            else {
                continue;
            };
            if newest.as_ref().map_or(true, |(m, _)| meta.index > m.index) {
                newest = Some((meta, path));
            }
        }
        match newest {
            Some((meta, path)) => Ok(Some((meta, fs::read(path)?))),
            None => Ok(None),
        }
    }

    /// Delete snapshots older than `index`. Best effort; failures are the
    /// caller's to log.
    pub fn prune_older_than(&self, index: u64) -> io::Result<()> {
        for dir_entry in fs::read_dir(&self.dir)? {
            let path = dir_entry?.path();
            let Some(meta) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(parse_snapshot_file_name)
            else {
                continue;
            };
            if meta.index < index {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

fn snapshot_file_name(meta: SnapshotMeta) -> String {
    format!("snap-{:020}-{}.bin", meta.index, meta.term)
}

fn parse_snapshot_file_name(name: &str) -> Option<SnapshotMeta> {
    let rest = name.strip_prefix("snap-")?.strip_suffix(".bin")?;
    let (index, term) = rest.split_once('-')?;
    Some(SnapshotMeta {
        index: index.parse().ok()?,
        term: term.parse().ok()?,
    })
}

pub struct FileSnapshotSink {
    tmp_path: PathBuf,
    final_path: PathBuf,
    file: File,
}

impl Write for FileSnapshotSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl SnapshotSink for FileSnapshotSink {
    fn commit(self) -> io::Result<()> {
        self.file.sync_all()?;
        if let Err(e) = fs::rename(&self.tmp_path, &self.final_path) {
            let _ = fs::remove_file(&self.tmp_path);
            return Err(e);
        }
        Ok(())
    }

    fn cancel(self) -> io::Result<()> {
        fs::remove_file(&self.tmp_path)
    }
}
