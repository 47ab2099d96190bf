// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::path::{Path, PathBuf};

use rocksdb::{Direction, IteratorMode, Options, WriteBatch, WriteOptions, DB};
use tracing::info;

use super::{HardState, LogEntry};
use crate::{AppError, AppResult};

/// Durable home of the hard state and the consensus log.
///
/// Indexes start at 1. `append` replaces any stored entry at or after the
/// first appended index, which is how a follower drops a conflicting suffix.
pub trait RaftStorage: Send + 'static {
    fn hard_state(&self) -> AppResult<Option<HardState>>;
    fn save_hard_state(&mut self, state: &HardState) -> AppResult<()>;
    fn first_index(&self) -> AppResult<Option<u64>>;
    fn last_index(&self) -> AppResult<Option<u64>>;
    fn entry(&self, index: u64) -> AppResult<Option<LogEntry>>;
    /// Entries in `[lo, hi)`.
    fn entries(&self, lo: u64, hi: u64) -> AppResult<Vec<LogEntry>>;
    fn append(&mut self, entries: &[LogEntry]) -> AppResult<()>;
    /// Removes every entry with an index up to and including `index`.
    fn purge_to(&mut self, index: u64) -> AppResult<()>;

    fn is_empty(&self) -> AppResult<bool> {
        Ok(self.hard_state()?.is_none() && self.last_index()?.is_none())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    hard_state: Option<HardState>,
    entries: BTreeMap<u64, LogEntry>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RaftStorage for MemoryStorage {
    fn hard_state(&self) -> AppResult<Option<HardState>> {
        Ok(self.hard_state.clone())
    }

    fn save_hard_state(&mut self, state: &HardState) -> AppResult<()> {
        self.hard_state = Some(state.clone());
        Ok(())
    }

    fn first_index(&self) -> AppResult<Option<u64>> {
        Ok(self.entries.keys().next().copied())
    }

    fn last_index(&self) -> AppResult<Option<u64>> {
        Ok(self.entries.keys().next_back().copied())
    }

    fn entry(&self, index: u64) -> AppResult<Option<LogEntry>> {
        Ok(self.entries.get(&index).cloned())
    }

    fn entries(&self, lo: u64, hi: u64) -> AppResult<Vec<LogEntry>> {
        if lo >= hi {
            return Ok(Vec::new());
        }
        Ok(self.entries.range(lo..hi).map(|(_, e)| e.clone()).collect())
    }

    fn append(&mut self, entries: &[LogEntry]) -> AppResult<()> {
        if let Some(first) = entries.first() {
            self.entries.split_off(&first.index);
            for entry in entries {
                self.entries.insert(entry.index, entry.clone());
            }
        }
        Ok(())
    }

    fn purge_to(&mut self, index: u64) -> AppResult<()> {
        self.entries = self.entries.split_off(&index.saturating_add(1));
        Ok(())
    }
}

const HARD_STATE_KEY: &[u8] = b"hard_state";
const ENTRY_PREFIX: &[u8] = b"entry/";

fn entry_key(index: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(ENTRY_PREFIX.len() + 8);
    key.extend_from_slice(ENTRY_PREFIX);
    key.extend_from_slice(&index.to_be_bytes());
    key
}

fn index_of(key: &[u8]) -> Option<u64> {
    let raw = key.strip_prefix(ENTRY_PREFIX)?;
    let bytes: [u8; 8] = raw.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

/// RocksDB backed storage. Every write is synced before returning.
pub struct RocksStorage {
    db: DB,
    path: PathBuf,
}

impl Debug for RocksStorage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksStorage").field("path", &self.path).finish()
    }
}

impl RocksStorage {
    pub fn open(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, &path)?;
        info!("opened raft log at {:?}", path);
        Ok(RocksStorage { db, path })
    }

    fn sync_write(&self, batch: WriteBatch) -> AppResult<()> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn decode(value: &[u8]) -> AppResult<LogEntry> {
        Ok(serde_json::from_slice(value)?)
    }

    fn boundary(&self, mode: IteratorMode) -> AppResult<Option<u64>> {
        match self.db.iterator(mode).next() {
            Some(item) => {
                let (key, _) = item?;
                Ok(index_of(&key))
            }
            None => Ok(None),
        }
    }
}

impl RaftStorage for RocksStorage {
    fn hard_state(&self) -> AppResult<Option<HardState>> {
        match self.db.get(HARD_STATE_KEY)? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn save_hard_state(&mut self, state: &HardState) -> AppResult<()> {
        let mut batch = WriteBatch::default();
        batch.put(HARD_STATE_KEY, serde_json::to_vec(state)?);
        self.sync_write(batch)
    }

    fn first_index(&self) -> AppResult<Option<u64>> {
        self.boundary(IteratorMode::From(ENTRY_PREFIX, Direction::Forward))
    }

    fn last_index(&self) -> AppResult<Option<u64>> {
        self.boundary(IteratorMode::From(&entry_key(u64::MAX), Direction::Reverse))
    }

    fn entry(&self, index: u64) -> AppResult<Option<LogEntry>> {
        match self.db.get(entry_key(index))? {
            Some(value) => Ok(Some(Self::decode(&value)?)),
            None => Ok(None),
        }
    }

    fn entries(&self, lo: u64, hi: u64) -> AppResult<Vec<LogEntry>> {
        let mut entries = Vec::new();
        if lo >= hi {
            return Ok(entries);
        }
        let start = entry_key(lo);
        for item in self
            .db
            .iterator(IteratorMode::From(&start, Direction::Forward))
        {
            let (key, value) = item?;
            match index_of(&key) {
                Some(index) if index < hi => entries.push(Self::decode(&value)?),
                _ => break,
            }
        }
        Ok(entries)
    }

    fn append(&mut self, entries: &[LogEntry]) -> AppResult<()> {
        let Some(first) = entries.first() else {
            return Ok(());
        };
        let mut batch = WriteBatch::default();
        if let Some(last) = self.last_index()? {
            if last >= first.index {
                batch.delete_range(entry_key(first.index), entry_key(last + 1));
            }
        }
        let mut expected = first.index;
        for entry in entries {
            if entry.index != expected {
                return Err(AppError::IllegalStateError(format!(
                    "raft entries not contiguous: expected {}, got {}",
                    expected, entry.index
                )));
            }
            batch.put(entry_key(entry.index), serde_json::to_vec(entry)?);
            expected += 1;
        }
        self.sync_write(batch)
    }

    fn purge_to(&mut self, index: u64) -> AppResult<()> {
        let mut batch = WriteBatch::default();
        batch.delete_range(entry_key(0), entry_key(index.saturating_add(1)));
        self.sync_write(batch)
    }
}
