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

use std::fs::{File, OpenOptions};
use std::path::Path;

use memmap2::{Mmap, MmapMut, MmapOptions};

use crate::{AppError, AppResult};

pub const INDEX_ENTRY_SIZE: usize = 8;

/// Sparse offset index of a sealed segment, trimmed to its entries.
#[derive(Debug)]
pub struct ReadOnlyIndexFile {
    mmap: Option<Mmap>,
    entries: usize,
}

/// Index of the active segment, preallocated to its maximum size.
#[derive(Debug)]
pub struct WritableIndexFile {
    file: File,
    mmap: MmapMut,
    entries: usize,
    max_entry_count: usize,
}

impl ReadOnlyIndexFile {
    pub fn open<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let file = File::options().read(true).open(path.as_ref())?;
        let len = file.metadata()?.len() as usize;
        let entries = len / INDEX_ENTRY_SIZE;
        if entries == 0 {
            return Ok(Self {
                mmap: None,
                entries: 0,
            });
        }
        // SAFETY: index files are only rewritten through a rename, never in place
        let mmap = unsafe { MmapOptions::new().len(entries * INDEX_ENTRY_SIZE).map(&file)? };
        Ok(Self {
            mmap: Some(mmap),
            entries,
        })
    }

    /// Greatest entry whose relative offset is `<= target`.
    pub fn lookup(&self, target: u32) -> Option<(u32, u32)> {
        self.mmap
            .as_ref()
            .and_then(|mmap| binary_search_index(&mmap[..], self.entries, target))
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn entry(&self, n: usize) -> Option<(u32, u32)> {
        if n >= self.entries {
            return None;
        }
        self.mmap.as_ref().map(|mmap| read_entry(&mmap[..], n))
    }
}

impl WritableIndexFile {
    /// Creates (or truncates) the index at `path` and preallocates `max_size` bytes.
    pub fn create<P: AsRef<Path>>(path: P, max_size: usize) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        let max_entry_count = (max_size / INDEX_ENTRY_SIZE).max(1);
        file.set_len((max_entry_count * INDEX_ENTRY_SIZE) as u64)?;
        // SAFETY: the file was just created by us and is not mapped anywhere else
        let mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        Ok(Self {
            file,
            mmap,
            entries: 0,
            max_entry_count,
        })
    }

    pub fn add_entry(&mut self, relative_offset: u32, position: u32) -> AppResult<()> {
        if self.is_full() {
            return Err(AppError::InvalidOperation("index file is full".into()));
        }
        if let Some((last_offset, last_position)) = self.last_entry() {
            if relative_offset <= last_offset || position < last_position {
                return Err(AppError::InvalidOperation(format!(
                    "index entry ({relative_offset}, {position}) does not follow ({last_offset}, {last_position})"
                )));
            }
        }
        let at = self.entries * INDEX_ENTRY_SIZE;
        self.mmap[at..at + 4].copy_from_slice(&relative_offset.to_be_bytes());
        self.mmap[at + 4..at + 8].copy_from_slice(&position.to_be_bytes());
        self.entries += 1;
        Ok(())
    }

    pub fn lookup(&self, target: u32) -> Option<(u32, u32)> {
        binary_search_index(&self.mmap[..], self.entries, target)
    }

    pub fn last_entry(&self) -> Option<(u32, u32)> {
        if self.entries == 0 {
            None
        } else {
            Some(read_entry(&self.mmap[..], self.entries - 1))
        }
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn is_full(&self) -> bool {
        self.entries >= self.max_entry_count
    }

    pub fn flush(&self) -> AppResult<()> {
        self.mmap
            .flush()
            .map_err(|e| AppError::DetailedIoError(format!("flush index file error: {}", e)))
    }

    /// Flushes, trims the preallocated tail and remaps read-only.
    pub fn into_readonly(self) -> std::io::Result<ReadOnlyIndexFile> {
        let WritableIndexFile {
            file,
            mmap,
            entries,
            ..
        } = self;
        mmap.flush()?;
        drop(mmap);
        file.set_len((entries * INDEX_ENTRY_SIZE) as u64)?;
        file.sync_all()?;
        if entries == 0 {
            return Ok(ReadOnlyIndexFile {
                mmap: None,
                entries: 0,
            });
        }
        // SAFETY: the writable map was dropped above and the file is no longer written
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        Ok(ReadOnlyIndexFile {
            mmap: Some(mmap),
            entries,
        })
    }
}

fn read_entry(slice: &[u8], n: usize) -> (u32, u32) {
    let at = n * INDEX_ENTRY_SIZE;
    let offset = u32::from_be_bytes([slice[at], slice[at + 1], slice[at + 2], slice[at + 3]]);
    let position = u32::from_be_bytes([slice[at + 4], slice[at + 5], slice[at + 6], slice[at + 7]]);
    (offset, position)
}

fn binary_search_index(slice: &[u8], entries: usize, target: u32) -> Option<(u32, u32)> {
    if entries == 0 || read_entry(slice, 0).0 > target {
        return None;
    }
    // invariant: entry[lo] <= target, entry[hi] > target (hi may be one past the end)
    let mut lo = 0;
    let mut hi = entries;
    while hi - lo > 1 {
        let mid = lo + (hi - lo) / 2;
        if read_entry(slice, mid).0 <= target {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    Some(read_entry(slice, lo))
}
