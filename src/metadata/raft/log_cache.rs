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

use std::collections::VecDeque;

use super::{HardState, LogEntry, RaftStorage};
use crate::AppResult;

/// Keeps the most recent `capacity` entries in memory in front of the
/// durable storage. The cached entries are always a contiguous tail of the
/// stored log.
#[derive(Debug)]
pub struct LogCache<S: RaftStorage> {
    storage: S,
    cache: VecDeque<LogEntry>,
    capacity: usize,
}

impl<S: RaftStorage> LogCache<S> {
    pub fn new(storage: S, capacity: usize) -> AppResult<Self> {
        let mut cache = VecDeque::with_capacity(capacity);
        if capacity > 0 {
            if let Some(last) = storage.last_index()? {
                let lo = (last + 1).saturating_sub(capacity as u64);
                cache.extend(storage.entries(lo, last + 1)?);
            }
        }
        Ok(LogCache {
            storage,
            cache,
            capacity,
        })
    }

    pub fn hard_state(&self) -> AppResult<Option<HardState>> {
        self.storage.hard_state()
    }

    pub fn save_hard_state(&mut self, state: &HardState) -> AppResult<()> {
        self.storage.save_hard_state(state)
    }

    pub fn is_empty(&self) -> AppResult<bool> {
        self.storage.is_empty()
    }

    pub fn first_index(&self) -> AppResult<Option<u64>> {
        self.storage.first_index()
    }

    pub fn last_index(&self) -> AppResult<Option<u64>> {
        match self.cache.back() {
            Some(entry) => Ok(Some(entry.index)),
            None => self.storage.last_index(),
        }
    }

    fn cached(&self, index: u64) -> Option<&LogEntry> {
        let front = self.cache.front()?.index;
        if index < front {
            return None;
        }
        self.cache.get((index - front) as usize)
    }

    pub fn entry(&self, index: u64) -> AppResult<Option<LogEntry>> {
        match self.cached(index) {
            Some(entry) => Ok(Some(entry.clone())),
            None => self.storage.entry(index),
        }
    }

    pub fn term(&self, index: u64) -> AppResult<Option<u64>> {
        match self.cached(index) {
            Some(entry) => Ok(Some(entry.term)),
            None => Ok(self.storage.entry(index)?.map(|e| e.term)),
        }
    }

    /// Entries in `[lo, hi)`.
    pub fn entries(&self, lo: u64, hi: u64) -> AppResult<Vec<LogEntry>> {
        if lo >= hi {
            return Ok(Vec::new());
        }
        match self.cache.front() {
            Some(front) if front.index <= lo => Ok(self
                .cache
                .iter()
                .skip((lo - front.index) as usize)
                .take_while(|e| e.index < hi)
                .cloned()
                .collect()),
            _ => self.storage.entries(lo, hi),
        }
    }

    pub fn append(&mut self, entries: &[LogEntry]) -> AppResult<()> {
        let Some(first) = entries.first() else {
            return Ok(());
        };
        self.storage.append(entries)?;
        if self.capacity == 0 {
            return Ok(());
        }
        while self.cache.back().is_some_and(|e| e.index >= first.index) {
            self.cache.pop_back();
        }
        if self.cache.back().is_some_and(|e| e.index + 1 != first.index) {
            self.cache.clear();
        }
        self.cache.extend(entries.iter().cloned());
        while self.cache.len() > self.capacity {
            self.cache.pop_front();
        }
        Ok(())
    }

    pub fn purge_to(&mut self, index: u64) -> AppResult<()> {
        self.storage.purge_to(index)?;
        while self.cache.front().is_some_and(|e| e.index <= index) {
            self.cache.pop_front();
        }
        Ok(())
    }
}
