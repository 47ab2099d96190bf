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

//! The log of one stream partition.
//!
//! Segments live in an arena keyed by base offset; each segment owns its own
//! file handles and index. Writers hold `write_lock` for the whole append,
//! readers take a snapshot of the arena and never block the writer. Any
//! operation that removes or replaces segments bumps `generation`, which
//! lets the compactor detect that the segment set moved under it.
//!
//! Offsets:
//! - `log_start_offset` is the base of the oldest segment.
//! - `log_end_offset` (LEO) is the next offset to assign.
//! - `high_watermark` is the last committed offset, `-1` when none.

mod log_load;
mod log_read;
mod log_write;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::log::segment::LogSegment;
use crate::log::CheckPointFile;
use crate::message::StreamPartition;
use crate::service::StreamsConfig;
use crate::AppResult;

pub const CHECKPOINT_FILE_NAME: &str = "replication.checkpoint";
const HIGH_WATERMARK_KEY: &str = "high_watermark";
const LEADER_EPOCH_KEY: &str = "leader_epoch";

/// Result of a local append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogAppendInfo {
    pub first_offset: i64,
    pub last_offset: i64,
    pub leader_epoch: u64,
    pub record_count: usize,
    pub bytes: usize,
    pub max_timestamp: i64,
}

#[derive(Debug)]
pub struct PartitionLog {
    stream_partition: StreamPartition,
    dir: PathBuf,
    config: StreamsConfig,
    pub(super) segments: RwLock<BTreeMap<i64, Arc<LogSegment>>>,
    generation: AtomicU64,
    next_offset: AtomicI64,
    high_watermark: AtomicI64,
    leader_epoch: AtomicU64,
    pub(super) write_lock: Mutex<()>,
    checkpoint: CheckPointFile,
    last_cleaned_ms: AtomicI64,
    deleted: AtomicBool,
}

impl PartitionLog {
    pub fn stream_partition(&self) -> &StreamPartition {
        &self.stream_partition
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &StreamsConfig {
        &self.config
    }

    pub fn log_end_offset(&self) -> i64 {
        self.next_offset.load(Ordering::Acquire)
    }

    pub fn log_start_offset(&self) -> i64 {
        self.segments
            .read()
            .first_key_value()
            .map_or_else(|| self.log_end_offset(), |(base, _)| *base)
    }

    pub fn high_watermark(&self) -> i64 {
        self.high_watermark.load(Ordering::Acquire)
    }

    pub fn leader_epoch(&self) -> u64 {
        self.leader_epoch.load(Ordering::Acquire)
    }

    pub fn set_leader_epoch(&self, epoch: u64) {
        self.leader_epoch.store(epoch, Ordering::Release);
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn segment_count(&self) -> usize {
        self.segments.read().len()
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.segments.read().values().map(|s| s.size()).sum()
    }

    pub(crate) fn last_cleaned_ms(&self) -> i64 {
        self.last_cleaned_ms.load(Ordering::Acquire)
    }

    pub(crate) fn set_last_cleaned_ms(&self, ms: i64) {
        self.last_cleaned_ms.store(ms, Ordering::Release);
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    /// Moves the high watermark forward, never past `LEO - 1`.
    ///
    /// Returns true when the watermark changed.
    pub fn advance_high_watermark(&self, hw: i64) -> bool {
        let ceiling = self.log_end_offset() - 1;
        let target = hw.min(ceiling);
        self.high_watermark
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (target > current).then_some(target)
            })
            .is_ok()
    }

    /// Sets the watermark unconditionally, clamped to `[-1, LEO - 1]`.
    /// Followers use this when the leader reports a lower value after a
    /// truncation.
    pub fn reset_high_watermark(&self, hw: i64) {
        let clamped = hw.clamp(-1, self.log_end_offset() - 1);
        self.high_watermark.store(clamped, Ordering::Release);
    }

    pub(crate) fn active_segment(&self) -> Option<Arc<LogSegment>> {
        self.segments.read().last_key_value().map(|(_, s)| s.clone())
    }

    pub(crate) fn segment_snapshot(&self) -> Vec<Arc<LogSegment>> {
        self.segments.read().values().cloned().collect()
    }

    pub(crate) fn bump_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn flush(&self) -> AppResult<()> {
        if let Some(active) = self.active_segment() {
            active.flush()?;
        }
        Ok(())
    }

    /// Persists the high watermark and leader epoch.
    pub async fn checkpoint(&self) -> AppResult<()> {
        if self.is_deleted() {
            return Ok(());
        }
        let points = BTreeMap::from([
            (HIGH_WATERMARK_KEY.to_string(), self.high_watermark()),
            (LEADER_EPOCH_KEY.to_string(), self.leader_epoch() as i64),
        ]);
        self.checkpoint.write_checkpoints(&points).await?;
        trace!(
            "{} checkpoint hw={} epoch={}",
            self.stream_partition,
            self.high_watermark(),
            self.leader_epoch()
        );
        Ok(())
    }

    /// Flushes and checkpoints before the log is dropped.
    pub async fn close(&self) -> AppResult<()> {
        if self.is_deleted() {
            return Ok(());
        }
        self.flush()?;
        self.checkpoint().await?;
        debug!("{} closed at leo {}", self.stream_partition, self.log_end_offset());
        Ok(())
    }

    /// Deletes every segment and the partition directory.
    pub fn delete(&self) -> AppResult<()> {
        let _guard = self.write_lock.lock();
        self.deleted.store(true, Ordering::Release);
        let segments = std::mem::take(&mut *self.segments.write());
        self.bump_generation();
        for segment in segments.values() {
            segment.delete()?;
        }
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        debug!("{} deleted", self.stream_partition);
        Ok(())
    }
}
