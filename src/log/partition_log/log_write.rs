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

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::BytesMut;
use tracing::{debug, error, info, trace, warn};

use super::{LogAppendInfo, PartitionLog};
use crate::log::segment::LogSegment;
use crate::message::constants::MAX_RECORD_SIZE;
use crate::message::{peek_frame, MemoryRecords, Message, Record};
use crate::utils::now_ms;
use crate::{AppError, AppResult};

/// Framed records waiting to be written to the active segment in one call.
#[derive(Default)]
struct PendingChunk {
    buf: BytesMut,
    first_offset: i64,
    last_offset: i64,
    max_timestamp: i64,
}

impl PendingChunk {
    fn push(&mut self, frame: &[u8], offset: i64, timestamp: i64) {
        if self.buf.is_empty() {
            self.first_offset = offset;
            self.max_timestamp = timestamp;
        }
        self.buf.extend_from_slice(frame);
        self.last_offset = offset;
        self.max_timestamp = self.max_timestamp.max(timestamp);
    }

    fn write_to(&mut self, segment: &LogSegment) -> AppResult<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        segment.append(&self.buf, self.first_offset, self.last_offset, self.max_timestamp)?;
        self.buf.clear();
        Ok(())
    }
}

impl PartitionLog {
    /// Assigns offsets to `messages`, stamps them with `leader_epoch` and
    /// writes them, rolling segments between records as needed.
    pub fn append(&self, messages: Vec<Message>, leader_epoch: u64) -> AppResult<LogAppendInfo> {
        if messages.is_empty() {
            return Err(AppError::InvalidValue("empty append".into()));
        }
        let _guard = self.write_lock.lock();
        self.ensure_writable()?;

        let now = now_ms();
        let first_offset = self.log_end_offset();
        let mut buf = BytesMut::new();
        let mut frames = Vec::with_capacity(messages.len());
        for (i, message) in messages.into_iter().enumerate() {
            let record = Record::from_message(message, first_offset + i as i64, leader_epoch, now);
            let size = record.encoded_size();
            if size > MAX_RECORD_SIZE {
                return Err(AppError::InvalidValue(format!(
                    "record of {size} bytes exceeds the {MAX_RECORD_SIZE} byte limit"
                )));
            }
            let start = buf.len();
            record.encode(&mut buf);
            frames.push((record.offset, record.timestamp, start, buf.len()));
        }

        let mut info = LogAppendInfo {
            first_offset,
            last_offset: first_offset,
            leader_epoch,
            record_count: frames.len(),
            bytes: buf.len(),
            max_timestamp: -1,
        };
        for (offset, timestamp, ..) in &frames {
            info.last_offset = *offset;
            info.max_timestamp = info.max_timestamp.max(*timestamp);
        }
        if let Err(e) = self.write_frames(&buf, &frames, now) {
            self.rollback_locked(first_offset, &e);
            return Err(e);
        }
        self.next_offset.store(info.last_offset + 1, Ordering::Release);
        trace!(
            "{} appended [{}, {}] epoch {}",
            self.stream_partition,
            info.first_offset,
            info.last_offset,
            leader_epoch
        );
        Ok(info)
    }

    /// Appends records fetched from the leader without touching their
    /// offsets. Records below the current log end are already held and are
    /// skipped, so replaying a fetch is harmless.
    ///
    /// Returns `None` when nothing new was written.
    pub fn append_replicated(&self, records: &MemoryRecords) -> AppResult<Option<LogAppendInfo>> {
        let _guard = self.write_lock.lock();
        self.ensure_writable()?;

        let buffer = records.buffer();
        let mut frames = Vec::new();
        let mut position = 0usize;
        let mut expected = self.log_end_offset();
        let mut info: Option<LogAppendInfo> = None;
        while position < buffer.len() {
            let (record, len) = Record::decode(&buffer[position..])?.ok_or_else(|| {
                AppError::Corrupt(format!(
                    "{} incomplete record from leader at byte {}",
                    self.stream_partition, position
                ))
            })?;
            if record.offset >= expected {
                frames.push((record.offset, record.timestamp, position, position + len));
                expected = record.offset + 1;
                let entry = info.get_or_insert(LogAppendInfo {
                    first_offset: record.offset,
                    last_offset: record.offset,
                    leader_epoch: record.leader_epoch,
                    record_count: 0,
                    bytes: 0,
                    max_timestamp: record.timestamp,
                });
                entry.last_offset = record.offset;
                entry.leader_epoch = entry.leader_epoch.max(record.leader_epoch);
                entry.record_count += 1;
                entry.bytes += len;
                entry.max_timestamp = entry.max_timestamp.max(record.timestamp);
            }
            position += len;
        }

        let Some(info) = info else {
            return Ok(None);
        };
        let log_end = self.log_end_offset();
        if let Err(e) = self.write_frames(buffer, &frames, now_ms()) {
            self.rollback_locked(log_end, &e);
            return Err(e);
        }
        self.next_offset.store(info.last_offset + 1, Ordering::Release);
        Ok(Some(info))
    }

    fn ensure_writable(&self) -> AppResult<()> {
        if self.is_deleted() {
            return Err(AppError::InvalidOperation(format!(
                "{} has been deleted",
                self.stream_partition
            )));
        }
        Ok(())
    }

    /// Writes `(offset, timestamp, start, end)` frames of `buf` to the active
    /// segment, grouping them into index-interval sized writes and rolling
    /// whenever the next record would not fit.
    fn write_frames(
        &self,
        buf: &[u8],
        frames: &[(i64, i64, usize, usize)],
        now: i64,
    ) -> AppResult<()> {
        let mut active = self.require_active()?;
        let mut chunk = PendingChunk::default();
        for (offset, timestamp, start, end) in frames.iter().copied() {
            let frame = &buf[start..end];
            if self.should_roll(&active, chunk.buf.len(), frame.len(), offset, now) {
                chunk.write_to(&active)?;
                active = self.roll_locked(offset)?;
            }
            chunk.push(frame, offset, timestamp);
            if chunk.buf.len() >= self.config.index_interval_bytes {
                chunk.write_to(&active)?;
            }
        }
        chunk.write_to(&active)
    }

    fn require_active(&self) -> AppResult<Arc<LogSegment>> {
        self.active_segment().ok_or_else(|| {
            AppError::IllegalStateError(format!("{} has no active segment", self.stream_partition))
        })
    }

    /// Whether a record of `frame_len` bytes at `offset` must go to a fresh
    /// segment, given `buffered` bytes not yet handed to the active one.
    fn should_roll(
        &self,
        active: &LogSegment,
        buffered: usize,
        frame_len: usize,
        offset: i64,
        now: i64,
    ) -> bool {
        let existing = active.size() + buffered as u64;
        // an empty segment takes its first record whatever the size
        if existing == 0 {
            return false;
        }
        let after = existing + frame_len as u64;
        after > self.config.segment_max_bytes
            || (self.config.segment_max_age_ms > 0
                && now - active.created_at_ms() >= self.config.segment_max_age_ms as i64)
            || active.index_full()
            || after > u32::MAX as u64
            || offset - active.base_offset() > u32::MAX as i64
    }

    /// Seals the active segment and opens a new one at the current log end.
    pub fn roll(&self) -> AppResult<()> {
        let _guard = self.write_lock.lock();
        self.ensure_writable()?;
        let active = self.require_active()?;
        if active.is_empty() {
            return Ok(());
        }
        let log_end = self.log_end_offset();
        if let Err(e) = self.roll_locked(log_end) {
            self.rollback_locked(log_end, &e);
            return Err(e);
        }
        Ok(())
    }

    /// Rolls when the active segment is older than `segment_max_age`.
    pub fn roll_if_aged(&self, now: i64) -> AppResult<bool> {
        if self.config.segment_max_age_ms == 0 {
            return Ok(false);
        }
        let _guard = self.write_lock.lock();
        self.ensure_writable()?;
        let active = self.require_active()?;
        if active.is_empty() || now - active.created_at_ms() < self.config.segment_max_age_ms as i64
        {
            return Ok(false);
        }
        let log_end = self.log_end_offset();
        if let Err(e) = self.roll_locked(log_end) {
            self.rollback_locked(log_end, &e);
            return Err(e);
        }
        Ok(true)
    }

    /// Opens the next segment before sealing the current one, so a failure
    /// never leaves the log without a writable segment.
    fn roll_locked(&self, base_offset: i64) -> AppResult<Arc<LogSegment>> {
        let active = self.require_active()?;
        let segment = Arc::new(LogSegment::create(&self.dir, base_offset, &self.config)?);
        if let Err(e) = active.seal() {
            if let Err(cleanup) = segment.delete() {
                warn!(
                    "{} left segment {} behind: {}",
                    self.stream_partition, base_offset, cleanup
                );
            }
            return Err(e);
        }
        self.segments.write().insert(base_offset, segment.clone());
        debug!(
            "{} rolled segment {} ({} bytes), new segment {}",
            self.stream_partition,
            active.base_offset(),
            active.size(),
            base_offset
        );
        Ok(segment)
    }

    /// Drops every record with offset `>= offset`. The high watermark is
    /// lowered to `offset - 1` when it was beyond.
    pub fn truncate_to(&self, offset: i64) -> AppResult<()> {
        let _guard = self.write_lock.lock();
        self.ensure_writable()?;
        if offset >= self.log_end_offset() {
            return Ok(());
        }
        if offset < self.log_start_offset() {
            drop(_guard);
            return self.reset_to(offset);
        }

        self.truncate_locked(offset)?;
        if self.high_watermark() >= offset {
            self.high_watermark.store(offset - 1, Ordering::Release);
        }
        info!("{} truncated to offset {}", self.stream_partition, offset);
        Ok(())
    }

    /// Drops segments above `offset` and cuts the last remaining one back to
    /// `offset`. The caller holds the write lock and guarantees that a
    /// segment with base `<= offset` exists.
    fn truncate_locked(&self, offset: i64) -> AppResult<()> {
        let removed: Vec<Arc<LogSegment>> = {
            let mut segments = self.segments.write();
            let doomed: Vec<i64> = segments
                .range(offset + 1..)
                .map(|(base, _)| *base)
                .collect();
            doomed
                .iter()
                .filter_map(|base| segments.remove(base))
                .collect()
        };
        for segment in &removed {
            segment.delete()?;
        }
        self.require_active()?.truncate_to(offset)?;
        self.bump_generation();
        self.next_offset.store(offset, Ordering::Release);
        Ok(())
    }

    /// Puts the log back to ending at `log_end` after a failed write, so
    /// partially written records are never exposed and later appends start
    /// from a consistent segment.
    fn rollback_locked(&self, log_end: i64, cause: &AppError) {
        match self.truncate_locked(log_end) {
            Ok(()) => warn!(
                "{} rolled back to offset {} after failed write: {}",
                self.stream_partition, log_end, cause
            ),
            Err(e) => error!(
                "{} could not roll back to offset {} after failed write ({}): {}",
                self.stream_partition, log_end, cause, e
            ),
        }
    }

    /// Discards the whole log and restarts it empty at `offset`.
    pub fn reset_to(&self, offset: i64) -> AppResult<()> {
        let _guard = self.write_lock.lock();
        self.ensure_writable()?;
        let old = std::mem::take(&mut *self.segments.write());
        for segment in old.values() {
            segment.delete()?;
        }
        let segment = Arc::new(LogSegment::create(&self.dir, offset, &self.config)?);
        self.segments.write().insert(offset, segment);
        self.bump_generation();
        self.next_offset.store(offset, Ordering::Release);
        self.high_watermark.store(offset - 1, Ordering::Release);
        info!("{} reset to offset {}", self.stream_partition, offset);
        Ok(())
    }
}
