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

//! A single segment of a partition log: one `.log` file of framed records
//! plus a sparse `.index` of (relative offset, byte position) pairs.
//!
//! A segment is active while it receives appends and sealed afterwards.
//! Sealing trims the preallocated index and drops the write handle. The
//! file names carry the zero-padded base offset so a directory listing
//! sorts in offset order.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};

use bytes::BytesMut;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::log::index_file::{ReadOnlyIndexFile, WritableIndexFile};
use crate::message::constants::LOG_OVERHEAD;
use crate::message::{peek_frame, Record};
use crate::service::StreamsConfig;
use crate::utils::now_ms;
use crate::{AppError, AppResult};

pub const LOG_FILE_SUFFIX: &str = "log";
pub const INDEX_FILE_SUFFIX: &str = "index";
pub const CLEANED_FILE_SUFFIX: &str = "cleaned";
pub const REBUILD_FILE_SUFFIX: &str = "rebuild";

const SCAN_BUFFER_SIZE: usize = 64 * 1024;

pub fn log_file_name(dir: &Path, base_offset: i64) -> PathBuf {
    dir.join(format!("{:020}.{}", base_offset, LOG_FILE_SUFFIX))
}

pub fn index_file_name(dir: &Path, base_offset: i64) -> PathBuf {
    dir.join(format!("{:020}.{}", base_offset, INDEX_FILE_SUFFIX))
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

#[derive(Debug)]
enum SegmentIndex {
    Active(WritableIndexFile),
    Sealed(ReadOnlyIndexFile),
    /// Transitional or failed state; lookups fall back to a scan from 0.
    Missing,
}

impl SegmentIndex {
    fn lookup(&self, relative_offset: u32) -> Option<(u32, u32)> {
        match self {
            SegmentIndex::Active(index) => index.lookup(relative_offset),
            SegmentIndex::Sealed(index) => index.lookup(relative_offset),
            SegmentIndex::Missing => None,
        }
    }
}

/// What a sequential scan of a log file found.
#[derive(Debug, Default)]
struct ScanSummary {
    valid_len: u64,
    entries: Vec<(u32, u32)>,
    first_timestamp: Option<i64>,
    max_timestamp: i64,
    last_offset: Option<i64>,
    /// Set when the scan stopped at a damaged or partial record.
    damage: Option<String>,
    index_consistent: bool,
}

#[derive(Debug)]
pub struct LogSegment {
    base_offset: i64,
    log_path: RwLock<PathBuf>,
    index_path: RwLock<PathBuf>,
    writer: Mutex<Option<File>>,
    reader: Mutex<File>,
    index: RwLock<SegmentIndex>,
    size: AtomicU64,
    next_offset: AtomicI64,
    max_timestamp: AtomicI64,
    created_at_ms: i64,
    sealed: AtomicBool,
    bytes_since_index_entry: AtomicUsize,
    index_interval_bytes: usize,
    index_max_bytes: usize,
}

impl LogSegment {
    /// Creates an empty active segment starting at `base_offset`.
    pub fn create(dir: &Path, base_offset: i64, config: &StreamsConfig) -> AppResult<Self> {
        Self::create_at(
            log_file_name(dir, base_offset),
            index_file_name(dir, base_offset),
            base_offset,
            now_ms(),
            config,
        )
    }

    /// Creates an empty segment whose files carry the `.cleaned` suffix
    /// until [`LogSegment::promote`] renames them.
    pub fn create_cleaned(
        dir: &Path,
        base_offset: i64,
        created_at_ms: i64,
        config: &StreamsConfig,
    ) -> AppResult<Self> {
        Self::create_at(
            with_suffix(&log_file_name(dir, base_offset), CLEANED_FILE_SUFFIX),
            with_suffix(&index_file_name(dir, base_offset), CLEANED_FILE_SUFFIX),
            base_offset,
            created_at_ms,
            config,
        )
    }

    fn create_at(
        log_path: PathBuf,
        index_path: PathBuf,
        base_offset: i64,
        created_at_ms: i64,
        config: &StreamsConfig,
    ) -> AppResult<Self> {
        let writer = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&log_path)
            .map_err(|e| {
                AppError::DetailedIoError(format!("create segment {:?}: {}", log_path, e))
            })?;
        let reader = File::open(&log_path)?;
        let index = match WritableIndexFile::create(&index_path, config.index_max_bytes) {
            Ok(index) => index,
            Err(e) => {
                let _ = fs::remove_file(&log_path);
                return Err(e.into());
            }
        };
        trace!("created segment {:?}", log_path);
        Ok(Self {
            base_offset,
            log_path: RwLock::new(log_path),
            index_path: RwLock::new(index_path),
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(reader),
            index: RwLock::new(SegmentIndex::Active(index)),
            size: AtomicU64::new(0),
            next_offset: AtomicI64::new(base_offset),
            max_timestamp: AtomicI64::new(-1),
            created_at_ms,
            sealed: AtomicBool::new(false),
            bytes_since_index_entry: AtomicUsize::new(0),
            index_interval_bytes: config.index_interval_bytes,
            index_max_bytes: config.index_max_bytes,
        })
    }

    /// Opens an existing segment, validating every record.
    ///
    /// The file is truncated at the first record with a bad CRC, a bad
    /// frame or a non-increasing offset. A sealed segment keeps its index
    /// when the index agrees with the records, otherwise the index is
    /// rebuilt. The active segment always gets a fresh index.
    ///
    /// Returns the segment and whether anything was truncated.
    pub fn recover(
        dir: &Path,
        base_offset: i64,
        config: &StreamsConfig,
        sealed: bool,
    ) -> AppResult<(Self, bool)> {
        let log_path = log_file_name(dir, base_offset);
        let index_path = index_file_name(dir, base_offset);
        let reader = File::open(&log_path)?;

        let existing = if sealed {
            match ReadOnlyIndexFile::open(&index_path) {
                Ok(index) => Some(index),
                Err(e) if e.kind() == ErrorKind::NotFound => None,
                Err(e) => {
                    warn!("segment index {:?} unreadable: {}", index_path, e);
                    None
                }
            }
        } else {
            None
        };

        let summary = scan_log(
            &reader,
            base_offset,
            config.index_interval_bytes,
            existing.as_ref(),
            None,
        )?;

        let truncated = summary.damage.is_some();
        if let Some(damage) = &summary.damage {
            warn!(
                "segment {:?} damaged ({}), truncating to {} bytes",
                log_path, damage, summary.valid_len
            );
            let file = OpenOptions::new().write(true).open(&log_path)?;
            file.set_len(summary.valid_len)?;
            file.sync_all()?;
        }

        let (index, writer) = if sealed && !truncated {
            let index = match existing.filter(|_| summary.index_consistent) {
                Some(index) => index,
                None => {
                    debug!("rebuilding index for sealed segment {:?}", log_path);
                    rebuild_sealed_index(&index_path, &summary.entries, config.index_max_bytes)?
                }
            };
            (SegmentIndex::Sealed(index), None)
        } else {
            drop(existing);
            let mut index = WritableIndexFile::create(&index_path, config.index_max_bytes)?;
            for (relative_offset, position) in &summary.entries {
                if index.is_full() {
                    break;
                }
                index.add_entry(*relative_offset, *position)?;
            }
            let writer = OpenOptions::new().append(true).open(&log_path)?;
            (SegmentIndex::Active(index), Some(writer))
        };

        let is_sealed = writer.is_none();
        let segment = Self {
            base_offset,
            log_path: RwLock::new(log_path),
            index_path: RwLock::new(index_path),
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            index: RwLock::new(index),
            size: AtomicU64::new(summary.valid_len),
            next_offset: AtomicI64::new(summary.last_offset.map_or(base_offset, |o| o + 1)),
            max_timestamp: AtomicI64::new(summary.max_timestamp),
            created_at_ms: summary.first_timestamp.unwrap_or_else(now_ms),
            sealed: AtomicBool::new(is_sealed),
            bytes_since_index_entry: AtomicUsize::new(bytes_after_last_entry(
                &summary.entries,
                summary.valid_len,
            )),
            index_interval_bytes: config.index_interval_bytes,
            index_max_bytes: config.index_max_bytes,
        };
        Ok((segment, truncated))
    }

    pub fn base_offset(&self) -> i64 {
        self.base_offset
    }

    /// One past the last offset written to this segment.
    pub fn next_offset(&self) -> i64 {
        self.next_offset.load(Ordering::Acquire)
    }

    /// Overrides the next offset, used when a compacted segment inherits
    /// the range of the segment it replaces.
    pub fn set_next_offset(&self, next_offset: i64) {
        self.next_offset.store(next_offset, Ordering::Release);
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn max_timestamp(&self) -> i64 {
        self.max_timestamp.load(Ordering::Acquire)
    }

    pub fn created_at_ms(&self) -> i64 {
        self.created_at_ms
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    pub fn log_path(&self) -> PathBuf {
        self.log_path.read().clone()
    }

    pub fn index_full(&self) -> bool {
        match &*self.index.read() {
            SegmentIndex::Active(index) => index.is_full(),
            _ => true,
        }
    }

    /// Appends already framed records covering `[first_offset, last_offset]`.
    ///
    /// Adds an index entry for `first_offset` once at least
    /// `index_interval_bytes` were written since the previous entry.
    pub fn append(
        &self,
        records: &[u8],
        first_offset: i64,
        last_offset: i64,
        max_timestamp: i64,
    ) -> AppResult<()> {
        let mut writer = self.writer.lock();
        let Some(file) = writer.as_mut() else {
            return Err(AppError::InvalidOperation(format!(
                "segment {} is sealed",
                self.base_offset
            )));
        };
        if first_offset < self.next_offset() {
            return Err(AppError::InvalidOperation(format!(
                "offset {} is behind segment next offset {}",
                first_offset,
                self.next_offset()
            )));
        }
        let position = self.size();
        let relative_offset = u32::try_from(first_offset - self.base_offset)
            .map_err(|_| AppError::InvalidOperation("relative offset overflow".into()))?;
        let position_u32 = u32::try_from(position)
            .map_err(|_| AppError::InvalidOperation("segment position overflow".into()))?;

        if let Err(e) = file.write_all(records) {
            // cut off whatever part of the frames reached the file
            file.set_len(position)
                .and_then(|_| file.seek(SeekFrom::Start(position)))
                .map_err(|rewind| {
                    AppError::DetailedIoError(format!(
                        "segment {} torn at byte {}: {} ({})",
                        self.base_offset, position, e, rewind
                    ))
                })?;
            return Err(e.into());
        }

        if self.bytes_since_index_entry.load(Ordering::Relaxed) >= self.index_interval_bytes {
            if let SegmentIndex::Active(index) = &mut *self.index.write() {
                if !index.is_full() {
                    index.add_entry(relative_offset, position_u32)?;
                    self.bytes_since_index_entry.store(0, Ordering::Relaxed);
                }
            }
        }
        self.bytes_since_index_entry
            .fetch_add(records.len(), Ordering::Relaxed);
        self.size
            .store(position + records.len() as u64, Ordering::Release);
        self.next_offset.store(last_offset + 1, Ordering::Release);
        self.max_timestamp
            .fetch_max(max_timestamp, Ordering::AcqRel);
        Ok(())
    }

    fn lookup_position(&self, offset: i64) -> u64 {
        let relative = offset - self.base_offset;
        if relative <= 0 {
            return 0;
        }
        let relative = u32::try_from(relative).unwrap_or(u32::MAX);
        self.index
            .read()
            .lookup(relative)
            .map_or(0, |(_, position)| position as u64)
    }

    /// Reads whole records with offsets in `[start_offset, max_offset)`.
    ///
    /// Stops before the record that would push the result past `max_bytes`,
    /// except that the first record is always returned whole.
    pub fn read(&self, start_offset: i64, max_bytes: usize, max_offset: i64) -> AppResult<BytesMut> {
        let end = self.size();
        let start_position = self.lookup_position(start_offset);
        let mut out = BytesMut::new();
        if start_position >= end || start_offset >= max_offset {
            return Ok(out);
        }

        let mut file = self.reader.lock();
        file.seek(SeekFrom::Start(start_position))?;
        let mut reader = BufReader::with_capacity(SCAN_BUFFER_SIZE, &mut *file);
        let mut position = start_position;
        let mut header = [0u8; LOG_OVERHEAD];

        while position + LOG_OVERHEAD as u64 <= end {
            reader.read_exact(&mut header)?;
            let Some((offset, total)) = peek_frame(&header)? else {
                break;
            };
            if position + total as u64 > end || offset >= max_offset {
                break;
            }
            if offset < start_offset {
                reader.seek_relative((total - LOG_OVERHEAD) as i64)?;
                position += total as u64;
                continue;
            }
            if !out.is_empty() && out.len() + total > max_bytes {
                break;
            }
            let at = out.len();
            out.extend_from_slice(&header);
            out.resize(at + total, 0);
            reader.read_exact(&mut out[at + LOG_OVERHEAD..])?;
            position += total as u64;
        }
        Ok(out)
    }

    /// Streams every record in the segment to `visit` along with its raw frame.
    pub fn visit_records<F>(&self, mut visit: F) -> AppResult<()>
    where
        F: FnMut(&Record, &[u8]) -> AppResult<()>,
    {
        let end = self.size();
        let file = File::open(self.log_path())?;
        let mut reader = BufReader::with_capacity(SCAN_BUFFER_SIZE, file);
        let mut frame = Vec::new();
        let mut position = 0u64;
        while position < end {
            frame.resize(LOG_OVERHEAD, 0);
            reader.read_exact(&mut frame)?;
            let Some((_, total)) = peek_frame(&frame)? else {
                break;
            };
            frame.resize(total, 0);
            reader.read_exact(&mut frame[LOG_OVERHEAD..])?;
            let Some((record, _)) = Record::decode(&frame)? else {
                break;
            };
            visit(&record, &frame)?;
            position += total as u64;
        }
        Ok(())
    }

    /// Flushes data and index to disk.
    pub fn flush(&self) -> AppResult<()> {
        if let Some(file) = self.writer.lock().as_ref() {
            file.sync_data()?;
        }
        if let SegmentIndex::Active(index) = &*self.index.read() {
            index.flush()?;
        }
        Ok(())
    }

    /// Flushes and closes the segment for writing. Idempotent.
    pub fn seal(&self) -> AppResult<()> {
        let mut writer = self.writer.lock();
        if let Some(file) = writer.take() {
            file.sync_all()?;
        }
        let mut index = self.index.write();
        if let SegmentIndex::Active(_) = &*index {
            if let SegmentIndex::Active(active) = std::mem::replace(&mut *index, SegmentIndex::Missing)
            {
                *index = SegmentIndex::Sealed(active.into_readonly()?);
            }
        }
        self.sealed.store(true, Ordering::Release);
        trace!("sealed segment {}", self.base_offset);
        Ok(())
    }

    /// Drops every record with offset `>= offset` and reopens the segment
    /// for appends. The index is rebuilt under a temporary name and renamed
    /// into place.
    pub fn truncate_to(&self, offset: i64) -> AppResult<()> {
        let log_path = self.log_path();
        let index_path = self.index_path.read().clone();
        let mut writer = self.writer.lock();
        let summary = {
            let file = File::open(&log_path)?;
            scan_log(
                &file,
                self.base_offset,
                self.index_interval_bytes,
                None,
                Some(offset),
            )?
        };

        writer.take();
        let file = OpenOptions::new().append(true).open(&log_path)?;
        file.set_len(summary.valid_len)?;
        file.sync_all()?;

        let rebuild_path = with_suffix(&index_path, REBUILD_FILE_SUFFIX);
        let mut rebuilt = WritableIndexFile::create(&rebuild_path, self.index_max_bytes)?;
        for (relative_offset, position) in &summary.entries {
            if rebuilt.is_full() {
                break;
            }
            rebuilt.add_entry(*relative_offset, *position)?;
        }
        fs::rename(&rebuild_path, &index_path)?;

        *self.index.write() = SegmentIndex::Active(rebuilt);
        self.size.store(summary.valid_len, Ordering::Release);
        self.next_offset
            .store(summary.last_offset.map_or(self.base_offset, |o| o + 1), Ordering::Release);
        self.max_timestamp
            .store(summary.max_timestamp, Ordering::Release);
        self.bytes_since_index_entry.store(
            bytes_after_last_entry(&summary.entries, summary.valid_len),
            Ordering::Relaxed,
        );
        self.sealed.store(false, Ordering::Release);
        *writer = Some(file);
        debug!(
            "truncated segment {} to offset {} ({} bytes)",
            self.base_offset, offset, summary.valid_len
        );
        Ok(())
    }

    /// Renames `.cleaned` files over the canonical segment names.
    pub fn promote(&self) -> AppResult<()> {
        for lock in [&self.log_path, &self.index_path] {
            let mut path = lock.write();
            if path.extension().and_then(|e| e.to_str()) == Some(CLEANED_FILE_SUFFIX) {
                let canonical = path.with_extension("");
                fs::rename(&*path, &canonical)?;
                *path = canonical;
            }
        }
        Ok(())
    }

    /// Removes the segment files. Handles held by in-flight reads stay valid.
    pub fn delete(&self) -> AppResult<()> {
        self.writer.lock().take();
        for path in [self.log_path(), self.index_path.read().clone()] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        trace!("deleted segment {}", self.base_offset);
        Ok(())
    }
}

fn rebuild_sealed_index(
    index_path: &Path,
    entries: &[(u32, u32)],
    max_bytes: usize,
) -> AppResult<ReadOnlyIndexFile> {
    let rebuild_path = with_suffix(index_path, REBUILD_FILE_SUFFIX);
    let mut index = WritableIndexFile::create(&rebuild_path, max_bytes)?;
    for (relative_offset, position) in entries {
        if index.is_full() {
            break;
        }
        index.add_entry(*relative_offset, *position)?;
    }
    let readonly = index.into_readonly()?;
    fs::rename(&rebuild_path, index_path)?;
    Ok(readonly)
}

fn bytes_after_last_entry(entries: &[(u32, u32)], valid_len: u64) -> usize {
    let last = entries.last().map_or(0, |(_, position)| *position as u64);
    (valid_len - last) as usize
}

/// Fills `buf` from `reader`, returning how many bytes were read before EOF.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut read = 0;
    while read < buf.len() {
        match reader.read(&mut buf[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(read)
}

/// Walks the log file from the start, validating every record.
///
/// With `stop_at`, the scan ends before the first record whose offset is
/// `>= stop_at`. With `existing`, the index entries are checked against the
/// record boundaries found.
fn scan_log(
    file: &File,
    base_offset: i64,
    index_interval_bytes: usize,
    existing: Option<&ReadOnlyIndexFile>,
    stop_at: Option<i64>,
) -> AppResult<ScanSummary> {
    let mut reader = BufReader::with_capacity(SCAN_BUFFER_SIZE, file);
    reader.seek(SeekFrom::Start(0))?;

    let mut summary = ScanSummary {
        max_timestamp: -1,
        ..Default::default()
    };
    let mut frame = Vec::new();
    let mut position = 0u64;
    let mut bytes_since_entry = 0usize;
    let mut next_index_entry = 0usize;
    let mut index_consistent = existing.is_some();

    loop {
        frame.resize(LOG_OVERHEAD, 0);
        let read = fill(&mut reader, &mut frame)?;
        if read == 0 {
            break;
        }
        if read < LOG_OVERHEAD {
            summary.damage = Some(format!("partial header at position {position}"));
            break;
        }
        let (offset, total) = match peek_frame(&frame) {
            Ok(Some(frame_info)) => frame_info,
            Ok(None) => break,
            Err(e) => {
                summary.damage = Some(format!("{e} at position {position}"));
                break;
            }
        };
        if stop_at.is_some_and(|stop| offset >= stop) {
            break;
        }
        frame.resize(total, 0);
        if fill(&mut reader, &mut frame[LOG_OVERHEAD..])? < total - LOG_OVERHEAD {
            summary.damage = Some(format!("partial record at position {position}"));
            break;
        }
        let record = match Record::decode(&frame) {
            Ok(Some((record, _))) => record,
            Ok(None) => {
                summary.damage = Some(format!("partial record at position {position}"));
                break;
            }
            Err(e) => {
                summary.damage = Some(format!("{e} at position {position}"));
                break;
            }
        };
        let in_order = offset >= base_offset && summary.last_offset.map_or(true, |last| offset > last);
        let relative_offset = u32::try_from(offset - base_offset).ok();
        let position_u32 = u32::try_from(position).ok();
        let (true, Some(relative_offset), Some(position_u32)) =
            (in_order, relative_offset, position_u32)
        else {
            summary.damage = Some(format!("offset {offset} out of order at position {position}"));
            break;
        };

        if let Some(index) = existing {
            while let Some((entry_offset, entry_position)) = index.entry(next_index_entry) {
                if (entry_position as u64) > position {
                    break;
                }
                if entry_position as u64 != position || entry_offset != relative_offset {
                    index_consistent = false;
                }
                next_index_entry += 1;
            }
        }

        if bytes_since_entry >= index_interval_bytes {
            summary.entries.push((relative_offset, position_u32));
            bytes_since_entry = 0;
        }
        bytes_since_entry += total;

        summary.first_timestamp.get_or_insert(record.timestamp);
        summary.max_timestamp = summary.max_timestamp.max(record.timestamp);
        summary.last_offset = Some(offset);
        position += total as u64;
    }

    if let Some(index) = existing {
        // entries pointing past the last record are stale
        if next_index_entry < index.entries() {
            index_consistent = false;
        }
    }
    summary.valid_len = position;
    summary.index_consistent = index_consistent;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use bytes::Bytes;
    use tempfile::tempdir;

    use super::*;
    use crate::message::{MemoryRecords, Message};

    fn config() -> StreamsConfig {
        StreamsConfig {
            index_interval_bytes: 64,
            index_max_bytes: 1024,
            ..Default::default()
        }
    }

    fn encode(offsets: std::ops::Range<i64>) -> BytesMut {
        let mut buf = BytesMut::new();
        for offset in offsets {
            let message = Message::new(Bytes::from(format!("value-{offset}")))
                .with_key(format!("key-{}", offset % 3));
            Record::from_message(message, offset, 1, 1_000 + offset).encode(&mut buf);
        }
        buf
    }

    fn append_each(segment: &LogSegment, offsets: std::ops::Range<i64>) {
        for offset in offsets {
            let buf = encode(offset..offset + 1);
            segment.append(&buf, offset, offset, 1_000 + offset).unwrap();
        }
    }

    fn offsets(buf: BytesMut) -> Vec<i64> {
        MemoryRecords::new(buf.freeze())
            .records()
            .unwrap()
            .into_iter()
            .map(|r| r.offset)
            .collect()
    }

    #[test]
    fn append_and_read() -> AppResult<()> {
        let dir = tempdir()?;
        let segment = LogSegment::create(dir.path(), 100, &config())?;
        append_each(&segment, 100..120);
        assert_eq!(segment.next_offset(), 120);
        assert_eq!(segment.max_timestamp(), 1_119);

        assert_eq!(offsets(segment.read(100, usize::MAX, i64::MAX)?), (100..120).collect::<Vec<_>>());
        assert_eq!(offsets(segment.read(117, usize::MAX, i64::MAX)?), vec![117, 118, 119]);
        assert_eq!(offsets(segment.read(105, usize::MAX, 108)?), vec![105, 106, 107]);
        // one record even when it exceeds max_bytes
        assert_eq!(offsets(segment.read(110, 1, i64::MAX)?), vec![110]);
        assert!(segment.read(120, usize::MAX, i64::MAX)?.is_empty());
        Ok(())
    }

    #[test]
    fn append_behind_next_offset_fails() -> AppResult<()> {
        let dir = tempdir()?;
        let segment = LogSegment::create(dir.path(), 0, &config())?;
        append_each(&segment, 0..3);
        let buf = encode(2..3);
        assert!(segment.append(&buf, 2, 2, 0).is_err());
        Ok(())
    }

    #[test]
    fn seal_then_recover_keeps_index() -> AppResult<()> {
        let dir = tempdir()?;
        let segment = LogSegment::create(dir.path(), 0, &config())?;
        append_each(&segment, 0..50);
        segment.seal()?;
        assert!(segment.is_sealed());
        assert!(segment.append(&encode(50..51), 50, 50, 0).is_err());
        let index_len = fs::metadata(index_file_name(dir.path(), 0))?.len();
        assert!(index_len > 0 && index_len < 1024);
        drop(segment);

        let (recovered, truncated) = LogSegment::recover(dir.path(), 0, &config(), true)?;
        assert!(!truncated);
        assert!(recovered.is_sealed());
        assert_eq!(recovered.next_offset(), 50);
        assert_eq!(recovered.created_at_ms(), 1_000);
        assert_eq!(offsets(recovered.read(42, usize::MAX, i64::MAX)?), (42..50).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn recover_truncates_corrupt_tail() -> AppResult<()> {
        let dir = tempdir()?;
        let segment = LogSegment::create(dir.path(), 0, &config())?;
        append_each(&segment, 0..10);
        let good_len = segment.size();
        drop(segment);

        // flip a byte inside the last record's value
        let path = log_file_name(dir.path(), 0);
        let mut bytes = fs::read(&path)?;
        let last = bytes.len() - 3;
        bytes[last] ^= 0xff;
        fs::write(&path, &bytes)?;

        let (recovered, truncated) = LogSegment::recover(dir.path(), 0, &config(), false)?;
        assert!(truncated);
        assert_eq!(recovered.next_offset(), 9);
        assert!(recovered.size() < good_len);
        assert_eq!(fs::metadata(&path)?.len(), recovered.size());
        // the segment stays writable after recovery
        recovered.append(&encode(9..10), 9, 9, 0)?;
        assert_eq!(offsets(recovered.read(0, usize::MAX, i64::MAX)?).len(), 10);
        Ok(())
    }

    #[test]
    fn recover_truncates_partial_write() -> AppResult<()> {
        let dir = tempdir()?;
        let segment = LogSegment::create(dir.path(), 0, &config())?;
        append_each(&segment, 0..4);
        drop(segment);

        let path = log_file_name(dir.path(), 0);
        let half = encode(4..5);
        let mut file = OpenOptions::new().append(true).open(&path)?;
        file.write_all(&half[..half.len() / 2])?;
        drop(file);

        let (recovered, truncated) = LogSegment::recover(dir.path(), 0, &config(), false)?;
        assert!(truncated);
        assert_eq!(recovered.next_offset(), 4);
        Ok(())
    }

    #[test]
    fn recover_rebuilds_bad_index() -> AppResult<()> {
        let dir = tempdir()?;
        let segment = LogSegment::create(dir.path(), 0, &config())?;
        append_each(&segment, 0..30);
        segment.seal()?;
        drop(segment);

        let index_path = index_file_name(dir.path(), 0);
        fs::write(&index_path, [0u8, 0, 0, 7, 0, 0, 0, 3])?;

        let (recovered, truncated) = LogSegment::recover(dir.path(), 0, &config(), true)?;
        assert!(!truncated);
        assert!(fs::metadata(&index_path)?.len() > 8);
        assert_eq!(offsets(recovered.read(29, usize::MAX, i64::MAX)?), vec![29]);
        Ok(())
    }

    #[test]
    fn truncate_reopens_sealed_segment() -> AppResult<()> {
        let dir = tempdir()?;
        let segment = LogSegment::create(dir.path(), 0, &config())?;
        append_each(&segment, 0..20);
        segment.seal()?;

        segment.truncate_to(12)?;
        assert!(!segment.is_sealed());
        assert_eq!(segment.next_offset(), 12);
        assert_eq!(offsets(segment.read(10, usize::MAX, i64::MAX)?), vec![10, 11]);
        append_each(&segment, 12..14);
        assert_eq!(offsets(segment.read(11, usize::MAX, i64::MAX)?), vec![11, 12, 13]);
        Ok(())
    }

    #[test]
    fn cleaned_segment_promotes() -> AppResult<()> {
        let dir = tempdir()?;
        let segment = LogSegment::create_cleaned(dir.path(), 5, 1, &config())?;
        append_each(&segment, 7..8);
        segment.seal()?;
        assert!(segment.log_path().to_string_lossy().ends_with(".cleaned"));
        segment.promote()?;
        assert_eq!(segment.log_path(), log_file_name(dir.path(), 5));
        assert!(index_file_name(dir.path(), 5).exists());
        assert_eq!(offsets(segment.read(0, usize::MAX, i64::MAX)?), vec![7]);

        segment.delete()?;
        assert!(!log_file_name(dir.path(), 5).exists());
        Ok(())
    }
}
