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

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use super::{PartitionLog, CHECKPOINT_FILE_NAME, HIGH_WATERMARK_KEY, LEADER_EPOCH_KEY};
use crate::log::segment::{
    LogSegment, CLEANED_FILE_SUFFIX, INDEX_FILE_SUFFIX, LOG_FILE_SUFFIX, REBUILD_FILE_SUFFIX,
};
use crate::log::CheckPointFile;
use crate::message::StreamPartition;
use crate::service::StreamsConfig;
use crate::utils::now_ms;
use crate::{AppError, AppResult};

impl PartitionLog {
    /// Opens the log under `base_dir`, creating it when absent.
    ///
    /// Every segment is validated; damage is truncated away and logged, never
    /// returned as an error. The checkpoint restores the high watermark
    /// (clamped to the recovered log end) and the leader epoch.
    pub async fn open(
        stream_partition: StreamPartition,
        base_dir: &Path,
        config: StreamsConfig,
    ) -> AppResult<Arc<PartitionLog>> {
        let dir = stream_partition.partition_dir(base_dir);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            AppError::DetailedIoError(format!("create partition dir {:?}: {}", dir, e))
        })?;

        let checkpoint = CheckPointFile::new(dir.join(CHECKPOINT_FILE_NAME));
        let points = match checkpoint.read_checkpoints().await {
            Ok(points) => points,
            Err(e) => {
                warn!("{} unreadable checkpoint, ignoring: {}", stream_partition, e);
                BTreeMap::new()
            }
        };

        let recover_dir = dir.clone();
        let recover_config = config.clone();
        let segments =
            tokio::task::spawn_blocking(move || recover_segments(&recover_dir, &recover_config))
                .await??;

        let next_offset = segments
            .last_key_value()
            .map_or(0, |(_, segment)| segment.next_offset());
        let high_watermark = points
            .get(HIGH_WATERMARK_KEY)
            .copied()
            .unwrap_or(-1)
            .clamp(-1, next_offset - 1);
        let leader_epoch = points.get(LEADER_EPOCH_KEY).copied().unwrap_or(0).max(0) as u64;

        info!(
            "{} opened: segments={} log_start={} leo={} hw={} epoch={}",
            stream_partition,
            segments.len(),
            segments.first_key_value().map_or(0, |(base, _)| *base),
            next_offset,
            high_watermark,
            leader_epoch
        );

        Ok(Arc::new(PartitionLog {
            stream_partition,
            dir,
            config,
            segments: RwLock::new(segments),
            generation: AtomicU64::new(0),
            next_offset: AtomicI64::new(next_offset),
            high_watermark: AtomicI64::new(high_watermark),
            leader_epoch: AtomicU64::new(leader_epoch),
            write_lock: Mutex::new(()),
            checkpoint,
            last_cleaned_ms: AtomicI64::new(now_ms()),
            deleted: AtomicBool::new(false),
        }))
    }
}

fn remove_file(path: &Path) -> AppResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Recovers every segment in `dir`, oldest first.
///
/// Leftovers of interrupted compactions or index rebuilds are removed, as are
/// indexes without a log. After the first segment that had to be truncated
/// or that overlaps its predecessor, every later segment is deleted.
fn recover_segments(dir: &Path, config: &StreamsConfig) -> AppResult<BTreeMap<i64, Arc<LogSegment>>> {
    let mut log_bases = BTreeSet::new();
    let mut index_files: BTreeMap<i64, PathBuf> = BTreeMap::new();

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        if extension == CLEANED_FILE_SUFFIX || extension == REBUILD_FILE_SUFFIX {
            warn!("removing leftover file {:?}", path);
            remove_file(&path)?;
            continue;
        }
        let Some(base) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<i64>().ok())
        else {
            continue;
        };
        match extension {
            LOG_FILE_SUFFIX => {
                log_bases.insert(base);
            }
            INDEX_FILE_SUFFIX => {
                index_files.insert(base, path);
            }
            _ => {}
        }
    }

    for (base, path) in &index_files {
        if !log_bases.contains(base) {
            warn!("removing orphan index {:?}", path);
            remove_file(path)?;
        }
    }

    let mut segments = BTreeMap::new();
    let bases: Vec<i64> = log_bases.into_iter().collect();
    let mut prev_next_offset: Option<i64> = None;
    let mut discard_from = None;

    for (i, base) in bases.iter().copied().enumerate() {
        if prev_next_offset.is_some_and(|prev| base < prev) {
            warn!(
                "segment {} in {:?} overlaps its predecessor, dropping it and later segments",
                base, dir
            );
            discard_from = Some(i);
            break;
        }
        let sealed = i + 1 < bases.len();
        let (segment, truncated) = LogSegment::recover(dir, base, config, sealed)?;
        prev_next_offset = Some(segment.next_offset());
        segments.insert(base, Arc::new(segment));
        if truncated && sealed {
            discard_from = Some(i + 1);
            break;
        }
    }

    if let Some(from) = discard_from {
        for base in &bases[from..] {
            warn!("deleting segment {} in {:?} after damaged history", base, dir);
            remove_file(&crate::log::segment::log_file_name(dir, *base))?;
            remove_file(&crate::log::segment::index_file_name(dir, *base))?;
        }
    }

    // the newest surviving segment must accept appends
    if let Some((_, last)) = segments.last_key_value() {
        if last.is_sealed() {
            let next = last.next_offset();
            last.truncate_to(next)?;
        }
    } else {
        let segment = LogSegment::create(dir, 0, config)?;
        segments.insert(0, Arc::new(segment));
    }

    Ok(segments)
}
