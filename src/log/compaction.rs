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

//! Key-based compaction of committed, sealed segments.
//!
//! A run builds the latest offset of every key across the candidate range,
//! rewrites each candidate that holds superseded records into a `.cleaned`
//! sibling, then swaps the rewritten segments in under the write lock if the
//! segment set did not move in the meantime. Keyless records always survive.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::log::partition_log::PartitionLog;
use crate::log::segment::LogSegment;
use crate::{AppError, AppResult};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CompactionResult {
    pub segments_scanned: usize,
    pub segments_rewritten: usize,
    pub segments_removed: usize,
    pub records_removed: u64,
    pub bytes_before: u64,
    pub bytes_after: u64,
    /// The segment set changed during the run and nothing was swapped in.
    pub aborted: bool,
}

#[derive(Debug)]
struct Rewrite {
    original: Arc<LogSegment>,
    /// `None` when every record of the original was superseded.
    cleaned: Option<LogSegment>,
    records_removed: u64,
}

impl Rewrite {
    fn discard(self) {
        if let Some(cleaned) = self.cleaned {
            if let Err(e) = cleaned.delete() {
                warn!("failed to discard cleaned segment {}: {}", cleaned.base_offset(), e);
            }
        }
    }
}

fn is_superseded(latest: &HashMap<Bytes, i64>, key: Option<&Bytes>, offset: i64) -> bool {
    key.and_then(|k| latest.get(k))
        .is_some_and(|latest_offset| *latest_offset > offset)
}

/// Rewritten segments waiting to be swapped in.
#[derive(Debug)]
struct CompactionPlan {
    generation: u64,
    rewrites: Vec<Rewrite>,
    result: CompactionResult,
}

impl PartitionLog {
    /// Compacts sealed segments lying wholly at or below the high watermark,
    /// rewriting them with up to `max_workers` threads.
    pub fn compact(&self, max_workers: usize) -> AppResult<CompactionResult> {
        let plan = self.plan_compaction(max_workers)?;
        self.swap_compacted(plan)
    }

    fn plan_compaction(&self, max_workers: usize) -> AppResult<CompactionPlan> {
        let generation = self.generation();
        let floor = self.high_watermark() + 1;
        let candidates: Vec<Arc<LogSegment>> = self
            .segment_snapshot()
            .into_iter()
            .take_while(|segment| segment.is_sealed() && segment.next_offset() <= floor)
            .collect();
        let mut plan = CompactionPlan {
            generation,
            rewrites: Vec::new(),
            result: CompactionResult {
                segments_scanned: candidates.len(),
                ..Default::default()
            },
        };
        if candidates.is_empty() {
            return Ok(plan);
        }

        let mut latest: HashMap<Bytes, i64> = HashMap::new();
        for segment in &candidates {
            segment.visit_records(|record, _| {
                if let Some(key) = &record.key {
                    let entry = latest.entry(key.clone()).or_insert(record.offset);
                    *entry = (*entry).max(record.offset);
                }
                Ok(())
            })?;
        }

        let chunk_size = candidates.len().div_ceil(max_workers.max(1));
        let outcomes: Vec<AppResult<Option<Rewrite>>> = std::thread::scope(|scope| {
            let workers: Vec<_> = candidates
                .chunks(chunk_size)
                .map(|chunk| {
                    let latest = &latest;
                    scope.spawn(move || {
                        chunk
                            .iter()
                            .map(|segment| self.rewrite_segment(segment, latest))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            workers
                .into_iter()
                .flat_map(|worker| {
                    worker.join().unwrap_or_else(|_| {
                        vec![Err(AppError::IllegalStateError(
                            "compaction worker panicked".into(),
                        ))]
                    })
                })
                .collect()
        });

        let mut failure = None;
        for outcome in outcomes {
            match outcome {
                Ok(Some(rewrite)) => plan.rewrites.push(rewrite),
                Ok(None) => {}
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }
        if let Some(e) = failure {
            plan.rewrites.into_iter().for_each(Rewrite::discard);
            return Err(e);
        }
        Ok(plan)
    }

    /// Swaps rewritten segments in, unless the segment set moved since the
    /// plan was made, in which case the output is discarded.
    fn swap_compacted(&self, plan: CompactionPlan) -> AppResult<CompactionResult> {
        let CompactionPlan {
            generation,
            rewrites,
            mut result,
        } = plan;
        if rewrites.is_empty() {
            return Ok(result);
        }

        let removed = {
            let _guard = self.write_lock.lock();
            let mut segments = self.segments.write();
            let unchanged = self.generation() == generation
                && rewrites.iter().all(|rewrite| {
                    rewrite.original.is_sealed()
                        && segments
                            .get(&rewrite.original.base_offset())
                            .is_some_and(|current| Arc::ptr_eq(current, &rewrite.original))
                });
            if !unchanged {
                drop(segments);
                debug!(
                    "{} segment set changed during compaction, discarding output",
                    self.stream_partition()
                );
                rewrites.into_iter().for_each(Rewrite::discard);
                result.aborted = true;
                return Ok(result);
            }

            let mut removed = Vec::new();
            let mut pending = rewrites.into_iter();
            let mut promote_error = None;
            for rewrite in pending.by_ref() {
                let base = rewrite.original.base_offset();
                result.bytes_before += rewrite.original.size();
                result.records_removed += rewrite.records_removed;
                match rewrite.cleaned {
                    Some(cleaned) => {
                        if let Err(e) = cleaned.promote() {
                            if let Err(delete_error) = cleaned.delete() {
                                warn!("failed to discard cleaned segment {}: {}", base, delete_error);
                            }
                            promote_error = Some(e);
                            break;
                        }
                        result.bytes_after += cleaned.size();
                        result.segments_rewritten += 1;
                        segments.insert(base, Arc::new(cleaned));
                    }
                    None => {
                        segments.remove(&base);
                        result.segments_removed += 1;
                        removed.push(rewrite.original);
                    }
                }
            }
            self.bump_generation();
            if let Some(e) = promote_error {
                pending.for_each(Rewrite::discard);
                drop(segments);
                for original in removed {
                    original.delete()?;
                }
                return Err(e);
            }
            removed
        };
        for original in removed {
            original.delete()?;
        }

        info!(
            "{} compacted: rewrote {} and removed {} of {} segments, dropped {} records ({} -> {} bytes)",
            self.stream_partition(),
            result.segments_rewritten,
            result.segments_removed,
            result.segments_scanned,
            result.records_removed,
            result.bytes_before,
            result.bytes_after
        );
        Ok(result)
    }

    fn rewrite_segment(
        &self,
        original: &Arc<LogSegment>,
        latest: &HashMap<Bytes, i64>,
    ) -> AppResult<Option<Rewrite>> {
        let mut superseded = 0u64;
        original.visit_records(|record, _| {
            if is_superseded(latest, record.key.as_ref(), record.offset) {
                superseded += 1;
            }
            Ok(())
        })?;
        if superseded == 0 {
            return Ok(None);
        }

        let cleaned = LogSegment::create_cleaned(
            self.dir(),
            original.base_offset(),
            original.created_at_ms(),
            self.config(),
        )?;
        let mut kept = 0u64;
        let written = original.visit_records(|record, frame| {
            if is_superseded(latest, record.key.as_ref(), record.offset) {
                return Ok(());
            }
            kept += 1;
            cleaned.append(frame, record.offset, record.offset, record.timestamp)
        });
        let sealed = written.and_then(|_| cleaned.seal());
        if let Err(e) = sealed {
            if let Err(delete_error) = cleaned.delete() {
                warn!(
                    "failed to discard cleaned segment {}: {}",
                    original.base_offset(),
                    delete_error
                );
            }
            return Err(e);
        }

        if kept == 0 {
            cleaned.delete()?;
            return Ok(Some(Rewrite {
                original: original.clone(),
                cleaned: None,
                records_removed: superseded,
            }));
        }
        cleaned.set_next_offset(original.next_offset());
        Ok(Some(Rewrite {
            original: original.clone(),
            cleaned: Some(cleaned),
            records_removed: superseded,
        }))
    }
}
