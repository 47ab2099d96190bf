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

use std::sync::Arc;

use tracing::{debug, info};

use crate::log::partition_log::PartitionLog;
use crate::log::segment::LogSegment;
use crate::service::StreamsConfig;
use crate::AppResult;

/// Limits a partition is trimmed to. Zero disables a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_bytes: u64,
    pub max_messages: u64,
    pub max_age_ms: u64,
}

impl From<&StreamsConfig> for RetentionPolicy {
    fn from(config: &StreamsConfig) -> Self {
        Self {
            max_bytes: config.retention_max_bytes,
            max_messages: config.retention_max_messages,
            max_age_ms: config.retention_max_age_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentSummary {
    pub base_offset: i64,
    /// One past the segment's last offset.
    pub end_offset: i64,
    pub size: u64,
    pub newest_timestamp: i64,
    pub sealed: bool,
}

impl From<&LogSegment> for SegmentSummary {
    fn from(segment: &LogSegment) -> Self {
        Self {
            base_offset: segment.base_offset(),
            end_offset: segment.next_offset(),
            size: segment.size(),
            newest_timestamp: segment.max_timestamp(),
            sealed: segment.is_sealed(),
        }
    }
}

/// Picks the oldest segments that fall outside the retained window.
///
/// Only a prefix of sealed segments is ever selected, and only segments
/// whose every offset is below `replication_floor` (the smallest log end
/// offset among in-sync replicas). A segment expires when, after removing
/// it, the remaining log still holds at least `max_bytes` bytes or
/// `max_messages` offsets, or when its newest record is older than
/// `max_age_ms`.
pub fn select_expired_segments(
    segments: &[SegmentSummary],
    log_end_offset: i64,
    replication_floor: i64,
    policy: &RetentionPolicy,
    now_ms: i64,
) -> Vec<i64> {
    let mut remaining: u64 = segments.iter().map(|s| s.size).sum();
    let mut expired = Vec::new();
    for segment in segments {
        if !segment.sealed || segment.end_offset > replication_floor {
            break;
        }
        let by_size = policy.max_bytes > 0 && remaining - segment.size >= policy.max_bytes;
        let by_count = policy.max_messages > 0
            && (log_end_offset - segment.end_offset) as u64 >= policy.max_messages;
        let by_age = policy.max_age_ms > 0
            && segment.newest_timestamp >= 0
            && now_ms - segment.newest_timestamp > policy.max_age_ms as i64;
        if !(by_size || by_count || by_age) {
            break;
        }
        remaining -= segment.size;
        expired.push(segment.base_offset);
    }
    expired
}

impl PartitionLog {
    /// Deletes expired segments. Returns the base offsets removed.
    pub fn apply_retention(&self, now_ms: i64) -> AppResult<Vec<i64>> {
        let policy = RetentionPolicy::from(self.config());
        if policy.max_bytes == 0 && policy.max_messages == 0 && policy.max_age_ms == 0 {
            return Ok(Vec::new());
        }
        let removed: Vec<Arc<LogSegment>> = {
            let mut segments = self.segments.write();
            let summaries: Vec<SegmentSummary> =
                segments.values().map(|s| SegmentSummary::from(s.as_ref())).collect();
            let expired = select_expired_segments(
                &summaries,
                self.log_end_offset(),
                self.high_watermark() + 1,
                &policy,
                now_ms,
            );
            if expired.is_empty() {
                return Ok(Vec::new());
            }
            self.bump_generation();
            expired.iter().filter_map(|base| segments.remove(base)).collect()
        };

        let mut bases = Vec::with_capacity(removed.len());
        for segment in removed {
            segment.delete()?;
            debug!(
                "{} retention removed segment [{}, {})",
                self.stream_partition(),
                segment.base_offset(),
                segment.next_offset()
            );
            bases.push(segment.base_offset());
        }
        info!(
            "{} retention removed {} segments, log start now {}",
            self.stream_partition(),
            bases.len(),
            self.log_start_offset()
        );
        Ok(bases)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tempfile::tempdir;

    use super::*;
    use crate::message::{Message, StreamPartition};

    fn summary(base: i64, end: i64, size: u64, newest: i64, sealed: bool) -> SegmentSummary {
        SegmentSummary {
            base_offset: base,
            end_offset: end,
            size,
            newest_timestamp: newest,
            sealed,
        }
    }

    fn layout() -> Vec<SegmentSummary> {
        vec![
            summary(0, 10, 100, 1_000, true),
            summary(10, 20, 100, 2_000, true),
            summary(20, 30, 100, 3_000, true),
            summary(30, 35, 50, 4_000, false),
        ]
    }

    const NO_LIMITS: RetentionPolicy = RetentionPolicy {
        max_bytes: 0,
        max_messages: 0,
        max_age_ms: 0,
    };

    #[test]
    fn size_limit_keeps_at_least_max_bytes() {
        let policy = RetentionPolicy {
            max_bytes: 150,
            ..NO_LIMITS
        };
        assert_eq!(select_expired_segments(&layout(), 35, 35, &policy, 0), vec![0, 10]);
    }

    #[test]
    fn message_limit_counts_offsets() {
        let policy = RetentionPolicy {
            max_messages: 15,
            ..NO_LIMITS
        };
        assert_eq!(select_expired_segments(&layout(), 35, 35, &policy, 0), vec![0, 10]);
    }

    #[test]
    fn age_limit_uses_newest_record() {
        let policy = RetentionPolicy {
            max_age_ms: 1_500,
            ..NO_LIMITS
        };
        assert_eq!(select_expired_segments(&layout(), 35, 35, &policy, 3_600), vec![0, 10]);
    }

    #[test]
    fn never_past_replication_floor() {
        let policy = RetentionPolicy {
            max_bytes: 1,
            ..NO_LIMITS
        };
        // offset 19 not yet fetched by every in-sync replica
        assert_eq!(select_expired_segments(&layout(), 35, 19, &policy, 0), vec![0]);
        assert!(select_expired_segments(&layout(), 35, 9, &policy, 0).is_empty());
    }

    #[test]
    fn active_segment_is_never_selected() {
        let policy = RetentionPolicy {
            max_age_ms: 1,
            ..NO_LIMITS
        };
        assert_eq!(
            select_expired_segments(&layout(), 35, 35, &policy, 1_000_000),
            vec![0, 10, 20]
        );
    }

    #[tokio::test]
    async fn retention_respects_high_watermark() -> AppResult<()> {
        let dir = tempdir()?;
        let config = StreamsConfig {
            segment_max_bytes: 200,
            retention_max_messages: 5,
            ..Default::default()
        };
        let log = PartitionLog::open(StreamPartition::new("metrics", 0), dir.path(), config).await?;
        let messages = (0..30)
            .map(|i| Message::new(Bytes::from(format!("reading-{i:03}"))))
            .collect();
        log.append(messages, 0)?;
        let segments_before = log.segment_count();
        assert!(segments_before > 3);

        // nothing is committed, nothing may go
        assert!(log.apply_retention(0)?.is_empty());

        log.advance_high_watermark(29);
        let removed = log.apply_retention(0)?;
        assert!(!removed.is_empty());
        assert_eq!(log.segment_count(), segments_before - removed.len());
        assert!(log.log_end_offset() - log.log_start_offset() >= 5);
        assert!(matches!(
            log.read(0, usize::MAX, i64::MAX),
            Err(crate::AppError::OffsetOutOfRange(_, 30))
        ));
        Ok(())
    }
}
