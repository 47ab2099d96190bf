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

use super::PartitionLog;
use crate::message::MemoryRecords;
use crate::{AppError, AppResult};

impl PartitionLog {
    /// Reads records in `[offset, max_offset)` up to roughly `max_bytes`.
    ///
    /// Never waits for data. At least one whole record is returned when one
    /// exists in range. Offsets outside `[log_start, log_end]` fail with
    /// `OffsetOutOfRange`.
    pub fn read(&self, offset: i64, max_bytes: usize, max_offset: i64) -> AppResult<MemoryRecords> {
        let start = self.log_start_offset();
        let end = self.log_end_offset();
        if offset < start || offset > end {
            return Err(AppError::OffsetOutOfRange(start, end));
        }
        let max_offset = max_offset.min(end);
        if offset >= max_offset {
            return Ok(MemoryRecords::empty());
        }

        let segments = self.segment_snapshot();
        let first = segments
            .partition_point(|segment| segment.base_offset() <= offset)
            .saturating_sub(1);
        // compaction can leave gaps, so keep walking until something turns up
        for segment in &segments[first..] {
            if segment.base_offset() >= max_offset {
                break;
            }
            let buf = segment.read(offset, max_bytes, max_offset)?;
            if !buf.is_empty() {
                return Ok(MemoryRecords::new(buf.freeze()));
            }
        }
        Ok(MemoryRecords::empty())
    }

    /// Reads only records at or below the high watermark.
    pub fn read_committed(&self, offset: i64, max_bytes: usize) -> AppResult<MemoryRecords> {
        self.read(offset, max_bytes, self.high_watermark() + 1)
    }
}

#[cfg(test)]
mod tests {
    use bytes::{Bytes, BytesMut};
    use rstest::{fixture, rstest};
    use tempfile::{tempdir, TempDir};

    use super::*;
    use crate::message::{Message, Record, StreamPartition};
    use crate::service::StreamsConfig;

    struct LogFixture {
        _dir: TempDir,
        log: std::sync::Arc<PartitionLog>,
    }

    async fn open_log(config: StreamsConfig) -> LogFixture {
        let dir = tempdir().unwrap();
        let log = PartitionLog::open(StreamPartition::new("events", 0), dir.path(), config)
            .await
            .unwrap();
        LogFixture { _dir: dir, log }
    }

    #[fixture]
    fn config() -> StreamsConfig {
        StreamsConfig {
            index_interval_bytes: 128,
            index_max_bytes: 4096,
            ..Default::default()
        }
    }

    fn messages(n: usize) -> Vec<Message> {
        (0..n)
            .map(|i| Message::new(Bytes::from(format!("message-{i}"))).with_key(format!("k{}", i % 5)))
            .collect()
    }

    fn offsets(records: &MemoryRecords) -> Vec<i64> {
        records.records().unwrap().iter().map(|r| r.offset).collect()
    }

    /// Size of a record with an empty key and a value of `value_len` bytes.
    fn record_size(value_len: usize) -> usize {
        Record::from_message(Message::new(vec![0u8; value_len]), 0, 0, 0).encoded_size()
    }

    #[rstest]
    #[tokio::test]
    async fn appends_are_contiguous(config: StreamsConfig) {
        let fixture = open_log(config).await;
        let log = &fixture.log;
        let a = log.append(messages(3), 1).unwrap();
        let b = log.append(messages(1), 1).unwrap();
        let c = log.append(messages(7), 2).unwrap();
        assert_eq!((a.first_offset, a.last_offset), (0, 2));
        assert_eq!((b.first_offset, b.last_offset), (3, 3));
        assert_eq!((c.first_offset, c.last_offset), (4, 10));
        assert_eq!(c.leader_epoch, 2);
        assert_eq!(log.log_end_offset(), 11);

        let all = log.read(0, usize::MAX, i64::MAX).unwrap();
        assert_eq!(offsets(&all), (0..11).collect::<Vec<_>>());
        let records = all.records().unwrap();
        assert_eq!(records[3].leader_epoch, 1);
        assert_eq!(records[4].leader_epoch, 2);
        assert_eq!(records[4].key.as_deref(), Some(&b"k0"[..]));
    }

    #[rstest]
    #[tokio::test]
    async fn exceeding_segment_size_by_one_byte_rolls(config: StreamsConfig) {
        let fixture = open_log(StreamsConfig {
            segment_max_bytes: 1024,
            ..config
        })
        .await;
        let log = &fixture.log;

        // two records totalling exactly 1025 bytes
        let small = record_size(100);
        let large_value = (1025 - small) - (record_size(1000) - 1000);
        let large = record_size(large_value);
        assert_eq!(small + large, 1025);

        log.append(vec![Message::new(vec![1u8; 100]), Message::new(vec![2u8; large_value])], 0)
            .unwrap();
        let segments = log.segment_snapshot();
        assert_eq!(segments.len(), 2);
        assert!(segments[0].is_sealed());
        assert!(segments[0].size() <= 1024);
        assert!(!segments[1].is_sealed());
        assert_eq!(segments[1].base_offset(), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn oversized_first_record_still_fits(config: StreamsConfig) {
        let fixture = open_log(StreamsConfig {
            segment_max_bytes: 64,
            ..config
        })
        .await;
        let log = &fixture.log;
        log.append(vec![Message::new(vec![0u8; 500])], 0).unwrap();
        log.append(vec![Message::new(vec![0u8; 500])], 0).unwrap();
        assert_eq!(log.segment_count(), 2);
        assert_eq!(offsets(&log.read(1, usize::MAX, i64::MAX).unwrap()), vec![1]);
    }

    #[rstest]
    #[tokio::test]
    async fn read_bounds(config: StreamsConfig) {
        let fixture = open_log(StreamsConfig {
            segment_max_bytes: 300,
            ..config
        })
        .await;
        let log = &fixture.log;
        log.append(messages(40), 0).unwrap();
        assert!(log.segment_count() > 3);

        // across a segment boundary the read stops at the segment end
        let second = log.segment_snapshot()[1].base_offset();
        let records = log.read(second - 1, usize::MAX, i64::MAX).unwrap();
        assert_eq!(offsets(&records), vec![second - 1]);

        assert_eq!(offsets(&log.read(5, usize::MAX, 7).unwrap()), vec![5, 6]);
        assert_eq!(offsets(&log.read(5, 1, i64::MAX).unwrap()), vec![5]);
        assert!(log.read(40, usize::MAX, i64::MAX).unwrap().is_empty());
        assert!(matches!(
            log.read(41, usize::MAX, i64::MAX),
            Err(AppError::OffsetOutOfRange(0, 40))
        ));
    }

    #[rstest]
    #[tokio::test]
    async fn committed_reads_stop_at_high_watermark(config: StreamsConfig) {
        let fixture = open_log(config).await;
        let log = &fixture.log;
        log.append(messages(10), 0).unwrap();
        assert!(log.read_committed(0, usize::MAX).unwrap().is_empty());

        assert!(log.advance_high_watermark(4));
        assert!(!log.advance_high_watermark(3));
        assert_eq!(offsets(&log.read_committed(0, usize::MAX).unwrap()), (0..5).collect::<Vec<_>>());
        assert!(log.read_committed(5, usize::MAX).unwrap().is_empty());

        // clamped to the log end
        log.advance_high_watermark(100);
        assert_eq!(log.high_watermark(), 9);
    }

    #[rstest]
    #[tokio::test]
    async fn replicated_append_keeps_offsets(config: StreamsConfig) {
        let leader = open_log(config.clone()).await;
        let follower = open_log(config).await;
        leader.log.append(messages(6), 3).unwrap();

        let batch = leader.log.read(0, usize::MAX, i64::MAX).unwrap();
        let info = follower.log.append_replicated(&batch).unwrap().unwrap();
        assert_eq!((info.first_offset, info.last_offset, info.leader_epoch), (0, 5, 3));
        // a replayed fetch is a no-op
        assert!(follower.log.append_replicated(&batch).unwrap().is_none());
        let overlap = leader.log.read(4, usize::MAX, i64::MAX).unwrap();
        assert!(follower.log.append_replicated(&overlap).unwrap().is_none());

        leader.log.append(messages(2), 4).unwrap();
        let tail = leader.log.read(3, usize::MAX, i64::MAX).unwrap();
        let info = follower.log.append_replicated(&tail).unwrap().unwrap();
        assert_eq!((info.first_offset, info.last_offset), (6, 7));
        assert_eq!(follower.log.log_end_offset(), 8);
        assert_eq!(
            follower.log.read(0, usize::MAX, i64::MAX).unwrap().buffer(),
            leader.log.read(0, usize::MAX, i64::MAX).unwrap().buffer()
        );
    }

    #[rstest]
    #[tokio::test]
    async fn replicated_append_rejects_damage(config: StreamsConfig) {
        let fixture = open_log(config).await;
        let mut buf = BytesMut::new();
        Record::from_message(Message::new("x"), 0, 0, 0).encode(&mut buf);
        let last = buf.len() - 1;
        buf[last] ^= 1;
        let result = fixture.log.append_replicated(&MemoryRecords::new(buf.freeze()));
        assert!(matches!(result, Err(AppError::Corrupt(_))));
        assert_eq!(fixture.log.log_end_offset(), 0);
    }

    #[rstest]
    #[tokio::test]
    async fn truncate_and_reset(config: StreamsConfig) {
        let fixture = open_log(StreamsConfig {
            segment_max_bytes: 300,
            ..config
        })
        .await;
        let log = &fixture.log;
        log.append(messages(30), 1).unwrap();
        log.advance_high_watermark(25);
        let generation = log.generation();

        log.truncate_to(12).unwrap();
        assert_eq!(log.log_end_offset(), 12);
        assert_eq!(log.high_watermark(), 11);
        assert!(log.generation() > generation);
        assert_eq!(offsets(&log.read(11, usize::MAX, i64::MAX).unwrap()), vec![11]);
        let info = log.append(messages(1), 2).unwrap();
        assert_eq!(info.first_offset, 12);
        let last = log.read(12, usize::MAX, i64::MAX).unwrap().records().unwrap();
        assert_eq!(last[0].leader_epoch, 2);

        log.reset_to(100).unwrap();
        assert_eq!(log.log_start_offset(), 100);
        assert_eq!(log.log_end_offset(), 100);
        assert_eq!(log.high_watermark(), 99);
        assert_eq!(log.segment_count(), 1);
        assert_eq!(log.append(messages(1), 2).unwrap().first_offset, 100);
        assert!(matches!(
            log.read(0, usize::MAX, i64::MAX),
            Err(AppError::OffsetOutOfRange(100, 101))
        ));
    }

    #[rstest]
    #[tokio::test]
    async fn manual_roll(config: StreamsConfig) {
        let fixture = open_log(config).await;
        let log = &fixture.log;
        log.roll().unwrap();
        assert_eq!(log.segment_count(), 1);
        log.append(messages(2), 0).unwrap();
        log.roll().unwrap();
        assert_eq!(log.segment_count(), 2);
        assert_eq!(log.active_segment().unwrap().base_offset(), 2);
    }
}
