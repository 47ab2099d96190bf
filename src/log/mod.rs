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

//! Segment storage for stream partitions.
//!
//! Every partition is an append-only [`PartitionLog`] split into segments. A
//! segment is a `<base offset>.log` file of length prefixed records plus a
//! sparse `<base offset>.index` mapping relative offsets to file positions.
//! Only the last segment accepts writes.
//!
//! Background maintenance lives in [`LogManager`]: periodic checkpoints of the
//! high watermark, retention and key based compaction.

mod checkpoint;
mod compaction;
mod index_file;
mod log_manager;
mod partition_log;
mod retention;
pub(crate) mod segment;

pub use checkpoint::CheckPointFile;
pub use index_file::ReadOnlyIndexFile;
pub use compaction::CompactionResult;
pub use log_manager::LogManager;
pub use partition_log::{LogAppendInfo, PartitionLog};
pub use retention::{select_expired_segments, RetentionPolicy, SegmentSummary};
pub use segment::{index_file_name, log_file_name, LogSegment};
