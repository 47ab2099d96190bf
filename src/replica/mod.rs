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

//! Partition replication.
//!
//! Every partition hosted on this broker has one [`PartitionReplicator`].
//! The leader assigns offsets and serves fetches, followers pull from the
//! leader and copy records verbatim. The high watermark (HW) is the last
//! offset every in-sync replica holds; the leader computes it from the
//! fetch offsets its followers report.

mod delayed_fetch;
mod delayed_produce;
mod partition_replicator;
mod replica_manager;
#[cfg(test)]
pub(crate) mod test_support;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::message::{MemoryRecords, Message, StreamPartition};
use crate::metadata::NodeId;

pub use partition_replicator::PartitionReplicator;
pub use replica_manager::ReplicaManager;

/// Upper bound on the bytes a follower asks for in one fetch.
pub const REPLICA_FETCH_MAX_BYTES: usize = 1024 * 1024;

/// When a publish is acknowledged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AckPolicy {
    /// The caller does not wait for anything.
    None,
    /// After the leader wrote the batch locally.
    Leader,
    /// After the HW covers the last offset of the batch.
    #[default]
    All,
}

/// A follower asking the leader for records.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub stream_partition: StreamPartition,
    pub replica_id: NodeId,
    /// Epoch the follower believes the leader is serving.
    pub leader_epoch: u64,
    /// First offset the follower does not hold yet, its LEO.
    pub fetch_offset: i64,
    pub max_bytes: usize,
    /// How long the leader may hold the request when nothing is readable.
    pub max_wait: Duration,
}

#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub leader_epoch: u64,
    pub high_watermark: i64,
    pub log_start_offset: i64,
    pub log_end_offset: i64,
    pub records: MemoryRecords,
}

/// A publish forwarded to the partition leader.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub stream_partition: StreamPartition,
    pub messages: Vec<Message>,
    pub ack_policy: AckPolicy,
    pub timeout: Duration,
}

/// Offsets assigned to a publish. With [`AckPolicy::None`] the offsets are
/// unknown and both are `-1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishAck {
    pub first_offset: i64,
    pub last_offset: i64,
    pub leader_epoch: u64,
}

impl PublishAck {
    pub fn unknown(leader_epoch: u64) -> Self {
        PublishAck {
            first_offset: -1,
            last_offset: -1,
            leader_epoch,
        }
    }
}

/// Purgatory key shared by parked fetches and parked acknowledgments.
pub(crate) fn watch_key(stream_partition: &StreamPartition) -> String {
    stream_partition.id()
}
