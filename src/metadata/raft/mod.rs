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

//! Raft consensus for the metadata log.
//!
//! [`RaftNode`] is a pure state machine: it consumes ticks, proposals and
//! peer messages and leaves outgoing messages and committed entries for the
//! driver to collect. Persistence goes through [`RaftStorage`], fronted by an
//! in-memory cache of recent entries; snapshots are JSON files managed by
//! [`SnapshotStore`].

mod log_cache;
mod message;
mod node;
mod snapshot;
mod storage;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::command::{MetadataCommand, NodeId};
use crate::service::ClusteringConfig;

pub use log_cache::LogCache;
pub use message::{Envelope, RaftMessage};
pub use node::{RaftNode, RaftRole};
pub use snapshot::{Snapshot, SnapshotStore};
pub use storage::{MemoryStorage, RaftStorage, RocksStorage};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// Appended by every new leader so entries of earlier terms commit.
    Noop,
    Command(MetadataCommand),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub payload: EntryPayload,
}

/// State that must be durable before answering any peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub voted_for: Option<NodeId>,
    pub membership: Vec<NodeId>,
}

#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub id: NodeId,
    pub election_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub cache_size: usize,
    pub snapshot_threshold: u64,
    pub trailing_logs: u64,
    pub max_append_entries: usize,
}

impl RaftConfig {
    pub fn new(id: impl Into<NodeId>, clustering: &ClusteringConfig) -> Self {
        RaftConfig {
            id: id.into(),
            election_timeout: clustering.raft_election_timeout(),
            heartbeat_interval: clustering.raft_heartbeat_interval(),
            cache_size: clustering.raft_cache_size,
            snapshot_threshold: clustering.raft_snapshot_threshold,
            trailing_logs: clustering.raft_trailing_logs,
            max_append_entries: 256,
        }
    }
}
