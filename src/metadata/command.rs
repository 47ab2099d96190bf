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

use serde::{Deserialize, Serialize};

use crate::message::StreamPartition;
use crate::service::CustomStreamConfig;

/// Identifies a broker. Equal to its configured `server_id`.
pub type NodeId = String;

/// Initial placement of one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionAssignment {
    pub id: i32,
    pub replicas: Vec<NodeId>,
    pub leader: NodeId,
}

/// Mutations carried by the consensus log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MetadataCommand {
    CreateStream {
        name: String,
        replication_factor: usize,
        config: CustomStreamConfig,
        partitions: Vec<PartitionAssignment>,
    },
    DeleteStream {
        name: String,
    },
    ShrinkIsr {
        stream: String,
        partition: i32,
        replica: NodeId,
        leader_epoch: u64,
    },
    ExpandIsr {
        stream: String,
        partition: i32,
        replica: NodeId,
        leader_epoch: u64,
    },
    ChangeLeader {
        stream: String,
        partition: i32,
        leader: NodeId,
        leader_epoch: u64,
    },
}

impl MetadataCommand {
    pub fn name(&self) -> &'static str {
        match self {
            MetadataCommand::CreateStream { .. } => "create_stream",
            MetadataCommand::DeleteStream { .. } => "delete_stream",
            MetadataCommand::ShrinkIsr { .. } => "shrink_isr",
            MetadataCommand::ExpandIsr { .. } => "expand_isr",
            MetadataCommand::ChangeLeader { .. } => "change_leader",
        }
    }
}

/// Replication state of one partition as recorded in metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMeta {
    pub stream: String,
    pub id: i32,
    pub replicas: Vec<NodeId>,
    pub isr: Vec<NodeId>,
    pub leader: NodeId,
    pub leader_epoch: u64,
}

impl PartitionMeta {
    pub fn stream_partition(&self) -> StreamPartition {
        StreamPartition::new(self.stream.clone(), self.id)
    }

    pub fn is_replica(&self, node: &str) -> bool {
        self.replicas.iter().any(|r| r == node)
    }

    pub fn in_isr(&self, node: &str) -> bool {
        self.isr.iter().any(|r| r == node)
    }
}

/// What a successfully applied command changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetadataEvent {
    StreamCreated {
        stream: String,
        partitions: Vec<PartitionMeta>,
    },
    StreamDeleted {
        stream: String,
        partitions: Vec<PartitionMeta>,
    },
    LeaderChanged {
        partition: PartitionMeta,
        previous_leader: NodeId,
    },
    IsrShrunk {
        partition: PartitionMeta,
        replica: NodeId,
    },
    IsrExpanded {
        partition: PartitionMeta,
        replica: NodeId,
    },
    /// The whole state was replaced by an installed snapshot.
    Restored,
}

impl MetadataEvent {
    /// The stream the event is about, `None` for `Restored`.
    pub fn stream(&self) -> Option<&str> {
        match self {
            MetadataEvent::StreamCreated { stream, .. }
            | MetadataEvent::StreamDeleted { stream, .. } => Some(stream),
            MetadataEvent::LeaderChanged { partition, .. }
            | MetadataEvent::IsrShrunk { partition, .. }
            | MetadataEvent::IsrExpanded { partition, .. } => Some(&partition.stream),
            MetadataEvent::Restored => None,
        }
    }

    /// The single partition a leader or ISR change is about.
    pub fn partition(&self) -> Option<&PartitionMeta> {
        match self {
            MetadataEvent::LeaderChanged { partition, .. }
            | MetadataEvent::IsrShrunk { partition, .. }
            | MetadataEvent::IsrExpanded { partition, .. } => Some(partition),
            _ => None,
        }
    }
}

/// An event together with the consensus index that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataChange {
    pub index: u64,
    pub event: MetadataEvent,
}
