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

use crate::metadata::{MetadataChange, MetadataEvent, NodeId, PartitionMeta};
use crate::utils::now_ms;

/// A committed metadata change as published on the activity stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub id: String,
    pub op: String,
    pub stream: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leader: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub isr: Vec<NodeId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leader_epoch: Option<u64>,
    pub timestamp: i64,
}

impl ActivityEvent {
    fn stream_level(op: &str, stream: &str) -> Self {
        ActivityEvent {
            id: uuid::Uuid::new_v4().to_string(),
            op: op.to_string(),
            stream: stream.to_string(),
            partition: None,
            leader: None,
            isr: Vec::new(),
            leader_epoch: None,
            timestamp: now_ms(),
        }
    }

    fn partition_level(op: &str, partition: &PartitionMeta) -> Self {
        ActivityEvent {
            partition: Some(partition.id),
            leader: Some(partition.leader.clone()),
            isr: partition.isr.clone(),
            leader_epoch: Some(partition.leader_epoch),
            ..Self::stream_level(op, &partition.stream)
        }
    }

    /// Maps a change to its activity record. Snapshot restores carry no
    /// single operation and map to nothing.
    pub fn from_change(change: &MetadataChange) -> Option<ActivityEvent> {
        let event = match &change.event {
            MetadataEvent::StreamCreated { stream, .. } => {
                Self::stream_level("create_stream", stream)
            }
            MetadataEvent::StreamDeleted { stream, .. } => {
                Self::stream_level("delete_stream", stream)
            }
            MetadataEvent::LeaderChanged { partition, .. } => {
                Self::partition_level("change_leader", partition)
            }
            MetadataEvent::IsrShrunk { partition, .. } => {
                Self::partition_level("shrink_isr", partition)
            }
            MetadataEvent::IsrExpanded { partition, .. } => {
                Self::partition_level("expand_isr", partition)
            }
            MetadataEvent::Restored => return None,
        };
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_changes_carry_replication_state() {
        let change = MetadataChange {
            index: 7,
            event: MetadataEvent::IsrShrunk {
                partition: PartitionMeta {
                    stream: "orders".into(),
                    id: 2,
                    replicas: vec!["a".into(), "b".into()],
                    isr: vec!["a".into()],
                    leader: "a".into(),
                    leader_epoch: 3,
                },
                replica: "b".into(),
            },
        };
        let event = ActivityEvent::from_change(&change).unwrap();
        assert_eq!(event.op, "shrink_isr");
        assert_eq!(event.partition, Some(2));
        assert_eq!(event.isr, vec!["a"]);

        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["leader_epoch"], 3);
        assert_eq!(json["stream"], "orders");
    }

    #[test]
    fn stream_changes_omit_partition_fields() {
        let change = MetadataChange {
            index: 1,
            event: MetadataEvent::StreamDeleted {
                stream: "orders".into(),
                partitions: Vec::new(),
            },
        };
        let event = ActivityEvent::from_change(&change).unwrap();
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"op\":\"delete_stream\""));
        assert!(!json.contains("leader"));
        let back: ActivityEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);

        let restored = MetadataChange {
            index: 2,
            event: MetadataEvent::Restored,
        };
        assert!(ActivityEvent::from_change(&restored).is_none());
    }
}
