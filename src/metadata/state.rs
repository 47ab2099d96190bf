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

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use super::command::{
    MetadataCommand, MetadataEvent, NodeId, PartitionAssignment, PartitionMeta,
};
use crate::message::StreamPartition;
use crate::service::CustomStreamConfig;
use crate::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMeta {
    pub name: String,
    pub replication_factor: usize,
    pub config: CustomStreamConfig,
    pub partitions: BTreeMap<i32, PartitionMeta>,
}

/// The replicated cluster metadata.
///
/// [`MetadataState::apply`] never mutates `self`; it returns the next state,
/// so readers holding the previous value keep a consistent view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataState {
    streams: BTreeMap<String, StreamMeta>,
}

impl MetadataState {
    pub fn stream(&self, name: &str) -> Option<&StreamMeta> {
        self.streams.get(name)
    }

    pub fn streams(&self) -> impl Iterator<Item = &StreamMeta> {
        self.streams.values()
    }

    pub fn partition(&self, stream_partition: &StreamPartition) -> Option<&PartitionMeta> {
        self.streams
            .get(&stream_partition.stream)
            .and_then(|s| s.partitions.get(&stream_partition.partition))
    }

    pub fn current_leader(&self, stream_partition: &StreamPartition) -> Option<&NodeId> {
        self.partition(stream_partition).map(|p| &p.leader)
    }

    /// Partitions with a replica on `node`.
    pub fn partitions_for(&self, node: &str) -> Vec<&PartitionMeta> {
        self.streams
            .values()
            .flat_map(|s| s.partitions.values())
            .filter(|p| p.is_replica(node))
            .collect()
    }

    /// Validates `command` against this state and returns the successor state
    /// plus the event describing the change.
    pub fn apply(&self, command: &MetadataCommand) -> AppResult<(MetadataState, MetadataEvent)> {
        match command {
            MetadataCommand::CreateStream {
                name,
                replication_factor,
                config,
                partitions,
            } => self.create_stream(name, *replication_factor, config, partitions),
            MetadataCommand::DeleteStream { name } => {
                let mut next = self.clone();
                let removed = next
                    .streams
                    .remove(name)
                    .ok_or_else(|| AppError::StreamNotFound(name.clone()))?;
                let event = MetadataEvent::StreamDeleted {
                    stream: name.clone(),
                    partitions: removed.partitions.into_values().collect(),
                };
                Ok((next, event))
            }
            MetadataCommand::ShrinkIsr {
                stream,
                partition,
                replica,
                leader_epoch,
            } => self.update_partition(stream, *partition, *leader_epoch, |p| {
                if !p.in_isr(replica) {
                    return Err(AppError::InvalidOperation(format!(
                        "{} is not in the isr of {}",
                        replica,
                        p.stream_partition()
                    )));
                }
                if *replica == p.leader {
                    return Err(AppError::InvalidOperation(format!(
                        "cannot remove leader {} from the isr of {}",
                        replica,
                        p.stream_partition()
                    )));
                }
                if p.isr.len() == 1 {
                    return Err(AppError::InvalidOperation(format!(
                        "cannot remove the last isr member of {}",
                        p.stream_partition()
                    )));
                }
                p.isr.retain(|r| r != replica);
                Ok(MetadataEvent::IsrShrunk {
                    partition: p.clone(),
                    replica: replica.clone(),
                })
            }),
            MetadataCommand::ExpandIsr {
                stream,
                partition,
                replica,
                leader_epoch,
            } => self.update_partition(stream, *partition, *leader_epoch, |p| {
                if !p.is_replica(replica) {
                    return Err(AppError::InvalidOperation(format!(
                        "{} is not a replica of {}",
                        replica,
                        p.stream_partition()
                    )));
                }
                if p.in_isr(replica) {
                    return Err(AppError::InvalidOperation(format!(
                        "{} is already in the isr of {}",
                        replica,
                        p.stream_partition()
                    )));
                }
                p.isr.push(replica.clone());
                Ok(MetadataEvent::IsrExpanded {
                    partition: p.clone(),
                    replica: replica.clone(),
                })
            }),
            MetadataCommand::ChangeLeader {
                stream,
                partition,
                leader,
                leader_epoch,
            } => self.update_partition(stream, *partition, *leader_epoch, |p| {
                if *leader == p.leader {
                    return Err(AppError::InvalidOperation(format!(
                        "{} already leads {}",
                        leader,
                        p.stream_partition()
                    )));
                }
                if !p.in_isr(leader) {
                    return Err(AppError::InvalidOperation(format!(
                        "{} is not in the isr of {}",
                        leader,
                        p.stream_partition()
                    )));
                }
                let previous_leader = std::mem::replace(&mut p.leader, leader.clone());
                p.isr.retain(|r| *r != previous_leader);
                p.leader_epoch += 1;
                Ok(MetadataEvent::LeaderChanged {
                    partition: p.clone(),
                    previous_leader,
                })
            }),
        }
    }

    fn create_stream(
        &self,
        name: &str,
        replication_factor: usize,
        config: &CustomStreamConfig,
        assignments: &[PartitionAssignment],
    ) -> AppResult<(MetadataState, MetadataEvent)> {
        if name.is_empty() {
            return Err(AppError::InvalidValue("stream name is empty".into()));
        }
        if self.streams.contains_key(name) {
            return Err(AppError::StreamExists(name.to_string()));
        }
        if assignments.is_empty() {
            return Err(AppError::InvalidValue(format!("stream {name} has no partitions")));
        }
        config.validate()?;

        let mut partitions = BTreeMap::new();
        for assignment in assignments {
            if assignment.replicas.is_empty() {
                return Err(AppError::InvalidValue(format!(
                    "partition {}-{} has no replicas",
                    name, assignment.id
                )));
            }
            let unique: HashSet<&NodeId> = assignment.replicas.iter().collect();
            if unique.len() != assignment.replicas.len() {
                return Err(AppError::InvalidValue(format!(
                    "partition {}-{} has duplicate replicas",
                    name, assignment.id
                )));
            }
            if !assignment.replicas.contains(&assignment.leader) {
                return Err(AppError::InvalidValue(format!(
                    "leader {} of partition {}-{} is not a replica",
                    assignment.leader, name, assignment.id
                )));
            }
            let meta = PartitionMeta {
                stream: name.to_string(),
                id: assignment.id,
                replicas: assignment.replicas.clone(),
                isr: assignment.replicas.clone(),
                leader: assignment.leader.clone(),
                leader_epoch: 0,
            };
            if partitions.insert(assignment.id, meta).is_some() {
                return Err(AppError::InvalidValue(format!(
                    "partition {}-{} assigned twice",
                    name, assignment.id
                )));
            }
        }

        let event = MetadataEvent::StreamCreated {
            stream: name.to_string(),
            partitions: partitions.values().cloned().collect(),
        };
        let mut next = self.clone();
        next.streams.insert(
            name.to_string(),
            StreamMeta {
                name: name.to_string(),
                replication_factor,
                config: config.clone(),
                partitions,
            },
        );
        Ok((next, event))
    }

    fn update_partition<F>(
        &self,
        stream: &str,
        partition: i32,
        leader_epoch: u64,
        update: F,
    ) -> AppResult<(MetadataState, MetadataEvent)>
    where
        F: FnOnce(&mut PartitionMeta) -> AppResult<MetadataEvent>,
    {
        let mut next = self.clone();
        let meta = next
            .streams
            .get_mut(stream)
            .and_then(|s| s.partitions.get_mut(&partition))
            .ok_or_else(|| AppError::StreamNotFound(format!("{stream}-{partition}")))?;
        if meta.leader_epoch != leader_epoch {
            return Err(AppError::StaleEpoch(format!(
                "{}-{} is at epoch {}, command carries {}",
                stream, partition, meta.leader_epoch, leader_epoch
            )));
        }
        let event = update(meta)?;
        Ok((next, event))
    }
}
