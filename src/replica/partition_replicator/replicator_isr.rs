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

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{PartitionReplicator, ReplicaRole};
use crate::metadata::{MetadataCommand, NodeId};
use crate::AppError;

impl PartitionReplicator {
    /// Proposes ShrinkIsr for every ISR follower that has not caught up
    /// within `replica_max_lag_time`. Called periodically by the replica
    /// manager; a no-op unless leading.
    pub(crate) fn check_isr(self: &Arc<Self>) {
        let now = Instant::now();
        let max_lag = self.config.replica_max_lag_time();
        let (epoch, laggards) = {
            let mut role = self.role.write();
            let ReplicaRole::Leader(state) = &mut *role else {
                return;
            };
            let laggards: Vec<NodeId> = state
                .isr
                .iter()
                .filter(|member| **member != self.local_id)
                .filter(|member| !state.pending_isr.contains(*member))
                .filter(|member| {
                    state.followers.get(*member).map_or(true, |progress| {
                        now.duration_since(progress.last_caught_up) > max_lag
                    })
                })
                .cloned()
                .collect();
            state.pending_isr.extend(laggards.iter().cloned());
            (state.epoch, laggards)
        };

        for replica in laggards {
            warn!(
                "{} follower {} has not caught up for {:?}, shrinking isr",
                self.stream_partition, replica, max_lag
            );
            self.propose_isr_change(
                MetadataCommand::ShrinkIsr {
                    stream: self.stream_partition.stream.clone(),
                    partition: self.stream_partition.partition,
                    replica: replica.clone(),
                    leader_epoch: epoch,
                },
                replica,
            );
        }
    }

    /// Submits an ISR change for `replica` without blocking the caller.
    ///
    /// The committed partition state is applied right away so the next
    /// fetch or monitor pass sees it, and `replica` leaves the pending set
    /// either way.
    pub(super) fn propose_isr_change(self: &Arc<Self>, command: MetadataCommand, replica: NodeId) {
        let Some(complete) = self.shutdown_complete.upgrade() else {
            return;
        };
        let replicator = Arc::clone(self);
        tokio::spawn(async move {
            let _complete = complete;
            let name = command.name();
            let committed = match replicator.metadata.submit(command).await {
                Ok(change) => {
                    info!(
                        "{} {} for {} committed at index {}",
                        replicator.stream_partition, name, replica, change.index
                    );
                    change.event.partition().cloned()
                }
                Err(AppError::InvalidOperation(reason)) => {
                    debug!("{} {} rejected: {}", replicator.stream_partition, name, reason);
                    None
                }
                Err(e) => {
                    warn!(
                        "{} {} for {} failed: {}",
                        replicator.stream_partition, name, replica, e
                    );
                    None
                }
            };
            if let Some(partition) = committed {
                if let Err(e) = replicator.on_metadata(partition).await {
                    warn!("{} applying isr change: {}", replicator.stream_partition, e);
                }
            }
            if let ReplicaRole::Leader(state) = &mut *replicator.role.write() {
                state.pending_isr.remove(&replica);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::tests::single_node;
    use super::*;
    use crate::message::StreamPartition;
    use crate::replica::FetchRequest;
    use crate::AppResult;

    fn fetch(replica: &str, offset: i64) -> FetchRequest {
        FetchRequest {
            stream_partition: StreamPartition::new("orders", 0),
            replica_id: replica.into(),
            leader_epoch: 0,
            fetch_offset: offset,
            max_bytes: 4096,
            max_wait: Duration::ZERO,
        }
    }

    async fn wait_for_isr(
        harness: &super::super::tests::Harness,
        expected: &[&str],
    ) -> AppResult<()> {
        let sp = StreamPartition::new("orders", 0);
        for _ in 0..200 {
            let isr = harness
                .metadata
                .partition(&sp)
                .map(|p| p.isr)
                .unwrap_or_default();
            if isr == expected {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("isr never became {:?}", expected);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_follower_leaves_the_isr() -> AppResult<()> {
        let harness = single_node().await?;
        let replicator = harness.hosted(&["a", "b"], "a").await?;

        replicator.check_isr();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(replicator.isr(), vec!["a", "b"]);

        tokio::time::sleep(harness.config.replica_max_lag_time() + Duration::from_millis(10))
            .await;
        replicator.check_isr();
        wait_for_isr(&harness, &["a"]).await?;
        for _ in 0..100 {
            if replicator.isr() == vec!["a"] {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(replicator.isr(), vec!["a"]);
        harness.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn caught_up_follower_rejoins_the_isr() -> AppResult<()> {
        let harness = single_node().await?;
        let replicator = harness.hosted(&["a", "b"], "a").await?;
        harness
            .metadata
            .propose(MetadataCommand::ShrinkIsr {
                stream: "orders".into(),
                partition: 0,
                replica: "b".into(),
                leader_epoch: 0,
            })
            .await?;
        replicator.on_metadata(harness.metadata.partition(replicator.stream_partition()).unwrap())
            .await?;
        assert_eq!(replicator.isr(), vec!["a"]);

        replicator
            .append(vec![crate::message::Message::new("x")])
            .await?;
        assert_eq!(replicator.high_watermark(), 0);

        // behind the high watermark: no expansion
        replicator.handle_fetch(fetch("b", 0)).await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(replicator.isr(), vec!["a"]);

        replicator.handle_fetch(fetch("b", 1)).await?;
        wait_for_isr(&harness, &["a", "b"]).await?;
        harness.shutdown().await;
        Ok(())
    }
}
