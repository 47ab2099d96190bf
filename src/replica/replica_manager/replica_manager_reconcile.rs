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

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tracing::{debug, error, info, warn};

use super::ReplicaManager;
use crate::message::StreamPartition;
use crate::metadata::{MetadataChange, MetadataEvent, MetadataState, PartitionMeta};
use crate::replica::PartitionReplicator;
use crate::{AppError, AppResult, Shutdown};

impl ReplicaManager {
    pub(super) async fn follow_metadata(
        &self,
        mut changes: Receiver<MetadataChange>,
        mut shutdown: Shutdown,
    ) {
        loop {
            let change = tokio::select! {
                change = changes.recv() => change,
                _ = shutdown.recv() => break,
            };
            let result = match change {
                Ok(change) => self.on_change(change).await,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("missed {} metadata changes, reconciling from state", skipped);
                    self.reconcile(&self.metadata.state()).await
                }
                Err(RecvError::Closed) => break,
            };
            if let Err(e) = result {
                error!("applying metadata change failed: {}", e);
            }
        }
        debug!("metadata follower stopped");
    }

    async fn on_change(&self, change: MetadataChange) -> AppResult<()> {
        debug!("metadata change {} {:?}", change.index, change.event);
        match &change.event {
            // a stream deleted and created again must not inherit the old log
            MetadataEvent::StreamDeleted { partitions, .. } => {
                let _guard = self.reconcile_lock.lock().await;
                for partition in partitions {
                    self.remove(&partition.stream_partition()).await;
                }
            }
            MetadataEvent::Restored => {
                self.reconcile(&self.metadata.state()).await?;
                let removed = self.remove_orphans().await?;
                if !removed.is_empty() {
                    info!("removed {} partitions absent from the restored state", removed.len());
                }
                return Ok(());
            }
            _ => {}
        }
        self.reconcile(&self.metadata.state()).await
    }

    /// Makes the hosted replicators match `state`: creates missing ones,
    /// removes those no longer assigned here and hands every replicator its
    /// latest partition metadata.
    pub(crate) async fn reconcile(&self, state: &MetadataState) -> AppResult<()> {
        let _guard = self.reconcile_lock.lock().await;
        let assigned: HashMap<StreamPartition, PartitionMeta> = state
            .partitions_for(&self.local_id)
            .into_iter()
            .map(|meta| (meta.stream_partition(), meta.clone()))
            .collect();

        let stale: Vec<StreamPartition> = self
            .replicators
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|sp| !assigned.contains_key(sp))
            .collect();
        for stream_partition in stale {
            self.remove(&stream_partition).await;
        }

        for (stream_partition, meta) in assigned {
            let replicator = match self.get(&stream_partition) {
                Some(replicator) => replicator,
                None => self.host(state, &stream_partition, &meta).await?,
            };
            if let Err(e) = replicator.on_metadata(meta).await {
                error!("{} role change failed: {}", stream_partition, e);
            }
        }
        Ok(())
    }

    async fn host(
        &self,
        state: &MetadataState,
        stream_partition: &StreamPartition,
        meta: &PartitionMeta,
    ) -> AppResult<Arc<PartitionReplicator>> {
        let stream = state
            .stream(&stream_partition.stream)
            .ok_or_else(|| AppError::StreamNotFound(stream_partition.stream.clone()))?;
        let config = self.log_manager.defaults().apply_custom(&stream.config);
        let log = self.log_manager.get_or_open(stream_partition, &config).await?;
        let Some(complete) = self.shutdown_complete.upgrade() else {
            return Err(AppError::ShuttingDown(format!(
                "not hosting {}",
                stream_partition
            )));
        };
        let replicator = PartitionReplicator::new(
            meta.clone(),
            self.local_id.clone(),
            log,
            self.clustering.clone(),
            self.metadata.clone(),
            self.transport.clone(),
            self.fetch_purgatory.clone(),
            self.produce_purgatory.clone(),
            self.notify_shutdown.clone(),
            &complete,
        );
        self.replicators
            .insert(stream_partition.clone(), replicator.clone());
        info!(
            "hosting {} with replicas {:?}",
            stream_partition, meta.replicas
        );
        Ok(replicator)
    }

    /// Stops the replicator and deletes the partition's log.
    async fn remove(&self, stream_partition: &StreamPartition) {
        if let Some((_, replicator)) = self.replicators.remove(stream_partition) {
            replicator.close().await;
            let _ = self.removed.send(stream_partition.clone());
        }
        match self.log_manager.delete(stream_partition).await {
            Ok(()) => info!("stopped hosting {}", stream_partition),
            Err(e) => warn!("deleting log of {} failed: {}", stream_partition, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::{broadcast, mpsc};

    use super::*;
    use crate::log::LogManager;
    use crate::metadata::raft::{MemoryStorage, RaftConfig, SnapshotStore};
    use crate::metadata::{MetadataCommand, MetadataStore, PartitionAssignment};
    use crate::service::{ClusteringConfig, CustomStreamConfig, StreamsConfig};
    use crate::transport::LocalHub;

    fn create(name: &str, replicas: &[&str]) -> MetadataCommand {
        MetadataCommand::CreateStream {
            name: name.into(),
            replication_factor: replicas.len(),
            config: CustomStreamConfig::default(),
            partitions: vec![PartitionAssignment {
                id: 0,
                replicas: replicas.iter().map(|r| r.to_string()).collect(),
                leader: replicas[0].into(),
            }],
        }
    }

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("condition never held");
    }

    #[tokio::test]
    async fn replicators_follow_stream_lifecycle() -> AppResult<()> {
        let dir = tempfile::tempdir()?;
        let clustering = ClusteringConfig {
            raft_election_timeout_ms: 150,
            raft_heartbeat_interval_ms: 30,
            ..ClusteringConfig::default()
        };
        let hub = LocalHub::new();
        let (notify_shutdown, _) = broadcast::channel(1);
        let (complete_tx, mut complete_rx) = mpsc::channel(1);
        let metadata = MetadataStore::start(
            RaftConfig::new("a", &clustering),
            MemoryStorage::new(),
            SnapshotStore::open(dir.path().join("snapshots"), 2)?,
            &["a".to_string()],
            clustering.raft_commit_timeout(),
            hub.transport("a"),
            &notify_shutdown,
            complete_tx.clone(),
        )?;
        metadata.wait_for_leader(Duration::from_secs(10)).await?;

        // a directory left behind by a stream this broker no longer hosts
        let streams_dir = dir.path().join("streams");
        std::fs::create_dir_all(streams_dir.join("gone-0"))?;
        let logs = Arc::new(LogManager::new(&streams_dir, StreamsConfig::default()));
        let manager = ReplicaManager::new(
            logs.clone(),
            metadata.clone(),
            hub.transport("a"),
            clustering,
            &notify_shutdown,
            &complete_tx,
        );
        manager.start().await?;
        assert!(streams_dir.join("gone-0").exists());

        metadata.propose(create("orders", &["a"])).await?;
        metadata.propose(create("elsewhere", &["b"])).await?;
        let orders = StreamPartition::new("orders", 0);
        eventually(|| manager.get(&orders).is_some_and(|r| r.is_leader())).await;
        assert!(manager.get(&StreamPartition::new("elsewhere", 0)).is_none());

        let removed = manager.remove_orphans().await?;
        assert_eq!(removed, vec![StreamPartition::new("gone", 0)]);
        assert!(streams_dir.join("orders-0").exists());

        let replicator = manager.get(&orders).unwrap();
        replicator
            .append(vec![crate::message::Message::new("payload")])
            .await?;
        assert_eq!(replicator.high_watermark(), 0);
        drop(replicator);

        metadata
            .propose(MetadataCommand::DeleteStream {
                name: "orders".into(),
            })
            .await?;
        metadata.propose(create("orders", &["a"])).await?;
        eventually(|| {
            manager
                .get(&orders)
                .is_some_and(|r| r.is_leader() && r.log().log_end_offset() == 0)
        })
        .await;

        notify_shutdown.send(()).ok();
        drop(manager);
        drop(complete_tx);
        assert!(complete_rx.recv().await.is_none());
        Ok(())
    }
}
