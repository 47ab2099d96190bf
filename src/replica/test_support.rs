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

//! A single-broker cluster for tests above the replicator.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc};

use super::{PartitionReplicator, ReplicaManager};
use crate::log::LogManager;
use crate::message::StreamPartition;
use crate::metadata::raft::{MemoryStorage, RaftConfig, SnapshotStore};
use crate::metadata::{MetadataCommand, MetadataStore, PartitionAssignment};
use crate::service::{ClusteringConfig, CustomStreamConfig, StreamsConfig};
use crate::transport::LocalHub;
use crate::AppResult;

pub(crate) struct LocalNode {
    _dir: TempDir,
    pub hub: Arc<LocalHub>,
    pub metadata: Arc<MetadataStore>,
    pub replicas: Arc<ReplicaManager>,
    pub notify_shutdown: broadcast::Sender<()>,
    pub complete_tx: mpsc::Sender<()>,
    complete_rx: mpsc::Receiver<()>,
}

impl LocalNode {
    pub(crate) async fn start() -> AppResult<LocalNode> {
        let dir = tempfile::tempdir()?;
        let clustering = ClusteringConfig {
            raft_election_timeout_ms: 150,
            raft_heartbeat_interval_ms: 30,
            replica_max_idle_wait_ms: 200,
            ..ClusteringConfig::default()
        };
        let hub = LocalHub::new();
        let (notify_shutdown, _) = broadcast::channel(1);
        let (complete_tx, complete_rx) = mpsc::channel(1);
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
        let logs = Arc::new(LogManager::new(
            dir.path().join("streams"),
            StreamsConfig::default(),
        ));
        let replicas = ReplicaManager::new(
            logs,
            metadata.clone(),
            hub.transport("a"),
            clustering,
            &notify_shutdown,
            &complete_tx,
        );
        replicas.start().await?;
        Ok(LocalNode {
            _dir: dir,
            hub,
            metadata,
            replicas,
            notify_shutdown,
            complete_tx,
            complete_rx,
        })
    }

    /// Creates a one-partition stream led by this node and waits until the
    /// replicator leads it.
    pub(crate) async fn create_stream(&self, name: &str) -> AppResult<Arc<PartitionReplicator>> {
        self.metadata
            .propose(MetadataCommand::CreateStream {
                name: name.into(),
                replication_factor: 1,
                config: CustomStreamConfig::default(),
                partitions: vec![PartitionAssignment {
                    id: 0,
                    replicas: vec!["a".into()],
                    leader: "a".into(),
                }],
            })
            .await?;
        let sp = StreamPartition::new(name, 0);
        for _ in 0..400 {
            if let Some(replicator) = self.replicas.get(&sp).filter(|r| r.is_leader()) {
                return Ok(replicator);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} never got a leader", sp);
    }

    pub(crate) async fn shutdown(mut self) {
        self.notify_shutdown.send(()).ok();
        drop(self.replicas);
        drop(self.complete_tx);
        assert!(self.complete_rx.recv().await.is_none());
    }
}
