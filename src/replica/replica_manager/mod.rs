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

mod replica_manager_reconcile;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

use super::delayed_fetch::DelayedFetch;
use super::delayed_produce::DelayedProduce;
use super::{FetchRequest, FetchResponse, PartitionReplicator};
use crate::log::LogManager;
use crate::message::StreamPartition;
use crate::metadata::{MetadataStore, NodeId};
use crate::service::ClusteringConfig;
use crate::transport::Transport;
use crate::utils::DelayedOperationPurgatory;
use crate::{AppError, AppResult, Shutdown};

/// Hosts one [`PartitionReplicator`] per partition assigned to this broker.
///
/// The set of replicators follows the metadata store: partitions appear
/// when a stream is created with this broker as a replica and disappear,
/// together with their logs, when the stream is deleted.
#[derive(Debug)]
pub struct ReplicaManager {
    local_id: NodeId,
    log_manager: Arc<LogManager>,
    metadata: Arc<MetadataStore>,
    transport: Arc<dyn Transport>,
    clustering: ClusteringConfig,
    replicators: DashMap<StreamPartition, Arc<PartitionReplicator>>,
    reconcile_lock: tokio::sync::Mutex<()>,
    fetch_purgatory: Arc<DelayedOperationPurgatory<DelayedFetch>>,
    produce_purgatory: Arc<DelayedOperationPurgatory<DelayedProduce>>,
    /// Partitions this broker stopped hosting.
    removed: broadcast::Sender<StreamPartition>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete: mpsc::WeakSender<()>,
}

const REMOVED_QUEUE_SIZE: usize = 256;

impl ReplicaManager {
    pub fn new(
        log_manager: Arc<LogManager>,
        metadata: Arc<MetadataStore>,
        transport: Arc<dyn Transport>,
        clustering: ClusteringConfig,
        notify_shutdown: &broadcast::Sender<()>,
        shutdown_complete_tx: &mpsc::Sender<()>,
    ) -> Arc<Self> {
        let fetch_purgatory = DelayedOperationPurgatory::new(
            "replica_fetch_purgatory",
            notify_shutdown,
            shutdown_complete_tx.clone(),
        );
        let produce_purgatory = DelayedOperationPurgatory::new(
            "replica_produce_purgatory",
            notify_shutdown,
            shutdown_complete_tx.clone(),
        );
        Arc::new(ReplicaManager {
            local_id: metadata.id().clone(),
            log_manager,
            metadata,
            transport,
            clustering,
            replicators: DashMap::new(),
            reconcile_lock: tokio::sync::Mutex::new(()),
            fetch_purgatory,
            produce_purgatory,
            removed: broadcast::channel(REMOVED_QUEUE_SIZE).0,
            notify_shutdown: notify_shutdown.clone(),
            shutdown_complete: shutdown_complete_tx.downgrade(),
        })
    }

    pub fn get(&self, stream_partition: &StreamPartition) -> Option<Arc<PartitionReplicator>> {
        self.replicators
            .get(stream_partition)
            .map(|entry| entry.value().clone())
    }

    /// Announces every partition removed from this broker.
    pub fn subscribe_removed(&self) -> broadcast::Receiver<StreamPartition> {
        self.removed.subscribe()
    }

    pub fn replicators(&self) -> Vec<Arc<PartitionReplicator>> {
        self.replicators
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn log_manager(&self) -> &Arc<LogManager> {
        &self.log_manager
    }

    /// Brings the hosted partitions in line with the current metadata, then
    /// follows metadata changes and watches the ISR in the background.
    ///
    /// Partition directories are not swept here: right after a restart the
    /// local state may still trail the consensus log.
    pub async fn start(self: &Arc<Self>) -> AppResult<()> {
        let Some(complete) = self.shutdown_complete.upgrade() else {
            return Err(AppError::ShuttingDown("replica manager".into()));
        };
        let changes = self.metadata.subscribe();
        self.reconcile(&self.metadata.state()).await?;
        info!(
            "replica manager hosting {} partitions",
            self.replicators.len()
        );

        let manager = Arc::clone(self);
        let shutdown = Shutdown::subscribe(&self.notify_shutdown);
        let watch_complete = complete.clone();
        tokio::spawn(async move {
            let _complete = watch_complete;
            manager.follow_metadata(changes, shutdown).await;
        });

        let manager = Arc::clone(self);
        let shutdown = Shutdown::subscribe(&self.notify_shutdown);
        tokio::spawn(async move {
            let _complete = complete;
            manager.isr_monitor(shutdown).await;
        });
        Ok(())
    }

    async fn isr_monitor(&self, mut shutdown: Shutdown) {
        let period = (self.clustering.replica_max_lag_time() / 2).max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for replicator in self.replicators() {
                        replicator.check_isr();
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
        for replicator in self.replicators() {
            replicator.close().await;
        }
        debug!("isr monitor stopped");
    }

    /// Deletes partition directories that the current metadata does not
    /// assign to this broker.
    pub async fn remove_orphans(&self) -> AppResult<Vec<StreamPartition>> {
        let _guard = self.reconcile_lock.lock().await;
        let keep: HashSet<StreamPartition> = self
            .metadata
            .state()
            .partitions_for(&self.local_id)
            .into_iter()
            .map(|meta| meta.stream_partition())
            .collect();
        self.log_manager.remove_orphans(&keep).await
    }

    /// Serves a follower fetch for a partition led here.
    pub async fn handle_fetch(&self, request: FetchRequest) -> AppResult<FetchResponse> {
        let replicator = self
            .get(&request.stream_partition)
            .ok_or_else(|| AppError::StreamNotFound(request.stream_partition.id()))?;
        replicator.handle_fetch(request).await
    }
}
