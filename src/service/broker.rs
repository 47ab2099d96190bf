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

use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace};

use crate::activity::{ActivityPublisher, ACTIVITY_STREAM};
use crate::batcher::PublishBatcher;
use crate::log::LogManager;
use crate::message::{MemoryRecords, Message, StreamPartition};
use crate::metadata::{
    Envelope, MetadataChange, MetadataCommand, MetadataState, MetadataStore, NodeId, PartitionAssignment,
};
use crate::replica::{
    AckPolicy, FetchRequest, FetchResponse, PartitionReplicator, PublishAck, PublishRequest,
    ReplicaManager,
};
use crate::service::{BrokerConfig, CustomStreamConfig};
use crate::transport::{LocalHub, RequestHandler, Transport, TransportFuture};
use crate::{AppError, AppResult};

const LEADERSHIP_POLL: Duration = Duration::from_millis(10);

/// One member of a driftmq cluster.
///
/// Owns the storage engine, the metadata store, the replicators and the
/// publish path, and answers requests routed to it by the transport.
pub struct Broker {
    config: BrokerConfig,
    metadata: Arc<MetadataStore>,
    log_manager: Arc<LogManager>,
    replicas: Arc<ReplicaManager>,
    batcher: Arc<PublishBatcher>,
    transport: Arc<dyn Transport>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: Mutex<Option<mpsc::Sender<()>>>,
    shutdown_complete_rx: tokio::sync::Mutex<Option<mpsc::Receiver<()>>>,
}

impl Debug for Broker {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("id", &self.config.general.server_id)
            .field("data_dir", &self.config.general.data_dir)
            .finish()
    }
}

impl Broker {
    /// Recovers local state and starts every background task.
    ///
    /// Must be called inside a tokio runtime.
    pub async fn start(
        mut config: BrokerConfig,
        transport: Arc<dyn Transport>,
    ) -> AppResult<Arc<Broker>> {
        config.fill_defaults();
        config.validate()?;
        if transport.local_id() != &config.general.server_id {
            return Err(AppError::InvalidValue(format!(
                "transport belongs to {}, not {}",
                transport.local_id(),
                config.general.server_id
            )));
        }
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);

        let log_manager = Arc::new(LogManager::new(
            config.streams_dir(),
            config.streams.clone(),
        ));
        log_manager.start_tasks(
            config.checkpoint_interval(),
            &notify_shutdown,
            shutdown_complete_tx.clone(),
        );

        let metadata = MetadataStore::open(
            &config,
            transport.clone(),
            &notify_shutdown,
            shutdown_complete_tx.clone(),
        )?;

        let replicas = ReplicaManager::new(
            log_manager.clone(),
            metadata.clone(),
            transport.clone(),
            config.clustering.clone(),
            &notify_shutdown,
            &shutdown_complete_tx,
        );
        replicas.start().await?;

        let batcher = PublishBatcher::new(
            config.batch.clone(),
            replicas.clone(),
            &notify_shutdown,
            &shutdown_complete_tx,
        );

        let activity = ActivityPublisher::new(
            config.activity_stream.clone(),
            metadata.clone(),
            batcher.clone(),
            transport.clone(),
        );
        activity.start(&notify_shutdown, shutdown_complete_tx.clone());

        info!(
            "broker {} started in namespace {}, data in {}",
            config.general.server_id, config.general.namespace, config.general.data_dir
        );
        Ok(Arc::new(Broker {
            config,
            metadata,
            log_manager,
            replicas,
            batcher,
            transport,
            notify_shutdown,
            shutdown_complete_tx: Mutex::new(Some(shutdown_complete_tx)),
            shutdown_complete_rx: tokio::sync::Mutex::new(Some(shutdown_complete_rx)),
        }))
    }

    /// Starts a broker attached to an in-process hub.
    pub async fn start_local(
        mut config: BrokerConfig,
        hub: &Arc<LocalHub>,
    ) -> AppResult<Arc<Broker>> {
        config.fill_defaults();
        let id = config.general.server_id.clone();
        let broker = Broker::start(config, hub.transport(id.clone())).await?;
        hub.register(id, &broker);
        Ok(broker)
    }

    pub fn id(&self) -> &NodeId {
        &self.config.general.server_id
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// The last committed cluster metadata.
    pub fn metadata(&self) -> Arc<MetadataState> {
        self.metadata.state()
    }

    pub fn metadata_store(&self) -> &Arc<MetadataStore> {
        &self.metadata
    }

    pub fn replicator(
        &self,
        stream_partition: &StreamPartition,
    ) -> Option<Arc<PartitionReplicator>> {
        self.replicas.get(stream_partition)
    }

    /// Creates a stream, spreading partition replicas and leadership over
    /// the cluster members. Returns once every partition this broker leads
    /// is ready for publishes.
    pub async fn create_stream(
        &self,
        name: &str,
        partitions: i32,
        replication_factor: usize,
        config: CustomStreamConfig,
    ) -> AppResult<()> {
        validate_stream_name(name)?;
        if partitions < 1 {
            return Err(AppError::InvalidValue(format!(
                "stream {} needs at least one partition",
                name
            )));
        }
        config.validate()?;
        let mut members = self.metadata.members();
        members.sort();
        if replication_factor == 0 || replication_factor > members.len() {
            return Err(AppError::InvalidValue(format!(
                "replication factor {} with {} brokers",
                replication_factor,
                members.len()
            )));
        }

        let assignments: Vec<PartitionAssignment> = (0..partitions)
            .map(|id| {
                let replicas: Vec<NodeId> = members
                    .iter()
                    .cycle()
                    .skip(id as usize % members.len())
                    .take(replication_factor)
                    .cloned()
                    .collect();
                PartitionAssignment {
                    id,
                    leader: replicas[0].clone(),
                    replicas,
                }
            })
            .collect();
        let led_here: Vec<StreamPartition> = assignments
            .iter()
            .filter(|a| &a.leader == self.id())
            .map(|a| StreamPartition::new(name, a.id))
            .collect();

        let change = self
            .metadata
            .submit(MetadataCommand::CreateStream {
                name: name.to_string(),
                replication_factor,
                config,
                partitions: assignments,
            })
            .await?;
        debug!("stream {} committed at index {}", name, change.index);

        let timeout = self.config.clustering.raft_commit_timeout();
        for stream_partition in led_here {
            self.wait_for_leadership(&stream_partition, timeout).await?;
        }
        info!("created stream {} with {} partitions", name, partitions);
        Ok(())
    }

    async fn wait_for_leadership(
        &self,
        stream_partition: &StreamPartition,
        timeout: Duration,
    ) -> AppResult<()> {
        let ready = async {
            loop {
                if self
                    .replicas
                    .get(stream_partition)
                    .is_some_and(|replicator| replicator.is_leader())
                {
                    return;
                }
                tokio::time::sleep(LEADERSHIP_POLL).await;
            }
        };
        tokio::time::timeout(timeout, ready).await.map_err(|_| {
            AppError::Timeout(format!(
                "{} not led locally within {:?}",
                stream_partition, timeout
            ))
        })
    }

    pub async fn delete_stream(&self, name: &str) -> AppResult<()> {
        let change = self
            .metadata
            .submit(MetadataCommand::DeleteStream {
                name: name.to_string(),
            })
            .await?;
        info!("deleted stream {} at index {}", name, change.index);
        Ok(())
    }

    /// Publishes through the local batcher when this broker leads the
    /// partition, otherwise forwards to the leader.
    pub async fn publish(
        &self,
        stream_partition: &StreamPartition,
        messages: Vec<Message>,
        ack_policy: AckPolicy,
        timeout: Duration,
    ) -> AppResult<PublishAck> {
        if self.leads(stream_partition) {
            return self
                .batcher
                .publish(stream_partition, messages, ack_policy, timeout)
                .await;
        }
        let leader = self
            .metadata
            .current_leader(stream_partition)
            .ok_or_else(|| AppError::StreamNotFound(stream_partition.id()))?;
        if &leader == self.id() {
            // metadata already names us but the replicator has not caught up
            return Err(AppError::NotLeader(format!(
                "{} is still becoming leader",
                stream_partition
            )));
        }
        trace!("forwarding publish for {} to {}", stream_partition, leader);
        let request = PublishRequest {
            stream_partition: stream_partition.clone(),
            messages,
            ack_policy,
            timeout,
        };
        self.transport.publish(&leader, request).await
    }

    /// Reads committed records of a locally hosted replica.
    pub fn fetch(
        &self,
        stream_partition: &StreamPartition,
        offset: i64,
        max_bytes: usize,
    ) -> AppResult<MemoryRecords> {
        let log = self
            .log_manager
            .get(stream_partition)
            .ok_or_else(|| AppError::StreamNotFound(stream_partition.id()))?;
        log.read_committed(offset, max_bytes)
    }

    pub fn high_watermark(&self, stream_partition: &StreamPartition) -> AppResult<i64> {
        self.replicas
            .get(stream_partition)
            .map(|replicator| replicator.high_watermark())
            .ok_or_else(|| AppError::StreamNotFound(stream_partition.id()))
    }

    fn leads(&self, stream_partition: &StreamPartition) -> bool {
        self.replicas
            .get(stream_partition)
            .is_some_and(|replicator| replicator.is_leader())
    }

    /// Stops accepting publishes, signals every task and waits until they
    /// have all drained. Later calls return immediately.
    pub async fn shutdown(&self) {
        let mut complete_rx = self.shutdown_complete_rx.lock().await;
        let Some(mut rx) = complete_rx.take() else {
            return;
        };
        info!("broker {} shutting down", self.id());
        self.batcher.close();
        let _ = self.notify_shutdown.send(());
        drop(self.shutdown_complete_tx.lock().take());
        let _ = rx.recv().await;
        info!("broker {} shutdown complete", self.id());
    }
}

fn validate_stream_name(name: &str) -> AppResult<()> {
    if name.is_empty() {
        return Err(AppError::InvalidValue("empty stream name".into()));
    }
    if name == ACTIVITY_STREAM {
        return Err(AppError::InvalidValue(format!("{} is reserved", name)));
    }
    if name.contains(['/', '\\']) || name.starts_with('.') {
        return Err(AppError::InvalidValue(format!("illegal stream name {}", name)));
    }
    Ok(())
}

impl RequestHandler for Broker {
    fn handle_raft(&self, envelope: Envelope) {
        self.metadata.deliver(envelope);
    }

    fn handle_fetch(&self, request: FetchRequest) -> TransportFuture<'_, FetchResponse> {
        Box::pin(self.replicas.handle_fetch(request))
    }

    fn handle_propose(&self, command: MetadataCommand) -> TransportFuture<'_, MetadataChange> {
        // proposals are redirected at most once
        Box::pin(self.metadata.propose(command))
    }

    fn handle_publish(&self, request: PublishRequest) -> TransportFuture<'_, PublishAck> {
        Box::pin(async move {
            let stream_partition = request.stream_partition;
            if !self.leads(&stream_partition) {
                let leader = self
                    .metadata
                    .current_leader(&stream_partition)
                    .unwrap_or_default();
                return Err(AppError::NotLeader(format!(
                    "{} is led by {:?}",
                    stream_partition, leader
                )));
            }
            self.batcher
                .publish(
                    &stream_partition,
                    request.messages,
                    request.ack_policy,
                    request.timeout,
                )
                .await
        })
    }
}
