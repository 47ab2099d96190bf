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

mod replicator_follower;
mod replicator_isr;
mod replicator_read;
mod replicator_write;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::delayed_fetch::DelayedFetch;
use super::delayed_produce::DelayedProduce;
use super::watch_key;
use crate::log::PartitionLog;
use crate::message::StreamPartition;
use crate::metadata::{MetadataStore, NodeId, PartitionMeta};
use crate::service::ClusteringConfig;
use crate::transport::Transport;
use crate::utils::DelayedOperationPurgatory;
use crate::AppResult;

/// What the leader tracks about one follower.
#[derive(Debug, Clone)]
pub(crate) struct FollowerProgress {
    /// LEO reported by the last fetch, `-1` before the first one.
    pub fetch_offset: i64,
    pub last_fetch: Instant,
    /// Leader LEO when the last fetch arrived.
    pub leo_at_last_fetch: i64,
    /// Last time the follower was known to hold everything the leader had.
    pub last_caught_up: Instant,
}

impl FollowerProgress {
    fn new(now: Instant) -> Self {
        FollowerProgress {
            fetch_offset: -1,
            last_fetch: now,
            leo_at_last_fetch: i64::MAX,
            last_caught_up: now,
        }
    }
}

#[derive(Debug)]
pub(crate) struct LeaderState {
    pub epoch: u64,
    pub isr: Vec<NodeId>,
    pub followers: HashMap<NodeId, FollowerProgress>,
    /// ISR changes proposed but not yet reflected in metadata.
    pub pending_isr: HashSet<NodeId>,
}

#[derive(Debug)]
pub(crate) struct FollowerState {
    pub epoch: u64,
    pub leader: NodeId,
    pub last_leader_contact: Instant,
}

/// Role of the local replica for one partition.
///
/// Until the first metadata arrives a replicator is a follower of nobody at
/// epoch 0, so whichever role the metadata assigns is a transition.
#[derive(Debug)]
pub(crate) enum ReplicaRole {
    Leader(LeaderState),
    Follower(FollowerState),
    /// The leader stopped answering; still fetching while a successor is
    /// chosen through metadata.
    Electing {
        epoch: u64,
        leader: NodeId,
        since: Instant,
    },
}

impl ReplicaRole {
    pub fn epoch(&self) -> u64 {
        match self {
            ReplicaRole::Leader(state) => state.epoch,
            ReplicaRole::Follower(state) => state.epoch,
            ReplicaRole::Electing { epoch, .. } => *epoch,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ReplicaRole::Leader(_) => "leader",
            ReplicaRole::Follower(_) => "follower",
            ReplicaRole::Electing { .. } => "electing",
        }
    }
}

/// Replication state machine of one partition hosted on this broker.
#[derive(Debug)]
pub struct PartitionReplicator {
    stream_partition: StreamPartition,
    local_id: NodeId,
    log: Arc<PartitionLog>,
    role: RwLock<ReplicaRole>,
    meta: RwLock<PartitionMeta>,
    config: ClusteringConfig,
    /// Serializes appends against role transitions.
    write_lock: tokio::sync::Mutex<()>,
    metadata: Arc<MetadataStore>,
    transport: Arc<dyn Transport>,
    fetch_purgatory: Arc<DelayedOperationPurgatory<DelayedFetch>>,
    produce_purgatory: Arc<DelayedOperationPurgatory<DelayedProduce>>,
    fetcher: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    notify_shutdown: broadcast::Sender<()>,
    /// Weak so that holding a replicator never delays shutdown; tasks
    /// upgrade it when spawned.
    shutdown_complete: mpsc::WeakSender<()>,
}

impl PartitionReplicator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        meta: PartitionMeta,
        local_id: NodeId,
        log: Arc<PartitionLog>,
        config: ClusteringConfig,
        metadata: Arc<MetadataStore>,
        transport: Arc<dyn Transport>,
        fetch_purgatory: Arc<DelayedOperationPurgatory<DelayedFetch>>,
        produce_purgatory: Arc<DelayedOperationPurgatory<DelayedProduce>>,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: &mpsc::Sender<()>,
    ) -> Arc<Self> {
        Arc::new(PartitionReplicator {
            stream_partition: meta.stream_partition(),
            local_id,
            log,
            role: RwLock::new(ReplicaRole::Follower(FollowerState {
                epoch: 0,
                leader: NodeId::new(),
                last_leader_contact: Instant::now(),
            })),
            meta: RwLock::new(meta),
            config,
            write_lock: tokio::sync::Mutex::new(()),
            metadata,
            transport,
            fetch_purgatory,
            produce_purgatory,
            fetcher: Mutex::new(None),
            closed: AtomicBool::new(false),
            notify_shutdown,
            shutdown_complete: shutdown_complete_tx.downgrade(),
        })
    }

    pub fn stream_partition(&self) -> &StreamPartition {
        &self.stream_partition
    }

    pub fn log(&self) -> &Arc<PartitionLog> {
        &self.log
    }

    pub fn meta(&self) -> PartitionMeta {
        self.meta.read().clone()
    }

    pub fn role_name(&self) -> &'static str {
        self.role.read().name()
    }

    pub fn leader_epoch(&self) -> u64 {
        self.role.read().epoch()
    }

    pub fn is_leader(&self) -> bool {
        matches!(*self.role.read(), ReplicaRole::Leader(_))
    }

    /// Epoch of the local leadership, `None` when not leading.
    pub(crate) fn leading_epoch(&self) -> Option<u64> {
        if self.is_closed() {
            return None;
        }
        match &*self.role.read() {
            ReplicaRole::Leader(state) => Some(state.epoch),
            _ => None,
        }
    }

    /// Leader named by the latest metadata.
    pub fn leader(&self) -> NodeId {
        self.meta.read().leader.clone()
    }

    pub fn isr(&self) -> Vec<NodeId> {
        self.meta.read().isr.clone()
    }

    pub fn high_watermark(&self) -> i64 {
        self.log.high_watermark()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Applies the latest metadata for this partition.
    pub async fn on_metadata(self: &Arc<Self>, meta: PartitionMeta) -> AppResult<()> {
        if self.is_closed() {
            return Ok(());
        }
        let (current_epoch, transition) = {
            let role = self.role.read();
            let current_epoch = role.epoch();
            let transition = match &*role {
                _ if meta.leader_epoch < current_epoch => Transition::Ignore,
                ReplicaRole::Leader(state) if meta.leader == self.local_id => {
                    if state.epoch == meta.leader_epoch {
                        Transition::Refresh
                    } else {
                        Transition::Lead
                    }
                }
                _ if meta.leader == self.local_id => Transition::Lead,
                ReplicaRole::Follower(state)
                    if state.epoch == meta.leader_epoch && state.leader == meta.leader =>
                {
                    Transition::Refresh
                }
                ReplicaRole::Electing { epoch, leader, .. }
                    if *epoch == meta.leader_epoch && *leader == meta.leader =>
                {
                    Transition::Refresh
                }
                _ => Transition::Follow,
            };
            (current_epoch, transition)
        };

        match transition {
            Transition::Ignore => {
                debug!(
                    "{} ignoring metadata at epoch {}, current epoch {}",
                    self.stream_partition, meta.leader_epoch, current_epoch
                );
                Ok(())
            }
            Transition::Refresh => {
                self.refresh(meta);
                self.wake_waiters().await;
                Ok(())
            }
            Transition::Lead => self.become_leader(meta).await,
            Transition::Follow => self.become_follower(meta).await,
        }
    }

    /// Same epoch, same leader: only the ISR can have moved.
    fn refresh(&self, meta: PartitionMeta) {
        if let ReplicaRole::Leader(state) = &mut *self.role.write() {
            state.isr = meta.isr.clone();
            if state.isr.len() < self.config.min_isr {
                warn!(
                    "{} isr {:?} is below min isr {}, appends will fail",
                    self.stream_partition, state.isr, self.config.min_isr
                );
            }
        }
        *self.meta.write() = meta;
        self.maybe_advance_high_watermark();
    }

    async fn become_leader(self: &Arc<Self>, meta: PartitionMeta) -> AppResult<()> {
        let _guard = self.write_lock.lock().await;
        self.stop_fetcher();
        let now = Instant::now();
        let followers = meta
            .replicas
            .iter()
            .filter(|replica| **replica != self.local_id)
            .map(|replica| (replica.clone(), FollowerProgress::new(now)))
            .collect();
        self.log.set_leader_epoch(meta.leader_epoch);
        *self.role.write() = ReplicaRole::Leader(LeaderState {
            epoch: meta.leader_epoch,
            isr: meta.isr.clone(),
            followers,
            pending_isr: HashSet::new(),
        });
        info!(
            "{} became leader at epoch {}, isr {:?}, leo {}, hw {}",
            self.stream_partition,
            meta.leader_epoch,
            meta.isr,
            self.log.log_end_offset(),
            self.log.high_watermark()
        );
        *self.meta.write() = meta;
        drop(_guard);

        self.maybe_advance_high_watermark();
        self.wake_waiters().await;
        Ok(())
    }

    async fn become_follower(self: &Arc<Self>, meta: PartitionMeta) -> AppResult<()> {
        let _guard = self.write_lock.lock().await;
        self.stop_fetcher();
        // anything past the committed prefix may diverge from the new leader
        let hw = self.log.high_watermark();
        self.log.truncate_to(hw + 1)?;
        self.log.set_leader_epoch(meta.leader_epoch);
        *self.role.write() = ReplicaRole::Follower(FollowerState {
            epoch: meta.leader_epoch,
            leader: meta.leader.clone(),
            last_leader_contact: Instant::now(),
        });
        info!(
            "{} following {} at epoch {}, truncated to {}",
            self.stream_partition,
            meta.leader,
            meta.leader_epoch,
            hw + 1
        );
        let epoch = meta.leader_epoch;
        *self.meta.write() = meta;
        drop(_guard);

        // parked acknowledgments of the old epoch fail, parked fetches answer
        self.wake_waiters().await;
        self.start_fetcher(epoch);
        Ok(())
    }

    /// Stops all background work. Parked waiters complete with an error.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_fetcher();
        self.wake_waiters().await;
        debug!("{} replicator closed", self.stream_partition);
    }

    fn stop_fetcher(&self) {
        if let Some(handle) = self.fetcher.lock().take() {
            handle.abort();
        }
    }

    /// Re-evaluates every parked fetch and acknowledgment of this partition.
    pub(crate) async fn wake_waiters(&self) {
        let key = watch_key(&self.stream_partition);
        self.produce_purgatory.check_and_complete(&key).await;
        self.fetch_purgatory.check_and_complete(&key).await;
    }

    /// Recomputes the HW as `min(LEO over the ISR) - 1`.
    ///
    /// Only a leader moves its HW this way. Returns true when it moved.
    pub(crate) fn maybe_advance_high_watermark(&self) -> bool {
        let candidate = {
            let role = self.role.read();
            let ReplicaRole::Leader(state) = &*role else {
                return false;
            };
            let mut min_leo = self.log.log_end_offset();
            for member in state.isr.iter().filter(|m| **m != self.local_id) {
                let leo = state
                    .followers
                    .get(member)
                    .map_or(-1, |progress| progress.fetch_offset);
                min_leo = min_leo.min(leo);
            }
            min_leo - 1
        };
        let advanced = self.log.advance_high_watermark(candidate);
        if advanced {
            debug!(
                "{} high watermark advanced to {}",
                self.stream_partition,
                self.log.high_watermark()
            );
        }
        advanced
    }
}

enum Transition {
    Ignore,
    Refresh,
    Lead,
    Follow,
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use bytes::Bytes;
    use dashmap::DashMap;
    use tempfile::TempDir;

    use super::*;
    use crate::log::LogManager;
    use crate::message::Message;
    use crate::metadata::raft::{MemoryStorage, RaftConfig, SnapshotStore};
    use crate::metadata::{Envelope, MetadataCommand, PartitionAssignment};
    use crate::replica::{AckPolicy, FetchRequest, FetchResponse, PublishAck, PublishRequest};
    use crate::service::{CustomStreamConfig, StreamsConfig};
    use crate::transport::{LocalHub, RequestHandler, TransportFuture};
    use crate::AppError;

    /// Routes fetches arriving at one node to its replicators.
    #[derive(Default)]
    struct Node {
        replicators: DashMap<StreamPartition, Arc<PartitionReplicator>>,
    }

    impl RequestHandler for Node {
        fn handle_raft(&self, _envelope: Envelope) {}

        fn handle_fetch(&self, request: FetchRequest) -> TransportFuture<'_, FetchResponse> {
            Box::pin(async move {
                let replicator = self
                    .replicators
                    .get(&request.stream_partition)
                    .map(|entry| entry.value().clone())
                    .ok_or_else(|| AppError::StreamNotFound(request.stream_partition.id()))?;
                replicator.handle_fetch(request).await
            })
        }

        fn handle_publish(&self, _request: PublishRequest) -> TransportFuture<'_, PublishAck> {
            Box::pin(async { Err(AppError::InvalidOperation("fetch only".into())) })
        }
    }

    pub(crate) struct Harness {
        dir: TempDir,
        pub config: ClusteringConfig,
        pub hub: Arc<LocalHub>,
        pub metadata: Arc<MetadataStore>,
        nodes: Mutex<HashMap<NodeId, (Arc<Node>, Arc<LogManager>)>>,
        fetch_purgatory: Arc<DelayedOperationPurgatory<DelayedFetch>>,
        produce_purgatory: Arc<DelayedOperationPurgatory<DelayedProduce>>,
        notify_shutdown: broadcast::Sender<()>,
        complete_tx: mpsc::Sender<()>,
        complete_rx: mpsc::Receiver<()>,
    }

    pub(crate) fn test_clustering() -> ClusteringConfig {
        ClusteringConfig {
            raft_election_timeout_ms: 150,
            raft_heartbeat_interval_ms: 30,
            raft_commit_timeout_ms: 2_000,
            replica_max_lag_time_ms: 1_000,
            replica_max_leader_timeout_ms: 1_000,
            replica_max_idle_wait_ms: 200,
            replica_fetch_timeout_ms: 200,
            ..ClusteringConfig::default()
        }
    }

    pub(crate) fn meta(replicas: &[&str], leader: &str, epoch: u64) -> PartitionMeta {
        PartitionMeta {
            stream: "orders".into(),
            id: 0,
            replicas: replicas.iter().map(|r| r.to_string()).collect(),
            isr: replicas.iter().map(|r| r.to_string()).collect(),
            leader: leader.into(),
            leader_epoch: epoch,
        }
    }

    /// A harness whose metadata store runs alone on node `a`.
    pub(crate) async fn single_node() -> AppResult<Harness> {
        let dir = tempfile::tempdir()?;
        let config = test_clustering();
        let hub = LocalHub::new();
        let (notify_shutdown, _) = broadcast::channel(1);
        let (complete_tx, complete_rx) = mpsc::channel(1);
        let ids = vec!["a".to_string()];
        let metadata = MetadataStore::start(
            RaftConfig::new("a", &config),
            MemoryStorage::new(),
            SnapshotStore::open(dir.path().join("snapshots"), 2)?,
            &ids,
            config.raft_commit_timeout(),
            hub.transport("a"),
            &notify_shutdown,
            complete_tx.clone(),
        )?;
        metadata.wait_for_leader(Duration::from_secs(10)).await?;
        let fetch_purgatory =
            DelayedOperationPurgatory::new("fetch", &notify_shutdown, complete_tx.clone());
        let produce_purgatory =
            DelayedOperationPurgatory::new("produce", &notify_shutdown, complete_tx.clone());
        Ok(Harness {
            dir,
            config,
            hub,
            metadata,
            nodes: Mutex::new(HashMap::new()),
            fetch_purgatory,
            produce_purgatory,
            notify_shutdown,
            complete_tx,
            complete_rx,
        })
    }

    impl Harness {
        fn node(&self, id: &str) -> (Arc<Node>, Arc<LogManager>) {
            let mut nodes = self.nodes.lock();
            let (node, logs) = nodes.entry(id.to_string()).or_insert_with(|| {
                let node = Arc::new(Node::default());
                self.hub.register(id, &node);
                let logs = Arc::new(LogManager::new(
                    self.dir.path().join(id),
                    StreamsConfig::default(),
                ));
                (node, logs)
            });
            (node.clone(), logs.clone())
        }

        pub(crate) async fn replicator(
            &self,
            meta: PartitionMeta,
        ) -> AppResult<Arc<PartitionReplicator>> {
            self.replicator_on("a", meta, 1).await
        }

        pub(crate) async fn replicator_with_min_isr(
            &self,
            meta: PartitionMeta,
            min_isr: usize,
        ) -> AppResult<Arc<PartitionReplicator>> {
            self.replicator_on("a", meta, min_isr).await
        }

        pub(crate) async fn replicator_on(
            &self,
            id: &str,
            meta: PartitionMeta,
            min_isr: usize,
        ) -> AppResult<Arc<PartitionReplicator>> {
            let (node, logs) = self.node(id);
            let sp = meta.stream_partition();
            let log = logs.get_or_open(&sp, logs.defaults()).await?;
            let config = ClusteringConfig {
                min_isr,
                ..self.config.clone()
            };
            let replicator = PartitionReplicator::new(
                meta.clone(),
                id.to_string(),
                log,
                config,
                self.metadata.clone(),
                self.hub.transport(id),
                self.fetch_purgatory.clone(),
                self.produce_purgatory.clone(),
                self.notify_shutdown.clone(),
                &self.complete_tx,
            );
            node.replicators.insert(sp, replicator.clone());
            replicator.on_metadata(meta).await?;
            Ok(replicator)
        }

        /// Creates `orders` in metadata and hosts its partition on `a`.
        pub(crate) async fn hosted(
            &self,
            replicas: &[&str],
            leader: &str,
        ) -> AppResult<Arc<PartitionReplicator>> {
            let meta = self.create_orders(replicas, leader).await?;
            self.replicator(meta).await
        }

        pub(crate) async fn create_orders(
            &self,
            replicas: &[&str],
            leader: &str,
        ) -> AppResult<PartitionMeta> {
            self.metadata
                .propose(MetadataCommand::CreateStream {
                    name: "orders".into(),
                    replication_factor: replicas.len(),
                    config: CustomStreamConfig::default(),
                    partitions: vec![PartitionAssignment {
                        id: 0,
                        replicas: replicas.iter().map(|r| r.to_string()).collect(),
                        leader: leader.into(),
                    }],
                })
                .await?;
            self.metadata
                .partition(&StreamPartition::new("orders", 0))
                .ok_or_else(|| AppError::StreamNotFound("orders".into()))
        }

        pub(crate) async fn shutdown(mut self) {
            self.notify_shutdown.send(()).ok();
            drop(self.complete_tx);
            assert!(self.complete_rx.recv().await.is_none());
        }
    }

    fn messages(n: usize) -> Vec<Message> {
        (0..n)
            .map(|i| Message::new(Bytes::from(format!("r{}", i))).with_key(format!("k{}", i)))
            .collect()
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("condition never held");
    }

    #[tokio::test]
    async fn follower_replicates_and_learns_the_high_watermark() -> AppResult<()> {
        let harness = single_node().await?;
        let leader = harness.replicator_on("a", meta(&["a", "b"], "a", 1), 1).await?;
        let follower = harness.replicator_on("b", meta(&["a", "b"], "a", 1), 1).await?;
        assert_eq!(follower.role_name(), "follower");

        let ack = leader
            .publish(messages(3), AckPolicy::All, Duration::from_secs(5))
            .await?;
        assert_eq!((ack.first_offset, ack.last_offset), (0, 2));
        assert_eq!(leader.high_watermark(), 2);

        eventually(|| follower.high_watermark() == 2).await;
        let copied = follower.log().read(0, 1 << 20, i64::MAX)?.records()?;
        assert_eq!(copied.len(), 3);
        assert!(copied.iter().all(|record| record.leader_epoch == 1));
        assert_eq!(copied[2].key.as_deref(), Some(&b"k2"[..]));
        harness.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn step_down_keeps_only_the_committed_prefix() -> AppResult<()> {
        let harness = single_node().await?;
        let mut solo = meta(&["a", "b"], "a", 1);
        solo.isr = vec!["a".into()];
        let replicator = harness.replicator(solo).await?;
        replicator.append(messages(2)).await?;
        assert_eq!(replicator.high_watermark(), 1);

        // b rejoins before catching up, so the next write stays uncommitted
        replicator.on_metadata(meta(&["a", "b"], "a", 1)).await?;
        replicator.append(messages(1)).await?;
        assert_eq!(replicator.log().log_end_offset(), 3);
        assert_eq!(replicator.high_watermark(), 1);

        replicator.on_metadata(meta(&["a", "b"], "b", 2)).await?;
        assert_eq!(replicator.role_name(), "follower");
        assert_eq!(replicator.leader_epoch(), 2);
        assert_eq!(replicator.log().log_end_offset(), 2);

        // older metadata is ignored
        replicator.on_metadata(meta(&["a", "b"], "a", 1)).await?;
        assert_eq!(replicator.leader_epoch(), 2);
        assert!(!replicator.is_leader());
        harness.shutdown().await;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn silent_leader_triggers_election() -> AppResult<()> {
        let harness = single_node().await?;
        // c never registers with the hub, so every fetch fails
        let meta = harness.create_orders(&["c", "a"], "c").await?;
        let replicator = harness.replicator(meta).await?;
        assert_eq!(replicator.role_name(), "follower");

        tokio::time::sleep(harness.config.replica_max_leader_timeout() * 3).await;
        let sp = StreamPartition::new("orders", 0);
        let elected = harness.metadata.partition(&sp).unwrap();
        assert_eq!(elected.leader, "a");
        assert_eq!(elected.leader_epoch, 1);
        assert_eq!(elected.isr, vec!["a"]);

        replicator.on_metadata(elected).await?;
        assert!(replicator.is_leader());
        let info = replicator.append(messages(1)).await?;
        assert_eq!(info.leader_epoch, 1);
        assert_eq!(replicator.high_watermark(), 0);
        harness.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn closed_replicator_refuses_work() -> AppResult<()> {
        let harness = single_node().await?;
        let replicator = harness.replicator(meta(&["a"], "a", 1)).await?;
        replicator.close().await;
        assert!(matches!(
            replicator.append(messages(1)).await,
            Err(AppError::NotLeader(_))
        ));
        harness.shutdown().await;
        Ok(())
    }
}
