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

//! Drives a [`RaftNode`] on a tokio task and exposes the committed metadata.
//!
//! The driver is the only owner of the node. Proposals and inbound consensus
//! messages reach it through a channel; committed entries are applied in log
//! order, the new state is published on a `watch` channel and then the event
//! is broadcast. A snapshot is written every `raft_snapshot_threshold`
//! applied entries.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{self, Instant};
use tracing::{debug, error, info, trace};

use super::raft::{
    EntryPayload, Envelope, RaftConfig, RaftNode, RaftStorage, RocksStorage, SnapshotStore,
};
use super::{MetadataChange, MetadataCommand, MetadataEvent, MetadataState, NodeId, PartitionMeta};
use crate::message::StreamPartition;
use crate::service::BrokerConfig;
use crate::transport::Transport;
use crate::{AppError, AppResult, Shutdown};

const REQUEST_QUEUE_SIZE: usize = 4096;
const EVENT_QUEUE_SIZE: usize = 1024;

/// What the local node knows about consensus leadership.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RaftStatus {
    pub leader: Option<NodeId>,
    pub term: u64,
    pub is_leader: bool,
    /// Voting members of the consensus group.
    pub members: Vec<NodeId>,
}

#[derive(Debug)]
enum DriverRequest {
    Propose {
        command: MetadataCommand,
        reply: oneshot::Sender<AppResult<MetadataChange>>,
    },
    Raft(Envelope),
}

#[derive(Debug)]
struct PendingProposal {
    term: u64,
    reply: oneshot::Sender<AppResult<MetadataChange>>,
}

#[derive(Debug)]
pub struct MetadataStore {
    id: NodeId,
    state: watch::Receiver<Arc<MetadataState>>,
    status: watch::Receiver<RaftStatus>,
    events: broadcast::Sender<MetadataChange>,
    requests: mpsc::Sender<DriverRequest>,
    transport: Arc<dyn Transport>,
    commit_timeout: Duration,
}

impl MetadataStore {
    /// Opens the durable store under `<data_dir>/raft` and starts the driver.
    pub fn open(
        config: &BrokerConfig,
        transport: Arc<dyn Transport>,
        notify_shutdown: &broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> AppResult<Arc<MetadataStore>> {
        let raft_dir = config.raft_dir();
        let storage = RocksStorage::open(raft_dir.join("log"))?;
        let snapshots = SnapshotStore::open(raft_dir.join("snapshots"), config.clustering.raft_snapshots)?;
        Self::start(
            RaftConfig::new(config.general.server_id.clone(), &config.clustering),
            storage,
            snapshots,
            &config.clustering.raft_bootstrap_peers,
            config.clustering.raft_commit_timeout(),
            transport,
            notify_shutdown,
            shutdown_complete_tx,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn start<S: RaftStorage>(
        config: RaftConfig,
        storage: S,
        snapshots: SnapshotStore,
        bootstrap_peers: &[NodeId],
        commit_timeout: Duration,
        transport: Arc<dyn Transport>,
        notify_shutdown: &broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> AppResult<Arc<MetadataStore>> {
        let id = config.id.clone();
        let snapshot = snapshots.latest()?;
        let state = Arc::new(
            snapshot
                .as_ref()
                .map(|s| s.state.clone())
                .unwrap_or_default(),
        );
        if let Some(snapshot) = &snapshot {
            info!(
                "restored metadata snapshot at index {} term {}",
                snapshot.index, snapshot.term
            );
        }
        let node = RaftNode::new(config, storage, snapshot, bootstrap_peers, Instant::now())?;

        let (state_tx, state_rx) = watch::channel(state.clone());
        let (status_tx, status_rx) = watch::channel(RaftStatus::default());
        let (events_tx, _) = broadcast::channel(EVENT_QUEUE_SIZE);
        let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE_SIZE);

        let driver = RaftDriver {
            node,
            snapshots,
            transport: transport.clone(),
            state,
            state_tx,
            status_tx,
            events_tx: events_tx.clone(),
            pending: BTreeMap::new(),
        };
        let shutdown = Shutdown::subscribe(notify_shutdown);
        tokio::spawn(async move {
            let _complete = shutdown_complete_tx;
            driver.run(request_rx, shutdown).await;
        });

        Ok(Arc::new(MetadataStore {
            id,
            state: state_rx,
            status: status_rx,
            events: events_tx,
            requests: request_tx,
            transport,
            commit_timeout,
        }))
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// The last committed state. Readable without a quorum.
    pub fn state(&self) -> Arc<MetadataState> {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<Arc<MetadataState>> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MetadataChange> {
        self.events.subscribe()
    }

    pub fn status(&self) -> RaftStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<RaftStatus> {
        self.status.clone()
    }

    /// Brokers in the cluster, as known to consensus.
    pub fn members(&self) -> Vec<NodeId> {
        self.status.borrow().members.clone()
    }

    pub fn is_leader(&self) -> bool {
        self.status.borrow().is_leader
    }

    pub fn partition(&self, stream_partition: &StreamPartition) -> Option<PartitionMeta> {
        self.state.borrow().partition(stream_partition).cloned()
    }

    pub fn current_leader(&self, stream_partition: &StreamPartition) -> Option<NodeId> {
        self.state.borrow().current_leader(stream_partition).cloned()
    }

    /// Waits until some node is known to lead the consensus group.
    pub async fn wait_for_leader(&self, timeout: Duration) -> AppResult<NodeId> {
        let mut status = self.status.clone();
        let wait = async {
            loop {
                if let Some(leader) = status.borrow_and_update().leader.clone() {
                    return Ok(leader);
                }
                if status.changed().await.is_err() {
                    return Err(AppError::ShuttingDown("metadata store stopped".into()));
                }
            }
        };
        time::timeout(timeout, wait)
            .await
            .map_err(|_| AppError::QuorumLost(format!("no metadata leader after {timeout:?}")))?
    }

    /// Replicates `command` and returns the change it made once applied.
    pub async fn propose(&self, command: MetadataCommand) -> AppResult<MetadataChange> {
        let name = command.name();
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(DriverRequest::Propose { command, reply })
            .await
            .map_err(|_| AppError::ShuttingDown("metadata store stopped".into()))?;
        match time::timeout(self.commit_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(AppError::ShuttingDown("metadata store stopped".into())),
            Err(_) => Err(AppError::QuorumLost(format!(
                "{} not committed within {:?}",
                name, self.commit_timeout
            ))),
        }
    }

    /// Proposes locally when this node leads consensus, otherwise redirects
    /// the command to the current leader.
    pub async fn submit(&self, command: MetadataCommand) -> AppResult<MetadataChange> {
        let known_leader = self.status.borrow().leader.clone();
        let leader = match known_leader {
            Some(leader) if leader != self.id => leader,
            Some(_) => return self.propose(command).await,
            None => {
                return Err(AppError::QuorumLost(format!(
                    "{} has no metadata leader to go to",
                    command.name()
                )))
            }
        };
        trace!("redirecting {} to metadata leader {}", command.name(), leader);
        let name = command.name();
        let forwarded = self.transport.propose(&leader, command);
        match time::timeout(self.commit_timeout, forwarded).await {
            Ok(result) => result,
            Err(_) => Err(AppError::QuorumLost(format!(
                "{} not committed by {} within {:?}",
                name, leader, self.commit_timeout
            ))),
        }
    }

    /// Hands an inbound consensus message to the driver. Dropped when the
    /// driver is saturated.
    pub fn deliver(&self, envelope: Envelope) {
        if let Err(e) = self.requests.try_send(DriverRequest::Raft(envelope)) {
            trace!("dropping inbound raft message: {}", e);
        }
    }
}

struct RaftDriver<S: RaftStorage> {
    node: RaftNode<S>,
    snapshots: SnapshotStore,
    transport: Arc<dyn Transport>,
    state: Arc<MetadataState>,
    state_tx: watch::Sender<Arc<MetadataState>>,
    status_tx: watch::Sender<RaftStatus>,
    events_tx: broadcast::Sender<MetadataChange>,
    pending: BTreeMap<u64, PendingProposal>,
}

impl<S: RaftStorage> RaftDriver<S> {
    async fn run(mut self, mut requests: mpsc::Receiver<DriverRequest>, mut shutdown: Shutdown) {
        loop {
            let deadline = self.node.next_deadline();
            let result = tokio::select! {
                _ = time::sleep_until(deadline) => self.node.tick(Instant::now()),
                request = requests.recv() => match request {
                    Some(request) => self.handle(request),
                    None => break,
                },
                _ = shutdown.recv() => break,
            };
            if let Err(e) = result.and_then(|_| self.process()) {
                error!("metadata driver {} failed: {}", self.node.id(), e);
                break;
            }
        }
        for (_, proposal) in std::mem::take(&mut self.pending) {
            let _ = proposal
                .reply
                .send(Err(AppError::ShuttingDown("metadata store stopped".into())));
        }
        debug!("metadata driver {} exiting", self.node.id());
    }

    fn handle(&mut self, request: DriverRequest) -> AppResult<()> {
        match request {
            DriverRequest::Propose { command, reply } => {
                match self.node.propose(command) {
                    Ok((index, term)) => {
                        self.pending.insert(index, PendingProposal { term, reply });
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
                Ok(())
            }
            DriverRequest::Raft(envelope) => self.node.step(envelope, Instant::now()),
        }
    }

    fn process(&mut self) -> AppResult<()> {
        for envelope in self.node.take_messages() {
            self.transport.send_raft(envelope);
        }

        if let Some(snapshot) = self.node.take_restore() {
            self.snapshots.save(&snapshot)?;
            self.publish(snapshot.index, Arc::new(snapshot.state.clone()), MetadataEvent::Restored);
            let covered: Vec<u64> = self.pending.range(..=snapshot.index).map(|(i, _)| *i).collect();
            for index in covered {
                if let Some(proposal) = self.pending.remove(&index) {
                    let _ = proposal.reply.send(Err(AppError::QuorumLost(format!(
                        "proposal at {index} superseded by a snapshot"
                    ))));
                }
            }
        }

        for entry in self.node.take_committed()? {
            let proposal = self.pending.remove(&entry.index);
            let outcome = match entry.payload {
                EntryPayload::Noop => None,
                EntryPayload::Command(command) => Some(self.apply(entry.index, &command)),
            };
            let Some(proposal) = proposal else {
                continue;
            };
            // the slot was won by another leader; its entry is applied all the same
            let reply = match outcome {
                Some(result) if proposal.term == entry.term => result,
                _ => Err(AppError::StaleTerm(format!(
                    "slot {} was taken by term {}",
                    entry.index, entry.term
                ))),
            };
            let _ = proposal.reply.send(reply);
        }

        self.pending.retain(|_, p| !p.reply.is_closed());

        let status = RaftStatus {
            leader: self.node.leader_id().cloned(),
            term: self.node.term(),
            is_leader: self.node.is_leader(),
            members: self.node.membership().to_vec(),
        };
        self.status_tx.send_if_modified(|current| {
            if *current != status {
                *current = status;
                true
            } else {
                false
            }
        });

        if self.node.should_snapshot() {
            let snapshot = self.node.build_snapshot((*self.state).clone())?;
            let path = self.snapshots.save(&snapshot)?;
            debug!("wrote metadata snapshot {:?}", path);
            self.node.compact(snapshot)?;
        }
        Ok(())
    }

    fn apply(&mut self, index: u64, command: &MetadataCommand) -> AppResult<MetadataChange> {
        match self.state.apply(command) {
            Ok((next, event)) => {
                trace!("applied {} at {}", command.name(), index);
                Ok(self.publish(index, Arc::new(next), event))
            }
            Err(e) => {
                debug!("rejected {} at {}: {}", command.name(), index, e);
                Err(e)
            }
        }
    }

    fn publish(&mut self, index: u64, state: Arc<MetadataState>, event: MetadataEvent) -> MetadataChange {
        self.state = state;
        self.state_tx.send_replace(self.state.clone());
        let change = MetadataChange { index, event };
        if self.events_tx.send(change.clone()).is_err() {
            trace!("no metadata subscribers for index {}", index);
        }
        change
    }
}
