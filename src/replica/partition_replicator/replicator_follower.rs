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
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::{FollowerState, PartitionReplicator, ReplicaRole};
use crate::metadata::{MetadataCommand, NodeId};
use crate::replica::{FetchRequest, FetchResponse, REPLICA_FETCH_MAX_BYTES};
use crate::{AppError, AppResult, Shutdown};

const MIN_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug)]
struct Backoff {
    current: Duration,
}

impl Backoff {
    fn new() -> Self {
        Backoff {
            current: MIN_BACKOFF,
        }
    }

    fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(MAX_BACKOFF);
        delay
    }

    fn reset(&mut self) {
        self.current = MIN_BACKOFF;
    }
}

impl PartitionReplicator {
    pub(super) fn start_fetcher(self: &Arc<Self>, epoch: u64) {
        let Some(complete) = self.shutdown_complete.upgrade() else {
            debug!("{} not fetching, broker is shut down", self.stream_partition);
            return;
        };
        let replicator = Arc::clone(self);
        let mut shutdown = Shutdown::subscribe(&self.notify_shutdown);
        let handle = tokio::spawn(async move {
            let _complete = complete;
            tokio::select! {
                _ = replicator.fetch_loop(epoch) => {}
                _ = shutdown.recv() => {}
            }
        });
        if let Some(previous) = self.fetcher.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Leader to fetch from while following at `epoch`, `None` once the
    /// role moved on.
    fn fetch_target(&self, epoch: u64) -> Option<NodeId> {
        if self.is_closed() {
            return None;
        }
        match &*self.role.read() {
            ReplicaRole::Follower(state) if state.epoch == epoch => Some(state.leader.clone()),
            ReplicaRole::Electing {
                epoch: current,
                leader,
                ..
            } if *current == epoch => Some(leader.clone()),
            _ => None,
        }
    }

    async fn fetch_loop(self: &Arc<Self>, epoch: u64) {
        let mut backoff = Backoff::new();
        let deadline = self.config.replica_fetch_timeout() + self.config.replica_max_idle_wait();
        while let Some(leader) = self.fetch_target(epoch) {
            let request = FetchRequest {
                stream_partition: self.stream_partition.clone(),
                replica_id: self.local_id.clone(),
                leader_epoch: epoch,
                fetch_offset: self.log.log_end_offset(),
                max_bytes: REPLICA_FETCH_MAX_BYTES,
                max_wait: self.config.replica_max_idle_wait(),
            };
            let result = match tokio::time::timeout(deadline, self.transport.fetch(&leader, request))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(AppError::Timeout(format!(
                    "fetch from {} took longer than {:?}",
                    leader, deadline
                ))),
            };

            let outcome = match result {
                Ok(response) => self.apply_fetch_response(epoch, response).await,
                Err(AppError::OffsetOutOfRange(start, end)) => {
                    self.reconcile_range(epoch, start, end).await
                }
                Err(e) => Err(e),
            };
            match outcome {
                Ok(()) => backoff.reset(),
                Err(e) => {
                    debug!(
                        "{} fetch from {} at epoch {} failed: {}",
                        self.stream_partition, leader, epoch, e
                    );
                    self.check_leader_timeout(epoch).await;
                    tokio::time::sleep(backoff.next()).await;
                }
            }
        }
        trace!("{} fetcher for epoch {} stopped", self.stream_partition, epoch);
    }

    /// Appends what the leader returned and follows its HW.
    async fn apply_fetch_response(&self, epoch: u64, response: FetchResponse) -> AppResult<()> {
        let _guard = self.write_lock.lock().await;
        if self.fetch_target(epoch).is_none() {
            return Ok(());
        }
        if response.leader_epoch != epoch {
            return Err(AppError::StaleEpoch(format!(
                "{} leader answered at epoch {}, following epoch {}",
                self.stream_partition, response.leader_epoch, epoch
            )));
        }
        if !response.records.is_empty() {
            if let Some(info) = self.log.append_replicated(&response.records)? {
                trace!(
                    "{} replicated [{}, {}]",
                    self.stream_partition,
                    info.first_offset,
                    info.last_offset
                );
            }
        }
        let hw = response.high_watermark.min(self.log.log_end_offset() - 1);
        self.log.advance_high_watermark(hw);
        self.mark_leader_contact(epoch);
        Ok(())
    }

    /// Brings the local log back inside the leader's `[start, end]`.
    async fn reconcile_range(&self, epoch: u64, start: i64, end: i64) -> AppResult<()> {
        let _guard = self.write_lock.lock().await;
        if self.fetch_target(epoch).is_none() {
            return Ok(());
        }
        let leo = self.log.log_end_offset();
        if leo > end {
            warn!(
                "{} local log end {} is beyond leader end {}, truncating",
                self.stream_partition, leo, end
            );
            self.log.truncate_to(end)?;
        } else if leo < start {
            warn!(
                "{} local log end {} is behind leader start {}, resetting",
                self.stream_partition, leo, start
            );
            self.log.reset_to(start)?;
        }
        self.mark_leader_contact(epoch);
        Ok(())
    }

    fn mark_leader_contact(&self, epoch: u64) {
        let now = Instant::now();
        let mut role = self.role.write();
        match &mut *role {
            ReplicaRole::Follower(state) if state.epoch == epoch => {
                state.last_leader_contact = now;
            }
            ReplicaRole::Electing {
                epoch: current,
                leader,
                ..
            } if *current == epoch => {
                info!(
                    "{} leader {} answered again, resuming as follower",
                    self.stream_partition, leader
                );
                let leader = leader.clone();
                *role = ReplicaRole::Follower(FollowerState {
                    epoch,
                    leader,
                    last_leader_contact: now,
                });
            }
            _ => {}
        }
    }

    /// Enters `Electing` once the leader has been silent for
    /// `replica_max_leader_timeout` and, as an ISR member, proposes this
    /// node as the next leader.
    async fn check_leader_timeout(&self, epoch: u64) {
        let timeout = self.config.replica_max_leader_timeout();
        let now = Instant::now();
        let propose = {
            let mut role = self.role.write();
            match &mut *role {
                ReplicaRole::Follower(state)
                    if state.epoch == epoch
                        && now.duration_since(state.last_leader_contact) > timeout =>
                {
                    warn!(
                        "{} leader {} silent for {:?}, starting leader election",
                        self.stream_partition, state.leader, timeout
                    );
                    let leader = state.leader.clone();
                    *role = ReplicaRole::Electing {
                        epoch,
                        leader,
                        since: now,
                    };
                    true
                }
                ReplicaRole::Electing {
                    epoch: current,
                    since,
                    ..
                } if *current == epoch && now.duration_since(*since) > timeout => {
                    *since = now;
                    true
                }
                _ => false,
            }
        };
        if !propose || !self.meta.read().in_isr(&self.local_id) {
            return;
        }

        let command = MetadataCommand::ChangeLeader {
            stream: self.stream_partition.stream.clone(),
            partition: self.stream_partition.partition,
            leader: self.local_id.clone(),
            leader_epoch: epoch,
        };
        match self.metadata.submit(command).await {
            Ok(change) => info!(
                "{} proposed {} as leader after epoch {}, committed at index {}",
                self.stream_partition, self.local_id, epoch, change.index
            ),
            Err(AppError::StaleEpoch(_)) => debug!(
                "{} another replica took over after epoch {}",
                self.stream_partition, epoch
            ),
            Err(e) => warn!(
                "{} leader election proposal failed: {}",
                self.stream_partition, e
            ),
        }
    }
}
