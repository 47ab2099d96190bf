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

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{FollowerProgress, PartitionReplicator, ReplicaRole};
use crate::metadata::MetadataCommand;
use crate::replica::delayed_fetch::DelayedFetch;
use crate::replica::{watch_key, FetchRequest, FetchResponse};
use crate::{AppError, AppResult};

impl PartitionReplicator {
    /// Serves a follower fetch as the leader.
    ///
    /// Records the follower's position, which may move the HW or admit the
    /// follower back into the ISR, then returns whatever lies between the
    /// fetch offset and the LEO. With nothing to return the request is held
    /// for at most `replica_max_idle_wait`.
    pub async fn handle_fetch(self: &Arc<Self>, request: FetchRequest) -> AppResult<FetchResponse> {
        let epoch = self.validate_fetch(&request)?;
        let start = self.log.log_start_offset();
        let end = self.log.log_end_offset();
        if request.fetch_offset < start || request.fetch_offset > end {
            return Err(AppError::OffsetOutOfRange(start, end));
        }

        self.record_follower_fetch(&request.replica_id, request.fetch_offset)
            .await;

        let mut records = self
            .log
            .read(request.fetch_offset, request.max_bytes, i64::MAX)?;
        let max_wait = request.max_wait.min(self.config.replica_max_idle_wait());
        if records.is_empty() && !max_wait.is_zero() {
            let (tx, rx) = oneshot::channel();
            let operation =
                DelayedFetch::new(Arc::clone(self), request.fetch_offset, epoch, max_wait, tx);
            self.fetch_purgatory
                .try_complete_else_watch(operation, vec![watch_key(&self.stream_partition)])
                .await;
            let _ = rx.await;
            if self.leading_epoch() != Some(epoch) {
                return Err(AppError::NotLeader(self.leader()));
            }
            records = self
                .log
                .read(request.fetch_offset, request.max_bytes, i64::MAX)?;
        }

        trace!(
            "{} served {} bytes to {} from {}",
            self.stream_partition,
            records.size(),
            request.replica_id,
            request.fetch_offset
        );
        Ok(FetchResponse {
            leader_epoch: epoch,
            high_watermark: self.log.high_watermark(),
            log_start_offset: self.log.log_start_offset(),
            log_end_offset: self.log.log_end_offset(),
            records,
        })
    }

    fn validate_fetch(&self, request: &FetchRequest) -> AppResult<u64> {
        let Some(epoch) = self.leading_epoch() else {
            return Err(AppError::NotLeader(self.leader()));
        };
        if request.leader_epoch < epoch {
            return Err(AppError::StaleEpoch(format!(
                "{} fetch from {} at epoch {}, leader is at epoch {}",
                self.stream_partition, request.replica_id, request.leader_epoch, epoch
            )));
        }
        if request.leader_epoch > epoch {
            // the follower saw a newer leadership than this node
            return Err(AppError::NotLeader(self.leader()));
        }
        if !self.meta.read().is_replica(&request.replica_id) {
            return Err(AppError::InvalidOperation(format!(
                "{} is not a replica of {}",
                request.replica_id, self.stream_partition
            )));
        }
        Ok(epoch)
    }

    /// Updates what the leader knows about `replica` after a fetch at
    /// `fetch_offset`, the follower's LEO.
    async fn record_follower_fetch(self: &Arc<Self>, replica: &str, fetch_offset: i64) {
        let now = Instant::now();
        let leo = self.log.log_end_offset();
        let high_watermark = self.log.high_watermark();
        let expand_epoch = {
            let mut role = self.role.write();
            let ReplicaRole::Leader(state) = &mut *role else {
                return;
            };
            let progress = state
                .followers
                .entry(replica.to_string())
                .or_insert_with(|| FollowerProgress::new(now));
            if fetch_offset >= leo {
                progress.last_caught_up = now;
            } else if fetch_offset >= progress.leo_at_last_fetch {
                // caught up with what the leader held at the previous fetch
                progress.last_caught_up = progress.last_fetch;
            }
            progress.fetch_offset = fetch_offset;
            progress.last_fetch = now;
            progress.leo_at_last_fetch = leo;

            let outside_isr = !state.isr.iter().any(|member| member == replica);
            if outside_isr
                && fetch_offset > high_watermark
                && state.pending_isr.insert(replica.to_string())
            {
                Some(state.epoch)
            } else {
                None
            }
        };

        if self.maybe_advance_high_watermark() {
            self.wake_waiters().await;
        }
        if let Some(epoch) = expand_epoch {
            debug!(
                "{} follower {} reached the high watermark {}, expanding isr",
                self.stream_partition, replica, high_watermark
            );
            self.propose_isr_change(
                MetadataCommand::ExpandIsr {
                    stream: self.stream_partition.stream.clone(),
                    partition: self.stream_partition.partition,
                    replica: replica.to_string(),
                    leader_epoch: epoch,
                },
                replica.to_string(),
            );
        }
    }
}
