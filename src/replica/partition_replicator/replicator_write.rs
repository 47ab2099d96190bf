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

use tokio::sync::oneshot;
use tracing::{debug, trace};

use super::{PartitionReplicator, ReplicaRole};
use crate::log::LogAppendInfo;
use crate::message::Message;
use crate::replica::delayed_produce::DelayedProduce;
use crate::replica::{watch_key, AckPolicy, PublishAck};
use crate::{AppError, AppResult};

impl PartitionReplicator {
    /// Writes `messages` as the leader and returns the assigned offsets.
    ///
    /// Appends are serialized per partition. Fails with `UnderReplicated`
    /// when the ISR is smaller than `min_isr`, with `NotLeader` when this
    /// replica does not lead, and with `StaleEpoch` when leadership moved
    /// while the write was in flight.
    pub async fn append(&self, messages: Vec<Message>) -> AppResult<LogAppendInfo> {
        let _guard = self.write_lock.lock().await;
        let epoch = self.writable_epoch()?;
        let info = self.log.append(messages, epoch)?;
        drop(_guard);

        if self.leading_epoch() != Some(epoch) {
            return Err(AppError::StaleEpoch(format!(
                "{} lost leadership of epoch {} during append",
                self.stream_partition, epoch
            )));
        }
        trace!(
            "{} leader appended [{}, {}]",
            self.stream_partition,
            info.first_offset,
            info.last_offset
        );
        self.maybe_advance_high_watermark();
        self.wake_waiters().await;
        Ok(info)
    }

    fn writable_epoch(&self) -> AppResult<u64> {
        if self.is_closed() {
            return Err(AppError::NotLeader(format!(
                "{} is no longer hosted here",
                self.stream_partition
            )));
        }
        match &*self.role.read() {
            ReplicaRole::Leader(state) => {
                if state.isr.len() < self.config.min_isr {
                    return Err(AppError::UnderReplicated(format!(
                        "{} isr size {} is below min isr {}",
                        self.stream_partition,
                        state.isr.len(),
                        self.config.min_isr
                    )));
                }
                Ok(state.epoch)
            }
            _ => Err(AppError::NotLeader(self.leader())),
        }
    }

    /// Waits until the HW covers `offset`.
    ///
    /// Fails with `StaleEpoch` when leadership of `epoch` is lost first and
    /// with `Timeout` when `timeout` elapses. A timed out record may still
    /// commit later or be truncated by a new leader.
    pub async fn await_commit(
        self: &Arc<Self>,
        offset: i64,
        epoch: u64,
        timeout: Duration,
    ) -> AppResult<()> {
        let (tx, rx) = oneshot::channel();
        let operation = DelayedProduce::new(Arc::clone(self), offset, epoch, timeout, tx);
        self.produce_purgatory
            .try_complete_else_watch(operation, vec![watch_key(&self.stream_partition)])
            .await;
        rx.await.map_err(|_| {
            AppError::ShuttingDown(format!(
                "{} commit wait abandoned",
                self.stream_partition
            ))
        })?
    }

    /// Appends and acknowledges according to `ack_policy`.
    pub async fn publish(
        self: &Arc<Self>,
        messages: Vec<Message>,
        ack_policy: AckPolicy,
        timeout: Duration,
    ) -> AppResult<PublishAck> {
        let info = self.append(messages).await?;
        let ack = PublishAck {
            first_offset: info.first_offset,
            last_offset: info.last_offset,
            leader_epoch: info.leader_epoch,
        };
        match ack_policy {
            AckPolicy::None => Ok(PublishAck::unknown(info.leader_epoch)),
            AckPolicy::Leader => Ok(ack),
            AckPolicy::All => {
                self.await_commit(info.last_offset, info.leader_epoch, timeout)
                    .await?;
                debug!(
                    "{} committed [{}, {}]",
                    self.stream_partition, info.first_offset, info.last_offset
                );
                Ok(ack)
            }
        }
    }
}
