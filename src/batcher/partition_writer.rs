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

use tokio::sync::{broadcast, mpsc};
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};

use super::PublishJob;
use crate::message::{Message, StreamPartition};
use crate::replica::{AckPolicy, PartitionReplicator, PublishAck, ReplicaManager};
use crate::service::BatchConfig;
use crate::{AppError, AppResult, Shutdown};

/// The single writer of one partition.
#[derive(Debug)]
pub(super) struct PartitionWriter {
    stream_partition: StreamPartition,
    config: BatchConfig,
    replicas: Arc<ReplicaManager>,
    shutdown: Shutdown,
    shutdown_complete_tx: mpsc::Sender<()>,
}

impl PartitionWriter {
    pub(super) fn new(
        stream_partition: StreamPartition,
        config: BatchConfig,
        replicas: Arc<ReplicaManager>,
        notify_shutdown: &broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> Self {
        PartitionWriter {
            stream_partition,
            config,
            replicas,
            shutdown: Shutdown::subscribe(notify_shutdown),
            shutdown_complete_tx,
        }
    }

    pub(super) async fn run(mut self, mut queue: mpsc::Receiver<PublishJob>) {
        loop {
            let first = tokio::select! {
                job = queue.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
                _ = self.shutdown.recv() => break,
            };
            let batch = self.collect(first, &mut queue).await;
            self.write(batch).await;
            if self.replicas.get(&self.stream_partition).is_none() {
                debug!("{} is no longer hosted here", self.stream_partition);
                break;
            }
        }

        // accepted requests are written, not dropped
        queue.close();
        let mut rest = Vec::new();
        while let Some(job) = queue.recv().await {
            rest.push(job);
        }
        if !rest.is_empty() {
            debug!(
                "{} flushing {} queued publishes before exit",
                self.stream_partition,
                rest.len()
            );
            self.write(rest).await;
        }
        trace!("{} publish writer stopped", self.stream_partition);
    }

    /// Gathers requests behind `first` until the batch is full or the
    /// batching window closes.
    async fn collect(
        &mut self,
        first: PublishJob,
        queue: &mut mpsc::Receiver<PublishJob>,
    ) -> Vec<PublishJob> {
        let mut count = first.messages.len();
        let mut batch = vec![first];
        let max_time = self.config.max_time();
        if max_time.is_zero() {
            while count < self.config.max_messages {
                match queue.try_recv() {
                    Ok(job) => {
                        count += job.messages.len();
                        batch.push(job);
                    }
                    Err(_) => break,
                }
            }
            return batch;
        }

        let deadline = Instant::now() + max_time;
        while count < self.config.max_messages {
            tokio::select! {
                job = queue.recv() => match job {
                    Some(job) => {
                        count += job.messages.len();
                        batch.push(job);
                    }
                    None => break,
                },
                _ = time::sleep_until(deadline) => break,
                _ = self.shutdown.recv() => break,
            }
        }
        batch
    }

    async fn write(&self, batch: Vec<PublishJob>) {
        let Some(replicator) = self.replicas.get(&self.stream_partition) else {
            let err = AppError::StreamNotFound(self.stream_partition.id());
            for job in batch {
                reply(job, Err(err.duplicate()));
            }
            return;
        };

        let mut messages: Vec<Message> = Vec::new();
        let mut counts = Vec::with_capacity(batch.len());
        let mut jobs = Vec::with_capacity(batch.len());
        for mut job in batch {
            counts.push(job.messages.len());
            messages.append(&mut job.messages);
            jobs.push(job);
        }
        let total = messages.len();

        let info = match replicator.append(messages).await {
            Ok(info) => info,
            Err(e) => {
                debug!("{} batch of {} failed: {}", self.stream_partition, total, e);
                for job in jobs {
                    reply(job, Err(e.duplicate()));
                }
                return;
            }
        };
        trace!(
            "{} wrote batch of {} requests, offsets [{}, {}]",
            self.stream_partition,
            jobs.len(),
            info.first_offset,
            info.last_offset
        );

        let mut next = info.first_offset;
        for (job, count) in jobs.into_iter().zip(counts) {
            let ack = PublishAck {
                first_offset: next,
                last_offset: next + count as i64 - 1,
                leader_epoch: info.leader_epoch,
            };
            next += count as i64;
            match job.ack_policy {
                AckPolicy::None => {}
                AckPolicy::Leader => reply(job, Ok(ack)),
                AckPolicy::All => self.spawn_commit_wait(&replicator, job, ack),
            }
        }
    }

    /// Waits for the commit off the writer so the next batch is not held up.
    fn spawn_commit_wait(
        &self,
        replicator: &Arc<PartitionReplicator>,
        job: PublishJob,
        ack: PublishAck,
    ) {
        let replicator = Arc::clone(replicator);
        let complete = self.shutdown_complete_tx.clone();
        tokio::spawn(async move {
            let _complete = complete;
            let result = replicator
                .await_commit(ack.last_offset, ack.leader_epoch, job.timeout)
                .await
                .map(|()| ack);
            if let Err(e) = &result {
                warn!(
                    "{} publish [{}, {}] not acknowledged: {}",
                    replicator.stream_partition(),
                    ack.first_offset,
                    ack.last_offset,
                    e
                );
            }
            reply(job, result);
        });
    }
}

fn reply(job: PublishJob, result: AppResult<PublishAck>) {
    if let Some(tx) = job.reply {
        // the publisher may have stopped waiting
        let _ = tx.send(result);
    }
}
