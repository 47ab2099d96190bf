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

//! Coalesces concurrent publishes into one append per partition.
//!
//! Every partition gets its own writer task fed by a bounded queue. A
//! writer takes the first queued request, keeps collecting until the batch
//! holds `batch.max_messages` messages or `batch.max_time` has passed, and
//! hands the whole batch to the replicator as a single append. Offsets are
//! then sliced back to the requests in submission order.
//!
//! A writer lives as long as its partition is hosted here. When the replica
//! manager drops the partition, its queue is dropped too and the writer
//! exits after answering whatever was still queued.

mod partition_writer;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, trace};

use crate::message::{Message, StreamPartition};
use crate::replica::{AckPolicy, PublishAck, ReplicaManager};
use crate::service::BatchConfig;
use crate::{AppError, AppResult, Shutdown};

use partition_writer::PartitionWriter;

const QUEUE_CAPACITY: usize = 4096;

#[derive(Debug)]
pub(crate) struct PublishJob {
    pub messages: Vec<Message>,
    pub ack_policy: AckPolicy,
    pub timeout: Duration,
    /// `None` for fire-and-forget publishes.
    pub reply: Option<oneshot::Sender<AppResult<PublishAck>>>,
}

#[derive(Debug)]
pub struct PublishBatcher {
    config: BatchConfig,
    replicas: Arc<ReplicaManager>,
    queues: DashMap<StreamPartition, mpsc::Sender<PublishJob>>,
    closed: AtomicBool,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete: mpsc::WeakSender<()>,
}

impl PublishBatcher {
    pub fn new(
        config: BatchConfig,
        replicas: Arc<ReplicaManager>,
        notify_shutdown: &broadcast::Sender<()>,
        shutdown_complete_tx: &mpsc::Sender<()>,
    ) -> Arc<Self> {
        let batcher = Arc::new(PublishBatcher {
            config,
            replicas,
            queues: DashMap::new(),
            closed: AtomicBool::new(false),
            notify_shutdown: notify_shutdown.clone(),
            shutdown_complete: shutdown_complete_tx.downgrade(),
        });
        let removed = batcher.replicas.subscribe_removed();
        let shutdown = Shutdown::subscribe(notify_shutdown);
        let complete = shutdown_complete_tx.clone();
        let weak = Arc::downgrade(&batcher);
        tokio::spawn(async move {
            let _complete = complete;
            forget_removed_partitions(weak, removed, shutdown).await;
        });
        batcher
    }

    /// Queues `messages` for the partition's writer and waits as
    /// `ack_policy` demands. With [`AckPolicy::None`] this returns as soon
    /// as the request is queued.
    pub async fn publish(
        &self,
        stream_partition: &StreamPartition,
        messages: Vec<Message>,
        ack_policy: AckPolicy,
        timeout: Duration,
    ) -> AppResult<PublishAck> {
        if messages.is_empty() {
            return Err(AppError::InvalidValue("publish without messages".into()));
        }
        // an oversized record must not fail the batch it would be coalesced into
        for message in &messages {
            message.ensure_fits()?;
        }
        let replicator = self
            .replicas
            .get(stream_partition)
            .ok_or_else(|| AppError::StreamNotFound(stream_partition.id()))?;
        let queue = self.queue(stream_partition)?;

        let (tx, rx) = oneshot::channel();
        let fire_and_forget = ack_policy == AckPolicy::None;
        let job = PublishJob {
            messages,
            ack_policy,
            timeout,
            reply: (!fire_and_forget).then_some(tx),
        };
        queue
            .send(job)
            .await
            .map_err(|_| shutting_down(stream_partition))?;
        if fire_and_forget {
            return Ok(PublishAck::unknown(replicator.leader_epoch()));
        }
        rx.await.map_err(|_| shutting_down(stream_partition))?
    }

    fn queue(&self, stream_partition: &StreamPartition) -> AppResult<mpsc::Sender<PublishJob>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(shutting_down(stream_partition));
        }
        if let Some(queue) = self.queues.get(stream_partition) {
            if !queue.is_closed() {
                return Ok(queue.clone());
            }
        }
        // a writer that gave up on a vanished partition leaves a closed queue
        self.queues
            .remove_if(stream_partition, |_, queue| queue.is_closed());
        let entry = self
            .queues
            .entry(stream_partition.clone())
            .or_try_insert_with(|| self.spawn_writer(stream_partition))?;
        Ok(entry.clone())
    }

    fn spawn_writer(
        &self,
        stream_partition: &StreamPartition,
    ) -> AppResult<mpsc::Sender<PublishJob>> {
        let complete = self
            .shutdown_complete
            .upgrade()
            .ok_or_else(|| shutting_down(stream_partition))?;
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let writer = PartitionWriter::new(
            stream_partition.clone(),
            self.config.clone(),
            self.replicas.clone(),
            &self.notify_shutdown,
            complete,
        );
        tokio::spawn(writer.run(rx));
        debug!("started publish writer for {}", stream_partition);
        Ok(tx)
    }

    /// Refuses new publishes. Writers flush what is queued once the
    /// broker-wide shutdown fires.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.queues.clear();
    }
}

/// Drops the queue of every partition the replica manager stops hosting.
async fn forget_removed_partitions(
    batcher: Weak<PublishBatcher>,
    mut removed: broadcast::Receiver<StreamPartition>,
    mut shutdown: Shutdown,
) {
    loop {
        let event = tokio::select! {
            event = removed.recv() => event,
            _ = shutdown.recv() => break,
        };
        let Some(batcher) = batcher.upgrade() else {
            break;
        };
        match event {
            Ok(stream_partition) => {
                if batcher.queues.remove(&stream_partition).is_some() {
                    debug!("retired publish writer for {}", stream_partition);
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                trace!("missed {} partition removals, sweeping queues", skipped);
                batcher
                    .queues
                    .retain(|stream_partition, _| batcher.replicas.get(stream_partition).is_some());
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn shutting_down(stream_partition: &StreamPartition) -> AppError {
    AppError::ShuttingDown(format!("publish to {} refused", stream_partition))
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use rstest::rstest;
    use tokio::task::JoinHandle;
    use tokio::time;

    use super::*;
    use crate::message::constants::MAX_RECORD_SIZE;
    use crate::message::Record;
    use crate::metadata::MetadataCommand;
    use crate::replica::test_support::LocalNode;

    fn prefix_of(record: &Record) -> String {
        String::from_utf8_lossy(&record.value)
            .split('-')
            .next()
            .unwrap_or_default()
            .to_string()
    }

    fn batch(prefix: &str, n: usize) -> Vec<Message> {
        (0..n)
            .map(|i| Message::new(Bytes::from(format!("{}-{}", prefix, i))))
            .collect()
    }

    #[tokio::test]
    async fn concurrent_publishes_get_contiguous_offsets() -> AppResult<()> {
        let node = LocalNode::start().await?;
        let replicator = node.create_stream("orders").await?;
        let batcher = PublishBatcher::new(
            BatchConfig {
                max_messages: 64,
                max_time_ms: 20,
            },
            node.replicas.clone(),
            &node.notify_shutdown,
            &node.complete_tx,
        );
        let sp = StreamPartition::new("orders", 0);

        let mut handles = Vec::new();
        for i in 0..8 {
            let batcher = batcher.clone();
            let sp = sp.clone();
            handles.push(tokio::spawn(async move {
                batcher
                    .publish(
                        &sp,
                        batch(&format!("p{}", i), 3),
                        AckPolicy::All,
                        Duration::from_secs(5),
                    )
                    .await
            }));
        }
        let mut acks = Vec::new();
        for handle in handles {
            acks.push(handle.await.unwrap()?);
        }
        acks.sort_by_key(|ack| ack.first_offset);
        for (i, ack) in acks.iter().enumerate() {
            assert_eq!(ack.first_offset, i as i64 * 3);
            assert_eq!(ack.last_offset, ack.first_offset + 2);
        }
        assert_eq!(replicator.high_watermark(), 23);

        // each request's records sit at the offsets it was told
        let records = replicator.log().read_committed(0, 1 << 20)?.records()?;
        for ack in &acks {
            let prefix = prefix_of(&records[ack.first_offset as usize]);
            for offset in ack.first_offset..=ack.last_offset {
                assert_eq!(prefix_of(&records[offset as usize]), prefix);
            }
        }
        drop(batcher);
        node.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn publishes_fail_for_unknown_streams_and_after_close() -> AppResult<()> {
        let node = LocalNode::start().await?;
        node.create_stream("orders").await?;
        let batcher = PublishBatcher::new(
            BatchConfig::default(),
            node.replicas.clone(),
            &node.notify_shutdown,
            &node.complete_tx,
        );
        let missing = batcher
            .publish(
                &StreamPartition::new("missing", 0),
                batch("x", 1),
                AckPolicy::Leader,
                Duration::from_secs(1),
            )
            .await;
        assert!(matches!(missing, Err(AppError::StreamNotFound(_))));

        let sp = StreamPartition::new("orders", 0);
        let none = batcher
            .publish(&sp, batch("x", 2), AckPolicy::None, Duration::from_secs(1))
            .await?;
        assert_eq!(none.first_offset, -1);

        batcher.close();
        let refused = batcher
            .publish(&sp, batch("y", 1), AckPolicy::Leader, Duration::from_secs(1))
            .await;
        assert!(matches!(refused, Err(AppError::ShuttingDown(_))));
        drop(batcher);
        node.shutdown().await;
        Ok(())
    }

    fn spawn_publish(
        batcher: &Arc<PublishBatcher>,
        sp: &StreamPartition,
        messages: Vec<Message>,
    ) -> JoinHandle<AppResult<PublishAck>> {
        let batcher = batcher.clone();
        let sp = sp.clone();
        tokio::spawn(async move {
            batcher
                .publish(&sp, messages, AckPolicy::Leader, Duration::from_secs(5))
                .await
        })
    }

    #[rstest]
    #[case::cut_at_max_messages(4, 60_000, 4)]
    #[case::released_at_max_time(1000, 50, 6)]
    #[tokio::test]
    async fn batches_close_on_count_or_time(
        #[case] max_messages: usize,
        #[case] max_time_ms: u64,
        #[case] done_before_shutdown: usize,
    ) -> AppResult<()> {
        let node = LocalNode::start().await?;
        let replicator = node.create_stream("orders").await?;
        let batcher = PublishBatcher::new(
            BatchConfig {
                max_messages,
                max_time_ms,
            },
            node.replicas.clone(),
            &node.notify_shutdown,
            &node.complete_tx,
        );
        let sp = StreamPartition::new("orders", 0);
        let handles: Vec<_> = (0..6)
            .map(|i| spawn_publish(&batcher, &sp, batch(&format!("p{i}"), 1)))
            .collect();

        time::sleep(Duration::from_secs(1)).await;
        let done = handles.iter().filter(|h| h.is_finished()).count();
        assert_eq!(done, done_before_shutdown);

        // whatever is still batching is written or failed, never dropped
        node.notify_shutdown.send(()).ok();
        let mut acked = 0;
        for handle in handles {
            let result = time::timeout(Duration::from_secs(5), handle)
                .await
                .expect("publish answered after shutdown")
                .unwrap();
            if result.is_ok() {
                acked += 1;
            }
        }
        assert!(acked >= done_before_shutdown as i64);
        assert_eq!(replicator.log().log_end_offset(), acked);
        drop(batcher);
        node.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn oversized_record_fails_alone() -> AppResult<()> {
        let node = LocalNode::start().await?;
        node.create_stream("orders").await?;
        let batcher = PublishBatcher::new(
            BatchConfig {
                max_messages: 64,
                max_time_ms: 50,
            },
            node.replicas.clone(),
            &node.notify_shutdown,
            &node.complete_tx,
        );
        let sp = StreamPartition::new("orders", 0);
        let fine = spawn_publish(&batcher, &sp, batch("fine", 2));
        let huge = spawn_publish(
            &batcher,
            &sp,
            vec![Message::new(Bytes::from(vec![0u8; MAX_RECORD_SIZE]))],
        );

        assert!(matches!(huge.await.unwrap(), Err(AppError::InvalidValue(_))));
        let ack = fine.await.unwrap()?;
        assert_eq!((ack.first_offset, ack.last_offset), (0, 1));
        drop(batcher);
        node.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn deleted_partition_retires_its_writer() -> AppResult<()> {
        let node = LocalNode::start().await?;
        node.create_stream("orders").await?;
        let batcher = PublishBatcher::new(
            BatchConfig::default(),
            node.replicas.clone(),
            &node.notify_shutdown,
            &node.complete_tx,
        );
        let sp = StreamPartition::new("orders", 0);
        batcher
            .publish(&sp, batch("a", 3), AckPolicy::Leader, Duration::from_secs(1))
            .await?;
        let queue = batcher.queues.get(&sp).map(|q| q.downgrade()).unwrap();

        node.metadata
            .propose(MetadataCommand::DeleteStream {
                name: "orders".into(),
            })
            .await?;
        for _ in 0..500 {
            if !batcher.queues.contains_key(&sp) {
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!batcher.queues.contains_key(&sp));
        assert!(queue.upgrade().is_none());

        // a recreated stream gets a fresh writer
        node.create_stream("orders").await?;
        let ack = batcher
            .publish(&sp, batch("b", 2), AckPolicy::Leader, Duration::from_secs(1))
            .await?;
        assert_eq!(ack.first_offset, 0);
        drop(batcher);
        node.shutdown().await;
        Ok(())
    }
}
