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

//! Publishes committed metadata changes onto the internal `__activity`
//! stream so clients can follow what happens in the cluster.
//!
//! Only the metadata leader publishes. Committed changes are turned into
//! events right away and queued for a separate delivery task, so a slow
//! activity partition never holds up the change feed. Failures are retried
//! and then logged; they never feed back into the metadata path.

mod event;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, trace, warn};

use crate::batcher::PublishBatcher;
use crate::message::{Message, StreamPartition};
use crate::metadata::{MetadataChange, MetadataCommand, MetadataStore, PartitionAssignment};
use crate::replica::{PublishAck, PublishRequest};
use crate::service::{ActivityStreamConfig, CompactSetting, CustomStreamConfig};
use crate::transport::Transport;
use crate::{AppError, AppResult, Shutdown};

pub use event::ActivityEvent;

pub const ACTIVITY_STREAM: &str = "__activity";
const MAX_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_ACTIVITY_REPLICAS: usize = 3;
const DELIVERY_QUEUE_SIZE: usize = 1024;

/// An encoded event waiting for delivery.
#[derive(Debug)]
struct Delivery {
    event: ActivityEvent,
    message: Message,
}

impl Delivery {
    fn from_change(change: &MetadataChange) -> Option<Delivery> {
        if change.event.stream() == Some(ACTIVITY_STREAM) {
            return None;
        }
        let event = ActivityEvent::from_change(change)?;
        let payload = match serde_json::to_vec(&event) {
            Ok(payload) => payload,
            Err(e) => {
                error!("encoding activity event {}: {}", event.id, e);
                return None;
            }
        };
        let message = Message::new(Bytes::from(payload)).with_key(event.stream.clone());
        Some(Delivery { event, message })
    }
}

#[derive(Debug)]
pub struct ActivityPublisher {
    config: ActivityStreamConfig,
    metadata: Arc<MetadataStore>,
    batcher: Arc<PublishBatcher>,
    transport: Arc<dyn Transport>,
}

impl ActivityPublisher {
    pub fn new(
        config: ActivityStreamConfig,
        metadata: Arc<MetadataStore>,
        batcher: Arc<PublishBatcher>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        Arc::new(ActivityPublisher {
            config,
            metadata,
            batcher,
            transport,
        })
    }

    /// Starts the publishing task. Does nothing when the activity stream
    /// is disabled.
    pub fn start(
        self: &Arc<Self>,
        notify_shutdown: &broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) {
        if !self.config.enabled {
            debug!("activity stream disabled");
            return;
        }
        let (deliveries_tx, deliveries_rx) = mpsc::channel(DELIVERY_QUEUE_SIZE);

        let publisher = Arc::clone(self);
        let shutdown = Shutdown::subscribe(notify_shutdown);
        let complete = shutdown_complete_tx.clone();
        tokio::spawn(async move {
            let _complete = complete;
            publisher.deliver(deliveries_rx, shutdown).await;
        });

        let publisher = Arc::clone(self);
        let changes = self.metadata.subscribe();
        let shutdown = Shutdown::subscribe(notify_shutdown);
        tokio::spawn(async move {
            let _complete = shutdown_complete_tx;
            publisher.run(changes, deliveries_tx, shutdown).await;
        });
    }

    /// Follows the change feed and queues an event for every change made
    /// while this node leads. Never waits on delivery.
    async fn run(
        &self,
        mut changes: broadcast::Receiver<MetadataChange>,
        deliveries: mpsc::Sender<Delivery>,
        mut shutdown: Shutdown,
    ) {
        let mut status = self.metadata.watch_status();
        let mut was_leader = false;
        loop {
            let is_leader = status.borrow_and_update().is_leader;
            if is_leader && !was_leader {
                if let Err(e) = self.ensure_stream().await {
                    warn!("creating {} failed: {}", ACTIVITY_STREAM, e);
                }
            }
            was_leader = is_leader;

            tokio::select! {
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                change = changes.recv() => match change {
                    Ok(change) => {
                        if !self.metadata.is_leader() {
                            continue;
                        }
                        let Some(delivery) = Delivery::from_change(&change) else {
                            continue;
                        };
                        match deliveries.try_send(delivery) {
                            Ok(()) => {}
                            Err(TrySendError::Full(delivery)) => warn!(
                                "activity queue full, dropping {} for {}",
                                delivery.event.op, delivery.event.stream
                            ),
                            Err(TrySendError::Closed(_)) => break,
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("activity publisher skipped {} metadata changes", skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = shutdown.recv() => break,
            }
        }
        debug!("activity publisher stopped");
    }

    /// Publishes queued events one at a time, in commit order.
    async fn deliver(&self, mut deliveries: mpsc::Receiver<Delivery>, mut shutdown: Shutdown) {
        loop {
            tokio::select! {
                delivery = deliveries.recv() => match delivery {
                    Some(delivery) => self.publish_with_retry(delivery, &mut shutdown).await,
                    None => break,
                },
                _ = shutdown.recv() => break,
            }
        }
        trace!("activity delivery stopped");
    }

    /// Creates the activity stream unless it exists.
    async fn ensure_stream(&self) -> AppResult<()> {
        if self.metadata.state().stream(ACTIVITY_STREAM).is_some() {
            return Ok(());
        }
        let mut members = self.metadata.members();
        if members.is_empty() {
            members.push(self.metadata.id().clone());
        }
        // keep the local node first so it leads the stream it writes most
        members.sort_by_key(|member| member != self.metadata.id());
        let replicas: Vec<_> = members.into_iter().take(MAX_ACTIVITY_REPLICAS).collect();
        let command = MetadataCommand::CreateStream {
            name: ACTIVITY_STREAM.to_string(),
            replication_factor: replicas.len(),
            config: CustomStreamConfig {
                compact: CompactSetting::Disabled,
                ..CustomStreamConfig::default()
            },
            partitions: vec![PartitionAssignment {
                id: 0,
                leader: replicas[0].clone(),
                replicas,
            }],
        };
        match self.metadata.propose(command).await {
            Ok(change) => {
                info!("created {} at index {}", ACTIVITY_STREAM, change.index);
                Ok(())
            }
            Err(AppError::StreamExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn publish_with_retry(&self, delivery: Delivery, shutdown: &mut Shutdown) {
        let Delivery { event, message } = delivery;
        let mut backoff = INITIAL_BACKOFF;
        for attempt in 1..=MAX_ATTEMPTS {
            match self.publish(message.clone()).await {
                Ok(ack) => {
                    trace!(
                        "published activity {} {} at offset {}",
                        event.op,
                        event.id,
                        ack.last_offset
                    );
                    return;
                }
                Err(e) if attempt == MAX_ATTEMPTS => {
                    error!(
                        "dropping activity {} for {} after {} attempts: {}",
                        event.op, event.stream, attempt, e
                    );
                }
                Err(e) => {
                    debug!(
                        "activity {} attempt {} failed: {}, retrying in {:?}",
                        event.op, attempt, e, backoff
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.recv() => return,
                    }
                    backoff *= 2;
                }
            }
        }
    }

    /// Publishes locally when this node leads the activity partition,
    /// otherwise forwards to the leader.
    async fn publish(&self, message: Message) -> AppResult<PublishAck> {
        let stream_partition = StreamPartition::new(ACTIVITY_STREAM, 0);
        let leader = self
            .metadata
            .current_leader(&stream_partition)
            .ok_or_else(|| AppError::StreamNotFound(ACTIVITY_STREAM.to_string()))?;
        let ack_policy = self.config.publish_ack_policy;
        let timeout = self.config.publish_timeout();
        if leader == *self.metadata.id() {
            return self
                .batcher
                .publish(&stream_partition, vec![message], ack_policy, timeout)
                .await;
        }
        let request = PublishRequest {
            stream_partition,
            messages: vec![message],
            ack_policy,
            timeout,
        };
        self.transport.publish(&leader, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::test_support::LocalNode;
    use crate::replica::AckPolicy;
    use crate::service::BatchConfig;

    #[tokio::test]
    async fn leader_records_metadata_changes() -> AppResult<()> {
        let node = LocalNode::start().await?;
        let batcher = PublishBatcher::new(
            BatchConfig::default(),
            node.replicas.clone(),
            &node.notify_shutdown,
            &node.complete_tx,
        );
        let publisher = ActivityPublisher::new(
            ActivityStreamConfig {
                enabled: true,
                publish_timeout_ms: 2_000,
                publish_ack_policy: AckPolicy::All,
            },
            node.metadata.clone(),
            batcher.clone(),
            node.hub.transport("a"),
        );
        publisher.start(&node.notify_shutdown, node.complete_tx.clone());

        let sp = StreamPartition::new(ACTIVITY_STREAM, 0);
        let mut activity = None;
        for _ in 0..400 {
            activity = node.replicas.get(&sp).filter(|r| r.is_leader());
            if activity.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let activity = activity.expect("activity stream is hosted");
        let stream = node.metadata.state().stream(ACTIVITY_STREAM).cloned().unwrap();
        assert_eq!(stream.replication_factor, 1);
        assert_eq!(stream.config.compact, CompactSetting::Disabled);

        node.create_stream("orders").await?;
        let mut events = Vec::new();
        for _ in 0..400 {
            events = activity.log().read_committed(0, 1 << 20)?.records()?;
            if !events.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(events.len(), 1, "the activity stream's own creation is skipped");
        let event: ActivityEvent = serde_json::from_slice(&events[0].value)?;
        assert_eq!(event.op, "create_stream");
        assert_eq!(event.stream, "orders");

        drop(activity);
        drop(publisher);
        drop(batcher);
        node.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn stalled_delivery_does_not_hold_up_the_change_feed() -> AppResult<()> {
        let node = LocalNode::start().await?;
        let batcher = PublishBatcher::new(
            BatchConfig::default(),
            node.replicas.clone(),
            &node.notify_shutdown,
            &node.complete_tx,
        );
        let publisher = ActivityPublisher::new(
            ActivityStreamConfig {
                enabled: true,
                publish_timeout_ms: 2_000,
                publish_ack_policy: AckPolicy::Leader,
            },
            node.metadata.clone(),
            batcher.clone(),
            node.hub.transport("a"),
        );

        // a one-slot queue that nothing drains
        let (deliveries_tx, mut deliveries_rx) = mpsc::channel(1);
        let changes = node.metadata.subscribe();
        let shutdown = Shutdown::subscribe(&node.notify_shutdown);
        let complete = node.complete_tx.clone();
        let feed = publisher.clone();
        tokio::spawn(async move {
            let _complete = complete;
            feed.run(changes, deliveries_tx, shutdown).await;
        });

        for name in ["s0", "s1", "s2"] {
            node.create_stream(name).await?;
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        let first = deliveries_rx.recv().await.unwrap();
        assert_eq!(first.event.stream, "s0");
        assert!(deliveries_rx.try_recv().is_err(), "overflow is dropped");

        node.create_stream("s3").await?;
        let next = tokio::time::timeout(Duration::from_secs(5), deliveries_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.event.stream, "s3");
        assert_eq!(next.event.op, "create_stream");

        drop(publisher);
        drop(batcher);
        node.shutdown().await;
        Ok(())
    }
}
