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

//! Log Manager Background Tasks
//!
//! ## Checkpoint Task
//! Periodically flushes every log and persists its high watermark and leader
//! epoch. On shutdown it runs one final round and closes every log.
//!
//! ## Cleaner Task
//! Ticks at most once a second and cleans each log whose cleaner interval
//! elapsed: rolls an aged active segment, applies retention, then queues a
//! compaction job when compaction is enabled for the stream.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{self, Interval, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use super::LogManager;
use crate::log::{CompactionResult, PartitionLog};
use crate::message::StreamPartition;
use crate::utils::{now_ms, WorkerPool};
use crate::{AppError, AppResult, Shutdown};

const MAX_CLEANER_TICK: Duration = Duration::from_secs(1);
const CLEANER_QUEUE_CAPACITY: usize = 1024;

/// One compaction request for the cleaner pool.
#[derive(Debug)]
pub struct CleanerJob {
    log: Arc<PartitionLog>,
    reply: oneshot::Sender<AppResult<CompactionResult>>,
}

async fn run_compaction(job: CleanerJob) {
    let log = job.log.clone();
    let workers = log.config().compact_max_workers;
    let result = match tokio::task::spawn_blocking(move || log.compact(workers)).await {
        Ok(result) => result,
        Err(e) => Err(AppError::from(e)),
    };
    let _ = job.reply.send(result);
}

impl LogManager {
    /// Starts the checkpoint and cleaner tasks.
    pub fn start_tasks(
        self: &Arc<Self>,
        checkpoint_interval: Duration,
        notify_shutdown: &broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) {
        let manager = self.clone();
        let shutdown = Shutdown::subscribe(notify_shutdown);
        let checkpoint_complete_tx = shutdown_complete_tx.clone();
        tokio::spawn(async move {
            let _complete = checkpoint_complete_tx;
            let interval = time::interval(checkpoint_interval);
            if let Err(e) = manager.checkpoint_task(interval, shutdown).await {
                error!("checkpoint task failed: {}", e);
            }
        });

        let manager = self.clone();
        let shutdown = Shutdown::subscribe(notify_shutdown);
        let pool_shutdown = notify_shutdown.clone();
        tokio::spawn(async move {
            let pool = WorkerPool::new(
                "log-cleaner",
                CLEANER_QUEUE_CAPACITY,
                manager.defaults().compact_max_workers,
                &pool_shutdown,
                shutdown_complete_tx.clone(),
                run_compaction,
            );
            let _complete = shutdown_complete_tx;
            manager.cleaner_task(pool, shutdown).await;
        });
    }

    /// Flushes and checkpoints every log on each tick; closes all logs on
    /// shutdown.
    pub async fn checkpoint_task(
        &self,
        mut interval: Interval,
        mut shutdown: Shutdown,
    ) -> AppResult<()> {
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => trace!("checkpoint tick"),
                _ = shutdown.recv() => trace!("checkpoint task receiving shutdown signal"),
            }
            if shutdown.is_shutdown() {
                info!("log manager is shutting down, closing {} logs", self.logs.len());
                self.close_all().await?;
                break;
            }
            for log in self.logs() {
                let flushing = log.clone();
                match tokio::task::spawn_blocking(move || flushing.flush()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("flush {} failed: {}", log.stream_partition(), e),
                    Err(e) => warn!("flush {} panicked: {}", log.stream_partition(), e),
                }
                if let Err(e) = log.checkpoint().await {
                    warn!("checkpoint {} failed: {}", log.stream_partition(), e);
                }
            }
        }
        Ok(())
    }

    async fn cleaner_task<F, Fut>(&self, pool: WorkerPool<CleanerJob, F, Fut>, mut shutdown: Shutdown)
    where
        F: Fn(CleanerJob) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let tick = self.defaults().cleaner_interval().min(MAX_CLEANER_TICK);
        let mut interval = time::interval(tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.recv() => break,
            }
            let now = now_ms();
            let mut pending: Vec<(StreamPartition, oneshot::Receiver<AppResult<CompactionResult>>)> =
                Vec::new();

            for log in self.logs() {
                if log.is_deleted()
                    || now - log.last_cleaned_ms() < log.config().cleaner_interval_ms as i64
                {
                    continue;
                }
                log.set_last_cleaned_ms(now);
                let stream_partition = log.stream_partition().clone();

                let cleaning = log.clone();
                let retention = tokio::task::spawn_blocking(move || -> AppResult<Vec<i64>> {
                    cleaning.roll_if_aged(now)?;
                    cleaning.apply_retention(now)
                })
                .await;
                match retention {
                    Ok(Ok(removed)) if !removed.is_empty() => {
                        debug!("{} retention removed segments {:?}", stream_partition, removed)
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => warn!("{} retention failed: {}", stream_partition, e),
                    Err(e) => warn!("{} retention task failed: {}", stream_partition, e),
                }

                if log.config().compact {
                    let (reply, rx) = oneshot::channel();
                    if let Err(e) = pool.send(CleanerJob { log, reply }).await {
                        warn!("cannot queue compaction for {}: {}", stream_partition, e);
                        continue;
                    }
                    pending.push((stream_partition, rx));
                }
            }

            for (stream_partition, rx) in pending {
                tokio::select! {
                    result = rx => match result {
                        Ok(Ok(result)) => trace!("{} compaction finished: {:?}", stream_partition, result),
                        // retried on the next cycle
                        Ok(Err(e)) => warn!("{} compaction failed: {}", stream_partition, e),
                        Err(_) => debug!("{} compaction dropped", stream_partition),
                    },
                    _ = shutdown.recv() => break,
                }
            }
            if shutdown.is_shutdown() {
                break;
            }
        }
        debug!("cleaner task exiting");
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tempfile::tempdir;

    use super::*;
    use crate::message::Message;
    use crate::service::StreamsConfig;

    fn keyed(key: &str, value: &str) -> Message {
        Message::new(Bytes::from(value.to_string())).with_key(key.to_string())
    }

    #[tokio::test]
    async fn cleaner_compacts_and_applies_retention() -> AppResult<()> {
        let dir = tempdir()?;
        let defaults = StreamsConfig {
            cleaner_interval_ms: 100,
            compact_max_workers: 2,
            ..Default::default()
        };
        let manager = Arc::new(LogManager::new(dir.path(), defaults.clone()));
        let log = manager
            .get_or_open(&StreamPartition::new("users", 0), &defaults)
            .await?;
        log.append(vec![keyed("u1", "a"), keyed("u1", "b"), keyed("u2", "c")], 0)?;
        log.roll()?;
        log.advance_high_watermark(2);

        let (notify_shutdown, _) = broadcast::channel(1);
        let (complete_tx, mut complete_rx) = mpsc::channel(1);
        manager.start_tasks(Duration::from_secs(60), &notify_shutdown, complete_tx);

        let mut compacted = false;
        for _ in 0..50 {
            time::sleep(Duration::from_millis(100)).await;
            let records = log.read(log.log_start_offset(), usize::MAX, i64::MAX)?;
            if records.records()?.len() == 2 {
                compacted = true;
                break;
            }
        }
        assert!(compacted);

        notify_shutdown.send(()).unwrap();
        assert!(complete_rx.recv().await.is_none());
        // the final checkpoint round persisted the watermark
        let reopened = PartitionLog::open(StreamPartition::new("users", 0), dir.path(), defaults).await?;
        assert_eq!(reopened.high_watermark(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn orphans_are_removed() -> AppResult<()> {
        let dir = tempdir()?;
        let defaults = StreamsConfig::default();
        let manager = LogManager::new(dir.path(), defaults.clone());
        let keep = StreamPartition::new("kept", 0);
        let drop_open = StreamPartition::new("gone", 0);
        let drop_closed = StreamPartition::new("gone", 1);
        manager.get_or_open(&keep, &defaults).await?;
        manager.get_or_open(&drop_open, &defaults).await?;
        std::fs::create_dir_all(drop_closed.partition_dir(dir.path()))?;

        let mut existing = manager.existing_partitions().await?;
        existing.sort();
        assert_eq!(existing.len(), 3);

        let removed = manager
            .remove_orphans(&[keep.clone()].into_iter().collect())
            .await?;
        assert_eq!(removed.len(), 2);
        assert!(manager.get(&drop_open).is_none());
        assert_eq!(manager.existing_partitions().await?, vec![keep]);
        Ok(())
    }
}
