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

//! Log Manager Module
//!
//! Owns every partition log hosted by this broker and the background work
//! shared between them.
//!
//! # Components
//!
//! - `LogManager`: opens, looks up and deletes partition logs
//! - `logmanager_load`: discovers partition directories left on disk
//! - `logmanager_tasks`: the checkpoint task and the cleaner task
//!
//! # Cleaner
//!
//! The cleaner wakes up periodically and, for every log whose own cleaner
//! interval elapsed, rolls aged active segments, applies retention and hands
//! compaction to a bounded worker pool. Each compaction reports back through a
//! oneshot channel so a cycle only ends once its jobs finished.

mod logmanager_load;
mod logmanager_tasks;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::log::PartitionLog;
use crate::message::StreamPartition;
use crate::service::StreamsConfig;
use crate::AppResult;

#[derive(Debug)]
pub struct LogManager {
    base_dir: PathBuf,
    defaults: StreamsConfig,
    logs: DashMap<StreamPartition, Arc<PartitionLog>>,
    /// Serializes opening so one partition is never recovered twice.
    open_lock: Mutex<()>,
}

impl LogManager {
    /// Creates a manager rooted at `base_dir`, usually `<data_dir>/streams`.
    pub fn new(base_dir: impl AsRef<Path>, defaults: StreamsConfig) -> Self {
        LogManager {
            base_dir: base_dir.as_ref().to_path_buf(),
            defaults,
            logs: DashMap::new(),
            open_lock: Mutex::new(()),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn defaults(&self) -> &StreamsConfig {
        &self.defaults
    }

    pub fn get(&self, stream_partition: &StreamPartition) -> Option<Arc<PartitionLog>> {
        self.logs.get(stream_partition).map(|log| log.value().clone())
    }

    pub fn logs(&self) -> Vec<Arc<PartitionLog>> {
        self.logs.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Returns the open log for `stream_partition`, recovering it from disk
    /// or creating it with `config` the first time.
    pub async fn get_or_open(
        &self,
        stream_partition: &StreamPartition,
        config: &StreamsConfig,
    ) -> AppResult<Arc<PartitionLog>> {
        if let Some(log) = self.get(stream_partition) {
            return Ok(log);
        }
        let _guard = self.open_lock.lock().await;
        if let Some(log) = self.get(stream_partition) {
            return Ok(log);
        }
        let log =
            PartitionLog::open(stream_partition.clone(), &self.base_dir, config.clone()).await?;
        self.logs.insert(stream_partition.clone(), log.clone());
        Ok(log)
    }

    /// Removes the log and its directory.
    pub async fn delete(&self, stream_partition: &StreamPartition) -> AppResult<()> {
        let Some((_, log)) = self.logs.remove(stream_partition) else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || log.delete()).await??;
        info!("deleted log {}", stream_partition);
        Ok(())
    }

    /// Checkpoints every open log.
    pub async fn checkpoint_all(&self) -> AppResult<()> {
        for log in self.logs() {
            log.checkpoint().await?;
        }
        Ok(())
    }

    /// Flushes and checkpoints every open log.
    pub async fn close_all(&self) -> AppResult<()> {
        for log in self.logs() {
            log.close().await?;
        }
        debug!("closed {} logs", self.logs.len());
        Ok(())
    }
}

impl Drop for LogManager {
    fn drop(&mut self) {
        debug!("log manager dropped");
    }
}
