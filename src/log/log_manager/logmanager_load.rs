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

use std::borrow::Cow;
use std::collections::HashSet;

use tracing::{info, warn};

use super::LogManager;
use crate::message::StreamPartition;
use crate::{AppError, AppResult};

impl LogManager {
    /// Lists the partitions that have a directory under the base dir.
    pub async fn existing_partitions(&self) -> AppResult<Vec<StreamPartition>> {
        let mut partitions = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.base_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(partitions),
            Err(e) => {
                return Err(AppError::DetailedIoError(format!(
                    "read log dir {:?}: {}",
                    self.base_dir, e
                )))
            }
        };
        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            match StreamPartition::from_string(Cow::Owned(name)) {
                Ok(stream_partition) => partitions.push(stream_partition),
                Err(_) => warn!("ignoring unexpected directory {:?}", entry.path()),
            }
        }
        partitions.sort();
        Ok(partitions)
    }

    /// Deletes partition directories not listed in `keep`, closing any log
    /// that is still open for them. Returns what was removed.
    pub async fn remove_orphans(
        &self,
        keep: &HashSet<StreamPartition>,
    ) -> AppResult<Vec<StreamPartition>> {
        let mut removed = Vec::new();
        for stream_partition in self.existing_partitions().await? {
            if keep.contains(&stream_partition) {
                continue;
            }
            if self.get(&stream_partition).is_some() {
                self.delete(&stream_partition).await?;
            } else {
                let dir = stream_partition.partition_dir(&self.base_dir);
                match tokio::fs::remove_dir_all(&dir).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
            info!("removed orphan partition {}", stream_partition);
            removed.push(stream_partition);
        }
        Ok(removed)
    }
}
