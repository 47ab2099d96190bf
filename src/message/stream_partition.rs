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
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{AppError, AppResult};

/// Addresses one partition of a stream. Rendered as `<stream>-<partition>`,
/// which is also the partition's directory name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamPartition {
    pub stream: String,
    pub partition: i32,
}

impl StreamPartition {
    pub fn new(stream: impl Into<String>, partition: i32) -> Self {
        Self {
            stream: stream.into(),
            partition,
        }
    }

    pub fn id(&self) -> String {
        format!("{}-{}", self.stream, self.partition)
    }

    /// Stream names may contain dashes, so the partition is the last segment.
    pub fn from_string(value: Cow<str>) -> AppResult<Self> {
        let (stream, partition) = value
            .rsplit_once('-')
            .ok_or_else(|| AppError::InvalidValue(format!("stream partition: {value}")))?;
        if stream.is_empty() {
            return Err(AppError::InvalidValue(format!("stream partition: {value}")));
        }
        let partition = partition
            .parse::<i32>()
            .map_err(|_| AppError::InvalidValue(format!("stream partition: {value}")))?;
        Ok(Self::new(stream, partition))
    }

    pub fn partition_dir(&self, base_dir: &Path) -> PathBuf {
        base_dir.join(self.id())
    }
}

impl Display for StreamPartition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.stream, self.partition)
    }
}
