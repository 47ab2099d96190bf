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

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::{trace, warn};

use crate::AppError::InvalidValue;
use crate::AppResult;

/// A small versioned `key value` file rewritten atomically through a
/// temporary sibling and a rename.
#[derive(Debug)]
pub struct CheckPointFile {
    file_name: PathBuf,
    version: i8,
}

impl CheckPointFile {
    pub const CK_FILE_VERSION_1: i8 = 1;

    pub fn new(file_name: impl AsRef<Path>) -> Self {
        Self {
            file_name: file_name.as_ref().to_path_buf(),
            version: Self::CK_FILE_VERSION_1,
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_name
    }

    pub async fn write_checkpoints(&self, points: &BTreeMap<String, i64>) -> AppResult<()> {
        let tmp_name = self.file_name.with_extension("tmp");
        let write_file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp_name)
            .await?;
        let mut buf_writer = BufWriter::new(write_file);
        buf_writer
            .write_all(format!("{}\n", self.version).as_bytes())
            .await?;
        for (key, value) in points {
            buf_writer
                .write_all(format!("{} {}\n", key, value).as_bytes())
                .await?;
        }
        buf_writer.flush().await?;
        buf_writer.get_ref().sync_all().await?;
        fs::rename(&tmp_name, &self.file_name).await?;
        Ok(())
    }

    /// A missing file reads as empty.
    pub async fn read_checkpoints(&self) -> AppResult<BTreeMap<String, i64>> {
        let error = |line: &str| InvalidValue(format!("checkpoint line {:?}", line.trim_end()));
        trace!("read checkpoints from {:?}", self.file_name);
        let open_file = match OpenOptions::new().read(true).open(&self.file_name).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    "checkpoint file {:?} not found, starting from scratch",
                    self.file_name
                );
                return Ok(BTreeMap::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut reader = BufReader::new(open_file);
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let version = line.trim().parse::<i8>().map_err(|_| error(&line))?;
        if version != self.version {
            return Err(InvalidValue(format!(
                "checkpoint version {} in {:?}, expected {}",
                version, self.file_name, self.version
            )));
        }
        let mut points = BTreeMap::new();
        line.clear();
        while reader.read_line(&mut line).await? > 0 {
            let mut parts = line.split_whitespace();
            let (Some(key), Some(value), None) = (parts.next(), parts.next(), parts.next()) else {
                return Err(error(&line));
            };
            let value = value.parse::<i64>().map_err(|_| error(&line))?;
            points.insert(key.to_string(), value);
            line.clear();
        }
        Ok(points)
    }
}
