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

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::NodeId;
use crate::metadata::MetadataState;
use crate::AppResult;

const SNAPSHOT_PREFIX: &str = "snapshot-";
const SNAPSHOT_SUFFIX: &str = ".json";

/// Metadata state as of `index`, the last entry it includes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub index: u64,
    pub term: u64,
    pub membership: Vec<NodeId>,
    pub state: MetadataState,
}

/// Snapshot files in one directory, newest `retain` kept.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
    retain: usize,
}

impl SnapshotStore {
    pub fn open(dir: impl AsRef<Path>, retain: usize) -> AppResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(SnapshotStore {
            dir,
            retain: retain.max(1),
        })
    }

    fn file_name(&self, snapshot: &Snapshot) -> PathBuf {
        self.dir.join(format!(
            "{SNAPSHOT_PREFIX}{:020}-{:020}{SNAPSHOT_SUFFIX}",
            snapshot.index, snapshot.term
        ))
    }

    /// Snapshot files sorted newest first.
    fn list(&self) -> AppResult<Vec<(u64, PathBuf)>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let index = name
                .strip_prefix(SNAPSHOT_PREFIX)
                .and_then(|rest| rest.strip_suffix(SNAPSHOT_SUFFIX))
                .and_then(|rest| rest.split('-').next())
                .and_then(|index| index.parse::<u64>().ok());
            match index {
                Some(index) => files.push((index, path)),
                None if name.ends_with(".tmp") => {
                    debug!("removing unfinished snapshot {:?}", path);
                    fs::remove_file(&path)?;
                }
                None => {}
            }
        }
        files.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(files)
    }

    /// Writes `snapshot` durably, then prunes older files.
    pub fn save(&self, snapshot: &Snapshot) -> AppResult<PathBuf> {
        let path = self.file_name(snapshot);
        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&serde_json::to_vec(snapshot)?)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        File::open(&self.dir)?.sync_all()?;

        for (_, stale) in self.list()?.into_iter().skip(self.retain) {
            debug!("removing old snapshot {:?}", stale);
            fs::remove_file(stale)?;
        }
        Ok(path)
    }

    fn read(path: &Path) -> AppResult<Snapshot> {
        let bytes = fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// The newest readable snapshot. Unreadable files are skipped.
    pub fn latest(&self) -> AppResult<Option<Snapshot>> {
        for (_, path) in self.list()? {
            match Self::read(&path) {
                Ok(snapshot) => return Ok(Some(snapshot)),
                Err(e) => warn!("skipping unreadable snapshot {:?}: {}", path, e),
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn snapshot(index: u64) -> Snapshot {
        Snapshot {
            index,
            term: 1,
            membership: vec!["n1".into()],
            state: MetadataState::default(),
        }
    }

    #[test]
    fn keeps_newest_snapshots() -> AppResult<()> {
        let dir = tempdir()?;
        let store = SnapshotStore::open(dir.path(), 2)?;
        assert!(store.latest()?.is_none());
        for index in [5, 10, 15] {
            store.save(&snapshot(index))?;
        }
        assert_eq!(store.list()?.len(), 2);
        assert_eq!(store.latest()?.map(|s| s.index), Some(15));
        Ok(())
    }

    #[test]
    fn corrupt_newest_falls_back() -> AppResult<()> {
        let dir = tempdir()?;
        let store = SnapshotStore::open(dir.path(), 3)?;
        store.save(&snapshot(5))?;
        let newest = store.save(&snapshot(9))?;
        fs::write(newest, b"{not json")?;
        assert_eq!(store.latest()?.map(|s| s.index), Some(5));
        Ok(())
    }
}
