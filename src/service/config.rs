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

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::replica::AckPolicy;

use super::{AppError, AppResult};

pub const DEFAULT_NAMESPACE: &str = "driftmq-default";
const ENV_PREFIX: &str = "DRIFTMQ";

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct GeneralConfig {
    /// Unique id of this node inside the cluster. Generated when left empty.
    pub server_id: String,
    pub namespace: String,
    /// Root directory for stream data and consensus state.
    /// Defaults to `/tmp/driftmq/<namespace>`.
    pub data_dir: String,
    /// The interval at which partition logs are flushed and checkpointed.
    pub checkpoint_interval_ms: u64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            server_id: String::new(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            data_dir: String::new(),
            checkpoint_interval_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchConfig {
    pub max_messages: usize,
    /// 0 means a batch only takes what is already queued.
    pub max_time_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_messages: 1024,
            max_time_ms: 0,
        }
    }
}

impl BatchConfig {
    pub fn max_time(&self) -> Duration {
        Duration::from_millis(self.max_time_ms)
    }
}

/// Storage settings applied to every stream unless overridden by a
/// [`CustomStreamConfig`]. Zero disables a retention limit.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamsConfig {
    pub segment_max_bytes: u64,
    pub segment_max_age_ms: u64,
    pub retention_max_bytes: u64,
    pub retention_max_messages: u64,
    pub retention_max_age_ms: u64,
    pub cleaner_interval_ms: u64,
    pub compact: bool,
    pub compact_max_workers: usize,
    pub index_interval_bytes: usize,
    pub index_max_bytes: usize,
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            segment_max_bytes: 256 * 1024 * 1024,
            segment_max_age_ms: 0,
            retention_max_bytes: 0,
            retention_max_messages: 0,
            retention_max_age_ms: 7 * 24 * 60 * 60 * 1000,
            cleaner_interval_ms: 5 * 60 * 1000,
            compact: true,
            compact_max_workers: 10,
            index_interval_bytes: 4096,
            index_max_bytes: 10 * 1024 * 1024,
        }
    }
}

impl StreamsConfig {
    pub fn segment_max_age(&self) -> Duration {
        Duration::from_millis(self.segment_max_age_ms)
    }

    pub fn retention_max_age(&self) -> Duration {
        Duration::from_millis(self.retention_max_age_ms)
    }

    pub fn cleaner_interval(&self) -> Duration {
        Duration::from_millis(self.cleaner_interval_ms)
    }

    /// Returns a copy of these settings with every value present in `custom`
    /// taking precedence. An unset compaction setting keeps the current value.
    pub fn apply_custom(&self, custom: &CustomStreamConfig) -> StreamsConfig {
        let mut merged = self.clone();
        if let Some(v) = custom.segment_max_bytes {
            merged.segment_max_bytes = v;
        }
        if let Some(v) = custom.segment_max_age_ms {
            merged.segment_max_age_ms = v;
        }
        if let Some(v) = custom.retention_max_bytes {
            merged.retention_max_bytes = v;
        }
        if let Some(v) = custom.retention_max_messages {
            merged.retention_max_messages = v;
        }
        if let Some(v) = custom.retention_max_age_ms {
            merged.retention_max_age_ms = v;
        }
        if let Some(v) = custom.cleaner_interval_ms {
            merged.cleaner_interval_ms = v;
        }
        if let Some(v) = custom.compact_max_workers {
            merged.compact_max_workers = v;
        }
        match custom.compact {
            CompactSetting::Unset => {}
            CompactSetting::Enabled => merged.compact = true,
            CompactSetting::Disabled => merged.compact = false,
        }
        merged
    }

    fn validate(&self, section: &str) -> AppResult<()> {
        if self.segment_max_bytes == 0 {
            return Err(AppError::InvalidValue(format!(
                "{section}.segment_max_bytes must be positive"
            )));
        }
        if self.index_interval_bytes == 0 {
            return Err(AppError::InvalidValue(format!(
                "{section}.index_interval_bytes must be positive"
            )));
        }
        if self.index_max_bytes < 8 {
            return Err(AppError::InvalidValue(format!(
                "{section}.index_max_bytes must hold at least one entry"
            )));
        }
        if self.compact_max_workers == 0 {
            return Err(AppError::InvalidValue(format!(
                "{section}.compact_max_workers must be at least 1"
            )));
        }
        if self.cleaner_interval_ms == 0 {
            return Err(AppError::InvalidValue(format!(
                "{section}.cleaner_interval_ms must be positive"
            )));
        }
        Ok(())
    }
}

/// Per-stream compaction switch. `Unset` inherits the broker default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompactSetting {
    #[default]
    Unset,
    Enabled,
    Disabled,
}

impl CompactSetting {
    /// Decodes the numeric wire form: 0 unset, 1 enabled, 2 disabled.
    pub fn from_wire(value: i32) -> AppResult<Self> {
        match value {
            0 => Ok(CompactSetting::Unset),
            1 => Ok(CompactSetting::Enabled),
            2 => Ok(CompactSetting::Disabled),
            other => Err(AppError::InvalidValue(format!(
                "compact setting must be 0, 1 or 2, got {other}"
            ))),
        }
    }
}

/// Overrides supplied when a stream is created. Durations are milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CustomStreamConfig {
    pub segment_max_bytes: Option<u64>,
    pub segment_max_age_ms: Option<u64>,
    pub retention_max_bytes: Option<u64>,
    pub retention_max_messages: Option<u64>,
    pub retention_max_age_ms: Option<u64>,
    pub cleaner_interval_ms: Option<u64>,
    pub compact_max_workers: Option<usize>,
    pub compact: CompactSetting,
}

impl CustomStreamConfig {
    pub fn validate(&self) -> AppResult<()> {
        if self.segment_max_bytes == Some(0) {
            return Err(AppError::InvalidValue(
                "segment_max_bytes override must be positive".into(),
            ));
        }
        if self.compact_max_workers == Some(0) {
            return Err(AppError::InvalidValue(
                "compact_max_workers override must be at least 1".into(),
            ));
        }
        if self.cleaner_interval_ms == Some(0) {
            return Err(AppError::InvalidValue(
                "cleaner_interval_ms override must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusteringConfig {
    /// Number of snapshot files kept on disk.
    pub raft_snapshots: usize,
    /// Applied entries between two snapshots.
    pub raft_snapshot_threshold: u64,
    /// Recent consensus log entries kept in memory.
    pub raft_cache_size: usize,
    /// Peers seeded into an empty consensus store. Ignored once state exists.
    pub raft_bootstrap_peers: Vec<String>,
    /// Entries kept behind the latest snapshot for slow followers.
    pub raft_trailing_logs: u64,
    pub raft_election_timeout_ms: u64,
    pub raft_heartbeat_interval_ms: u64,
    pub raft_commit_timeout_ms: u64,
    pub replica_max_lag_time_ms: u64,
    pub replica_max_leader_timeout_ms: u64,
    pub replica_max_idle_wait_ms: u64,
    pub replica_fetch_timeout_ms: u64,
    pub min_isr: usize,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            raft_snapshots: 2,
            raft_snapshot_threshold: 8192,
            raft_cache_size: 512,
            raft_bootstrap_peers: Vec::new(),
            raft_trailing_logs: 10_240,
            raft_election_timeout_ms: 2_000,
            raft_heartbeat_interval_ms: 500,
            raft_commit_timeout_ms: 5_000,
            replica_max_lag_time_ms: 15_000,
            replica_max_leader_timeout_ms: 15_000,
            replica_max_idle_wait_ms: 10_000,
            replica_fetch_timeout_ms: 3_000,
            min_isr: 1,
        }
    }
}

impl ClusteringConfig {
    pub fn raft_election_timeout(&self) -> Duration {
        Duration::from_millis(self.raft_election_timeout_ms)
    }

    pub fn raft_heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.raft_heartbeat_interval_ms)
    }

    pub fn raft_commit_timeout(&self) -> Duration {
        Duration::from_millis(self.raft_commit_timeout_ms)
    }

    pub fn replica_max_lag_time(&self) -> Duration {
        Duration::from_millis(self.replica_max_lag_time_ms)
    }

    pub fn replica_max_leader_timeout(&self) -> Duration {
        Duration::from_millis(self.replica_max_leader_timeout_ms)
    }

    pub fn replica_max_idle_wait(&self) -> Duration {
        Duration::from_millis(self.replica_max_idle_wait_ms)
    }

    pub fn replica_fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.replica_fetch_timeout_ms)
    }

    fn validate(&self) -> AppResult<()> {
        if self.min_isr == 0 {
            return Err(AppError::InvalidValue(
                "clustering.min_isr must be at least 1".into(),
            ));
        }
        if self.raft_snapshots == 0 {
            return Err(AppError::InvalidValue(
                "clustering.raft_snapshots must be at least 1".into(),
            ));
        }
        if self.raft_snapshot_threshold == 0 {
            return Err(AppError::InvalidValue(
                "clustering.raft_snapshot_threshold must be positive".into(),
            ));
        }
        if self.raft_heartbeat_interval_ms == 0
            || self.raft_heartbeat_interval_ms >= self.raft_election_timeout_ms
        {
            return Err(AppError::InvalidValue(format!(
                "clustering.raft_heartbeat_interval_ms ({}) must be positive and below raft_election_timeout_ms ({})",
                self.raft_heartbeat_interval_ms, self.raft_election_timeout_ms
            )));
        }
        if self.replica_max_lag_time_ms == 0 || self.replica_max_leader_timeout_ms == 0 {
            return Err(AppError::InvalidValue(
                "clustering replica timeouts must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ActivityStreamConfig {
    pub enabled: bool,
    pub publish_timeout_ms: u64,
    pub publish_ack_policy: AckPolicy,
}

impl Default for ActivityStreamConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            publish_timeout_ms: 5_000,
            publish_ack_policy: AckPolicy::All,
        }
    }
}

impl ActivityStreamConfig {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    pub general: GeneralConfig,
    pub batch: BatchConfig,
    pub streams: StreamsConfig,
    pub clustering: ClusteringConfig,
    pub activity_stream: ActivityStreamConfig,
}

impl BrokerConfig {
    /// Loads the configuration from an optional file plus `DRIFTMQ__SECTION__KEY`
    /// environment overrides, then fills derived defaults and validates it.
    pub fn set_up_config<P: AsRef<Path>>(path: Option<P>) -> AppResult<BrokerConfig> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            let path_str = path.as_ref().to_str().ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
            builder = builder.add_source(config::File::with_name(path_str));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut broker_config: BrokerConfig = config.try_deserialize()?;
        broker_config.fill_defaults();
        broker_config.validate()?;
        Ok(broker_config)
    }

    /// Resolves values that depend on other settings.
    pub fn fill_defaults(&mut self) {
        if self.general.server_id.is_empty() {
            self.general.server_id = uuid::Uuid::new_v4().simple().to_string();
        }
        if self.general.data_dir.is_empty() {
            self.general.data_dir = std::env::temp_dir()
                .join("driftmq")
                .join(&self.general.namespace)
                .to_string_lossy()
                .into_owned();
        }
        if self.clustering.raft_bootstrap_peers.is_empty() {
            // a lone broker forms its own cluster
            self.clustering
                .raft_bootstrap_peers
                .push(self.general.server_id.clone());
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.general.server_id.trim().is_empty() {
            return Err(AppError::InvalidValue("general.server_id is empty".into()));
        }
        if self.general.namespace.trim().is_empty() {
            return Err(AppError::InvalidValue("general.namespace is empty".into()));
        }
        if self.general.checkpoint_interval_ms == 0 {
            return Err(AppError::InvalidValue(
                "general.checkpoint_interval_ms must be positive".into(),
            ));
        }
        if self.batch.max_messages == 0 {
            return Err(AppError::InvalidValue(
                "batch.max_messages must be at least 1".into(),
            ));
        }
        self.streams.validate("streams")?;
        self.clustering.validate()
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.general.data_dir)
    }

    pub fn streams_dir(&self) -> PathBuf {
        self.data_dir().join("streams")
    }

    pub fn raft_dir(&self) -> PathBuf {
        self.data_dir().join("raft")
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.general.checkpoint_interval_ms)
    }
}
