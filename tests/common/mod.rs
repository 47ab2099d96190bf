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

//! Brokers wired through an in-process hub.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use driftmq::{
    AppError, AppResult, Broker, BrokerConfig, ClusteringConfig, LocalHub, MemoryRecords,
    StreamPartition,
};
use tempfile::TempDir;

pub const WAIT: Duration = Duration::from_secs(15);

pub fn broker_config(id: &str, peers: &[&str], data_dir: &Path) -> BrokerConfig {
    let mut config = BrokerConfig::default();
    config.general.server_id = id.to_string();
    config.general.data_dir = data_dir.to_string_lossy().into_owned();
    config.general.checkpoint_interval_ms = 100;
    config.clustering = ClusteringConfig {
        raft_bootstrap_peers: peers.iter().map(|p| p.to_string()).collect(),
        raft_election_timeout_ms: 300,
        raft_heartbeat_interval_ms: 50,
        raft_commit_timeout_ms: 3_000,
        replica_max_lag_time_ms: 600,
        replica_max_leader_timeout_ms: 600,
        replica_max_idle_wait_ms: 100,
        replica_fetch_timeout_ms: 300,
        ..ClusteringConfig::default()
    };
    config
}

pub struct Cluster {
    pub hub: Arc<LocalHub>,
    pub brokers: Vec<Arc<Broker>>,
    dirs: Vec<TempDir>,
}

impl Cluster {
    pub async fn start(ids: &[&str]) -> AppResult<Cluster> {
        Self::start_with(ids, |_| {}).await
    }

    pub async fn start_with(
        ids: &[&str],
        tweak: impl Fn(&mut BrokerConfig),
    ) -> AppResult<Cluster> {
        let hub = LocalHub::new();
        let mut brokers = Vec::new();
        let mut dirs = Vec::new();
        for id in ids {
            let dir = tempfile::tempdir()?;
            let mut config = broker_config(id, ids, dir.path());
            tweak(&mut config);
            brokers.push(Broker::start_local(config, &hub).await?);
            dirs.push(dir);
        }
        let cluster = Cluster { hub, brokers, dirs };
        cluster.metadata_leader().await?;
        Ok(cluster)
    }

    pub fn broker(&self, id: &str) -> &Arc<Broker> {
        self.brokers
            .iter()
            .find(|b| b.id() == id)
            .unwrap_or_else(|| panic!("no broker {id}"))
    }

    pub async fn metadata_leader(&self) -> AppResult<Arc<Broker>> {
        let mut leader = None;
        wait_until("a metadata leader", || {
            leader = self
                .brokers
                .iter()
                .find(|b| b.metadata_store().is_leader())
                .cloned();
            leader.is_some()
        })
        .await?;
        leader.ok_or_else(|| AppError::QuorumLost("no metadata leader".into()))
    }

    /// The broker whose replicator currently leads `stream_partition`,
    /// skipping isolated brokers.
    pub fn partition_leader(&self, stream_partition: &StreamPartition) -> Option<Arc<Broker>> {
        self.brokers
            .iter()
            .filter(|b| !self.hub.is_isolated(b.id()))
            .find(|b| {
                b.replicator(stream_partition)
                    .is_some_and(|r| r.is_leader())
            })
            .cloned()
    }

    pub async fn shutdown(self) {
        for broker in &self.brokers {
            broker.shutdown().await;
        }
        drop(self.dirs);
    }
}

/// Polls `condition` until it holds or [`WAIT`] runs out.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) -> AppResult<()> {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Err(AppError::Timeout(format!("waiting for {what}")))
}

/// `(offset, value)` pairs of a fetch result.
pub fn contents(records: &MemoryRecords) -> Vec<(i64, String)> {
    records
        .iter()
        .map(|record| {
            let record = record.expect("valid record");
            (
                record.offset,
                String::from_utf8_lossy(&record.value).into_owned(),
            )
        })
        .collect()
}
