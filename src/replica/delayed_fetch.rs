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

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::trace;

use super::PartitionReplicator;
use crate::utils::DelayedOperation;

/// A follower fetch parked at the leader because nothing was readable.
///
/// Completes when the log grows past the fetch offset, the HW moves or the
/// leadership it was served under ends. The waiting handler reads again
/// after completion.
#[derive(Debug)]
pub struct DelayedFetch {
    replicator: Arc<PartitionReplicator>,
    fetch_offset: i64,
    high_watermark: i64,
    epoch: u64,
    max_wait: Duration,
    tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl DelayedFetch {
    pub fn new(
        replicator: Arc<PartitionReplicator>,
        fetch_offset: i64,
        epoch: u64,
        max_wait: Duration,
        tx: oneshot::Sender<()>,
    ) -> Self {
        let high_watermark = replicator.high_watermark();
        DelayedFetch {
            replicator,
            fetch_offset,
            high_watermark,
            epoch,
            max_wait,
            tx: Mutex::new(Some(tx)),
        }
    }
}

impl DelayedOperation for DelayedFetch {
    fn delay_ms(&self) -> u64 {
        self.max_wait.as_millis() as u64
    }

    fn try_complete(&self) -> bool {
        let log = self.replicator.log();
        self.replicator.leading_epoch() != Some(self.epoch)
            || log.log_end_offset() > self.fetch_offset
            || log.high_watermark() != self.high_watermark
    }

    fn on_complete(&self) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(());
        }
    }

    fn on_expiration(&self) {
        trace!(
            "{} parked fetch at {} expired",
            self.replicator.stream_partition(),
            self.fetch_offset
        );
    }
}
