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
use tracing::debug;

use super::PartitionReplicator;
use crate::utils::DelayedOperation;
use crate::{AppError, AppResult};

/// An `ALL` acknowledgment waiting for the HW to cover `offset`.
#[derive(Debug)]
pub struct DelayedProduce {
    replicator: Arc<PartitionReplicator>,
    offset: i64,
    epoch: u64,
    timeout: Duration,
    tx: Mutex<Option<oneshot::Sender<AppResult<()>>>>,
}

impl DelayedProduce {
    pub fn new(
        replicator: Arc<PartitionReplicator>,
        offset: i64,
        epoch: u64,
        timeout: Duration,
        tx: oneshot::Sender<AppResult<()>>,
    ) -> Self {
        DelayedProduce {
            replicator,
            offset,
            epoch,
            timeout,
            tx: Mutex::new(Some(tx)),
        }
    }

    fn outcome(&self) -> AppResult<()> {
        if self.replicator.leading_epoch() != Some(self.epoch) {
            return Err(AppError::StaleEpoch(format!(
                "{} leadership of epoch {} ended before offset {} committed",
                self.replicator.stream_partition(),
                self.epoch,
                self.offset
            )));
        }
        if self.replicator.high_watermark() >= self.offset {
            return Ok(());
        }
        Err(AppError::Timeout(format!(
            "{} offset {} not committed within {:?}",
            self.replicator.stream_partition(),
            self.offset,
            self.timeout
        )))
    }
}

impl DelayedOperation for DelayedProduce {
    fn delay_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }

    fn try_complete(&self) -> bool {
        self.replicator.leading_epoch() != Some(self.epoch)
            || self.replicator.high_watermark() >= self.offset
    }

    fn on_complete(&self) {
        if let Some(tx) = self.tx.lock().take() {
            // the publisher may have given up already
            let _ = tx.send(self.outcome());
        }
    }

    fn on_expiration(&self) {
        debug!(
            "{} commit wait for offset {} expired",
            self.replicator.stream_partition(),
            self.offset
        );
    }
}
