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

use crossbeam::atomic::AtomicCell;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::time::Duration;
use tokio_stream::StreamExt;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, trace, warn};

use crate::Shutdown;

const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// An operation parked until some condition holds or its delay elapses.
///
/// `on_complete` runs exactly once, either because `try_complete` returned
/// true or because the delay expired. `on_expiration` runs after
/// `on_complete` in the second case only.
pub trait DelayedOperation: Send + Sync + 'static {
    fn delay_ms(&self) -> u64;
    fn try_complete(&self) -> bool;
    fn on_complete(&self);
    fn on_expiration(&self);
}

#[derive(Debug)]
struct DelayedOperationState<T: DelayedOperation> {
    operation: T,
    completed: AtomicCell<bool>,
    delay_key: AtomicCell<Option<delay_queue::Key>>,
}

impl<T: DelayedOperation> DelayedOperationState<T> {
    fn new(operation: T) -> Self {
        Self {
            operation,
            completed: AtomicCell::new(false),
            delay_key: AtomicCell::new(None),
        }
    }

    fn is_completed(&self) -> bool {
        self.completed.load()
    }

    fn force_complete(&self) -> bool {
        if !self.completed.swap(true) {
            self.operation.on_complete();
            true
        } else {
            false
        }
    }
}

enum DelayQueueOp<T: DelayedOperation> {
    Insert(Arc<DelayedOperationState<T>>, Duration),
    Remove(delay_queue::Key),
}

/// Holds delayed operations keyed by watch keys. Producers call
/// `check_and_complete(key)` whenever the state behind `key` changes.
#[derive(Debug)]
pub struct DelayedOperationPurgatory<T: DelayedOperation> {
    name: String,
    watchers: DashMap<String, Vec<Arc<DelayedOperationState<T>>>>,
    delay_queue_tx: Sender<DelayQueueOp<T>>,
}

impl<T: DelayedOperation> DelayedOperationPurgatory<T> {
    pub fn new(
        name: &str,
        notify_shutdown: &broadcast::Sender<()>,
        shutdown_complete_tx: Sender<()>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(1000);
        let purgatory = Arc::new(DelayedOperationPurgatory {
            name: name.to_string(),
            watchers: DashMap::new(),
            delay_queue_tx: tx,
        });
        purgatory
            .clone()
            .start(rx, notify_shutdown, shutdown_complete_tx);
        purgatory
    }

    /// Completes `operation` right away if possible, otherwise parks it under
    /// every key in `watch_keys` until completion or expiry. Returns whether
    /// it completed immediately.
    pub async fn try_complete_else_watch(&self, operation: T, watch_keys: Vec<String>) -> bool {
        let op_state = Arc::new(DelayedOperationState::new(operation));

        if op_state.operation.try_complete() && op_state.force_complete() {
            return true;
        }

        for key in watch_keys {
            if op_state.is_completed() {
                break;
            }
            self.watchers
                .entry(key)
                .or_default()
                .push(Arc::clone(&op_state));
        }

        // a producer may have moved the state between the first check and the watch
        if op_state.operation.try_complete() && op_state.force_complete() {
            return true;
        }

        if !op_state.is_completed() {
            let delay = Duration::from_millis(op_state.operation.delay_ms());
            if self
                .delay_queue_tx
                .send(DelayQueueOp::Insert(Arc::clone(&op_state), delay))
                .await
                .is_err()
            {
                // expiry loop is gone, the broker is shutting down
                if op_state.force_complete() {
                    op_state.operation.on_expiration();
                }
            }
        }
        false
    }

    fn start(
        self: Arc<Self>,
        mut delay_queue_rx: Receiver<DelayQueueOp<T>>,
        notify_shutdown: &broadcast::Sender<()>,
        shutdown_complete_tx: Sender<()>,
    ) {
        let purgatory_name = self.name.clone();
        let mut delay_queue_shutdown = Shutdown::subscribe(notify_shutdown);
        let mut purge_shutdown = Shutdown::subscribe(notify_shutdown);
        let expiry_complete_tx = shutdown_complete_tx.clone();
        let purgatory = Arc::clone(&self);

        tokio::spawn(async move {
            let _complete = expiry_complete_tx;
            let mut delay_queue: DelayQueue<Arc<DelayedOperationState<T>>> = DelayQueue::new();
            loop {
                tokio::select! {
                    Some(op) = delay_queue_rx.recv() => {
                        match op {
                            DelayQueueOp::Insert(state, duration) => {
                                if state.is_completed() {
                                    continue;
                                }
                                let key = delay_queue.insert(state.clone(), duration);
                                state.delay_key.store(Some(key));
                            }
                            DelayQueueOp::Remove(key) => {
                                delay_queue.try_remove(&key);
                            }
                        }
                    }
                    Some(expired) = delay_queue.next() => {
                        let op = expired.into_inner();
                        if op.force_complete() {
                            op.operation.on_expiration();
                            trace!("purgatory {} operation expired", &purgatory_name);
                        }
                    }
                    _ = delay_queue_shutdown.recv() => break,
                }
            }
            delay_queue.clear();
            // wake every parked operation so no caller waits on a dead broker
            for entry in purgatory.watchers.iter() {
                for op in entry.value() {
                    if op.force_complete() {
                        op.operation.on_expiration();
                    }
                }
            }
            purgatory.watchers.clear();
            debug!("purgatory {} expiry loop exiting", &purgatory_name);
        });

        tokio::spawn(async move {
            let _complete = shutdown_complete_tx;
            let mut ticker = tokio::time::interval(PURGE_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.purge_completed(),
                    _ = purge_shutdown.recv() => break,
                }
            }
        });
    }

    /// Re-evaluates every operation watching `key`. Returns how many completed.
    pub async fn check_and_complete(&self, key: &str) -> usize {
        let mut delay_keys = Vec::new();
        let mut completed = 0;
        if let Some(watcher_list) = self.watchers.get(key) {
            for op in watcher_list.value() {
                if !op.is_completed() && op.operation.try_complete() && op.force_complete() {
                    completed += 1;
                    if let Some(delay_key) = op.delay_key.load() {
                        delay_keys.push(delay_key);
                    }
                }
            }
        }
        for delay_key in delay_keys {
            if self
                .delay_queue_tx
                .send(DelayQueueOp::Remove(delay_key))
                .await
                .is_err()
            {
                warn!("purgatory {} expiry loop is closed", self.name);
                break;
            }
        }
        completed
    }

    pub fn watched(&self) -> usize {
        self.watchers
            .iter()
            .map(|entry| entry.value().iter().filter(|op| !op.is_completed()).count())
            .sum()
    }

    fn purge_completed(&self) {
        self.watchers.retain(|_, ops| {
            ops.retain(|op| !op.is_completed());
            !ops.is_empty()
        });
    }
}

impl<T: DelayedOperation> Drop for DelayedOperationPurgatory<T> {
    fn drop(&mut self) {
        debug!("purgatory {} dropped", self.name);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use rstest::{fixture, rstest};
    use tokio::sync::oneshot;

    use super::*;
    use crate::service::setup_local_tracing;

    #[fixture]
    #[once]
    fn setup() {
        setup_local_tracing().expect("failed to setup tracing");
    }

    struct FlagOperation {
        ready: Arc<AtomicBool>,
        delay_ms: u64,
        completions: Arc<AtomicUsize>,
        expired: Arc<AtomicBool>,
        tx: parking_lot::Mutex<Option<oneshot::Sender<bool>>>,
    }

    impl DelayedOperation for FlagOperation {
        fn delay_ms(&self) -> u64 {
            self.delay_ms
        }
        fn try_complete(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }
        fn on_complete(&self) {
            self.completions.fetch_add(1, Ordering::SeqCst);
            if let Some(tx) = self.tx.lock().take() {
                let _ = tx.send(self.ready.load(Ordering::SeqCst));
            }
        }
        fn on_expiration(&self) {
            self.expired.store(true, Ordering::SeqCst);
        }
    }

    struct Harness {
        ready: Arc<AtomicBool>,
        completions: Arc<AtomicUsize>,
        expired: Arc<AtomicBool>,
    }

    fn operation(delay_ms: u64) -> (FlagOperation, Harness, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        let harness = Harness {
            ready: Arc::new(AtomicBool::new(false)),
            completions: Arc::new(AtomicUsize::new(0)),
            expired: Arc::new(AtomicBool::new(false)),
        };
        let op = FlagOperation {
            ready: harness.ready.clone(),
            delay_ms,
            completions: harness.completions.clone(),
            expired: harness.expired.clone(),
            tx: parking_lot::Mutex::new(Some(tx)),
        };
        (op, harness, rx)
    }

    #[rstest]
    #[tokio::test]
    async fn completes_when_watched_key_changes(_setup: ()) {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (complete_tx, _complete_rx) = mpsc::channel(1);
        let purgatory = DelayedOperationPurgatory::new("test", &notify_shutdown, complete_tx);

        let (op, harness, rx) = operation(60_000);
        assert!(
            !purgatory
                .try_complete_else_watch(op, vec!["stream-0".to_string()])
                .await
        );
        assert_eq!(purgatory.check_and_complete("stream-0").await, 0);

        harness.ready.store(true, Ordering::SeqCst);
        assert_eq!(purgatory.check_and_complete("other-0").await, 0);
        assert_eq!(purgatory.check_and_complete("stream-0").await, 1);
        assert!(rx.await.unwrap());
        assert_eq!(harness.completions.load(Ordering::SeqCst), 1);
        assert!(!harness.expired.load(Ordering::SeqCst));
        assert_eq!(purgatory.watched(), 0);
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn expires_after_delay(_setup: ()) {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (complete_tx, _complete_rx) = mpsc::channel(1);
        let purgatory = DelayedOperationPurgatory::new("test", &notify_shutdown, complete_tx);

        let (op, harness, rx) = operation(100);
        purgatory
            .try_complete_else_watch(op, vec!["k".to_string()])
            .await;
        assert!(!rx.await.unwrap());
        assert!(harness.expired.load(Ordering::SeqCst));
        assert_eq!(harness.completions.load(Ordering::SeqCst), 1);
        // a late check must not complete it twice
        harness.ready.store(true, Ordering::SeqCst);
        assert_eq!(purgatory.check_and_complete("k").await, 0);
    }

    #[rstest]
    #[tokio::test]
    async fn immediate_completion_skips_watch(_setup: ()) {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (complete_tx, _complete_rx) = mpsc::channel(1);
        let purgatory = DelayedOperationPurgatory::new("test", &notify_shutdown, complete_tx);

        let (op, harness, _rx) = operation(60_000);
        harness.ready.store(true, Ordering::SeqCst);
        assert!(
            purgatory
                .try_complete_else_watch(op, vec!["k".to_string()])
                .await
        );
        assert_eq!(purgatory.watched(), 0);
    }

    #[rstest]
    #[tokio::test]
    async fn shutdown_expires_parked_operations(_setup: ()) {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (complete_tx, mut complete_rx) = mpsc::channel(1);
        let purgatory = DelayedOperationPurgatory::new("test", &notify_shutdown, complete_tx);

        let (op, harness, rx) = operation(60_000);
        purgatory
            .try_complete_else_watch(op, vec!["k".to_string()])
            .await;
        // let the expiry loop pick up the insert
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        notify_shutdown.send(()).unwrap();
        assert!(!rx.await.unwrap());
        assert!(harness.expired.load(Ordering::SeqCst));
        assert!(complete_rx.recv().await.is_none());
    }
}
