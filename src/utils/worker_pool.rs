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

use std::any::Any;
use std::fmt::Debug;
use std::future::Future;
use std::marker::PhantomData;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, warn};

use crate::{AppError, AppResult, Shutdown};

const MONITOR_INTERVAL: Duration = Duration::from_secs(5);

/// A fixed set of tokio workers draining one shared queue.
///
/// A monitor task restarts any worker whose handler panicked, so one bad
/// job never shrinks the pool.
pub struct WorkerPool<T, F, Fut>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    name: String,
    request_tx: async_channel::Sender<T>,
    num_workers: usize,
    _phantom: PhantomData<(F, Fut)>,
}

struct Worker {
    id: usize,
    handle: JoinHandle<()>,
}

impl<T, F, Fut> WorkerPool<T, F, Fut>
where
    T: Send + Debug + 'static,
    F: Fn(T) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    pub fn new(
        name: &str,
        capacity: usize,
        num_workers: usize,
        notify_shutdown: &broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
        handler: F,
    ) -> Self {
        let (request_tx, request_rx) = async_channel::bounded(capacity.max(1));
        let num_workers = num_workers.max(1);
        let workers = (0..num_workers)
            .map(|id| spawn_worker(name, id, request_rx.clone(), notify_shutdown, handler.clone()))
            .collect();
        spawn_monitor(
            name.to_string(),
            workers,
            request_rx,
            notify_shutdown.clone(),
            shutdown_complete_tx,
            handler,
        );
        Self {
            name: name.to_string(),
            request_tx,
            num_workers,
            _phantom: PhantomData,
        }
    }

    pub async fn send(&self, request: T) -> AppResult<()> {
        self.request_tx.send(request).await.map_err(|e| {
            AppError::ChannelSendError(format!("worker pool {} closed: {:?}", self.name, e.0))
        })
    }

    pub fn worker_count(&self) -> usize {
        self.num_workers
    }

    pub fn queued(&self) -> usize {
        self.request_tx.len()
    }
}

fn spawn_worker<T, F, Fut>(
    pool: &str,
    id: usize,
    request_rx: async_channel::Receiver<T>,
    notify_shutdown: &broadcast::Sender<()>,
    handler: F,
) -> Worker
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut shutdown = Shutdown::subscribe(notify_shutdown);
    let pool = pool.to_string();
    let handle = tokio::spawn(async move {
        debug!("{} worker {} started", pool, id);
        loop {
            tokio::select! {
                request = request_rx.recv() => {
                    match request {
                        Ok(request) => handler(request).await,
                        Err(_) => break,
                    }
                }
                _ = shutdown.recv() => {
                    debug!("{} worker {} shutting down", pool, id);
                    break;
                }
            }
        }
    });
    Worker { id, handle }
}

fn spawn_monitor<T, F, Fut>(
    name: String,
    mut workers: Vec<Worker>,
    request_rx: async_channel::Receiver<T>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
    handler: F,
) where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let _complete = shutdown_complete_tx;
        let mut interval = time::interval(MONITOR_INTERVAL);
        let mut shutdown = Shutdown::subscribe(&notify_shutdown);
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = interval.tick() => {
                    for worker in workers.iter_mut() {
                        if !worker.handle.is_finished() {
                            continue;
                        }
                        let handle = std::mem::replace(&mut worker.handle, tokio::spawn(async {}));
                        match handle.await {
                            Err(join_error) if join_error.is_panic() => {
                                error!(
                                    "{} worker {} panicked: {}",
                                    name,
                                    worker.id,
                                    panic_message(join_error.into_panic())
                                );
                            }
                            // the queue closed, nothing left to serve
                            Ok(()) if request_rx.is_closed() => continue,
                            _ => {}
                        }
                        warn!("{} worker {} exited, restarting", name, worker.id);
                        *worker = spawn_worker(
                            &name,
                            worker.id,
                            request_rx.clone(),
                            &notify_shutdown,
                            handler.clone(),
                        );
                    }
                }
            }
        }
        for worker in workers {
            let _ = worker.handle.await;
        }
        debug!("{} worker monitor exiting", name);
    });
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tokio::sync::oneshot;

    use super::*;

    #[derive(Debug)]
    struct Job {
        panic: bool,
        reply: Option<oneshot::Sender<usize>>,
    }

    #[tokio::test]
    async fn jobs_are_served() {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (complete_tx, mut complete_rx) = mpsc::channel(1);
        let served = Arc::new(AtomicUsize::new(0));
        let counter = served.clone();
        let pool = WorkerPool::new("test", 8, 2, &notify_shutdown, complete_tx, move |job: Job| {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some(reply) = job.reply {
                    let _ = reply.send(n);
                }
            }
        });
        assert_eq!(pool.worker_count(), 2);

        let mut replies = Vec::new();
        for _ in 0..4 {
            let (tx, rx) = oneshot::channel();
            pool.send(Job {
                panic: false,
                reply: Some(tx),
            })
            .await
            .unwrap();
            replies.push(rx);
        }
        for rx in replies {
            rx.await.unwrap();
        }
        assert_eq!(served.load(Ordering::SeqCst), 4);

        notify_shutdown.send(()).unwrap();
        drop(pool);
        assert!(complete_rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn panicked_worker_is_restarted() {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (complete_tx, _complete_rx) = mpsc::channel(1);
        let pool = WorkerPool::new("test", 8, 1, &notify_shutdown, complete_tx, |job: Job| async move {
            if job.panic {
                panic!("bad job");
            }
            if let Some(reply) = job.reply {
                let _ = reply.send(1);
            }
        });

        pool.send(Job {
            panic: true,
            reply: None,
        })
        .await
        .unwrap();
        tokio::time::sleep(MONITOR_INTERVAL * 2).await;

        let (tx, rx) = oneshot::channel();
        pool.send(Job {
            panic: false,
            reply: Some(tx),
        })
        .await
        .unwrap();
        assert_eq!(rx.await.unwrap(), 1);
    }
}
