// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The affinity executor every flow step runs on.
//!
//! A fixed set of worker tasks drains one job queue, running each job to
//! completion before taking the next. With a single worker no two steps ever
//! overlap, so flow logic needs no locking of its own. With more workers only
//! per-flow ordering holds, which the manager guarantees by keeping at most
//! one outstanding step per flow.

use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::future::BoxFuture;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::{FlowError, Result};

type Job = BoxFuture<'static, ()>;

struct Outstanding {
    count: AtomicUsize,
    idle: Notify,
}

impl Outstanding {
    fn finish_one(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Serializing job queue backed by tokio tasks.
pub struct AffinityExecutor {
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    outstanding: Arc<Outstanding>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl AffinityExecutor {
    /// Start `threads` workers (at least one). Must be called inside a tokio runtime.
    pub fn new(threads: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel::<Job>();
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let outstanding = Arc::new(Outstanding {
            count: AtomicUsize::new(0),
            idle: Notify::new(),
        });

        let workers = (0..threads.max(1))
            .map(|worker| {
                let receiver = receiver.clone();
                let outstanding = outstanding.clone();
                tokio::spawn(async move {
                    loop {
                        let job = receiver.lock().await.recv().await;
                        let Some(job) = job else { break };
                        // Run on its own task so a panicking step doesn't take the worker down.
                        if let Err(e) = tokio::spawn(job).await {
                            error!(worker, error = %e, "Flow step panicked");
                        }
                        outstanding.finish_one();
                    }
                    debug!(worker, "Affinity worker stopped");
                })
            })
            .collect();

        Self {
            sender: Mutex::new(Some(sender)),
            outstanding,
            workers: Mutex::new(workers),
        }
    }

    /// Queue a job.
    pub fn execute<F>(&self, job: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        let Some(sender) = sender.as_ref() else {
            return Err(FlowError::ExecutorClosed);
        };
        self.outstanding.count.fetch_add(1, Ordering::AcqRel);
        if sender.send(Box::pin(job)).is_err() {
            self.outstanding.finish_one();
            return Err(FlowError::ExecutorClosed);
        }
        Ok(())
    }

    /// Jobs queued or running.
    pub fn outstanding(&self) -> usize {
        self.outstanding.count.load(Ordering::Acquire)
    }

    /// Wait until no job is queued or running, including jobs queued by
    /// other jobs while waiting.
    pub async fn flush(&self) {
        loop {
            let idle = self.outstanding.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.outstanding() == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Stop accepting jobs. Queued jobs still run.
    pub fn close(&self) {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }

    /// Close, then wait for the workers to drain the queue and exit.
    pub async fn shutdown(&self) {
        self.close();
        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()));
        for worker in workers {
            let _ = worker.await;
        }
    }
}

impl Drop for AffinityExecutor {
    fn drop(&mut self) {
        for worker in self.workers.get_mut().unwrap_or_else(|e| e.into_inner()).drain(..) {
            worker.abort();
        }
    }
}
