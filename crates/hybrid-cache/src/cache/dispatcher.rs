//! Background job dispatcher.
//!
//! A fixed pool of workers drains a bounded queue of boxed jobs. Enqueueing
//! never waits: a full queue is reported to the caller right away. Each job
//! hands back a [`Completion`] that callers may await or simply drop.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use hybrid_cache_core::{CacheError, Result};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::metrics;

struct Job {
    name: String,
    future: BoxFuture<'static, Result<()>>,
    done: oneshot::Sender<Result<()>>,
}

enum Message {
    Run(Job),
    Stop,
}

/// Handle to the worker pool. Clones share the same queue.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<Message>>>;

struct DispatcherInner {
    sender: mpsc::Sender<Message>,
    receiver: SharedReceiver,
    capacity: usize,
    workers: usize,
    closed: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Spawn `workers` workers on the current runtime draining a queue of
    /// `capacity` jobs.
    pub fn start(workers: usize, capacity: usize) -> Self {
        let workers = workers.max(1);
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        let receiver: SharedReceiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let handles = (0..workers)
            .map(|id| tokio::spawn(worker_loop(id, Arc::clone(&receiver))))
            .collect();

        tracing::debug!(workers, capacity, "background dispatcher started");

        Self {
            inner: Arc::new(DispatcherInner {
                sender,
                receiver,
                capacity,
                workers,
                closed: AtomicBool::new(false),
                handles: Mutex::new(handles),
            }),
        }
    }

    /// Queue `job` for execution.
    ///
    /// Fails with [`CacheError::QueueFull`] when the queue is at capacity and
    /// with [`CacheError::DispatcherClosed`] after shutdown.
    pub fn enqueue<Fut>(&self, name: impl Into<String>, job: Fut) -> Result<Completion>
    where
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        if self.is_closed() {
            return Err(CacheError::DispatcherClosed);
        }

        let name = name.into();
        let (done, receiver) = oneshot::channel();
        let message = Message::Run(Job {
            name: name.clone(),
            future: job.boxed(),
            done,
        });

        match self.inner.sender.try_send(message) {
            Ok(()) => {
                tracing::trace!(job = %name, "background job queued");
                Ok(Completion { name, receiver })
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::record_background_rejected();
                tracing::warn!(job = %name, capacity = self.inner.capacity, "background queue is full");
                Err(CacheError::QueueFull {
                    capacity: self.inner.capacity,
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(CacheError::DispatcherClosed),
        }
    }

    /// Jobs waiting in the queue.
    pub fn pending(&self) -> usize {
        self.inner.capacity - self.inner.sender.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn workers(&self) -> usize {
        self.inner.workers
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stop accepting jobs, run what is already queued and wait for the
    /// workers to exit.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        // Stop messages queue up behind pending jobs
        for _ in 0..self.inner.workers {
            if self.inner.sender.send(Message::Stop).await.is_err() {
                break;
            }
        }

        let handles = std::mem::take(&mut *self.inner.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "background worker terminated abnormally");
            }
        }

        // Jobs that raced past the closed check sit behind the stop messages
        let mut receiver = self.inner.receiver.lock().await;
        receiver.close();
        let mut dropped = 0usize;
        while let Ok(message) = receiver.try_recv() {
            if let Message::Run(job) = message {
                dropped += 1;
                let _ = job.done.send(Err(CacheError::DispatcherClosed));
            }
        }
        if dropped > 0 {
            tracing::warn!(dropped, "background jobs queued during shutdown were not run");
        }
        tracing::debug!("background dispatcher stopped");
    }
}

async fn worker_loop(id: usize, receiver: SharedReceiver) {
    loop {
        let message = receiver.lock().await.recv().await;
        match message {
            Some(Message::Run(job)) => run_job(id, job).await,
            Some(Message::Stop) | None => break,
        }
    }
    tracing::trace!(worker = id, "background worker exited");
}

async fn run_job(worker: usize, job: Job) {
    let Job { name, future, done } = job;
    let started = Instant::now();

    let result = match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(_) => {
            tracing::error!(worker, job = %name, "background job panicked");
            Err(CacheError::JobAbandoned(name.clone()))
        }
    };

    match &result {
        Ok(()) => tracing::debug!(
            worker,
            job = %name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "background job finished"
        ),
        Err(e) => tracing::warn!(worker, job = %name, error = %e, "background job failed"),
    }
    metrics::record_background_job(&name, result.is_ok());

    // Nobody waiting is fine
    let _ = done.send(result);
}

/// Outcome of a queued job.
#[must_use = "drop the completion explicitly to run the job detached"]
pub struct Completion {
    name: String,
    receiver: oneshot::Receiver<Result<()>>,
}

impl Completion {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the job to finish.
    pub async fn wait(self) -> Result<()> {
        let Completion { name, receiver } = self;
        receiver
            .await
            .unwrap_or_else(|_| Err(CacheError::JobAbandoned(name)))
    }
}
