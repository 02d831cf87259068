use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bridge_common::metrics::QUEUE_ACTIVE_TASKS;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, Notify, Semaphore};
use tracing::{error, warn};

struct Job {
    name: String,
    task: BoxFuture<'static, Result<(), String>>,
}

struct QueueState {
    concurrency: usize,
    pending: AtomicUsize,
    active: AtomicUsize,
    idle: Notify,
}

impl QueueState {
    fn is_idle(&self) -> bool {
        self.pending.load(Ordering::SeqCst) == 0 && self.active.load(Ordering::SeqCst) == 0
    }
}

/// FIFO task queue running at most `concurrency` tasks at a time.
///
/// Tasks start in submission order. A task that fails or panics is logged and the queue moves
/// on to the next one.
#[derive(Clone)]
pub struct TaskQueue {
    sender: mpsc::UnboundedSender<Job>,
    state: Arc<QueueState>,
}

impl TaskQueue {
    /// Start the dispatcher. A concurrency of 0 behaves as 1.
    pub fn new(concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        let (sender, receiver) = mpsc::unbounded_channel();
        let state = Arc::new(QueueState {
            concurrency,
            pending: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            idle: Notify::new(),
        });

        tokio::spawn(dispatch(receiver, state.clone()));

        Self { sender, state }
    }

    pub fn concurrency(&self) -> usize {
        self.state.concurrency
    }

    pub fn pending(&self) -> usize {
        self.state.pending.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.state.active.load(Ordering::SeqCst)
    }

    pub fn submit<F, E>(&self, name: &str, task: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display,
    {
        let job = Job {
            name: name.to_owned(),
            task: task.map(|result| result.map_err(|e| e.to_string())).boxed(),
        };

        self.state.pending.fetch_add(1, Ordering::SeqCst);
        if let Err(mpsc::error::SendError(job)) = self.sender.send(job) {
            self.state.pending.fetch_sub(1, Ordering::SeqCst);
            error!(task = %job.name, "task queue dispatcher is gone, task dropped");
        }
    }

    /// Resolves once nothing is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.state.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.state.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

async fn dispatch(mut receiver: mpsc::UnboundedReceiver<Job>, state: Arc<QueueState>) {
    let semaphore = Arc::new(Semaphore::new(state.concurrency));

    while let Some(job) = receiver.recv().await {
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        let active = state.active.fetch_add(1, Ordering::SeqCst) + 1;
        state.pending.fetch_sub(1, Ordering::SeqCst);
        metrics::gauge!(QUEUE_ACTIVE_TASKS).set(active as f64);

        let state = state.clone();
        tokio::spawn(async move {
            let _permit = permit;

            match AssertUnwindSafe(job.task).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(task = %job.name, "queued task failed: {}", e),
                Err(_) => error!(task = %job.name, "queued task panicked"),
            }

            let active = state.active.fetch_sub(1, Ordering::SeqCst) - 1;
            metrics::gauge!(QUEUE_ACTIVE_TASKS).set(active as f64);
            if state.is_idle() {
                state.idle.notify_waiters();
            }
        });
    }
}
