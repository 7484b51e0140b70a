//! Ordered task queue
//!
//! A single-consumer FIFO of async tasks. Any number of producers may enqueue;
//! one worker task runs the queued tasks strictly one after another in
//! enqueue order. A task that fails or panics is logged and the worker moves
//! on to the next one.
//!
//! Each session owns two queues: one for incoming events and one for writes to
//! the transport, so that at most one write is in flight at any time.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, trace, warn};

/// A unit of work for an [`OrderedTaskQueue`]
pub type QueuedTask = BoxFuture<'static, anyhow::Result<()>>;

/// Sequential executor for async tasks
#[derive(Debug)]
pub struct OrderedTaskQueue {
    name: String,
    sender: Mutex<Option<mpsc::UnboundedSender<QueuedTask>>>,
    pending: Arc<AtomicUsize>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl OrderedTaskQueue {
    /// Create a queue and spawn its worker on `runtime`
    pub fn new(name: impl Into<String>, runtime: &Handle) -> Self {
        let name = name.into();
        let (sender, receiver) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let worker = runtime.spawn(run_worker(name.clone(), receiver, pending.clone()));
        Self {
            name,
            sender: Mutex::new(Some(sender)),
            pending,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a task; returns `false` if the queue no longer accepts tasks
    pub fn enqueue<F>(&self, task: F) -> bool
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            trace!("[{}] Dropping task submitted after shutdown", self.name);
            return false;
        };
        self.pending.fetch_add(1, Ordering::SeqCst);
        if sender.send(task.boxed()).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Number of tasks queued or running
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Stop accepting tasks; already queued tasks still run
    pub fn shutdown(&self) {
        self.sender.lock().take();
    }

    /// Stop accepting tasks and wait until the queued ones have run
    pub async fn shutdown_and_wait(&self) {
        self.shutdown();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("[{}] Queue worker ended abnormally: {}", self.name, e);
            }
        }
    }
}

async fn run_worker(
    name: String,
    mut receiver: mpsc::UnboundedReceiver<QueuedTask>,
    pending: Arc<AtomicUsize>,
) {
    while let Some(task) = receiver.recv().await {
        match AssertUnwindSafe(task).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("[{}] Queued task failed: {:#}", name, e),
            Err(panic) => error!(
                "[{}] Queued task panicked: {}",
                name,
                panic_message(panic.as_ref())
            ),
        }
        pending.fetch_sub(1, Ordering::SeqCst);
    }
    trace!("[{}] Queue worker finished", name);
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "<non-string panic payload>"
    }
}
