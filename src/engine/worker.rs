//! Worker tasks
//!
//! Each worker is a tokio task with its own inbox. The engine hands a worker
//! one [`WorkItem`] at a time; the worker runs the node's executor and reports
//! streamed chunks and the terminal result on the shared outbound channel.

use futures::FutureExt;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::worker_pool::WorkerPoolManager;
use crate::error::NodeError;
use crate::graph::{Node, NodeId};
use crate::nodes::{NodeChunk, NodeContext, NodeExecutor, NodeRunResult};
use crate::state::VariablePool;

/// Messages from workers (and retry timers) to the engine loop
#[derive(Debug)]
pub(crate) enum WorkerMessage {
    Chunk {
        node_id: NodeId,
        execution_id: String,
        chunk: NodeChunk,
    },
    Finished {
        worker_id: usize,
        node_id: NodeId,
        execution_id: String,
        result: Result<NodeRunResult, NodeError>,
    },
    /// A retry backoff elapsed
    RetryDue { node_id: NodeId },
}

/// One node execution handed to a worker
pub(crate) struct WorkItem {
    pub node: Arc<Node>,
    pub executor: Arc<dyn NodeExecutor>,
    pub variables: Arc<VariablePool>,
    pub attempt: usize,
    pub execution_id: String,
}

struct WorkerHandle {
    inbox: mpsc::UnboundedSender<WorkItem>,
    busy: bool,
    task: JoinHandle<()>,
}

/// The run's live workers
pub(crate) struct WorkerPool {
    workers: BTreeMap<usize, WorkerHandle>,
    next_id: usize,
    outbound: mpsc::UnboundedSender<WorkerMessage>,
    manager: Arc<WorkerPoolManager>,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn new(
        outbound: mpsc::UnboundedSender<WorkerMessage>,
        manager: Arc<WorkerPoolManager>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            workers: BTreeMap::new(),
            next_id: 0,
            outbound,
            manager,
            cancel,
        }
    }

    /// Start a worker and return its id
    pub fn spawn_worker(&mut self) -> usize {
        let worker_id = self.next_id;
        self.next_id += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        self.manager.track_worker_activity(worker_id, false);
        let task = tokio::spawn(worker_loop(
            worker_id,
            rx,
            self.outbound.clone(),
            Arc::clone(&self.manager),
            self.cancel.clone(),
        ));
        self.workers.insert(
            worker_id,
            WorkerHandle {
                inbox: tx,
                busy: false,
                task,
            },
        );
        debug!(worker_id, workers = self.workers.len(), "Worker started");
        worker_id
    }

    /// Hand an item to the lowest-numbered idle worker
    ///
    /// Gives the item back when every worker is busy.
    pub fn dispatch(&mut self, item: WorkItem) -> Result<usize, WorkItem> {
        let Some((&worker_id, handle)) = self.workers.iter_mut().find(|(_, h)| !h.busy) else {
            return Err(item);
        };
        match handle.inbox.send(item) {
            Ok(()) => {
                handle.busy = true;
                Ok(worker_id)
            }
            Err(mpsc::error::SendError(item)) => {
                warn!(worker_id, "Worker inbox closed; dropping worker");
                self.workers.remove(&worker_id);
                self.manager.remove_worker(worker_id);
                Err(item)
            }
        }
    }

    /// The worker reported its result and can take more work
    pub fn mark_idle(&mut self, worker_id: usize) {
        if let Some(handle) = self.workers.get_mut(&worker_id) {
            handle.busy = false;
        }
    }

    pub fn is_idle(&self, worker_id: usize) -> bool {
        self.workers.get(&worker_id).map(|h| !h.busy).unwrap_or(false)
    }

    pub fn idle_count(&self) -> usize {
        self.workers.values().filter(|h| !h.busy).count()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Retire an idle worker; its task ends when the inbox closes
    pub fn remove_worker(&mut self, worker_id: usize) -> bool {
        if !self.is_idle(worker_id) {
            return false;
        }
        self.workers.remove(&worker_id);
        self.manager.remove_worker(worker_id);
        debug!(worker_id, workers = self.workers.len(), "Worker retired");
        true
    }

    /// Stop every worker
    pub fn shutdown(&mut self) {
        for (worker_id, handle) in std::mem::take(&mut self.workers) {
            drop(handle.inbox);
            if handle.busy {
                handle.task.abort();
            }
            self.manager.remove_worker(worker_id);
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn worker_loop(
    worker_id: usize,
    mut inbox: mpsc::UnboundedReceiver<WorkItem>,
    outbound: mpsc::UnboundedSender<WorkerMessage>,
    manager: Arc<WorkerPoolManager>,
    cancel: CancellationToken,
) {
    loop {
        // Items already handed over are always reported, even after cancellation
        let item = tokio::select! {
            biased;
            item = inbox.recv() => match item {
                Some(item) => item,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };

        manager.track_worker_activity(worker_id, true);
        let node_id = item.node.id.clone();
        let execution_id = item.execution_id.clone();
        let result = execute(item, &outbound, &cancel).await;
        manager.track_worker_activity(worker_id, false);

        let message = WorkerMessage::Finished {
            worker_id,
            node_id,
            execution_id,
            result,
        };
        if outbound.send(message).is_err() {
            break;
        }
    }
    debug!(worker_id, "Worker exiting");
}

/// Run one item, turning panics and cancellation into node errors
async fn execute(
    item: WorkItem,
    outbound: &mpsc::UnboundedSender<WorkerMessage>,
    cancel: &CancellationToken,
) -> Result<NodeRunResult, NodeError> {
    let sink = outbound.clone();
    let node_id = item.node.id.clone();
    let execution_id = item.execution_id.clone();
    let ctx = NodeContext::new(item.node, item.variables)
        .with_cancel(cancel.clone())
        .with_attempt(item.attempt)
        .with_execution_id(item.execution_id)
        .with_chunk_sink(move |chunk| {
            let _ = sink.send(WorkerMessage::Chunk {
                node_id: node_id.clone(),
                execution_id: execution_id.clone(),
                chunk,
            });
        });

    let run = AssertUnwindSafe(item.executor.run(ctx)).catch_unwind();
    // Poll the node first so cooperative nodes see the cancellation themselves
    tokio::select! {
        biased;
        outcome = run => match outcome {
            Ok(result) => result,
            Err(payload) => Err(NodeError::panicked(panic_message(payload.as_ref()))),
        },
        _ = cancel.cancelled() => Err(NodeError::cancelled()),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("node panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("node panicked: {}", s)
    } else {
        "node panicked".to_string()
    }
}
