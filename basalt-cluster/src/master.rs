//! Master-side cluster state machine
//!
//! All cluster-state changes flow through one priority queue consumed by a
//! single task: updates execute serially against the latest accepted state,
//! and a produced state only becomes current once the publisher commits it.
//! A task must never block on another task in the same queue.
//!
//! The publisher is pluggable: [`LocalPublisher`] commits immediately and
//! feeds a watch channel (single-node deployments, tests); a consensus
//! implementation commits only on a quorum of master-eligible acks and
//! fails with `FailedToCommit` otherwise, discarding the proposed state.

use crate::error::{ClusterError, Result};
use crate::metrics::update_cluster_state_version;
use async_trait::async_trait;
use basalt::state::ClusterState;
use parking_lot::{Mutex, RwLock};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Queue priority of a state update task
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Normal,
    High,
    Urgent,
}

type StateUpdateFn = Box<dyn FnOnce(&ClusterState) -> basalt::Result<ClusterState> + Send>;

struct QueuedTask {
    priority: Priority,
    seq: u64,
    source: String,
    update: StateUpdateFn,
    ack: oneshot::Sender<Result<Arc<ClusterState>>>,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // max-heap: higher priority first, then FIFO within a priority
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Commits produced states to the cluster
#[async_trait]
pub trait StatePublisher: Send + Sync {
    /// Commit `state`; on failure the state is discarded everywhere
    async fn publish(&self, state: Arc<ClusterState>) -> Result<()>;
}

/// Publisher that commits immediately and feeds a watch channel
pub struct LocalPublisher {
    tx: watch::Sender<Arc<ClusterState>>,
}

impl LocalPublisher {
    pub fn new(initial: Arc<ClusterState>) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// Stream of applied states, for observers
    pub fn subscribe(&self) -> watch::Receiver<Arc<ClusterState>> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl StatePublisher for LocalPublisher {
    async fn publish(&self, state: Arc<ClusterState>) -> Result<()> {
        self.tx.send_replace(state);
        Ok(())
    }
}

struct MasterInner {
    state: RwLock<Arc<ClusterState>>,
    queue: Mutex<BinaryHeap<QueuedTask>>,
    seq: AtomicU64,
    notify: Arc<Notify>,
    publisher: Arc<dyn StatePublisher>,
}

/// Single-writer executor of cluster state updates
pub struct MasterService {
    inner: Arc<MasterInner>,
}

impl MasterService {
    pub fn new(initial: ClusterState, publisher: Arc<dyn StatePublisher>) -> Self {
        Self {
            inner: Arc::new(MasterInner {
                state: RwLock::new(Arc::new(initial)),
                queue: Mutex::new(BinaryHeap::new()),
                seq: AtomicU64::new(0),
                notify: Arc::new(Notify::new()),
                publisher,
            }),
        }
    }

    /// The latest accepted state
    pub fn state(&self) -> Arc<ClusterState> {
        self.inner.state.read().clone()
    }

    /// Spawn the queue consumer; it stops once the service is dropped
    pub fn start(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let notify = Arc::clone(&self.inner.notify);
        tokio::spawn(async move { run_queue(weak, notify).await })
    }

    /// Enqueue a state update and wait for its publication
    pub async fn submit<F>(
        &self,
        source: &str,
        priority: Priority,
        update: F,
    ) -> Result<Arc<ClusterState>>
    where
        F: FnOnce(&ClusterState) -> basalt::Result<ClusterState> + Send + 'static,
    {
        let (ack, rx) = oneshot::channel();
        let seq = self.inner.seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.inner.queue.lock().push(QueuedTask {
            priority,
            seq,
            source: source.to_string(),
            update: Box::new(update),
            ack,
        });
        self.inner.notify.notify_one();
        rx.await
            .map_err(|_| ClusterError::Internal("master queue stopped".into()))?
    }
}

async fn run_queue(weak: Weak<MasterInner>, notify: Arc<Notify>) {
    loop {
        let task = {
            let inner = match weak.upgrade() {
                Some(inner) => inner,
                None => return,
            };
            let task = inner.queue.lock().pop();
            task
        };
        match task {
            Some(task) => {
                let inner = match weak.upgrade() {
                    Some(inner) => inner,
                    None => return,
                };
                run_task(&inner, task).await;
            }
            // park without holding a strong reference so a dropped service
            // lets the loop exit on its next wake-up
            None => notify.notified().await,
        }
    }
}

async fn run_task(inner: &MasterInner, task: QueuedTask) {
    let current = inner.state.read().clone();
    debug!(
        "executing cluster state task [{}] at version {}",
        task.source,
        current.version()
    );
    let result = match (task.update)(&current) {
        Err(e) => {
            warn!("cluster state task [{}] failed: {e}", task.source);
            Err(ClusterError::Core(e))
        }
        Ok(produced) if produced == *current => Ok(current),
        Ok(produced) => {
            let new_state = Arc::new(produced.with_version(current.version() + 1));
            match inner.publisher.publish(Arc::clone(&new_state)).await {
                Ok(()) => {
                    *inner.state.write() = Arc::clone(&new_state);
                    update_cluster_state_version(new_state.version());
                    Ok(new_state)
                }
                Err(e) => {
                    warn!(
                        "publication of version {} failed, discarding: {e}",
                        new_state.version()
                    );
                    Err(e)
                }
            }
        }
    };
    let _ = task.ack.send(result);
}

/// Waits on the applied-state stream for a predicate to hold
pub struct StateObserver {
    rx: watch::Receiver<Arc<ClusterState>>,
}

impl StateObserver {
    pub fn new(rx: watch::Receiver<Arc<ClusterState>>) -> Self {
        Self { rx }
    }

    pub fn current(&self) -> Arc<ClusterState> {
        self.rx.borrow().clone()
    }

    /// Resolve once `predicate` holds on an applied state, or time out
    pub async fn wait_for<P>(&mut self, timeout: Duration, predicate: P) -> Result<Arc<ClusterState>>
    where
        P: Fn(&ClusterState) -> bool,
    {
        let wait = async {
            loop {
                let state = self.rx.borrow_and_update().clone();
                if predicate(&state) {
                    return Ok(state);
                }
                if self.rx.changed().await.is_err() {
                    return Err(ClusterError::Internal("state stream closed".into()));
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ClusterError::Timeout("condition not observed in time".into()))?
    }
}
