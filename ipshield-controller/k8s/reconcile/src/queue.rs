use crate::engine::Reconcile;
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use ipshield_controller_core::ResourceId;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    time::{sleep, Duration},
};

const BACKOFF_BASE: Duration = Duration::from_millis(250);
const BACKOFF_CAP: Duration = Duration::from_secs(300);

/// The single logical work queue delivering policy identities to a worker
/// pool. The engine performs no internal retries; all backoff lives here.
pub struct WorkQueue {
    tx: UnboundedSender<ResourceId>,
    rx: Arc<tokio::sync::Mutex<UnboundedReceiver<ResourceId>>>,
    state: Arc<Mutex<State>>,
}

/// The write half handed to event sources (the fan-out index).
#[derive(Clone)]
pub struct QueueHandle {
    tx: UnboundedSender<ResourceId>,
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    pending: HashSet<ResourceId>,
    inflight: HashSet<ResourceId>,
    dirty: HashSet<ResourceId>,
    attempts: HashMap<ResourceId, u32>,
}

impl QueueHandle {
    /// Enqueues a policy for reconciliation. Duplicate submissions of a
    /// pending key collapse into one; a key delivered while its reconcile is
    /// in flight is marked dirty and re-run once that pass completes.
    pub fn enqueue(&self, id: ResourceId) {
        let mut state = self.state.lock();
        if state.inflight.contains(&id) {
            state.dirty.insert(id);
            return;
        }
        if state.pending.insert(id.clone()) {
            // A send error means the pool is shutting down; the event is moot.
            let _ = self.tx.send(id);
        }
    }
}

impl WorkQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    pub fn handle(&self) -> QueueHandle {
        QueueHandle {
            tx: self.tx.clone(),
            state: self.state.clone(),
        }
    }

    /// Spawns the worker pool. Workers exit when every QueueHandle has been
    /// dropped and the channel drains.
    pub fn spawn_workers<R>(
        &self,
        workers: usize,
        reconciler: Arc<R>,
    ) -> Vec<tokio::task::JoinHandle<()>>
    where
        R: Reconcile + 'static,
    {
        (0..workers)
            .map(|worker| {
                let rx = self.rx.clone();
                let state = self.state.clone();
                let handle = self.handle();
                let reconciler = reconciler.clone();
                tokio::spawn(async move {
                    loop {
                        let id = {
                            let mut rx = rx.lock().await;
                            match rx.recv().await {
                                Some(id) => id,
                                None => return,
                            }
                        };
                        {
                            let mut state = state.lock();
                            state.pending.remove(&id);
                            state.inflight.insert(id.clone());
                        }

                        tracing::debug!(policy = %id, worker, "reconciling");
                        match reconciler.reconcile(&id).await {
                            Ok(()) => {
                                let rerun = {
                                    let mut state = state.lock();
                                    state.inflight.remove(&id);
                                    state.attempts.remove(&id);
                                    state.dirty.remove(&id)
                                };
                                if rerun {
                                    handle.enqueue(id);
                                }
                            }
                            Err(error) => {
                                let delay = {
                                    let mut state = state.lock();
                                    state.inflight.remove(&id);
                                    state.dirty.remove(&id);
                                    let attempts = state.attempts.entry(id.clone()).or_insert(0);
                                    *attempts += 1;
                                    backoff(*attempts)
                                };
                                tracing::warn!(
                                    policy = %id,
                                    %error,
                                    ?delay,
                                    "reconcile failed; requeueing"
                                );
                                let handle = handle.clone();
                                tokio::spawn(async move {
                                    sleep(delay).await;
                                    handle.enqueue(id);
                                });
                            }
                        }
                    }
                })
            })
            .collect()
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn backoff(attempts: u32) -> Duration {
    let exp = attempts.saturating_sub(1).min(16);
    BACKOFF_BASE.saturating_mul(1 << exp).min(BACKOFF_CAP)
}
