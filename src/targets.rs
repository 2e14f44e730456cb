//! Authoritative target set and worker task registry.
//!
//! Reconciliation is the only code path that starts or stops prober
//! tasks. Workers are addressed by destination and receive only a
//! cancellation token plus a watch channel carrying their target
//! snapshot; they hold no reference back into the registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::probe::ProbeTarget;
use crate::worker::{self, WorkerContext};

struct WorkerHandle {
    target: watch::Sender<ProbeTarget>,
    cancel: CancellationToken,
}

struct ManagerState {
    workers: HashMap<String, WorkerHandle>,
    version: u64,
}

pub struct TargetManager {
    ctx: WorkerContext,
    inner: Mutex<ManagerState>,
}

impl TargetManager {
    pub fn new(ctx: WorkerContext) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            inner: Mutex::new(ManagerState {
                workers: HashMap::new(),
                version: 0,
            }),
        })
    }

    /// Controller-reported version of the set currently running, as
    /// carried in every heartbeat.
    pub fn version(&self) -> u64 {
        self.inner.lock().unwrap().version
    }

    pub fn destinations(&self) -> Vec<String> {
        self.inner.lock().unwrap().workers.keys().cloned().collect()
    }

    /// Fetch the target list and align the running worker set with it.
    /// A failed fetch leaves the current set untouched; the next UPDATE
    /// retries.
    pub async fn reconcile(self: &Arc<Self>, version: u64) {
        info!(version, "updating targets from voyager server");
        let targets = match self.ctx.client.fetch_targets().await {
            Ok(targets) => targets,
            Err(err) => {
                warn!(%err, "unable to update targets");
                return;
            }
        };
        self.apply(targets, version);
    }

    /// The reconciliation critical section: cancel workers whose
    /// destination disappeared, start workers for new destinations, and
    /// push refreshed snapshots to survivors.
    pub fn apply(self: &Arc<Self>, targets: Vec<ProbeTarget>, version: u64) {
        let fetched: HashMap<String, ProbeTarget> = targets
            .into_iter()
            .map(|target| (target.destination.clone(), target))
            .collect();

        let mut state = self.inner.lock().unwrap();

        state.workers.retain(|destination, handle| {
            if fetched.contains_key(destination) {
                true
            } else {
                info!(%destination, "stopping prober task");
                handle.cancel.cancel();
                false
            }
        });

        for (destination, target) in fetched {
            match state.workers.get(&destination) {
                Some(handle) => {
                    // running task picks the new snapshot up on its next tick
                    let _ = handle.target.send(target);
                }
                None => {
                    info!(%destination, "starting prober task");
                    let (target_tx, target_rx) = watch::channel(target);
                    let cancel = CancellationToken::new();
                    tokio::spawn(worker::run(target_rx, cancel.clone(), self.ctx.clone()));
                    state.workers.insert(
                        destination,
                        WorkerHandle {
                            target: target_tx,
                            cancel,
                        },
                    );
                }
            }
        }

        state.version = version;
        debug!(version, running = state.workers.len(), "target set reconciled");
    }
}
