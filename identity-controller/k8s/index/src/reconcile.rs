//! The reconciliation loop.
//!
//! Policy keys marked dirty by the watch handlers are pulled from an
//! unbounded queue. Reconciliations for distinct keys run concurrently;
//! reconciliations for the same key are serialized by tracking in-flight
//! keys and deferring re-arrivals until the running attempt finishes, so a
//! key blocked on a slow API call never stalls unrelated policies. Failed
//! attempts requeue themselves with exponential backoff; the periodic
//! resync re-marks every key so missed events self-heal.

use crate::{
    index::Plan,
    metrics::ReconcileMetrics,
    render,
    status::{self, Update, FIELD_MANAGER},
    ResourceId, SharedIndex,
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use identity_controller_k8s_api::{self as k8s, ConfigMap};
use kubert::lease::Claim;
use std::sync::Arc;
use tokio::{
    sync::{mpsc, watch},
    task::JoinSet,
    time,
};
use tracing::{debug, info, warn};

const RETRY_BASE: time::Duration = time::Duration::from_secs(1);
const RETRY_CEILING: time::Duration = time::Duration::from_secs(120);

enum Wake {
    Resync,
    Change(ResourceId),
    Finished { id: ResourceId, retry: bool },
}

pub struct Reconciler {
    index: SharedIndex,
    client: k8s::Client,
    changes: mpsc::UnboundedReceiver<ResourceId>,
    /// Feeds delayed retries back into the queue.
    retries: mpsc::UnboundedSender<ResourceId>,
    updates: mpsc::Sender<Update>,
    claims: watch::Receiver<Arc<Claim>>,
    name: String,
    metrics: ReconcileMetrics,
    resync: time::Duration,
}

// === impl Reconciler ===

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: SharedIndex,
        client: k8s::Client,
        changes: mpsc::UnboundedReceiver<ResourceId>,
        retries: mpsc::UnboundedSender<ResourceId>,
        updates: mpsc::Sender<Update>,
        claims: watch::Receiver<Arc<Claim>>,
        name: String,
        metrics: ReconcileMetrics,
        resync: time::Duration,
    ) -> Self {
        Self {
            index,
            client,
            changes,
            retries,
            updates,
            claims,
            name,
            metrics,
            resync,
        }
    }

    pub async fn run(mut self) {
        let mut resync = time::interval(self.resync);
        resync.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        let mut tasks: JoinSet<(ResourceId, bool)> = JoinSet::new();
        let mut in_flight: HashSet<ResourceId> = HashSet::new();
        let mut deferred: HashSet<ResourceId> = HashSet::new();
        let mut failures: HashMap<ResourceId, u32> = HashMap::new();

        loop {
            let wake = tokio::select! {
                _ = resync.tick() => Wake::Resync,

                change = self.changes.recv() => match change {
                    Some(id) => Wake::Change(id),
                    // The index is gone; we are shutting down.
                    None => return,
                },

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    let (id, retry) = joined.expect("reconcile tasks must not panic");
                    Wake::Finished { id, retry }
                }
            };

            match wake {
                Wake::Resync => {
                    debug!("Resync");
                    self.index.read().enqueue_all();
                }

                Wake::Change(id) => {
                    self.schedule(id, &mut tasks, &mut in_flight, &mut deferred);
                }

                Wake::Finished { id, retry } => {
                    in_flight.remove(&id);

                    if retry {
                        let n = failures.entry(id.clone()).or_default();
                        *n = n.saturating_add(1);
                        let delay = backoff(*n);
                        debug!(%id, attempt = *n, ?delay, "Scheduling retry");
                        let retries = self.retries.clone();
                        let rid = id.clone();
                        tokio::spawn(async move {
                            time::sleep(delay).await;
                            let _ = retries.send(rid);
                        });
                    } else {
                        failures.remove(&id);
                    }

                    if deferred.remove(&id) {
                        self.schedule(id, &mut tasks, &mut in_flight, &mut deferred);
                    }
                }
            }
        }
    }

    fn schedule(
        &self,
        id: ResourceId,
        tasks: &mut JoinSet<(ResourceId, bool)>,
        in_flight: &mut HashSet<ResourceId>,
        deferred: &mut HashSet<ResourceId>,
    ) {
        if in_flight.contains(&id) {
            // At most one reconciliation per key runs at a time; the change
            // is picked up again when the current attempt finishes.
            deferred.insert(id);
            return;
        }
        in_flight.insert(id.clone());

        let index = self.index.clone();
        let client = self.client.clone();
        let updates = self.updates.clone();
        let metrics = self.metrics.clone();
        let leader = self.claims.borrow().is_current_for(&self.name);
        tasks.spawn(async move {
            let retry = reconcile(index, client, updates, metrics, leader, &id).await;
            (id, retry)
        });
    }
}

/// Runs one reconciliation attempt. Returns whether it should be retried.
async fn reconcile(
    index: SharedIndex,
    client: k8s::Client,
    updates: mpsc::Sender<Update>,
    metrics: ReconcileMetrics,
    leader: bool,
    id: &ResourceId,
) -> bool {
    // The plan is computed against the index without holding the lock
    // across any I/O.
    let plan = index.read().plan(id);

    match plan {
        Plan::Skip => {
            debug!(%id, "Policy gone; nothing to reconcile");
            false
        }

        Plan::Fail { status, retry } => {
            metrics.reconciled(if retry { "retryable" } else { "invalid" });
            info!(%id, phase = %status.phase, message = ?status.message, "Reconciliation failed");
            send_status(&updates, id, &status).await;
            retry
        }

        Plan::Apply {
            bundle,
            policy_name,
            status,
        } => {
            if !leader {
                // Followers keep their index warm but leave writes to the
                // lease holder.
                return false;
            }

            let api = k8s::Api::<ConfigMap>::namespaced(client, &bundle.namespace);
            let cm = render::to_config_map(&bundle, &policy_name);
            let params = k8s::PatchParams::apply(FIELD_MANAGER).force();
            match api.patch(&bundle.name, &params, &k8s::Patch::Apply(&cm)).await {
                Ok(_) => {
                    metrics.reconciled("applied");
                    info!(%id, bundle = %bundle.name, digest = %bundle.digest, "Wrote bundle");
                    send_status(&updates, id, &status).await;
                    false
                }
                Err(error) => {
                    metrics.reconciled("write-failed");
                    warn!(%id, bundle = %bundle.name, %error, "Failed to write bundle");
                    true
                }
            }
        }
    }
}

async fn send_status(
    updates: &mpsc::Sender<Update>,
    id: &ResourceId,
    status: &k8s::policy::WorkloadIdentityPolicyStatus,
) {
    let update = Update {
        id: id.clone(),
        target: status::Target::Policy,
        patch: status::make_policy_patch(status),
    };
    if updates.send(update).await.is_err() {
        warn!(%id, "Status controller is gone; dropping patch");
    }
}

fn backoff(failures: u32) -> time::Duration {
    let exp = failures.saturating_sub(1).min(16);
    RETRY_BASE
        .checked_mul(1u32 << exp)
        .unwrap_or(RETRY_CEILING)
        .min(RETRY_CEILING)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_exponential_with_a_ceiling() {
        assert_eq!(backoff(1), time::Duration::from_secs(1));
        assert_eq!(backoff(2), time::Duration::from_secs(2));
        assert_eq!(backoff(3), time::Duration::from_secs(4));
        assert_eq!(backoff(8), time::Duration::from_secs(120));
        assert_eq!(backoff(32), time::Duration::from_secs(120));
    }
}
