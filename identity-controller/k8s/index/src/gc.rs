//! Orphaned-bundle garbage collection.
//!
//! Deleting a policy leaves its rendered bundle in place so running
//! sidecars keep their configuration. This pass deletes bundles whose
//! policy has been gone for longer than the grace period. Orphan age is
//! tracked in memory from first observation; a recreated policy clears the
//! timer.

use crate::{ResourceId, SharedIndex};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use identity_controller_k8s_api::{self as k8s, ConfigMap};
use kubert::lease::Claim;
use std::sync::Arc;
use tokio::{sync::watch, time};
use tracing::{debug, info, warn};

pub struct GarbageCollector {
    index: SharedIndex,
    client: k8s::Client,
    claims: watch::Receiver<Arc<Claim>>,
    name: String,
    grace: time::Duration,
    interval: time::Duration,
    orphaned_at: HashMap<ResourceId, time::Instant>,
}

// === impl GarbageCollector ===

impl GarbageCollector {
    pub fn new(
        index: SharedIndex,
        client: k8s::Client,
        claims: watch::Receiver<Arc<Claim>>,
        name: String,
        grace: time::Duration,
        interval: time::Duration,
    ) -> Self {
        Self {
            index,
            client,
            claims,
            name,
            grace,
            interval,
            orphaned_at: HashMap::new(),
        }
    }

    pub async fn run(mut self) {
        let mut interval = time::interval(self.interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.sweep().await;
        }
    }

    async fn sweep(&mut self) {
        let orphans = self
            .index
            .read()
            .orphaned_bundles()
            .into_iter()
            .collect::<HashSet<_>>();
        let due = mark_due(&mut self.orphaned_at, orphans, time::Instant::now(), self.grace);

        if due.is_empty() {
            return;
        }
        if !self.claims.borrow_and_update().is_current_for(&self.name) {
            debug!("Skipping bundle collection; not the leader");
            return;
        }

        for id in due {
            let api = k8s::Api::<ConfigMap>::namespaced(self.client.clone(), &id.namespace);
            match api.delete(&id.name, &Default::default()).await {
                Ok(_) => {
                    info!(bundle = %id, "Collected orphaned bundle");
                    self.orphaned_at.remove(&id);
                }
                Err(k8s::Error::Api(e)) if e.code == 404 => {
                    self.orphaned_at.remove(&id);
                }
                Err(error) => {
                    // Left in the map, so the next sweep retries.
                    warn!(bundle = %id, %error, "Failed to collect orphaned bundle");
                }
            }
        }
    }
}

/// Updates the orphan age map with the currently orphaned set and returns
/// the bundles whose grace period has elapsed.
fn mark_due(
    orphaned_at: &mut HashMap<ResourceId, time::Instant>,
    orphans: HashSet<ResourceId>,
    now: time::Instant,
    grace: time::Duration,
) -> Vec<ResourceId> {
    // A policy that reappeared un-orphans its bundle.
    orphaned_at.retain(|id, _| orphans.contains(id));

    for id in orphans {
        orphaned_at.entry(id).or_insert(now);
    }

    orphaned_at
        .iter()
        .filter(|(_, since)| now.duration_since(**since) >= grace)
        .map(|(id, _)| id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> ResourceId {
        ResourceId::new("agents".to_string(), name.to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn orphans_survive_the_grace_period() {
        let grace = time::Duration::from_secs(300);
        let mut ages = HashMap::new();

        let t0 = time::Instant::now();
        let orphans: HashSet<_> = [id("a-identity-config")].into_iter().collect();
        assert!(
            mark_due(&mut ages, orphans.clone(), t0, grace).is_empty(),
            "a fresh orphan must not be collected"
        );

        // Still within the grace period.
        let t1 = t0 + time::Duration::from_secs(299);
        assert!(mark_due(&mut ages, orphans.clone(), t1, grace).is_empty());

        let t2 = t0 + grace;
        assert_eq!(
            mark_due(&mut ages, orphans, t2, grace),
            vec![id("a-identity-config")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn recreated_policy_resets_the_timer() {
        let grace = time::Duration::from_secs(300);
        let mut ages = HashMap::new();

        let t0 = time::Instant::now();
        let orphans: HashSet<_> = [id("a-identity-config")].into_iter().collect();
        mark_due(&mut ages, orphans, t0, grace);

        // The policy came back: the bundle is no longer orphaned.
        mark_due(&mut ages, HashSet::new(), t0 + time::Duration::from_secs(10), grace);

        // Orphaned again much later: the grace period starts over.
        let t1 = t0 + time::Duration::from_secs(600);
        let orphans: HashSet<_> = [id("a-identity-config")].into_iter().collect();
        assert!(mark_due(&mut ages, orphans, t1, grace).is_empty());
    }
}
