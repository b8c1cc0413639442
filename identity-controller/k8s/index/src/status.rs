//! Status patching.
//!
//! Reconciliation and discovery produce status patches as data; a single
//! lease-guarded task applies them against the API so there is exactly one
//! status writer per controller deployment.

use crate::{metrics::ControllerMetrics, ResourceId};
use chrono::{DateTime, Utc};
use identity_controller_k8s_api::{self as k8s, policy, Condition, Time};
use kubert::lease::Claim;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// The field manager every controller write uses.
pub const FIELD_MANAGER: &str = "identity-controller";

/// A queued status patch.
#[derive(Debug)]
pub struct Update {
    pub id: ResourceId,
    pub target: Target,
    pub patch: k8s::Patch<serde_json::Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
    Policy,
    Discovery,
}

/// Applies queued status patches while this instance holds the write lease.
pub struct Controller {
    claims: watch::Receiver<Arc<Claim>>,
    client: k8s::Client,
    name: String,
    updates: mpsc::Receiver<Update>,
    patch_timeout: tokio::time::Duration,
    metrics: ControllerMetrics,
}

// === impl Controller ===

impl Controller {
    pub fn new(
        claims: watch::Receiver<Arc<Claim>>,
        client: k8s::Client,
        name: String,
        updates: mpsc::Receiver<Update>,
        patch_timeout: tokio::time::Duration,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            claims,
            client,
            name,
            updates,
            patch_timeout,
            metrics,
        }
    }

    pub async fn run(mut self) {
        let params = k8s::PatchParams::apply(FIELD_MANAGER);

        while let Some(Update { id, target, patch }) = self.updates.recv().await {
            // Patches from a non-leader are dropped: the leader's periodic
            // resync regenerates them from the same watched state.
            if !self.claims.borrow_and_update().is_current_for(&self.name) {
                debug!(%id, "Skipping patch; not the leader");
                continue;
            }

            let patched = match target {
                Target::Policy => {
                    let api = k8s::Api::<policy::WorkloadIdentityPolicy>::namespaced(
                        self.client.clone(),
                        &id.namespace,
                    );
                    tokio::time::timeout(self.patch_timeout, api.patch_status(&id.name, &params, &patch))
                        .await
                        .map(|res| res.map(|_| ()))
                }
                Target::Discovery => {
                    let api = k8s::Api::<policy::CapabilityDiscovery>::namespaced(
                        self.client.clone(),
                        &id.namespace,
                    );
                    tokio::time::timeout(self.patch_timeout, api.patch_status(&id.name, &params, &patch))
                        .await
                        .map(|res| res.map(|_| ()))
                }
            };

            match patched {
                Ok(Ok(())) => {
                    self.metrics.patch_succeeded(target);
                    info!(%id, ?target, "Patched status");
                }
                Ok(Err(error)) => {
                    self.metrics.patch_failed(target);
                    warn!(%id, ?target, %error, "Failed to patch status");
                }
                Err(_) => {
                    self.metrics.patch_timed_out(target);
                    warn!(%id, ?target, "Status patch timed out");
                }
            }
        }
    }
}

/// Builds the merge patch for a policy's status sub-document.
pub fn make_policy_patch(
    status: &policy::WorkloadIdentityPolicyStatus,
) -> k8s::Patch<serde_json::Value> {
    k8s::Patch::Merge(serde_json::json!({ "status": status }))
}

/// Builds the merge patch for a discovery object's status sub-document.
pub fn make_discovery_patch(
    status: &policy::CapabilityDiscoveryStatus,
) -> k8s::Patch<serde_json::Value> {
    k8s::Patch::Merge(serde_json::json!({ "status": status }))
}

/// Builds a policy status with a single `Reconciled` condition.
pub fn policy_status(
    phase: policy::Phase,
    message: Option<String>,
    configured_pods: u32,
    observed_generation: Option<i64>,
    ready: ReadyFlags,
) -> policy::WorkloadIdentityPolicyStatus {
    let condition = Condition {
        last_transition_time: Time(now()),
        message: message.clone().unwrap_or_default(),
        observed_generation,
        reason: match phase {
            policy::Phase::Active => "Reconciled".to_string(),
            policy::Phase::Pending => "Pending".to_string(),
            policy::Phase::Error => "ReconcileFailed".to_string(),
        },
        status: if phase == policy::Phase::Active {
            "True".to_string()
        } else {
            "False".to_string()
        },
        type_: "Reconciled".to_string(),
    };

    policy::WorkloadIdentityPolicyStatus {
        phase,
        message,
        configured_pods,
        observed_generation,
        identity_ready: ready.identity,
        registration_ready: ready.registration,
        inbound_ready: ready.inbound,
        outbound_ready: ready.outbound,
        conditions: vec![condition],
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReadyFlags {
    pub identity: bool,
    pub registration: bool,
    pub inbound: bool,
    pub outbound: bool,
}

pub(crate) fn now() -> DateTime<Utc> {
    #[cfg(not(test))]
    {
        Utc::now()
    }
    #[cfg(test)]
    {
        DateTime::<Utc>::MIN_UTC
    }
}
