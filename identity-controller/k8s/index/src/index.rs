//! The in-memory view of everything the reconciler needs, fed by
//! `kubert::index` watches and queried by the reconcile, GC, and discovery
//! loops. Watch handlers only mutate state and mark policy keys dirty; all
//! I/O happens in the loops, so a blocked write never stalls indexing.

use crate::{
    render::{self, RenderedBundle},
    resolver::{NotFound, PodTemplate, WorkloadMeta},
    status::{self, ReadyFlags},
    ClusterInfo, ResourceId,
};
use ahash::AHashMap as HashMap;
use identity_controller_k8s_api::{self as k8s, policy, Labels, ResourceExt};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

pub type SharedIndex = Arc<RwLock<Index>>;

pub struct Index {
    cluster_info: Arc<ClusterInfo>,

    policies: HashMap<ResourceId, PolicyMeta>,

    /// Workloads by namespace, canonical kind, and name.
    workloads: HashMap<WorkloadKey, WorkloadMeta>,

    pods: HashMap<ResourceId, PodMeta>,

    /// Rendered bundles observed in the cluster, for healing and GC.
    bundles: HashMap<ResourceId, BundleMeta>,

    discoveries: HashMap<ResourceId, policy::CapabilityDiscoverySpec>,

    /// Marks policy keys dirty for the reconciler.
    changes: mpsc::UnboundedSender<ResourceId>,
}

#[derive(Clone, Debug)]
pub(crate) struct PolicyMeta {
    pub spec: policy::WorkloadIdentityPolicySpec,
    pub generation: Option<i64>,
    pub created: Option<k8s::Time>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct WorkloadKey {
    pub namespace: String,
    pub canonical_kind: String,
    pub name: String,
}

#[derive(Clone, Debug)]
pub(crate) struct PodMeta {
    pub labels: Labels,
    pub ip: Option<String>,
    pub ready: bool,
    /// Whether the pod carries the injected chain.
    pub injected: bool,
}

#[derive(Clone, Debug)]
pub(crate) struct BundleMeta {
    pub policy: Option<String>,
    #[allow(dead_code)]
    pub digest: Option<String>,
}

/// What one reconciliation of a policy should do. Computed without I/O.
#[derive(Clone, Debug, PartialEq)]
pub enum Plan {
    /// The policy no longer exists; nothing to do.
    Skip,

    /// The policy cannot be rendered; report status. `retry` distinguishes
    /// transient conditions (target not found) from terminal ones
    /// (validation failures, duplicate targets).
    Fail {
        status: policy::WorkloadIdentityPolicyStatus,
        retry: bool,
    },

    /// Write the bundle, then report status.
    Apply {
        bundle: RenderedBundle,
        policy_name: String,
        status: policy::WorkloadIdentityPolicyStatus,
    },
}

/// The name of the token-acquisition sidecar; its presence marks a pod as
/// carrying the chain.
const CHAIN_MARKER_CONTAINER: &str = "identity-agent";

// === impl Index ===

impl Index {
    pub fn shared(cluster_info: ClusterInfo) -> (SharedIndex, mpsc::UnboundedReceiver<ResourceId>) {
        let (changes, rx) = mpsc::unbounded_channel();
        let index = Self {
            cluster_info: Arc::new(cluster_info),
            policies: HashMap::new(),
            workloads: HashMap::new(),
            pods: HashMap::new(),
            bundles: HashMap::new(),
            discoveries: HashMap::new(),
            changes,
        };
        (Arc::new(RwLock::new(index)), rx)
    }

    pub fn cluster_info(&self) -> &ClusterInfo {
        &self.cluster_info
    }

    /// A sender that marks policy keys dirty, used for delayed retries.
    pub fn change_feed(&self) -> mpsc::UnboundedSender<ResourceId> {
        self.changes.clone()
    }

    pub fn policy_ids(&self) -> Vec<ResourceId> {
        self.policies.keys().cloned().collect()
    }

    fn enqueue(&self, id: ResourceId) {
        trace!(%id, "Marking dirty");
        // The receiver only closes at shutdown.
        let _ = self.changes.send(id);
    }

    /// Marks every policy dirty, used by the periodic resync.
    pub fn enqueue_all(&self) {
        for id in self.policies.keys() {
            self.enqueue(id.clone());
        }
    }

    /// Computes what a reconciliation of `id` should do right now.
    pub fn plan(&self, id: &ResourceId) -> Plan {
        let Some(policy) = self.policies.get(id) else {
            return Plan::Skip;
        };
        let spec = &policy.spec;

        // Exactly one policy may target a workload; the oldest one wins and
        // newer duplicates surface an error instead of fighting over the
        // bundle.
        if let Some(winner) = self.duplicate_winner(id, spec) {
            if winner != *id {
                return Plan::Fail {
                    status: status::policy_status(
                        policy::Phase::Error,
                        Some(format!(
                            "workload {} is already targeted by policy {}",
                            spec.target_ref.name, winner.name,
                        )),
                        0,
                        policy.generation,
                        ReadyFlags::default(),
                    ),
                    retry: false,
                };
            }
        }

        let workload = match self.resolve(&id.namespace, &spec.target_ref) {
            Ok(workload) => workload,
            Err(NotFound {
                kind,
                namespace,
                name,
            }) => {
                return Plan::Fail {
                    status: status::policy_status(
                        policy::Phase::Error,
                        Some(format!("workload {kind} {namespace}/{name} not found")),
                        0,
                        policy.generation,
                        ReadyFlags::default(),
                    ),
                    retry: true,
                };
            }
        };

        let bundle = match render::render(spec, &self.cluster_info.chain, &id.namespace) {
            Ok(bundle) => bundle,
            Err(error) => {
                return Plan::Fail {
                    status: status::policy_status(
                        policy::Phase::Error,
                        Some(error.to_string()),
                        0,
                        policy.generation,
                        ReadyFlags::default(),
                    ),
                    retry: false,
                };
            }
        };

        let (configured, ready) = self.chain_pods(&id.namespace, workload);
        let healthy = ready > 0 || workload.replicas == Some(0);
        let status = status::policy_status(
            policy::Phase::Active,
            None,
            configured,
            policy.generation,
            ReadyFlags {
                identity: healthy,
                registration: healthy && bundle.registration_enabled,
                inbound: healthy,
                outbound: healthy,
            },
        );

        Plan::Apply {
            bundle,
            policy_name: id.name.clone(),
            status,
        }
    }

    /// Resolves a duck-typed target reference against the indexed workloads.
    pub fn resolve(
        &self,
        ns: &str,
        target: &policy::LocalTargetRef,
    ) -> Result<&WorkloadMeta, NotFound> {
        self.workloads
            .iter()
            .find(|(key, _)| key.namespace == ns && target_matches(target, key))
            .map(|(_, meta)| meta)
            .ok_or_else(|| NotFound {
                kind: target.canonical_kind(),
                namespace: ns.to_string(),
                name: target.name.clone(),
            })
    }

    /// Counts (injected, injected-and-ready) pods belonging to a workload.
    fn chain_pods(&self, ns: &str, workload: &WorkloadMeta) -> (u32, u32) {
        let mut injected = 0;
        let mut ready = 0;
        for (id, pod) in &self.pods {
            if id.namespace == ns && pod.injected && workload.selects(&pod.labels) {
                injected += 1;
                if pod.ready {
                    ready += 1;
                }
            }
        }
        (injected, ready)
    }

    /// The oldest (then lexicographically first) policy targeting the same
    /// workload as `spec`, including `id` itself.
    fn duplicate_winner(
        &self,
        id: &ResourceId,
        spec: &policy::WorkloadIdentityPolicySpec,
    ) -> Option<ResourceId> {
        self.policies
            .iter()
            .filter(|(pid, p)| {
                pid.namespace == id.namespace && same_target(&p.spec.target_ref, &spec.target_ref)
            })
            .min_by(|(a_id, a), (b_id, b)| {
                creation_key(a).cmp(&creation_key(b)).then(a_id.cmp(b_id))
            })
            .map(|(pid, _)| pid.clone())
    }

    /// Policies in a namespace whose target matches the given workload.
    fn policies_for_workload(&self, key: &WorkloadKey) -> Vec<ResourceId> {
        self.policies
            .iter()
            .filter(|(pid, p)| pid.namespace == key.namespace && target_matches(&p.spec.target_ref, key))
            .map(|(pid, _)| pid.clone())
            .collect()
    }

    fn apply_workload<T>(&mut self, workload: T)
    where
        T: PodTemplate,
        T::DynamicType: Default,
    {
        let meta = WorkloadMeta::from_resource(&workload);
        let key = WorkloadKey {
            namespace: meta.namespace.clone(),
            canonical_kind: meta.canonical_kind.clone(),
            name: meta.name.clone(),
        };
        debug!(workload = %key.name, kind = %key.canonical_kind, "Indexing workload");
        self.workloads.insert(key.clone(), meta);
        for id in self.policies_for_workload(&key) {
            self.enqueue(id);
        }
    }

    fn delete_workload<T>(&mut self, namespace: String, name: String)
    where
        T: PodTemplate,
        T::DynamicType: Default,
    {
        let key = WorkloadKey {
            namespace,
            canonical_kind: T::canonical_kind(),
            name,
        };
        if self.workloads.remove(&key).is_some() {
            for id in self.policies_for_workload(&key) {
                self.enqueue(id);
            }
        }
    }

    // Accessors for the discovery and GC loops.

    pub(crate) fn discoveries(&self) -> Vec<(ResourceId, policy::CapabilityDiscoverySpec)> {
        self.discoveries
            .iter()
            .map(|(id, spec)| (id.clone(), spec.clone()))
            .collect()
    }

    pub(crate) fn pods_matching(
        &self,
        ns: &str,
        selector: &k8s::labels::Selector,
    ) -> Vec<(String, Option<String>, bool)> {
        let mut pods = self
            .pods
            .iter()
            .filter(|(id, pod)| id.namespace == ns && selector.matches(&pod.labels))
            .map(|(id, pod)| (id.name.clone(), pod.ip.clone(), pod.ready))
            .collect::<Vec<_>>();
        pods.sort();
        pods
    }

    pub(crate) fn orphaned_bundles(&self) -> Vec<ResourceId> {
        self.bundles
            .iter()
            .filter(|(id, meta)| match &meta.policy {
                Some(policy) => !self
                    .policies
                    .contains_key(&ResourceId::new(id.namespace.clone(), policy.clone())),
                // A bundle without a policy label was never ours to manage.
                None => false,
            })
            .map(|(id, _)| id.clone())
            .collect()
    }
}

fn creation_key(policy: &PolicyMeta) -> chrono::DateTime<chrono::Utc> {
    policy
        .created
        .as_ref()
        .map(|t| t.0)
        .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC)
}

/// Whether a target ref names the given workload key, matching the kind and
/// optional group case-insensitively.
fn target_matches(target: &policy::LocalTargetRef, key: &WorkloadKey) -> bool {
    if !target.name.eq_ignore_ascii_case(&key.name) {
        return false;
    }
    let (kind, group) = match key.canonical_kind.split_once('.') {
        Some((kind, group)) => (kind, Some(group)),
        None => (key.canonical_kind.as_str(), None),
    };
    if !target.kind.eq_ignore_ascii_case(kind) {
        return false;
    }
    match (target.group.as_deref(), group) {
        (None, _) => true,
        (Some(tg), Some(g)) => tg.eq_ignore_ascii_case(g),
        (Some(tg), None) => tg.is_empty() || tg.eq_ignore_ascii_case("core"),
    }
}

/// Whether two target refs name the same workload.
fn same_target(a: &policy::LocalTargetRef, b: &policy::LocalTargetRef) -> bool {
    a.name.eq_ignore_ascii_case(&b.name)
        && a.kind.eq_ignore_ascii_case(&b.kind)
        && normalized_group(a) == normalized_group(b)
}

fn normalized_group(t: &policy::LocalTargetRef) -> String {
    t.group
        .as_deref()
        .filter(|g| !g.is_empty() && !g.eq_ignore_ascii_case("core"))
        .map(|g| g.to_ascii_lowercase())
        .unwrap_or_default()
}

// === Watch handlers ===

impl kubert::index::IndexNamespacedResource<policy::WorkloadIdentityPolicy> for Index {
    fn apply(&mut self, resource: policy::WorkloadIdentityPolicy) {
        let namespace = resource.namespace().unwrap_or_default();
        let name = resource.name_unchecked();
        let id = ResourceId::new(namespace, name);
        debug!(%id, "Indexing policy");

        let meta = PolicyMeta {
            spec: resource.spec,
            generation: resource.metadata.generation,
            created: resource.metadata.creation_timestamp.clone(),
        };

        // A target change affects the policies contending for both the old
        // and the new target.
        let affected = self
            .policies
            .insert(id.clone(), meta.clone())
            .map(|old| old.spec.target_ref)
            .into_iter()
            .chain(Some(meta.spec.target_ref.clone()))
            .flat_map(|target| {
                self.policies
                    .iter()
                    .filter(|(pid, p)| {
                        pid.namespace == id.namespace && same_target(&p.spec.target_ref, &target)
                    })
                    .map(|(pid, _)| pid.clone())
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>();

        for pid in affected {
            self.enqueue(pid);
        }
        self.enqueue(id);
    }

    fn delete(&mut self, namespace: String, name: String) {
        let id = ResourceId::new(namespace, name);
        if let Some(old) = self.policies.remove(&id) {
            debug!(%id, "Forgetting policy");
            // A duplicate that was losing to this policy may now win.
            let contenders = self
                .policies
                .iter()
                .filter(|(pid, p)| {
                    pid.namespace == id.namespace
                        && same_target(&p.spec.target_ref, &old.spec.target_ref)
                })
                .map(|(pid, _)| pid.clone())
                .collect::<Vec<_>>();
            for pid in contenders {
                self.enqueue(pid);
            }
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Deployment> for Index {
    fn apply(&mut self, resource: k8s::Deployment) {
        self.apply_workload(resource);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.delete_workload::<k8s::Deployment>(namespace, name);
    }
}

impl kubert::index::IndexNamespacedResource<k8s::StatefulSet> for Index {
    fn apply(&mut self, resource: k8s::StatefulSet) {
        self.apply_workload(resource);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.delete_workload::<k8s::StatefulSet>(namespace, name);
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Job> for Index {
    fn apply(&mut self, resource: k8s::Job) {
        self.apply_workload(resource);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.delete_workload::<k8s::Job>(namespace, name);
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Pod> for Index {
    fn apply(&mut self, resource: k8s::Pod) {
        let namespace = resource.namespace().unwrap_or_default();
        let name = resource.name_unchecked();
        let id = ResourceId::new(namespace.clone(), name);

        let injected = resource
            .spec
            .as_ref()
            .map(|spec| {
                spec.containers
                    .iter()
                    .any(|c| c.name == CHAIN_MARKER_CONTAINER)
            })
            .unwrap_or(false);
        let ready = resource
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .map(|conds| {
                conds
                    .iter()
                    .any(|c| c.type_ == "Ready" && c.status == "True")
            })
            .unwrap_or(false);
        let ip = resource.status.as_ref().and_then(|s| s.pod_ip.clone());

        self.pods.insert(
            id,
            PodMeta {
                labels: resource.metadata.labels.clone().into(),
                ip,
                ready,
                injected,
            },
        );

        // Pod churn changes configured-pod counts for policies in this
        // namespace.
        let affected = self
            .policies
            .keys()
            .filter(|pid| pid.namespace == namespace)
            .cloned()
            .collect::<Vec<_>>();
        for pid in affected {
            self.enqueue(pid);
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        let id = ResourceId::new(namespace.clone(), name);
        if self.pods.remove(&id).is_some() {
            let affected = self
                .policies
                .keys()
                .filter(|pid| pid.namespace == namespace)
                .cloned()
                .collect::<Vec<_>>();
            for pid in affected {
                self.enqueue(pid);
            }
        }
    }
}

impl kubert::index::IndexNamespacedResource<k8s::ConfigMap> for Index {
    fn apply(&mut self, resource: k8s::ConfigMap) {
        // Only bundles the controller manages are indexed.
        if !resource.labels().contains_key(k8s::BUNDLE_WORKLOAD_LABEL) {
            return;
        }
        let namespace = resource.namespace().unwrap_or_default();
        let name = resource.name_unchecked();
        let id = ResourceId::new(namespace.clone(), name);

        let policy = resource.labels().get(k8s::BUNDLE_POLICY_LABEL).cloned();
        let digest = resource
            .annotations()
            .get(k8s::BUNDLE_DIGEST_ANNOTATION)
            .cloned();

        self.bundles.insert(id, BundleMeta { policy: policy.clone(), digest });

        // Heal external edits: re-enqueue the owning policy so the next
        // reconciliation rewrites any drift.
        if let Some(policy) = policy {
            let pid = ResourceId::new(namespace, policy);
            if self.policies.contains_key(&pid) {
                self.enqueue(pid);
            }
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        let id = ResourceId::new(namespace.clone(), name);
        if let Some(meta) = self.bundles.remove(&id) {
            if let Some(policy) = meta.policy {
                let pid = ResourceId::new(namespace, policy);
                if self.policies.contains_key(&pid) {
                    self.enqueue(pid);
                }
            }
        }
    }
}

impl kubert::index::IndexNamespacedResource<policy::CapabilityDiscovery> for Index {
    fn apply(&mut self, resource: policy::CapabilityDiscovery) {
        let namespace = resource.namespace().unwrap_or_default();
        let name = resource.name_unchecked();
        self.discoveries
            .insert(ResourceId::new(namespace, name), resource.spec);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.discoveries.remove(&ResourceId::new(namespace, name));
    }
}
