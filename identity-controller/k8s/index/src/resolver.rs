//! Duck-typed workload resolution.
//!
//! Policies target workloads by `(group, kind, name)`. Rather than a type
//! switch in every caller, any resource that can hand out a pod template
//! implements [`PodTemplate`]; the index stores the extracted
//! [`WorkloadMeta`] and lookups go through the policy's `targetRef`.
//! Supporting a new workload kind means implementing the trait and adding a
//! watch, not editing the resolver's callers.

use identity_controller_k8s_api::{self as k8s, labels, Labels, ResourceExt};
use k8s_openapi::api::core::v1::PodTemplateSpec;

/// A workload-shaped resource the controller can configure: anything with
/// metadata and a pod template.
pub trait PodTemplate: kube::Resource + ResourceExt
where
    Self::DynamicType: Default,
{
    fn pod_template(&self) -> Option<&PodTemplateSpec>;

    /// The label selector its pods are expected to match, when the kind has
    /// one. Falls back to the template labels otherwise.
    fn pod_selector(&self) -> Option<&k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector>;

    fn replicas(&self) -> Option<i32> {
        None
    }

    /// The canonical `Kind.group` name used as the resolver key.
    fn canonical_kind() -> String {
        let dt = Self::DynamicType::default();
        let group = Self::group(&dt);
        if group.is_empty() {
            Self::kind(&dt).to_string()
        } else {
            format!("{}.{}", Self::kind(&dt), group)
        }
    }
}

/// The resolved view of a workload, detached from its concrete type.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkloadMeta {
    pub namespace: String,
    pub name: String,
    pub canonical_kind: String,
    pub pod_labels: labels::Map,
    pub replicas: Option<i32>,
}

/// Workload lookup failed; the target may simply not exist yet, so callers
/// treat this as retryable.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("workload {kind} {namespace}/{name} not found")]
pub struct NotFound {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

// === impl WorkloadMeta ===

impl WorkloadMeta {
    pub fn from_resource<T>(workload: &T) -> Self
    where
        T: PodTemplate,
        T::DynamicType: Default,
    {
        let pod_labels = workload
            .pod_selector()
            .and_then(|s| s.match_labels.clone())
            .or_else(|| {
                workload
                    .pod_template()
                    .and_then(|t| t.metadata.as_ref())
                    .and_then(|m| m.labels.clone())
            })
            .unwrap_or_default();

        Self {
            namespace: workload.namespace().unwrap_or_default(),
            name: workload.name_unchecked(),
            canonical_kind: T::canonical_kind(),
            pod_labels,
            replicas: workload.replicas(),
        }
    }

    /// Whether a pod (by label) belongs to this workload.
    pub fn selects(&self, pod_labels: &Labels) -> bool {
        !self.pod_labels.is_empty()
            && self
                .pod_labels
                .iter()
                .all(|(k, v)| pod_labels.get(k) == Some(v.as_str()))
    }
}

// === PodTemplate implementations ===

impl PodTemplate for k8s::Deployment {
    fn pod_template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|s| &s.template)
    }

    fn pod_selector(&self) -> Option<&k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector> {
        self.spec.as_ref().map(|s| &s.selector)
    }

    fn replicas(&self) -> Option<i32> {
        self.spec.as_ref().and_then(|s| s.replicas)
    }
}

impl PodTemplate for k8s::StatefulSet {
    fn pod_template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|s| &s.template)
    }

    fn pod_selector(&self) -> Option<&k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector> {
        self.spec.as_ref().map(|s| &s.selector)
    }

    fn replicas(&self) -> Option<i32> {
        self.spec.as_ref().and_then(|s| s.replicas)
    }
}

impl PodTemplate for k8s::Job {
    fn pod_template(&self) -> Option<&PodTemplateSpec> {
        self.spec.as_ref().map(|s| &s.template)
    }

    fn pod_selector(&self) -> Option<&k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector> {
        self.spec.as_ref().and_then(|s| s.selector.as_ref())
    }
}
