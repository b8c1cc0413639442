#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod labels;
pub mod policy;

pub use self::labels::Labels;
pub use k8s_openapi::{
    api::{
        self,
        apps::v1::{Deployment, StatefulSet},
        batch::v1::Job,
        core::v1::{ConfigMap, Container, Namespace, Pod, PodSpec, PodStatus, Volume},
    },
    apimachinery::pkg::apis::meta::v1::{Condition, Time},
};
pub use kube::{
    api::{Api, ListParams, ObjectMeta, Patch, PatchParams, Resource, ResourceExt},
    Client, Error,
};

/// The label a workload must carry to opt into sidecar injection.
pub const INJECT_LABEL: &str = "workloadidentity.io/inject";

/// The label a namespace must carry before any of its workloads may opt in.
pub const NAMESPACE_INJECT_LABEL: &str = "workloadidentity.io/injection";

/// The value both opt-in labels must hold.
pub const INJECT_ENABLED: &str = "enabled";

/// Labels stamped onto rendered config bundles.
pub const BUNDLE_WORKLOAD_LABEL: &str = "workloadidentity.io/workload";
pub const BUNDLE_POLICY_LABEL: &str = "workloadidentity.io/policy";

/// Annotation carrying the bundle content digest.
pub const BUNDLE_DIGEST_ANNOTATION: &str = "workloadidentity.io/digest";

/// Returns the deterministic bundle name for a workload, derived from the
/// workload name alone so renames need no mapping table.
pub fn bundle_name(workload: &str) -> String {
    format!("{workload}-identity-config")
}
