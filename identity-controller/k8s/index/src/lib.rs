//! Identity controller reconciliation.
//!
//! The controller keeps a fleet of injected sidecar chains configured from
//! declarative `WorkloadIdentityPolicy` objects. It watches the following
//! cluster resources:
//!
//! - Each `WorkloadIdentityPolicy` names a workload via a duck-typed
//!   `targetRef` and carries identity, registration, inbound, and outbound
//!   sections.
//! - `Deployment`s, `StatefulSet`s, and `Job`s are indexed through the
//!   `PodTemplate` capability trait so policies can target any
//!   pod-template-carrying workload.
//! - `Pod`s are indexed to count chain-configured pods and to serve
//!   capability discovery.
//! - Rendered config bundles (`ConfigMap`s carrying our labels) are indexed
//!   so external mutations heal and orphans can be collected.
//!
//! ```text
//! [ WorkloadIdentityPolicy ] -> [ workload ] -> [ rendered bundle ] <- [ sidecars ]
//! ```
//!
//! Watch events mark policy keys dirty; the [`reconcile::Reconciler`] pulls
//! keys from the queue, computes a plan against the in-memory state, and
//! executes it: a server-side-applied bundle write followed by a status
//! patch through the lease-guarded [`status::Controller`]. Plans are pure
//! functions of the index, so every state transition is testable without an
//! API server.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod discovery;
pub mod gc;
mod index;
pub mod metrics;
pub mod reconcile;
pub mod render;
mod resolver;
mod resource_id;
pub mod status;

#[cfg(test)]
mod tests;

pub use self::{
    index::{Index, SharedIndex},
    resolver::{NotFound, PodTemplate, WorkloadMeta},
    resource_id::ResourceId,
};
use identity_controller_core::bundle::ChainDefaults;

/// Holds cluster metadata shared by every control loop.
#[derive(Clone, Debug)]
pub struct ClusterInfo {
    /// The namespace where the identity control plane is deployed.
    pub control_plane_ns: String,

    /// Defaults applied to workloads with no (or a partial) policy.
    pub chain: ChainDefaults,
}
