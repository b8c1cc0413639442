pub mod capability_discovery;
pub mod identity_policy;
pub mod target_ref;

pub use self::{
    capability_discovery::{
        CapabilityDiscovery, CapabilityDiscoverySpec, CapabilityDiscoveryStatus,
        CapabilityDocument, FetchOutcome, PodCapabilities,
    },
    identity_policy::{
        DestinationMatchSpec, ExchangeTargetSpec, IdentitySpec, InboundSpec, InterceptionSpec,
        OutboundRuleSpec, OutboundSpec, Phase, RegistrationSpec, WorkloadIdentityPolicy,
        WorkloadIdentityPolicySpec, WorkloadIdentityPolicyStatus,
    },
    target_ref::LocalTargetRef,
};

pub(crate) fn targets_kind<T>(group: Option<&str>, kind: &str) -> bool
where
    T: kube::Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();

    let mut t_group = &*T::group(&dt);
    if t_group.is_empty() {
        t_group = "core";
    }

    group.unwrap_or("core").eq_ignore_ascii_case(t_group)
        && kind.eq_ignore_ascii_case(&T::kind(&dt))
}
