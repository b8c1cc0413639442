use super::LocalTargetRef;
use crate::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Describes the identity and token-exchange configuration for one workload.
///
/// Exactly one policy may target a given workload; the reconciler marks
/// later duplicates `Error`. Unknown fields are ignored for forward
/// compatibility.
#[derive(Clone, Debug, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "workloadidentity.io",
    version = "v1alpha1",
    kind = "WorkloadIdentityPolicy",
    status = "WorkloadIdentityPolicyStatus",
    shortname = "wip",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadIdentityPolicySpec {
    pub target_ref: LocalTargetRef,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<IdentitySpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration: Option<RegistrationSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inbound: Option<InboundSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbound: Option<OutboundSpec>,
}

/// Identity-issuance parameters.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IdentitySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_domain: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
}

/// Broker-registration parameters.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realm: Option<String>,

    /// Template for the broker-side client name. `{namespace}` and
    /// `{workload}` are substituted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name_template: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_path: Option<String>,
}

/// Inbound validation rules.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InboundSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_scopes: Vec<String>,
}

/// Outbound interception and token-exchange rules.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OutboundSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interception: Option<InterceptionSpec>,

    /// Ordered destination-match rules; the first match wins.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<OutboundRuleSpec>,

    /// The fallback applied when no rule matches. Required when `rules` is
    /// non-empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<ExchangeTargetSpec>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InterceptionSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_networks: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_ports: Vec<u16>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OutboundRuleSpec {
    #[serde(rename = "match")]
    pub destination: DestinationMatchSpec,

    pub audience: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DestinationMatchSpec {
    /// An exact host or a `*.` suffix wildcard.
    pub host: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeTargetSpec {
    pub audience: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
}

/// Status written by the reconciler.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadIdentityPolicyStatus {
    pub phase: Phase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default)]
    pub configured_pods: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default)]
    pub identity_ready: bool,

    #[serde(default)]
    pub registration_ready: bool,

    #[serde(default)]
    pub inbound_ready: bool,

    #[serde(default)]
    pub outbound_ready: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum Phase {
    #[default]
    Pending,
    Active,
    Error,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => "Pending".fmt(f),
            Self::Active => "Active".fmt(f),
            Self::Error => "Error".fmt(f),
        }
    }
}
