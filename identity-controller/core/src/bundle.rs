//! The rendered config bundle's wire format.
//!
//! A bundle holds one document per sidecar role. Each document mirrors the
//! corresponding policy section, fully resolved against defaults, so a
//! sidecar never needs to consult anything but its own role document. The
//! renderer and the sidecars share these types: what the controller writes
//! is exactly what the chain parses.

use crate::{
    inbound::InboundRules,
    outbound::{ExchangeRules, ExchangeTarget},
    spiffe_id, IpNet, Issuer, TrustDomain,
};

/// Bundle keys, one per sidecar role, in chain order.
pub const IDENTITY_KEY: &str = "identity.json";
pub const REGISTRATION_KEY: &str = "registration.json";
pub const INBOUND_KEY: &str = "inbound.json";
pub const OUTBOUND_KEY: &str = "outbound.json";

pub const ROLE_KEYS: [&str; 4] = [IDENTITY_KEY, REGISTRATION_KEY, INBOUND_KEY, OUTBOUND_KEY];

/// Local filesystem contracts between chain containers.
pub const WORKLOAD_API_SOCKET: &str = "unix:///spiffe-workload-api/spire-agent.sock";
pub const TOKEN_PATH: &str = "/opt/jwt_svid.token";
pub const CREDENTIALS_PATH: &str = "/shared/secret.txt";

/// Ports claimed by the injected chain on the pod's loopback.
pub const INBOUND_PROXY_PORT: u16 = 4143;
pub const EGRESS_PROXY_PORT: u16 = 4140;

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityConfig {
    pub trust_domain: TrustDomain,
    pub spiffe_id: String,
    pub workload_api_socket: String,
    pub token_path: String,
    pub audience: String,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationConfig {
    pub enabled: bool,
    pub broker_url: Issuer,
    pub realm: String,
    pub client_name: String,
    pub credentials_path: String,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundConfig {
    /// The port the validator listens on.
    pub proxy_port: u16,
    /// The application port validated requests are forwarded to.
    pub target_port: u16,
    pub rules: InboundRules,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterceptionConfig {
    /// The loopback port outbound connections are redirected to.
    pub redirect_port: u16,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_networks: Vec<IpNet>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_ports: Vec<u16>,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundConfig {
    pub interception: InterceptionConfig,
    pub exchange: ExchangeRules,
}

/// A fully resolved configuration for every role in the chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SidecarConfig {
    pub identity: IdentityConfig,
    pub registration: RegistrationConfig,
    pub inbound: InboundConfig,
    pub outbound: OutboundConfig,
}

/// Cluster-level defaults applied when a policy omits a section, and used
/// wholesale for workloads that have no policy at all.
#[derive(Clone, Debug)]
pub struct ChainDefaults {
    pub trust_domain: TrustDomain,
    pub broker_url: Issuer,
    pub realm: String,
    /// The issuer sidecars trust when no inbound section names one.
    pub issuer: Issuer,
    /// The application port inbound traffic is forwarded to.
    pub target_port: u16,
    /// Networks never routed through the egress proxy.
    pub excluded_networks: Vec<IpNet>,
}

// === impl SidecarConfig ===

impl SidecarConfig {
    /// The configuration injected workloads run with before any policy
    /// object exists: issue identity, register with the default broker,
    /// require tokens for the workload's own audience, and exchange every
    /// outbound call for the destination-host audience-less default.
    pub fn defaults(defaults: &ChainDefaults, ns: &str, workload: &str) -> Self {
        Self {
            identity: IdentityConfig {
                trust_domain: defaults.trust_domain.clone(),
                spiffe_id: spiffe_id(&defaults.trust_domain, ns, workload),
                workload_api_socket: WORKLOAD_API_SOCKET.to_string(),
                token_path: TOKEN_PATH.to_string(),
                audience: workload.to_string(),
            },
            registration: RegistrationConfig {
                enabled: true,
                broker_url: defaults.broker_url.clone(),
                realm: defaults.realm.clone(),
                client_name: format!("{ns}-{workload}"),
                credentials_path: CREDENTIALS_PATH.to_string(),
            },
            inbound: InboundConfig {
                proxy_port: INBOUND_PROXY_PORT,
                target_port: defaults.target_port,
                rules: InboundRules {
                    issuer: defaults.issuer.clone(),
                    audience: workload.to_string(),
                    required_scopes: Default::default(),
                },
            },
            outbound: OutboundConfig {
                interception: InterceptionConfig {
                    redirect_port: EGRESS_PROXY_PORT,
                    excluded_networks: defaults.excluded_networks.clone(),
                    excluded_ports: vec![],
                },
                exchange: ExchangeRules::new(
                    vec![],
                    ExchangeTarget {
                        audience: workload.to_string(),
                        scopes: vec![],
                    },
                ),
            },
        }
    }
}
