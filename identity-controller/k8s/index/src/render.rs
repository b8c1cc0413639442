//! The config materializer.
//!
//! Rendering is a pure function from a policy spec (or no policy at all)
//! plus cluster defaults to a bundle: identical input always produces
//! byte-identical output, so bundle writes are idempotent and no-op changes
//! are detectable by digest alone. Invalid policy content fails the whole
//! render; a bundle is never partially written.

use identity_controller_core::{
    bundle::{
        ChainDefaults, SidecarConfig, IDENTITY_KEY, INBOUND_KEY, OUTBOUND_KEY, REGISTRATION_KEY,
        ROLE_KEYS,
    },
    inbound::InboundRules,
    outbound::{DestinationMatch, ExchangeRule, ExchangeRules, ExchangeTarget},
    spiffe_id,
};
use identity_controller_k8s_api::{self as k8s, policy};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// A rendered, ready-to-write bundle.
#[derive(Clone, Debug, PartialEq)]
pub struct RenderedBundle {
    /// The deterministic bundle name, derived from the workload name.
    pub name: String,
    pub namespace: String,
    pub workload: String,
    pub data: BTreeMap<String, String>,
    /// `sha256:<hex>` over the role documents in key order.
    pub digest: String,
    /// Whether the rendered registration document is enabled; used for the
    /// policy's registration readiness flag.
    pub registration_enabled: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("identity.trustDomain: {0}")]
    TrustDomain(String),

    #[error("registration.brokerUrl: {0}")]
    BrokerUrl(String),

    #[error("inbound.issuer: {0}")]
    Issuer(String),

    #[error("outbound.rules[{index}].match.host: {message}")]
    HostPattern { index: usize, message: String },

    #[error("outbound.default is required when outbound.rules is non-empty")]
    MissingOutboundDefault,

    #[error("outbound.interception.excludedNetworks[{index}]: not a valid CIDR")]
    ExcludedNetwork { index: usize },
}

/// Renders the bundle for a workload with no policy: pure defaults.
pub fn render_defaults(defaults: &ChainDefaults, ns: &str, workload: &str) -> RenderedBundle {
    finish(ns, workload, SidecarConfig::defaults(defaults, ns, workload))
}

/// Renders the bundle for a policy. Sections the policy omits fall back to
/// the injected defaults, so a partial policy is always safe.
pub fn render(
    spec: &policy::WorkloadIdentityPolicySpec,
    defaults: &ChainDefaults,
    ns: &str,
) -> Result<RenderedBundle, ValidationError> {
    let workload = spec.target_ref.name.as_str();
    let mut config = SidecarConfig::defaults(defaults, ns, workload);

    if let Some(identity) = &spec.identity {
        if let Some(td) = &identity.trust_domain {
            config.identity.trust_domain = td
                .parse()
                .map_err(|e: identity_controller_core::InvalidTrustDomain| {
                    ValidationError::TrustDomain(e.to_string())
                })?;
            config.identity.spiffe_id = spiffe_id(&config.identity.trust_domain, ns, workload);
        }
        if let Some(socket) = &identity.socket_path {
            config.identity.workload_api_socket = socket.clone();
        }
        if let Some(path) = &identity.token_path {
            config.identity.token_path = path.clone();
        }
        if let Some(audience) = &identity.audience {
            config.identity.audience = audience.clone();
        }
    }

    if let Some(registration) = &spec.registration {
        if let Some(url) = &registration.broker_url {
            config.registration.broker_url = url
                .parse()
                .map_err(|e: identity_controller_core::InvalidIssuer| {
                    ValidationError::BrokerUrl(e.to_string())
                })?;
        }
        if let Some(realm) = &registration.realm {
            config.registration.realm = realm.clone();
        }
        if let Some(template) = &registration.client_name_template {
            config.registration.client_name = template
                .replace("{namespace}", ns)
                .replace("{workload}", workload);
        }
        if let Some(path) = &registration.credentials_path {
            config.registration.credentials_path = path.clone();
        }
    }

    if let Some(inbound) = &spec.inbound {
        if let Some(port) = inbound.port {
            config.inbound.proxy_port = port;
        }
        if let Some(port) = inbound.target_port {
            config.inbound.target_port = port;
        }
        let issuer = match &inbound.issuer {
            Some(issuer) => issuer
                .parse()
                .map_err(|e: identity_controller_core::InvalidIssuer| {
                    ValidationError::Issuer(e.to_string())
                })?,
            None => config.inbound.rules.issuer.clone(),
        };
        config.inbound.rules = InboundRules {
            issuer,
            audience: inbound
                .audience
                .clone()
                .unwrap_or_else(|| config.identity.audience.clone()),
            required_scopes: inbound.required_scopes.iter().cloned().collect(),
        };
    }

    if let Some(outbound) = &spec.outbound {
        if let Some(interception) = &outbound.interception {
            let mut networks = Vec::with_capacity(interception.excluded_networks.len());
            for (index, net) in interception.excluded_networks.iter().enumerate() {
                networks.push(
                    net.parse()
                        .map_err(|_| ValidationError::ExcludedNetwork { index })?,
                );
            }
            config.outbound.interception.excluded_networks = networks;
            config.outbound.interception.excluded_ports = interception.excluded_ports.clone();
        }

        let mut rules = Vec::with_capacity(outbound.rules.len());
        for (index, rule) in outbound.rules.iter().enumerate() {
            let host = rule
                .destination
                .host
                .parse()
                .map_err(|e: identity_controller_core::outbound::InvalidHostMatch| {
                    ValidationError::HostPattern {
                        index,
                        message: e.to_string(),
                    }
                })?;
            rules.push(ExchangeRule {
                destination: DestinationMatch {
                    host,
                    port: rule.destination.port,
                },
                target: ExchangeTarget {
                    audience: rule.audience.clone(),
                    scopes: rule.scopes.clone(),
                },
            });
        }

        let default = match &outbound.default {
            Some(d) => ExchangeTarget {
                audience: d.audience.clone(),
                scopes: d.scopes.clone(),
            },
            None if rules.is_empty() => config.outbound.exchange.default_target().clone(),
            None => return Err(ValidationError::MissingOutboundDefault),
        };
        config.outbound.exchange = ExchangeRules::new(rules, default);
    }

    Ok(finish(ns, workload, config))
}

/// Builds the `ConfigMap` form of a rendered bundle for a server-side
/// apply. The whole object is replaced on every write, so readers always
/// observe a complete, self-consistent bundle.
pub fn to_config_map(bundle: &RenderedBundle, policy_name: &str) -> serde_json::Value {
    serde_json::json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {
            "name": bundle.name,
            "namespace": bundle.namespace,
            "labels": {
                k8s::BUNDLE_WORKLOAD_LABEL: bundle.workload,
                k8s::BUNDLE_POLICY_LABEL: policy_name,
            },
            "annotations": {
                k8s::BUNDLE_DIGEST_ANNOTATION: bundle.digest,
            },
        },
        "data": bundle.data,
    })
}

fn finish(ns: &str, workload: &str, config: SidecarConfig) -> RenderedBundle {
    let registration_enabled = config.registration.enabled;
    let data: BTreeMap<String, String> = [
        (IDENTITY_KEY, to_doc(&config.identity)),
        (REGISTRATION_KEY, to_doc(&config.registration)),
        (INBOUND_KEY, to_doc(&config.inbound)),
        (OUTBOUND_KEY, to_doc(&config.outbound)),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();

    let mut hasher = Sha256::new();
    for key in ROLE_KEYS {
        hasher.update(key.as_bytes());
        hasher.update(b"\n");
        hasher.update(data[key].as_bytes());
        hasher.update(b"\n");
    }

    RenderedBundle {
        name: k8s::bundle_name(workload),
        namespace: ns.to_string(),
        workload: workload.to_string(),
        data,
        digest: format!("sha256:{}", hex::encode(hasher.finalize())),
        registration_enabled,
    }
}

fn to_doc<T: serde::Serialize>(doc: &T) -> String {
    // Struct-ordered fields and BTreeMap keys make this deterministic.
    serde_json::to_string(doc).expect("role documents must serialize")
}
