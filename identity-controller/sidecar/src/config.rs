use identity_controller_core::bundle::{
    IdentityConfig, InboundConfig, OutboundConfig, RegistrationConfig, SidecarConfig,
    IDENTITY_KEY, INBOUND_KEY, OUTBOUND_KEY, REGISTRATION_KEY,
};
use std::collections::BTreeMap;

/// The raw data of a rendered config bundle, keyed by role document name.
pub type BundleData = BTreeMap<String, String>;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("bundle is missing the {0} document")]
    MissingRole(&'static str),

    #[error("bundle document {role} is malformed: {source}")]
    InvalidRole {
        role: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Parses a complete bundle. Role documents tolerate unknown fields, but
/// every role must be present and well-formed; a partially usable bundle is
/// rejected whole so the chain never runs a mixed configuration.
pub fn parse_bundle(data: &BundleData) -> Result<SidecarConfig, ConfigError> {
    let identity: IdentityConfig = parse_role(data, IDENTITY_KEY)?;
    let registration: RegistrationConfig = parse_role(data, REGISTRATION_KEY)?;
    let inbound: InboundConfig = parse_role(data, INBOUND_KEY)?;
    let outbound: OutboundConfig = parse_role(data, OUTBOUND_KEY)?;

    Ok(SidecarConfig {
        identity,
        registration,
        inbound,
        outbound,
    })
}

fn parse_role<T: serde::de::DeserializeOwned>(
    data: &BundleData,
    role: &'static str,
) -> Result<T, ConfigError> {
    let doc = data.get(role).ok_or(ConfigError::MissingRole(role))?;
    serde_json::from_str(doc).map_err(|source| ConfigError::InvalidRole { role, source })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use identity_controller_core::bundle::ChainDefaults;

    pub(crate) fn defaults() -> ChainDefaults {
        ChainDefaults {
            trust_domain: "cluster.local".parse().unwrap(),
            broker_url: "http://keycloak.keycloak.svc.cluster.local:8080"
                .parse()
                .unwrap(),
            realm: "master".to_string(),
            issuer: "http://keycloak.keycloak.svc.cluster.local:8080/realms/master"
                .parse()
                .unwrap(),
            target_port: 8000,
            excluded_networks: vec![],
        }
    }

    pub(crate) fn bundle_for(config: &SidecarConfig) -> BundleData {
        [
            (IDENTITY_KEY, serde_json::to_string(&config.identity).unwrap()),
            (
                REGISTRATION_KEY,
                serde_json::to_string(&config.registration).unwrap(),
            ),
            (INBOUND_KEY, serde_json::to_string(&config.inbound).unwrap()),
            (OUTBOUND_KEY, serde_json::to_string(&config.outbound).unwrap()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }

    #[test]
    fn round_trips_a_rendered_bundle() {
        let config = SidecarConfig::defaults(&defaults(), "agents", "math-agent");
        let parsed = parse_bundle(&bundle_for(&config)).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn rejects_incomplete_bundles() {
        let config = SidecarConfig::defaults(&defaults(), "agents", "math-agent");
        let mut data = bundle_for(&config);
        data.remove(OUTBOUND_KEY);
        assert!(matches!(
            parse_bundle(&data),
            Err(ConfigError::MissingRole(OUTBOUND_KEY))
        ));
    }

    #[test]
    fn rejects_malformed_documents_whole() {
        let config = SidecarConfig::defaults(&defaults(), "agents", "math-agent");
        let mut data = bundle_for(&config);
        data.insert(INBOUND_KEY.to_string(), "{not json".to_string());
        assert!(matches!(
            parse_bundle(&data),
            Err(ConfigError::InvalidRole {
                role: INBOUND_KEY,
                ..
            })
        ));
    }
}
