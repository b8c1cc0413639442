//! Builds the sidecar-chain patch for an admitted workload.
//!
//! The chain is appended with conservative defaults so an injected workload
//! is functional before any policy object exists; the rendered bundle only
//! ever changes the chain's configuration, never its shape.

use crate::core::bundle::{
    ChainDefaults, CREDENTIALS_PATH, EGRESS_PROXY_PORT, INBOUND_PROXY_PORT, TOKEN_PATH,
    WORKLOAD_API_SOCKET,
};
use crate::k8s::{Container, Volume};
use anyhow::{anyhow, bail, Context, Result};
use json_patch::{AddOperation, Patch, PatchOperation};
use k8s_openapi::api::core::v1::{
    CSIVolumeSource, Capabilities, EmptyDirVolumeSource, EnvVar, EnvVarSource,
    ObjectFieldSelector, PodSpec, SecurityContext, VolumeMount,
};
use kube::core::DynamicObject;

/// The fixed chain order: one init step, then the four sidecars.
pub(crate) const INIT_NAME: &str = "identity-init";
pub(crate) const AGENT_NAME: &str = "identity-agent";
pub(crate) const REGISTRAR_NAME: &str = "broker-registrar";
pub(crate) const VALIDATOR_NAME: &str = "inbound-validator";
pub(crate) const EGRESS_NAME: &str = "egress-exchange";

/// The UID the proxy sidecars run as; the init step exempts it from
/// redirection.
const PROXY_UID: i64 = 2102;

#[derive(Clone, Debug)]
pub struct InjectionConfig {
    pub registry: String,
    pub tag: String,
    pub chain: ChainDefaults,
}

/// Computes the injection patch for a workload-shaped object, or `None` if
/// the chain is already present. The pod template is located duck-typed:
/// `spec.template.spec` for workload kinds, `spec` for bare pods.
pub(crate) fn patch_for(
    obj: &DynamicObject,
    ns: &str,
    config: &InjectionConfig,
) -> Result<Option<Patch>> {
    let (prefix, spec_value) = locate_pod_spec(obj)?;
    let spec: PodSpec = serde_json::from_value(spec_value.clone())
        .with_context(|| format!("object has a malformed pod spec at {prefix}"))?;

    if spec.containers.iter().any(|c| c.name == AGENT_NAME) {
        return Ok(None);
    }

    let workload = obj
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| anyhow!("object has no name"))?;

    let mut containers = spec.containers.clone();
    containers.extend(sidecars(config, ns, workload));

    let mut init_containers = spec.init_containers.clone().unwrap_or_default();
    init_containers.push(init_container(config));

    let mut volumes = spec.volumes.clone().unwrap_or_default();
    volumes.extend(chain_volumes());

    let ops = vec![
        add(&format!("{prefix}/containers"), serde_json::to_value(&containers)?)?,
        add(
            &format!("{prefix}/initContainers"),
            serde_json::to_value(&init_containers)?,
        )?,
        add(&format!("{prefix}/volumes"), serde_json::to_value(&volumes)?)?,
    ];
    Ok(Some(Patch(ops)))
}

fn locate_pod_spec(obj: &DynamicObject) -> Result<(&'static str, &serde_json::Value)> {
    if let Some(spec) = obj.data.pointer("/spec/template/spec") {
        return Ok(("/spec/template/spec", spec));
    }
    if let Some(spec) = obj
        .data
        .pointer("/spec")
        .filter(|s| s.get("containers").map(|c| c.is_array()).unwrap_or(false))
    {
        return Ok(("/spec", spec));
    }
    bail!("object carries no pod template");
}

fn add(path: &str, value: serde_json::Value) -> Result<PatchOperation> {
    let path = path
        .parse()
        .map_err(|e| anyhow!("invalid patch path {path}: {e}"))?;
    Ok(PatchOperation::Add(AddOperation { path, value }))
}

fn image(config: &InjectionConfig, name: &str) -> String {
    format!("{}/{}:{}", config.registry, name, config.tag)
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        value_from: None,
    }
}

fn downward_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
    }
}

fn mount(name: &str, path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: Some(read_only),
        ..Default::default()
    }
}

fn proxy_security_context() -> SecurityContext {
    SecurityContext {
        run_as_user: Some(PROXY_UID),
        run_as_non_root: Some(true),
        ..Default::default()
    }
}

/// Environment shared by every bundle-watching sidecar.
fn bundle_env(workload: &str) -> Vec<EnvVar> {
    vec![
        env("CONFIG_BUNDLE", crate::k8s::bundle_name(workload)),
        downward_env("POD_NAMESPACE", "metadata.namespace"),
    ]
}

fn init_container(config: &InjectionConfig) -> Container {
    Container {
        name: INIT_NAME.to_string(),
        image: Some(image(config, INIT_NAME)),
        env: Some(vec![
            env("INBOUND_PROXY_PORT", INBOUND_PROXY_PORT.to_string()),
            env("EGRESS_PROXY_PORT", EGRESS_PROXY_PORT.to_string()),
            env("PROXY_UID", PROXY_UID.to_string()),
        ]),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            capabilities: Some(Capabilities {
                add: Some(vec!["NET_ADMIN".to_string()]),
                drop: None,
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn sidecars(config: &InjectionConfig, ns: &str, workload: &str) -> Vec<Container> {
    let chain = &config.chain;
    let issuer = chain.issuer.to_string();

    let agent = Container {
        name: AGENT_NAME.to_string(),
        image: Some(image(config, AGENT_NAME)),
        env: Some(
            [
                env("SPIFFE_ENDPOINT_SOCKET", WORKLOAD_API_SOCKET),
                env("JWT_SVID_PATH", TOKEN_PATH),
                env("JWT_AUDIENCE", workload),
                env("TRUST_DOMAIN", chain.trust_domain.to_string()),
            ]
            .into_iter()
            .chain(bundle_env(workload))
            .collect(),
        ),
        volume_mounts: Some(vec![
            mount("spiffe-workload-api", "/spiffe-workload-api", true),
            mount("identity-token", "/opt", false),
        ]),
        ..Default::default()
    };

    let registrar = Container {
        name: REGISTRAR_NAME.to_string(),
        image: Some(image(config, REGISTRAR_NAME)),
        env: Some(
            [
                env("KEYCLOAK_URL", chain.broker_url.to_string()),
                env("KEYCLOAK_REALM", chain.realm.clone()),
                env("CLIENT_NAME", format!("{ns}-{workload}")),
                env("SECRET_FILE_PATH", CREDENTIALS_PATH),
                env("JWT_SVID_PATH", TOKEN_PATH),
            ]
            .into_iter()
            .chain(bundle_env(workload))
            .collect(),
        ),
        volume_mounts: Some(vec![
            mount("identity-token", "/opt", true),
            mount("identity-credentials", "/shared", false),
        ]),
        ..Default::default()
    };

    let validator = Container {
        name: VALIDATOR_NAME.to_string(),
        image: Some(image(config, VALIDATOR_NAME)),
        env: Some(
            [
                env("PROXY_PORT", INBOUND_PROXY_PORT.to_string()),
                env("TARGET_PORT", chain.target_port.to_string()),
                env("ISSUER", issuer.clone()),
                env("AUDIENCE", workload),
            ]
            .into_iter()
            .chain(bundle_env(workload))
            .collect(),
        ),
        security_context: Some(proxy_security_context()),
        ..Default::default()
    };

    let egress = Container {
        name: EGRESS_NAME.to_string(),
        image: Some(image(config, EGRESS_NAME)),
        env: Some(
            [
                env("REDIRECT_PORT", EGRESS_PROXY_PORT.to_string()),
                env("KEYCLOAK_URL", chain.broker_url.to_string()),
                env("KEYCLOAK_REALM", chain.realm.clone()),
                env("JWT_SVID_PATH", TOKEN_PATH),
                env("SECRET_FILE_PATH", CREDENTIALS_PATH),
            ]
            .into_iter()
            .chain(bundle_env(workload))
            .collect(),
        ),
        security_context: Some(proxy_security_context()),
        volume_mounts: Some(vec![
            mount("identity-token", "/opt", true),
            mount("identity-credentials", "/shared", true),
        ]),
        ..Default::default()
    };

    vec![agent, registrar, validator, egress]
}

fn chain_volumes() -> Vec<Volume> {
    vec![
        Volume {
            name: "spiffe-workload-api".to_string(),
            csi: Some(CSIVolumeSource {
                driver: "csi.spiffe.io".to_string(),
                read_only: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: "identity-token".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
        Volume {
            name: "identity-credentials".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
    ]
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn injection_config() -> InjectionConfig {
        InjectionConfig {
            registry: "ghcr.io/workloadidentity".to_string(),
            tag: "dev".to_string(),
            chain: ChainDefaults {
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
            },
        }
    }

    pub(crate) fn deployment_object() -> DynamicObject {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": "math-agent",
                "namespace": "agents",
                "labels": {"workloadidentity.io/inject": "enabled"},
            },
            "spec": {
                "selector": {"matchLabels": {"app": "math-agent"}},
                "template": {
                    "metadata": {"labels": {"app": "math-agent"}},
                    "spec": {
                        "containers": [{"name": "app", "image": "math-agent:latest"}],
                    },
                },
            },
        }))
        .unwrap()
    }

    #[test]
    fn appends_the_chain_in_order() {
        let patch = patch_for(&deployment_object(), "agents", &injection_config())
            .unwrap()
            .expect("an uninjected workload must be patched");
        assert_eq!(patch.0.len(), 3);

        let PatchOperation::Add(op) = &patch.0[0] else {
            panic!("expected an add op");
        };
        let names: Vec<&str> = op.value.as_array().unwrap().iter()
            .map(|c| c["name"].as_str().unwrap())
            .collect();
        assert_eq!(
            names,
            ["app", AGENT_NAME, REGISTRAR_NAME, VALIDATOR_NAME, EGRESS_NAME],
            "sidecars are appended after the application containers, in chain order",
        );
    }

    #[test]
    fn a_second_pass_changes_nothing() {
        let mut obj = deployment_object();
        let patch = patch_for(&obj, "agents", &injection_config())
            .unwrap()
            .unwrap();
        json_patch::patch(&mut obj.data, &patch).unwrap();

        assert_eq!(
            patch_for(&obj, "agents", &injection_config()).unwrap(),
            None,
            "an already-injected workload must not be patched again",
        );
    }

    #[test]
    fn bare_pods_are_patched_at_the_spec_root() {
        let pod: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "one-off", "namespace": "agents"},
            "spec": {"containers": [{"name": "app"}]},
        }))
        .unwrap();
        let patch = patch_for(&pod, "agents", &injection_config())
            .unwrap()
            .unwrap();
        let PatchOperation::Add(op) = &patch.0[0] else {
            panic!("expected an add op");
        };
        assert_eq!(op.path.as_str(), "/spec/containers");
    }

    #[test]
    fn objects_without_a_pod_template_are_rejected() {
        let svc: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": "math-agent", "namespace": "agents"},
            "spec": {"ports": [{"port": 80}]},
        }))
        .unwrap();
        assert!(patch_for(&svc, "agents", &injection_config()).is_err());
    }
}
