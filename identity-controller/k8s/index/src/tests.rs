use crate::{
    discovery::{CapabilityFetcher, DiscoveryReconciler},
    index::Plan,
    render,
    status::Target,
    ClusterInfo, Index, ResourceId, SharedIndex,
};
use identity_controller_core::bundle::{ChainDefaults, INBOUND_KEY, OUTBOUND_KEY};
use identity_controller_k8s_api::{self as k8s, policy, ObjectMeta, Time};
use k8s_openapi::api::apps::v1::DeploymentSpec;
use k8s_openapi::api::core::v1::PodCondition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kubert::index::IndexNamespacedResource;
use tokio::sync::mpsc;

fn delete_policy(idx: &SharedIndex, ns: &str, name: &str) {
    let mut w = idx.write();
    <Index as IndexNamespacedResource<policy::WorkloadIdentityPolicy>>::delete(
        &mut w,
        ns.to_string(),
        name.to_string(),
    );
}

fn cluster_info() -> ClusterInfo {
    ClusterInfo {
        control_plane_ns: "identity-system".to_string(),
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
            excluded_networks: vec!["169.254.0.0/16".parse().unwrap()],
        },
    }
}

fn index() -> SharedIndex {
    Index::shared(cluster_info()).0
}

fn policy_id(name: &str) -> ResourceId {
    ResourceId::new("agents".to_string(), name.to_string())
}

fn mk_policy(name: &str, target: &str, created_secs: i64) -> policy::WorkloadIdentityPolicy {
    policy::WorkloadIdentityPolicy {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("agents".to_string()),
            generation: Some(1),
            creation_timestamp: Some(Time(
                chrono::DateTime::from_timestamp(created_secs, 0).unwrap(),
            )),
            ..Default::default()
        },
        spec: policy::WorkloadIdentityPolicySpec {
            target_ref: policy::LocalTargetRef {
                group: Some("apps".to_string()),
                kind: "Deployment".to_string(),
                name: target.to_string(),
            },
            identity: None,
            registration: None,
            inbound: None,
            outbound: None,
        },
        status: None,
    }
}

fn mk_deployment(name: &str) -> k8s::Deployment {
    k8s::Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("agents".to_string()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some([("app".to_string(), name.to_string())].into_iter().collect()),
                ..Default::default()
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mk_pod(name: &str, app: &str, injected: bool, ready: bool) -> k8s::Pod {
    let mut containers = vec![k8s_openapi::api::core::v1::Container {
        name: "app".to_string(),
        ..Default::default()
    }];
    if injected {
        containers.push(k8s_openapi::api::core::v1::Container {
            name: "identity-agent".to_string(),
            ..Default::default()
        });
    }
    k8s::Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("agents".to_string()),
            labels: Some([("app".to_string(), app.to_string())].into_iter().collect()),
            ..Default::default()
        },
        spec: Some(k8s::PodSpec {
            containers,
            ..Default::default()
        }),
        status: Some(k8s::PodStatus {
            pod_ip: Some("10.0.0.7".to_string()),
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

#[test]
fn rendering_is_deterministic_and_idempotent() {
    let mut policy = mk_policy("math-agent-policy", "math-agent", 100);
    policy.spec.inbound = Some(policy::InboundSpec {
        required_scopes: vec!["agent:invoke".to_string()],
        ..Default::default()
    });
    policy.spec.outbound = Some(policy::OutboundSpec {
        interception: None,
        rules: vec![
            policy::OutboundRuleSpec {
                destination: policy::DestinationMatchSpec {
                    host: "api.example.com".to_string(),
                    port: None,
                },
                audience: "x".to_string(),
                scopes: vec![],
            },
            policy::OutboundRuleSpec {
                destination: policy::DestinationMatchSpec {
                    host: "*.example.com".to_string(),
                    port: None,
                },
                audience: "y".to_string(),
                scopes: vec![],
            },
        ],
        default: Some(policy::ExchangeTargetSpec {
            audience: "fallback".to_string(),
            scopes: vec![],
        }),
    });

    let defaults = cluster_info().chain;
    let a = render::render(&policy.spec, &defaults, "agents").unwrap();
    let b = render::render(&policy.spec, &defaults, "agents").unwrap();
    assert_eq!(a.data, b.data, "re-rendering must be byte-identical");
    assert_eq!(a.digest, b.digest);

    // The ordered rule list survives rendering: the first-listed rule stays
    // first in the outbound document.
    let outbound = &a.data[OUTBOUND_KEY];
    let x_at = outbound.find("\"audience\":\"x\"").unwrap();
    let y_at = outbound.find("\"audience\":\"y\"").unwrap();
    assert!(x_at < y_at);

    assert!(a.data[INBOUND_KEY].contains("agent:invoke"));
    assert_eq!(a.name, "math-agent-identity-config");
}

#[test]
fn an_empty_policy_renders_the_injected_defaults() {
    let policy = mk_policy("math-agent-policy", "math-agent", 100);
    let defaults = cluster_info().chain;
    let rendered = render::render(&policy.spec, &defaults, "agents").unwrap();
    let fallback = render::render_defaults(&defaults, "agents", "math-agent");
    assert_eq!(
        rendered.data, fallback.data,
        "a policy with no sections must render exactly the defaults"
    );
    assert_eq!(rendered.digest, fallback.digest);
}

#[test]
fn missing_outbound_default_is_a_validation_error() {
    let mut policy = mk_policy("math-agent-policy", "math-agent", 100);
    policy.spec.outbound = Some(policy::OutboundSpec {
        interception: None,
        rules: vec![policy::OutboundRuleSpec {
            destination: policy::DestinationMatchSpec {
                host: "api.example.com".to_string(),
                port: None,
            },
            audience: "x".to_string(),
            scopes: vec![],
        }],
        default: None,
    });
    assert_eq!(
        render::render(&policy.spec, &cluster_info().chain, "agents"),
        Err(render::ValidationError::MissingOutboundDefault),
    );
}

#[test]
fn policy_without_target_goes_to_error_then_active() {
    let idx = index();
    idx.write().apply(mk_policy("math-agent-policy", "math-agent", 100));

    let id = policy_id("math-agent-policy");
    match idx.read().plan(&id) {
        Plan::Fail { status, retry } => {
            assert!(retry, "a missing target is retryable");
            assert_eq!(status.phase, policy::Phase::Error);
            assert!(status.message.unwrap().contains("not found"));
        }
        plan => panic!("expected Fail, got {plan:?}"),
    }

    // The deployment shows up: the next plan renders.
    idx.write().apply(mk_deployment("math-agent"));
    match idx.read().plan(&id) {
        Plan::Apply { bundle, status, .. } => {
            assert_eq!(status.phase, policy::Phase::Active);
            assert_eq!(bundle.namespace, "agents");
        }
        plan => panic!("expected Apply, got {plan:?}"),
    };
}

#[test]
fn validation_errors_are_terminal_and_verbatim() {
    let idx = index();
    let mut policy = mk_policy("math-agent-policy", "math-agent", 100);
    policy.spec.identity = Some(policy::IdentitySpec {
        trust_domain: Some("Not A Domain".to_string()),
        ..Default::default()
    });
    idx.write().apply(policy);
    idx.write().apply(mk_deployment("math-agent"));

    match idx.read().plan(&policy_id("math-agent-policy")) {
        Plan::Fail { status, retry } => {
            assert!(!retry, "validation failures wait for the user");
            let message = status.message.unwrap();
            assert!(message.starts_with("identity.trustDomain:"), "{message}");
        }
        plan => panic!("expected Fail, got {plan:?}"),
    };
}

#[test]
fn oldest_policy_wins_a_duplicate_target() {
    let idx = index();
    idx.write().apply(mk_deployment("math-agent"));
    idx.write().apply(mk_policy("older", "math-agent", 100));
    idx.write().apply(mk_policy("newer", "math-agent", 200));

    assert!(matches!(idx.read().plan(&policy_id("older")), Plan::Apply { .. }));
    match idx.read().plan(&policy_id("newer")) {
        Plan::Fail { status, retry } => {
            assert!(!retry);
            assert_eq!(status.phase, policy::Phase::Error);
            assert!(status.message.unwrap().contains("older"));
        }
        plan => panic!("expected Fail, got {plan:?}"),
    }

    // Deleting the winner promotes the survivor.
    delete_policy(&idx, "agents", "older");
    assert!(matches!(idx.read().plan(&policy_id("newer")), Plan::Apply { .. }));
}

#[test]
fn configured_pods_reflect_injected_chain_members() {
    let idx = index();
    idx.write().apply(mk_deployment("math-agent"));
    idx.write().apply(mk_policy("math-agent-policy", "math-agent", 100));
    idx.write().apply(mk_pod("math-agent-0", "math-agent", true, true));
    idx.write().apply(mk_pod("math-agent-1", "math-agent", true, false));
    idx.write().apply(mk_pod("bystander-0", "other", true, true));
    idx.write().apply(mk_pod("legacy-0", "math-agent", false, true));

    match idx.read().plan(&policy_id("math-agent-policy")) {
        Plan::Apply { status, .. } => {
            assert_eq!(status.configured_pods, 2, "only injected pods of this workload count");
            assert!(status.identity_ready, "one ready chain pod suffices");
            assert!(status.inbound_ready);
        }
        plan => panic!("expected Apply, got {plan:?}"),
    };
}

#[test]
fn bundles_with_live_policies_are_not_orphans() {
    let idx = index();
    idx.write().apply(mk_policy("math-agent-policy", "math-agent", 100));

    let mut cm = k8s::ConfigMap {
        metadata: ObjectMeta {
            name: Some("math-agent-identity-config".to_string()),
            namespace: Some("agents".to_string()),
            labels: Some(
                [
                    (k8s::BUNDLE_WORKLOAD_LABEL.to_string(), "math-agent".to_string()),
                    (
                        k8s::BUNDLE_POLICY_LABEL.to_string(),
                        "math-agent-policy".to_string(),
                    ),
                ]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        },
        ..Default::default()
    };
    idx.write().apply(cm.clone());
    assert!(idx.read().orphaned_bundles().is_empty());

    // Deleting the policy orphans the bundle without touching it.
    delete_policy(&idx, "agents", "math-agent-policy");
    assert_eq!(
        idx.read().orphaned_bundles(),
        vec![ResourceId::new(
            "agents".to_string(),
            "math-agent-identity-config".to_string()
        )],
    );

    // A bundle for some other workload without our policy label is ignored.
    cm.metadata.name = Some("unmanaged".to_string());
    cm.metadata.labels = None;
    idx.write().apply(cm);
    assert_eq!(idx.read().orphaned_bundles().len(), 1);
}

struct FlakyFetcher;

#[async_trait::async_trait]
impl CapabilityFetcher for FlakyFetcher {
    async fn fetch(
        &self,
        _ip: &str,
        _port: u16,
        _path: &str,
    ) -> anyhow::Result<policy::CapabilityDocument> {
        Ok(policy::CapabilityDocument {
            name: "math-agent".to_string(),
            version: Some("0.3.1".to_string()),
            ..Default::default()
        })
    }
}

#[tokio::test]
async fn discovery_isolates_per_pod_failures() {
    let idx = index();
    idx.write().apply(mk_pod("math-agent-0", "math-agent", true, true));
    // Not ready: its fetch fails, the others still cache.
    idx.write().apply(mk_pod("math-agent-1", "math-agent", true, false));

    idx.write().apply(policy::CapabilityDiscovery {
        metadata: ObjectMeta {
            name: Some("agents".to_string()),
            namespace: Some("agents".to_string()),
            ..Default::default()
        },
        spec: policy::CapabilityDiscoverySpec {
            selector: [("app", "math-agent")].into_iter().collect(),
            port: None,
            path: None,
            period_seconds: None,
        },
        status: None,
    });

    let (tx, mut rx) = mpsc::channel(8);
    let mut reconciler = DiscoveryReconciler::new(idx, FlakyFetcher, tx);
    reconciler.pass().await;

    let update = rx.recv().await.expect("a discovery status update");
    assert_eq!(update.target, Target::Discovery);
    let k8s::Patch::Merge(patch) = &update.patch else {
        panic!("expected a merge patch");
    };
    let pods = patch["status"]["pods"].as_array().unwrap();
    assert_eq!(pods.len(), 2);
    assert_eq!(pods[0]["pod"], "math-agent-0");
    assert_eq!(pods[0]["outcome"], "Fetched");
    assert_eq!(pods[1]["pod"], "math-agent-1");
    assert_eq!(pods[1]["outcome"], "Failed");
}
