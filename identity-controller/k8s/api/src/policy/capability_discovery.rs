use crate::{labels, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Periodically polls matching pods for their self-described capability
/// document and caches the results.
#[derive(Clone, Debug, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "workloadidentity.io",
    version = "v1alpha1",
    kind = "CapabilityDiscovery",
    status = "CapabilityDiscoveryStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityDiscoverySpec {
    pub selector: labels::Selector,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_seconds: Option<u32>,
}

impl CapabilityDiscoverySpec {
    pub const DEFAULT_PORT: u16 = 8000;
    pub const DEFAULT_PATH: &'static str = "/.well-known/agent.json";
    pub const DEFAULT_PERIOD_SECONDS: u32 = 60;
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityDiscoveryStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pods: Vec<PodCapabilities>,
}

/// The cached fetch outcome for one matched pod.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodCapabilities {
    pub pod: String,

    /// `Fetched` or `Failed`.
    pub outcome: FetchOutcome,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fetch_time: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<CapabilityDocument>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum FetchOutcome {
    Fetched,
    Failed,
}

/// A workload's self-described capability document.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityDocument {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub capabilities: std::collections::BTreeMap<String, bool>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operations: Vec<OperationSpec>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OperationSpec {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_document_tolerates_extra_fields() {
        let doc: CapabilityDocument = serde_json::from_value(serde_json::json!({
            "name": "math-agent",
            "version": "0.3.1",
            "capabilities": {"streaming": true},
            "operations": [{"name": "solve", "description": "Solve an equation"}],
            "protocolExtensions": ["a2a"],
        }))
        .unwrap();
        assert_eq!(doc.name, "math-agent");
        assert_eq!(doc.capabilities.get("streaming"), Some(&true));
        assert_eq!(doc.operations[0].name, "solve");
    }
}
