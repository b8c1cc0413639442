//! Capability discovery.
//!
//! On each `CapabilityDiscovery` object's period, every matched pod is
//! polled for its capability document over a well-known path. Results are
//! cached on the object's status; a pod that cannot be reached produces a
//! failed entry for that pod only and never aborts the pass. Target pods
//! are never mutated.

use crate::{
    status::{self, Update},
    ResourceId, SharedIndex,
};
use ahash::AHashMap as HashMap;
use http_body_util::BodyExt;
use identity_controller_k8s_api::{policy, Time};
use std::sync::Arc;
use tokio::{sync::mpsc, time};
use tracing::{debug, warn};

/// How often the loop checks whether any discovery object's period elapsed.
const POLL_GRANULARITY: time::Duration = time::Duration::from_secs(10);

/// How long a single pod fetch may take.
const FETCH_TIMEOUT: time::Duration = time::Duration::from_secs(5);

/// Fetches a capability document from one pod; an external collaborator
/// seam so passes are testable without a cluster.
#[async_trait::async_trait]
pub trait CapabilityFetcher: Send + Sync + 'static {
    async fn fetch(
        &self,
        ip: &str,
        port: u16,
        path: &str,
    ) -> anyhow::Result<policy::CapabilityDocument>;
}

/// Fetches capability documents over plain pod-network HTTP.
pub struct HttpFetcher {
    client: hyper_util::client::legacy::Client<
        hyper_util::client::legacy::connect::HttpConnector,
        http_body_util::Empty<bytes::Bytes>,
    >,
}

pub struct DiscoveryReconciler<F> {
    index: SharedIndex,
    fetcher: Arc<F>,
    updates: mpsc::Sender<Update>,
    last_pass: HashMap<ResourceId, time::Instant>,
}

// === impl HttpFetcher ===

impl HttpFetcher {
    pub fn new() -> Self {
        let client = hyper_util::client::legacy::Client::builder(
            hyper_util::rt::TokioExecutor::new(),
        )
        .build_http();
        Self { client }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl CapabilityFetcher for HttpFetcher {
    async fn fetch(
        &self,
        ip: &str,
        port: u16,
        path: &str,
    ) -> anyhow::Result<policy::CapabilityDocument> {
        let uri = format!("http://{ip}:{port}{path}").parse::<hyper::Uri>()?;
        let rsp = time::timeout(FETCH_TIMEOUT, self.client.get(uri)).await??;
        anyhow::ensure!(
            rsp.status() == hyper::StatusCode::OK,
            "capability endpoint returned {}",
            rsp.status(),
        );
        let body = rsp.into_body().collect().await?.to_bytes();
        Ok(serde_json::from_slice(&body)?)
    }
}

// === impl DiscoveryReconciler ===

impl<F: CapabilityFetcher> DiscoveryReconciler<F> {
    pub fn new(index: SharedIndex, fetcher: F, updates: mpsc::Sender<Update>) -> Self {
        Self {
            index,
            fetcher: Arc::new(fetcher),
            updates,
            last_pass: HashMap::new(),
        }
    }

    pub async fn run(mut self) {
        let mut interval = time::interval(POLL_GRANULARITY);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.pass().await;
        }
    }

    /// Runs discovery for every object whose period has elapsed.
    pub(crate) async fn pass(&mut self) {
        let now = time::Instant::now();
        let discoveries = self.index.read().discoveries();

        for (id, spec) in discoveries {
            let period = time::Duration::from_secs(
                spec.period_seconds
                    .unwrap_or(policy::CapabilityDiscoverySpec::DEFAULT_PERIOD_SECONDS)
                    .into(),
            );
            if let Some(last) = self.last_pass.get(&id) {
                if now.duration_since(*last) < period {
                    continue;
                }
            }
            self.last_pass.insert(id.clone(), now);

            let status = self.poll(&id, &spec).await;
            let update = Update {
                id: id.clone(),
                target: status::Target::Discovery,
                patch: status::make_discovery_patch(&status),
            };
            if self.updates.send(update).await.is_err() {
                warn!(%id, "Status controller is gone; dropping discovery results");
            }
        }
    }

    /// Polls every matched pod. Per-pod failures become failed cache
    /// entries; they never fail the pass.
    async fn poll(
        &self,
        id: &ResourceId,
        spec: &policy::CapabilityDiscoverySpec,
    ) -> policy::CapabilityDiscoveryStatus {
        let port = spec.port.unwrap_or(policy::CapabilityDiscoverySpec::DEFAULT_PORT);
        let path = spec
            .path
            .clone()
            .unwrap_or_else(|| policy::CapabilityDiscoverySpec::DEFAULT_PATH.to_string());

        let pods = self.index.read().pods_matching(&id.namespace, &spec.selector);
        debug!(%id, pods = pods.len(), "Polling capabilities");

        let polls = pods.into_iter().map(|(pod, ip, ready)| {
            let fetcher = self.fetcher.clone();
            let path = path.clone();
            async move {
                let outcome = match ip.filter(|_| ready) {
                    Some(ip) => fetcher.fetch(&ip, port, &path).await,
                    None => Err(anyhow::anyhow!("pod is not ready")),
                };
                match outcome {
                    Ok(document) => policy::PodCapabilities {
                        pod,
                        outcome: policy::FetchOutcome::Fetched,
                        last_fetch_time: Some(Time(status::now())),
                        message: None,
                        document: Some(document),
                    },
                    Err(error) => policy::PodCapabilities {
                        pod,
                        outcome: policy::FetchOutcome::Failed,
                        last_fetch_time: Some(Time(status::now())),
                        message: Some(error.to_string()),
                        document: None,
                    },
                }
            }
        });

        policy::CapabilityDiscoveryStatus {
            pods: futures::future::join_all(polls).await,
        }
    }
}
