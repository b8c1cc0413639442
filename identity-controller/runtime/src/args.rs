use crate::{
    admission::Admission,
    core::{bundle::ChainDefaults, IpNet, Issuer, TrustDomain},
    index::{
        discovery::{DiscoveryReconciler, HttpFetcher},
        gc::GarbageCollector,
        metrics::{ControllerMetrics, ReconcileMetrics},
        reconcile::Reconciler,
        status, ClusterInfo, Index,
    },
    inject::InjectionConfig,
    k8s::{self, policy},
    lease, namespaces,
};
use anyhow::{bail, Result};
use clap::Parser;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use tokio::{sync::mpsc, time::Duration};
use tracing::{info_span, Instrument};

/// The maximum number of status patches to buffer. Patches are small and
/// the queue drains continuously; resyncs regenerate anything dropped.
const STATUS_UPDATE_QUEUE_SIZE: usize = 10_000;

/// How often the bundle collector looks for expired orphans.
const GC_SWEEP_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug, Parser)]
#[clap(name = "identity-controller", about = "A workload identity controller")]
pub struct Args {
    #[clap(
        long,
        default_value = "identity_controller=info,warn",
        env = "IDENTITY_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Disables the admission interceptor server.
    #[clap(long)]
    admission_controller_disabled: bool,

    /// Logs would-be injection patches without applying them; used during
    /// rollout.
    #[clap(long)]
    admission_dry_run: bool,

    /// The identity trust domain workloads are issued identities under.
    #[clap(long, default_value = "cluster.local")]
    trust_domain: TrustDomain,

    /// The identity broker's base URL.
    #[clap(
        long,
        default_value = "http://keycloak.keycloak.svc.cluster.local:8080"
    )]
    broker_url: Issuer,

    #[clap(long, default_value = "master")]
    broker_realm: String,

    /// The issuer inbound validators trust by default. Defaults to the
    /// broker realm's issuer.
    #[clap(long)]
    default_issuer: Option<Issuer>,

    /// The application port inbound traffic is forwarded to by default.
    #[clap(long, default_value = "8000")]
    default_target_port: u16,

    /// Destination networks never routed through the egress proxy.
    #[clap(long, default_value = "169.254.0.0/16")]
    excluded_networks: IpNets,

    #[clap(long, default_value = "ghcr.io/workloadidentity")]
    sidecar_image_registry: String,

    #[clap(long, default_value = "dev")]
    sidecar_image_tag: String,

    #[clap(long, default_value = "identity-controller")]
    controller_deployment_name: String,

    #[clap(long, default_value = "identity-system")]
    control_plane_namespace: String,

    /// How often every policy is re-reconciled regardless of events.
    #[clap(long, default_value = "60")]
    resync_interval_secs: u64,

    /// How long an orphaned bundle outlives its deleted policy.
    #[clap(long, default_value = "900")]
    bundle_grace_period_secs: u64,

    #[clap(long, default_value = "5000")]
    patch_timeout_ms: u64,

    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Lists policies and their status phase in a namespace.
    List {
        #[clap(long, short = 'n')]
        namespace: String,
    },
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            server,
            admission_controller_disabled,
            admission_dry_run,
            trust_domain,
            broker_url,
            broker_realm,
            default_issuer,
            default_target_port,
            excluded_networks: IpNets(excluded_networks),
            sidecar_image_registry,
            sidecar_image_tag,
            controller_deployment_name,
            control_plane_namespace,
            resync_interval_secs,
            bundle_grace_period_secs,
            patch_timeout_ms,
            command,
        } = self;

        if let Some(Command::List { namespace }) = command {
            return list_policies(client, &namespace).await;
        }

        let server = if admission_controller_disabled {
            None
        } else {
            Some(server)
        };

        let issuer = match default_issuer {
            Some(issuer) => issuer,
            None => format!("{broker_url}/realms/{broker_realm}").parse()?,
        };
        let chain = ChainDefaults {
            trust_domain,
            broker_url,
            realm: broker_realm,
            issuer,
            target_port: default_target_port,
            excluded_networks,
        };
        let cluster_info = ClusterInfo {
            control_plane_ns: control_plane_namespace.clone(),
            chain: chain.clone(),
        };

        let mut prom = <Registry>::default();
        let controller_metrics =
            ControllerMetrics::register(prom.sub_registry_with_prefix("status"));
        let reconcile_metrics =
            ReconcileMetrics::register(prom.sub_registry_with_prefix("reconcile"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_optional_server(server)
            .build()
            .await?;

        let hostname =
            std::env::var("HOSTNAME").expect("Failed to fetch `HOSTNAME` environment variable");

        let claims = lease::init(
            &runtime,
            &control_plane_namespace,
            &controller_deployment_name,
            &hostname,
        )
        .await?;

        // Build the index maintaining the state every control loop reads.
        let (index, changes) = Index::shared(cluster_info);
        let retries = index.read().change_feed();

        // Spawn resource watches.

        let policies =
            runtime.watch_all::<policy::WorkloadIdentityPolicy>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), policies)
                .instrument(info_span!("workloadidentitypolicies")),
        );

        let deployments = runtime.watch_all::<k8s::Deployment>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), deployments)
                .instrument(info_span!("deployments")),
        );

        let statefulsets = runtime.watch_all::<k8s::StatefulSet>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), statefulsets)
                .instrument(info_span!("statefulsets")),
        );

        let jobs = runtime.watch_all::<k8s::Job>(watcher::Config::default());
        tokio::spawn(kubert::index::namespaced(index.clone(), jobs).instrument(info_span!("jobs")));

        let pods = runtime.watch_all::<k8s::Pod>(watcher::Config::default());
        tokio::spawn(kubert::index::namespaced(index.clone(), pods).instrument(info_span!("pods")));

        // Only bundles the controller manages.
        let bundles = runtime.watch_all::<k8s::ConfigMap>(
            watcher::Config::default().labels(k8s::BUNDLE_WORKLOAD_LABEL),
        );
        tokio::spawn(
            kubert::index::namespaced(index.clone(), bundles).instrument(info_span!("bundles")),
        );

        let discoveries =
            runtime.watch_all::<policy::CapabilityDiscovery>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), discoveries)
                .instrument(info_span!("capabilitydiscoveries")),
        );

        // The admission hot path reads namespace opt-in labels from a
        // watch-fed index rather than the API.
        let ns_index = namespaces::NamespaceIndex::shared();
        let ns_events = runtime.watch_all::<k8s::Namespace>(watcher::Config::default());
        tokio::spawn(
            namespaces::process(ns_index.clone(), ns_events).instrument(info_span!("namespaces")),
        );

        // Status patches flow through a single lease-guarded writer.
        let (updates_tx, updates_rx) = mpsc::channel(STATUS_UPDATE_QUEUE_SIZE);
        let status_controller = status::Controller::new(
            claims.clone(),
            runtime.client(),
            hostname.clone(),
            updates_rx,
            Duration::from_millis(patch_timeout_ms),
            controller_metrics,
        );
        tokio::spawn(status_controller.run().instrument(info_span!("status")));

        let reconciler = Reconciler::new(
            index.clone(),
            runtime.client(),
            changes,
            retries,
            updates_tx.clone(),
            claims.clone(),
            hostname.clone(),
            reconcile_metrics,
            Duration::from_secs(resync_interval_secs),
        );
        tokio::spawn(reconciler.run().instrument(info_span!("reconcile")));

        let gc = GarbageCollector::new(
            index.clone(),
            runtime.client(),
            claims.clone(),
            hostname.clone(),
            Duration::from_secs(bundle_grace_period_secs),
            GC_SWEEP_PERIOD,
        );
        tokio::spawn(gc.run().instrument(info_span!("gc")));

        let discovery = DiscoveryReconciler::new(index.clone(), HttpFetcher::new(), updates_tx);
        tokio::spawn(discovery.run().instrument(info_span!("discovery")));

        let admission = Admission::new(
            ns_index,
            InjectionConfig {
                registry: sidecar_image_registry,
                tag: sidecar_image_tag,
                chain,
            },
            admission_dry_run,
        );
        let runtime = runtime.spawn_server(move || admission);

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

/// The operator-facing listing surface: policy phases per namespace.
async fn list_policies(client: kubert::ClientArgs, namespace: &str) -> Result<()> {
    let client = client.try_client().await?;
    let api = k8s::Api::<policy::WorkloadIdentityPolicy>::namespaced(client, namespace);

    println!(
        "{:<32} {:<24} {:<8} {:<6} MESSAGE",
        "NAME", "TARGET", "PHASE", "PODS"
    );
    for policy in api.list(&k8s::ListParams::default()).await? {
        let status = policy.status.unwrap_or_default();
        println!(
            "{:<32} {:<24} {:<8} {:<6} {}",
            policy.metadata.name.unwrap_or_default(),
            policy.spec.target_ref.name,
            status.phase,
            status.configured_pods,
            status.message.unwrap_or_default(),
        );
    }
    Ok(())
}

#[derive(Clone, Debug)]
struct IpNets(Vec<IpNet>);

impl std::str::FromStr for IpNets {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        s.split(',')
            .map(|n| n.parse().map_err(Into::into))
            .collect::<Result<Vec<IpNet>>>()
            .map(Self)
    }
}
