use crate::{
    core::{ControllerName, EvictionPolicy, DEFAULT_CONTROLLER_NAME},
    k8s::{self, gateway, policy, Client, Resource},
    lease, status,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use tokio::{sync::mpsc, time::Duration};
use tracing::{info_span, Instrument};

const RECONCILIATION_PERIOD: Duration = Duration::from_secs(10);

// The maximum number of status patches to buffer. As a conservative estimate,
// we assume that sending a patch will take at least 1ms, so we set the buffer
// size to be the same as the reconciliation period in milliseconds.
const STATUS_UPDATE_QUEUE_SIZE: usize = RECONCILIATION_PERIOD.as_millis() as usize;

#[derive(Debug, Parser)]
#[clap(
    name = "gke-policy-controller",
    about = "Maintains the status of GKE gateway policies"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "gke_policy=info,warn",
        env = "GKE_POLICY_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The name under which ancestor statuses are reported.
    #[clap(long, default_value = DEFAULT_CONTROLLER_NAME)]
    controller_name: ControllerName,

    #[clap(long, default_value = "gke-policy-controller")]
    deployment_name: String,

    #[clap(long, default_value = "gke-system")]
    control_plane_namespace: String,

    #[clap(long, default_value = "5000")]
    patch_timeout_ms: u64,

    /// What to do when an ancestor already holds the maximum number of
    /// conditions.
    #[clap(long, value_enum, default_value = "reject")]
    condition_eviction: ConditionEviction,
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
            controller_name,
            deployment_name,
            control_plane_namespace,
            patch_timeout_ms,
            condition_eviction,
        } = self;
        let eviction = EvictionPolicy::from(condition_eviction);

        let mut prom = <Registry>::default();
        let resource_status = prom.sub_registry_with_prefix("resource_status");
        let status_metrics = status::ControllerMetrics::register(resource_status);
        let status_index_metrics = status::IndexMetrics::register(resource_status);
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let hostname = std::env::var("HOSTNAME")
            .context("Failed to fetch `HOSTNAME` environment variable")?;

        let claims = lease::init(
            &runtime,
            &control_plane_namespace,
            &deployment_name,
            &hostname,
        )
        .await?;

        tracing::info!(controller = %controller_name, ?eviction, "Reporting policy status");

        // Build the status index which will maintain information necessary for
        // updating the status field of policy resources.
        let (updates_tx, updates_rx) = mpsc::channel(STATUS_UPDATE_QUEUE_SIZE);
        let status_index = status::Index::shared(
            hostname.clone(),
            claims.clone(),
            updates_tx,
            status_index_metrics,
            controller_name,
            eviction,
        );

        // Spawn resource watches.

        let services = runtime.watch_all::<k8s::Service>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(status_index.clone(), services)
                .instrument(info_span!("services")),
        );

        if api_resource_exists::<gateway::Gateway>(&runtime.client()).await {
            let gateways = runtime.watch_all::<gateway::Gateway>(watcher::Config::default());
            tokio::spawn(
                kubert::index::namespaced(status_index.clone(), gateways)
                    .instrument(info_span!("gateways.gateway.networking.k8s.io")),
            );
        } else {
            tracing::warn!("gateways.gateway.networking.k8s.io resource kind not found, skipping watches");
        }

        if api_resource_exists::<gateway::HttpRoute>(&runtime.client()).await {
            let http_routes = runtime.watch_all::<gateway::HttpRoute>(watcher::Config::default());
            tokio::spawn(
                kubert::index::namespaced(status_index.clone(), http_routes)
                    .instrument(info_span!("httproutes.gateway.networking.k8s.io")),
            );
        } else {
            tracing::warn!("httproutes.gateway.networking.k8s.io resource kind not found, skipping watches");
        }

        if api_resource_exists::<policy::GcpBackendPolicy>(&runtime.client()).await {
            let policies =
                runtime.watch_all::<policy::GcpBackendPolicy>(watcher::Config::default());
            tokio::spawn(
                kubert::index::namespaced(status_index.clone(), policies)
                    .instrument(info_span!("gcpbackendpolicies")),
            );
        } else {
            tracing::warn!("gcpbackendpolicies.networking.gke.io resource kind not found, skipping watches");
        }

        if api_resource_exists::<policy::GcpGatewayPolicy>(&runtime.client()).await {
            let policies =
                runtime.watch_all::<policy::GcpGatewayPolicy>(watcher::Config::default());
            tokio::spawn(
                kubert::index::namespaced(status_index.clone(), policies)
                    .instrument(info_span!("gcpgatewaypolicies")),
            );
        } else {
            tracing::warn!("gcpgatewaypolicies.networking.gke.io resource kind not found, skipping watches");
        }

        if api_resource_exists::<policy::HealthCheckPolicy>(&runtime.client()).await {
            let policies =
                runtime.watch_all::<policy::HealthCheckPolicy>(watcher::Config::default());
            tokio::spawn(
                kubert::index::namespaced(status_index.clone(), policies)
                    .instrument(info_span!("healthcheckpolicies")),
            );
        } else {
            tracing::warn!("healthcheckpolicies.networking.gke.io resource kind not found, skipping watches");
        }

        if api_resource_exists::<policy::GcpSessionAffinityPolicy>(&runtime.client()).await {
            let policies =
                runtime.watch_all::<policy::GcpSessionAffinityPolicy>(watcher::Config::default());
            tokio::spawn(
                kubert::index::namespaced(status_index.clone(), policies)
                    .instrument(info_span!("gcpsessionaffinitypolicies")),
            );
        } else {
            tracing::warn!("gcpsessionaffinitypolicies.networking.gke.io resource kind not found, skipping watches");
        }

        if api_resource_exists::<policy::GcpTrafficDistributionPolicy>(&runtime.client()).await {
            let policies = runtime
                .watch_all::<policy::GcpTrafficDistributionPolicy>(watcher::Config::default());
            tokio::spawn(
                kubert::index::namespaced(status_index.clone(), policies)
                    .instrument(info_span!("gcptrafficdistributionpolicies")),
            );
        } else {
            tracing::warn!("gcptrafficdistributionpolicies.networking.gke.io resource kind not found, skipping watches");
        }

        // Spawn the status Controller reconciliation.
        tokio::spawn(
            status::Index::run(status_index.clone(), RECONCILIATION_PERIOD)
                .instrument(info_span!("status_index")),
        );

        let status_controller = status::Controller::new(
            claims,
            runtime.client(),
            hostname,
            updates_rx,
            Duration::from_millis(patch_timeout_ms),
            status_metrics,
        );
        tokio::spawn(
            status_controller
                .run()
                .instrument(info_span!("status_controller")),
        );

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum ConditionEviction {
    /// Leave the existing conditions in place.
    Reject,
    /// Replace the condition with the oldest transition time.
    EvictOldest,
}

impl From<ConditionEviction> for EvictionPolicy {
    fn from(eviction: ConditionEviction) -> Self {
        match eviction {
            ConditionEviction::Reject => Self::Reject,
            ConditionEviction::EvictOldest => Self::EvictOldest,
        }
    }
}

async fn api_resource_exists<T>(client: &Client) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    client
        .list_api_group_resources(&T::api_version(&dt))
        .await
        .ok()
        .iter()
        .flat_map(|r| r.resources.iter())
        .any(|r| r.kind == T::kind(&dt))
}
