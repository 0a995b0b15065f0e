use crate::{
    index::Update, metrics::ControllerMetrics, policy::PolicyKind,
    resource_id::NamespaceGroupKindName,
};
use gke_policy_controller_k8s_api::{
    self as k8s, gateway,
    policy::{
        GcpBackendPolicy, GcpGatewayPolicy, GcpSessionAffinityPolicy,
        GcpTrafficDistributionPolicy, HealthCheckPolicy, POLICY_API_GROUP,
    },
    NamespaceResourceScope, Resource,
};
use kubert::lease::Claim;
use serde::de::DeserializeOwned;
use std::{fmt, sync::Arc};
use tokio::{
    sync::{mpsc, watch},
    time::{self, Duration},
};

/// Writes status patches produced by the index to the API server while this
/// instance holds the lease.
pub struct Controller {
    claims: watch::Receiver<Arc<Claim>>,
    client: k8s::Client,
    name: String,
    updates: mpsc::Receiver<Update>,
    patch_timeout: Duration,
    metrics: ControllerMetrics,
}

impl Controller {
    pub fn new(
        claims: watch::Receiver<Arc<Claim>>,
        client: k8s::Client,
        name: impl ToString,
        updates: mpsc::Receiver<Update>,
        patch_timeout: Duration,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            claims,
            client,
            name: name.to_string(),
            updates,
            patch_timeout,
            metrics,
        }
    }

    pub async fn run(mut self) {
        while let Some(Update { id, patch }) = self.updates.recv().await {
            self.metrics.patch_dequeues.inc();

            // The lease may have moved since the update was enqueued.
            if !self.claims.borrow().is_current_for(&self.name) {
                tracing::debug!(%id, "Not the lease holder; dropping status update");
                self.metrics.patch_skipped.inc();
                continue;
            }

            let kind = id.gkn.kind.as_str();
            let group = id.gkn.group.as_str();
            match PolicyKind::from_kind(kind) {
                Some(_) if group != POLICY_API_GROUP => {
                    tracing::warn!(%id, "Unexpected policy group");
                }
                Some(PolicyKind::Backend) => self.patch::<GcpBackendPolicy>(&id, &patch).await,
                Some(PolicyKind::Gateway) => self.patch::<GcpGatewayPolicy>(&id, &patch).await,
                Some(PolicyKind::HealthCheck) => self.patch::<HealthCheckPolicy>(&id, &patch).await,
                Some(PolicyKind::SessionAffinity) => {
                    self.patch::<GcpSessionAffinityPolicy>(&id, &patch).await
                }
                Some(PolicyKind::TrafficDistribution) => {
                    self.patch::<GcpTrafficDistributionPolicy>(&id, &patch)
                        .await
                }
                None if is::<k8s::Service>(&id) => self.patch::<k8s::Service>(&id, &patch).await,
                None if is::<gateway::Gateway>(&id) => {
                    self.patch::<gateway::Gateway>(&id, &patch).await
                }
                None => tracing::warn!(%id, "Unsupported status update"),
            }
        }
        tracing::debug!("Status updates closed");
    }

    async fn patch<K>(&self, id: &NamespaceGroupKindName, patch: &k8s::Patch<serde_json::Value>)
    where
        K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + fmt::Debug,
    {
        let api = k8s::Api::<K>::namespaced(self.client.clone(), &id.namespace);
        let mut params = k8s::PatchParams::apply(POLICY_API_GROUP);
        if matches!(patch, k8s::Patch::Apply(_)) {
            params = params.force();
        }

        match time::timeout(
            self.patch_timeout,
            api.patch_status(&id.gkn.name, &params, patch),
        )
        .await
        {
            Ok(Ok(_)) => {
                tracing::trace!(%id, "Patched status");
                self.metrics.patch_succeeded.inc();
            }
            Ok(Err(k8s::Error::Api(error))) if error.code == 409 => {
                // The object changed since it was observed. The index sends a
                // fresh patch once the change is observed, or on its next
                // periodic pass.
                tracing::info!(%id, reason = %error.reason, "Status changed concurrently");
                self.metrics.patch_conflict.inc();
            }
            Ok(Err(error)) => {
                tracing::error!(%id, %error, "Failed to patch status");
                self.metrics.patch_failed.inc();
            }
            Err(_) => {
                tracing::error!(%id, timeout = ?self.patch_timeout, "Patching status timed out");
                self.metrics.patch_timeout.inc();
            }
        }
    }
}

fn is<K: Resource<DynamicType = ()>>(id: &NamespaceGroupKindName) -> bool {
    id.gkn.group == K::group(&()) && id.gkn.kind == K::kind(&())
}
