use super::{check_range, check_target, ConditionsStatus, InvalidSpec, PolicyTargetReference};

#[derive(
    Clone, Debug, kube::CustomResource, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
#[kube(
    group = "networking.gke.io",
    version = "v1",
    kind = "GCPSessionAffinityPolicy",
    root = "GcpSessionAffinityPolicy",
    status = "ConditionsStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct GcpSessionAffinityPolicySpec {
    #[serde(flatten)]
    pub affinity: GcpSessionAffinitySpec,

    pub target_ref: PolicyTargetReference,
}

/// Session affinity settings shared with the GCPSessionAffinityFilter.
#[derive(Clone, Debug, Default, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GcpSessionAffinitySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stateful_generated_cookie: Option<StatefulGeneratedCookie>,
}

#[derive(Clone, Debug, Default, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatefulGeneratedCookie {
    /// Cookie lifetime in seconds; at most two weeks.
    pub cookie_ttl_seconds: Option<i64>,
}

impl GcpSessionAffinityPolicySpec {
    pub fn validate(&self) -> Result<(), InvalidSpec> {
        check_target(
            &self.target_ref,
            &[
                ("", "Service"),
                ("net.gke.io", "ServiceImport"),
                ("gateway.networking.k8s.io", "HTTPRoute"),
            ],
            "Service, ServiceImport or HTTPRoute",
        )?;
        if let Some(cookie) = self.affinity.stateful_generated_cookie.as_ref() {
            check_range(
                "statefulGeneratedCookie.cookieTtlSeconds",
                cookie.cookie_ttl_seconds,
                0,
                1_209_600,
            )?;
        }
        Ok(())
    }
}
