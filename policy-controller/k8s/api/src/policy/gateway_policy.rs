use super::{check_max_len, check_target, ConditionsStatus, InvalidSpec, PolicyTargetReference};

/// GCPGatewayPolicy configures the load balancer fronting a Gateway.
#[derive(
    Clone, Debug, kube::CustomResource, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
#[kube(
    group = "networking.gke.io",
    version = "v1",
    kind = "GCPGatewayPolicy",
    root = "GcpGatewayPolicy",
    status = "ConditionsStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct GcpGatewayPolicySpec {
    pub target_ref: PolicyTargetReference,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<GcpGatewayPolicyConfig>,
}

#[derive(Clone, Debug, Default, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GcpGatewayPolicyConfig {
    /// A raw SSL policy name or a `projects/...` path.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ssl_policy: String,

    #[serde(default)]
    pub allow_global_access: bool,

    /// The load balancer region of a multi-cluster Gateway.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub region: String,
}

impl GcpGatewayPolicySpec {
    pub fn validate(&self) -> Result<(), InvalidSpec> {
        check_target(
            &self.target_ref,
            &[("gateway.networking.k8s.io", "Gateway")],
            "Gateway",
        )?;
        let Some(config) = self.default.as_ref() else {
            return Ok(());
        };
        check_max_len("sslPolicy", Some(&config.ssl_policy), 1024)?;
        if config.ssl_policy.starts_with("projects/") && config.ssl_policy.split('/').count() < 4 {
            return Err(InvalidSpec::Malformed {
                field: "sslPolicy",
                reason: "must be a policy name or a full projects/ path",
            });
        }
        Ok(())
    }
}
