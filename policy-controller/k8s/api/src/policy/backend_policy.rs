use super::{
    check_max_len, check_one_of, check_range, check_target, InvalidSpec, PolicyAncestorStatus,
    PolicyTargetReference, BACKEND_TARGETS,
};
use crate::Condition;

/// GCPBackendPolicy configures the load balancer backend service for the
/// targeted Service.
#[derive(
    Clone, Debug, kube::CustomResource, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
#[kube(
    group = "networking.gke.io",
    version = "v1",
    kind = "GCPBackendPolicy",
    root = "GcpBackendPolicy",
    status = "GcpBackendPolicyStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct GcpBackendPolicySpec {
    pub target_ref: PolicyTargetReference,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<GcpBackendPolicyConfig>,
}

#[derive(Clone, Debug, Default, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GcpBackendPolicyConfig {
    pub logging: Option<LoggingConfig>,
    pub session_affinity: Option<SessionAffinityConfig>,
    pub connection_draining: Option<ConnectionDraining>,
    pub timeout_sec: Option<i64>,
    pub security_policy: Option<String>,
    pub iap: Option<IdentityAwareProxyConfig>,
    pub max_rate_per_endpoint: Option<i64>,
    pub backend_preference: Option<String>,
}

#[derive(Clone, Debug, Default, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDraining {
    pub draining_timeout_sec: Option<i64>,
}

#[derive(Clone, Debug, Default, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    pub enabled: Option<bool>,

    /// Parts per million of requests to log, in `[0, 1e6]`.
    pub sample_rate: Option<i32>,
}

#[derive(Clone, Debug, Default, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionAffinityConfig {
    #[serde(rename = "type")]
    pub type_: Option<String>,
    #[serde(rename = "cookieTtlSec")]
    pub cookie_ttl_sec: Option<i64>,
}

#[derive(Clone, Debug, Default, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IdentityAwareProxyConfig {
    pub enabled: Option<bool>,
    pub oauth2_client_secret: Option<Oauth2ClientSecret>,
    #[serde(rename = "clientID")]
    pub client_id: Option<String>,
}

#[derive(Clone, Debug, Default, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
pub struct Oauth2ClientSecret {
    pub name: Option<String>,
}

#[derive(
    Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
pub struct GcpBackendPolicyStatus {
    /// At most 16 entries, keyed by ancestor and controller.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ancestors: Vec<PolicyAncestorStatus>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

const SESSION_AFFINITY_TYPES: &[&str] = &[
    "CLIENT_IP",
    "CLIENT_IP_PORT_PROTO",
    "CLIENT_IP_PROTO",
    "GENERATED_COOKIE",
    "HEADER_FIELD",
    "HTTP_COOKIE",
    "NONE",
];

impl GcpBackendPolicySpec {
    pub fn validate(&self) -> Result<(), InvalidSpec> {
        check_target(&self.target_ref, BACKEND_TARGETS, "Service or ServiceImport")?;
        let Some(config) = self.default.as_ref() else {
            return Ok(());
        };

        check_range("timeoutSec", config.timeout_sec, 1, i32::MAX as i64)?;
        check_range(
            "maxRatePerEndpoint",
            config.max_rate_per_endpoint,
            1,
            1_000_000_000,
        )?;
        check_one_of(
            "backendPreference",
            config.backend_preference.as_deref(),
            &["DEFAULT", "PREFERRED"],
            "DEFAULT, PREFERRED",
        )?;

        if let Some(logging) = config.logging.as_ref() {
            check_range(
                "logging.sampleRate",
                logging.sample_rate.map(i64::from),
                0,
                1_000_000,
            )?;
        }

        if let Some(draining) = config.connection_draining.as_ref() {
            check_range(
                "connectionDraining.drainingTimeoutSec",
                draining.draining_timeout_sec,
                0,
                3600,
            )?;
        }

        if let Some(affinity) = config.session_affinity.as_ref() {
            check_one_of(
                "sessionAffinity.type",
                affinity.type_.as_deref(),
                SESSION_AFFINITY_TYPES,
                "CLIENT_IP, CLIENT_IP_PORT_PROTO, CLIENT_IP_PROTO, GENERATED_COOKIE, HEADER_FIELD, HTTP_COOKIE, NONE",
            )?;
            check_range(
                "sessionAffinity.cookieTtlSec",
                affinity.cookie_ttl_sec,
                0,
                1_209_600,
            )?;
        }

        if let Some(iap) = config.iap.as_ref() {
            let secret = iap
                .oauth2_client_secret
                .as_ref()
                .and_then(|s| s.name.as_deref());
            if iap.client_id.is_some() != secret.is_some() {
                return Err(InvalidSpec::PartialIapCredentials);
            }
            check_max_len("iap.clientID", iap.client_id.as_deref(), 1024)?;
        }

        Ok(())
    }
}
