pub mod ancestor_status;
pub mod backend_policy;
pub mod gateway_policy;
pub mod health_check;
pub mod session_affinity;
pub mod target_ref;
pub mod traffic_distribution;

pub use self::{
    ancestor_status::{ConditionsStatus, PolicyAncestorStatus, PolicyStatus},
    backend_policy::{GcpBackendPolicy, GcpBackendPolicySpec, GcpBackendPolicyStatus},
    gateway_policy::{GcpGatewayPolicy, GcpGatewayPolicySpec},
    health_check::{HealthCheck, HealthCheckPolicy, HealthCheckPolicySpec},
    session_affinity::{GcpSessionAffinityPolicy, GcpSessionAffinityPolicySpec},
    target_ref::{LocalPolicyTargetReference, PolicyTargetReference},
    traffic_distribution::{GcpTrafficDistributionPolicy, GcpTrafficDistributionPolicySpec},
};

pub const POLICY_API_GROUP: &str = "networking.gke.io";

/// Describes why a policy's spec cannot be implemented, independent of any
/// other policy.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum InvalidSpec {
    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        min: i64,
        max: i64,
        value: i64,
    },

    #[error("{field} must be one of {expected}, got {value:?}")]
    UnsupportedValue {
        field: &'static str,
        expected: &'static str,
        value: String,
    },

    #[error("{field} is malformed: {reason}")]
    Malformed {
        field: &'static str,
        reason: &'static str,
    },

    #[error("timeoutSec ({timeout}) must not exceed checkIntervalSec ({interval})")]
    TimeoutExceedsInterval { timeout: i64, interval: i64 },

    #[error("invalid health check: {0}")]
    HealthCheck(#[from] health_check::HealthCheckError),

    #[error("targetRefs must contain between 1 and {max} entries, got {count}")]
    TargetRefCount { max: usize, count: usize },

    #[error("target {kind} is not supported; expected {expected}")]
    UnsupportedTarget { kind: String, expected: &'static str },

    #[error("iap.clientID and iap.oauth2ClientSecret must be specified together")]
    PartialIapCredentials,
}

/// Backend-level policies attach to Services, or to ServiceImports for
/// multi-cluster Services.
pub(crate) const BACKEND_TARGETS: &[(&str, &str)] =
    &[("", "Service"), ("net.gke.io", "ServiceImport")];

pub(crate) fn check_target(
    target: &PolicyTargetReference,
    allowed: &[(&str, &str)],
    expected: &'static str,
) -> Result<(), InvalidSpec> {
    let group = if target.group == "core" { "" } else { target.group.as_str() };
    if allowed
        .iter()
        .any(|(g, k)| *g == group && target.kind.eq_ignore_ascii_case(k))
    {
        return Ok(());
    }
    Err(InvalidSpec::UnsupportedTarget {
        kind: target.canonical_kind(),
        expected,
    })
}

pub(crate) fn check_range(
    field: &'static str,
    value: Option<i64>,
    min: i64,
    max: i64,
) -> Result<(), InvalidSpec> {
    match value {
        Some(value) if value < min || value > max => Err(InvalidSpec::OutOfRange {
            field,
            min,
            max,
            value,
        }),
        _ => Ok(()),
    }
}

pub(crate) fn check_one_of(
    field: &'static str,
    value: Option<&str>,
    allowed: &[&str],
    expected: &'static str,
) -> Result<(), InvalidSpec> {
    match value {
        Some(value) if !allowed.contains(&value) => Err(InvalidSpec::UnsupportedValue {
            field,
            expected,
            value: value.to_string(),
        }),
        _ => Ok(()),
    }
}

pub(crate) fn check_max_len(
    field: &'static str,
    value: Option<&str>,
    max: usize,
) -> Result<(), InvalidSpec> {
    match value {
        Some(value) if value.len() > max => Err(InvalidSpec::OutOfRange {
            field,
            min: 0,
            max: max as i64,
            value: value.len() as i64,
        }),
        _ => Ok(()),
    }
}
