use chrono::{DateTime, Utc};
use gke_policy_controller_core::PolicyTarget;
use gke_policy_controller_k8s_api::{
    self as k8s, gateway,
    policy::{
        GcpBackendPolicy, GcpGatewayPolicy, GcpSessionAffinityPolicy,
        GcpTrafficDistributionPolicy, HealthCheckPolicy, InvalidSpec, PolicyStatus,
        PolicyTargetReference,
    },
    Resource, ResourceExt,
};
use std::fmt;

/// The policy kinds whose status this controller maintains.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PolicyKind {
    Backend,
    Gateway,
    HealthCheck,
    SessionAffinity,
    TrafficDistribution,
}

/// What the index needs to know about a policy object.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct PolicyMeta {
    pub created_at: Option<DateTime<Utc>>,
    pub generation: Option<i64>,
    pub resource_version: Option<String>,
    pub targets: Vec<PolicyTarget>,
    pub invalid: Option<String>,
    pub stored_ancestors: PolicyStatus,
    pub stored_conditions: Vec<k8s::Condition>,
}

/// A policy resource indexed by its targets.
pub(crate) trait Policy: Resource<DynamicType = ()> + Sized {
    const KIND: PolicyKind;

    fn target_refs(&self) -> Vec<PolicyTargetReference>;

    fn validate(&self) -> Result<(), InvalidSpec>;

    fn stored_ancestors(&self) -> PolicyStatus {
        PolicyStatus::default()
    }

    fn stored_conditions(&self) -> Vec<k8s::Condition>;

    fn index_meta(&self, namespace: &str) -> PolicyMeta {
        let mut targets = Vec::<PolicyTarget>::new();
        for tref in self.target_refs() {
            let group = normalize_group(&tref.group);
            let target = PolicyTarget {
                kind: canonical_kind(&group, &tref.kind),
                group,
                namespace: tref.namespace_or(namespace).to_string(),
                name: tref.name,
            };
            if !targets.contains(&target) {
                targets.push(target);
            }
        }

        PolicyMeta {
            created_at: self.creation_timestamp().map(|k8s::Time(t)| t),
            generation: self.meta().generation,
            resource_version: self.resource_version(),
            targets,
            invalid: self.validate().err().map(|error| error.to_string()),
            stored_ancestors: self.stored_ancestors(),
            stored_conditions: self.stored_conditions(),
        }
    }
}

fn normalize_group(group: &str) -> String {
    if group == "core" {
        String::new()
    } else {
        group.to_string()
    }
}

/// Spells the kinds of indexed targets the way their watches report them, so
/// that a `kind: service` reference resolves.
fn canonical_kind(group: &str, kind: &str) -> String {
    let indexed = [
        (k8s::Service::group(&()), k8s::Service::kind(&())),
        (gateway::Gateway::group(&()), gateway::Gateway::kind(&())),
        (gateway::HttpRoute::group(&()), gateway::HttpRoute::kind(&())),
    ];
    indexed
        .into_iter()
        .find(|(g, k)| g == group && k.eq_ignore_ascii_case(kind))
        .map(|(_, k)| k.into_owned())
        .unwrap_or_else(|| kind.to_string())
}

// === impl PolicyKind ===

impl PolicyKind {
    pub const ALL: [Self; 5] = [
        Self::Backend,
        Self::Gateway,
        Self::HealthCheck,
        Self::SessionAffinity,
        Self::TrafficDistribution,
    ];

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Backend => "GCPBackendPolicy",
            Self::Gateway => "GCPGatewayPolicy",
            Self::HealthCheck => "HealthCheckPolicy",
            Self::SessionAffinity => "GCPSessionAffinityPolicy",
            Self::TrafficDistribution => "GCPTrafficDistributionPolicy",
        }
    }

    pub fn from_kind(kind: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.kind() == kind)
    }

    /// Whether the policy reports per-ancestor status in `status.ancestors`.
    pub fn writes_ancestors(&self) -> bool {
        matches!(self, Self::Backend | Self::TrafficDistribution)
    }

    /// Whether the policy reports top-level `status.conditions`.
    pub fn writes_conditions(&self) -> bool {
        !matches!(self, Self::TrafficDistribution)
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

// === impl Policy ===

impl Policy for GcpBackendPolicy {
    const KIND: PolicyKind = PolicyKind::Backend;

    fn target_refs(&self) -> Vec<PolicyTargetReference> {
        vec![self.spec.target_ref.clone()]
    }

    fn validate(&self) -> Result<(), InvalidSpec> {
        self.spec.validate()
    }

    fn stored_ancestors(&self) -> PolicyStatus {
        PolicyStatus {
            ancestors: self
                .status
                .as_ref()
                .map(|s| s.ancestors.clone())
                .unwrap_or_default(),
        }
    }

    fn stored_conditions(&self) -> Vec<k8s::Condition> {
        self.status
            .as_ref()
            .map(|s| s.conditions.clone())
            .unwrap_or_default()
    }
}

impl Policy for GcpGatewayPolicy {
    const KIND: PolicyKind = PolicyKind::Gateway;

    fn target_refs(&self) -> Vec<PolicyTargetReference> {
        vec![self.spec.target_ref.clone()]
    }

    fn validate(&self) -> Result<(), InvalidSpec> {
        self.spec.validate()
    }

    fn stored_conditions(&self) -> Vec<k8s::Condition> {
        self.status
            .as_ref()
            .map(|s| s.conditions.clone())
            .unwrap_or_default()
    }
}

impl Policy for HealthCheckPolicy {
    const KIND: PolicyKind = PolicyKind::HealthCheck;

    fn target_refs(&self) -> Vec<PolicyTargetReference> {
        vec![self.spec.target_ref.clone()]
    }

    fn validate(&self) -> Result<(), InvalidSpec> {
        self.spec.validate()
    }

    fn stored_conditions(&self) -> Vec<k8s::Condition> {
        self.status
            .as_ref()
            .map(|s| s.conditions.clone())
            .unwrap_or_default()
    }
}

impl Policy for GcpSessionAffinityPolicy {
    const KIND: PolicyKind = PolicyKind::SessionAffinity;

    fn target_refs(&self) -> Vec<PolicyTargetReference> {
        vec![self.spec.target_ref.clone()]
    }

    fn validate(&self) -> Result<(), InvalidSpec> {
        self.spec.validate()
    }

    fn stored_conditions(&self) -> Vec<k8s::Condition> {
        self.status
            .as_ref()
            .map(|s| s.conditions.clone())
            .unwrap_or_default()
    }
}

impl Policy for GcpTrafficDistributionPolicy {
    const KIND: PolicyKind = PolicyKind::TrafficDistribution;

    fn target_refs(&self) -> Vec<PolicyTargetReference> {
        self.spec
            .target_refs
            .iter()
            .cloned()
            .map(Into::into)
            .collect()
    }

    fn validate(&self) -> Result<(), InvalidSpec> {
        self.spec.validate()
    }

    fn stored_ancestors(&self) -> PolicyStatus {
        self.status.clone().unwrap_or_default()
    }

    fn stored_conditions(&self) -> Vec<k8s::Condition> {
        vec![]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gke_policy_controller_k8s_api::{
        policy::{
            GcpBackendPolicySpec, GcpTrafficDistributionPolicySpec, LocalPolicyTargetReference,
        },
        ObjectMeta,
    };

    #[test]
    fn kinds_round_trip() {
        for kind in PolicyKind::ALL {
            assert_eq!(PolicyKind::from_kind(kind.kind()), Some(kind));
        }
        assert_eq!(PolicyKind::from_kind("HTTPRoute"), None);
    }

    #[test]
    fn target_kinds_are_canonicalized() {
        let policy = GcpBackendPolicy {
            metadata: ObjectMeta {
                namespace: Some("store".to_string()),
                name: Some("web-backend".to_string()),
                ..Default::default()
            },
            spec: GcpBackendPolicySpec {
                target_ref: PolicyTargetReference {
                    group: "core".to_string(),
                    kind: "service".to_string(),
                    name: "web".to_string(),
                    namespace: None,
                },
                default: None,
            },
            status: None,
        };

        let meta = policy.index_meta("store");
        assert_eq!(meta.invalid, None);
        assert_eq!(
            meta.targets,
            vec![PolicyTarget {
                group: String::new(),
                kind: "Service".to_string(),
                namespace: "store".to_string(),
                name: "web".to_string(),
            }]
        );
        assert_eq!(canonical_kind("gateway.networking.k8s.io", "httproute"), "HTTPRoute");
        assert_eq!(canonical_kind("apps", "deployment"), "deployment");
    }

    #[test]
    fn traffic_distribution_targets_are_local_and_deduplicated() {
        let svc = |name: &str| LocalPolicyTargetReference {
            group: String::new(),
            kind: "Service".to_string(),
            name: name.to_string(),
        };
        let policy = GcpTrafficDistributionPolicy {
            metadata: ObjectMeta {
                namespace: Some("store".to_string()),
                name: Some("spread".to_string()),
                generation: Some(2),
                ..Default::default()
            },
            spec: GcpTrafficDistributionPolicySpec {
                target_refs: vec![svc("web"), svc("api"), svc("web")],
                default: None,
            },
            status: None,
        };

        let meta = policy.index_meta("store");
        assert_eq!(meta.generation, Some(2));
        assert_eq!(meta.invalid, None);
        assert_eq!(
            meta.targets
                .iter()
                .map(|t| (t.namespace.as_str(), t.name.as_str()))
                .collect::<Vec<_>>(),
            vec![("store", "web"), ("store", "api")]
        );
    }
}
