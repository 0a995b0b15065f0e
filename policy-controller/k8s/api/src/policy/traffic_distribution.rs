use super::{check_one_of, check_range, InvalidSpec, LocalPolicyTargetReference, PolicyStatus};

/// The maximum number of Services a single traffic distribution policy may
/// target.
pub const MAX_TARGET_REFS: usize = 16;

/// GCPTrafficDistributionPolicy configures how traffic is spread across the
/// endpoints of local Services.
#[derive(
    Clone, Debug, kube::CustomResource, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
#[kube(
    group = "networking.gke.io",
    version = "v1",
    kind = "GCPTrafficDistributionPolicy",
    root = "GcpTrafficDistributionPolicy",
    status = "PolicyStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct GcpTrafficDistributionPolicySpec {
    pub target_refs: Vec<LocalPolicyTargetReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<GcpTrafficDistributionPolicyConfig>,
}

#[derive(Clone, Debug, Default, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GcpTrafficDistributionPolicyConfig {
    pub service_lb_algorithm: Option<String>,
    pub locality_lb_algorithm: Option<String>,
    pub auto_capacity_drain: Option<AutoCapacityDrain>,
    pub failover_config: Option<FailoverConfig>,
}

#[derive(Clone, Debug, Default, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AutoCapacityDrain {
    pub enable_auto_capacity_drain: Option<bool>,
}

#[derive(Clone, Debug, Default, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FailoverConfig {
    pub failover_health_threshold: Option<i32>,
}

impl GcpTrafficDistributionPolicySpec {
    pub fn validate(&self) -> Result<(), InvalidSpec> {
        let count = self.target_refs.len();
        if count == 0 || count > MAX_TARGET_REFS {
            return Err(InvalidSpec::TargetRefCount {
                max: MAX_TARGET_REFS,
                count,
            });
        }
        if let Some(tgt) = self
            .target_refs
            .iter()
            .find(|tgt| !tgt.targets_kind::<crate::Service>())
        {
            return Err(InvalidSpec::UnsupportedTarget {
                kind: tgt.canonical_kind(),
                expected: "Service",
            });
        }

        let Some(config) = self.default.as_ref() else {
            return Ok(());
        };
        check_one_of(
            "serviceLbAlgorithm",
            config.service_lb_algorithm.as_deref(),
            &["SPRAY_TO_REGION", "WATERFALL_BY_ZONE", "WATERFALL_BY_REGION"],
            "SPRAY_TO_REGION, WATERFALL_BY_ZONE, WATERFALL_BY_REGION",
        )?;
        check_one_of(
            "localityLbAlgorithm",
            config.locality_lb_algorithm.as_deref(),
            &[
                "ROUND_ROBIN",
                "LEAST_REQUEST",
                "RING_HASH",
                "RANDOM",
                "ORIGINAL_DESTINATION",
                "MAGLEV",
                "WEIGHTED_ROUND_ROBIN",
            ],
            "ROUND_ROBIN, LEAST_REQUEST, RING_HASH, RANDOM, ORIGINAL_DESTINATION, MAGLEV, WEIGHTED_ROUND_ROBIN",
        )?;
        if let Some(failover) = config.failover_config.as_ref() {
            check_range(
                "failoverConfig.failoverHealthThreshold",
                failover.failover_health_threshold.map(i64::from),
                0,
                100,
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(name: &str) -> LocalPolicyTargetReference {
        LocalPolicyTargetReference {
            group: String::new(),
            kind: "Service".to_string(),
            name: name.to_string(),
        }
    }

    #[test]
    fn requires_between_one_and_sixteen_targets() {
        let mut spec = GcpTrafficDistributionPolicySpec {
            target_refs: vec![],
            default: None,
        };
        assert_eq!(
            spec.validate(),
            Err(InvalidSpec::TargetRefCount { max: 16, count: 0 })
        );

        spec.target_refs = (0..16).map(|i| service(&format!("svc-{i}"))).collect();
        assert_eq!(spec.validate(), Ok(()));

        spec.target_refs.push(service("svc-16"));
        assert_eq!(
            spec.validate(),
            Err(InvalidSpec::TargetRefCount { max: 16, count: 17 })
        );
    }

    #[test]
    fn only_targets_core_services() {
        let spec = GcpTrafficDistributionPolicySpec {
            target_refs: vec![
                service("web"),
                LocalPolicyTargetReference {
                    group: "net.gke.io".to_string(),
                    kind: "ServiceImport".to_string(),
                    name: "web".to_string(),
                },
            ],
            default: None,
        };
        assert_eq!(
            spec.validate(),
            Err(InvalidSpec::UnsupportedTarget {
                kind: "ServiceImport.net.gke.io".to_string(),
                expected: "Service",
            })
        );
    }

    #[test]
    fn validates_algorithms() {
        let spec = GcpTrafficDistributionPolicySpec {
            target_refs: vec![service("web")],
            default: Some(GcpTrafficDistributionPolicyConfig {
                service_lb_algorithm: Some("WATERFALL_BY_ZONE".to_string()),
                locality_lb_algorithm: Some("FASTEST".to_string()),
                ..Default::default()
            }),
        };
        assert!(matches!(
            spec.validate(),
            Err(InvalidSpec::UnsupportedValue {
                field: "localityLbAlgorithm",
                ..
            })
        ));
    }
}
