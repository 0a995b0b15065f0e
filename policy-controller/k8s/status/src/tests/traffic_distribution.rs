use super::*;
use gke_policy_controller_core::{
    condition::{reasons, POLICY_UNIMPLEMENTABLE},
    Condition, ConditionStatus, MAX_ANCESTORS,
};
use gke_policy_controller_k8s_api::{
    gateway::ParentReference,
    policy::{
        GcpTrafficDistributionPolicy, GcpTrafficDistributionPolicySpec,
        LocalPolicyTargetReference, PolicyStatus,
    },
};
use kubert::index::IndexNamespacedResource;
use pretty_assertions::assert_eq;
use rstest::rstest;

fn traffic_policy(name: &str, targets: &[&str]) -> GcpTrafficDistributionPolicy {
    GcpTrafficDistributionPolicy {
        metadata: meta(name, 0),
        spec: GcpTrafficDistributionPolicySpec {
            target_refs: targets
                .iter()
                .map(|name| LocalPolicyTargetReference {
                    group: String::new(),
                    kind: "Service".to_string(),
                    name: name.to_string(),
                })
                .collect(),
            default: None,
        },
        status: None,
    }
}

fn expected(name: &str, ancestors: Vec<PolicyAncestorStatus>) -> Update {
    Update {
        id: policy_id(PolicyKind::TrafficDistribution, name),
        patch: crate::index::make_patch(
            PolicyKind::TrafficDistribution,
            name,
            None,
            serde_json::json!({ "ancestors": ancestors }),
        ),
    }
}

fn foreign(i: usize) -> PolicyAncestorStatus {
    PolicyAncestorStatus {
        ancestor_ref: ParentReference {
            group: Some("gateway.networking.k8s.io".to_string()),
            kind: Some("Gateway".to_string()),
            namespace: Some("mesh".to_string()),
            name: format!("gw-{i}"),
            section_name: None,
            port: None,
        },
        controller_name: "example.net/mesh".to_string(),
        conditions: vec![],
    }
}

#[test]
fn detaches_removed_targets() {
    let mut harness = Harness::leader();
    harness.index.write().apply(service("web"));
    harness.index.write().apply(service("api"));

    harness
        .index
        .write()
        .apply(traffic_policy("spread", &["web", "api"]));
    let web = service_target("web");
    let api = service_target("api");
    assert_eq!(
        harness.drain(),
        vec![expected(
            "spread",
            vec![
                ancestor(&web, Attachment::Attached),
                ancestor(&api, Attachment::Attached)
            ]
        )]
    );

    harness.index.write().apply(traffic_policy("spread", &["web"]));
    assert_eq!(
        harness.drain(),
        vec![expected("spread", vec![ancestor(&web, Attachment::Attached)])]
    );
}

#[test]
fn preserves_foreign_ancestors() {
    let mut harness = Harness::leader();
    harness.index.write().apply(service("web"));

    let mut policy = traffic_policy("spread", &["web"]);
    policy.status = Some(PolicyStatus {
        ancestors: vec![foreign(0)],
    });
    harness.index.write().apply(policy);

    let web = service_target("web");
    assert_eq!(
        harness.drain(),
        vec![expected(
            "spread",
            vec![foreign(0), ancestor(&web, Attachment::Attached)]
        )]
    );
}

#[rstest]
#[case::reject(EvictionPolicy::Reject)]
#[case::evict_oldest(EvictionPolicy::EvictOldest)]
fn full_status_marks_ancestor_unimplementable(#[case] eviction: EvictionPolicy) {
    let mut harness = Harness::new(TEST_HOSTNAME, eviction);
    harness.index.write().apply(service("web"));

    let mut policy = traffic_policy("spread", &["web"]);
    policy.status = Some(PolicyStatus {
        ancestors: (0..MAX_ANCESTORS).map(foreign).collect(),
    });
    harness.index.write().apply(policy);

    // The policy's own status is unchanged; the Service is flagged instead.
    let web = service_target("web");
    let flagged = Condition::new(
        POLICY_UNIMPLEMENTABLE,
        ConditionStatus::True,
        reasons::ANCESTOR_STATUS_FULL,
        format!(
            "GCPTrafficDistributionPolicy {TEST_NAMESPACE}/spread already reports status for 16 \
             ancestors"
        ),
        DateTime::<Utc>::MIN_UTC,
    );
    assert_eq!(
        harness.drain(),
        vec![crate::index::ancestor_update(&web, Some(flagged)).unwrap()]
    );
    assert_eq!(harness.metrics.capacity_exceeded.get(), 1);

    IndexNamespacedResource::<GcpTrafficDistributionPolicy>::delete(
        &mut *harness.index.write(),
        TEST_NAMESPACE.to_string(),
        "spread".to_string(),
    );
    assert_eq!(
        harness.drain(),
        vec![crate::index::ancestor_update(&web, None).unwrap()]
    );
}
