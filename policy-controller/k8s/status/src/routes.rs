use ahash::AHashMap as HashMap;
use gke_policy_controller_core::PolicyTarget;
use gke_policy_controller_k8s_api::{self as k8s, gateway, Resource};
use std::collections::BTreeSet;

/// The Gateways an HTTPRoute attaches to and the Services it routes to.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct RouteRefs {
    pub parents: Vec<PolicyTarget>,
    pub backends: Vec<PolicyTarget>,
}

impl RouteRefs {
    pub(crate) fn from_spec(namespace: &str, spec: &gateway::HttpRouteSpec) -> Self {
        let parents = spec
            .inner
            .parent_refs
            .iter()
            .flatten()
            .filter_map(|parent| parent_gateway(parent, namespace))
            .collect();

        let backends = spec
            .rules
            .iter()
            .flatten()
            .flat_map(|rule| rule.backend_refs.iter().flatten())
            .filter_map(|backend| backend.backend_ref.as_ref())
            .filter_map(|backend| backend_service(&backend.inner, namespace))
            .collect();

        Self { parents, backends }
    }
}

/// Returns the ancestors a policy on `target` reports against.
///
/// A Service's ancestors are the Gateways of the HTTPRoutes that route to
/// it. Every other target, and a Service that no route uses, is its own
/// ancestor.
pub(crate) fn ancestors_of(
    routes: &HashMap<PolicyTarget, RouteRefs>,
    target: &PolicyTarget,
) -> Vec<PolicyTarget> {
    if !is_service(target) {
        return vec![target.clone()];
    }

    let gateways = routes
        .values()
        .filter(|route| route.backends.contains(target))
        .flat_map(|route| route.parents.iter().cloned())
        .collect::<BTreeSet<_>>();
    if gateways.is_empty() {
        return vec![target.clone()];
    }
    gateways.into_iter().collect()
}

fn is_service(target: &PolicyTarget) -> bool {
    target.group.is_empty() && target.kind == k8s::Service::kind(&())
}

fn parent_gateway(parent: &gateway::ParentReference, namespace: &str) -> Option<PolicyTarget> {
    // Unspecified group and kind default to a Gateway.
    let gateway_group = gateway::Gateway::group(&());
    let gateway_kind = gateway::Gateway::kind(&());
    let group = parent.group.as_deref().unwrap_or(&gateway_group);
    let kind = parent.kind.as_deref().unwrap_or(&gateway_kind);
    if group != gateway_group || kind != gateway_kind {
        return None;
    }
    Some(PolicyTarget {
        group: group.to_string(),
        kind: kind.to_string(),
        namespace: parent.namespace.as_deref().unwrap_or(namespace).to_string(),
        name: parent.name.clone(),
    })
}

fn backend_service(
    backend: &gateway::BackendObjectReference,
    namespace: &str,
) -> Option<PolicyTarget> {
    // Unspecified group and kind default to a core Service.
    let group = match backend.group.as_deref() {
        None | Some("core") => "",
        Some(group) => group,
    };
    let kind = backend.kind.as_deref().unwrap_or("Service");
    if !group.is_empty() || kind != k8s::Service::kind(&()) {
        return None;
    }
    Some(PolicyTarget {
        group: String::new(),
        kind: kind.to_string(),
        namespace: backend.namespace.as_deref().unwrap_or(namespace).to_string(),
        name: backend.name.clone(),
    })
}
