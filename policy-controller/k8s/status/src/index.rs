use crate::{
    metrics::IndexMetrics,
    policy::{Policy, PolicyKind, PolicyMeta},
    resource_id::NamespaceGroupKindName,
    routes::{self, RouteRefs},
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use chrono::{DateTime, Utc};
use gke_policy_controller_core::{
    condition::ATTACHED, AncestorReporter, Attachment, Candidate, Condition,
    ConditionSet, ConditionStatus, ConflictResolver, ControllerName, EvictionPolicy,
    PolicyEngine, PolicyId, PolicyTarget, Resolution,
};
use gke_policy_controller_k8s_api::{
    self as k8s,
    gateway,
    policy::{PolicyStatus, POLICY_API_GROUP},
    Resource, ResourceExt,
};
use kubert::lease::Claim;
use parking_lot::RwLock;
use std::{
    collections::{hash_map::Entry, BTreeMap, BTreeSet},
    sync::Arc,
};
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        watch,
    },
    time::{self, Duration},
};

const POLICY_API_VERSION: &str = "networking.gke.io/v1";

pub type SharedIndex = Arc<RwLock<Index>>;

/// Tracks policies and the objects they target, and computes the status of
/// each policy.
pub struct Index {
    /// Compared against the current claim holder to determine whether this
    /// instance may write status.
    name: String,
    claims: watch::Receiver<Arc<Claim>>,
    updates: mpsc::Sender<Update>,
    metrics: IndexMetrics,
    reporter: AncestorReporter,

    policies: HashMap<PolicyRef, PolicyState>,

    /// Target objects known to exist.
    targets: HashSet<PolicyTarget>,

    /// The parents and backends of each HTTPRoute, from which the ancestors
    /// of Service targets are derived.
    routes: HashMap<PolicyTarget, RouteRefs>,

    /// Ancestors that a policy could not record, with the condition each
    /// blocked policy would surface on them.
    unimplementable: HashMap<PolicyTarget, BTreeMap<PolicyRef, Condition>>,

    /// The unimplementable message last applied to each ancestor.
    flagged: HashMap<PolicyTarget, String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct PolicyRef {
    kind: PolicyKind,
    id: PolicyId,
}

struct PolicyState {
    meta: PolicyMeta,
    engine: PolicyEngine,
    /// Top-level conditions, including those written by others.
    conditions: ConditionSet,
    /// The status as last observed on the object.
    stored: serde_json::Value,
    /// The status last enqueued and the resource version it was patched
    /// against.
    pending: Option<(Option<String>, serde_json::Value)>,
}

#[derive(Debug, PartialEq)]
pub struct Update {
    pub id: NamespaceGroupKindName,
    pub patch: k8s::Patch<serde_json::Value>,
}

impl Index {
    pub fn shared(
        name: impl ToString,
        claims: watch::Receiver<Arc<Claim>>,
        updates: mpsc::Sender<Update>,
        metrics: IndexMetrics,
        controller_name: ControllerName,
        eviction: EvictionPolicy,
    ) -> SharedIndex {
        Arc::new(RwLock::new(Self {
            name: name.to_string(),
            claims,
            updates,
            metrics,
            reporter: AncestorReporter::new(controller_name, eviction),
            policies: HashMap::new(),
            targets: HashSet::new(),
            routes: HashMap::new(),
            unimplementable: HashMap::new(),
            flagged: HashMap::new(),
        }))
    }

    /// Re-resolves every policy on a fixed interval and whenever the lease
    /// changes hands. While this instance holds the lease, every status that
    /// differs from the stored one is sent again.
    pub async fn run(index: SharedIndex, reconciliation_period: Duration) {
        let mut claims = index.read().claims.clone();
        let mut interval = time::interval(reconciliation_period);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            let lease_changed = tokio::select! {
                _ = interval.tick() => false,
                res = claims.changed() => {
                    if res.is_err() {
                        tracing::debug!("Lease claims closed");
                        return;
                    }
                    true
                }
            };

            let claim = claims.borrow_and_update().clone();
            let mut guard = index.write();
            if !claim.is_current_for(&guard.name) {
                tracing::trace!(
                    holder = %claim.holder,
                    "Not the lease holder; skipping reconciliation"
                );
                continue;
            }
            guard.reconcile(lease_changed);
        }
    }

    /// Resends stale statuses. Ancestor flags are only re-applied when the
    /// lease changed hands.
    pub(crate) fn reconcile(&mut self, lease_changed: bool) {
        for kind in PolicyKind::ALL {
            self.reconcile_kind(kind, true);
        }
        self.sync_unimplementable(lease_changed);
    }

    fn is_leader(&self) -> bool {
        self.claims.borrow().is_current_for(&self.name)
    }

    fn apply_policy<P: Policy>(&mut self, policy: P) {
        let Some(namespace) = policy.namespace() else {
            tracing::warn!(
                kind = %P::KIND,
                name = %policy.name_any(),
                "Ignoring policy without a namespace"
            );
            return;
        };
        let pref = PolicyRef {
            kind: P::KIND,
            id: PolicyId::new(namespace.clone(), policy.name_unchecked()),
        };
        let meta = policy.index_meta(&namespace);
        let controller = self.reporter.controller();
        let stored = status_value(pref.kind, &meta.stored_ancestors, &meta.stored_conditions);

        match self.policies.entry(pref.clone()) {
            Entry::Vacant(entry) => {
                let engine = match PolicyEngine::from_status(&meta.stored_ancestors) {
                    Ok(engine) => engine,
                    Err(error) => {
                        tracing::warn!(
                            kind = %pref.kind,
                            policy = %pref.id,
                            %error,
                            "Ignoring stored ancestor status"
                        );
                        let engine = PolicyEngine::new();
                        engine.observe(controller, &meta.stored_ancestors);
                        engine
                    }
                };
                let conditions = stored_conditions(&meta.stored_conditions);
                entry.insert(PolicyState {
                    meta,
                    engine,
                    conditions,
                    stored,
                    pending: None,
                });
            }
            Entry::Occupied(mut entry) => {
                let state = entry.get_mut();
                let foreign_changed = state.engine.observe(controller, &meta.stored_ancestors);
                let conditions = merge_conditions(&state.conditions, &meta.stored_conditions);
                let unchanged = !foreign_changed
                    && conditions == state.conditions
                    && state.stored == stored
                    && state.meta.resource_version == meta.resource_version
                    && state.meta.targets == meta.targets
                    && state.meta.created_at == meta.created_at
                    && state.meta.generation == meta.generation
                    && state.meta.invalid == meta.invalid;
                state.conditions = conditions;
                state.stored = stored;
                state.meta = meta;
                if unchanged {
                    return;
                }
            }
        }

        self.reconcile_kind(pref.kind, false);
        self.sync_unimplementable(false);
    }

    fn delete_policy(&mut self, kind: PolicyKind, namespace: String, name: String) {
        let pref = PolicyRef {
            kind,
            id: PolicyId::new(namespace, name),
        };
        if self.policies.remove(&pref).is_none() {
            return;
        }
        tracing::debug!(%kind, policy = %pref.id, "Policy deleted");
        self.reconcile_kind(kind, false);
        self.sync_unimplementable(false);
    }

    fn apply_target(&mut self, target: PolicyTarget) {
        if self.targets.insert(target.clone()) {
            self.reconcile_targeting(&target);
        }
    }

    fn delete_target(&mut self, target: PolicyTarget) {
        if self.targets.remove(&target) {
            self.reconcile_targeting(&target);
        }
    }

    fn apply_route(&mut self, route: PolicyTarget, refs: RouteRefs) {
        let changed = self.routes.get(&route) != Some(&refs);
        self.routes.insert(route.clone(), refs);
        self.apply_target(route);
        if changed {
            self.reconcile_ancestry();
        }
    }

    fn delete_route(&mut self, route: PolicyTarget) {
        let removed = self.routes.remove(&route).is_some();
        self.delete_target(route);
        if removed {
            self.reconcile_ancestry();
        }
    }

    /// Re-reports the policies whose ancestors are derived from routes.
    fn reconcile_ancestry(&mut self) {
        let kinds = self
            .policies
            .keys()
            .map(|pref| pref.kind)
            .filter(PolicyKind::writes_ancestors)
            .collect::<BTreeSet<_>>();
        if kinds.is_empty() {
            return;
        }
        for kind in kinds {
            self.reconcile_kind(kind, false);
        }
        self.sync_unimplementable(false);
    }

    fn reconcile_targeting(&mut self, target: &PolicyTarget) {
        let kinds = self
            .policies
            .iter()
            .filter(|(_, state)| state.meta.targets.contains(target))
            .map(|(pref, _)| pref.kind)
            .collect::<BTreeSet<_>>();
        if kinds.is_empty() {
            return;
        }
        for kind in kinds {
            self.reconcile_kind(kind, false);
        }
        self.sync_unimplementable(false);
    }

    /// Resolves every policy of `kind` against its targets and enqueues the
    /// statuses that differ from the stored ones.
    ///
    /// A status already enqueued against the current resource version is
    /// only enqueued again when `retry` is set.
    fn reconcile_kind(&mut self, kind: PolicyKind, retry: bool) {
        #[cfg(not(test))]
        let now = Utc::now();
        #[cfg(test)]
        let now = DateTime::<Utc>::MIN_UTC;

        let resolutions = self.resolve(kind);

        let mut blocked = Vec::new();
        let mut updates = Vec::new();
        for (pref, state) in self.policies.iter_mut().filter(|(p, _)| p.kind == kind) {
            let attachments = state
                .meta
                .targets
                .iter()
                .map(|target| {
                    let attachment = resolutions
                        .get(target)
                        .and_then(|r| r.get(&pref.id))
                        .cloned()
                        .unwrap_or(Attachment::TargetNotFound);
                    (target, attachment)
                })
                .collect::<Vec<_>>();

            if kind.writes_ancestors() {
                let mut current = Vec::new();
                for (ancestor, target, attachment) in ancestry(&self.routes, &attachments) {
                    let ancestor_ref = ancestor.ancestor_ref();
                    current.push(ancestor_ref.clone());
                    let report = match self.reporter.report_on(
                        ancestor_ref,
                        target,
                        attachment,
                        std::iter::empty(),
                        state.meta.generation,
                        now,
                    ) {
                        Ok(report) => report,
                        Err(error) => {
                            tracing::warn!(
                                %kind,
                                policy = %pref.id,
                                %error,
                                "Failed to report ancestor status"
                            );
                            continue;
                        }
                    };
                    if let Err(error) = state.engine.apply(report) {
                        tracing::info!(%kind, policy = %pref.id, %error, "Ancestor status is full");
                        self.metrics.capacity_exceeded.inc();
                        blocked.push((
                            ancestor,
                            pref.clone(),
                            error.condition(kind.kind(), &pref.id, now),
                        ));
                    }
                }

                for ancestor in state
                    .engine
                    .retain(self.reporter.controller(), |a| current.contains(a))
                {
                    tracing::debug!(%kind, policy = %pref.id, %ancestor, "Detached ancestor");
                }
            }

            if kind.writes_conditions() {
                let previous = state.conditions.clone();
                let condition = policy_condition(&attachments, state.meta.generation, now);
                set_attached(&mut state.conditions, condition);
                state.conditions.inherit_transition_times(&previous);
            }

            let status = status_value(kind, &state.engine.snapshot(), &state.conditions.to_k8s());
            if status == state.stored {
                continue;
            }
            let version = state.meta.resource_version.clone();
            let in_flight = state
                .pending
                .as_ref()
                .map_or(false, |(v, s)| *v == version && *s == status);
            if retry || !in_flight {
                updates.push((pref.clone(), version, status));
            }
        }

        for marks in self.unimplementable.values_mut() {
            marks.retain(|pref, _| pref.kind != kind);
        }
        for (target, pref, condition) in blocked {
            self.unimplementable
                .entry(target)
                .or_default()
                .insert(pref, condition);
        }
        self.unimplementable.retain(|_, marks| !marks.is_empty());

        for (pref, version, status) in updates {
            let id = NamespaceGroupKindName::new(
                pref.id.namespace.clone(),
                POLICY_API_GROUP,
                kind.kind(),
                pref.id.name.clone(),
            );
            let patch = make_patch(kind, &pref.id.name, version.as_deref(), status.clone());
            if self.send(id, patch) {
                if let Some(state) = self.policies.get_mut(&pref) {
                    state.pending = Some((version, status));
                }
            }
        }
    }

    fn resolve(&self, kind: PolicyKind) -> HashMap<PolicyTarget, Resolution> {
        let mut contenders = HashMap::<&PolicyTarget, Vec<Candidate>>::new();
        for (pref, state) in self.policies.iter().filter(|(p, _)| p.kind == kind) {
            for target in &state.meta.targets {
                contenders.entry(target).or_default().push(Candidate {
                    id: pref.id.clone(),
                    created_at: state.meta.created_at,
                    invalid: state.meta.invalid.clone(),
                });
            }
        }

        let resolver = ConflictResolver::new(|t: &PolicyTarget| self.targets.contains(t));
        contenders
            .into_iter()
            .map(|(target, candidates)| {
                let resolution = resolver.resolve(target, &candidates);
                (target.clone(), resolution)
            })
            .collect()
    }

    /// Applies or clears the unimplementable condition on each ancestor whose
    /// state changed, or on all flagged ancestors if `force` is set.
    fn sync_unimplementable(&mut self, force: bool) {
        let desired = self
            .unimplementable
            .iter()
            .filter_map(|(target, marks)| {
                let (_, condition) = marks.iter().next()?;
                Some((target.clone(), condition.clone()))
            })
            .collect::<Vec<_>>();

        for (target, condition) in desired {
            if !force && self.flagged.get(&target) == Some(&condition.message) {
                continue;
            }
            let message = condition.message.clone();
            let Some(update) = ancestor_update(&target, Some(condition)) else {
                continue;
            };
            if self.send(update.id, update.patch) {
                self.flagged.insert(target, message);
            }
        }

        let cleared = self
            .flagged
            .keys()
            .filter(|target| !self.unimplementable.contains_key(*target))
            .cloned()
            .collect::<Vec<_>>();
        for target in cleared {
            let Some(update) = ancestor_update(&target, None) else {
                self.flagged.remove(&target);
                continue;
            };
            if self.send(update.id, update.patch) {
                self.flagged.remove(&target);
            }
        }
    }

    fn send(&self, id: NamespaceGroupKindName, patch: k8s::Patch<serde_json::Value>) -> bool {
        if !self.is_leader() {
            tracing::trace!(%id, "Not the lease holder; not sending update");
            return false;
        }

        match self.updates.try_send(Update { id, patch }) {
            Ok(()) => {
                self.metrics.patch_enqueues.inc();
                true
            }
            Err(TrySendError::Full(Update { id, .. })) => {
                self.metrics.patch_channel_full.inc();
                tracing::warn!(%id, "Status update queue is full");
                false
            }
            Err(TrySendError::Closed(Update { id, .. })) => {
                tracing::error!(%id, "Status update queue is closed");
                false
            }
        }
    }
}

impl<P: Policy> kubert::index::IndexNamespacedResource<P> for Index {
    fn apply(&mut self, resource: P) {
        self.apply_policy(resource);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.delete_policy(P::KIND, namespace, name);
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Service> for Index {
    fn apply(&mut self, resource: k8s::Service) {
        if let Some(target) = target_of(&resource) {
            self.apply_target(target);
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.delete_target(target::<k8s::Service>(namespace, name));
    }
}

impl kubert::index::IndexNamespacedResource<gateway::Gateway> for Index {
    fn apply(&mut self, resource: gateway::Gateway) {
        if let Some(target) = target_of(&resource) {
            self.apply_target(target);
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.delete_target(target::<gateway::Gateway>(namespace, name));
    }
}

impl kubert::index::IndexNamespacedResource<gateway::HttpRoute> for Index {
    fn apply(&mut self, resource: gateway::HttpRoute) {
        if let Some(route) = target_of(&resource) {
            let refs = RouteRefs::from_spec(&route.namespace, &resource.spec);
            self.apply_route(route, refs);
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.delete_route(target::<gateway::HttpRoute>(namespace, name));
    }
}

fn target<T: Resource<DynamicType = ()>>(namespace: String, name: String) -> PolicyTarget {
    PolicyTarget {
        group: T::group(&()).into_owned(),
        kind: T::kind(&()).into_owned(),
        namespace,
        name,
    }
}

fn target_of<T: Resource<DynamicType = ()>>(resource: &T) -> Option<PolicyTarget> {
    let Some(namespace) = resource.namespace() else {
        tracing::warn!(
            kind = %T::kind(&()),
            name = %resource.name_any(),
            "Ignoring object without a namespace"
        );
        return None;
    };
    Some(target::<T>(namespace, resource.name_unchecked()))
}

/// Pairs each target with the ancestors it is reported under. An ancestor
/// shared by several targets is reported once, preferring a target the policy
/// is attached to.
fn ancestry<'a>(
    routes: &HashMap<PolicyTarget, RouteRefs>,
    attachments: &'a [(&'a PolicyTarget, Attachment)],
) -> Vec<(PolicyTarget, &'a PolicyTarget, &'a Attachment)> {
    let mut ancestry = Vec::<(PolicyTarget, &PolicyTarget, &Attachment)>::new();
    for (target, attachment) in attachments {
        for ancestor in routes::ancestors_of(routes, target) {
            match ancestry.iter_mut().find(|(a, _, _)| *a == ancestor) {
                Some(entry) if !entry.2.is_attached() && attachment.is_attached() => {
                    *entry = (ancestor, *target, attachment);
                }
                Some(_) => {}
                None => ancestry.push((ancestor, *target, attachment)),
            }
        }
    }
    ancestry
}

/// Builds the `Attached` condition reported at the top level of a policy's
/// status from its per-target outcomes.
fn policy_condition(
    attachments: &[(&PolicyTarget, Attachment)],
    generation: Option<i64>,
    now: DateTime<Utc>,
) -> Condition {
    match attachments {
        [] => Condition::new(
            ATTACHED,
            ConditionStatus::False,
            Attachment::TargetNotFound.reason(),
            "Policy has no targets",
            now,
        )
        .with_generation(generation),
        [(target, attachment)] => attachment.condition(target, generation, now),
        many => {
            let attached = many.iter().filter(|(_, a)| a.is_attached()).count();
            if attached == 0 {
                let (target, attachment) = &many[0];
                return attachment.condition(target, generation, now);
            }
            Condition::new(
                ATTACHED,
                ConditionStatus::True,
                Attachment::Attached.reason(),
                format!("Policy is attached to {attached} of {} targets", many.len()),
                now,
            )
            .with_generation(generation)
        }
    }
}

fn stored_conditions(stored: &[k8s::Condition]) -> ConditionSet {
    ConditionSet::from_stored(stored.iter().cloned()).unwrap_or_else(|error| {
        tracing::debug!(%error, "Ignoring stored policy conditions");
        ConditionSet::new()
    })
}

/// Adopts the stored conditions, in stored order, while keeping the
/// `Attached` condition this controller last computed.
fn merge_conditions(current: &ConditionSet, stored: &[k8s::Condition]) -> ConditionSet {
    let mut merged = stored_conditions(stored);
    if let Some(attached) = current.get(ATTACHED) {
        set_attached(&mut merged, attached.clone());
    }
    merged
}

/// Records this controller's `Attached` condition. When the set is full of
/// conditions written by others, the oldest of them is dropped to make room.
fn set_attached(conditions: &mut ConditionSet, attached: Condition) {
    if let Err(error) = conditions.set(attached.clone(), EvictionPolicy::Reject) {
        tracing::warn!(%error, "Policy conditions are full; evicting the oldest condition");
        if let Err(error) = conditions.set(attached, EvictionPolicy::EvictOldest) {
            tracing::error!(%error, "Failed to record policy condition");
        }
    }
}

fn status_value(
    kind: PolicyKind,
    ancestors: &PolicyStatus,
    conditions: &[k8s::Condition],
) -> serde_json::Value {
    let mut status = serde_json::Map::new();
    if kind.writes_ancestors() {
        status.insert(
            "ancestors".to_string(),
            serde_json::json!(ancestors.ancestors),
        );
    }
    if kind.writes_conditions() {
        status.insert("conditions".to_string(), serde_json::json!(conditions));
    }
    serde_json::Value::Object(status)
}

/// Builds a merge patch of a policy's status. When the observed resource
/// version is known the patch is conditional on it, so the API server rejects
/// it with a conflict if the object changed since it was last observed.
pub(crate) fn make_patch(
    kind: PolicyKind,
    name: &str,
    resource_version: Option<&str>,
    status: serde_json::Value,
) -> k8s::Patch<serde_json::Value> {
    let mut value = serde_json::json!({
        "apiVersion": POLICY_API_VERSION,
        "kind": kind.kind(),
        "name": name,
        "status": status,
    });
    if let Some(resource_version) = resource_version {
        value["metadata"] = serde_json::json!({ "resourceVersion": resource_version });
    }
    k8s::Patch::Merge(value)
}

/// Builds a server-side apply of the unimplementable condition onto an
/// ancestor, or of an empty condition list to clear it.
pub(crate) fn ancestor_update(
    target: &PolicyTarget,
    condition: Option<Condition>,
) -> Option<Update> {
    let api_version = if is_kind::<k8s::Service>(target) {
        k8s::Service::api_version(&())
    } else if is_kind::<gateway::Gateway>(target) {
        gateway::Gateway::api_version(&())
    } else {
        tracing::debug!(%target, "Cannot mark ancestor unimplementable");
        return None;
    };

    let conditions = condition
        .into_iter()
        .map(k8s::Condition::from)
        .collect::<Vec<_>>();
    let value = serde_json::json!({
        "apiVersion": api_version,
        "kind": target.kind,
        "metadata": {
            "name": target.name,
            "namespace": target.namespace,
        },
        "status": {
            "conditions": conditions,
        },
    });

    Some(Update {
        id: NamespaceGroupKindName::new(
            target.namespace.clone(),
            target.group.clone(),
            target.kind.clone(),
            target.name.clone(),
        ),
        patch: k8s::Patch::Apply(value),
    })
}

fn is_kind<T: Resource<DynamicType = ()>>(target: &PolicyTarget) -> bool {
    target.group == T::group(&()) && target.kind.eq_ignore_ascii_case(&T::kind(&()))
}
