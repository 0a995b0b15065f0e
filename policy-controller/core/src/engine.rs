use crate::{
    condition::{reasons, POLICY_UNIMPLEMENTABLE},
    AncestorKey, AncestorRef, Applied, CapacityExceeded, Condition, ConditionSet, ControllerName,
    PolicyId, RegisterError, Report, Slot, StatusRegister, MAX_ANCESTORS,
};
use chrono::{DateTime, Utc};
use gke_policy_controller_k8s_api::policy::{PolicyAncestorStatus, PolicyStatus};
use parking_lot::Mutex;

/// Holds the ancestor status of a single policy and serializes every change
/// made to it.
#[derive(Debug, Default)]
pub struct PolicyEngine {
    register: Mutex<StatusRegister>,
}

impl PolicyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds an engine from a stored status, preserving entry order and
    /// every other controller's entries.
    ///
    /// Entries that do not parse are kept verbatim.
    pub fn from_status(status: &PolicyStatus) -> Result<Self, RegisterError> {
        let register = StatusRegister::from_entries(status.ancestors.iter().map(parse_slot))?;
        Ok(Self {
            register: Mutex::new(register),
        })
    }

    /// Records the conditions `controller` reports for `ancestor`, carrying
    /// forward the transition time of every condition whose status is
    /// unchanged.
    ///
    /// Fails without modifying the status when `ancestor` is new and the
    /// status is full.
    pub fn reconcile(
        &self,
        controller: &ControllerName,
        ancestor: AncestorRef,
        mut conditions: ConditionSet,
    ) -> Result<Applied, Unimplementable> {
        let key = AncestorKey::new(ancestor, controller.clone());

        let mut register = self.register.lock();
        if let Some(previous) = register.get(&key) {
            conditions.inherit_transition_times(previous);
        }
        let applied = register.upsert(key, conditions)?;
        tracing::trace!(?applied, entries = register.len(), "Reconciled ancestor");
        Ok(applied)
    }

    pub fn apply(&self, report: Report) -> Result<Applied, Unimplementable> {
        let Report { key, conditions } = report;
        self.reconcile(&key.controller, key.ancestor, conditions)
    }

    /// Removes the entry `controller` reported for `ancestor`.
    pub fn detach(&self, controller: &ControllerName, ancestor: &AncestorRef) -> bool {
        let key = AncestorKey::new(ancestor.clone(), controller.clone());
        self.register.lock().remove(&key).is_some()
    }

    /// Removes every entry owned by `controller` whose ancestor is not
    /// accepted by `keep`, returning the removed ancestors.
    pub fn retain(
        &self,
        controller: &ControllerName,
        keep: impl Fn(&AncestorRef) -> bool,
    ) -> Vec<AncestorRef> {
        let mut register = self.register.lock();
        let stale = register
            .ancestors_for(controller)
            .filter(|&ancestor| !keep(ancestor))
            .cloned()
            .collect::<Vec<_>>();
        for ancestor in &stale {
            register.remove(&AncestorKey::new(ancestor.clone(), controller.clone()));
        }
        stale
    }

    /// Adopts the entries of other controllers from an observed status.
    ///
    /// Entries that cannot be parsed are kept verbatim.
    pub fn observe(&self, ours: &ControllerName, status: &PolicyStatus) -> bool {
        let foreign = status
            .ancestors
            .iter()
            .filter(|entry| entry.controller_name != ours.as_str())
            .map(parse_slot)
            .collect::<Vec<_>>();
        self.register.lock().sync_foreign(ours, foreign)
    }

    pub fn ancestors(&self, controller: &ControllerName) -> Vec<AncestorRef> {
        self.register
            .lock()
            .ancestors_for(controller)
            .cloned()
            .collect()
    }

    pub fn conditions(&self, key: &AncestorKey) -> Option<ConditionSet> {
        self.register.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.register.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.register.lock().is_empty()
    }

    /// Returns the status in its external form, with entries in register
    /// order.
    pub fn snapshot(&self) -> PolicyStatus {
        let register = self.register.lock();
        let ancestors = register
            .slots()
            .iter()
            .map(|slot| match slot {
                Slot::Known(key, conditions) => PolicyAncestorStatus {
                    ancestor_ref: key.ancestor.clone().into(),
                    controller_name: key.controller.to_string(),
                    conditions: conditions.to_k8s(),
                },
                Slot::Opaque(entry) => entry.clone(),
            })
            .collect();
        PolicyStatus { ancestors }
    }
}

/// Returned when a policy cannot record status for a new ancestor.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("policy cannot be implemented on {}", .source.key.ancestor)]
pub struct Unimplementable {
    #[from]
    pub source: CapacityExceeded,
}

impl Unimplementable {
    pub fn ancestor(&self) -> &AncestorRef {
        &self.source.key.ancestor
    }

    /// The condition to surface on the ancestor that could not be recorded.
    pub fn condition(&self, kind: &str, policy: &PolicyId, now: DateTime<Utc>) -> Condition {
        Condition::new(
            POLICY_UNIMPLEMENTABLE,
            true,
            reasons::ANCESTOR_STATUS_FULL,
            format!(
                "{kind} {policy} already reports status for {MAX_ANCESTORS} ancestors"
            ),
            now,
        )
    }
}

fn parse_slot(entry: &PolicyAncestorStatus) -> Slot {
    match parse_entry(entry) {
        Ok((key, conditions)) => Slot::Known(key, conditions),
        Err(error) => {
            tracing::debug!(
                %error,
                controller = %entry.controller_name,
                "Keeping unparsed ancestor status"
            );
            Slot::Opaque(entry.clone())
        }
    }
}

fn parse_entry(
    entry: &PolicyAncestorStatus,
) -> Result<(AncestorKey, ConditionSet), RegisterError> {
    let controller = ControllerName::new(entry.controller_name.clone())?;
    let conditions = ConditionSet::from_stored(entry.conditions.iter().cloned())?;
    let key = AncestorKey::new(entry.ancestor_ref.clone().into(), controller);
    Ok((key, conditions))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        AncestorReporter, Attachment, Condition, ConditionStatus, EvictionPolicy, PolicyId,
        PolicyTarget, MAX_ANCESTORS,
    };
    use chrono::{DateTime, TimeZone, Utc};
    use gke_policy_controller_k8s_api::gateway::ParentReference;
    use pretty_assertions::assert_eq;
    use quickcheck::{quickcheck, Arbitrary, Gen};
    use std::sync::Arc;

    fn ours() -> ControllerName {
        ControllerName::new("networking.gke.io/gateway").unwrap()
    }

    fn theirs() -> ControllerName {
        ControllerName::new("example.net/mesh").unwrap()
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn service(name: &str) -> PolicyTarget {
        PolicyTarget {
            group: String::new(),
            kind: "Service".to_string(),
            namespace: "store".to_string(),
            name: name.to_string(),
        }
    }

    fn report(
        controller: ControllerName,
        target: &PolicyTarget,
        attachment: Attachment,
        now: DateTime<Utc>,
    ) -> Report {
        AncestorReporter::new(controller, EvictionPolicy::Reject)
            .report(target, &attachment, None, Some(1), now)
            .unwrap()
    }

    #[test]
    fn unchanged_status_keeps_transition_time() {
        let engine = PolicyEngine::new();
        let tgt = service("web");
        assert_eq!(
            engine.apply(report(ours(), &tgt, Attachment::Attached, at(0))),
            Ok(Applied::Inserted)
        );
        // Re-reporting the same outcome later is a no-op.
        assert_eq!(
            engine.apply(report(ours(), &tgt, Attachment::Attached, at(60))),
            Ok(Applied::Unchanged)
        );

        let key = AncestorKey::new(tgt.ancestor_ref(), ours());
        let attached = engine.conditions(&key).unwrap();
        assert_eq!(attached.get("Attached").unwrap().last_transition_time, at(0));

        let conflicted = Attachment::Conflicted {
            winner: PolicyId::new("store", "other"),
        };
        assert_eq!(
            engine.apply(report(ours(), &tgt, conflicted, at(120))),
            Ok(Applied::Updated)
        );
        let c = engine.conditions(&key).unwrap();
        let c = c.get("Attached").unwrap();
        assert_eq!(c.status, ConditionStatus::False);
        assert_eq!(c.last_transition_time, at(120));
    }

    #[test]
    fn seventeenth_ancestor_is_rejected() {
        let engine = PolicyEngine::new();
        for i in 0..MAX_ANCESTORS {
            engine
                .apply(report(ours(), &service(&format!("svc-{i}")), Attachment::Attached, at(0)))
                .unwrap();
        }
        let before = engine.snapshot();

        let err = engine
            .apply(report(ours(), &service("svc-16"), Attachment::Attached, at(0)))
            .expect_err("status is full");
        assert_eq!(err.ancestor().name, "svc-16");

        let c = err.condition("GCPBackendPolicy", &PolicyId::new("store", "p"), at(0));
        assert_eq!(c.type_, "PolicyUnimplementable");
        assert_eq!(c.reason, "AncestorStatusFull");
        assert_eq!(
            c.message,
            "GCPBackendPolicy store/p already reports status for 16 ancestors"
        );
        assert_eq!(engine.snapshot(), before);
        assert_eq!(engine.len(), MAX_ANCESTORS);
    }

    #[test]
    fn snapshot_round_trips() {
        let engine = PolicyEngine::new();
        engine
            .apply(report(theirs(), &service("a"), Attachment::Attached, at(0)))
            .unwrap();
        engine
            .apply(report(ours(), &service("b"), Attachment::TargetNotFound, at(5)))
            .unwrap();
        engine
            .apply(report(ours(), &service("a"), Attachment::Attached, at(9)))
            .unwrap();

        let status = engine.snapshot();
        let json = serde_json::to_value(&status).unwrap();
        let parsed: PolicyStatus = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, status);

        let restored = PolicyEngine::from_status(&parsed).expect("status must parse");
        assert_eq!(restored.snapshot(), status);
        assert_eq!(
            restored
                .ancestors(&ours())
                .into_iter()
                .map(|a| a.name)
                .collect::<Vec<_>>(),
            vec!["b", "a"]
        );
    }

    #[test]
    fn detach_only_removes_own_entry() {
        let engine = PolicyEngine::new();
        let tgt = service("web");
        engine
            .apply(report(theirs(), &tgt, Attachment::Attached, at(0)))
            .unwrap();
        engine
            .apply(report(ours(), &tgt, Attachment::Attached, at(0)))
            .unwrap();

        assert!(engine.detach(&ours(), &tgt.ancestor_ref()));
        assert!(!engine.detach(&ours(), &tgt.ancestor_ref()));
        let status = engine.snapshot();
        assert_eq!(status.ancestors.len(), 1);
        assert_eq!(status.ancestors[0].controller_name, "example.net/mesh");
    }

    #[test]
    fn retain_drops_stale_ancestors() {
        let engine = PolicyEngine::new();
        for name in ["a", "b", "c"] {
            engine
                .apply(report(ours(), &service(name), Attachment::Attached, at(0)))
                .unwrap();
        }
        engine
            .apply(report(theirs(), &service("b"), Attachment::Attached, at(0)))
            .unwrap();

        let removed = engine.retain(&ours(), |a| a.name != "b");
        assert_eq!(removed, vec![service("b").ancestor_ref()]);
        assert_eq!(engine.len(), 3);
    }

    #[test]
    fn observe_adopts_foreign_entries() {
        let engine = PolicyEngine::new();
        engine
            .apply(report(ours(), &service("a"), Attachment::Attached, at(0)))
            .unwrap();

        let foreign = PolicyAncestorStatus {
            ancestor_ref: ParentReference {
                group: Some(String::new()),
                kind: Some("Service".to_string()),
                namespace: Some("store".to_string()),
                name: "b".to_string(),
                section_name: None,
                port: None,
            },
            controller_name: theirs().to_string(),
            conditions: vec![Condition::new("Ready", true, "Ready", "", at(0)).into()],
        };
        let unparsed = PolicyAncestorStatus {
            controller_name: "Example.NET/mesh".to_string(),
            ..foreign.clone()
        };
        // A stale copy of our own entry must not clobber the live one.
        let stale_own = PolicyAncestorStatus {
            controller_name: ours().to_string(),
            conditions: vec![],
            ..foreign.clone()
        };
        let observed = PolicyStatus {
            ancestors: vec![unparsed.clone(), foreign, stale_own],
        };

        assert!(engine.observe(&ours(), &observed));
        assert!(!engine.observe(&ours(), &observed));
        let status = engine.snapshot();
        assert_eq!(
            status
                .ancestors
                .iter()
                .map(|a| (a.controller_name.as_str(), a.ancestor_ref.name.as_str()))
                .collect::<Vec<_>>(),
            vec![
                ("networking.gke.io/gateway", "a"),
                ("Example.NET/mesh", "b"),
                ("example.net/mesh", "b"),
            ]
        );
        // Written back exactly as observed.
        assert_eq!(status.ancestors[1], unparsed);
        assert_eq!(engine.len(), 3);
    }

    #[test]
    fn from_status_keeps_unparsed_entries() {
        let engine = PolicyEngine::new();
        engine
            .apply(report(ours(), &service("a"), Attachment::Attached, at(0)))
            .unwrap();
        let mut status = engine.snapshot();
        let mut foreign = status.ancestors[0].clone();
        foreign.controller_name = "Example.NET/mesh".to_string();
        foreign.conditions[0].status = "Maybe".to_string();
        status.ancestors.insert(0, foreign);

        let restored = PolicyEngine::from_status(&status).expect("status must load");
        assert_eq!(restored.snapshot(), status);
        assert_eq!(restored.ancestors(&ours()), vec![service("a").ancestor_ref()]);
    }

    #[test]
    fn from_status_rejects_duplicates() {
        let engine = PolicyEngine::new();
        engine
            .apply(report(ours(), &service("a"), Attachment::Attached, at(0)))
            .unwrap();
        let mut status = engine.snapshot();
        status.ancestors.push(status.ancestors[0].clone());
        assert!(matches!(
            PolicyEngine::from_status(&status),
            Err(RegisterError::DuplicateKey(_))
        ));
    }

    #[test]
    fn concurrent_reconciles_are_serialized() {
        let engine = Arc::new(PolicyEngine::new());
        let handles = (0..MAX_ANCESTORS)
            .map(|i| {
                let engine = engine.clone();
                std::thread::spawn(move || {
                    let tgt = service(&format!("svc-{i}"));
                    for n in 0..50 {
                        let attachment = if n % 2 == 0 {
                            Attachment::Attached
                        } else {
                            Attachment::TargetNotFound
                        };
                        engine
                            .apply(report(ours(), &tgt, attachment, at(n)))
                            .expect("each thread owns one ancestor");
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().expect("thread must not panic");
        }

        let status = engine.snapshot();
        assert_eq!(status.ancestors.len(), MAX_ANCESTORS);
        for entry in &status.ancestors {
            assert_eq!(entry.conditions.len(), 1);
            assert_eq!(entry.conditions[0].reason, "TargetNotFound");
        }
    }

    #[derive(Clone, Debug)]
    struct Entry {
        target: u8,
        foreign: bool,
        attached: bool,
        secs: u16,
    }

    impl Arbitrary for Entry {
        fn arbitrary(g: &mut Gen) -> Self {
            Self {
                // Two controllers over eight targets stay within capacity.
                target: u8::arbitrary(g) % 8,
                foreign: bool::arbitrary(g),
                attached: bool::arbitrary(g),
                secs: u16::arbitrary(g),
            }
        }
    }

    quickcheck! {
        fn restores_from_snapshot(entries: Vec<Entry>) -> bool {
            let engine = PolicyEngine::new();
            for e in entries {
                let controller = if e.foreign { theirs() } else { ours() };
                let attachment = if e.attached {
                    Attachment::Attached
                } else {
                    Attachment::TargetNotFound
                };
                let target = service(&format!("svc-{}", e.target));
                if engine
                    .apply(report(controller, &target, attachment, at(e.secs.into())))
                    .is_err()
                {
                    return false;
                }
            }

            let restored = match PolicyEngine::from_status(&engine.snapshot()) {
                Ok(restored) => restored,
                Err(_) => return false,
            };
            let equal = *restored.register.lock() == *engine.register.lock();
            equal
        }
    }
}
