use crate::{
    condition::ATTACHED, AncestorKey, AncestorRef, Attachment, Condition, ConditionSet,
    ConditionsExceeded, ControllerName, EvictionPolicy, PolicyTarget,
};
use chrono::{DateTime, Utc};

/// Builds this controller's ancestor entries from conflict resolution
/// outcomes.
#[derive(Clone, Debug)]
pub struct AncestorReporter {
    controller: ControllerName,
    eviction: EvictionPolicy,
}

/// The conditions a controller reports for a single ancestor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Report {
    pub key: AncestorKey,
    pub conditions: ConditionSet,
}

impl AncestorReporter {
    pub fn new(controller: ControllerName, eviction: EvictionPolicy) -> Self {
        Self {
            controller,
            eviction,
        }
    }

    pub fn controller(&self) -> &ControllerName {
        &self.controller
    }

    pub fn eviction(&self) -> EvictionPolicy {
        self.eviction
    }

    /// Reports `attachment` on the target's ancestor entry, followed by any
    /// additional conditions in the order given.
    ///
    /// The `Attached` condition is always derived from `attachment`; extra
    /// conditions of that type are ignored.
    pub fn report(
        &self,
        target: &PolicyTarget,
        attachment: &Attachment,
        extra: impl IntoIterator<Item = Condition>,
        generation: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<Report, ConditionsExceeded> {
        self.report_on(target.ancestor_ref(), target, attachment, extra, generation, now)
    }

    /// Like [`Self::report`], but records the entry under `ancestor`, an
    /// object above the target in the routing hierarchy.
    pub fn report_on(
        &self,
        ancestor: AncestorRef,
        target: &PolicyTarget,
        attachment: &Attachment,
        extra: impl IntoIterator<Item = Condition>,
        generation: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<Report, ConditionsExceeded> {
        let mut conditions = ConditionSet::new();
        conditions.set(
            attachment.condition(target, generation, now),
            self.eviction,
        )?;
        for condition in extra {
            if condition.type_ == ATTACHED {
                tracing::debug!(%target, "Ignoring extra Attached condition");
                continue;
            }
            conditions.set(condition.with_generation(generation), self.eviction)?;
        }

        Ok(Report {
            key: AncestorKey::new(ancestor, self.controller.clone()),
            conditions,
        })
    }
}
