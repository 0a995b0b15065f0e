//! Status conditions and the bounded, type-keyed set that holds them.

use chrono::{DateTime, SubsecRound, Utc};
use gke_policy_controller_k8s_api::{self as k8s, Time};
use std::{fmt, str::FromStr};

/// The maximum number of conditions a single ancestor entry may carry.
pub const MAX_CONDITIONS_PER_ANCESTOR: usize = 8;

/// Set on every ancestor this controller reports on.
pub const ATTACHED: &str = "Attached";

pub mod reasons {
    pub const ATTACHED: &str = "Attached";
    pub const CONFLICTED: &str = "Conflicted";
    pub const INVALID: &str = "Invalid";
    pub const TARGET_NOT_FOUND: &str = "TargetNotFound";
    pub const ANCESTOR_STATUS_FULL: &str = "AncestorStatusFull";
}

/// Set on a target object whose policy could not record status about it.
pub const POLICY_UNIMPLEMENTABLE: &str = "PolicyUnimplementable";

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Condition {
    pub type_: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
    pub observed_generation: Option<i64>,
}

/// What to do when a ninth distinct condition type is added to a set.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum EvictionPolicy {
    #[default]
    Reject,
    EvictOldest,
}

/// An ordered set of conditions with unique types.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConditionSet(Vec<Condition>);

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("cannot add condition {type_:?}: an ancestor may carry at most 8 conditions")]
pub struct ConditionsExceeded {
    pub type_: String,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum InvalidCondition {
    #[error("condition {type_:?} has unknown status {status:?}")]
    Status { type_: String, status: String },

    #[error("duplicate condition type {0:?}")]
    DuplicateType(String),

    #[error(transparent)]
    Exceeded(#[from] ConditionsExceeded),
}

// === impl ConditionStatus ===

impl ConditionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::True => "True",
            Self::False => "False",
            Self::Unknown => "Unknown",
        }
    }
}

impl From<bool> for ConditionStatus {
    fn from(b: bool) -> Self {
        if b {
            Self::True
        } else {
            Self::False
        }
    }
}

impl FromStr for ConditionStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "True" => Ok(Self::True),
            "False" => Ok(Self::False),
            "Unknown" => Ok(Self::Unknown),
            _ => Err(()),
        }
    }
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl Condition ===

impl Condition {
    /// Builds a condition stamped with `now`, truncated to the second
    /// precision that survives serialization.
    pub fn new(
        type_: impl Into<String>,
        status: impl Into<ConditionStatus>,
        reason: impl Into<String>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status: status.into(),
            reason: reason.into(),
            message: message.into(),
            last_transition_time: now.trunc_subsecs(0),
            observed_generation: None,
        }
    }

    pub fn with_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

impl From<Condition> for k8s::Condition {
    fn from(c: Condition) -> Self {
        k8s::Condition {
            type_: c.type_,
            status: c.status.as_str().to_string(),
            reason: c.reason,
            message: c.message,
            last_transition_time: Time(c.last_transition_time),
            observed_generation: c.observed_generation,
        }
    }
}

impl TryFrom<k8s::Condition> for Condition {
    type Error = InvalidCondition;

    fn try_from(c: k8s::Condition) -> Result<Self, Self::Error> {
        let status = c.status.parse().map_err(|()| InvalidCondition::Status {
            type_: c.type_.clone(),
            status: c.status.clone(),
        })?;
        Ok(Self {
            type_: c.type_,
            status,
            reason: c.reason,
            message: c.message,
            last_transition_time: c.last_transition_time.0,
            observed_generation: c.observed_generation,
        })
    }
}

// === impl ConditionSet ===

impl ConditionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Condition> + '_ {
        self.0.iter()
    }

    pub fn get(&self, type_: &str) -> Option<&Condition> {
        self.0.iter().find(|c| c.type_ == type_)
    }

    /// Sets a condition, replacing any existing condition of the same type
    /// in place.
    ///
    /// A new type added to a full set either fails or displaces the
    /// condition with the oldest transition time, per `eviction`.
    pub fn set(
        &mut self,
        condition: Condition,
        eviction: EvictionPolicy,
    ) -> Result<(), ConditionsExceeded> {
        if let Some(existing) = self.0.iter_mut().find(|c| c.type_ == condition.type_) {
            *existing = condition;
            return Ok(());
        }

        if self.0.len() >= MAX_CONDITIONS_PER_ANCESTOR {
            match eviction {
                EvictionPolicy::Reject => {
                    return Err(ConditionsExceeded {
                        type_: condition.type_,
                    })
                }
                EvictionPolicy::EvictOldest => {
                    // `min_by_key` returns the first minimum, so ties go to
                    // the earliest position.
                    if let Some((idx, _)) = self
                        .0
                        .iter()
                        .enumerate()
                        .min_by_key(|(_, c)| c.last_transition_time)
                    {
                        let evicted = self.0.remove(idx);
                        tracing::debug!(
                            evicted = %evicted.type_,
                            added = %condition.type_,
                            "Evicted oldest condition"
                        );
                    }
                }
            }
        }

        self.0.push(condition);
        Ok(())
    }

    pub fn remove(&mut self, type_: &str) -> Option<Condition> {
        let idx = self.0.iter().position(|c| c.type_ == type_)?;
        Some(self.0.remove(idx))
    }

    /// Carries forward the transition time of every condition whose status
    /// has not changed since `previous`.
    pub fn inherit_transition_times(&mut self, previous: &ConditionSet) {
        for condition in &mut self.0 {
            if let Some(prior) = previous.get(&condition.type_) {
                if prior.status == condition.status {
                    condition.last_transition_time = prior.last_transition_time;
                }
            }
        }
    }

    /// Parses conditions read from a stored status. Unlike [`Self::set`],
    /// this never evicts: stored statuses that violate the bounds are
    /// rejected.
    pub fn from_stored(
        conditions: impl IntoIterator<Item = k8s::Condition>,
    ) -> Result<Self, InvalidCondition> {
        let mut set = Self::new();
        for c in conditions {
            let c = Condition::try_from(c)?;
            if set.get(&c.type_).is_some() {
                return Err(InvalidCondition::DuplicateType(c.type_));
            }
            set.set(c, EvictionPolicy::Reject)?;
        }
        Ok(set)
    }

    pub fn to_k8s(&self) -> Vec<k8s::Condition> {
        self.0.iter().cloned().map(Into::into).collect()
    }
}

impl TryFrom<Vec<Condition>> for ConditionSet {
    type Error = InvalidCondition;

    fn try_from(conditions: Vec<Condition>) -> Result<Self, Self::Error> {
        let mut set = Self::new();
        for c in conditions {
            if set.get(&c.type_).is_some() {
                return Err(InvalidCondition::DuplicateType(c.type_));
            }
            set.set(c, EvictionPolicy::Reject)?;
        }
        Ok(set)
    }
}

impl<'a> IntoIterator for &'a ConditionSet {
    type Item = &'a Condition;
    type IntoIter = std::slice::Iter<'a, Condition>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn cond(type_: &str, secs: i64) -> Condition {
        Condition::new(type_, true, type_, "", at(secs))
    }

    fn full_set() -> ConditionSet {
        let mut set = ConditionSet::new();
        for i in 0..MAX_CONDITIONS_PER_ANCESTOR {
            // Transition times descend so the oldest is not first.
            set.set(cond(&format!("C{i}"), 100 - i as i64), EvictionPolicy::Reject)
                .expect("set must have room");
        }
        set
    }

    #[test]
    fn replaces_same_type_in_place() {
        let mut set = ConditionSet::new();
        set.set(cond("A", 0), EvictionPolicy::Reject).unwrap();
        set.set(cond("B", 0), EvictionPolicy::Reject).unwrap();
        set.set(
            Condition::new("A", false, "Nope", "changed", at(5)),
            EvictionPolicy::Reject,
        )
        .unwrap();

        let types = set.iter().map(|c| c.type_.as_str()).collect::<Vec<_>>();
        assert_eq!(types, vec!["A", "B"]);
        assert_eq!(set.get("A").unwrap().reason, "Nope");
    }

    #[rstest]
    #[case(EvictionPolicy::Reject)]
    #[case(EvictionPolicy::EvictOldest)]
    fn replacing_in_a_full_set_never_evicts(#[case] eviction: EvictionPolicy) {
        let mut set = full_set();
        set.set(cond("C3", 500), eviction).unwrap();
        assert_eq!(set.len(), MAX_CONDITIONS_PER_ANCESTOR);
        assert_eq!(set.get("C3").unwrap().last_transition_time, at(500));
    }

    #[test]
    fn rejects_ninth_type() {
        let mut set = full_set();
        let before = set.clone();
        assert_eq!(
            set.set(cond("Extra", 0), EvictionPolicy::Reject),
            Err(ConditionsExceeded {
                type_: "Extra".to_string()
            })
        );
        assert_eq!(set, before);
    }

    #[test]
    fn evicts_oldest_transition() {
        let mut set = full_set();
        set.set(cond("Extra", 200), EvictionPolicy::EvictOldest).unwrap();
        assert_eq!(set.len(), MAX_CONDITIONS_PER_ANCESTOR);
        // C7 had the oldest transition time.
        assert!(set.get("C7").is_none());
        assert_eq!(set.iter().last().unwrap().type_, "Extra");
    }

    #[test]
    fn eviction_ties_go_to_earliest_position() {
        let mut set = ConditionSet::new();
        for i in 0..MAX_CONDITIONS_PER_ANCESTOR {
            set.set(cond(&format!("C{i}"), 0), EvictionPolicy::Reject).unwrap();
        }
        set.set(cond("Extra", 0), EvictionPolicy::EvictOldest).unwrap();
        assert!(set.get("C0").is_none());
        assert!(set.get("C1").is_some());
    }

    #[test]
    fn inherits_unchanged_transitions() {
        let mut previous = ConditionSet::new();
        previous.set(cond("A", 0), EvictionPolicy::Reject).unwrap();
        previous
            .set(Condition::new("B", false, "B", "", at(0)), EvictionPolicy::Reject)
            .unwrap();

        let mut next = ConditionSet::new();
        next.set(cond("A", 60), EvictionPolicy::Reject).unwrap();
        next.set(cond("B", 60), EvictionPolicy::Reject).unwrap();
        next.set(cond("C", 60), EvictionPolicy::Reject).unwrap();
        next.inherit_transition_times(&previous);

        assert_eq!(next.get("A").unwrap().last_transition_time, at(0));
        assert_eq!(next.get("B").unwrap().last_transition_time, at(60));
        assert_eq!(next.get("C").unwrap().last_transition_time, at(60));
    }

    #[test]
    fn truncates_subsecond_timestamps() {
        let now = Utc.timestamp_opt(1_700_000_000, 999_999_999).unwrap();
        let c = Condition::new("A", true, "A", "", now);
        assert_eq!(c.last_transition_time, at(0));
    }

    #[test]
    fn stored_conditions() {
        let stored = vec![
            k8s::Condition::from(cond("A", 0)),
            k8s::Condition {
                status: "Maybe".to_string(),
                ..k8s::Condition::from(cond("B", 0))
            },
        ];
        assert_eq!(
            ConditionSet::from_stored(stored),
            Err(InvalidCondition::Status {
                type_: "B".to_string(),
                status: "Maybe".to_string(),
            })
        );

        let dup = vec![cond("A", 0).into(), cond("A", 1).into()];
        assert_eq!(
            ConditionSet::from_stored(dup),
            Err(InvalidCondition::DuplicateType("A".to_string()))
        );

        let set = full_set();
        assert_eq!(ConditionSet::from_stored(set.to_k8s()), Ok(set));
    }
}
