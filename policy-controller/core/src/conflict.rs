use crate::{
    condition::{reasons, ATTACHED},
    AncestorRef, Condition, ConditionStatus,
};
use chrono::{DateTime, Utc};
use std::{cmp::Ordering, fmt};

/// The object a policy attaches to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PolicyTarget {
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PolicyId {
    pub namespace: String,
    pub name: String,
}

/// A policy of a single kind competing for a target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub id: PolicyId,
    pub created_at: Option<DateTime<Utc>>,
    /// Set when the policy failed validation, with a message describing why.
    pub invalid: Option<String>,
}

/// The outcome of conflict resolution for one policy on one target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Attachment {
    Attached,
    Conflicted { winner: PolicyId },
    Invalid(String),
    TargetNotFound,
}

/// Reports whether a policy target currently exists.
pub trait TargetLookup {
    fn target_exists(&self, target: &PolicyTarget) -> bool;
}

/// Picks the single effective policy among those of one kind that target
/// the same object.
#[derive(Clone, Debug)]
pub struct ConflictResolver<L> {
    lookup: L,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub winner: Option<PolicyId>,
    /// Every candidate's outcome; valid candidates in precedence order,
    /// followed by invalid ones ordered by id.
    pub attachments: Vec<(PolicyId, Attachment)>,
}

// === impl PolicyTarget ===

impl PolicyTarget {
    /// The target object is its policy's ancestor.
    pub fn ancestor_ref(&self) -> AncestorRef {
        AncestorRef::new(
            self.group.clone(),
            self.kind.clone(),
            Some(self.namespace.clone()),
            self.name.clone(),
        )
    }
}

impl fmt::Display for PolicyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
        } else {
            write!(
                f,
                "{}.{} {}/{}",
                self.kind, self.group, self.namespace, self.name
            )
        }
    }
}

// === impl PolicyId ===

impl PolicyId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// === impl Candidate ===

impl Candidate {
    /// Oldest first, then by namespace and name. Policies without a creation
    /// timestamp sort after all that have one.
    ///
    /// Same-kind policies only contend across namespaces through a
    /// cross-namespace `targetRef`; otherwise the tie-break is by name.
    fn precedence(&self, other: &Self) -> Ordering {
        match (self.created_at, other.created_at) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
        .then_with(|| self.id.cmp(&other.id))
    }
}

// === impl Attachment ===

impl Attachment {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Attached => reasons::ATTACHED,
            Self::Conflicted { .. } => reasons::CONFLICTED,
            Self::Invalid(_) => reasons::INVALID,
            Self::TargetNotFound => reasons::TARGET_NOT_FOUND,
        }
    }

    pub fn is_attached(&self) -> bool {
        matches!(self, Self::Attached)
    }

    /// Builds the `Attached` condition describing this outcome.
    pub fn condition(
        &self,
        target: &PolicyTarget,
        generation: Option<i64>,
        now: DateTime<Utc>,
    ) -> Condition {
        let status = ConditionStatus::from(self.is_attached());
        let message = match self {
            Self::Attached => format!("Policy is attached to {target}"),
            Self::Conflicted { winner } => {
                format!("Policy {winner} takes precedence on {target}")
            }
            Self::Invalid(msg) => format!("Policy is invalid: {msg}"),
            Self::TargetNotFound => format!("Target {target} does not exist"),
        };
        Condition::new(ATTACHED, status, self.reason(), message, now).with_generation(generation)
    }
}

// === impl ConflictResolver ===

impl<F> TargetLookup for F
where
    F: Fn(&PolicyTarget) -> bool,
{
    fn target_exists(&self, target: &PolicyTarget) -> bool {
        (self)(target)
    }
}

impl<L: TargetLookup> ConflictResolver<L> {
    pub fn new(lookup: L) -> Self {
        Self { lookup }
    }

    /// Resolves the candidates competing for `target`.
    ///
    /// Invalid policies never win and never cause others to conflict. When
    /// the target does not exist, every valid candidate is `TargetNotFound`.
    pub fn resolve<'c>(
        &self,
        target: &PolicyTarget,
        candidates: impl IntoIterator<Item = &'c Candidate>,
    ) -> Resolution {
        let (mut valid, mut invalid): (Vec<&Candidate>, Vec<&Candidate>) =
            candidates.into_iter().partition(|c| c.invalid.is_none());
        valid.sort_by(|a, b| a.precedence(b));
        invalid.sort_by(|a, b| a.id.cmp(&b.id));

        let exists = self.lookup.target_exists(target);
        let winner = if exists {
            valid.first().map(|c| c.id.clone())
        } else {
            None
        };

        let mut attachments = Vec::with_capacity(valid.len() + invalid.len());
        for c in valid {
            let attachment = match winner.as_ref() {
                None => Attachment::TargetNotFound,
                Some(w) if *w == c.id => Attachment::Attached,
                Some(w) => Attachment::Conflicted { winner: w.clone() },
            };
            attachments.push((c.id.clone(), attachment));
        }
        for c in invalid {
            let msg = c.invalid.clone().unwrap_or_default();
            attachments.push((c.id.clone(), Attachment::Invalid(msg)));
        }

        Resolution {
            winner,
            attachments,
        }
    }
}

// === impl Resolution ===

impl Resolution {
    pub fn get(&self, id: &PolicyId) -> Option<&Attachment> {
        self.attachments
            .iter()
            .find_map(|(i, a)| (i == id).then_some(a))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn target() -> PolicyTarget {
        PolicyTarget {
            group: String::new(),
            kind: "Service".to_string(),
            namespace: "store".to_string(),
            name: "checkout".to_string(),
        }
    }

    fn candidate(name: &str, created: Option<i64>) -> Candidate {
        Candidate {
            id: PolicyId::new("store", name),
            created_at: created.map(|s| Utc.timestamp_opt(s, 0).unwrap()),
            invalid: None,
        }
    }

    fn exists(_: &PolicyTarget) -> bool {
        true
    }

    #[test]
    fn oldest_wins() {
        let resolver = ConflictResolver::new(exists);
        let candidates = [
            candidate("b", Some(200)),
            candidate("a", Some(300)),
            candidate("c", Some(100)),
        ];
        let resolution = resolver.resolve(&target(), &candidates);
        let c = PolicyId::new("store", "c");
        assert_eq!(resolution.winner, Some(c.clone()));
        assert_eq!(
            resolution.attachments,
            vec![
                (c.clone(), Attachment::Attached),
                (
                    PolicyId::new("store", "b"),
                    Attachment::Conflicted { winner: c.clone() }
                ),
                (
                    PolicyId::new("store", "a"),
                    Attachment::Conflicted { winner: c }
                ),
            ]
        );
    }

    #[test]
    fn ties_break_by_name() {
        let resolver = ConflictResolver::new(exists);
        let candidates = [candidate("zeta", Some(100)), candidate("alpha", Some(100))];
        let resolution = resolver.resolve(&target(), &candidates);
        assert_eq!(resolution.winner, Some(PolicyId::new("store", "alpha")));
    }

    #[test]
    fn missing_timestamps_sort_last() {
        let resolver = ConflictResolver::new(exists);
        let candidates = [candidate("a", None), candidate("b", Some(i64::from(u32::MAX)))];
        let resolution = resolver.resolve(&target(), &candidates);
        assert_eq!(resolution.winner, Some(PolicyId::new("store", "b")));
    }

    #[test]
    fn invalid_policies_never_win() {
        let resolver = ConflictResolver::new(exists);
        let mut oldest = candidate("oldest", Some(1));
        oldest.invalid = Some("timeoutSec must be at most 86400".to_string());
        let candidates = [oldest, candidate("newer", Some(50))];

        let resolution = resolver.resolve(&target(), &candidates);
        assert_eq!(resolution.winner, Some(PolicyId::new("store", "newer")));
        assert_eq!(
            resolution.get(&PolicyId::new("store", "oldest")),
            Some(&Attachment::Invalid(
                "timeoutSec must be at most 86400".to_string()
            ))
        );
        assert_eq!(
            resolution.get(&PolicyId::new("store", "newer")),
            Some(&Attachment::Attached)
        );
    }

    #[test]
    fn missing_target() {
        let resolver = ConflictResolver::new(|_: &PolicyTarget| false);
        let mut invalid = candidate("broken", Some(1));
        invalid.invalid = Some("bad".to_string());
        let candidates = [candidate("a", Some(5)), invalid];

        let resolution = resolver.resolve(&target(), &candidates);
        assert_eq!(resolution.winner, None);
        assert_eq!(
            resolution.get(&PolicyId::new("store", "a")),
            Some(&Attachment::TargetNotFound)
        );
        assert_eq!(
            resolution.get(&PolicyId::new("store", "broken")),
            Some(&Attachment::Invalid("bad".to_string()))
        );
    }

    #[test]
    fn attachment_conditions() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let c = Attachment::Attached.condition(&target(), Some(3), now);
        assert_eq!(c.type_, "Attached");
        assert_eq!(c.status, ConditionStatus::True);
        assert_eq!(c.reason, "Attached");
        assert_eq!(c.observed_generation, Some(3));

        let c = Attachment::Conflicted {
            winner: PolicyId::new("store", "first"),
        }
        .condition(&target(), None, now);
        assert_eq!(c.status, ConditionStatus::False);
        assert_eq!(c.reason, "Conflicted");
        assert_eq!(
            c.message,
            "Policy store/first takes precedence on Service store/checkout"
        );
    }
}
