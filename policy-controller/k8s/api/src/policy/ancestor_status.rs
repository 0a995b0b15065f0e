use crate::{gateway::ParentReference, Condition};

/// The status of a policy with respect to one ancestor, as written by one
/// controller.
///
/// A list of these is effectively a map keyed by the combination of
/// `ancestorRef` and `controllerName`.
#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PolicyAncestorStatus {
    pub ancestor_ref: ParentReference,

    /// A `DOMAIN/PATH` string naming the controller that wrote this entry.
    pub controller_name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// The common status of policies that report per-ancestor status.
#[derive(
    Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
pub struct PolicyStatus {
    /// At most 16 ancestors. An empty list means the policy is not relevant
    /// for any ancestor.
    #[serde(default)]
    pub ancestors: Vec<PolicyAncestorStatus>,
}

/// The status of policies that only report top-level conditions.
#[derive(
    Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
pub struct ConditionsStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}
