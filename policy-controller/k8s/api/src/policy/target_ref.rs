/// Identifies an API object to apply a policy to, optionally in another
/// namespace.
#[derive(
    Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
pub struct PolicyTargetReference {
    /// The group of the target resource. The empty string is the core group.
    #[serde(default)]
    pub group: String,
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Identifies an API object in the policy's own namespace.
#[derive(
    Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema,
)]
pub struct LocalPolicyTargetReference {
    #[serde(default)]
    pub group: String,
    pub kind: String,
    pub name: String,
}

impl PolicyTargetReference {
    /// Returns the target ref kind, qualified by its group, if necessary.
    pub fn canonical_kind(&self) -> String {
        canonical_kind(&self.group, &self.kind)
    }

    /// The namespace of the referenced object, defaulting to the policy's.
    pub fn namespace_or<'a>(&'a self, local_ns: &'a str) -> &'a str {
        self.namespace.as_deref().unwrap_or(local_ns)
    }
}

impl LocalPolicyTargetReference {
    /// Returns the target ref kind, qualified by its group, if necessary.
    pub fn canonical_kind(&self) -> String {
        canonical_kind(&self.group, &self.kind)
    }

    /// Checks whether the target references the given resource type. Kinds
    /// match case-insensitively.
    pub fn targets_kind<T>(&self) -> bool
    where
        T: kube::Resource,
        T::DynamicType: Default,
    {
        targets_kind::<T>(&self.group, &self.kind)
    }
}

impl From<LocalPolicyTargetReference> for PolicyTargetReference {
    fn from(LocalPolicyTargetReference { group, kind, name }: LocalPolicyTargetReference) -> Self {
        Self {
            group,
            kind,
            name,
            namespace: None,
        }
    }
}

fn canonical_kind(group: &str, kind: &str) -> String {
    if group.is_empty() || group == "core" {
        kind.to_string()
    } else {
        format!("{kind}.{group}")
    }
}

fn targets_kind<T>(group: &str, kind: &str) -> bool
where
    T: kube::Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();

    let mut t_group = &*T::group(&dt);
    if t_group.is_empty() {
        t_group = "core";
    }
    let group = if group.is_empty() { "core" } else { group };

    group.eq_ignore_ascii_case(t_group) && kind.eq_ignore_ascii_case(&T::kind(&dt))
}
