use std::fmt;

#[derive(Clone, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct GroupKindName {
    pub group: String,
    pub kind: String,
    pub name: String,
}

/// Identifies the object a status update is written to.
#[derive(Clone, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct NamespaceGroupKindName {
    pub namespace: String,
    pub gkn: GroupKindName,
}

impl NamespaceGroupKindName {
    pub fn new(
        namespace: impl Into<String>,
        group: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            gkn: GroupKindName {
                group: group.into(),
                kind: kind.into(),
                name: name.into(),
            },
        }
    }
}

impl fmt::Display for NamespaceGroupKindName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let GroupKindName { group, kind, name } = &self.gkn;
        if group.is_empty() {
            write!(f, "{kind} {}/{name}", self.namespace)
        } else {
            write!(f, "{kind}.{group} {}/{name}", self.namespace)
        }
    }
}
