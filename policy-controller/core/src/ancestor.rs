use gke_policy_controller_k8s_api::gateway::ParentReference;
use once_cell::sync::Lazy;
use regex::Regex;
use std::{fmt, str::FromStr};

const GATEWAY_API_GROUP: &str = "gateway.networking.k8s.io";
const GATEWAY_KIND: &str = "Gateway";
const MAX_CONTROLLER_NAME_LEN: usize = 253;

static CONTROLLER_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*/[A-Za-z0-9/\-._~%!$&'()*+,;=:]+$",
    )
    .expect("controller name regex must compile")
});

/// Identifies a resource in the hierarchy above (or equal to) a policy's
/// target.
///
/// Unlike the wire form, `group` and `kind` are always explicit: an omitted
/// group or kind refers to a Gateway.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AncestorRef {
    pub group: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
    pub section_name: Option<String>,
    pub port: Option<u16>,
}

/// A `DOMAIN/PATH` string naming the controller that owns a status entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ControllerName(String);

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum InvalidControllerName {
    #[error("controller name must not be empty")]
    Empty,

    #[error("controller name must not exceed 253 characters")]
    TooLong,

    #[error("controller name {0:?} must be of the form DOMAIN/PATH")]
    Malformed(String),
}

/// The composite identity of one ancestor status entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AncestorKey {
    pub ancestor: AncestorRef,
    pub controller: ControllerName,
}

// === impl AncestorRef ===

impl AncestorRef {
    pub fn new(
        group: impl Into<String>,
        kind: impl Into<String>,
        namespace: Option<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            kind: kind.into(),
            namespace,
            name: name.into(),
            section_name: None,
            port: None,
        }
    }
}

impl From<ParentReference> for AncestorRef {
    fn from(pr: ParentReference) -> Self {
        Self {
            group: pr.group.unwrap_or_else(|| GATEWAY_API_GROUP.to_string()),
            kind: pr.kind.unwrap_or_else(|| GATEWAY_KIND.to_string()),
            namespace: pr.namespace,
            name: pr.name,
            section_name: pr.section_name,
            port: pr.port,
        }
    }
}

impl From<AncestorRef> for ParentReference {
    fn from(ar: AncestorRef) -> Self {
        ParentReference {
            group: Some(ar.group),
            kind: Some(ar.kind),
            namespace: ar.namespace,
            name: ar.name,
            section_name: ar.section_name,
            port: ar.port,
        }
    }
}

impl fmt::Display for AncestorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.kind)?;
        } else {
            write!(f, "{}.{}", self.kind, self.group)?;
        }
        match self.namespace.as_deref() {
            Some(ns) => write!(f, " {ns}/{}", self.name)?,
            None => write!(f, " {}", self.name)?,
        }
        if let Some(section) = self.section_name.as_deref() {
            write!(f, "#{section}")?;
        }
        Ok(())
    }
}

// === impl ControllerName ===

impl ControllerName {
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidControllerName> {
        let name = name.into();
        if name.is_empty() {
            return Err(InvalidControllerName::Empty);
        }
        if name.len() > MAX_CONTROLLER_NAME_LEN {
            return Err(InvalidControllerName::TooLong);
        }
        if !CONTROLLER_NAME.is_match(&name) {
            return Err(InvalidControllerName::Malformed(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ControllerName {
    type Err = InvalidControllerName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for ControllerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// === impl AncestorKey ===

impl AncestorKey {
    pub fn new(ancestor: AncestorRef, controller: ControllerName) -> Self {
        Self {
            ancestor,
            controller,
        }
    }

    pub fn is_owned_by(&self, controller: &ControllerName) -> bool {
        self.controller == *controller
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_name_format() {
        assert!(ControllerName::new("networking.gke.io/gateway").is_ok());
        assert!(ControllerName::new("example.net/gateway-controller/v2").is_ok());
        assert_eq!(
            ControllerName::new(""),
            Err(InvalidControllerName::Empty)
        );
        assert!(matches!(
            ControllerName::new("no-path"),
            Err(InvalidControllerName::Malformed(_))
        ));
        assert!(matches!(
            ControllerName::new("Upper.Case/path"),
            Err(InvalidControllerName::Malformed(_))
        ));
        assert_eq!(
            ControllerName::new(format!("example.net/{}", "a".repeat(250))),
            Err(InvalidControllerName::TooLong)
        );
    }

    #[test]
    fn parent_reference_defaults_to_gateway() {
        let ar = AncestorRef::from(ParentReference {
            group: None,
            kind: None,
            namespace: Some("infra".to_string()),
            name: "external".to_string(),
            section_name: Some("https".to_string()),
            port: None,
        });
        assert_eq!(ar.group, "gateway.networking.k8s.io");
        assert_eq!(ar.kind, "Gateway");
        assert_eq!(
            ar.to_string(),
            "Gateway.gateway.networking.k8s.io infra/external#https"
        );
    }

    #[test]
    fn keys_differ_by_controller() {
        let ar = AncestorRef::new("", "Service", Some("apps".to_string()), "web");
        let a = AncestorKey::new(ar.clone(), ControllerName::new("a.io/ctl").unwrap());
        let b = AncestorKey::new(ar, ControllerName::new("b.io/ctl").unwrap());
        assert_ne!(a, b);
        assert!(a.is_owned_by(&ControllerName::new("a.io/ctl").unwrap()));
        assert!(!a.is_owned_by(&b.controller));
    }
}
