//! Object references shared by the cache, the converters and the proxy model.
//!
//! Every reference a converter stores in the proxy model is one of these
//! types; `String` is only used for free-form hostnames and paths.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Namespace assumed when a reference or manifest omits one.
pub const DEFAULT_NAMESPACE: &str = "default";

// ---------------------------------------------------------------------------
// ObjectKind
// ---------------------------------------------------------------------------

/// Cluster resource kinds the cache tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectKind {
    Ingress,
    IngressClass,
    Service,
    Endpoints,
    Secret,
    ConfigMap,
    Gateway,
    HttpRoute,
}

impl ObjectKind {
    /// Short name used in log lines and object reference strings.
    pub fn short_name(&self) -> &'static str {
        match self {
            ObjectKind::Ingress => "ing",
            ObjectKind::IngressClass => "ingclass",
            ObjectKind::Service => "svc",
            ObjectKind::Endpoints => "ep",
            ObjectKind::Secret => "secret",
            ObjectKind::ConfigMap => "cm",
            ObjectKind::Gateway => "gw",
            ObjectKind::HttpRoute => "httproute",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

// ---------------------------------------------------------------------------
// NamespacedName
// ---------------------------------------------------------------------------

/// `namespace/name` pair, parsed from configuration strings.
///
/// A bare `name` resolves to [`DEFAULT_NAMESPACE`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl FromStr for NamespacedName {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CoreError::InvalidObjectRef(s.to_string());
        let (namespace, name) = match s.split_once('/') {
            Some((ns, name)) => (ns, name),
            None => (DEFAULT_NAMESPACE, s),
        };
        if namespace.is_empty() || name.is_empty() || name.contains('/') {
            return Err(invalid());
        }
        Ok(Self::new(namespace, name))
    }
}

impl TryFrom<String> for NamespacedName {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<NamespacedName> for String {
    fn from(n: NamespacedName) -> Self {
        n.to_string()
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// ---------------------------------------------------------------------------
// ObjectRef
// ---------------------------------------------------------------------------

/// Identity of one cluster object: kind, namespace and name.
///
/// Displayed as `<short-kind>/<namespace>/<name>`, e.g. `ing/default/foo`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    pub kind: ObjectKind,
    pub namespace: String,
    pub name: String,
}

impl ObjectRef {
    pub fn new(kind: ObjectKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_name(kind: ObjectKind, name: &NamespacedName) -> Self {
        Self::new(kind, name.namespace.clone(), name.name.clone())
    }

    /// Same namespace and name, different kind (e.g. a service's endpoints).
    pub fn with_kind(&self, kind: ObjectKind) -> Self {
        Self::new(kind, self.namespace.clone(), self.name.clone())
    }

    pub fn namespaced_name(&self) -> NamespacedName {
        NamespacedName::new(self.namespace.clone(), self.name.clone())
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

// ---------------------------------------------------------------------------
// ServiceRef
// ---------------------------------------------------------------------------

/// `namespace/service:port`, used for default backends and TCP service maps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceRef {
    pub namespace: String,
    pub name: String,
    pub port: u16,
}

impl ServiceRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, port: u16) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            port,
        }
    }

    pub fn service(&self) -> ObjectRef {
        ObjectRef::new(ObjectKind::Service, self.namespace.clone(), self.name.clone())
    }
}

impl FromStr for ServiceRef {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CoreError::InvalidObjectRef(s.to_string());
        let (name, port) = s.rsplit_once(':').ok_or_else(invalid)?;
        let port: u16 = port.parse().map_err(|_| invalid())?;
        if port == 0 {
            return Err(invalid());
        }
        let name: NamespacedName = name.parse().map_err(|_| invalid())?;
        Ok(Self::new(name.namespace, name.name, port))
    }
}

impl TryFrom<String> for ServiceRef {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ServiceRef> for String {
    fn from(s: ServiceRef) -> Self {
        s.to_string()
    }
}

impl fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.namespace, self.name, self.port)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
