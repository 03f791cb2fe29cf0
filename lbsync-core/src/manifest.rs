//! Cluster resource manifests.
//!
//! These are deliberately small: only the fields the converters read are
//! modelled. Manifests are YAML documents tagged by `kind`; one file may hold
//! several documents (`---` separated) or a sequence of manifests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{io_err, CoreError};
use crate::types::{ObjectKind, ObjectRef, DEFAULT_NAMESPACE};

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Any resource the cache understands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Manifest {
    Ingress(Ingress),
    IngressClass(IngressClass),
    Service(Service),
    Endpoints(Endpoints),
    Secret(Secret),
    ConfigMap(ConfigMap),
    Gateway(Gateway),
    #[serde(rename = "HTTPRoute")]
    HttpRoute(HttpRoute),
}

impl Manifest {
    pub fn metadata(&self) -> &Metadata {
        match self {
            Manifest::Ingress(o) => &o.metadata,
            Manifest::IngressClass(o) => &o.metadata,
            Manifest::Service(o) => &o.metadata,
            Manifest::Endpoints(o) => &o.metadata,
            Manifest::Secret(o) => &o.metadata,
            Manifest::ConfigMap(o) => &o.metadata,
            Manifest::Gateway(o) => &o.metadata,
            Manifest::HttpRoute(o) => &o.metadata,
        }
    }

    pub fn kind(&self) -> ObjectKind {
        match self {
            Manifest::Ingress(_) => ObjectKind::Ingress,
            Manifest::IngressClass(_) => ObjectKind::IngressClass,
            Manifest::Service(_) => ObjectKind::Service,
            Manifest::Endpoints(_) => ObjectKind::Endpoints,
            Manifest::Secret(_) => ObjectKind::Secret,
            Manifest::ConfigMap(_) => ObjectKind::ConfigMap,
            Manifest::Gateway(_) => ObjectKind::Gateway,
            Manifest::HttpRoute(_) => ObjectKind::HttpRoute,
        }
    }

    pub fn object_ref(&self) -> ObjectRef {
        let meta = self.metadata();
        ObjectRef::new(self.kind(), meta.namespace.clone(), meta.name.clone())
    }
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub name: String,
}

impl Metadata {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Ingress
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ingress {
    pub metadata: Metadata,
    #[serde(default)]
    pub spec: IngressSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_backend: Option<IngressBackend>,
    #[serde(default)]
    pub tls: Vec<IngressTls>,
    #[serde(default)]
    pub rules: Vec<IngressRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressBackend {
    pub service: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressTls {
    #[serde(default)]
    pub hosts: Vec<String>,
    pub secret_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressRule {
    /// Empty means "any host" (the default host).
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub paths: Vec<IngressPath>,
}

fn root_path() -> String {
    "/".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressPath {
    #[serde(default = "root_path")]
    pub path: String,
    #[serde(default)]
    pub path_type: PathType,
    pub backend: IngressBackend,
}

/// How a request path is compared against a route path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum PathType {
    #[default]
    Prefix,
    Exact,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressClass {
    pub metadata: Metadata,
    #[serde(default)]
    pub controller: String,
}

// ---------------------------------------------------------------------------
// Service / Endpoints
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub metadata: Metadata,
    #[serde(default)]
    pub ports: Vec<ServicePort>,
}

impl Service {
    pub fn port(&self, port: u16) -> Option<&ServicePort> {
        self.ports.iter().find(|p| p.port == port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    pub metadata: Metadata,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub ports: Vec<EndpointPort>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointPort {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub port: u16,
}

// ---------------------------------------------------------------------------
// Secret / ConfigMap
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    pub metadata: Metadata,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl Secret {
    /// A secret is usable as a certificate when it carries both halves.
    pub fn is_tls(&self) -> bool {
        self.data.contains_key("tls.crt") && self.data.contains_key("tls.key")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigMap {
    pub metadata: Metadata,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Gateway API
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gateway {
    pub metadata: Metadata,
    #[serde(default)]
    pub listeners: Vec<Listener>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Listener {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub port: u16,
    #[serde(default)]
    pub protocol: ListenerProtocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_secret: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ListenerProtocol {
    #[default]
    Http,
    Https,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRoute {
    pub metadata: Metadata,
    #[serde(default)]
    pub spec: HttpRouteSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRouteSpec {
    #[serde(default)]
    pub parent_refs: Vec<ParentRef>,
    #[serde(default)]
    pub hostnames: Vec<String>,
    #[serde(default)]
    pub rules: Vec<HttpRouteRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRouteRule {
    #[serde(default)]
    pub matches: Vec<HttpRouteMatch>,
    #[serde(default)]
    pub backend_refs: Vec<BackendRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRouteMatch {
    #[serde(default = "root_path")]
    pub path: String,
    #[serde(default)]
    pub path_type: PathType,
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendRef {
    pub name: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Parse every manifest in a YAML string.
///
/// Accepts multiple `---` separated documents, each either a single manifest
/// or a sequence of manifests. Empty documents are skipped.
pub fn parse_manifests(contents: &str) -> Result<Vec<Manifest>, serde_yaml::Error> {
    let mut manifests = Vec::new();
    for document in serde_yaml::Deserializer::from_str(contents) {
        let value = serde_yaml::Value::deserialize(document)?;
        match value {
            serde_yaml::Value::Null => {}
            serde_yaml::Value::Sequence(items) => {
                for item in items {
                    manifests.push(serde_yaml::from_value(item)?);
                }
            }
            other => manifests.push(serde_yaml::from_value(other)?),
        }
    }
    Ok(manifests)
}

/// Load all manifests from one file, annotating parse errors with the path.
pub fn load_file_at(path: &Path) -> Result<Vec<Manifest>, CoreError> {
    let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    parse_manifests(&contents).map_err(|source| CoreError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// `true` for files the manifest loader and watcher consider.
pub fn is_manifest_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
        .unwrap_or(false)
}

/// Load every `*.yaml`/`*.yml` file directly under `dir`, sorted by path.
///
/// A missing directory yields an empty list.
pub fn load_dir_at(dir: &Path) -> Result<Vec<(PathBuf, Vec<Manifest>)>, CoreError> {
    if !dir.exists() {
        return Ok(vec![]);
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|e| io_err(dir, e))?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|e| e.path())
        .filter(|p| is_manifest_file(p))
        .collect();
    files.sort();

    let mut result = Vec::with_capacity(files.len());
    for path in files {
        let manifests = load_file_at(&path)?;
        result.push((path, manifests));
    }
    Ok(result)
}
