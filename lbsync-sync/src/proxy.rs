//! Desired proxy configuration: the shared target every converter writes.
//!
//! Entries remember the cluster object that produced them (`owner`) so an
//! incremental pass can drop exactly what one object contributed and re-add
//! it from current state. Backends are reference-counted implicitly: anything
//! no path, TCP service or default backend points at is pruned.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use lbsync_core::manifest::{ListenerProtocol, PathType};
use lbsync_core::ObjectRef;

use crate::error::SyncError;

/// Host key used for rules without a hostname.
pub const DEFAULT_HOST: &str = "*";

/// The only operation the orchestrator itself performs on a target.
pub trait ConfigTarget {
    /// Wipe to the empty state ahead of a full rebuild.
    fn clear(&mut self);
}

// ---------------------------------------------------------------------------
// Building blocks
// ---------------------------------------------------------------------------

/// `<namespace>_<service>_<port>`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendId(String);

impl BackendId {
    pub fn new(namespace: &str, service: &str, port: u16) -> Self {
        Self(format!("{namespace}_{service}_{port}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backend {
    pub service: ObjectRef,
    pub port: u16,
    /// `address:port` of every server, in endpoint order.
    pub endpoints: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightedBackend {
    pub backend: BackendId,
    pub weight: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRoute {
    pub path: String,
    pub path_type: PathType,
    pub backends: Vec<WeightedBackend>,
    pub owner: ObjectRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostTls {
    pub secret: ObjectRef,
    pub owner: ObjectRef,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<HostTls>,
    /// Longest path first.
    pub paths: Vec<PathRoute>,
}

impl Host {
    fn is_empty(&self) -> bool {
        self.tls.is_none() && self.paths.is_empty()
    }
}

/// A port opened on behalf of a gateway listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerBinding {
    pub name: String,
    pub protocol: ListenerProtocol,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_secret: Option<ObjectRef>,
    pub owner: ObjectRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProxyProtocolVersion {
    V1,
    V2,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpService {
    pub backend: BackendId,
    pub proxy_protocol_in: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_protocol_out: Option<ProxyProtocolVersion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_secret: Option<ObjectRef>,
}

// ---------------------------------------------------------------------------
// ProxyConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub default_backend: Option<BackendId>,
    pub listeners: BTreeMap<u16, ListenerBinding>,
    pub hosts: BTreeMap<String, Host>,
    pub backends: BTreeMap<BackendId, Backend>,
    pub tcp_services: BTreeMap<u16, TcpService>,
}

impl ConfigTarget for ProxyConfig {
    fn clear(&mut self) {
        *self = Self::default();
    }
}

impl ProxyConfig {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn upsert_backend(&mut self, id: BackendId, backend: Backend) {
        self.backends.insert(id, backend);
    }

    /// Add or replace a path on `host`.
    ///
    /// Returns the current owner when the same path is already claimed by a
    /// different object; the existing entry is left untouched.
    pub fn add_path(&mut self, host: &str, route: PathRoute) -> Result<(), ObjectRef> {
        let entry = self.hosts.entry(host.to_string()).or_default();
        if let Some(existing) = entry
            .paths
            .iter_mut()
            .find(|p| p.path == route.path && p.path_type == route.path_type)
        {
            if existing.owner != route.owner {
                return Err(existing.owner.clone());
            }
            *existing = route;
            return Ok(());
        }
        entry.paths.push(route);
        entry.paths.sort_by(|a, b| {
            (Reverse(a.path.len()), &a.path, a.path_type).cmp(&(
                Reverse(b.path.len()),
                &b.path,
                b.path_type,
            ))
        });
        Ok(())
    }

    pub fn path_owner(&self, host: &str, path: &str, path_type: PathType) -> Option<&ObjectRef> {
        self.hosts
            .get(host)?
            .paths
            .iter()
            .find(|p| p.path == path && p.path_type == path_type)
            .map(|p| &p.owner)
    }

    /// Drop one path regardless of owner; backends are left for the next prune.
    pub fn remove_path(&mut self, host: &str, path: &str, path_type: PathType) -> Option<PathRoute> {
        let entry = self.hosts.get_mut(host)?;
        let idx = entry
            .paths
            .iter()
            .position(|p| p.path == path && p.path_type == path_type)?;
        let removed = entry.paths.remove(idx);
        if entry.is_empty() {
            self.hosts.remove(host);
        }
        Some(removed)
    }

    /// Attach a certificate to `host` unless another object already did.
    ///
    /// Like [`add_path`](Self::add_path), a conflict returns the current owner
    /// and leaves the existing certificate in place.
    pub fn set_host_tls(&mut self, host: &str, secret: ObjectRef, owner: &ObjectRef) -> Result<(), ObjectRef> {
        let entry = self.hosts.entry(host.to_string()).or_default();
        match &entry.tls {
            Some(tls) if tls.owner != *owner => Err(tls.owner.clone()),
            _ => {
                entry.tls = Some(HostTls {
                    secret,
                    owner: owner.clone(),
                });
                Ok(())
            }
        }
    }

    /// Detach the certificate of `host` regardless of owner.
    pub fn remove_host_tls(&mut self, host: &str) -> Option<HostTls> {
        let entry = self.hosts.get_mut(host)?;
        let removed = entry.tls.take();
        if entry.is_empty() {
            self.hosts.remove(host);
        }
        removed
    }

    /// Hosts where `owner` holds a path or the certificate.
    pub fn hosts_owned_by(&self, owner: &ObjectRef) -> BTreeSet<String> {
        self.hosts
            .iter()
            .filter(|(_, host)| {
                host.paths.iter().any(|p| p.owner == *owner)
                    || host.tls.as_ref().is_some_and(|t| t.owner == *owner)
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn bind_listener(&mut self, port: u16, binding: ListenerBinding) -> Result<(), ObjectRef> {
        match self.listeners.get(&port) {
            Some(existing) if existing.owner != binding.owner => Err(existing.owner.clone()),
            _ => {
                self.listeners.insert(port, binding);
                Ok(())
            }
        }
    }

    /// Listeners opened for `gateway`, ordered by port.
    pub fn listeners_of<'a>(
        &'a self,
        gateway: &'a ObjectRef,
    ) -> impl Iterator<Item = (u16, &'a ListenerBinding)> + 'a {
        self.listeners
            .iter()
            .filter(move |(_, l)| l.owner == *gateway)
            .map(|(port, l)| (*port, l))
    }

    /// Drop everything `owner` contributed, then prune orphaned backends.
    pub fn remove_owned_by(&mut self, owner: &ObjectRef) {
        for host in self.hosts.values_mut() {
            host.paths.retain(|p| p.owner != *owner);
            if host.tls.as_ref().is_some_and(|t| t.owner == *owner) {
                host.tls = None;
            }
        }
        self.hosts.retain(|_, host| !host.is_empty());
        self.listeners.retain(|_, l| l.owner != *owner);
        self.prune_backends();
    }

    pub fn clear_tcp_services(&mut self) {
        self.tcp_services.clear();
        self.prune_backends();
    }

    /// Remove backends nothing references any more.
    pub fn prune_backends(&mut self) {
        let referenced: BTreeSet<BackendId> = self
            .hosts
            .values()
            .flat_map(|h| h.paths.iter())
            .flat_map(|p| p.backends.iter().map(|b| &b.backend))
            .chain(self.tcp_services.values().map(|t| &t.backend))
            .chain(self.default_backend.iter())
            .cloned()
            .collect();
        self.backends.retain(|id, _| referenced.contains(id));
    }

    /// Backends generated from `service` (any port).
    pub fn backends_of_service(&self, service: &ObjectRef) -> Vec<BackendId> {
        self.backends
            .iter()
            .filter(|(_, b)| b.service == *service)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn path_count(&self) -> usize {
        self.hosts.values().map(|h| h.paths.len()).sum()
    }

    /// SHA-256 over the canonical JSON form; equal configs hash equal.
    pub fn fingerprint(&self) -> Result<String, SyncError> {
        let bytes = serde_json::to_vec(self)?;
        let mut h = Sha256::new();
        h.update(&bytes);
        Ok(hex::encode(h.finalize()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
