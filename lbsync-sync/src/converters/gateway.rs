//! Gateway/route domain: gateway listeners become listener bindings, and
//! HTTPRoutes attached to them become host paths.
//!
//! Listener bindings are shared by every route of a gateway, so any gateway
//! change, or a change to a listener's certificate, asks for a full sync
//! instead of patching.

use std::collections::{BTreeMap, BTreeSet};

use lbsync_core::manifest::{Gateway, HttpRoute, HttpRouteMatch, PathType};
use lbsync_core::{ObjectKind, ObjectRef};

use crate::converter::{Converter, PassContext};
use crate::error::SyncError;
use crate::proxy::{ListenerBinding, PathRoute, ProxyConfig, WeightedBackend, DEFAULT_HOST};

use super::backend;

/// Stage key recorded by the timer.
pub const STAGE: &str = "parse_gateway";

pub struct GatewayConverter<'a> {
    ctx: PassContext<'a>,
}

impl<'a> GatewayConverter<'a> {
    pub fn new(ctx: PassContext<'a>) -> Self {
        Self { ctx }
    }

    fn bind_gateway(&self, target: &mut ProxyConfig, gateway: &Gateway) {
        let ns = &gateway.metadata.namespace;
        let owner = ObjectRef::new(ObjectKind::Gateway, ns.clone(), gateway.metadata.name.clone());
        for listener in &gateway.listeners {
            let tls_secret = listener.tls_secret.as_deref().and_then(|name| {
                match self.ctx.store.secret(ns, name) {
                    Some(secret) if secret.is_tls() => {
                        Some(ObjectRef::new(ObjectKind::Secret, ns.clone(), name))
                    }
                    Some(_) => {
                        tracing::warn!("gateway {owner}: secret '{ns}/{name}' is not a TLS secret");
                        None
                    }
                    None => {
                        tracing::warn!("gateway {owner}: secret '{ns}/{name}' not found");
                        None
                    }
                }
            });
            let binding = ListenerBinding {
                name: listener.name.clone(),
                protocol: listener.protocol,
                hostname: listener.hostname.clone(),
                tls_secret,
                owner: owner.clone(),
            };
            if let Err(current) = target.bind_listener(listener.port, binding) {
                tracing::warn!(
                    "gateway {owner}: listener '{}' port {} already bound by {current}",
                    listener.name,
                    listener.port
                );
            }
        }
    }

    /// Hostnames `route` is served on, each with the certificate of the
    /// first TLS listener accepting it.
    fn route_hosts(target: &ProxyConfig, route: &HttpRoute) -> BTreeMap<String, Option<ObjectRef>> {
        let ns = &route.metadata.namespace;
        let mut hosts: BTreeMap<String, Option<ObjectRef>> = BTreeMap::new();
        for parent in &route.spec.parent_refs {
            let gateway = ObjectRef::new(ObjectKind::Gateway, ns.clone(), parent.name.clone());
            let listeners = target
                .listeners_of(&gateway)
                .filter(|(_, l)| parent.section_name.as_ref().map_or(true, |s| *s == l.name));
            for (_, listener) in listeners {
                for host in accepted_hostnames(listener.hostname.as_deref(), &route.spec.hostnames) {
                    let tls = hosts.entry(host).or_insert(None);
                    if tls.is_none() {
                        tls.clone_from(&listener.tls_secret);
                    }
                }
            }
        }
        hosts
    }

    fn add_route(&self, target: &mut ProxyConfig, route: &HttpRoute) {
        let ns = &route.metadata.namespace;
        let owner = ObjectRef::new(ObjectKind::HttpRoute, ns.clone(), route.metadata.name.clone());

        let hosts = Self::route_hosts(target, route);
        if hosts.is_empty() {
            tracing::warn!("httproute {owner}: no parent listener accepts it");
            return;
        }

        for rule in &route.spec.rules {
            let backends: Vec<WeightedBackend> = rule
                .backend_refs
                .iter()
                .filter_map(|b| {
                    backend::acquire(target, self.ctx.store, ns, &b.name, b.port).map(|id| {
                        WeightedBackend {
                            backend: id,
                            weight: b.weight,
                        }
                    })
                })
                .collect();
            if backends.is_empty() {
                tracing::warn!("httproute {owner}: rule has no resolvable backend");
                continue;
            }

            let root = [HttpRouteMatch {
                path: "/".to_string(),
                path_type: PathType::Prefix,
            }];
            let matches = if rule.matches.is_empty() {
                &root[..]
            } else {
                &rule.matches[..]
            };

            for host in hosts.keys() {
                for m in matches {
                    let path = PathRoute {
                        path: m.path.clone(),
                        path_type: m.path_type,
                        backends: backends.clone(),
                        owner: owner.clone(),
                    };
                    match target.add_path(host, path.clone()) {
                        Ok(()) => {}
                        // routes take precedence over ingress rules
                        Err(current) if current.kind == ObjectKind::Ingress => {
                            tracing::debug!("httproute {owner}: takes {host}{} from {current}", m.path);
                            target.remove_path(host, &m.path, m.path_type);
                            if let Err(current) = target.add_path(host, path) {
                                tracing::warn!("httproute {owner}: {host}{} already owned by {current}", m.path);
                            }
                        }
                        Err(current) => {
                            tracing::warn!("httproute {owner}: {host}{} already owned by {current}", m.path);
                        }
                    }
                }
            }
        }

        for (host, secret) in hosts {
            let Some(secret) = secret else { continue };
            match target.set_host_tls(&host, secret.clone(), &owner) {
                Ok(()) => {}
                // listener certificates take precedence over ingress TLS
                Err(current) if current.kind == ObjectKind::Ingress => {
                    tracing::debug!("httproute {owner}: takes certificate of '{host}' from {current}");
                    target.remove_host_tls(&host);
                    if let Err(current) = target.set_host_tls(&host, secret, &owner) {
                        tracing::warn!("httproute {owner}: host '{host}' already has a certificate from {current}");
                    }
                }
                Err(current) => {
                    tracing::debug!("httproute {owner}: host '{host}' already has a certificate from {current}");
                }
            }
        }
    }

    /// Routes to rebuild: changed routes, routes pointing at a changed
    /// service, and every route sharing a hostname with one of those, so
    /// contested paths and certificates are handed out again in name order.
    fn affected_routes(&self, target: &ProxyConfig) -> BTreeSet<ObjectRef> {
        let services = backend::changed_services(self.ctx.changes);
        let mut routes = backend::routes_using(self.ctx.store, &services);
        routes.extend(self.ctx.changes.changed_refs(ObjectKind::HttpRoute));

        let mut touched: BTreeSet<String> = BTreeSet::new();
        for route_ref in &routes {
            touched.extend(target.hosts_owned_by(route_ref));
            if let Some(route) = self.ctx.store.http_route(&route_ref.namespace, &route_ref.name) {
                touched.extend(Self::route_hosts(target, route).into_keys());
            }
        }
        for route in self.ctx.store.http_routes() {
            if Self::route_hosts(target, route).keys().any(|h| touched.contains(h)) {
                routes.insert(ObjectRef::new(
                    ObjectKind::HttpRoute,
                    route.metadata.namespace.clone(),
                    route.metadata.name.clone(),
                ));
            }
        }
        routes
    }

    /// A listener certificate appeared, changed or went away.
    fn listener_secret_changed(&self) -> bool {
        let secrets = self.ctx.changes.changed_refs(ObjectKind::Secret);
        if secrets.is_empty() {
            return false;
        }
        self.ctx.store.gateways().any(|gateway| {
            let ns = &gateway.metadata.namespace;
            gateway.listeners.iter().filter_map(|l| l.tls_secret.as_deref()).any(|name| {
                secrets.contains(&ObjectRef::new(ObjectKind::Secret, ns.clone(), name))
            })
        })
    }
}

impl Converter<ProxyConfig> for GatewayConverter<'_> {
    fn need_full_sync(&self, _target: &ProxyConfig) -> bool {
        self.ctx.options.has_gateway
            && (self.ctx.changes.touches(ObjectKind::Gateway) || self.listener_secret_changed())
    }

    fn sync(&mut self, target: &mut ProxyConfig, full_sync: bool) -> Result<(), SyncError> {
        if full_sync {
            for gateway in self.ctx.store.gateways() {
                self.bind_gateway(target, gateway);
            }
            for route in self.ctx.store.http_routes() {
                self.add_route(target, route);
            }
        } else {
            let affected = self.affected_routes(target);
            for route_ref in &affected {
                target.remove_owned_by(route_ref);
            }
            for route_ref in &affected {
                if let Some(route) = self.ctx.store.http_route(&route_ref.namespace, &route_ref.name) {
                    self.add_route(target, route);
                }
            }
        }
        target.prune_backends();
        Ok(())
    }
}

/// Hostnames a listener accepts from a route's hostname list.
///
/// Listener `*.example.com` accepts `a.example.com`; a listener without a
/// hostname accepts everything; a route without hostnames inherits the
/// listener's hostname (or the default host).
fn accepted_hostnames(listener: Option<&str>, route: &[String]) -> Vec<String> {
    match (listener, route.is_empty()) {
        (Some(l), true) => vec![l.to_string()],
        (None, true) => vec![DEFAULT_HOST.to_string()],
        (None, false) => route.to_vec(),
        (Some(l), false) => route
            .iter()
            .filter(|h| hostname_matches(l, h))
            .cloned()
            .collect(),
    }
}

fn hostname_matches(pattern: &str, host: &str) -> bool {
    match pattern.strip_prefix('*') {
        Some(suffix) => host == pattern || (host.ends_with(suffix) && host.len() > suffix.len()),
        None => host == pattern,
    }
}
