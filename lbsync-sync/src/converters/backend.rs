//! Service → backend resolution shared by the converters.

use std::collections::BTreeSet;

use lbsync_core::{ChangeSet, ObjectKind, ObjectRef};

use crate::cache::ResourceStore;
use crate::proxy::{Backend, BackendId, ProxyConfig};

/// Build the backend for `namespace/service:port` from current state.
///
/// A service without an endpoints object resolves to a backend with no
/// servers; a missing service or undeclared port does not resolve.
pub(crate) fn resolve(
    store: &ResourceStore,
    namespace: &str,
    service: &str,
    port: u16,
) -> Option<(BackendId, Backend)> {
    let Some(svc) = store.service(namespace, service) else {
        tracing::warn!("service '{namespace}/{service}' not found");
        return None;
    };
    let Some(svc_port) = svc.port(port) else {
        tracing::warn!("service '{namespace}/{service}' has no port {port}");
        return None;
    };

    let target_port = svc_port.target_port.unwrap_or(port);
    let endpoints = match store.endpoints(namespace, service) {
        Some(ep) => {
            let named = svc_port.name.as_deref().and_then(|name| {
                ep.ports
                    .iter()
                    .find(|p| p.name.as_deref() == Some(name))
                    .map(|p| p.port)
            });
            let server_port = named.unwrap_or(target_port);
            ep.addresses
                .iter()
                .map(|addr| format!("{addr}:{server_port}"))
                .collect()
        }
        None => Vec::new(),
    };

    Some((
        BackendId::new(namespace, service, port),
        Backend {
            service: ObjectRef::new(ObjectKind::Service, namespace, service),
            port,
            endpoints,
        },
    ))
}

/// Resolve and store a backend, returning its id.
pub(crate) fn acquire(
    target: &mut ProxyConfig,
    store: &ResourceStore,
    namespace: &str,
    service: &str,
    port: u16,
) -> Option<BackendId> {
    let (id, backend) = resolve(store, namespace, service, port)?;
    target.upsert_backend(id.clone(), backend);
    Some(id)
}

/// Services touched by the change set directly or through their endpoints.
pub(crate) fn changed_services(changes: &ChangeSet) -> BTreeSet<ObjectRef> {
    changes
        .changed_refs(ObjectKind::Service)
        .into_iter()
        .chain(
            changes
                .changed_refs(ObjectKind::Endpoints)
                .into_iter()
                .map(|r| r.with_kind(ObjectKind::Service)),
        )
        .collect()
}

/// HTTPRoutes whose backend refs name one of `services`.
///
/// Resolving a route depends on its services, so these routes are rebuilt
/// like changed routes, and the paths they release or claim move between
/// routes and ingresses in the same way.
pub(crate) fn routes_using(store: &ResourceStore, services: &BTreeSet<ObjectRef>) -> BTreeSet<ObjectRef> {
    if services.is_empty() {
        return BTreeSet::new();
    }
    store
        .http_routes()
        .filter(|route| {
            let ns = &route.metadata.namespace;
            route
                .spec
                .rules
                .iter()
                .flat_map(|r| &r.backend_refs)
                .any(|b| services.contains(&ObjectRef::new(ObjectKind::Service, ns.clone(), b.name.clone())))
        })
        .map(|route| {
            ObjectRef::new(
                ObjectKind::HttpRoute,
                route.metadata.namespace.clone(),
                route.metadata.name.clone(),
            )
        })
        .collect()
}

/// Re-resolve every existing backend generated from one of `services`.
///
/// Backends whose service vanished keep their slot with no servers until the
/// paths referencing them are removed.
pub(crate) fn refresh_services(
    target: &mut ProxyConfig,
    store: &ResourceStore,
    services: &BTreeSet<ObjectRef>,
) {
    for svc in services {
        for id in target.backends_of_service(svc) {
            let Some(port) = target.backends.get(&id).map(|b| b.port) else {
                continue;
            };
            match resolve(store, &svc.namespace, &svc.name, port) {
                Some((_, backend)) => target.upsert_backend(id, backend),
                None => {
                    if let Some(existing) = target.backends.get_mut(&id) {
                        existing.endpoints.clear();
                    }
                }
            }
        }
    }
}
