//! Ingress domain: ingress rules become host paths, ingress TLS becomes host
//! certificates, and the configured default backend is resolved here.

use std::collections::BTreeSet;

use lbsync_core::manifest::{Ingress, IngressBackend, PathType};
use lbsync_core::{ObjectKind, ObjectRef};

use crate::converter::{Converter, PassContext};
use crate::error::SyncError;
use crate::proxy::{PathRoute, ProxyConfig, WeightedBackend, DEFAULT_HOST};

use super::backend;

/// Stage key recorded by the timer.
pub const STAGE: &str = "parse_ingress";

pub struct IngressConverter<'a> {
    ctx: PassContext<'a>,
}

impl<'a> IngressConverter<'a> {
    pub fn new(ctx: PassContext<'a>) -> Self {
        Self { ctx }
    }

    fn class_matches(&self, ingress: &Ingress) -> bool {
        match &self.ctx.options.ingress_class {
            Some(class) => ingress.spec.ingress_class_name.as_ref() == Some(class),
            None => true,
        }
    }

    fn sync_default_backend(&self, target: &mut ProxyConfig) {
        let Some(svc) = &self.ctx.options.default_backend else {
            target.default_backend = None;
            return;
        };
        let id = backend::acquire(target, self.ctx.store, &svc.namespace, &svc.name, svc.port);
        if id.is_none() {
            tracing::warn!("default backend '{svc}' does not resolve");
        }
        target.default_backend = id;
    }

    fn add_path(
        &self,
        target: &mut ProxyConfig,
        owner: &ObjectRef,
        host: &str,
        path: &str,
        path_type: PathType,
        be: &IngressBackend,
    ) {
        let Some(id) = backend::acquire(target, self.ctx.store, &owner.namespace, &be.service, be.port)
        else {
            tracing::warn!("ingress {owner}: skipping {host}{path}, backend does not resolve");
            return;
        };
        let route = PathRoute {
            path: path.to_string(),
            path_type,
            backends: vec![WeightedBackend {
                backend: id,
                weight: 1,
            }],
            owner: owner.clone(),
        };
        match target.add_path(host, route) {
            Ok(()) => {}
            Err(current) if current.kind == ObjectKind::HttpRoute => {
                tracing::debug!("ingress {owner}: {host}{path} is served by {current}");
            }
            Err(current) => {
                tracing::warn!("ingress {owner}: {host}{path} already owned by {current}");
            }
        }
    }

    fn add_ingress(&self, target: &mut ProxyConfig, ingress: &Ingress) {
        let ns = &ingress.metadata.namespace;
        let owner = ObjectRef::new(ObjectKind::Ingress, ns.clone(), ingress.metadata.name.clone());

        if let Some(be) = &ingress.spec.default_backend {
            self.add_path(target, &owner, DEFAULT_HOST, "/", PathType::Prefix, be);
        }
        for rule in &ingress.spec.rules {
            let host = if rule.host.is_empty() {
                DEFAULT_HOST
            } else {
                rule.host.as_str()
            };
            for p in &rule.paths {
                self.add_path(target, &owner, host, &p.path, p.path_type, &p.backend);
            }
        }

        for tls in &ingress.spec.tls {
            match self.ctx.store.secret(ns, &tls.secret_name) {
                Some(secret) if secret.is_tls() => {}
                Some(_) => {
                    tracing::warn!("ingress {owner}: secret '{ns}/{}' is not a TLS secret", tls.secret_name);
                    continue;
                }
                None => {
                    tracing::warn!("ingress {owner}: secret '{ns}/{}' not found", tls.secret_name);
                    continue;
                }
            }
            let secret = ObjectRef::new(ObjectKind::Secret, ns.clone(), tls.secret_name.clone());
            let hosts: Vec<&str> = if tls.hosts.is_empty() {
                vec![DEFAULT_HOST]
            } else {
                tls.hosts.iter().map(String::as_str).collect()
            };
            for host in hosts {
                match target.set_host_tls(host, secret.clone(), &owner) {
                    Ok(()) => {}
                    Err(current) if current.kind == ObjectKind::HttpRoute => {
                        tracing::debug!("ingress {owner}: certificate of '{host}' comes from {current}");
                    }
                    Err(current) => {
                        tracing::warn!("ingress {owner}: host '{host}' already has a certificate from {current}");
                    }
                }
            }
        }
    }

    /// Ingresses to rebuild: changed ones, those referencing a changed
    /// service or secret, and every ingress declaring a host one of those
    /// touches, so contested paths and certificates are handed out again in
    /// name order. A route change may release or claim any path, so it
    /// rebuilds every ingress.
    fn affected_ingresses(&self, target: &ProxyConfig, services: &BTreeSet<ObjectRef>) -> BTreeSet<ObjectRef> {
        let store = self.ctx.store;
        let route_services: BTreeSet<ObjectRef> =
            self.ctx.changes.changed_refs(ObjectKind::Service).into_iter().collect();
        let routes_changed = self.ctx.options.has_gateway
            && (self.ctx.changes.touches(ObjectKind::HttpRoute)
                || !backend::routes_using(store, &route_services).is_empty());
        let secrets: BTreeSet<ObjectRef> = self
            .ctx
            .changes
            .changed_refs(ObjectKind::Secret)
            .into_iter()
            .collect();
        let mut ingresses: BTreeSet<ObjectRef> = self
            .ctx
            .changes
            .changed_refs(ObjectKind::Ingress)
            .into_iter()
            .collect();

        for ingress in store.ingresses() {
            let ns = &ingress.metadata.namespace;
            let uses_service = ingress
                .spec
                .rules
                .iter()
                .flat_map(|r| r.paths.iter().map(|p| &p.backend))
                .chain(ingress.spec.default_backend.iter())
                .any(|b| services.contains(&ObjectRef::new(ObjectKind::Service, ns.clone(), b.service.clone())));
            let uses_secret = ingress.spec.tls.iter().any(|t| {
                secrets.contains(&ObjectRef::new(ObjectKind::Secret, ns.clone(), t.secret_name.clone()))
            });
            if routes_changed || uses_service || uses_secret {
                ingresses.insert(ref_of(ingress));
            }
        }

        let mut touched: BTreeSet<String> = BTreeSet::new();
        for ingress_ref in &ingresses {
            touched.extend(target.hosts_owned_by(ingress_ref));
            let current = store.ingress(&ingress_ref.namespace, &ingress_ref.name);
            if let Some(ingress) = current.filter(|i| self.class_matches(i)) {
                touched.extend(declared_hosts(ingress));
            }
        }
        for ingress in store.ingresses().filter(|i| self.class_matches(i)) {
            if declared_hosts(ingress).iter().any(|h| touched.contains(h)) {
                ingresses.insert(ref_of(ingress));
            }
        }
        ingresses
    }
}

fn ref_of(ingress: &Ingress) -> ObjectRef {
    ObjectRef::new(
        ObjectKind::Ingress,
        ingress.metadata.namespace.clone(),
        ingress.metadata.name.clone(),
    )
}

/// Every host an ingress may claim a path or certificate on.
fn declared_hosts(ingress: &Ingress) -> BTreeSet<String> {
    let or_default = |host: &str| {
        if host.is_empty() {
            DEFAULT_HOST.to_string()
        } else {
            host.to_string()
        }
    };
    let mut hosts: BTreeSet<String> = ingress.spec.rules.iter().map(|r| or_default(&r.host)).collect();
    if ingress.spec.default_backend.is_some() {
        hosts.insert(DEFAULT_HOST.to_string());
    }
    for tls in &ingress.spec.tls {
        if tls.hosts.is_empty() {
            hosts.insert(DEFAULT_HOST.to_string());
        }
        hosts.extend(tls.hosts.iter().map(|h| or_default(h)));
    }
    hosts
}

impl Converter<ProxyConfig> for IngressConverter<'_> {
    fn need_full_sync(&self, _target: &ProxyConfig) -> bool {
        self.ctx.changes.hints.global_config_map_data_new.is_some()
            || self.ctx.changes.touches(ObjectKind::IngressClass)
    }

    fn sync(&mut self, target: &mut ProxyConfig, full_sync: bool) -> Result<(), SyncError> {
        if full_sync {
            self.sync_default_backend(target);
            for ingress in self.ctx.store.ingresses().filter(|i| self.class_matches(i)) {
                self.add_ingress(target, ingress);
            }
        } else {
            let services = backend::changed_services(self.ctx.changes);
            let affected = self.affected_ingresses(target, &services);
            for ingress_ref in &affected {
                target.remove_owned_by(ingress_ref);
            }
            for ingress_ref in &affected {
                let current = self.ctx.store.ingress(&ingress_ref.namespace, &ingress_ref.name);
                if let Some(ingress) = current.filter(|i| self.class_matches(i)) {
                    self.add_ingress(target, ingress);
                }
            }
            let default_changed = self
                .ctx
                .options
                .default_backend
                .as_ref()
                .is_some_and(|svc| services.contains(&svc.service()));
            if default_changed {
                self.sync_default_backend(target);
            }
            backend::refresh_services(target, self.ctx.store, &services);
        }
        target.prune_backends();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use lbsync_core::manifest::parse_manifests;
    use lbsync_core::{ChangeNotification, ChangeSet, ControllerConfig, Manifest, ServiceRef};

    use super::*;
    use crate::cache::ResourceStore;
    use crate::proxy::{BackendId, HostTls};

    const FIXTURE: &str = r#"
- kind: Ingress
  metadata: { name: shop }
  spec:
    ingressClassName: lb
    tls: [{ hosts: [shop.example], secretName: shop-tls }]
    rules:
      - host: shop.example
        paths:
          - { path: /, backend: { service: web, port: 80 } }
          - { path: /api, pathType: Exact, backend: { service: api, port: 8080 } }
- kind: Ingress
  metadata: { name: other }
  spec:
    ingressClassName: other
    rules:
      - paths: [{ backend: { service: web, port: 80 } }]
- kind: Secret
  metadata: { name: shop-tls }
  data: { tls.crt: crt, tls.key: key }
- kind: Service
  metadata: { name: web }
  ports: [{ name: http, port: 80, targetPort: 8000 }]
- kind: Endpoints
  metadata: { name: web }
  addresses: [10.0.0.1]
  ports: [{ name: http, port: 8000 }]
- kind: Service
  metadata: { name: api }
  ports: [{ port: 8080 }]
"#;

    fn store(yaml: &str) -> ResourceStore {
        let mut store = ResourceStore::default();
        for m in parse_manifests(yaml).expect("fixture") {
            store.upsert(m);
        }
        store
    }

    fn options() -> ControllerConfig {
        ControllerConfig {
            ingress_class: Some("lb".to_string()),
            default_backend: Some(ServiceRef::new("default", "web", 80)),
            ..Default::default()
        }
    }

    fn full(store: &ResourceStore, options: &ControllerConfig) -> ProxyConfig {
        let changes = ChangeSet::default();
        let ctx = PassContext { options, store, changes: &changes };
        let mut target = ProxyConfig::default();
        IngressConverter::new(ctx).sync(&mut target, true).expect("full sync");
        target
    }

    fn incremental(
        target: &mut ProxyConfig,
        store: &ResourceStore,
        options: &ControllerConfig,
        changes: &ChangeSet,
    ) {
        let ctx = PassContext { options, store, changes };
        let mut conv = IngressConverter::new(ctx);
        assert!(!conv.need_full_sync(target));
        conv.sync(target, false).expect("incremental sync");
    }

    fn shop() -> ObjectRef {
        ObjectRef::new(ObjectKind::Ingress, "default", "shop")
    }

    #[test]
    fn full_sync_builds_matching_ingresses() {
        let store = store(FIXTURE);
        let target = full(&store, &options());

        let web = BackendId::new("default", "web", 80);
        assert_eq!(target.default_backend.as_ref(), Some(&web));
        assert_eq!(target.backends[&web].endpoints, ["10.0.0.1:8000"]);

        let host = &target.hosts["shop.example"];
        let paths: Vec<&str> = host.paths.iter().map(|p| p.path.as_str()).collect();
        assert_eq!(paths, ["/api", "/"]);
        assert_eq!(host.paths[0].path_type, PathType::Exact);
        assert_eq!(
            host.tls,
            Some(HostTls {
                secret: ObjectRef::new(ObjectKind::Secret, "default", "shop-tls"),
                owner: shop(),
            })
        );
        assert!(!target.hosts.contains_key(DEFAULT_HOST), "class 'other' is ignored");
        assert!(target.backends[&BackendId::new("default", "api", 8080)].endpoints.is_empty());
    }

    #[test]
    fn without_class_every_ingress_is_converted() {
        let store = store(FIXTURE);
        let target = full(&store, &ControllerConfig::default());
        assert_eq!(target.hosts[DEFAULT_HOST].paths[0].owner.name, "other");
        assert!(target.default_backend.is_none());
    }

    #[test]
    fn need_full_sync_on_global_hint_or_class_change() {
        let store = store(FIXTURE);
        let options = options();
        let target = ProxyConfig::default();

        let mut changes = ChangeSet::default();
        changes.hints.global_config_map_data_new = Some(BTreeMap::new());
        let ctx = PassContext { options: &options, store: &store, changes: &changes };
        assert!(IngressConverter::new(ctx).need_full_sync(&target));

        let changes = ChangeSet {
            objects: vec![ChangeNotification::add(ObjectRef::new(ObjectKind::IngressClass, "default", "lb"))],
            ..Default::default()
        };
        let ctx = PassContext { options: &options, store: &store, changes: &changes };
        assert!(IngressConverter::new(ctx).need_full_sync(&target));
    }

    #[test]
    fn endpoints_change_refreshes_backend() {
        let before = store(FIXTURE);
        let options = options();
        let mut target = full(&before, &options);

        let mut after = before.clone();
        after.upsert(
            parse_manifests(
                "kind: Endpoints\nmetadata: { name: web }\naddresses: [10.0.0.1, 10.0.0.2]\nports: [{ name: http, port: 8000 }]\n",
            )
            .expect("endpoints")
            .remove(0),
        );
        let changes = ChangeSet {
            objects: vec![ChangeNotification::update(ObjectRef::new(ObjectKind::Endpoints, "default", "web"))],
            ..Default::default()
        };
        incremental(&mut target, &after, &options, &changes);

        assert_eq!(
            target.backends[&BackendId::new("default", "web", 80)].endpoints,
            ["10.0.0.1:8000", "10.0.0.2:8000"]
        );
        assert_eq!(target, full(&after, &options));
    }

    #[test]
    fn deleted_ingress_is_removed() {
        let before = store(FIXTURE);
        let options = options();
        let mut target = full(&before, &options);

        let mut after = before.clone();
        after.remove(&shop());
        let changes = ChangeSet {
            objects: vec![ChangeNotification::delete(shop())],
            ..Default::default()
        };
        incremental(&mut target, &after, &options, &changes);

        assert!(target.hosts.is_empty());
        assert_eq!(target.backends.len(), 1, "only the default backend remains");
        assert_eq!(target, full(&after, &options));
    }

    #[test]
    fn missing_secret_skips_tls_but_keeps_paths() {
        let mut store = store(FIXTURE);
        store.remove(&ObjectRef::new(ObjectKind::Secret, "default", "shop-tls"));
        let target = full(&store, &options());
        let host = &target.hosts["shop.example"];
        assert!(host.tls.is_none());
        assert_eq!(host.paths.len(), 2);
    }

    #[test]
    fn secret_change_readds_ingress() {
        let mut before = store(FIXTURE);
        let secret = ObjectRef::new(ObjectKind::Secret, "default", "shop-tls");
        before.remove(&secret);
        let options = options();
        let mut target = full(&before, &options);
        assert!(target.hosts["shop.example"].tls.is_none());

        let after = store(FIXTURE);
        let changes = ChangeSet {
            objects: vec![ChangeNotification::add(secret)],
            ..Default::default()
        };
        incremental(&mut target, &after, &options, &changes);
        assert!(target.hosts["shop.example"].tls.is_some());
    }

    #[test]
    fn route_owned_paths_are_left_alone() {
        let store = store(FIXTURE);
        let options = options();
        let route_owner = ObjectRef::new(ObjectKind::HttpRoute, "default", "r");
        let mut target = ProxyConfig::default();
        let web = BackendId::new("default", "web", 80);
        target
            .add_path(
                "shop.example",
                PathRoute {
                    path: "/".to_string(),
                    path_type: PathType::Prefix,
                    backends: vec![WeightedBackend { backend: web, weight: 1 }],
                    owner: route_owner.clone(),
                },
            )
            .expect("route path");

        let changes = ChangeSet::default();
        let ctx = PassContext { options: &options, store: &store, changes: &changes };
        IngressConverter::new(ctx).sync(&mut target, true).expect("sync");
        assert_eq!(target.path_owner("shop.example", "/", PathType::Prefix), Some(&route_owner));
        assert_eq!(
            target.path_owner("shop.example", "/api", PathType::Exact),
            Some(&shop())
        );
    }

    const CONTESTED: &str = r#"
- kind: Ingress
  metadata: { name: a }
  spec:
    rules: [{ host: x.example, paths: [{ path: /, backend: { service: web, port: 80 } }] }]
- kind: Ingress
  metadata: { name: b }
  spec:
    tls: [{ hosts: [x.example], secretName: shop-tls }]
    rules: [{ host: x.example, paths: [{ path: /, backend: { service: api, port: 8080 } }] }]
"#;

    fn named(name: &str) -> ObjectRef {
        ObjectRef::new(ObjectKind::Ingress, "default", name)
    }

    #[test]
    fn contested_path_moves_to_next_ingress_and_back() {
        let options = ControllerConfig::default();
        let both = store(&format!("{FIXTURE}{CONTESTED}"));
        let mut target = full(&both, &options);
        assert_eq!(target.path_owner("x.example", "/", PathType::Prefix), Some(&named("a")));
        assert_eq!(target.hosts["x.example"].tls.as_ref().map(|t| &t.owner), Some(&named("b")));

        let mut without_a = both.clone();
        without_a.remove(&named("a"));
        let changes = ChangeSet {
            objects: vec![ChangeNotification::delete(named("a"))],
            ..Default::default()
        };
        incremental(&mut target, &without_a, &options, &changes);
        assert_eq!(target.path_owner("x.example", "/", PathType::Prefix), Some(&named("b")));
        assert_eq!(target, full(&without_a, &options));

        let changes = ChangeSet {
            objects: vec![ChangeNotification::add(named("a"))],
            ..Default::default()
        };
        incremental(&mut target, &both, &options, &changes);
        assert_eq!(target.path_owner("x.example", "/", PathType::Prefix), Some(&named("a")));
        assert_eq!(target, full(&both, &options));
    }

    #[test]
    fn declared_hosts_cover_rules_tls_and_default_backend() {
        let both = store(&format!("{FIXTURE}{CONTESTED}"));
        let hosts = |name: &str| {
            declared_hosts(both.ingress("default", name).expect("ingress"))
                .into_iter()
                .collect::<Vec<_>>()
        };
        assert_eq!(hosts("shop"), ["shop.example"]);
        assert_eq!(hosts("other"), [DEFAULT_HOST]);
        assert_eq!(hosts("b"), ["x.example"]);
    }

    #[test]
    fn manifest_fixture_is_well_formed() {
        let manifests = parse_manifests(FIXTURE).expect("fixture");
        assert!(matches!(manifests[0], Manifest::Ingress(_)));
        assert_eq!(manifests.len(), 6);
    }
}
