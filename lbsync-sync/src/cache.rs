//! Cluster cache: the resource store converters read from plus the change
//! accumulator the watch layer writes into.
//!
//! Producers call [`ClusterCache::apply`] / [`ClusterCache::delete`]; each
//! call updates the store and records the notification while holding the
//! store's write lock, so any notification a pass swaps out is already
//! reflected in the snapshot that pass takes afterwards.
//!
//! The store is copy-on-write: a pass holds an `Arc` snapshot and producers
//! keep writing into a fresh copy instead of waiting for the pass to end.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use lbsync_core::manifest::{
    self, ConfigMap, Endpoints, Gateway, HttpRoute, Ingress, Secret, Service,
};
use lbsync_core::{
    ChangeHint, ChangeNotification, ChangeOp, ChangeSet, ControllerConfig, CoreError, Manifest,
    ObjectKind, ObjectRef,
};

use crate::accumulator::ChangeAccumulator;

// ---------------------------------------------------------------------------
// ResourceStore
// ---------------------------------------------------------------------------

/// Current state of every known cluster object, ordered by reference.
#[derive(Debug, Clone, Default)]
pub struct ResourceStore {
    objects: BTreeMap<ObjectRef, Manifest>,
}

impl ResourceStore {
    /// Insert or replace; returns `None` when the stored object is identical.
    pub fn upsert(&mut self, manifest: Manifest) -> Option<ChangeOp> {
        let key = manifest.object_ref();
        match self.objects.get(&key) {
            Some(existing) if *existing == manifest => None,
            Some(_) => {
                self.objects.insert(key, manifest);
                Some(ChangeOp::Update)
            }
            None => {
                self.objects.insert(key, manifest);
                Some(ChangeOp::Add)
            }
        }
    }

    pub fn remove(&mut self, object: &ObjectRef) -> Option<Manifest> {
        self.objects.remove(object)
    }

    pub fn get(&self, object: &ObjectRef) -> Option<&Manifest> {
        self.objects.get(object)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn count(&self, kind: ObjectKind) -> usize {
        self.objects.keys().filter(|r| r.kind == kind).count()
    }

    /// Every stored object, ordered by reference.
    pub fn manifests(&self) -> impl Iterator<Item = &Manifest> + '_ {
        self.objects.values()
    }

    pub fn ingresses(&self) -> impl Iterator<Item = &Ingress> + '_ {
        self.objects.values().filter_map(|m| match m {
            Manifest::Ingress(o) => Some(o),
            _ => None,
        })
    }

    pub fn gateways(&self) -> impl Iterator<Item = &Gateway> + '_ {
        self.objects.values().filter_map(|m| match m {
            Manifest::Gateway(o) => Some(o),
            _ => None,
        })
    }

    pub fn http_routes(&self) -> impl Iterator<Item = &HttpRoute> + '_ {
        self.objects.values().filter_map(|m| match m {
            Manifest::HttpRoute(o) => Some(o),
            _ => None,
        })
    }

    pub fn ingress(&self, namespace: &str, name: &str) -> Option<&Ingress> {
        match self.lookup(ObjectKind::Ingress, namespace, name)? {
            Manifest::Ingress(o) => Some(o),
            _ => None,
        }
    }

    pub fn service(&self, namespace: &str, name: &str) -> Option<&Service> {
        match self.lookup(ObjectKind::Service, namespace, name)? {
            Manifest::Service(o) => Some(o),
            _ => None,
        }
    }

    pub fn endpoints(&self, namespace: &str, name: &str) -> Option<&Endpoints> {
        match self.lookup(ObjectKind::Endpoints, namespace, name)? {
            Manifest::Endpoints(o) => Some(o),
            _ => None,
        }
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<&Secret> {
        match self.lookup(ObjectKind::Secret, namespace, name)? {
            Manifest::Secret(o) => Some(o),
            _ => None,
        }
    }

    pub fn config_map(&self, namespace: &str, name: &str) -> Option<&ConfigMap> {
        match self.lookup(ObjectKind::ConfigMap, namespace, name)? {
            Manifest::ConfigMap(o) => Some(o),
            _ => None,
        }
    }

    pub fn gateway(&self, namespace: &str, name: &str) -> Option<&Gateway> {
        match self.lookup(ObjectKind::Gateway, namespace, name)? {
            Manifest::Gateway(o) => Some(o),
            _ => None,
        }
    }

    pub fn http_route(&self, namespace: &str, name: &str) -> Option<&HttpRoute> {
        match self.lookup(ObjectKind::HttpRoute, namespace, name)? {
            Manifest::HttpRoute(o) => Some(o),
            _ => None,
        }
    }

    fn lookup(&self, kind: ObjectKind, namespace: &str, name: &str) -> Option<&Manifest> {
        self.objects.get(&ObjectRef::new(kind, namespace, name))
    }
}

// ---------------------------------------------------------------------------
// ClusterCache
// ---------------------------------------------------------------------------

/// Shared between every producer and the orchestrator; wrap in an `Arc`.
#[derive(Debug)]
pub struct ClusterCache {
    store: RwLock<Arc<ResourceStore>>,
    changes: ChangeAccumulator,
    global_config_map: Option<ObjectRef>,
    tcp_services_config_map: Option<ObjectRef>,
}

impl ClusterCache {
    /// A new cache starts out demanding a full sync.
    pub fn new(config: &ControllerConfig) -> Self {
        Self {
            store: RwLock::new(Arc::new(ResourceStore::default())),
            changes: ChangeAccumulator::with_full_sync(),
            global_config_map: config
                .global_config_map
                .as_ref()
                .map(|n| ObjectRef::from_name(ObjectKind::ConfigMap, n)),
            tcp_services_config_map: config
                .tcp_services_config_map
                .as_ref()
                .map(|n| ObjectRef::from_name(ObjectKind::ConfigMap, n)),
        }
    }

    /// Upsert a manifest; returns `true` when it was recorded as a change.
    pub fn apply(&self, manifest: Manifest) -> bool {
        let object = manifest.object_ref();
        let hint = self.hint_for(&object, &manifest);

        let mut guard = self.store.write().unwrap_or_else(PoisonError::into_inner);
        let Some(op) = Arc::make_mut(&mut *guard).upsert(manifest) else {
            return false;
        };
        self.record(ChangeNotification::new(op, object), hint);
        true
    }

    /// Remove an object; returns `true` when it existed.
    pub fn delete(&self, object: &ObjectRef) -> bool {
        let mut guard = self.store.write().unwrap_or_else(PoisonError::into_inner);
        if Arc::make_mut(&mut *guard).remove(object).is_none() {
            return false;
        }
        let hint = self.hint_for_data(object, Default::default());
        self.record(ChangeNotification::delete(object.clone()), hint);
        true
    }

    /// Producers that lost track of the cluster (watch error, relist) call
    /// this so the next pass rebuilds from scratch.
    pub fn resync_required(&self) {
        self.changes.mark_full_sync_required();
    }

    /// Swap out the accumulated change set.
    pub fn swap_changed_objects(&self) -> ChangeSet {
        self.changes.swap()
    }

    /// Point-in-time view of the store; cheap, never blocks producers for
    /// longer than a pointer clone.
    pub fn snapshot(&self) -> Arc<ResourceStore> {
        let guard = self.store.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&*guard)
    }

    pub fn accumulator(&self) -> &ChangeAccumulator {
        &self.changes
    }

    /// Apply every manifest found directly under `dir`.
    pub fn load_dir(&self, dir: &Path) -> Result<usize, CoreError> {
        let mut applied = 0;
        for (_path, manifests) in manifest::load_dir_at(dir)? {
            for m in manifests {
                if self.apply(m) {
                    applied += 1;
                }
            }
        }
        Ok(applied)
    }

    fn record(&self, notification: ChangeNotification, hint: Option<ChangeHint>) {
        match hint {
            Some(hint) => self.changes.record_with_hint(notification, hint),
            None => self.changes.record(notification),
        }
    }

    fn hint_for(&self, object: &ObjectRef, manifest: &Manifest) -> Option<ChangeHint> {
        match manifest {
            Manifest::ConfigMap(cm) => self.hint_for_data(object, cm.data.clone()),
            _ => None,
        }
    }

    fn hint_for_data(
        &self,
        object: &ObjectRef,
        data: BTreeMap<String, String>,
    ) -> Option<ChangeHint> {
        if self.global_config_map.as_ref() == Some(object) {
            Some(ChangeHint::GlobalConfigMap(data))
        } else if self.tcp_services_config_map.as_ref() == Some(object) {
            Some(ChangeHint::TcpServicesConfigMap(data))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use lbsync_core::manifest::{Metadata, ServicePort};
    use lbsync_core::NamespacedName;

    use super::*;

    fn service(name: &str, port: u16) -> Manifest {
        Manifest::Service(Service {
            metadata: Metadata::new("default", name),
            ports: vec![ServicePort {
                name: None,
                port,
                target_port: None,
            }],
        })
    }

    fn tcp_config() -> ControllerConfig {
        ControllerConfig {
            tcp_services_config_map: Some(NamespacedName::new("lb", "tcp")),
            ..Default::default()
        }
    }

    #[test]
    fn first_swap_requires_full_sync() {
        let cache = ClusterCache::new(&ControllerConfig::default());
        assert!(cache.swap_changed_objects().need_full_sync);
        assert!(!cache.swap_changed_objects().need_full_sync);
    }

    #[test]
    fn identical_apply_is_not_a_change() {
        let cache = ClusterCache::new(&ControllerConfig::default());
        assert!(cache.apply(service("echo", 80)));
        assert!(!cache.apply(service("echo", 80)));
        assert!(cache.apply(service("echo", 81)));

        let set = cache.swap_changed_objects();
        let ops: Vec<ChangeOp> = set.objects.iter().map(|n| n.op).collect();
        assert_eq!(ops, [ChangeOp::Add, ChangeOp::Update]);
    }

    #[test]
    fn delete_of_unknown_object_is_ignored() {
        let cache = ClusterCache::new(&ControllerConfig::default());
        cache.swap_changed_objects();
        let missing = ObjectRef::new(ObjectKind::Service, "default", "nope");
        assert!(!cache.delete(&missing));
        assert!(cache.swap_changed_objects().objects.is_empty());
    }

    #[test]
    fn snapshot_is_isolated_from_later_writes() {
        let cache = ClusterCache::new(&ControllerConfig::default());
        cache.apply(service("echo", 80));
        let before = cache.snapshot();
        cache.apply(service("other", 80));
        assert_eq!(before.len(), 1);
        assert_eq!(cache.snapshot().len(), 2);
    }

    #[test]
    fn tcp_configmap_changes_carry_hint() {
        let cache = ClusterCache::new(&tcp_config());
        cache.swap_changed_objects();

        let cm = Manifest::ConfigMap(ConfigMap {
            metadata: Metadata::new("lb", "tcp"),
            data: [("5432".to_string(), "db/postgres:5432".to_string())].into(),
        });
        cache.apply(cm.clone());
        let set = cache.swap_changed_objects();
        assert_eq!(
            set.hints
                .tcp_config_map_data_new
                .as_ref()
                .and_then(|d| d.get("5432"))
                .map(String::as_str),
            Some("db/postgres:5432")
        );

        cache.delete(&cm.object_ref());
        let set = cache.swap_changed_objects();
        assert_eq!(set.hints.tcp_config_map_data_new, Some(BTreeMap::new()));
    }

    #[test]
    fn unrelated_configmap_has_no_hint() {
        let cache = ClusterCache::new(&tcp_config());
        cache.swap_changed_objects();
        cache.apply(Manifest::ConfigMap(ConfigMap {
            metadata: Metadata::new("lb", "other"),
            data: BTreeMap::new(),
        }));
        let set = cache.swap_changed_objects();
        assert_eq!(set.len(), 1);
        assert!(set.hints.is_empty());
    }
}
