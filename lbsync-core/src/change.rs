//! Change notifications and the per-pass [`ChangeSet`].

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{ObjectKind, ObjectRef};

/// What happened to an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Add,
    Update,
    Delete,
}

/// One opaque "this object changed" record produced by the watch layer.
///
/// Add and update notifications display as the bare object reference
/// (`ing/default/foo`); deletes are prefixed (`del:ing/default/foo`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub op: ChangeOp,
    pub object: ObjectRef,
}

impl ChangeNotification {
    pub fn new(op: ChangeOp, object: ObjectRef) -> Self {
        Self { op, object }
    }

    pub fn add(object: ObjectRef) -> Self {
        Self::new(ChangeOp::Add, object)
    }

    pub fn update(object: ObjectRef) -> Self {
        Self::new(ChangeOp::Update, object)
    }

    pub fn delete(object: ObjectRef) -> Self {
        Self::new(ChangeOp::Delete, object)
    }
}

impl fmt::Display for ChangeNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.op {
            ChangeOp::Delete => write!(f, "del:{}", self.object),
            ChangeOp::Add | ChangeOp::Update => write!(f, "{}", self.object),
        }
    }
}

/// Domain-specific data carried alongside the notifications.
///
/// Only the converter that owns a hint reads it; everything else passes it
/// through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeHint {
    /// New data of the configured global configmap (empty when deleted).
    GlobalConfigMap(BTreeMap<String, String>),
    /// New data of the configured TCP services configmap (empty when deleted).
    TcpServicesConfigMap(BTreeMap<String, String>),
}

/// Hints accumulated since the last swap. Later hints of the same kind
/// replace earlier ones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeHints {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_config_map_data_new: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_config_map_data_new: Option<BTreeMap<String, String>>,
}

impl ChangeHints {
    pub fn apply(&mut self, hint: ChangeHint) {
        match hint {
            ChangeHint::GlobalConfigMap(data) => self.global_config_map_data_new = Some(data),
            ChangeHint::TcpServicesConfigMap(data) => self.tcp_config_map_data_new = Some(data),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.global_config_map_data_new.is_none() && self.tcp_config_map_data_new.is_none()
    }
}

/// Snapshot handed to exactly one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Notifications in the order they were recorded. Not deduplicated.
    pub objects: Vec<ChangeNotification>,
    /// Sticky "no trustworthy diff" flag set by producers.
    pub need_full_sync: bool,
    #[serde(default)]
    pub hints: ChangeHints,
}

impl ChangeSet {
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty() && !self.need_full_sync && self.hints.is_empty()
    }

    /// Notifications about objects of `kind`, in recorded order.
    pub fn of_kind(&self, kind: ObjectKind) -> impl Iterator<Item = &ChangeNotification> + '_ {
        self.objects.iter().filter(move |n| n.object.kind == kind)
    }

    pub fn touches(&self, kind: ObjectKind) -> bool {
        self.of_kind(kind).next().is_some()
    }

    /// Distinct object references of `kind`, sorted; duplicates and op are
    /// collapsed because converters re-read the current state anyway.
    pub fn changed_refs(&self, kind: ObjectKind) -> Vec<ObjectRef> {
        let mut refs: Vec<ObjectRef> = self.of_kind(kind).map(|n| n.object.clone()).collect();
        refs.sort();
        refs.dedup();
        refs
    }
}

/// `Display` adapter printing notifications as `[a, b, c]`.
pub struct NotificationList<'a>(pub &'a [ChangeNotification]);

impl fmt::Display for NotificationList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, n) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{n}")?;
        }
        f.write_str("]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ing(name: &str) -> ObjectRef {
        ObjectRef::new(ObjectKind::Ingress, "default", name)
    }

    #[test]
    fn notification_display() {
        assert_eq!(ChangeNotification::update(ing("foo")).to_string(), "ing/default/foo");
        assert_eq!(ChangeNotification::delete(ing("foo")).to_string(), "del:ing/default/foo");
    }

    #[test]
    fn later_hint_replaces_earlier() {
        let mut hints = ChangeHints::default();
        hints.apply(ChangeHint::TcpServicesConfigMap(
            [("80".to_string(), "a/b:80".to_string())].into(),
        ));
        hints.apply(ChangeHint::TcpServicesConfigMap(BTreeMap::new()));
        assert_eq!(hints.tcp_config_map_data_new, Some(BTreeMap::new()));
        assert!(hints.global_config_map_data_new.is_none());
    }

    #[test]
    fn changed_refs_collapses_duplicates() {
        let set = ChangeSet {
            objects: vec![
                ChangeNotification::update(ing("b")),
                ChangeNotification::add(ing("a")),
                ChangeNotification::update(ing("b")),
                ChangeNotification::add(ing("a").with_kind(ObjectKind::Service)),
            ],
            ..Default::default()
        };
        assert_eq!(set.changed_refs(ObjectKind::Ingress), vec![ing("a"), ing("b")]);
        assert!(set.touches(ObjectKind::Service));
        assert!(!set.touches(ObjectKind::Gateway));
        assert_eq!(set.len(), 4);
    }

    #[test]
    fn notification_list_formats_in_order() {
        let list = vec![
            ChangeNotification::add(ing("a")),
            ChangeNotification::delete(ing("b")),
        ];
        assert_eq!(
            NotificationList(&list).to_string(),
            "[ing/default/a, del:ing/default/b]"
        );
    }
}
