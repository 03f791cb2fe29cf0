//! TCP services domain, fed by a configmap of `port -> entry` pairs.
//!
//! Entry format: `namespace/service:port[:in-proxy[:out-proxy[:secret]]]`
//!
//! - `in-proxy`: empty or `PROXY` (accept PROXY protocol from clients)
//! - `out-proxy`: empty, `PROXY`/`PROXY-V1` or `PROXY-V2` (send it upstream)
//! - `secret`: TLS secret, `name` or `namespace/name`; a bare name is looked
//!   up in the service's namespace
//!
//! The map is small and has no per-entry ownership, so every run rebuilds
//! `tcp_services` wholesale.

use std::collections::BTreeMap;
use std::str::FromStr;

use thiserror::Error;

use lbsync_core::{NamespacedName, ObjectKind, ObjectRef, ServiceRef};

use crate::converter::{Converter, PassContext};
use crate::error::SyncError;
use crate::proxy::{ProxyConfig, ProxyProtocolVersion, TcpService};

use super::backend;

/// Stage key recorded by the timer.
pub const STAGE: &str = "parse_tcp_svc";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TcpEntryError {
    #[error("invalid service reference '{0}'")]
    Service(String),
    #[error("invalid inbound proxy protocol '{0}'")]
    ProxyIn(String),
    #[error("invalid outbound proxy protocol '{0}'")]
    ProxyOut(String),
    #[error("invalid secret reference '{0}'")]
    Secret(String),
    #[error("too many fields")]
    TooManyFields,
}

/// One parsed value of the TCP services configmap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpServiceEntry {
    pub service: ServiceRef,
    pub proxy_protocol_in: bool,
    pub proxy_protocol_out: Option<ProxyProtocolVersion>,
    pub secret: Option<NamespacedName>,
}

impl FromStr for TcpServiceEntry {
    type Err = TcpEntryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.trim().split(':');
        let name = fields.next().unwrap_or_default();
        let port = fields.next().unwrap_or_default();
        let service: ServiceRef = format!("{name}:{port}")
            .parse()
            .map_err(|_| TcpEntryError::Service(format!("{name}:{port}")))?;

        let proxy_protocol_in = match fields.next().unwrap_or_default() {
            "" => false,
            "PROXY" => true,
            other => return Err(TcpEntryError::ProxyIn(other.to_string())),
        };
        let proxy_protocol_out = match fields.next().unwrap_or_default() {
            "" => None,
            "PROXY" | "PROXY-V1" => Some(ProxyProtocolVersion::V1),
            "PROXY-V2" => Some(ProxyProtocolVersion::V2),
            other => return Err(TcpEntryError::ProxyOut(other.to_string())),
        };
        let secret = match fields.next().unwrap_or_default() {
            "" => None,
            raw if raw.contains('/') => Some(
                raw.parse()
                    .map_err(|_| TcpEntryError::Secret(raw.to_string()))?,
            ),
            raw => Some(NamespacedName::new(service.namespace.clone(), raw)),
        };
        if fields.next().is_some() {
            return Err(TcpEntryError::TooManyFields);
        }

        Ok(Self {
            service,
            proxy_protocol_in,
            proxy_protocol_out,
            secret,
        })
    }
}

pub struct TcpServicesConverter<'a> {
    ctx: PassContext<'a>,
}

impl<'a> TcpServicesConverter<'a> {
    pub fn new(ctx: PassContext<'a>) -> Self {
        Self { ctx }
    }

    /// The hint wins; without one the configured configmap is read from the store.
    fn data(&self) -> BTreeMap<String, String> {
        if let Some(data) = &self.ctx.changes.hints.tcp_config_map_data_new {
            return data.clone();
        }
        self.ctx
            .options
            .tcp_services_config_map
            .as_ref()
            .and_then(|cm| self.ctx.store.config_map(&cm.namespace, &cm.name))
            .map(|cm| cm.data.clone())
            .unwrap_or_default()
    }

    fn tls_secret(&self, entry: &TcpServiceEntry) -> Option<ObjectRef> {
        let name = entry.secret.as_ref()?;
        match self.ctx.store.secret(&name.namespace, &name.name) {
            Some(secret) if secret.is_tls() => Some(ObjectRef::from_name(ObjectKind::Secret, name)),
            Some(_) => {
                tracing::warn!("tcp service {}: secret '{name}' is not a TLS secret", entry.service);
                None
            }
            None => {
                tracing::warn!("tcp service {}: secret '{name}' not found", entry.service);
                None
            }
        }
    }
}

impl Converter<ProxyConfig> for TcpServicesConverter<'_> {
    fn need_full_sync(&self, _target: &ProxyConfig) -> bool {
        false
    }

    fn sync(&mut self, target: &mut ProxyConfig, _full_sync: bool) -> Result<(), SyncError> {
        target.tcp_services.clear();
        for (key, value) in self.data() {
            let port = match key.trim().parse::<u16>() {
                Ok(port) if port != 0 => port,
                _ => {
                    tracing::warn!("tcp services: invalid port '{key}', skipping");
                    continue;
                }
            };
            let entry: TcpServiceEntry = match value.parse() {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("tcp services: port {port}: {e}, skipping");
                    continue;
                }
            };
            let svc = &entry.service;
            let Some(backend) = backend::acquire(target, self.ctx.store, &svc.namespace, &svc.name, svc.port)
            else {
                tracing::warn!("tcp services: port {port}: backend '{svc}' does not resolve, skipping");
                continue;
            };
            let tls_secret = self.tls_secret(&entry);
            target.tcp_services.insert(
                port,
                TcpService {
                    backend,
                    proxy_protocol_in: entry.proxy_protocol_in,
                    proxy_protocol_out: entry.proxy_protocol_out,
                    tls_secret,
                },
            );
        }
        target.prune_backends();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use lbsync_core::manifest::parse_manifests;
    use lbsync_core::{ChangeSet, ControllerConfig};
    use rstest::rstest;

    use super::*;
    use crate::cache::ResourceStore;
    use crate::proxy::BackendId;

    #[rstest]
    #[case("db/postgres:5432", "db", "postgres", 5432, false, None, None)]
    #[case("redis:6379:PROXY", "default", "redis", 6379, true, None, None)]
    #[case("db/pg:5432::PROXY-V2", "db", "pg", 5432, false, Some(ProxyProtocolVersion::V2), None)]
    #[case("db/pg:5432:PROXY:PROXY:pg-tls", "db", "pg", 5432, true, Some(ProxyProtocolVersion::V1), Some("db/pg-tls"))]
    #[case("db/pg:5432:::certs/pg-tls", "db", "pg", 5432, false, None, Some("certs/pg-tls"))]
    fn parses_entries(
        #[case] input: &str,
        #[case] ns: &str,
        #[case] name: &str,
        #[case] port: u16,
        #[case] proxy_in: bool,
        #[case] proxy_out: Option<ProxyProtocolVersion>,
        #[case] secret: Option<&str>,
    ) {
        let entry: TcpServiceEntry = input.parse().expect("valid entry");
        assert_eq!(entry.service, ServiceRef::new(ns, name, port));
        assert_eq!(entry.proxy_protocol_in, proxy_in);
        assert_eq!(entry.proxy_protocol_out, proxy_out);
        assert_eq!(entry.secret.map(|s| s.to_string()).as_deref(), secret);
    }

    #[rstest]
    #[case("db/postgres", TcpEntryError::Service("db/postgres:".to_string()))]
    #[case("db/postgres:notaport", TcpEntryError::Service("db/postgres:notaport".to_string()))]
    #[case("db/pg:5432:YES", TcpEntryError::ProxyIn("YES".to_string()))]
    #[case("db/pg:5432::PROXY-V3", TcpEntryError::ProxyOut("PROXY-V3".to_string()))]
    #[case("db/pg:5432:::a/b/c", TcpEntryError::Secret("a/b/c".to_string()))]
    #[case("db/pg:5432::::extra", TcpEntryError::TooManyFields)]
    fn rejects_invalid_entries(#[case] input: &str, #[case] expected: TcpEntryError) {
        assert_eq!(input.parse::<TcpServiceEntry>(), Err(expected));
    }

    const FIXTURE: &str = r#"
- kind: Service
  metadata: { namespace: db, name: pg }
  ports: [{ port: 5432 }]
- kind: Endpoints
  metadata: { namespace: db, name: pg }
  addresses: [10.2.0.1]
  ports: [{ port: 5432 }]
- kind: Secret
  metadata: { namespace: db, name: pg-tls }
  data: { tls.crt: crt, tls.key: key }
- kind: ConfigMap
  metadata: { namespace: lb, name: tcp }
  data:
    "5432": "db/pg:5432::PROXY-V2:pg-tls"
    "6379": "db/redis:6379"
    "abc": "db/pg:5432"
"#;

    fn store() -> ResourceStore {
        let mut store = ResourceStore::default();
        for m in parse_manifests(FIXTURE).expect("fixture") {
            store.upsert(m);
        }
        store
    }

    fn options() -> ControllerConfig {
        ControllerConfig {
            tcp_services_config_map: Some(NamespacedName::new("lb", "tcp")),
            ..Default::default()
        }
    }

    #[test]
    fn full_sync_reads_configured_config_map() {
        let store = store();
        let options = options();
        let changes = ChangeSet::default();
        let ctx = PassContext { options: &options, store: &store, changes: &changes };
        let mut target = ProxyConfig::default();
        TcpServicesConverter::new(ctx).sync(&mut target, true).expect("sync");

        assert_eq!(target.tcp_services.len(), 1, "unresolved and malformed entries are skipped");
        let svc = &target.tcp_services[&5432];
        assert_eq!(svc.backend, BackendId::new("db", "pg", 5432));
        assert_eq!(svc.proxy_protocol_out, Some(ProxyProtocolVersion::V2));
        assert_eq!(
            svc.tls_secret,
            Some(ObjectRef::new(ObjectKind::Secret, "db", "pg-tls"))
        );
        assert_eq!(target.backends[&svc.backend].endpoints, ["10.2.0.1:5432"]);
    }

    #[test]
    fn hint_replaces_previous_services() {
        let store = store();
        let options = options();
        let none = ChangeSet::default();
        let mut target = ProxyConfig::default();
        let ctx = PassContext { options: &options, store: &store, changes: &none };
        TcpServicesConverter::new(ctx).sync(&mut target, true).expect("full");

        let mut changes = ChangeSet::default();
        changes.hints.tcp_config_map_data_new =
            Some(BTreeMap::from([("15432".to_string(), "db/pg:5432".to_string())]));
        let ctx = PassContext { options: &options, store: &store, changes: &changes };
        let mut conv = TcpServicesConverter::new(ctx);
        assert!(!conv.need_full_sync(&target));
        conv.sync(&mut target, false).expect("incremental");

        let ports: Vec<u16> = target.tcp_services.keys().copied().collect();
        assert_eq!(ports, [15432]);
        assert!(target.tcp_services[&15432].tls_secret.is_none());
    }

    #[test]
    fn deleted_config_map_clears_services_and_backends() {
        let store = store();
        let options = options();
        let none = ChangeSet::default();
        let mut target = ProxyConfig::default();
        let ctx = PassContext { options: &options, store: &store, changes: &none };
        TcpServicesConverter::new(ctx).sync(&mut target, true).expect("full");
        assert!(!target.backends.is_empty());

        let mut changes = ChangeSet::default();
        changes.hints.tcp_config_map_data_new = Some(BTreeMap::new());
        let ctx = PassContext { options: &options, store: &store, changes: &changes };
        TcpServicesConverter::new(ctx).sync(&mut target, false).expect("incremental");
        assert!(target.is_empty());
    }
}
