//! The sync orchestrator: one reconciliation pass from change set to target.
//!
//! A pass is
//!
//! 1. swap the accumulated [`ChangeSet`] out of the cache
//! 2. construct the eager stages and collect their full-sync votes
//! 3. wipe the target once if any vote (or the sticky flag) asks for it
//! 4. log the pass volume
//! 5. run every stage whose gate is open, in table order, ticking the timer
//!
//! The target mutex is held for the whole pass, so passes never overlap and
//! readers using [`Orchestrator::with_target`] only see completed passes.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use lbsync_core::{ChangeSet, ControllerConfig, NotificationList};

use crate::cache::ClusterCache;
use crate::converter::{Converter, PassContext};
use crate::error::SyncError;
use crate::proxy::{ConfigTarget, ProxyConfig};
use crate::stage::{Construction, Stage};
use crate::timer::StageTimer;

/// Log target of the per-pass volume line.
pub const LOG_TARGET: &str = "lbsync::sync";

/// Outcome of one successful pass.
#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub full_sync: bool,
    pub notifications: usize,
    /// Stages that ran, in order.
    pub stages: Vec<&'static str>,
    pub finished_at: DateTime<Utc>,
}

/// The volume line for a pass, or `None` when there is nothing to report.
///
/// Up to `max_listed` notifications are listed individually; above that
/// only the count is logged.
pub fn volume_summary(changes: &ChangeSet, max_listed: usize) -> Option<String> {
    match changes.objects.len() {
        0 => None,
        1 => Some(format!(
            "applying 1 change notification: {}",
            NotificationList(&changes.objects)
        )),
        n if n <= max_listed => Some(format!(
            "applying {n} change notifications: {}",
            NotificationList(&changes.objects)
        )),
        n => Some(format!("applying {n} change notifications")),
    }
}

/// Forces the next pass to rebuild unless the current one completes.
struct PassGuard<'a> {
    cache: &'a ClusterCache,
    completed: bool,
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        if !self.completed {
            tracing::warn!("sync pass did not complete; next pass rebuilds from scratch");
            self.cache.resync_required();
        }
    }
}

pub struct Orchestrator<T: ConfigTarget = ProxyConfig> {
    cache: Arc<ClusterCache>,
    options: Arc<ControllerConfig>,
    stages: Vec<Stage<T>>,
    target: Mutex<T>,
}

impl Orchestrator<ProxyConfig> {
    /// Orchestrator over a fresh [`ProxyConfig`] with the default stage table.
    pub fn new(cache: Arc<ClusterCache>, options: Arc<ControllerConfig>) -> Self {
        Self::with_stages(cache, options, Stage::defaults(), ProxyConfig::default())
    }
}

impl<T: ConfigTarget> Orchestrator<T> {
    pub fn with_stages(
        cache: Arc<ClusterCache>,
        options: Arc<ControllerConfig>,
        stages: Vec<Stage<T>>,
        target: T,
    ) -> Self {
        Self {
            cache,
            options,
            stages,
            target: Mutex::new(target),
        }
    }

    pub fn cache(&self) -> &Arc<ClusterCache> {
        &self.cache
    }

    pub fn options(&self) -> &ControllerConfig {
        &self.options
    }

    fn lock_target(&self) -> MutexGuard<'_, T> {
        // A poisoned pass already marked the next one as a full sync.
        self.target.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run exactly one reconciliation pass.
    ///
    /// Blocks while another pass holds the target. On error the target may be
    /// partially patched; the cache is flagged so the next pass wipes it.
    pub fn sync(&self, timer: &mut StageTimer) -> Result<PassReport, SyncError> {
        let mut target = self.lock_target();
        let mut guard = PassGuard {
            cache: &self.cache,
            completed: false,
        };

        let changes = self.cache.swap_changed_objects();
        let store = self.cache.snapshot();
        let ctx = PassContext {
            options: &self.options,
            store: &store,
            changes: &changes,
        };

        let mut eager: Vec<_> = self
            .stages
            .iter()
            .map(|stage| match stage.construction {
                Construction::Eager => Some((stage.factory)(ctx)),
                Construction::Lazy => None,
            })
            .collect();

        let votes = eager
            .iter()
            .flatten()
            .fold(false, |acc, conv| conv.need_full_sync(&target) | acc);
        let full_sync = changes.need_full_sync || votes;

        if full_sync {
            target.clear();
        }

        if let Some(line) = volume_summary(&changes, self.options.logging.max_listed_notifications) {
            tracing::debug!(target: LOG_TARGET, "{line}");
        }

        let mut ran = Vec::with_capacity(self.stages.len());
        for (stage, constructed) in self.stages.iter().zip(eager.iter_mut()) {
            if !stage.gate.is_open(&ctx, full_sync) {
                continue;
            }
            let mut conv = match constructed.take() {
                Some(conv) => conv,
                None => (stage.factory)(ctx),
            };
            conv.sync(&mut target, full_sync)?;
            timer.tick(stage.name);
            ran.push(stage.name);
        }

        guard.completed = true;
        Ok(PassReport {
            full_sync,
            notifications: changes.len(),
            stages: ran,
            finished_at: Utc::now(),
        })
    }

    /// Observe the target between passes.
    pub fn with_target<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.lock_target())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::sync::Once;

    use lbsync_core::{ChangeHint, ChangeNotification, ObjectKind, ObjectRef};
    use rstest::rstest;

    use super::*;
    use crate::error::convert_err;

    thread_local! {
        static JOURNAL: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
        static VOTE: RefCell<Option<&'static str>> = const { RefCell::new(None) };
        static FAIL: RefCell<Option<&'static str>> = const { RefCell::new(None) };
    }

    fn journal(entry: String) {
        JOURNAL.with(|j| j.borrow_mut().push(entry));
    }

    fn take_journal() -> Vec<String> {
        JOURNAL.with(|j| std::mem::take(&mut *j.borrow_mut()))
    }

    #[derive(Debug, Default)]
    struct RecordingTarget {
        clears: usize,
    }

    impl ConfigTarget for RecordingTarget {
        fn clear(&mut self) {
            self.clears += 1;
            journal("clear".to_string());
        }
    }

    struct RecordingConverter {
        name: &'static str,
    }

    impl Converter<RecordingTarget> for RecordingConverter {
        fn need_full_sync(&self, _target: &RecordingTarget) -> bool {
            journal(format!("vote:{}", self.name));
            VOTE.with(|v| *v.borrow() == Some(self.name))
        }

        fn sync(&mut self, _target: &mut RecordingTarget, full_sync: bool) -> Result<(), SyncError> {
            journal(format!("sync:{}:{full_sync}", self.name));
            if FAIL.with(|f| *f.borrow() == Some(self.name)) {
                return Err(convert_err(self.name, "boom"));
            }
            Ok(())
        }
    }

    fn route<'a>(_: PassContext<'a>) -> Box<dyn Converter<RecordingTarget> + 'a> {
        journal("new:route".to_string());
        Box::new(RecordingConverter { name: "route" })
    }

    fn ingress<'a>(_: PassContext<'a>) -> Box<dyn Converter<RecordingTarget> + 'a> {
        journal("new:ingress".to_string());
        Box::new(RecordingConverter { name: "ingress" })
    }

    fn tcp<'a>(_: PassContext<'a>) -> Box<dyn Converter<RecordingTarget> + 'a> {
        journal("new:tcp".to_string());
        Box::new(RecordingConverter { name: "tcp" })
    }

    fn recording_stages() -> Vec<Stage<RecordingTarget>> {
        use crate::stage::Gate;
        vec![
            Stage {
                name: "route",
                construction: Construction::Eager,
                gate: Gate::GatewayEnabled,
                factory: route,
            },
            Stage {
                name: "ingress",
                construction: Construction::Eager,
                gate: Gate::Always,
                factory: ingress,
            },
            Stage {
                name: "tcp",
                construction: Construction::Lazy,
                gate: Gate::FullSyncOrTcpServicesHint,
                factory: tcp,
            },
        ]
    }

    /// Journals records logged under [`LOG_TARGET`] on the calling thread.
    struct JournalLogger;

    impl tracing::Log for JournalLogger {
        fn enabled(&self, metadata: &tracing::Metadata<'_>) -> bool {
            metadata.target() == LOG_TARGET
        }

        fn log(&self, record: &tracing::Record<'_>) {
            if self.enabled(record.metadata()) {
                journal(format!("log:{}:{}:{}", record.target(), record.level(), record.args()));
            }
        }

        fn flush(&self) {}
    }

    static LOGGER: JournalLogger = JournalLogger;
    static INSTALL_LOGGER: Once = Once::new();

    fn orchestrator(has_gateway: bool) -> Orchestrator<RecordingTarget> {
        INSTALL_LOGGER.call_once(|| {
            if tracing::set_logger(&LOGGER).is_ok() {
                tracing::set_max_level(tracing::LevelFilter::Debug);
            }
        });
        take_journal();
        VOTE.with(|v| *v.borrow_mut() = None);
        FAIL.with(|f| *f.borrow_mut() = None);
        let options = ControllerConfig {
            has_gateway,
            tcp_services_config_map: Some("lb/tcp".parse().expect("ref")),
            ..Default::default()
        };
        let cache = Arc::new(ClusterCache::new(&options));
        Orchestrator::with_stages(cache, Arc::new(options), recording_stages(), RecordingTarget::default())
    }

    fn ing(name: &str) -> ChangeNotification {
        ChangeNotification::update(ObjectRef::new(ObjectKind::Ingress, "default", name))
    }

    #[test]
    fn first_pass_wipes_before_any_stage() {
        let orch = orchestrator(true);
        let mut timer = StageTimer::new();
        let report = orch.sync(&mut timer).expect("pass");

        assert!(report.full_sync);
        assert_eq!(
            take_journal(),
            [
                "new:route", "new:ingress", "vote:route", "vote:ingress", "clear",
                "sync:route:true", "sync:ingress:true", "new:tcp", "sync:tcp:true",
            ]
        );
        assert_eq!(orch.with_target(|t| t.clears), 1);
        assert_eq!(timer.stages(), ["route", "ingress", "tcp"]);
        assert_eq!(report.stages, ["route", "ingress", "tcp"]);
    }

    #[test]
    fn incremental_pass_skips_wipe_and_lazy_stage() {
        let orch = orchestrator(true);
        orch.sync(&mut StageTimer::new()).expect("first pass");
        take_journal();

        orch.cache().accumulator().record(ing("foo"));
        let mut timer = StageTimer::new();
        let report = orch.sync(&mut timer).expect("pass");

        assert!(!report.full_sync);
        assert_eq!(report.notifications, 1);
        let journal = take_journal();
        assert!(!journal.contains(&"clear".to_string()));
        assert!(!journal.iter().any(|e| e.ends_with(":tcp")));
        assert_eq!(timer.stages(), ["route", "ingress"]);
    }

    #[test]
    fn any_vote_forces_full_sync_and_all_votes_are_taken() {
        let orch = orchestrator(true);
        orch.sync(&mut StageTimer::new()).expect("first pass");
        take_journal();

        VOTE.with(|v| *v.borrow_mut() = Some("route"));
        orch.cache().accumulator().record(ing("foo"));
        let report = orch.sync(&mut StageTimer::new()).expect("pass");

        assert!(report.full_sync);
        let journal = take_journal();
        assert!(journal.contains(&"vote:ingress".to_string()));
        let clear = journal.iter().position(|e| e == "clear").expect("cleared");
        let first_sync = journal.iter().position(|e| e.starts_with("sync:")).expect("synced");
        assert!(clear < first_sync);
        assert_eq!(journal.iter().filter(|e| *e == "clear").count(), 1);
    }

    #[test]
    fn gateway_domain_disabled_skips_route_stage() {
        let orch = orchestrator(false);
        let mut timer = StageTimer::new();
        orch.sync(&mut timer).expect("pass");
        assert_eq!(timer.stages(), ["ingress", "tcp"]);
        assert!(!take_journal().contains(&"sync:route:true".to_string()));
    }

    #[test]
    fn tcp_hint_runs_lazy_stage_incrementally() {
        let orch = orchestrator(false);
        orch.sync(&mut StageTimer::new()).expect("first pass");
        take_journal();

        orch.cache().accumulator().record_with_hint(
            ChangeNotification::update(ObjectRef::new(ObjectKind::ConfigMap, "lb", "tcp")),
            ChangeHint::TcpServicesConfigMap(BTreeMap::new()),
        );
        let mut timer = StageTimer::new();
        let report = orch.sync(&mut timer).expect("pass");
        assert!(!report.full_sync);
        assert_eq!(timer.stages(), ["ingress", "tcp"]);
        assert!(take_journal().contains(&"sync:tcp:false".to_string()));
    }

    #[test]
    fn converters_are_fresh_every_pass() {
        let orch = orchestrator(true);
        orch.sync(&mut StageTimer::new()).expect("first");
        orch.sync(&mut StageTimer::new()).expect("second");
        let journal = take_journal();
        assert_eq!(journal.iter().filter(|e| *e == "new:route").count(), 2);
        assert_eq!(journal.iter().filter(|e| *e == "new:ingress").count(), 2);
    }

    #[test]
    fn failed_stage_forces_next_full_sync() {
        let orch = orchestrator(true);
        orch.sync(&mut StageTimer::new()).expect("first pass");

        FAIL.with(|f| *f.borrow_mut() = Some("ingress"));
        orch.cache().accumulator().record(ing("foo"));
        let mut timer = StageTimer::new();
        assert!(orch.sync(&mut timer).is_err());
        assert_eq!(timer.stages(), ["route"], "failed stage records no tick");
        assert!(orch.cache().accumulator().full_sync_pending());

        FAIL.with(|f| *f.borrow_mut() = None);
        let report = orch.sync(&mut StageTimer::new()).expect("recovery pass");
        assert!(report.full_sync);
    }

    fn logged(journal: &[String]) -> Vec<&String> {
        journal.iter().filter(|e| e.starts_with("log:")).collect()
    }

    #[test]
    fn volume_line_is_logged_once_between_wipe_and_stages() {
        let orch = orchestrator(true);
        orch.sync(&mut StageTimer::new()).expect("first pass");
        assert!(logged(&take_journal()).is_empty(), "empty pass logs nothing");

        orch.cache().accumulator().mark_full_sync_required();
        orch.cache().accumulator().record(ing("foo"));
        orch.cache().accumulator().record(ing("bar"));
        orch.sync(&mut StageTimer::new()).expect("pass");

        let journal = take_journal();
        assert_eq!(
            logged(&journal),
            ["log:lbsync::sync:DEBUG:applying 2 change notifications: [ing/default/foo, ing/default/bar]"]
        );
        let line = journal.iter().position(|e| e.starts_with("log:")).expect("logged");
        let clear = journal.iter().position(|e| e == "clear").expect("cleared");
        let first_sync = journal.iter().position(|e| e.starts_with("sync:")).expect("synced");
        assert!(clear < line && line < first_sync, "{journal:?}");
    }

    #[test]
    fn busy_pass_logs_only_the_count() {
        let orch = orchestrator(false);
        orch.sync(&mut StageTimer::new()).expect("first pass");
        take_journal();

        for i in 0..150 {
            orch.cache().accumulator().record(ing(&format!("foo{i}")));
        }
        orch.sync(&mut StageTimer::new()).expect("pass");
        assert_eq!(
            logged(&take_journal()),
            ["log:lbsync::sync:DEBUG:applying 150 change notifications"]
        );
    }

    #[rstest]
    #[case(0, None)]
    #[case(1, Some("applying 1 change notification: [ing/default/foo0]"))]
    fn volume_summary_small(#[case] n: usize, #[case] expected: Option<&str>) {
        let changes = ChangeSet {
            objects: (0..n).map(|i| ing(&format!("foo{i}"))).collect(),
            ..Default::default()
        };
        assert_eq!(volume_summary(&changes, 100).as_deref(), expected);
    }

    #[rstest]
    #[case(5, 100, true)]
    #[case(100, 100, true)]
    #[case(150, 100, false)]
    #[case(3, 2, false)]
    fn volume_summary_tiers(#[case] n: usize, #[case] max: usize, #[case] listed: bool) {
        let changes = ChangeSet {
            objects: (0..n).map(|i| ing(&format!("foo{i}"))).collect(),
            ..Default::default()
        };
        let line = volume_summary(&changes, max).expect("line");
        assert!(line.contains(&format!("{n} change notifications")));
        for i in 0..n {
            let item = format!("ing/default/foo{i}");
            let present = line.contains(&format!("{item},")) || line.contains(&format!("{item}]"));
            assert_eq!(present, listed, "{item}");
        }
    }

    #[test]
    fn single_notification_is_listed_literally() {
        let changes = ChangeSet {
            objects: vec![ing("foo")],
            ..Default::default()
        };
        let line = volume_summary(&changes, 100).expect("line");
        assert!(line.contains("1 change notification"));
        assert!(line.contains("ing/default/foo"));
    }
}
