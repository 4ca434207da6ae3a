use std::collections::{BTreeSet, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use deploy_core::ServiceName;
use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::builder::{ServiceBuilder, ServiceTarget};
use crate::error::{ContainerError, Result};
use crate::service::{Service, ServiceValue, StartContext, StartError, StopContext};
use crate::state::{Mode, ServiceState};

struct Entry {
    service: Arc<dyn Service>,
    dependencies: Vec<ServiceName>,
    parent: Option<ServiceName>,
    children: BTreeSet<ServiceName>,
    mode: Mode,
    removing: bool,
    /// Switch back to `Active` once down
    reactivate: bool,
    state: ServiceState,
    failure: Option<StartError>,
    value: Option<ServiceValue>,
}

/// Point-in-time view of one installed service.
#[derive(Debug, Clone)]
pub struct ServiceSnapshot {
    pub name: ServiceName,
    pub state: ServiceState,
    pub mode: Mode,
    pub failure: Option<StartError>,
    /// Dependencies that are not installed at all
    pub missing_dependencies: Vec<ServiceName>,
    /// Installed dependencies that are not up
    pub unavailable_dependencies: Vec<ServiceName>,
}

enum Task {
    Start {
        name: ServiceName,
        service: Arc<dyn Service>,
        values: HashMap<ServiceName, ServiceValue>,
    },
    Stop {
        name: ServiceName,
        service: Arc<dyn Service>,
    },
}

#[derive(Default)]
struct Registry {
    entries: HashMap<ServiceName, Entry>,
    /// Start and stop callbacks currently running
    in_flight: usize,
    shut_down: bool,
}

impl Registry {
    fn is_running(&self, name: &ServiceName) -> bool {
        self.entries
            .get(name)
            .is_some_and(|e| matches!(e.state, ServiceState::Up | ServiceState::Starting))
    }

    fn is_up(&self, name: &ServiceName) -> bool {
        self.entries
            .get(name)
            .is_some_and(|e| e.state == ServiceState::Up)
    }

    /// Services that must not be (or stay) up: mode `Never`, being removed,
    /// parent not running, a dependency unavailable, or transitively any of
    /// these through a parent or dependency.
    fn doomed(&self) -> HashSet<ServiceName> {
        let mut doomed: HashSet<ServiceName> = self
            .entries
            .iter()
            .filter(|(_, e)| {
                e.mode == Mode::Never
                    || e.removing
                    || e.parent.as_ref().is_some_and(|p| !self.is_running(p))
                    || e.dependencies.iter().any(|d| !self.is_up(d))
            })
            .map(|(name, _)| name.clone())
            .collect();

        loop {
            let more: Vec<ServiceName> = self
                .entries
                .iter()
                .filter(|(name, e)| {
                    !doomed.contains(*name)
                        && (e.parent.as_ref().is_some_and(|p| doomed.contains(p))
                            || e.dependencies.iter().any(|d| doomed.contains(d)))
                })
                .map(|(name, _)| name.clone())
                .collect();
            if more.is_empty() {
                return doomed;
            }
            doomed.extend(more);
        }
    }

    /// True once nothing below `name` (children or dependents) is running.
    fn quiescent_below(&self, name: &ServiceName) -> bool {
        let Some(entry) = self.entries.get(name) else {
            return true;
        };
        entry.children.is_empty()
            && self
                .entries
                .values()
                .filter(|e| e.dependencies.contains(name))
                .all(|e| e.state.is_at_rest_down())
    }

    fn can_start(&self, name: &ServiceName) -> bool {
        let Some(entry) = self.entries.get(name) else {
            return false;
        };
        !self.shut_down
            && entry.mode == Mode::Active
            && !entry.removing
            && entry.parent.as_ref().map_or(true, |p| self.is_up(p))
            && entry.dependencies.iter().all(|d| self.is_up(d))
    }

    fn dependency_values(&self, name: &ServiceName) -> HashMap<ServiceName, ServiceValue> {
        let Some(entry) = self.entries.get(name) else {
            return HashMap::new();
        };
        entry
            .dependencies
            .iter()
            .filter_map(|d| {
                let value = self.entries.get(d)?.value.clone()?;
                Some((d.clone(), value))
            })
            .collect()
    }

    fn snapshot(&self, name: &ServiceName, entry: &Entry) -> ServiceSnapshot {
        let (missing, installed): (Vec<_>, Vec<_>) = entry
            .dependencies
            .iter()
            .cloned()
            .partition(|d| !self.entries.contains_key(d));
        ServiceSnapshot {
            name: name.clone(),
            state: entry.state,
            mode: entry.mode,
            failure: entry.failure.clone(),
            missing_dependencies: missing,
            unavailable_dependencies: installed.into_iter().filter(|d| !self.is_up(d)).collect(),
        }
    }

    /// Advance every service as far as the current graph allows and return
    /// the callbacks to spawn.
    fn reconcile(&mut self) -> Vec<Task> {
        let mut tasks = Vec::new();
        loop {
            let doomed = self.doomed();

            // Children of a parent that is leaving (or never reached) the up
            // state are removed for good.
            let orphaned: Vec<ServiceName> = self
                .entries
                .iter()
                .filter(|(_, e)| {
                    !e.removing
                        && e.parent
                            .as_ref()
                            .is_some_and(|p| doomed.contains(p) || !self.is_running(p))
                })
                .map(|(name, _)| name.clone())
                .collect();
            if !orphaned.is_empty() {
                for name in orphaned {
                    if let Some(entry) = self.entries.get_mut(&name) {
                        entry.removing = true;
                    }
                }
                continue;
            }

            let mut progressed = false;
            let names: Vec<ServiceName> = self.entries.keys().cloned().collect();
            for name in names {
                let Some(entry) = self.entries.get(&name) else {
                    continue;
                };
                match entry.state {
                    ServiceState::Up if doomed.contains(&name) => {
                        if self.quiescent_below(&name) {
                            let service = entry.service.clone();
                            if let Some(entry) = self.entries.get_mut(&name) {
                                entry.state = ServiceState::Stopping;
                            }
                            self.in_flight += 1;
                            debug!(service = %name, "Stopping service");
                            tasks.push(Task::Stop { name, service });
                            progressed = true;
                        }
                    }
                    ServiceState::Failed if doomed.contains(&name) => {
                        if let Some(entry) = self.entries.get_mut(&name) {
                            entry.state = ServiceState::Down;
                            entry.failure = None;
                        }
                        progressed = true;
                    }
                    ServiceState::Down if entry.removing && entry.children.is_empty() => {
                        let parent = entry.parent.clone();
                        self.entries.remove(&name);
                        if let Some(parent) = parent.and_then(|p| self.entries.get_mut(&p)) {
                            parent.children.remove(&name);
                        }
                        debug!(service = %name, "Service removed");
                        progressed = true;
                    }
                    ServiceState::Down if entry.reactivate && !entry.removing => {
                        if let Some(entry) = self.entries.get_mut(&name) {
                            entry.reactivate = false;
                            entry.mode = Mode::Active;
                        }
                        debug!(service = %name, "Reactivating service");
                        progressed = true;
                    }
                    ServiceState::Down if !doomed.contains(&name) && self.can_start(&name) => {
                        let service = entry.service.clone();
                        let values = self.dependency_values(&name);
                        if let Some(entry) = self.entries.get_mut(&name) {
                            entry.state = ServiceState::Starting;
                        }
                        self.in_flight += 1;
                        debug!(service = %name, "Starting service");
                        tasks.push(Task::Start {
                            name,
                            service,
                            values,
                        });
                        progressed = true;
                    }
                    _ => {}
                }
            }

            if !progressed {
                return tasks;
            }
        }
    }
}

struct Shared {
    registry: Mutex<Registry>,
    changed: Notify,
    runtime: Handle,
}

/// Dependency-driven service scheduler. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ServiceContainer {
    shared: Arc<Shared>,
}

impl ServiceContainer {
    /// Create a container whose callbacks run on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new() -> Self {
        Self::with_runtime(Handle::current())
    }

    pub fn with_runtime(runtime: Handle) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry::default()),
                changed: Notify::new(),
                runtime,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.shared
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Target installing top-level services.
    pub fn target(&self) -> ServiceTarget {
        ServiceTarget::root(self.clone())
    }

    pub fn add_service<S: Service>(&self, name: ServiceName, service: S) -> ServiceBuilder {
        self.target().add_service(name, service)
    }

    pub(crate) fn install(&self, builder: ServiceBuilder) -> Result<ServiceName> {
        let ServiceBuilder {
            name,
            service,
            dependencies,
            parent,
            mode,
            ..
        } = builder;

        if dependencies.contains(&name) {
            return Err(ContainerError::SelfDependency(name));
        }

        let tasks = {
            let mut registry = self.lock();
            if registry.shut_down {
                return Err(ContainerError::ShutDown);
            }
            if registry.entries.contains_key(&name) {
                return Err(ContainerError::DuplicateService(name));
            }
            if let Some(parent_name) = &parent {
                match registry.entries.get_mut(parent_name) {
                    Some(parent_entry) => {
                        parent_entry.children.insert(name.clone());
                    }
                    None => {
                        return Err(ContainerError::ParentNotFound {
                            service: name,
                            parent: parent_name.clone(),
                        })
                    }
                }
            }

            debug!(
                service = %name,
                dependencies = dependencies.len(),
                parent = ?parent,
                "Installing service"
            );
            registry.entries.insert(
                name.clone(),
                Entry {
                    service,
                    dependencies,
                    parent,
                    children: BTreeSet::new(),
                    mode,
                    removing: false,
                    reactivate: false,
                    state: ServiceState::Down,
                    failure: None,
                    value: None,
                },
            );
            registry.reconcile()
        };

        self.dispatch(tasks);
        Ok(name)
    }

    /// Change a service's mode. `Never` stops it (after its dependents and
    /// children); `Active` lets it start again.
    pub fn set_mode(&self, name: &ServiceName, mode: Mode) -> Result<()> {
        let tasks = {
            let mut registry = self.lock();
            let entry = registry
                .entries
                .get_mut(name)
                .ok_or_else(|| ContainerError::ServiceNotFound(name.clone()))?;
            if entry.mode == mode {
                return Ok(());
            }
            debug!(service = %name, mode = ?mode, "Changing service mode");
            entry.mode = mode;
            entry.reactivate = false;
            registry.reconcile()
        };
        self.dispatch(tasks);
        Ok(())
    }

    /// Force a full stop of `name` (dependents and children first) and start
    /// it again once it is down. Children are removed on the way down, so the
    /// service rebuilds them from scratch.
    pub fn restart(&self, name: &ServiceName) -> Result<()> {
        let tasks = {
            let mut registry = self.lock();
            let entry = registry
                .entries
                .get_mut(name)
                .ok_or_else(|| ContainerError::ServiceNotFound(name.clone()))?;
            debug!(service = %name, state = %entry.state, "Restarting service");
            entry.mode = Mode::Never;
            entry.reactivate = true;
            registry.reconcile()
        };
        self.dispatch(tasks);
        Ok(())
    }

    /// Stop (if needed) and uninstall a service together with its children.
    pub fn remove(&self, name: &ServiceName) -> Result<()> {
        let tasks = {
            let mut registry = self.lock();
            let entry = registry
                .entries
                .get_mut(name)
                .ok_or_else(|| ContainerError::ServiceNotFound(name.clone()))?;
            entry.removing = true;
            registry.reconcile()
        };
        self.dispatch(tasks);
        Ok(())
    }

    pub fn contains(&self, name: &ServiceName) -> bool {
        self.lock().entries.contains_key(name)
    }

    pub fn state(&self, name: &ServiceName) -> Option<ServiceState> {
        self.lock().entries.get(name).map(|e| e.state)
    }

    pub fn mode(&self, name: &ServiceName) -> Option<Mode> {
        self.lock().entries.get(name).map(|e| e.mode)
    }

    pub fn failure(&self, name: &ServiceName) -> Option<StartError> {
        self.lock().entries.get(name).and_then(|e| e.failure.clone())
    }

    pub fn value(&self, name: &ServiceName) -> Option<ServiceValue> {
        self.lock().entries.get(name).and_then(|e| e.value.clone())
    }

    pub fn snapshot(&self, name: &ServiceName) -> Option<ServiceSnapshot> {
        let registry = self.lock();
        registry
            .entries
            .get(name)
            .map(|entry| registry.snapshot(name, entry))
    }

    /// Snapshots of `prefix` and every service named below it, sorted by name.
    pub fn services_under(&self, prefix: &ServiceName) -> Vec<ServiceSnapshot> {
        let registry = self.lock();
        let mut snapshots: Vec<_> = registry
            .entries
            .iter()
            .filter(|(name, _)| prefix.contains(name))
            .map(|(name, entry)| registry.snapshot(name, entry))
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// True when no callback is running; with no callbacks running, no
    /// further transition can happen without an external change.
    pub fn is_stable(&self) -> bool {
        self.lock().in_flight == 0
    }

    pub async fn await_stability(&self) {
        self.await_condition(|registry| registry.in_flight == 0)
            .await
    }

    /// Wait until `predicate` holds for the state of `name` (`None` when the
    /// service is not installed).
    pub async fn await_state<F>(&self, name: &ServiceName, predicate: F)
    where
        F: Fn(Option<ServiceState>) -> bool,
    {
        self.await_condition(|registry| predicate(registry.entries.get(name).map(|e| e.state)))
            .await
    }

    async fn await_condition<F>(&self, condition: F)
    where
        F: Fn(&Registry) -> bool,
    {
        loop {
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let done = {
                let registry = self.lock();
                condition(&registry)
            };
            if done {
                return;
            }
            notified.await;
        }
    }

    /// Remove every service and wait until all have stopped. Later installs
    /// are rejected.
    pub async fn shutdown(&self) {
        let tasks = {
            let mut registry = self.lock();
            registry.shut_down = true;
            for entry in registry.entries.values_mut() {
                entry.removing = true;
            }
            registry.reconcile()
        };
        self.dispatch(tasks);
        self.await_condition(|registry| registry.entries.is_empty() && registry.in_flight == 0)
            .await
    }

    fn dispatch(&self, tasks: Vec<Task>) {
        for task in tasks {
            let container = self.clone();
            match task {
                Task::Start {
                    name,
                    service,
                    values,
                } => {
                    let ctx = StartContext::new(name.clone(), self.clone(), values);
                    self.shared.runtime.spawn(async move {
                        let result = match AssertUnwindSafe(service.start(ctx)).catch_unwind().await
                        {
                            Ok(result) => result,
                            Err(panic) => Err(StartError::panicked(&name, panic.as_ref())),
                        };
                        container.start_finished(&name, result);
                    });
                }
                Task::Stop { name, service } => {
                    let ctx = StopContext::new(name.clone(), self.clone());
                    self.shared.runtime.spawn(async move {
                        if AssertUnwindSafe(service.stop(ctx)).catch_unwind().await.is_err() {
                            warn!(service = %name, "Stop callback panicked");
                        }
                        container.stop_finished(&name);
                    });
                }
            }
        }
        self.shared.changed.notify_waiters();
    }

    fn start_finished(&self, name: &ServiceName, result: std::result::Result<(), StartError>) {
        let tasks = {
            let mut registry = self.lock();
            registry.in_flight = registry.in_flight.saturating_sub(1);
            if let Some(entry) = registry.entries.get_mut(name) {
                match result {
                    Ok(()) => {
                        debug!(service = %name, "Service up");
                        entry.state = ServiceState::Up;
                        entry.failure = None;
                        entry.value = entry.service.value();
                    }
                    Err(error) => {
                        debug!(service = %name, error = %error, "Service failed to start");
                        entry.state = ServiceState::Failed;
                        entry.failure = Some(error);
                    }
                }
            }
            registry.reconcile()
        };
        self.dispatch(tasks);
    }

    fn stop_finished(&self, name: &ServiceName) {
        let tasks = {
            let mut registry = self.lock();
            registry.in_flight = registry.in_flight.saturating_sub(1);
            if let Some(entry) = registry.entries.get_mut(name) {
                debug!(service = %name, "Service down");
                entry.state = ServiceState::Down;
                entry.value = None;
            }
            registry.reconcile()
        };
        self.dispatch(tasks);
    }
}

impl std::fmt::Debug for ServiceContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.lock();
        f.debug_struct("ServiceContainer")
            .field("services", &registry.entries.len())
            .field("in_flight", &registry.in_flight)
            .field("shut_down", &registry.shut_down)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    type Log = Arc<StdMutex<Vec<String>>>;

    struct Recording {
        label: &'static str,
        log: Log,
        fail: bool,
    }

    impl Recording {
        fn new(label: &'static str, log: &Log) -> Self {
            Self {
                label,
                log: log.clone(),
                fail: false,
            }
        }

        fn failing(label: &'static str, log: &Log) -> Self {
            Self {
                fail: true,
                ..Self::new(label, log)
            }
        }
    }

    #[async_trait]
    impl Service for Recording {
        async fn start(&self, _ctx: StartContext) -> std::result::Result<(), StartError> {
            self.log.lock().unwrap().push(format!("start {}", self.label));
            if self.fail {
                return Err(StartError::new(format!("{} failed", self.label)));
            }
            Ok(())
        }

        async fn stop(&self, _ctx: StopContext) {
            self.log.lock().unwrap().push(format!("stop {}", self.label));
        }

        fn value(&self) -> Option<ServiceValue> {
            Some(Arc::new(self.label.to_string()))
        }
    }

    /// Installs a child during its own start.
    struct Spawner {
        log: Log,
    }

    #[async_trait]
    impl Service for Spawner {
        async fn start(&self, ctx: StartContext) -> std::result::Result<(), StartError> {
            self.log.lock().unwrap().push("start parent".to_string());
            ctx.child_target()
                .add_service(
                    ctx.name().append("child"),
                    Recording::new("child", &self.log),
                )
                .install()
                .map_err(StartError::from_error)?;
            Ok(())
        }

        async fn stop(&self, _ctx: StopContext) {
            self.log.lock().unwrap().push("stop parent".to_string());
        }
    }

    /// Reads its dependency's value.
    struct Reader {
        dependency: ServiceName,
        seen: Arc<StdMutex<Option<String>>>,
    }

    #[async_trait]
    impl Service for Reader {
        async fn start(&self, ctx: StartContext) -> std::result::Result<(), StartError> {
            let value = ctx.dependency_value_as::<String>(&self.dependency);
            *self.seen.lock().unwrap() = value.map(|v| v.as_ref().clone());
            Ok(())
        }
    }

    struct Panicking;

    #[async_trait]
    impl Service for Panicking {
        async fn start(&self, _ctx: StartContext) -> std::result::Result<(), StartError> {
            panic!("processor exploded");
        }
    }

    fn name(s: &str) -> ServiceName {
        ServiceName::of(["test", s])
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    async fn settle(container: &ServiceContainer) {
        tokio::time::timeout(Duration::from_secs(5), container.await_stability())
            .await
            .expect("container did not settle");
    }

    #[tokio::test]
    async fn test_dependency_starts_first() {
        let container = ServiceContainer::new();
        let log: Log = Default::default();

        container
            .add_service(name("b"), Recording::new("b", &log))
            .requires(name("a"))
            .install()
            .unwrap();
        settle(&container).await;
        assert_eq!(container.state(&name("b")), Some(ServiceState::Down));

        container
            .add_service(name("a"), Recording::new("a", &log))
            .install()
            .unwrap();
        settle(&container).await;

        assert_eq!(entries(&log), vec!["start a", "start b"]);
        assert_eq!(container.state(&name("b")), Some(ServiceState::Up));
    }

    #[tokio::test]
    async fn test_dependents_stop_first() {
        let container = ServiceContainer::new();
        let log: Log = Default::default();

        container
            .add_service(name("a"), Recording::new("a", &log))
            .install()
            .unwrap();
        container
            .add_service(name("b"), Recording::new("b", &log))
            .requires(name("a"))
            .install()
            .unwrap();
        container
            .add_service(name("c"), Recording::new("c", &log))
            .requires(name("b"))
            .install()
            .unwrap();
        settle(&container).await;

        container.set_mode(&name("a"), Mode::Never).unwrap();
        settle(&container).await;

        assert_eq!(
            entries(&log),
            vec!["start a", "start b", "start c", "stop c", "stop b", "stop a"]
        );
        assert_eq!(container.state(&name("c")), Some(ServiceState::Down));

        container.set_mode(&name("a"), Mode::Active).unwrap();
        settle(&container).await;
        assert_eq!(container.state(&name("c")), Some(ServiceState::Up));
    }

    #[tokio::test]
    async fn test_failure_blocks_dependents() {
        let container = ServiceContainer::new();
        let log: Log = Default::default();

        container
            .add_service(name("a"), Recording::failing("a", &log))
            .install()
            .unwrap();
        container
            .add_service(name("b"), Recording::new("b", &log))
            .requires(name("a"))
            .install()
            .unwrap();
        settle(&container).await;

        assert_eq!(container.state(&name("a")), Some(ServiceState::Failed));
        assert_eq!(container.failure(&name("a")).unwrap().message(), "a failed");
        assert_eq!(container.state(&name("b")), Some(ServiceState::Down));
        assert_eq!(entries(&log), vec!["start a"]);

        let snapshot = container.snapshot(&name("b")).unwrap();
        assert_eq!(snapshot.unavailable_dependencies, vec![name("a")]);
        assert!(snapshot.missing_dependencies.is_empty());
    }

    #[tokio::test]
    async fn test_children_removed_with_parent() {
        let container = ServiceContainer::new();
        let log: Log = Default::default();

        container
            .add_service(name("parent"), Spawner { log: log.clone() })
            .install()
            .unwrap();
        settle(&container).await;

        let child = name("parent").append("child");
        assert_eq!(container.state(&child), Some(ServiceState::Up));

        container.set_mode(&name("parent"), Mode::Never).unwrap();
        settle(&container).await;

        assert!(!container.contains(&child));
        assert_eq!(
            entries(&log),
            vec!["start parent", "start child", "stop child", "stop parent"]
        );
    }

    #[tokio::test]
    async fn test_dependency_values_are_visible() {
        let container = ServiceContainer::new();
        let log: Log = Default::default();
        let seen = Arc::new(StdMutex::new(None));

        container
            .add_service(name("a"), Recording::new("a", &log))
            .install()
            .unwrap();
        container
            .add_service(
                name("reader"),
                Reader {
                    dependency: name("a"),
                    seen: seen.clone(),
                },
            )
            .requires(name("a"))
            .install()
            .unwrap();
        settle(&container).await;

        assert_eq!(seen.lock().unwrap().as_deref(), Some("a"));
        let value = container.value(&name("a")).unwrap();
        assert_eq!(value.downcast_ref::<String>().map(String::as_str), Some("a"));
    }

    #[tokio::test]
    async fn test_remove_uninstalls() {
        let container = ServiceContainer::new();
        let log: Log = Default::default();

        container
            .add_service(name("a"), Recording::new("a", &log))
            .install()
            .unwrap();
        settle(&container).await;

        container.remove(&name("a")).unwrap();
        settle(&container).await;

        assert!(!container.contains(&name("a")));
        assert_eq!(entries(&log), vec!["start a", "stop a"]);
        assert!(matches!(
            container.remove(&name("a")),
            Err(ContainerError::ServiceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_and_invalid_installs() {
        let container = ServiceContainer::new();
        let log: Log = Default::default();

        container
            .add_service(name("a"), Recording::new("a", &log))
            .install()
            .unwrap();
        assert!(matches!(
            container
                .add_service(name("a"), Recording::new("a", &log))
                .install(),
            Err(ContainerError::DuplicateService(_))
        ));
        assert!(matches!(
            container
                .add_service(name("self"), Recording::new("self", &log))
                .requires(name("self"))
                .install(),
            Err(ContainerError::SelfDependency(_))
        ));
        assert!(matches!(
            ServiceTarget::child_of(container.clone(), name("missing"))
                .add_service(name("orphan"), Recording::new("orphan", &log))
                .install(),
            Err(ContainerError::ParentNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_panicking_start_fails_service() {
        let container = ServiceContainer::new();
        container
            .add_service(name("boom"), Panicking)
            .install()
            .unwrap();
        settle(&container).await;

        assert_eq!(container.state(&name("boom")), Some(ServiceState::Failed));
        assert!(container
            .failure(&name("boom"))
            .unwrap()
            .message()
            .contains("processor exploded"));
    }

    #[tokio::test]
    async fn test_failed_service_retries_after_mode_cycle() {
        let container = ServiceContainer::new();
        let log: Log = Default::default();

        container
            .add_service(name("a"), Recording::failing("a", &log))
            .install()
            .unwrap();
        settle(&container).await;

        container.set_mode(&name("a"), Mode::Never).unwrap();
        settle(&container).await;
        assert_eq!(container.state(&name("a")), Some(ServiceState::Down));
        assert!(container.failure(&name("a")).is_none());

        container.set_mode(&name("a"), Mode::Active).unwrap();
        settle(&container).await;
        assert_eq!(entries(&log), vec!["start a", "start a"]);
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let container = ServiceContainer::new();
        let log: Log = Default::default();

        container
            .add_service(name("a"), Recording::new("a", &log))
            .install()
            .unwrap();
        container
            .add_service(name("b"), Recording::new("b", &log))
            .requires(name("a"))
            .install()
            .unwrap();
        settle(&container).await;

        tokio::time::timeout(Duration::from_secs(5), container.shutdown())
            .await
            .unwrap();

        assert_eq!(
            entries(&log),
            vec!["start a", "start b", "stop b", "stop a"]
        );
        assert!(matches!(
            container
                .add_service(name("late"), Recording::new("late", &log))
                .install(),
            Err(ContainerError::ShutDown)
        ));
    }

    #[tokio::test]
    async fn test_await_state_observes_down() {
        let container = ServiceContainer::new();
        let log: Log = Default::default();

        container
            .add_service(name("a"), Recording::new("a", &log))
            .install()
            .unwrap();
        settle(&container).await;

        let waiter = {
            let container = container.clone();
            tokio::spawn(async move {
                container
                    .await_state(&name("a"), |state| state == Some(ServiceState::Down))
                    .await;
            })
        };
        container.set_mode(&name("a"), Mode::Never).unwrap();

        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_restart_rebuilds_children() {
        let container = ServiceContainer::new();
        let log: Log = Default::default();

        container
            .add_service(name("parent"), Spawner { log: log.clone() })
            .install()
            .unwrap();
        container
            .add_service(name("user"), Recording::new("user", &log))
            .requires(name("parent"))
            .install()
            .unwrap();
        settle(&container).await;

        container.restart(&name("parent")).unwrap();
        settle(&container).await;

        let log = entries(&log);
        let count = |entry: &str| log.iter().filter(|e| *e == entry).count();
        let position = |entry: &str| log.iter().position(|e| e == entry).unwrap();
        assert_eq!(count("start parent"), 2);
        assert_eq!(count("start child"), 2);
        assert_eq!(count("start user"), 2);
        assert!(position("stop user") < position("stop parent"));
        assert!(position("stop child") < position("stop parent"));
        assert!(log.last().is_some_and(|e| e.starts_with("start")));
        assert_eq!(container.mode(&name("parent")), Some(Mode::Active));
        assert_eq!(container.state(&name("user")), Some(ServiceState::Up));
    }

    #[tokio::test]
    async fn test_services_under_prefix() {
        let container = ServiceContainer::new();
        let log: Log = Default::default();

        container
            .add_service(name("x"), Recording::new("x", &log))
            .install()
            .unwrap();
        container
            .add_service(name("x").append("y"), Recording::new("y", &log))
            .install()
            .unwrap();
        container
            .add_service(name("z"), Recording::new("z", &log))
            .install()
            .unwrap();
        settle(&container).await;

        let names: Vec<_> = container
            .services_under(&name("x"))
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec![name("x"), name("x").append("y")]);
    }
}
