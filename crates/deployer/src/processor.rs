//! The processor contract and the context a processor sees while its phase
//! runs.
//!
//! A processor mutates attachments on the [`DeploymentUnit`] or on the
//! [`DeploymentPhaseContext`]. It may also ask for services that the *next*
//! phase has to wait for. When such a service publishes a value, the value
//! can be carried into an attachment before the next phase's chain starts
//! (see [`AttachableDependency`]).

use std::any::Any;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use container::{ServiceContainer, ServiceTarget, ServiceValue};
use deploy_core::{
    sub_unit_service_name, Attachable, AttachmentKey, Attachments, DeploymentUnit, ListKey, Phase,
    ServiceName,
};
use events::EventBus;
use thiserror::Error;
use tracing::debug;

use crate::error::{DeployerError, Result};
use crate::keys::{
    DISCOVERED_SUB_DEPLOYMENTS, NEXT_PHASE_ATTACHABLE_DEPS, NEXT_PHASE_DEPS, SUB_DEPLOYMENTS,
};
use crate::unit_service::SubDeploymentUnitService;

/// One step of a phase, owned by a subsystem.
///
/// `deploy` runs to completion without yielding. `undo` reverses what
/// `deploy` did; it must not fail, and a panic in it is logged and ignored.
pub trait DeploymentUnitProcessor: Send + Sync + 'static {
    fn deploy(
        &self,
        ctx: &DeploymentPhaseContext,
    ) -> std::result::Result<(), DeploymentUnitProcessingError>;

    fn undo(&self, _unit: &DeploymentUnit) {}

    /// Name used in diagnostics and to order processors of equal priority.
    fn name(&self) -> &'static str {
        short_type_name(std::any::type_name::<Self>())
    }
}

/// `a::b::Processor<c::D>` -> `Processor`
fn short_type_name(full: &'static str) -> &'static str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Failure reported by a processor.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct DeploymentUnitProcessingError {
    message: String,
    #[source]
    source: Option<Box<dyn Error + Send + Sync>>,
}

impl DeploymentUnitProcessingError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl Into<Box<dyn Error + Send + Sync>>,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub(crate) fn panicked(payload: &(dyn Any + Send)) -> Self {
        let detail = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Self::new(format!("processor panicked: {}", detail))
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Where a carried dependency value lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyScope {
    /// The next phase's context; gone once that phase finishes.
    Phase,
    /// The deployment unit; visible to every later phase.
    Unit,
}

type ApplyFn = dyn Fn(&Attachments, ServiceValue) -> bool + Send + Sync;

/// A next-phase dependency whose published value is written into an
/// attachment before the next phase's chain runs. Single-valued keys are
/// replaced; list keys are appended to.
#[derive(Clone)]
pub struct AttachableDependency {
    service: ServiceName,
    scope: DependencyScope,
    key_name: &'static str,
    apply: Arc<ApplyFn>,
}

impl AttachableDependency {
    pub fn value<T: Send + Sync + 'static>(
        service: ServiceName,
        key: &'static AttachmentKey<T>,
        scope: DependencyScope,
    ) -> Self {
        Self {
            service,
            scope,
            key_name: key.name(),
            apply: Arc::new(move |attachments, value| match value.downcast::<T>() {
                Ok(value) => {
                    attachments.put_arc(key, value);
                    true
                }
                Err(_) => false,
            }),
        }
    }

    pub fn list<T: Clone + Send + Sync + 'static>(
        service: ServiceName,
        key: &'static ListKey<T>,
        scope: DependencyScope,
    ) -> Self {
        Self {
            service,
            scope,
            key_name: key.name(),
            apply: Arc::new(move |attachments, value| match value.downcast_ref::<T>() {
                Some(value) => {
                    attachments.add_to_list(key, value.clone());
                    true
                }
                None => false,
            }),
        }
    }

    pub fn service(&self) -> &ServiceName {
        &self.service
    }

    pub fn scope(&self) -> DependencyScope {
        self.scope
    }

    pub fn key_name(&self) -> &'static str {
        self.key_name
    }

    /// Write `value` into `target`. False when the value has the wrong type.
    pub(crate) fn apply(&self, target: &Attachments, value: ServiceValue) -> bool {
        (self.apply)(target, value)
    }
}

impl fmt::Debug for AttachableDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachableDependency")
            .field("service", &self.service)
            .field("scope", &self.scope)
            .field("key", &self.key_name)
            .finish()
    }
}

/// Everything a processor can reach while one phase of one unit runs.
pub struct DeploymentPhaseContext {
    unit: DeploymentUnit,
    phase: Phase,
    target: ServiceTarget,
    container: ServiceContainer,
    events: EventBus,
    attachments: Attachments,
}

impl DeploymentPhaseContext {
    pub(crate) fn new(
        unit: DeploymentUnit,
        phase: Phase,
        target: ServiceTarget,
        container: ServiceContainer,
        events: EventBus,
    ) -> Self {
        Self {
            unit,
            phase,
            target,
            container,
            events,
            attachments: Attachments::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn deployment_unit(&self) -> &DeploymentUnit {
        &self.unit
    }

    /// Services installed here are children of the running phase and are
    /// removed when it stops.
    pub fn service_target(&self) -> &ServiceTarget {
        &self.target
    }

    pub fn container(&self) -> &ServiceContainer {
        &self.container
    }

    /// The next phase will not start before `service` is up.
    pub fn requires_next_phase(&self, service: ServiceName) {
        self.add_to_attachment_list(&NEXT_PHASE_DEPS, service);
    }

    /// Next-phase dependency whose value lands in the next phase's context.
    pub fn add_dependency<T: Send + Sync + 'static>(
        &self,
        service: ServiceName,
        key: &'static AttachmentKey<T>,
    ) {
        self.add_attachable(AttachableDependency::value(service, key, DependencyScope::Phase));
    }

    pub fn add_list_dependency<T: Clone + Send + Sync + 'static>(
        &self,
        service: ServiceName,
        key: &'static ListKey<T>,
    ) {
        self.add_attachable(AttachableDependency::list(service, key, DependencyScope::Phase));
    }

    /// Next-phase dependency whose value lands on the deployment unit.
    pub fn add_deployment_dependency<T: Send + Sync + 'static>(
        &self,
        service: ServiceName,
        key: &'static AttachmentKey<T>,
    ) {
        self.add_attachable(AttachableDependency::value(service, key, DependencyScope::Unit));
    }

    pub fn add_deployment_list_dependency<T: Clone + Send + Sync + 'static>(
        &self,
        service: ServiceName,
        key: &'static ListKey<T>,
    ) {
        self.add_attachable(AttachableDependency::list(service, key, DependencyScope::Unit));
    }

    fn add_attachable(&self, dependency: AttachableDependency) {
        self.add_to_attachment_list(&NEXT_PHASE_ATTACHABLE_DEPS, dependency);
    }

    /// Install a sub-deployment named `name` inside this unit.
    ///
    /// Only top-level units may do this, and only during
    /// [`Phase::Structure`]. The child unit appears in the parent's
    /// `SUB_DEPLOYMENTS` list before the parent's next phase runs.
    pub fn deploy_sub_deployment(&self, name: &str) -> Result<ServiceName> {
        if self.phase != Phase::Structure {
            return Err(DeployerError::SubDeploymentOutsideStructure {
                name: name.to_string(),
                phase: self.phase,
            });
        }
        if !self.unit.is_root() {
            return Err(DeployerError::InvalidDeployment(format!(
                "sub-deployment {} cannot be nested in {}",
                name, self.unit
            )));
        }
        if name.is_empty() {
            return Err(DeployerError::InvalidDeployment(
                "sub-deployment name must not be empty".to_string(),
            ));
        }
        // Sub-deployment services share a namespace with the parent's phases.
        if Phase::ALL.iter().any(|phase| phase.as_str() == name) {
            return Err(DeployerError::InvalidDeployment(format!(
                "sub-deployment {} of {} clashes with a phase name",
                name, self.unit
            )));
        }

        let service_name = sub_unit_service_name(self.unit.name(), name);
        let service = SubDeploymentUnitService::new(&self.unit, name, self.events.clone());
        self.target
            .add_service(service_name.clone(), service)
            .install()?;

        debug!(unit = %self.unit, sub_deployment = name, "Sub-deployment installed");
        self.unit
            .add_to_attachment_list(&DISCOVERED_SUB_DEPLOYMENTS, name.to_string());
        self.add_deployment_list_dependency(service_name.clone(), &SUB_DEPLOYMENTS);
        Ok(service_name)
    }
}

impl Attachable for DeploymentPhaseContext {
    fn attachments(&self) -> &Attachments {
        &self.attachments
    }
}

impl fmt::Debug for DeploymentPhaseContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeploymentPhaseContext")
            .field("unit", &self.unit.name())
            .field("phase", &self.phase)
            .field("attachments", &self.attachments)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static LABEL: AttachmentKey<String> = AttachmentKey::new("test-label");
    static LABELS: ListKey<String> = ListKey::new("test-labels");

    struct Named;

    impl DeploymentUnitProcessor for Named {
        fn deploy(
            &self,
            _ctx: &DeploymentPhaseContext,
        ) -> std::result::Result<(), DeploymentUnitProcessingError> {
            Ok(())
        }
    }

    #[test]
    fn test_default_processor_name() {
        assert_eq!(Named.name(), "Named");
        assert_eq!(short_type_name("a::b::Outer<c::Inner>"), "Outer");
        assert_eq!(short_type_name("Plain"), "Plain");
    }

    #[test]
    fn test_attachable_dependency_replaces_value() {
        let service = ServiceName::of(["svc"]);
        let dependency = AttachableDependency::value(service, &LABEL, DependencyScope::Phase);
        let attachments = Attachments::new();

        assert!(dependency.apply(&attachments, Arc::new("first".to_string())));
        assert!(dependency.apply(&attachments, Arc::new("second".to_string())));
        assert_eq!(
            attachments.get(&LABEL).as_deref().map(String::as_str),
            Some("second")
        );
        assert!(!dependency.apply(&attachments, Arc::new(7_u32)));
    }

    #[test]
    fn test_attachable_dependency_appends_to_list() {
        let service = ServiceName::of(["svc"]);
        let dependency = AttachableDependency::list(service, &LABELS, DependencyScope::Unit);
        let attachments = Attachments::new();

        dependency.apply(&attachments, Arc::new("a".to_string()));
        dependency.apply(&attachments, Arc::new("b".to_string()));
        assert_eq!(attachments.get_list(&LABELS), vec!["a", "b"]);
        assert_eq!(dependency.scope(), DependencyScope::Unit);
        assert_eq!(dependency.key_name(), "test-labels");
    }

    #[test]
    fn test_attachable_dependency_ignores_namesake_key() {
        static NAMESAKE: AttachmentKey<String> = AttachmentKey::new("test-label");
        let service = ServiceName::of(["svc"]);
        let dependency = AttachableDependency::value(service, &LABEL, DependencyScope::Unit);
        let attachments = Attachments::new();

        assert!(dependency.apply(&attachments, Arc::new("carried".to_string())));
        assert!(attachments.get(&NAMESAKE).is_none());
        assert!(attachments.get(&LABEL).is_some());
    }

    #[test]
    fn test_processing_error_source() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "web.xml");
        let error = DeploymentUnitProcessingError::with_source("descriptor unreadable", io);
        assert_eq!(error.to_string(), "descriptor unreadable");
        assert!(error.source().is_some());

        let error = DeploymentUnitProcessingError::panicked(&"boom");
        assert!(error.message().contains("boom"));
    }
}
