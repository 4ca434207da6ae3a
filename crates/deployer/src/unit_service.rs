//! Lifecycle services owning one [`DeploymentUnit`] instance each.
//!
//! Starting creates a fresh unit and installs its first phase; stopping
//! (after every phase below it has been undone) purges the unit's
//! attachments and drops the instance.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use container::{Service, ServiceValue, StartContext, StartError, StopContext};
use deploy_core::{Attachable, DeploymentUnit, Phase, WeakDeploymentUnit};
use events::{Event, EventBus, UnitRef};
use tracing::{debug, info};

use crate::config::DeploymentSpec;
use crate::error::DeployerError;
use crate::keys::{DEPLOYMENT_CONTENTS, EXCLUDED_DEPENDENCIES, EXCLUDED_SUBSYSTEMS, RUNTIME_NAME};
use crate::phase_service::install_phase;

/// Holds the live unit between start and stop.
#[derive(Default)]
struct UnitSlot {
    unit: Mutex<Option<DeploymentUnit>>,
}

impl UnitSlot {
    fn current(&self) -> Option<DeploymentUnit> {
        self.unit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace(&self, unit: Option<DeploymentUnit>) -> Option<DeploymentUnit> {
        std::mem::replace(
            &mut *self.unit.lock().unwrap_or_else(PoisonError::into_inner),
            unit,
        )
    }

    fn begin(
        &self,
        unit: DeploymentUnit,
        ctx: &StartContext,
        events: &EventBus,
    ) -> Result<(), StartError> {
        install_phase(
            &ctx.child_target(),
            &unit,
            Phase::first(),
            events,
            Vec::new(),
            Vec::new(),
        )
        .map_err(StartError::from_error)?;
        events.emit(Event::DeploymentStarted {
            unit: UnitRef::from(&unit),
        });
        self.replace(Some(unit));
        Ok(())
    }

    fn end(&self, events: &EventBus) {
        if let Some(unit) = self.replace(None) {
            unit.attachments().clear();
            debug!(unit = %unit, "Unit attachments purged");
            events.emit(Event::DeploymentStopped {
                unit: UnitRef::from(&unit),
            });
        }
    }

    fn value(&self) -> Option<ServiceValue> {
        self.current()
            .map(|unit| Arc::new(unit) as ServiceValue)
    }
}

/// Lifecycle of a top-level deployment.
pub struct RootDeploymentUnitService {
    spec: DeploymentSpec,
    events: EventBus,
    slot: UnitSlot,
}

impl RootDeploymentUnitService {
    pub fn new(spec: DeploymentSpec, events: EventBus) -> Self {
        Self {
            spec,
            events,
            slot: UnitSlot::default(),
        }
    }

    pub fn unit(&self) -> Option<DeploymentUnit> {
        self.slot.current()
    }
}

#[async_trait]
impl Service for RootDeploymentUnitService {
    async fn start(&self, ctx: StartContext) -> Result<(), StartError> {
        let unit = DeploymentUnit::new_root(&self.spec.name);
        unit.put_attachment(&RUNTIME_NAME, self.spec.name.clone());
        unit.put_attachment(&DEPLOYMENT_CONTENTS, self.spec.path.clone());
        if !self.spec.excluded_subsystems.is_empty() {
            let excluded: BTreeSet<String> =
                self.spec.excluded_subsystems.iter().cloned().collect();
            unit.put_attachment(&EXCLUDED_SUBSYSTEMS, excluded);
        }
        if !self.spec.excluded_dependencies.is_empty() {
            let excluded: BTreeSet<String> =
                self.spec.excluded_dependencies.iter().cloned().collect();
            unit.put_attachment(&EXCLUDED_DEPENDENCIES, excluded);
        }

        info!(
            deployment = %self.spec.name,
            path = %self.spec.path.display(),
            "Starting deployment"
        );
        self.slot.begin(unit, &ctx, &self.events)
    }

    async fn stop(&self, _ctx: StopContext) {
        info!(deployment = %self.spec.name, "Stopped deployment");
        self.slot.end(&self.events);
    }

    fn value(&self) -> Option<ServiceValue> {
        self.slot.value()
    }
}

/// Lifecycle of a sub-deployment discovered during its parent's STRUCTURE
/// phase. Installed as a child of that phase; holds only a weak link to the
/// parent unit.
pub struct SubDeploymentUnitService {
    parent: WeakDeploymentUnit,
    name: String,
    events: EventBus,
    slot: UnitSlot,
}

impl SubDeploymentUnitService {
    pub fn new(parent: &DeploymentUnit, name: impl Into<String>, events: EventBus) -> Self {
        Self {
            parent: parent.downgrade(),
            name: name.into(),
            events,
            slot: UnitSlot::default(),
        }
    }

    pub fn unit(&self) -> Option<DeploymentUnit> {
        self.slot.current()
    }
}

#[async_trait]
impl Service for SubDeploymentUnitService {
    async fn start(&self, ctx: StartContext) -> Result<(), StartError> {
        let parent = self.parent.upgrade().ok_or_else(|| {
            StartError::from_error(DeployerError::NotDeployed(self.parent.name().to_string()))
        })?;
        let unit = DeploymentUnit::new_child(&parent, &self.name);
        unit.put_attachment(&RUNTIME_NAME, self.name.clone());
        if let Some(contents) = parent.get_attachment(&DEPLOYMENT_CONTENTS) {
            unit.put_attachment(&DEPLOYMENT_CONTENTS, contents.join(&self.name));
        }

        debug!(unit = %unit, "Starting sub-deployment");
        self.slot.begin(unit, &ctx, &self.events)
    }

    async fn stop(&self, _ctx: StopContext) {
        debug!(
            parent = self.parent.name(),
            sub_deployment = %self.name,
            "Stopped sub-deployment"
        );
        self.slot.end(&self.events);
    }

    fn value(&self) -> Option<ServiceValue> {
        self.slot.value()
    }
}
