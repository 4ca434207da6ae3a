//! Execution of one phase for one deployment unit.
//!
//! Each (unit, phase) pair is a container service. Starting it runs the
//! phase's processor chain; a successful run installs the next phase as a
//! child service, wired to everything the chain asked the next phase to wait
//! for. Stopping it undoes the chain in reverse. The container stops children
//! first, so an undeploy unwinds the phases from last to first.
//!
//! A second start of a phase that already ran for the current unit instance
//! is never executed: processors are not required to be idempotent. The
//! owning top-level deployment is restarted instead, which builds a fresh
//! unit and runs every phase again.

use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use container::{Service, ServiceTarget, StartContext, StartError, StopContext};
use deploy_core::{
    root_unit_service_name, sub_unit_service_name, Attachable, DeploymentUnit, Phase, ServiceName,
};
use events::{Event, EventBus, UnitRef};
use tracing::{debug, error, info, warn};

use crate::chains::{chains_service_name, DeployerChains, RegisteredProcessor};
use crate::error::{DeployerError, Result};
use crate::keys::{
    DISCOVERED_SUB_DEPLOYMENTS, EXCLUDED_DEPENDENCIES, EXCLUDED_SUBSYSTEMS, FAILURE,
    NEXT_PHASE_ATTACHABLE_DEPS, NEXT_PHASE_DEPS, REGISTERED_SUBSYSTEMS, RESOLVED_DEPENDENCIES,
    SUB_DEPLOYMENTS,
};
use crate::processor::{
    AttachableDependency, DependencyScope, DeploymentPhaseContext, DeploymentUnitProcessingError,
};
use crate::status::DeploymentFailure;

/// Name of the barrier that is up once `unit` and all of its sub-deployments
/// completed `phase`.
pub fn phase_settled_service_name(unit: &DeploymentUnit, phase: Phase) -> ServiceName {
    unit.phase_service_name(phase).append("settled")
}

/// Install the service running `phase` for `unit` under `target`.
///
/// The service waits for the processor chains, for `next_phase_deps`, for
/// every service in `attachable`, for the previous phase of each discovered
/// sub-deployment and, for a sub-deployment, for the same phase of its parent.
pub(crate) fn install_phase(
    target: &ServiceTarget,
    unit: &DeploymentUnit,
    phase: Phase,
    events: &EventBus,
    next_phase_deps: Vec<ServiceName>,
    attachable: Vec<AttachableDependency>,
) -> container::Result<ServiceName> {
    let mut dependencies = vec![chains_service_name()];
    dependencies.extend(next_phase_deps);
    dependencies.extend(attachable.iter().map(|d| d.service().clone()));

    if let Some(previous) = phase.previous() {
        for child in unit.get_attachment_list(&DISCOVERED_SUB_DEPLOYMENTS) {
            dependencies
                .push(sub_unit_service_name(unit.name(), &child).append(previous.as_str()));
        }
    }
    if let Some(parent) = unit.parent_name() {
        dependencies.push(root_unit_service_name(parent).append(phase.as_str()));
    }

    let service = DeploymentUnitPhaseService::new(unit.clone(), phase, events.clone(), attachable);
    target
        .add_service(unit.phase_service_name(phase), service)
        .requires_all(dependencies)
        .install()
}

pub struct DeploymentUnitPhaseService {
    unit: DeploymentUnit,
    phase: Phase,
    events: EventBus,
    /// Values requested by the previous phase, seeded before the chain runs
    attachable_deps: Vec<AttachableDependency>,
    ran_once: AtomicBool,
    /// Processors whose effects are currently applied, in execution order
    applied: Mutex<Option<Vec<RegisteredProcessor>>>,
}

impl DeploymentUnitPhaseService {
    pub(crate) fn new(
        unit: DeploymentUnit,
        phase: Phase,
        events: EventBus,
        attachable_deps: Vec<AttachableDependency>,
    ) -> Self {
        Self {
            unit,
            phase,
            events,
            attachable_deps,
            ran_once: AtomicBool::new(false),
            applied: Mutex::new(None),
        }
    }

    pub fn unit(&self) -> &DeploymentUnit {
        &self.unit
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn unit_ref(&self) -> UnitRef {
        UnitRef::from(&self.unit)
    }

    fn restart_detected(&self, ctx: &StartContext) -> std::result::Result<(), StartError> {
        let top = self.unit.top_level_service_name();
        let deployment = self.unit.parent_name().unwrap_or(self.unit.name()).to_string();
        warn!(
            unit = %self.unit,
            phase = %self.phase,
            deployment = %deployment,
            "Phase started again after completing; redeploying the deployment"
        );
        self.events.emit(Event::RestartDetected {
            unit: self.unit_ref(),
            phase: self.phase,
            redeploying: deployment,
        });
        ctx.container()
            .restart(&top)
            .map_err(StartError::from_error)
    }

    fn seed_attachments(&self, ctx: &StartContext, phase_ctx: &DeploymentPhaseContext) {
        for dependency in &self.attachable_deps {
            let Some(value) = ctx.dependency_value(dependency.service()) else {
                warn!(
                    unit = %self.unit,
                    phase = %self.phase,
                    service = %dependency.service(),
                    key = dependency.key_name(),
                    "Dependency published no value"
                );
                continue;
            };
            let target = match dependency.scope() {
                DependencyScope::Phase => phase_ctx.attachments(),
                DependencyScope::Unit => self.unit.attachments(),
            };
            if !dependency.apply(target, value) {
                warn!(
                    unit = %self.unit,
                    service = %dependency.service(),
                    key = dependency.key_name(),
                    "Dependency value does not match its attachment type"
                );
            }
        }
    }

    /// Record every subsystem with a processor scheduled in this phase,
    /// whether or not it ends up excluded.
    fn record_subsystems(&self, chain: &[RegisteredProcessor]) {
        let mut registered = if self.phase == Phase::first() {
            BTreeSet::new()
        } else {
            self.unit
                .get_attachment(&REGISTERED_SUBSYSTEMS)
                .map(|set| (*set).clone())
                .unwrap_or_default()
        };
        registered.extend(chain.iter().filter_map(|p| p.subsystem().map(str::to_string)));
        self.unit.put_attachment(&REGISTERED_SUBSYSTEMS, registered);
    }

    /// Runs at the start of the last phase. Sub-deployments finished their
    /// earlier phases by then, so their resolved dependencies count too.
    fn validate_exclusions(&self) {
        let registered = self
            .unit
            .get_attachment(&REGISTERED_SUBSYSTEMS)
            .unwrap_or_default();
        if let Some(excluded) = self.unit.get_attachment(&EXCLUDED_SUBSYSTEMS) {
            for subsystem in excluded.iter().filter(|s| !registered.contains(*s)) {
                self.validation_warning(format!(
                    "excluded subsystem {} never registered a processor",
                    subsystem
                ));
            }
        }

        let mut resolved: BTreeSet<String> = self
            .unit
            .get_attachment_list(&RESOLVED_DEPENDENCIES)
            .into_iter()
            .collect();
        for child in self.unit.get_attachment_list(&SUB_DEPLOYMENTS) {
            resolved.extend(child.get_attachment_list(&RESOLVED_DEPENDENCIES));
        }
        if let Some(excluded) = self.unit.get_attachment(&EXCLUDED_DEPENDENCIES) {
            for dependency in excluded.iter().filter(|d| !resolved.contains(*d)) {
                self.validation_warning(format!(
                    "excluded dependency {} was never resolved",
                    dependency
                ));
            }
        }
    }

    fn validation_warning(&self, message: String) {
        warn!(unit = %self.unit, "{}", message);
        self.events.emit(Event::ValidationWarning {
            unit: self.unit_ref(),
            message,
        });
    }

    fn is_excluded(&self, registered: &RegisteredProcessor) -> bool {
        let Some(subsystem) = registered.subsystem() else {
            return false;
        };
        let excludes = |unit: &DeploymentUnit| {
            unit.get_attachment(&EXCLUDED_SUBSYSTEMS)
                .is_some_and(|set| set.contains(subsystem))
        };
        excludes(&self.unit) || self.unit.parent().is_some_and(|parent| excludes(&parent))
    }

    /// Run the chain. On failure the processors that already ran are undone
    /// in reverse; the failing one is not.
    fn run_chain(
        &self,
        chain: &[RegisteredProcessor],
        phase_ctx: &DeploymentPhaseContext,
    ) -> Result<Vec<RegisteredProcessor>> {
        let mut ran: Vec<RegisteredProcessor> = Vec::with_capacity(chain.len());

        for registered in chain {
            if self.is_excluded(registered) {
                debug!(
                    unit = %self.unit,
                    phase = %self.phase,
                    processor = registered.processor_name(),
                    subsystem = registered.subsystem().unwrap_or("-"),
                    "Skipping processor of excluded subsystem"
                );
                continue;
            }

            let outcome =
                catch_unwind(AssertUnwindSafe(|| registered.processor().deploy(phase_ctx)));
            let failure = match outcome {
                Ok(Ok(())) => {
                    ran.push(registered.clone());
                    continue;
                }
                Ok(Err(e)) => e,
                Err(panic) => DeploymentUnitProcessingError::panicked(panic.as_ref()),
            };

            self.undo(&ran);
            return Err(DeployerError::phase_failed(
                self.unit.to_string(),
                self.phase,
                registered.processor_name(),
                failure,
            ));
        }

        Ok(ran)
    }

    /// Undo `processors` from last to first. Panics are logged and do not
    /// stop the remaining undos.
    fn undo(&self, processors: &[RegisteredProcessor]) {
        for registered in processors.iter().rev() {
            let outcome =
                catch_unwind(AssertUnwindSafe(|| registered.processor().undo(&self.unit)));
            if outcome.is_err() {
                warn!(
                    unit = %self.unit,
                    phase = %self.phase,
                    processor = registered.processor_name(),
                    "Undo panicked; continuing with the remaining processors"
                );
            }
        }
    }

    fn record_failure(&self, error: &DeployerError) {
        error!(unit = %self.unit, phase = %self.phase, error = %error, "Phase failed");
        let (processor, reason) = match error {
            DeployerError::PhaseFailed {
                processor, source, ..
            } => (Some(processor.clone()), source.to_string()),
            DeployerError::HandoffFailed { source, .. } => (None, source.to_string()),
            other => (None, other.to_string()),
        };
        self.unit.put_attachment(
            &FAILURE,
            DeploymentFailure {
                unit: self.unit.to_string(),
                phase: Some(self.phase),
                processor: processor.clone(),
                reason: reason.clone(),
            },
        );
        self.events.emit(Event::PhaseFailed {
            unit: self.unit_ref(),
            phase: self.phase,
            processor,
            reason,
        });
    }

    /// Install the next phase and this phase's settled barrier.
    fn install_successors(
        &self,
        ctx: &StartContext,
        phase_ctx: &DeploymentPhaseContext,
    ) -> container::Result<()> {
        let target = ctx.child_target();

        if let Some(next) = self.phase.next() {
            install_phase(
                &target,
                &self.unit,
                next,
                &self.events,
                phase_ctx.get_attachment_list(&NEXT_PHASE_DEPS),
                phase_ctx.get_attachment_list(&NEXT_PHASE_ATTACHABLE_DEPS),
            )?;
        }

        let children: Vec<ServiceName> = self
            .unit
            .get_attachment_list(&DISCOVERED_SUB_DEPLOYMENTS)
            .iter()
            .map(|child| {
                sub_unit_service_name(self.unit.name(), child)
                    .append(self.phase.as_str())
                    .append("settled")
            })
            .collect();
        target
            .add_service(
                phase_settled_service_name(&self.unit, self.phase),
                PhaseSettledService {
                    unit: self.unit_ref(),
                    phase: self.phase,
                    is_root: self.unit.is_root(),
                    events: self.events.clone(),
                },
            )
            .requires_all(children)
            .install()?;
        Ok(())
    }
}

#[async_trait]
impl Service for DeploymentUnitPhaseService {
    async fn start(&self, ctx: StartContext) -> std::result::Result<(), StartError> {
        if self.ran_once.swap(true, Ordering::SeqCst) {
            return self.restart_detected(&ctx);
        }

        let chains = ctx
            .dependency_value_as::<DeployerChains>(&chains_service_name())
            .ok_or_else(|| StartError::from_error(DeployerError::ChainsUnavailable))?;
        let chain = chains.chain(self.phase);

        let phase_ctx = DeploymentPhaseContext::new(
            self.unit.clone(),
            self.phase,
            ctx.child_target(),
            ctx.container().clone(),
            self.events.clone(),
        );
        self.seed_attachments(&ctx, &phase_ctx);
        self.record_subsystems(chain);
        if self.phase.is_last() {
            self.validate_exclusions();
        }

        debug!(
            unit = %self.unit,
            phase = %self.phase,
            processors = chain.len(),
            "Running phase"
        );
        self.events.emit(Event::PhaseStarted {
            unit: self.unit_ref(),
            phase: self.phase,
        });

        let ran = match self.run_chain(chain, &phase_ctx) {
            Ok(ran) => ran,
            Err(e) => {
                self.record_failure(&e);
                return Err(StartError::from_error(e));
            }
        };

        // A failed start is never stopped, so nothing may stay applied.
        if let Err(source) = self.install_successors(&ctx, &phase_ctx) {
            self.undo(&ran);
            let e = DeployerError::HandoffFailed {
                unit: self.unit.to_string(),
                phase: self.phase,
                source,
            };
            self.record_failure(&e);
            return Err(StartError::from_error(e));
        }

        *self.applied.lock().unwrap_or_else(PoisonError::into_inner) = Some(ran);
        self.events.emit(Event::PhaseCompleted {
            unit: self.unit_ref(),
            phase: self.phase,
        });
        Ok(())
    }

    async fn stop(&self, _ctx: StopContext) {
        let applied = self
            .applied
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(applied) = applied else {
            return;
        };

        debug!(
            unit = %self.unit,
            phase = %self.phase,
            processors = applied.len(),
            "Undoing phase"
        );
        self.undo(&applied);
        self.events.emit(Event::PhaseUndone {
            unit: self.unit_ref(),
            phase: self.phase,
        });
    }
}

/// Up once the owning phase and the same phase of every sub-deployment
/// completed.
struct PhaseSettledService {
    unit: UnitRef,
    phase: Phase,
    is_root: bool,
    events: EventBus,
}

#[async_trait]
impl Service for PhaseSettledService {
    async fn start(&self, _ctx: StartContext) -> std::result::Result<(), StartError> {
        debug!(unit = %self.unit.name, phase = %self.phase, "Phase settled");
        self.events.emit(Event::PhaseSettled {
            unit: self.unit.clone(),
            phase: self.phase,
        });
        if self.is_root && self.phase.is_last() {
            info!(deployment = %self.unit.name, "Deployment is up");
            self.events.emit(Event::DeploymentUp {
                unit: self.unit.clone(),
            });
        }
        Ok(())
    }
}
