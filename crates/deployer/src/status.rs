use std::fmt;

use container::{ServiceContainer, ServiceSnapshot, ServiceState};
use deploy_core::{root_unit_service_name, Phase};
use serde::{Deserialize, Serialize};

use crate::error::DeployerError;

/// Why a deployment is not healthy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentFailure {
    /// Unit the failure originated in
    pub unit: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processor: Option<String>,
    pub reason: String,
}

impl fmt::Display for DeploymentFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.unit)?;
        if let Some(phase) = self.phase {
            write!(f, " failed in {}", phase)?;
        }
        if let Some(processor) = &self.processor {
            write!(f, " ({})", processor)?;
        }
        write!(f, ": {}", self.reason)
    }
}

/// Coarse health of one top-level deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentStatus {
    Stopped,
    Ok,
    Failed(DeploymentFailure),
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "STOPPED",
            Self::Ok => "OK",
            Self::Failed(_) => "FAILED",
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    pub fn failure(&self) -> Option<&DeploymentFailure> {
        match self {
            Self::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(failure) => write!(f, "FAILED ({})", failure),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Derive the status of deployment `name` from the container.
///
/// - not installed, or its lifecycle service is not up: `Stopped`
/// - any service of the deployment failed to start: `Failed`
/// - nothing the deployment waits on is in transition, yet one of its
///   services is still waiting on a dependency: `Failed`. Unrelated services
///   that are starting or stopping elsewhere in the container do not delay
///   this verdict.
/// - otherwise `Ok`, including while phases are still in progress
pub(crate) fn deployment_status(container: &ServiceContainer, name: &str) -> DeploymentStatus {
    let root = root_unit_service_name(name);
    let services = container.services_under(&root);

    let Some(root_service) = services.iter().find(|s| s.name == root) else {
        return DeploymentStatus::Stopped;
    };

    if let Some(failed) = services.iter().find(|s| s.state == ServiceState::Failed) {
        return DeploymentStatus::Failed(failure_of(failed));
    }

    if root_service.state != ServiceState::Up {
        return DeploymentStatus::Stopped;
    }

    if !is_settling(container, &services) {
        if let Some(stuck) = services.iter().find(|s| is_unsatisfied(s)) {
            let mut waiting: Vec<String> = stuck
                .missing_dependencies
                .iter()
                .map(|d| format!("{} (missing)", d))
                .collect();
            waiting.extend(
                stuck
                    .unavailable_dependencies
                    .iter()
                    .map(|d| format!("{} (not up)", d)),
            );
            return DeploymentStatus::Failed(DeploymentFailure {
                unit: stuck.name.to_string(),
                phase: None,
                processor: None,
                reason: format!("unsatisfied dependencies: {}", waiting.join(", ")),
            });
        }
    }

    DeploymentStatus::Ok
}

fn in_transition(state: ServiceState) -> bool {
    matches!(state, ServiceState::Starting | ServiceState::Stopping)
}

/// True while a service of the deployment, or a service one of them is
/// waiting for, is starting or stopping.
fn is_settling(container: &ServiceContainer, services: &[ServiceSnapshot]) -> bool {
    services.iter().any(|s| {
        in_transition(s.state)
            || s.unavailable_dependencies
                .iter()
                .any(|d| container.state(d).is_some_and(in_transition))
    })
}

fn is_unsatisfied(snapshot: &ServiceSnapshot) -> bool {
    snapshot.state == ServiceState::Down
        && snapshot.mode == container::Mode::Active
        && !(snapshot.missing_dependencies.is_empty()
            && snapshot.unavailable_dependencies.is_empty())
}

fn failure_of(snapshot: &ServiceSnapshot) -> DeploymentFailure {
    let failure = snapshot.failure.as_ref();
    match failure.and_then(|f| f.cause_as::<DeployerError>()) {
        Some(DeployerError::PhaseFailed {
            unit,
            phase,
            processor,
            source,
        }) => DeploymentFailure {
            unit: unit.clone(),
            phase: Some(*phase),
            processor: Some(processor.clone()),
            reason: source.to_string(),
        },
        Some(DeployerError::HandoffFailed {
            unit,
            phase,
            source,
        }) => DeploymentFailure {
            unit: unit.clone(),
            phase: Some(*phase),
            processor: None,
            reason: source.to_string(),
        },
        _ => DeploymentFailure {
            unit: snapshot.name.to_string(),
            phase: None,
            processor: None,
            reason: failure
                .map(|f| f.message().to_string())
                .unwrap_or_else(|| "unknown failure".to_string()),
        },
    }
}
