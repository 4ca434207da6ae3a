use container::ContainerError;
use deploy_core::Phase;
use thiserror::Error;

use crate::processor::DeploymentUnitProcessingError;

#[derive(Debug, Error)]
pub enum DeployerError {
    #[error("Deployment already exists: {0}")]
    DuplicateDeployment(String),

    #[error("Deployment not found: {0}")]
    NotDeployed(String),

    #[error("Invalid deployment: {0}")]
    InvalidDeployment(String),

    #[error("{phase} of {unit} failed in {processor}: {source}")]
    PhaseFailed {
        unit: String,
        phase: Phase,
        processor: String,
        #[source]
        source: DeploymentUnitProcessingError,
    },

    #[error("{phase} of {unit} completed but its successors could not be installed: {source}")]
    HandoffFailed {
        unit: String,
        phase: Phase,
        #[source]
        source: ContainerError,
    },

    #[error(
        "Sub-deployment {name} requested during {phase}; only STRUCTURE may add sub-deployments"
    )]
    SubDeploymentOutsideStructure { name: String, phase: Phase },

    #[error("Processor chains are not available")]
    ChainsUnavailable,

    #[error("Deployments did not settle within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Container error: {0}")]
    Container(#[from] ContainerError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeployerError {
    /// Create a phase failure for `unit`.
    pub fn phase_failed(
        unit: impl Into<String>,
        phase: Phase,
        processor: impl Into<String>,
        source: DeploymentUnitProcessingError,
    ) -> Self {
        Self::PhaseFailed {
            unit: unit.into(),
            phase,
            processor: processor.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, DeployerError>;
