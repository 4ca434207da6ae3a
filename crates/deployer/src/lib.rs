//! Deployment phase pipeline.
//!
//! A deployment is a [`DeploymentUnit`](deploy_core::DeploymentUnit) pushed
//! through every [`Phase`](deploy_core::Phase) in order. Each phase runs a
//! priority-ordered chain of [`DeploymentUnitProcessor`]s registered by
//! subsystems; processors communicate through typed attachments. Phases,
//! units and sub-deployments are services of a
//! [`ServiceContainer`](container::ServiceContainer), which provides the
//! ordering guarantees between them.

pub mod chains;
pub mod config;
pub mod deployer;
pub mod error;
pub mod keys;
pub mod phase_service;
pub mod processor;
pub mod status;
pub mod unit_service;

pub use chains::{chains_service_name, DeployerChains, DeployerChainsBuilder, RegisteredProcessor};
pub use config::{DeployerConfig, DeploymentSpec};
pub use deployer::Deployer;
pub use error::{DeployerError, Result};
pub use phase_service::{phase_settled_service_name, DeploymentUnitPhaseService};
pub use processor::{
    AttachableDependency, DependencyScope, DeploymentPhaseContext, DeploymentUnitProcessingError,
    DeploymentUnitProcessor,
};
pub use status::{DeploymentFailure, DeploymentStatus};
pub use unit_service::{RootDeploymentUnitService, SubDeploymentUnitService};
