//! Core data model for the deployment pipeline.
//!
//! - [`Attachments`] / [`Attachable`] - typed, thread-safe key/value store
//! - [`DeploymentUnit`] - one deployable artifact (root or sub-deployment)
//! - [`Phase`] - the fixed, totally ordered processing phases
//! - [`ServiceName`] - hierarchical names used to address scheduled services

pub mod domain;
pub mod error;

pub use domain::attachment::{Attachable, AttachmentKey, Attachments, ListKey};
pub use domain::phase::Phase;
pub use domain::service_name::ServiceName;
pub use domain::unit::{
    deployment_unit_base, root_unit_service_name, sub_unit_service_name, DeploymentUnit,
    WeakDeploymentUnit,
};
pub use error::{CoreError, Result};
