//! Well-known attachment keys shared by the pipeline and its processors.

use std::collections::BTreeSet;
use std::path::PathBuf;

use deploy_core::{AttachmentKey, DeploymentUnit, ListKey, ServiceName};

use crate::processor::AttachableDependency;
use crate::status::DeploymentFailure;

/// Name the unit is known by at runtime.
pub static RUNTIME_NAME: AttachmentKey<String> = AttachmentKey::new("runtime-name");

/// Location of the unit's content on disk.
pub static DEPLOYMENT_CONTENTS: AttachmentKey<PathBuf> =
    AttachmentKey::new("deployment-contents");

/// Child units of a top-level unit, filled before the phase after STRUCTURE.
pub static SUB_DEPLOYMENTS: ListKey<DeploymentUnit> = ListKey::new("sub-deployments");

/// Names of sub-deployments installed during STRUCTURE.
pub static DISCOVERED_SUB_DEPLOYMENTS: ListKey<String> = ListKey::new("discovered-sub-deployments");

/// Subsystems whose processors must not run for this unit (or its children).
pub static EXCLUDED_SUBSYSTEMS: AttachmentKey<BTreeSet<String>> =
    AttachmentKey::new("excluded-subsystems");

/// Module dependencies the unit asked to exclude.
pub static EXCLUDED_DEPENDENCIES: AttachmentKey<BTreeSet<String>> =
    AttachmentKey::new("excluded-dependencies");

/// Subsystems with at least one processor scheduled for this unit so far.
pub static REGISTERED_SUBSYSTEMS: AttachmentKey<BTreeSet<String>> =
    AttachmentKey::new("registered-subsystems");

/// Module dependencies resolved by processors.
pub static RESOLVED_DEPENDENCIES: ListKey<String> = ListKey::new("resolved-dependencies");

/// Phase-context list: services the next phase must wait for.
pub static NEXT_PHASE_DEPS: ListKey<ServiceName> = ListKey::new("next-phase-deps");

/// Phase-context list: dependencies whose values are carried into attachments.
pub static NEXT_PHASE_ATTACHABLE_DEPS: ListKey<AttachableDependency> =
    ListKey::new("next-phase-attachable-deps");

/// The failure that aborted this unit, if any.
pub static FAILURE: AttachmentKey<DeploymentFailure> = AttachmentKey::new("deployment-failure");
