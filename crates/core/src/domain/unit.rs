use std::fmt;
use std::sync::{Arc, Weak};

use crate::domain::attachment::{Attachable, Attachments};
use crate::domain::phase::Phase;
use crate::domain::service_name::ServiceName;

/// Root of every deployment unit service name.
pub fn deployment_unit_base() -> ServiceName {
    ServiceName::of(["deployment", "unit"])
}

/// Service name of a top-level deployment.
pub fn root_unit_service_name(name: &str) -> ServiceName {
    deployment_unit_base().append(name)
}

/// Service name of a sub-deployment nested in `parent`.
pub fn sub_unit_service_name(parent: &str, name: &str) -> ServiceName {
    root_unit_service_name(parent).append(name)
}

struct UnitInner {
    name: String,
    parent: Option<WeakDeploymentUnit>,
    service_name: ServiceName,
    attachments: Attachments,
}

/// One deployable artifact flowing through the phases.
///
/// A cheap handle: clones share the same instance and attachments. A child
/// keeps only a weak link to its parent; the parent owns its children through
/// its sub-deployment list. A fresh instance is created for every deployment
/// lifecycle and is never reused after its owning service stops.
#[derive(Clone)]
pub struct DeploymentUnit {
    inner: Arc<UnitInner>,
}

impl DeploymentUnit {
    pub fn new_root(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            inner: Arc::new(UnitInner {
                service_name: root_unit_service_name(&name),
                name,
                parent: None,
                attachments: Attachments::new(),
            }),
        }
    }

    pub fn new_child(parent: &DeploymentUnit, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            inner: Arc::new(UnitInner {
                service_name: sub_unit_service_name(parent.name(), &name),
                name,
                parent: Some(parent.downgrade()),
                attachments: Attachments::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The parent unit, if this is a sub-deployment whose parent is still alive.
    pub fn parent(&self) -> Option<DeploymentUnit> {
        self.inner.parent.as_ref().and_then(WeakDeploymentUnit::upgrade)
    }

    pub fn parent_name(&self) -> Option<&str> {
        self.inner.parent.as_ref().map(WeakDeploymentUnit::name)
    }

    pub fn downgrade(&self) -> WeakDeploymentUnit {
        WeakDeploymentUnit {
            name: self.inner.name.clone(),
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn is_root(&self) -> bool {
        self.inner.parent.is_none()
    }

    pub fn service_name(&self) -> &ServiceName {
        &self.inner.service_name
    }

    pub fn phase_service_name(&self, phase: Phase) -> ServiceName {
        self.inner.service_name.append(phase.as_str())
    }

    /// Service name of the top-level deployment governing this unit.
    pub fn top_level_service_name(&self) -> ServiceName {
        match self.parent_name() {
            Some(parent) => root_unit_service_name(parent),
            None => self.inner.service_name.clone(),
        }
    }

    /// Identity comparison: true only for handles to the same instance.
    pub fn same_instance(&self, other: &DeploymentUnit) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Non-owning handle to a [`DeploymentUnit`]. The name outlives the instance.
#[derive(Clone)]
pub struct WeakDeploymentUnit {
    name: String,
    inner: Weak<UnitInner>,
}

impl WeakDeploymentUnit {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn upgrade(&self) -> Option<DeploymentUnit> {
        self.inner.upgrade().map(|inner| DeploymentUnit { inner })
    }
}

impl fmt::Debug for WeakDeploymentUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakDeploymentUnit")
            .field("name", &self.name)
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl Attachable for DeploymentUnit {
    fn attachments(&self) -> &Attachments {
        &self.inner.attachments
    }
}

impl fmt::Display for DeploymentUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.parent_name() {
            Some(parent) => write!(f, "\"{}\" in \"{}\"", self.inner.name, parent),
            None => write!(f, "\"{}\"", self.inner.name),
        }
    }
}

impl fmt::Debug for DeploymentUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeploymentUnit")
            .field("name", &self.inner.name)
            .field("parent", &self.parent_name())
            .field("attachments", &self.inner.attachments)
            .finish()
    }
}
