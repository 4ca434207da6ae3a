use std::sync::Arc;

use deploy_core::ServiceName;

use crate::container::ServiceContainer;
use crate::error::Result;
use crate::service::Service;
use crate::state::Mode;

/// Where new services are installed: the container root, or beneath a
/// parent service.
#[derive(Clone)]
pub struct ServiceTarget {
    container: ServiceContainer,
    parent: Option<ServiceName>,
}

impl ServiceTarget {
    pub(crate) fn root(container: ServiceContainer) -> Self {
        Self {
            container,
            parent: None,
        }
    }

    pub(crate) fn child_of(container: ServiceContainer, parent: ServiceName) -> Self {
        Self {
            container,
            parent: Some(parent),
        }
    }

    pub fn parent(&self) -> Option<&ServiceName> {
        self.parent.as_ref()
    }

    pub fn add_service<S: Service>(&self, name: ServiceName, service: S) -> ServiceBuilder {
        self.add_shared_service(name, Arc::new(service))
    }

    pub fn add_shared_service(
        &self,
        name: ServiceName,
        service: Arc<dyn Service>,
    ) -> ServiceBuilder {
        ServiceBuilder {
            container: self.container.clone(),
            name,
            service,
            dependencies: Vec::new(),
            parent: self.parent.clone(),
            mode: Mode::Active,
        }
    }
}

/// Collects a service's declaration before [`ServiceBuilder::install`].
pub struct ServiceBuilder {
    container: ServiceContainer,
    pub(crate) name: ServiceName,
    pub(crate) service: Arc<dyn Service>,
    pub(crate) dependencies: Vec<ServiceName>,
    pub(crate) parent: Option<ServiceName>,
    pub(crate) mode: Mode,
}

impl ServiceBuilder {
    pub fn name(&self) -> &ServiceName {
        &self.name
    }

    /// The service will not start before `name` is up, and stops before it.
    /// The dependency's value is visible through
    /// [`StartContext::dependency_value`](crate::StartContext::dependency_value).
    pub fn requires(mut self, name: ServiceName) -> Self {
        if !self.dependencies.contains(&name) {
            self.dependencies.push(name);
        }
        self
    }

    pub fn requires_all<I: IntoIterator<Item = ServiceName>>(mut self, names: I) -> Self {
        for name in names {
            self = self.requires(name);
        }
        self
    }

    pub fn initial_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn install(self) -> Result<ServiceName> {
        let container = self.container.clone();
        container.install(self)
    }
}
