use std::any::Any;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use deploy_core::ServiceName;

use crate::builder::ServiceTarget;
use crate::container::ServiceContainer;

/// Type-erased value a service exposes to its dependents.
pub type ServiceValue = Arc<dyn Any + Send + Sync>;

/// Start/stop callbacks of a scheduled unit of work.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Called once every dependency is up. An error leaves the service
    /// [`Failed`](crate::ServiceState::Failed).
    async fn start(&self, ctx: StartContext) -> Result<(), StartError>;

    /// Called after every dependent and child has stopped. Never called for
    /// a service whose start failed.
    async fn stop(&self, _ctx: StopContext) {}

    /// Value published to dependents once the service is up.
    fn value(&self) -> Option<ServiceValue> {
        None
    }
}

/// What a start callback sees: its own name, its dependencies' values and a
/// target for installing child services.
pub struct StartContext {
    name: ServiceName,
    container: ServiceContainer,
    values: HashMap<ServiceName, ServiceValue>,
}

impl StartContext {
    pub(crate) fn new(
        name: ServiceName,
        container: ServiceContainer,
        values: HashMap<ServiceName, ServiceValue>,
    ) -> Self {
        Self {
            name,
            container,
            values,
        }
    }

    pub fn name(&self) -> &ServiceName {
        &self.name
    }

    pub fn container(&self) -> &ServiceContainer {
        &self.container
    }

    /// Services installed through this target are children of the starting
    /// service and are removed when it leaves the up state.
    pub fn child_target(&self) -> ServiceTarget {
        ServiceTarget::child_of(self.container.clone(), self.name.clone())
    }

    /// Value published by the dependency `name`, if it exposes one.
    pub fn dependency_value(&self, name: &ServiceName) -> Option<ServiceValue> {
        self.values.get(name).cloned()
    }

    /// Typed variant of [`StartContext::dependency_value`].
    pub fn dependency_value_as<T: Send + Sync + 'static>(
        &self,
        name: &ServiceName,
    ) -> Option<Arc<T>> {
        self.dependency_value(name)
            .and_then(|value| value.downcast::<T>().ok())
    }
}

/// What a stop callback sees.
pub struct StopContext {
    name: ServiceName,
    container: ServiceContainer,
}

impl StopContext {
    pub(crate) fn new(name: ServiceName, container: ServiceContainer) -> Self {
        Self { name, container }
    }

    pub fn name(&self) -> &ServiceName {
        &self.name
    }

    pub fn container(&self) -> &ServiceContainer {
        &self.container
    }
}

/// Failure reported by a start callback.
///
/// Cheap to clone; the underlying cause is shared so that status queries can
/// recover it with [`StartError::cause_as`].
#[derive(Clone)]
pub struct StartError {
    message: String,
    cause: Option<Arc<dyn Error + Send + Sync>>,
}

impl StartError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
        }
    }

    /// Wrap an error, using its display text as the message.
    pub fn from_error<E: Error + Send + Sync + 'static>(error: E) -> Self {
        Self {
            message: error.to_string(),
            cause: Some(Arc::new(error)),
        }
    }

    pub(crate) fn panicked(name: &ServiceName, panic: &(dyn Any + Send)) -> Self {
        let detail = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Self::new(format!("start of {} panicked: {}", name, detail))
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The wrapped cause, if it is an `E`.
    pub fn cause_as<E: Error + 'static>(&self) -> Option<&E> {
        self.cause.as_deref().and_then(|cause| cause.downcast_ref::<E>())
    }
}

impl fmt::Debug for StartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartError")
            .field("message", &self.message)
            .field("cause", &self.cause)
            .finish()
    }
}

impl fmt::Display for StartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl Error for StartError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn Error + 'static))
    }
}
