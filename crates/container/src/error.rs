use deploy_core::ServiceName;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("Service already installed: {0}")]
    DuplicateService(ServiceName),

    #[error("Service not found: {0}")]
    ServiceNotFound(ServiceName),

    #[error("Parent {parent} of service {service} is not installed")]
    ParentNotFound {
        service: ServiceName,
        parent: ServiceName,
    },

    #[error("Service {0} may not depend on itself")]
    SelfDependency(ServiceName),

    #[error("Container is shut down")]
    ShutDown,
}

pub type Result<T> = std::result::Result<T, ContainerError>;
