use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use container::ServiceContainer;
use deploy_core::{root_unit_service_name, DeploymentUnit};
use events::EventBus;
use tracing::{info, warn};

use crate::chains::{chains_service_name, ChainsService, DeployerChains};
use crate::config::{DeployerConfig, DeploymentSpec};
use crate::error::{DeployerError, Result};
use crate::status::{deployment_status, DeploymentStatus};
use crate::unit_service::RootDeploymentUnitService;

/// Entry point for adding, removing and inspecting top-level deployments.
///
/// Cheap to clone; clones share the same container and registry.
#[derive(Clone)]
pub struct Deployer {
    container: ServiceContainer,
    events: EventBus,
    config: Arc<DeployerConfig>,
    deployments: Arc<Mutex<BTreeSet<String>>>,
}

impl Deployer {
    /// Create a deployer on a fresh container and publish `chains`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(chains: DeployerChains, config: DeployerConfig) -> Result<Self> {
        Self::with_container(ServiceContainer::new(), chains, config)
    }

    pub fn with_container(
        container: ServiceContainer,
        chains: DeployerChains,
        config: DeployerConfig,
    ) -> Result<Self> {
        container
            .add_service(chains_service_name(), ChainsService::new(chains))
            .install()?;
        Ok(Self {
            container,
            events: EventBus::new(),
            config: Arc::new(config),
            deployments: Arc::new(Mutex::new(BTreeSet::new())),
        })
    }

    /// Publish lifecycle events on `events` instead of a private bus.
    /// Affects deployments added afterwards.
    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn container(&self) -> &ServiceContainer {
        &self.container
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &DeployerConfig {
        &self.config
    }

    fn registry(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.deployments
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Install the lifecycle service of a new top-level deployment.
    pub fn deploy(&self, spec: DeploymentSpec) -> Result<()> {
        if spec.name.trim().is_empty() {
            return Err(DeployerError::InvalidDeployment(
                "deployment name must not be empty".to_string(),
            ));
        }

        let mut deployments = self.registry();
        let service_name = root_unit_service_name(&spec.name);
        if deployments.contains(&spec.name) || self.container.contains(&service_name) {
            return Err(DeployerError::DuplicateDeployment(spec.name));
        }

        info!(
            deployment = %spec.name,
            path = %spec.path.display(),
            excluded_subsystems = spec.excluded_subsystems.len(),
            "Deploying"
        );
        let name = spec.name.clone();
        self.container
            .add_service(
                service_name,
                RootDeploymentUnitService::new(spec, self.events.clone()),
            )
            .install()?;
        deployments.insert(name);
        Ok(())
    }

    /// Deploy everything listed in the configuration, stopping at the first
    /// rejected entry.
    pub fn deploy_configured(&self) -> Result<()> {
        for spec in &self.config.deployments {
            self.deploy(spec.clone())?;
        }
        Ok(())
    }

    /// Remove a deployment. Phases are undone from last to first before the
    /// unit itself is discarded.
    pub fn undeploy(&self, name: &str) -> Result<()> {
        if !self.registry().remove(name) {
            return Err(DeployerError::NotDeployed(name.to_string()));
        }
        info!(deployment = %name, "Undeploying");
        self.container.remove(&root_unit_service_name(name))?;
        Ok(())
    }

    /// Stop the deployment completely and start it again with a new unit.
    pub fn redeploy(&self, name: &str) -> Result<()> {
        if !self.registry().contains(name) {
            return Err(DeployerError::NotDeployed(name.to_string()));
        }
        info!(deployment = %name, "Redeploying");
        self.container.restart(&root_unit_service_name(name))?;
        Ok(())
    }

    pub fn status(&self, name: &str) -> DeploymentStatus {
        deployment_status(&self.container, name)
    }

    /// Names of all deployments, sorted.
    pub fn deployments(&self) -> Vec<String> {
        self.registry().iter().cloned().collect()
    }

    /// The live unit of deployment `name`, if it is running.
    pub fn unit(&self, name: &str) -> Option<DeploymentUnit> {
        self.container
            .value(&root_unit_service_name(name))
            .and_then(|value| value.downcast::<DeploymentUnit>().ok())
            .map(|unit| (*unit).clone())
    }

    /// Wait until no phase is running, bounded by the configured timeout.
    pub async fn await_stability(&self) -> Result<()> {
        let timeout = self.config.stability_timeout();
        tokio::time::timeout(timeout, self.container.await_stability())
            .await
            .map_err(|_| {
                warn!(timeout_ms = self.config.stability_timeout_ms, "Deployments did not settle");
                DeployerError::Timeout {
                    timeout_ms: self.config.stability_timeout_ms,
                }
            })
    }

    /// Undeploy everything and stop the container.
    pub async fn shutdown(&self) {
        info!(deployments = self.registry().len(), "Shutting down deployer");
        self.registry().clear();
        self.container.shutdown().await;
    }
}

impl std::fmt::Debug for Deployer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deployer")
            .field("deployments", &*self.registry())
            .field("container", &self.container)
            .finish()
    }
}
