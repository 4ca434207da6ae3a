//! Processor chain registry.
//!
//! Subsystems register their processors once, before any unit is deployed.
//! [`DeployerChainsBuilder::build`] freezes the registrations into one sorted
//! chain per phase; the result is published to phase services through the
//! container as the [`chains_service_name`] service.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use container::{Service, ServiceValue, StartContext, StartError};
use deploy_core::{Phase, ServiceName};
use tracing::debug;

use crate::processor::DeploymentUnitProcessor;

/// Name of the service publishing the frozen [`DeployerChains`].
pub fn chains_service_name() -> ServiceName {
    ServiceName::of(["deployment", "chains"])
}

/// A processor together with its position and owner.
#[derive(Clone)]
pub struct RegisteredProcessor {
    priority: i32,
    processor: Arc<dyn DeploymentUnitProcessor>,
    subsystem: Option<String>,
}

impl RegisteredProcessor {
    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn processor(&self) -> &Arc<dyn DeploymentUnitProcessor> {
        &self.processor
    }

    pub fn processor_name(&self) -> &'static str {
        self.processor.name()
    }

    /// Owning subsystem; `None` for processors that always run.
    pub fn subsystem(&self) -> Option<&str> {
        self.subsystem.as_deref()
    }
}

impl fmt::Debug for RegisteredProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredProcessor")
            .field("priority", &self.priority)
            .field("processor", &self.processor_name())
            .field("subsystem", &self.subsystem)
            .finish()
    }
}

#[derive(Default)]
pub struct DeployerChainsBuilder {
    registrations: BTreeMap<Phase, Vec<RegisteredProcessor>>,
}

impl DeployerChainsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `processor` for `phase`, owned by `subsystem`.
    pub fn add<P: DeploymentUnitProcessor>(
        &mut self,
        subsystem: &str,
        phase: Phase,
        priority: i32,
        processor: P,
    ) -> &mut Self {
        self.add_shared(Some(subsystem), phase, priority, Arc::new(processor))
    }

    /// Register a processor that no subsystem owns; it can never be excluded.
    pub fn add_core<P: DeploymentUnitProcessor>(
        &mut self,
        phase: Phase,
        priority: i32,
        processor: P,
    ) -> &mut Self {
        self.add_shared(None, phase, priority, Arc::new(processor))
    }

    pub fn add_shared(
        &mut self,
        subsystem: Option<&str>,
        phase: Phase,
        priority: i32,
        processor: Arc<dyn DeploymentUnitProcessor>,
    ) -> &mut Self {
        debug!(
            phase = %phase,
            priority,
            processor = processor.name(),
            subsystem = subsystem.unwrap_or("-"),
            "Registering processor"
        );
        self.registrations
            .entry(phase)
            .or_default()
            .push(RegisteredProcessor {
                priority,
                processor,
                subsystem: subsystem.map(str::to_string),
            });
        self
    }

    /// Sort each phase by priority, then processor name. Registration order
    /// decides between processors that agree on both.
    pub fn build(self) -> DeployerChains {
        let mut chains = self.registrations;
        for chain in chains.values_mut() {
            chain.sort_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| a.processor_name().cmp(b.processor_name()))
            });
        }
        DeployerChains { chains }
    }
}

/// Immutable phase -> processors mapping.
#[derive(Debug, Clone, Default)]
pub struct DeployerChains {
    chains: BTreeMap<Phase, Vec<RegisteredProcessor>>,
}

impl DeployerChains {
    pub fn builder() -> DeployerChainsBuilder {
        DeployerChainsBuilder::new()
    }

    /// The ordered chain for `phase`; empty when nothing was registered.
    pub fn chain(&self, phase: Phase) -> &[RegisteredProcessor] {
        self.chains.get(&phase).map(Vec::as_slice).unwrap_or_default()
    }

    /// Every subsystem owning at least one processor.
    pub fn subsystems(&self) -> BTreeSet<&str> {
        self.chains
            .values()
            .flatten()
            .filter_map(RegisteredProcessor::subsystem)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.chains.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Publishes the chains to phase services.
pub(crate) struct ChainsService {
    chains: Arc<DeployerChains>,
}

impl ChainsService {
    pub(crate) fn new(chains: DeployerChains) -> Self {
        Self {
            chains: Arc::new(chains),
        }
    }
}

#[async_trait]
impl Service for ChainsService {
    async fn start(&self, _ctx: StartContext) -> Result<(), StartError> {
        debug!(processors = self.chains.len(), "Processor chains published");
        Ok(())
    }

    fn value(&self) -> Option<ServiceValue> {
        Some(self.chains.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{DeploymentPhaseContext, DeploymentUnitProcessingError};

    struct Labeled(&'static str);

    impl DeploymentUnitProcessor for Labeled {
        fn deploy(
            &self,
            _ctx: &DeploymentPhaseContext,
        ) -> Result<(), DeploymentUnitProcessingError> {
            Ok(())
        }

        fn name(&self) -> &'static str {
            self.0
        }
    }

    fn names(chains: &DeployerChains, phase: Phase) -> Vec<&'static str> {
        chains
            .chain(phase)
            .iter()
            .map(RegisteredProcessor::processor_name)
            .collect()
    }

    #[test]
    fn test_chain_sorted_by_priority() {
        let mut builder = DeployerChains::builder();
        builder
            .add("web", Phase::Parse, 300, Labeled("late"))
            .add("web", Phase::Parse, 100, Labeled("early"))
            .add_core(Phase::Parse, 200, Labeled("middle"));
        let chains = builder.build();

        assert_eq!(names(&chains, Phase::Parse), vec!["early", "middle", "late"]);
        assert!(chains.chain(Phase::Install).is_empty());
        assert_eq!(chains.len(), 3);
    }

    #[test]
    fn test_equal_priority_ordered_by_name() {
        let build = |order: &[&'static str]| {
            let mut builder = DeployerChains::builder();
            for name in order {
                builder.add("web", Phase::Structure, 10, Labeled(*name));
            }
            builder.build()
        };

        let forward = build(&["zeta", "alpha", "mid"]);
        let backward = build(&["mid", "alpha", "zeta"]);
        assert_eq!(names(&forward, Phase::Structure), vec!["alpha", "mid", "zeta"]);
        assert_eq!(
            names(&forward, Phase::Structure),
            names(&backward, Phase::Structure)
        );
    }

    #[test]
    fn test_subsystems() {
        let mut builder = DeployerChains::builder();
        builder
            .add("web", Phase::Parse, 1, Labeled("a"))
            .add("ejb", Phase::Install, 1, Labeled("b"))
            .add_core(Phase::Install, 2, Labeled("c"));
        let chains = builder.build();

        let subsystems: Vec<_> = chains.subsystems().into_iter().collect();
        assert_eq!(subsystems, vec!["ejb", "web"]);
        assert_eq!(
            chains.chain(Phase::Install)[0].subsystem(),
            Some("ejb")
        );
    }
}
