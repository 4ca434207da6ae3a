use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// A stage of the deployment pipeline.
///
/// The declaration order is the execution order; every deployment unit passes
/// through each phase exactly once per lifecycle.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    /// Content layout is determined and sub-deployments are discovered.
    #[default]
    Structure,
    /// Descriptors and metadata are read.
    Parse,
    /// Components are registered with their subsystems.
    Register,
    /// Inter-deployment and module dependencies are resolved.
    Dependencies,
    ConfigureModule,
    FirstModuleUse,
    PostModule,
    /// Runtime services are installed.
    Install,
    Cleanup,
}

impl Phase {
    /// Every phase, in execution order.
    pub const ALL: [Phase; 9] = [
        Phase::Structure,
        Phase::Parse,
        Phase::Register,
        Phase::Dependencies,
        Phase::ConfigureModule,
        Phase::FirstModuleUse,
        Phase::PostModule,
        Phase::Install,
        Phase::Cleanup,
    ];

    pub const fn first() -> Phase {
        Phase::Structure
    }

    pub const fn last() -> Phase {
        Phase::Cleanup
    }

    fn index(self) -> usize {
        self as usize
    }

    /// The phase that follows this one, or `None` for the terminal phase.
    pub fn next(self) -> Option<Phase> {
        Self::ALL.get(self.index() + 1).copied()
    }

    pub fn previous(self) -> Option<Phase> {
        self.index().checked_sub(1).map(|i| Self::ALL[i])
    }

    pub fn is_last(self) -> bool {
        self == Self::last()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Structure => "STRUCTURE",
            Self::Parse => "PARSE",
            Self::Register => "REGISTER",
            Self::Dependencies => "DEPENDENCIES",
            Self::ConfigureModule => "CONFIGURE_MODULE",
            Self::FirstModuleUse => "FIRST_MODULE_USE",
            Self::PostModule => "POST_MODULE",
            Self::Install => "INSTALL",
            Self::Cleanup => "CLEANUP",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|phase| phase.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| CoreError::InvalidPhase(s.to_string()))
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order_is_total() {
        for pair in Phase::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
            assert_eq!(pair[0].next(), Some(pair[1]));
            assert_eq!(pair[1].previous(), Some(pair[0]));
        }
    }

    #[test]
    fn test_first_and_last() {
        assert_eq!(Phase::first(), Phase::Structure);
        assert_eq!(Phase::first().previous(), None);
        assert!(Phase::last().is_last());
        assert_eq!(Phase::last().next(), None);
        assert!(!Phase::Install.is_last());
    }

    #[test]
    fn test_phase_parsing() {
        assert_eq!(Phase::parse("PARSE"), Ok(Phase::Parse));
        assert_eq!(Phase::parse("first_module_use"), Ok(Phase::FirstModuleUse));
        assert_eq!(
            Phase::parse("DEPLOY"),
            Err(CoreError::InvalidPhase("DEPLOY".to_string()))
        );
    }

    #[test]
    fn test_phase_serialization() {
        let json = serde_json::to_string(&Phase::ConfigureModule).unwrap();
        assert_eq!(json, "\"CONFIGURE_MODULE\"");
        let phase: Phase = serde_json::from_str("\"POST_MODULE\"").unwrap();
        assert_eq!(phase, Phase::PostModule);
    }

    #[test]
    fn test_display_matches_as_str() {
        for phase in Phase::ALL {
            assert_eq!(phase.to_string(), phase.as_str());
        }
    }
}
