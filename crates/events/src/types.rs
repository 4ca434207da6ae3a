//! Event types for deployment lifecycle notifications

use chrono::{DateTime, Utc};
use deploy_core::{DeploymentUnit, Phase};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope wrapping all events with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event ID
    pub id: Uuid,
    /// Position in the publishing bus's stream; 0 until published
    pub sequence: u64,
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
    /// The actual event
    pub event: Event,
}

impl EventEnvelope {
    /// Create a new event envelope with auto-generated ID and timestamp
    pub fn new(event: Event) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence: 0,
            timestamp: Utc::now(),
            event,
        }
    }
}

/// Identifies the unit an event refers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnitRef {
    /// Simple name of the unit
    pub name: String,
    /// Name of the enclosing top-level deployment, for sub-deployments
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

impl UnitRef {
    pub fn root(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
        }
    }

    pub fn child(parent: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: Some(parent.into()),
        }
    }

    /// Name of the top-level deployment this unit belongs to.
    pub fn deployment(&self) -> &str {
        self.parent.as_deref().unwrap_or(&self.name)
    }
}

impl From<&DeploymentUnit> for UnitRef {
    fn from(unit: &DeploymentUnit) -> Self {
        Self {
            name: unit.name().to_string(),
            parent: unit.parent_name().map(str::to_string),
        }
    }
}

/// All possible deployment events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    // Deployment events
    /// A unit's lifecycle service started and its first phase was installed
    #[serde(rename = "deployment.started")]
    DeploymentStarted { unit: UnitRef },

    /// A top-level deployment and all of its sub-deployments finished every phase
    #[serde(rename = "deployment.up")]
    DeploymentUp { unit: UnitRef },

    /// A unit's lifecycle service stopped and its attachments were purged
    #[serde(rename = "deployment.stopped")]
    DeploymentStopped { unit: UnitRef },

    /// A completed phase was started again; the deployment is redeployed
    #[serde(rename = "deployment.restart_detected")]
    RestartDetected {
        unit: UnitRef,
        phase: Phase,
        /// Name of the top-level deployment being redeployed
        redeploying: String,
    },

    // Phase events
    /// The phase chain began executing for a unit
    #[serde(rename = "phase.started")]
    PhaseStarted { unit: UnitRef, phase: Phase },

    /// The phase chain ran to completion for a unit
    #[serde(rename = "phase.completed")]
    PhaseCompleted { unit: UnitRef, phase: Phase },

    /// The unit and every sub-deployment of it completed the phase
    #[serde(rename = "phase.settled")]
    PhaseSettled { unit: UnitRef, phase: Phase },

    /// The phase failed and everything it applied was undone. `processor`
    /// is absent when the chain ran but the next phase could not be wired.
    #[serde(rename = "phase.failed")]
    PhaseFailed {
        unit: UnitRef,
        phase: Phase,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        processor: Option<String>,
        reason: String,
    },

    /// The phase's processors were undone during stop
    #[serde(rename = "phase.undone")]
    PhaseUndone { unit: UnitRef, phase: Phase },

    // Diagnostics
    /// Non-fatal validation finding reported during the terminal phase
    #[serde(rename = "validation.warning")]
    ValidationWarning { unit: UnitRef, message: String },
}

impl Event {
    /// Get the unit this event refers to
    pub fn unit(&self) -> &UnitRef {
        match self {
            Event::DeploymentStarted { unit }
            | Event::DeploymentUp { unit }
            | Event::DeploymentStopped { unit }
            | Event::RestartDetected { unit, .. }
            | Event::PhaseStarted { unit, .. }
            | Event::PhaseCompleted { unit, .. }
            | Event::PhaseSettled { unit, .. }
            | Event::PhaseFailed { unit, .. }
            | Event::PhaseUndone { unit, .. }
            | Event::ValidationWarning { unit, .. } => unit,
        }
    }

    /// Get the phase this event refers to, if any
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Event::RestartDetected { phase, .. }
            | Event::PhaseStarted { phase, .. }
            | Event::PhaseCompleted { phase, .. }
            | Event::PhaseSettled { phase, .. }
            | Event::PhaseFailed { phase, .. }
            | Event::PhaseUndone { phase, .. } => Some(*phase),
            Event::DeploymentStarted { .. }
            | Event::DeploymentUp { .. }
            | Event::DeploymentStopped { .. }
            | Event::ValidationWarning { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_envelope_creation() {
        let envelope = EventEnvelope::new(Event::DeploymentStarted {
            unit: UnitRef::root("app.war"),
        });

        assert!(!envelope.id.is_nil());
        assert_eq!(envelope.sequence, 0);
        assert!(envelope.timestamp <= Utc::now());
    }

    #[test]
    fn test_event_serialization() {
        let event = Event::PhaseFailed {
            unit: UnitRef::child("ear1.ear", "war1.war"),
            phase: Phase::Parse,
            processor: Some("DescriptorProcessor".to_string()),
            reason: "malformed descriptor".to_string(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("phase.failed"));
        assert!(json.contains("\"PARSE\""));
        assert!(json.contains("ear1.ear"));
    }

    #[test]
    fn test_event_deserialization() {
        let json = r#"{"type":"phase.settled","unit":{"name":"app.war"},"phase":"REGISTER"}"#;
        let event: Event = serde_json::from_str(json).unwrap();

        match event {
            Event::PhaseSettled { unit, phase } => {
                assert_eq!(unit, UnitRef::root("app.war"));
                assert_eq!(phase, Phase::Register);
            }
            _ => panic!("Wrong event type"),
        }
    }

    #[test]
    fn test_event_accessors() {
        let event = Event::PhaseCompleted {
            unit: UnitRef::root("app.war"),
            phase: Phase::Install,
        };
        assert_eq!(event.unit().name, "app.war");
        assert_eq!(event.phase(), Some(Phase::Install));

        let event = Event::DeploymentUp {
            unit: UnitRef::root("app.war"),
        };
        assert_eq!(event.phase(), None);
    }

    #[test]
    fn test_unit_ref_from_unit() {
        let parent = DeploymentUnit::new_root("ear1.ear");
        let child = DeploymentUnit::new_child(&parent, "war1.war");

        let unit = UnitRef::from(&child);
        assert_eq!(unit, UnitRef::child("ear1.ear", "war1.war"));
        assert_eq!(unit.deployment(), "ear1.ear");
        assert_eq!(UnitRef::from(&parent).deployment(), "ear1.ear");
    }
}
