use std::fmt;

/// Controller mode of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Start whenever dependencies allow.
    #[default]
    Active,
    /// Stay down; stop if currently up.
    Never,
}

/// Observable state of an installed service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Not running; waiting for mode, dependencies or parent.
    Down,
    /// The start callback is executing.
    Starting,
    Up,
    /// The start callback returned an error. Dependents stay down until the
    /// service is cycled through [`Mode::Never`] or removed.
    Failed,
    /// The stop callback is executing.
    Stopping,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Down => "down",
            Self::Starting => "starting",
            Self::Up => "up",
            Self::Failed => "failed",
            Self::Stopping => "stopping",
        }
    }

    /// True while a callback is running.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Starting | Self::Stopping)
    }

    /// True when neither the service nor its callbacks hold resources.
    pub fn is_at_rest_down(&self) -> bool {
        matches!(self, Self::Down | Self::Failed)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
