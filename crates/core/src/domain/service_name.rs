use std::fmt;
use std::sync::Arc;

/// Hierarchical name of a scheduled service.
///
/// Segments are compared individually, so deployment names that themselves
/// contain dots (`app.war`) never collide with nested names. `Display` quotes
/// such segments: `deployment.unit."app.war".STRUCTURE`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceName {
    segments: Arc<Vec<String>>,
}

impl ServiceName {
    pub fn of<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: Arc::new(segments.into_iter().map(Into::into).collect()),
        }
    }

    /// A new name with `segment` appended.
    pub fn append(&self, segment: impl Into<String>) -> Self {
        let mut segments = Vec::with_capacity(self.segments.len() + 1);
        segments.extend(self.segments.iter().cloned());
        segments.push(segment.into());
        Self {
            segments: Arc::new(segments),
        }
    }

    pub fn parent(&self) -> Option<Self> {
        match self.segments.len() {
            0 | 1 => None,
            n => Some(Self::of(self.segments[..n - 1].iter().cloned())),
        }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn simple_name(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or_default()
    }

    /// True if `other` is nested strictly below this name.
    pub fn is_parent_of(&self, other: &ServiceName) -> bool {
        other.segments.len() > self.segments.len() && other.segments.starts_with(&self.segments)
    }

    /// True if `other` is this name or nested below it.
    pub fn contains(&self, other: &ServiceName) -> bool {
        self == other || self.is_parent_of(other)
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            if segment.contains('.') {
                write!(f, "\"{}\"", segment)?;
            } else {
                f.write_str(segment)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServiceName({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_parent() {
        let base = ServiceName::of(["deployment", "unit"]);
        let unit = base.append("app.war");

        assert_eq!(unit.segments().len(), 3);
        assert_eq!(unit.simple_name(), "app.war");
        assert_eq!(unit.parent(), Some(base.clone()));
        assert!(base.is_parent_of(&unit));
        assert!(!unit.is_parent_of(&base));
        assert!(!unit.is_parent_of(&unit));
        assert!(unit.contains(&unit));
    }

    #[test]
    fn test_display_quotes_dotted_segments() {
        let name = ServiceName::of(["deployment", "unit", "app.war", "STRUCTURE"]);
        assert_eq!(name.to_string(), "deployment.unit.\"app.war\".STRUCTURE");
    }

    #[test]
    fn test_dotted_segments_do_not_collide() {
        let dotted = ServiceName::of(["a.b"]);
        let nested = ServiceName::of(["a", "b"]);
        assert_ne!(dotted, nested);
        assert!(!ServiceName::of(["a"]).is_parent_of(&dotted));
    }

    #[test]
    fn test_root_has_no_parent() {
        assert_eq!(ServiceName::of(["deployment"]).parent(), None);
    }
}
